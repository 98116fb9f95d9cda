//! # Syclone Serial Bridge
//!
//! Streams dose-rate readings from a Syclone radiation sensor into a
//! spreadsheet-like host, under operator control.
//!
//! ## Features
//!
//! - **Port auto-detection**: opens every Bluetooth/SPP-looking serial port and
//!   keeps the one that actually carries traffic
//! - **Frame decoding**: fixed 50-byte frames with BCD timestamps and a
//!   little-endian dose field, converted to nSv/h
//! - **Command-driven capture**: typing `Syclone 5` or `Syclone 3x4` into a
//!   cell reserves a block of cells that fills with the next samples
//! - **Exactly-once completion**: each capture raises one completion signal
//!   when its last cell is written
//!
//! ## Quick Start
//!
//! ```rust
//! use syclone::{CellPos, ChangeNotification, CommandParser, FillEngine, MemorySheet, SilentNotifier};
//! use syclone::packet::{decode, encode_frame, SensorTimestamp};
//!
//! let parser = CommandParser::new("Syclone").unwrap();
//! let mut engine = FillEngine::new(parser, MemorySheet::new(), SilentNotifier);
//!
//! // Operator types a command into R2C1
//! engine.handle_change(&ChangeNotification::new("Sheet1", CellPos::new(2, 1), "Syclone 2"));
//!
//! // Two frames arrive from the sensor
//! let ts = SensorTimestamp { year: 2025, month: 3, day: 14, hour: 9, minute: 26, second: 53 };
//! for raw in [10, 20] {
//!     let sample = decode(encode_frame(raw, &ts).as_bytes()).unwrap();
//!     engine.on_sample(&sample);
//! }
//!
//! assert!(engine.active_grid().unwrap().is_complete());
//! ```
//!
//! ## Architecture
//!
//! - [`packet`] - Frame layout and decoding
//! - [`transport`] - Serial endpoint abstraction over `serialport`
//! - [`detect`] - Calibration-window port detection
//! - [`reassembly`] - Byte stream to fixed-length frames
//! - [`queue`] - Sample hand-off between threads
//! - [`command`] - Capture command grammar
//! - [`grid`] - Grid layout and fill state machine
//! - [`sink`] - Host sheet, change notifications and completion signal
//! - [`engine`] - Applies commands and samples to the active grid
//! - [`session`] - Acquisition and fill contexts, shutdown
//! - [`config`] - TOML configuration

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::new_without_default)]

pub mod packet;
pub mod transport;
pub mod detect;
pub mod reassembly;
pub mod queue;
pub mod command;
pub mod grid;
pub mod sink;
pub mod engine;
pub mod session;
pub mod config;

// Re-export main public types for convenience
pub use command::{AllocationRequest, CommandParser};
pub use config::BridgeConfig;
pub use detect::{CandidateFilter, DetectorConfig, PortDetector};
pub use engine::{FillEngine, FillOutcome};
pub use grid::{Grid, GridAllocator, GridState};
pub use packet::{Frame, Sample, SensorTimestamp};
pub use queue::sample_queue;
pub use reassembly::FrameReassembler;
pub use session::Session;
pub use sink::{CellPos, CellSink, CellValue, ChangeNotification, CompletionNotifier, MemorySheet, SilentNotifier};
