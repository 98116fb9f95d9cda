//! Session context tying the two execution contexts together.
//!
//! - **Acquisition** owns the endpoint, reassembles and decodes frames, and is
//!   the only producer into the sample queue.
//! - **Fill** owns the [`FillEngine`], applies host change notifications and
//!   drains the sample queue, so grid state is only ever touched from one
//!   thread.
//!
//! Both observe the same shutdown flag and exit within one polling interval
//! of it being set.

use crate::command::CommandError;
use crate::config::ConfigError;
use crate::detect::DetectError;
use crate::engine::FillEngine;
use crate::packet::{Sample, FRAME_LEN};
use crate::queue::{SampleConsumer, SampleProducer};
use crate::reassembly::FrameReassembler;
use crate::sink::{CellSink, ChangeHandler, ChangeNotification, CompletionNotifier};
use crate::transport::{Endpoint, TransportError};
use crossbeam_channel::{select, Receiver};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("detection failed: {0}")]
    Detect(#[from] DetectError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("command parser error: {0}")]
    Command(#[from] CommandError),
    #[error("could not start {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Default)]
struct AcquisitionCounters {
    bytes_read: AtomicU64,
    frames: AtomicU64,
    samples: AtomicU64,
    invalid_frames: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionStats {
    pub bytes_read: u64,
    pub frames: u64,
    pub samples: u64,
    pub invalid_frames: u64,
}

/// Shared state of one bridge session. Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct Session {
    shutdown: Arc<AtomicBool>,
    first_sample: Arc<AtomicBool>,
    counters: Arc<AcquisitionCounters>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn request_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            info!("Shutdown requested");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn has_first_sample(&self) -> bool {
        self.first_sample.load(Ordering::SeqCst)
    }

    pub fn acquisition_stats(&self) -> AcquisitionStats {
        AcquisitionStats {
            bytes_read: self.counters.bytes_read.load(Ordering::Relaxed),
            frames: self.counters.frames.load(Ordering::Relaxed),
            samples: self.counters.samples.load(Ordering::Relaxed),
            invalid_frames: self.counters.invalid_frames.load(Ordering::Relaxed),
        }
    }

    /// Block until the first sample is decoded. Returns `false` if shutdown
    /// was requested first.
    pub fn wait_for_first_sample(&self, poll_interval: Duration) -> bool {
        loop {
            if self.has_first_sample() {
                return true;
            }
            if self.is_shutdown() {
                return false;
            }
            thread::sleep(poll_interval);
        }
    }

    /// Acquisition loop. Runs on the calling thread until shutdown, until the
    /// consumer goes away, or until the endpoint fails.
    ///
    /// Every decoded sample is shown to `observer` before it is queued.
    pub fn acquire<E, F>(
        &self,
        endpoint: &mut E,
        producer: &SampleProducer,
        read_timeout: Duration,
        mut observer: F,
    ) -> Result<(), TransportError>
    where
        E: Endpoint + ?Sized,
        F: FnMut(&Sample),
    {
        info!("Listening on {}", endpoint.id());
        let mut reassembler = FrameReassembler::new();
        let mut buf = [0u8; FRAME_LEN];

        while !self.is_shutdown() {
            let n = endpoint.read_up_to(&mut buf, read_timeout)?;
            if n == 0 {
                continue;
            }
            self.counters
                .bytes_read
                .fetch_add(n as u64, Ordering::Relaxed);

            for frame in reassembler.push(&buf[..n]) {
                self.counters.frames.fetch_add(1, Ordering::Relaxed);
                match frame.decode() {
                    Ok(sample) => {
                        self.counters.samples.fetch_add(1, Ordering::Relaxed);
                        self.first_sample.store(true, Ordering::SeqCst);
                        observer(&sample);
                        if !producer.push(sample) {
                            info!("Sample consumer gone; stopping acquisition");
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        self.counters
                            .invalid_frames
                            .fetch_add(1, Ordering::Relaxed);
                        debug!("Discarding frame: {}", e);
                    }
                }
            }
        }

        info!("Acquisition stopped");
        Ok(())
    }

    /// Run [`Session::acquire`] on a dedicated thread that owns `endpoint`.
    ///
    /// The endpoint is closed when the thread exits. A transport failure
    /// ends the session, since nothing useful can happen without data.
    pub fn spawn_acquisition<E, F>(
        &self,
        mut endpoint: E,
        producer: SampleProducer,
        read_timeout: Duration,
        observer: F,
    ) -> Result<JoinHandle<()>, SessionError>
    where
        E: Endpoint + 'static,
        F: FnMut(&Sample) + Send + 'static,
    {
        let session = self.clone();
        thread::Builder::new()
            .name(String::from("syclone-acquisition"))
            .spawn(move || {
                if let Err(e) = session.acquire(&mut endpoint, &producer, read_timeout, observer) {
                    error!("Sensor stream failed: {}", e);
                    session.request_shutdown();
                }
                endpoint.close();
            })
            .map_err(|source| SessionError::Spawn {
                name: "acquisition",
                source,
            })
    }

    /// Fill loop. Applies host changes and queued samples on the calling
    /// thread until shutdown.
    ///
    /// A closed change channel means the host went away; a closed sample
    /// queue means acquisition ended. Either one ends the session.
    pub fn run_fill<S, N>(
        &self,
        engine: &mut FillEngine<S, N>,
        consumer: &SampleConsumer,
        changes: &Receiver<ChangeNotification>,
        poll_interval: Duration,
    ) where
        S: CellSink,
        N: CompletionNotifier,
    {
        info!("Fill loop started");
        while !self.is_shutdown() {
            select! {
                recv(changes) -> msg => match msg {
                    Ok(change) => engine.on_change(&change),
                    Err(_) => {
                        info!("Host closed the change stream");
                        self.request_shutdown();
                    }
                },
                recv(consumer.receiver()) -> msg => match msg {
                    Ok(sample) => {
                        engine.on_sample(&sample);
                    }
                    Err(_) => {
                        info!("Sample stream ended");
                        self.request_shutdown();
                    }
                },
                default(poll_interval) => {}
            }
        }
        info!("Fill loop stopped");
    }
}
