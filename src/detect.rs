//! Live-port auto-detection.
//!
//! The sensor pairs over Bluetooth SPP, which typically exposes several
//! virtual COM ports of which only one carries data. Every plausible candidate
//! is opened at once, traffic is counted for a fixed calibration window, and
//! the busiest port wins.

use crate::transport::{Endpoint, PortInfo, PortOpener};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_BAUD_RATE: u32 = 115_200;
pub const DEFAULT_CALIBRATION_WINDOW: Duration = Duration::from_secs(2);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

const CALIBRATION_READ_CHUNK: usize = 4096;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("no candidate serial ports found")]
    NoCandidates,
    #[error("none of the {0} candidate ports could be opened")]
    NoneOpened(usize),
    #[error("no data observed on any candidate port")]
    NoTraffic { tallies: Vec<PortTally> },
    #[error("detection cancelled")]
    Cancelled,
}

/// Description-based candidate filter.
///
/// A port qualifies when its description contains any include keyword and
/// none of the exclude keywords, compared case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateFilter {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl Default for CandidateFilter {
    fn default() -> Self {
        Self {
            include: vec![
                String::from("bluetooth"),
                String::from("spp"),
                String::from("serial"),
            ],
            exclude: vec![String::from("usb")],
        }
    }
}

impl CandidateFilter {
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Self {
        Self { include, exclude }
    }

    pub fn matches(&self, description: &str) -> bool {
        let desc = description.to_lowercase();
        let included = self
            .include
            .iter()
            .any(|keyword| desc.contains(&keyword.to_lowercase()));
        let excluded = self
            .exclude
            .iter()
            .any(|keyword| desc.contains(&keyword.to_lowercase()));
        included && !excluded
    }

    /// Keep qualifying ports, preserving enumeration order.
    pub fn apply(&self, ports: &[PortInfo]) -> Vec<PortInfo> {
        ports
            .iter()
            .filter(|port| self.matches(&port.description))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectorConfig {
    pub baud_rate: u32,
    pub calibration_window: Duration,
    pub poll_interval: Duration,
    pub read_timeout: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            calibration_window: DEFAULT_CALIBRATION_WINDOW,
            poll_interval: DEFAULT_POLL_INTERVAL,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortTally {
    pub port: String,
    pub bytes: u64,
}

/// Result of a successful detection. The endpoint is open and now owned by
/// the caller.
#[derive(Debug)]
pub struct Detection<E> {
    pub endpoint: E,
    pub tallies: Vec<PortTally>,
}

/// Index of the largest tally; ties go to the earliest entry. `None` when
/// every tally is zero or there are none.
pub fn select_winner(tallies: &[u64]) -> Option<usize> {
    let mut best: Option<(usize, u64)> = None;
    for (index, &count) in tallies.iter().enumerate() {
        match best {
            Some((_, best_count)) if count <= best_count => {}
            _ => best = Some((index, count)),
        }
    }
    best.filter(|&(_, count)| count > 0).map(|(index, _)| index)
}

pub struct PortDetector<O: PortOpener> {
    opener: O,
    config: DetectorConfig,
    shutdown: Option<Arc<AtomicBool>>,
}

impl<O: PortOpener> PortDetector<O> {
    pub fn new(opener: O, config: DetectorConfig) -> Self {
        Self {
            opener,
            config,
            shutdown: None,
        }
    }

    /// Abort calibration early once `flag` is set.
    pub fn with_shutdown(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = Some(flag);
        self
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    fn cancelled(&self) -> bool {
        self.shutdown
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Open an explicitly named port, bypassing calibration.
    pub fn open_direct(&self, port: &str) -> Result<O::Endpoint, crate::transport::TransportError> {
        info!("Opening {} at {} baud", port, self.config.baud_rate);
        self.opener
            .open(port, self.config.baud_rate, self.config.read_timeout)
    }

    /// Pick the candidate carrying live data.
    ///
    /// Every loser is closed before returning. On failure every opened
    /// candidate is closed.
    pub fn detect(&self, candidates: &[PortInfo]) -> Result<Detection<O::Endpoint>, DetectError> {
        if candidates.is_empty() {
            warn!("No Syclone-like serial ports found");
            return Err(DetectError::NoCandidates);
        }

        info!(
            "Candidate ports: {:?}",
            candidates.iter().map(|c| c.name.as_str()).collect::<Vec<_>>()
        );

        let mut opened: Vec<O::Endpoint> = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match self.opener.open(
                &candidate.name,
                self.config.baud_rate,
                self.config.read_timeout,
            ) {
                Ok(endpoint) => {
                    info!("Opened {}", candidate.name);
                    opened.push(endpoint);
                }
                Err(e) => warn!("Could not open {}: {}", candidate.name, e),
            }
        }

        if opened.is_empty() {
            warn!("Could not open any candidate ports");
            return Err(DetectError::NoneOpened(candidates.len()));
        }

        info!(
            "Trigger one Syclone measurement in the next {:.1} seconds...",
            self.config.calibration_window.as_secs_f64()
        );

        let counts = match self.calibrate(&mut opened) {
            Some(counts) => counts,
            None => {
                close_all(&mut opened);
                return Err(DetectError::Cancelled);
            }
        };

        let tallies: Vec<PortTally> = opened
            .iter()
            .zip(&counts)
            .map(|(endpoint, &bytes)| PortTally {
                port: endpoint.id().to_string(),
                bytes,
            })
            .collect();
        for tally in &tallies {
            debug!("Calibration tally {}: {} bytes", tally.port, tally.bytes);
        }

        let Some(winner) = select_winner(&counts) else {
            warn!("No data observed on any candidate port");
            close_all(&mut opened);
            return Err(DetectError::NoTraffic { tallies });
        };

        let mut endpoint = None;
        for (index, mut candidate) in opened.into_iter().enumerate() {
            if index == winner {
                endpoint = Some(candidate);
            } else {
                candidate.close();
                info!("Closed unused port {}", candidate.id());
            }
        }

        match endpoint {
            Some(endpoint) => {
                info!(
                    "Detected Syclone port: {} ({} bytes)",
                    endpoint.id(),
                    counts[winner]
                );
                Ok(Detection { endpoint, tallies })
            }
            None => Err(DetectError::NoTraffic { tallies }),
        }
    }

    /// Count bytes per endpoint until the calibration deadline.
    /// Returns `None` if cancelled.
    fn calibrate(&self, endpoints: &mut [O::Endpoint]) -> Option<Vec<u64>> {
        let mut counts = vec![0u64; endpoints.len()];
        let mut buf = vec![0u8; CALIBRATION_READ_CHUNK];
        let deadline = Instant::now() + self.config.calibration_window;

        while Instant::now() < deadline {
            if self.cancelled() {
                return None;
            }

            for (endpoint, count) in endpoints.iter_mut().zip(counts.iter_mut()) {
                let waiting = match endpoint.bytes_available() {
                    Ok(n) => n,
                    Err(e) => {
                        debug!("Poll failed on {}: {}", endpoint.id(), e);
                        continue;
                    }
                };
                if waiting == 0 {
                    continue;
                }

                let len = waiting.min(buf.len());
                match endpoint.read_up_to(&mut buf[..len], self.config.read_timeout) {
                    Ok(n) => *count += n as u64,
                    Err(e) => debug!("Read failed on {}: {}", endpoint.id(), e),
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            thread::sleep(self.config.poll_interval.min(remaining));
        }

        Some(counts)
    }
}

fn close_all<E: Endpoint>(endpoints: &mut [E]) {
    for endpoint in endpoints.iter_mut() {
        endpoint.close();
    }
}
