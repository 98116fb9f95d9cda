//! Ordered hand-off of decoded samples from acquisition to fill.
//!
//! Unbounded FIFO over a crossbeam channel. One producer (the acquisition
//! context) and one consumer (the fill context); a sample is moved, never
//! copied, across the boundary.

use crate::packet::Sample;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

/// Create a connected producer/consumer pair.
pub fn sample_queue() -> (SampleProducer, SampleConsumer) {
    let (tx, rx) = unbounded();
    (SampleProducer { tx }, SampleConsumer { rx })
}

#[derive(Debug, Clone)]
pub struct SampleProducer {
    tx: Sender<Sample>,
}

impl SampleProducer {
    /// Enqueue a sample. Returns `false` once the consumer is gone.
    pub fn push(&self, sample: Sample) -> bool {
        self.tx.send(sample).is_ok()
    }
}

#[derive(Debug)]
pub struct SampleConsumer {
    rx: Receiver<Sample>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pop {
    Empty,
    Disconnected,
}

impl SampleConsumer {
    pub fn try_pop(&self) -> Result<Sample, Pop> {
        self.rx.try_recv().map_err(|e| match e {
            TryRecvError::Empty => Pop::Empty,
            TryRecvError::Disconnected => Pop::Disconnected,
        })
    }

    /// Wait at most `timeout` for the next sample.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<Sample, Pop> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => Pop::Empty,
            RecvTimeoutError::Disconnected => Pop::Disconnected,
        })
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub(crate) fn receiver(&self) -> &Receiver<Sample> {
        &self.rx
    }
}
