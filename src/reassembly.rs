//! Fixed-length frame reassembly over an arbitrary-chunked byte stream.
//!
//! Frames are cut every [`FRAME_LEN`] bytes from the start of the stream.
//! There is no resynchronisation on the magic bytes: if the stream ever loses
//! a byte, every later frame is misaligned and rejected by the decoder until
//! the caller resets the reassembler.

use crate::packet::{Frame, FRAME_LEN};

#[derive(Debug, Default)]
pub struct FrameReassembler {
    buffer: Vec<u8>,
}

impl FrameReassembler {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(FRAME_LEN * 2),
        }
    }

    /// Append a chunk (possibly empty) and return every frame it completes,
    /// oldest first.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);

        let complete = self.buffer.len() / FRAME_LEN;
        if complete == 0 {
            return Vec::new();
        }

        let mut frames = Vec::with_capacity(complete);
        for window in self.buffer[..complete * FRAME_LEN].chunks_exact(FRAME_LEN) {
            let mut bytes = [0u8; FRAME_LEN];
            bytes.copy_from_slice(window);
            frames.push(Frame::from_bytes(bytes));
        }
        self.buffer.drain(..complete * FRAME_LEN);

        frames
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Drop any partial frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}
