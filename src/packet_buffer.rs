// src/packet_buffer.rs

use crate::error::FrameError;
use byteorder::{BigEndian, ByteOrder};
use log::error;

const LEN_PREFIX: usize = 4;
// Bytes dumped when a frame length is rejected
const HEX_PREVIEW_LEN: usize = 64;

/// Accumulates the in-order stream and cuts it into length-prefixed frames.
/// The 4-byte big-endian length counts itself.
#[derive(Debug)]
pub struct PacketBuffer {
    buffer: Vec<u8>,
    max_frame_len: u32,
}

impl PacketBuffer {
    pub fn new(max_frame_len: u32) -> Self {
        Self {
            buffer: Vec::with_capacity(65536),
            max_frame_len,
        }
    }

    pub fn add(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Next complete frame, prefix included.
    ///
    /// `Ok(None)` means more data is needed. A length outside `4..=max_frame_len`
    /// means the stream is desynchronized: the buffer is dropped and the
    /// error carries the offending length.
    pub fn next(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        if self.buffer.len() < LEN_PREFIX {
            return Ok(None);
        }

        // 1. Sanity check the declared length
        let length = BigEndian::read_u32(&self.buffer);
        if length > self.max_frame_len || (length as usize) < LEN_PREFIX {
            let buffered = self.buffer.len();
            error!(
                "[PacketBuffer] Invalid length {} ({} bytes buffered): {}",
                length,
                buffered,
                hex::encode(&self.buffer[..buffered.min(HEX_PREVIEW_LEN)])
            );
            self.buffer.clear();
            return Err(FrameError::InvalidLength { length, buffered });
        }

        // 2. Wait for TCP segmentation to complete
        let total_len = length as usize;
        if self.buffer.len() < total_len {
            return Ok(None);
        }

        // 3. Extract
        Ok(Some(self.buffer.drain(0..total_len).collect()))
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
