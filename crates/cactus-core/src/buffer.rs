//! Fixed-capacity output buffers handed to the engine.
//!
//! Each engine call writes into a buffer allocated for that call alone. The
//! buffer is sized by the caller and trusted to be large enough: nothing here
//! checks capacity against the expected output. After the call the buffer is
//! cut down to what the engine reports it used (the first NUL for text, the
//! reported dimension for vectors) and converted into an owned result.

use tracing::debug;

use crate::error::{Error, Result};

/// Byte buffer for text results (completions, transcriptions).
#[derive(Debug)]
pub struct TextBuffer {
    bytes: Vec<u8>,
}

impl TextBuffer {
    /// Allocate a zeroed buffer of `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidArgument(
                "response buffer size must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            bytes: vec![0; capacity],
        })
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Writable view passed to the engine.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Length of the text the engine wrote, up to the first terminator.
    pub fn used_len(&self) -> usize {
        self.bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.bytes.len())
    }

    /// Consume the buffer, keeping only the prefix before the first terminator.
    pub fn into_text(mut self) -> String {
        let used = self.used_len();
        debug!(capacity = self.bytes.len(), used, "truncating text buffer");
        self.bytes.truncate(used);
        match String::from_utf8(self.bytes) {
            Ok(text) => text,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        }
    }
}

/// Single-precision vector buffer for embeddings.
#[derive(Debug)]
pub struct VectorBuffer {
    values: Vec<f32>,
}

impl VectorBuffer {
    /// Allocate a zeroed buffer of `capacity` elements.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidArgument(
                "embedding buffer size must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            values: vec![0.0; capacity],
        })
    }

    pub fn capacity(&self) -> usize {
        self.values.len()
    }

    /// Capacity as the engine sees it.
    pub fn capacity_bytes(&self) -> usize {
        std::mem::size_of_val(self.values.as_slice())
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.values
    }

    /// Keep the first `dimension` elements and widen them to `f64`.
    ///
    /// A reported dimension larger than the capacity keeps the whole buffer.
    pub fn into_embedding(mut self, dimension: usize) -> Vec<f64> {
        debug!(capacity = self.values.len(), dimension, "truncating vector buffer");
        self.values.truncate(dimension);
        self.values.into_iter().map(f64::from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_reply(buffer: &mut TextBuffer, reply: &str) {
        let out = buffer.as_mut_slice();
        out[..reply.len()].copy_from_slice(reply.as_bytes());
        out[reply.len()] = 0;
    }

    #[test]
    fn text_is_cut_at_terminator_for_every_length() {
        for len in 0..64 {
            let reply = "x".repeat(len);
            let mut buffer = TextBuffer::with_capacity(64).unwrap();
            write_reply(&mut buffer, &reply);
            let text = buffer.into_text();
            assert_eq!(text.len(), len);
            assert_eq!(text, reply);
        }
    }

    #[test]
    fn text_stops_at_first_terminator_even_with_trailing_bytes() {
        let mut buffer = TextBuffer::with_capacity(16).unwrap();
        buffer.as_mut_slice()[..11].copy_from_slice(b"hello\0world");
        assert_eq!(buffer.into_text(), "hello");
    }

    #[test]
    fn unterminated_text_uses_whole_buffer() {
        let mut buffer = TextBuffer::with_capacity(4).unwrap();
        buffer.as_mut_slice().copy_from_slice(b"abcd");
        assert_eq!(buffer.used_len(), 4);
        assert_eq!(buffer.into_text(), "abcd");
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let mut buffer = TextBuffer::with_capacity(4).unwrap();
        buffer.as_mut_slice()[..2].copy_from_slice(&[0x61, 0xff]);
        assert_eq!(buffer.into_text(), "a\u{fffd}");
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            TextBuffer::with_capacity(0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            VectorBuffer::with_capacity(0),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn vector_is_truncated_to_reported_dimension() {
        let mut buffer = VectorBuffer::with_capacity(128).unwrap();
        assert_eq!(buffer.capacity_bytes(), 512);
        for (i, v) in buffer.as_mut_slice().iter_mut().enumerate() {
            *v = i as f32 * 0.5;
        }
        let embedding = buffer.into_embedding(32);
        assert_eq!(embedding.len(), 32);
        assert_eq!(embedding[3], 1.5);
    }

    #[test]
    fn vector_never_grows_past_capacity() {
        let buffer = VectorBuffer::with_capacity(8).unwrap();
        assert_eq!(buffer.into_embedding(100).len(), 8);
    }
}
