//! Canonical encoding for wire messages and the persisted rule log.
//!
//! Uses postcard for byte-stable encoding. Streams are framed with a
//! big-endian `u32` length prefix per record.

use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// Largest frame accepted by [`CanonicalDecoder`]
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Trait for canonical serialization
pub trait CanonicalEncode: Serialize {
    /// Encode to canonical bytes
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be represented by postcard
    fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        postcard::to_allocvec(self).map_err(|_| EncodeError::Unsupported)
    }
}

/// Decode a value from canonical bytes
///
/// # Errors
///
/// Returns error if the bytes are not a valid encoding of `T`
pub fn decode<'de, T: Deserialize<'de>>(data: &'de [u8]) -> Result<T, DecodeError> {
    postcard::from_bytes(data).map_err(|_| DecodeError::InvalidEncoding)
}

/// Encoding errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Value contains something postcard cannot encode
    Unsupported,
    /// Encoded record larger than a frame allows
    FrameTooLarge(usize),
    /// Underlying writer failed
    Io(String),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unsupported => write!(f, "Value not supported by canonical encoding"),
            Self::FrameTooLarge(len) => write!(f, "Frame too large: {} bytes", len),
            Self::Io(msg) => write!(f, "Write failed: {}", msg),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Decoding errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Invalid encoding
    InvalidEncoding,
    /// Stream ended inside a frame
    Truncated,
    /// Frame length prefix exceeds [`MAX_FRAME_LEN`]
    FrameTooLarge(usize),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidEncoding => write!(f, "Invalid canonical encoding"),
            Self::Truncated => write!(f, "Truncated frame"),
            Self::FrameTooLarge(len) => write!(f, "Frame too large: {} bytes", len),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<DecodeError> for crate::CoreError {
    fn from(_: DecodeError) -> Self {
        Self::InvalidEncoding
    }
}

impl From<EncodeError> for crate::CoreError {
    fn from(err: EncodeError) -> Self {
        Self::Internal {
            message: err.to_string(),
        }
    }
}

/// Canonical encoder for streaming
pub struct CanonicalEncoder<W> {
    writer: W,
}

impl<W: Write> CanonicalEncoder<W> {
    /// Create a new encoder
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Encode a value as one length-prefixed frame
    ///
    /// # Errors
    ///
    /// Returns error if encoding or the underlying write fails
    pub fn encode<T: CanonicalEncode>(&mut self, value: &T) -> Result<(), EncodeError> {
        let bytes = value.encode()?;
        self.write_frame(&bytes)
    }

    /// Write pre-encoded bytes as one frame
    ///
    /// # Errors
    ///
    /// Returns error if the frame is too large or the write fails
    pub fn write_frame(&mut self, bytes: &[u8]) -> Result<(), EncodeError> {
        if bytes.len() > MAX_FRAME_LEN {
            return Err(EncodeError::FrameTooLarge(bytes.len()));
        }
        let len = bytes.len() as u32;
        self.writer
            .write_all(&len.to_be_bytes())
            .map_err(|e| EncodeError::Io(e.to_string()))?;
        self.writer
            .write_all(bytes)
            .map_err(|e| EncodeError::Io(e.to_string()))?;
        Ok(())
    }

    /// Flush the writer
    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    /// Consume and return the inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Canonical decoder for streaming
pub struct CanonicalDecoder<R> {
    reader: R,
}

impl<R: Read> CanonicalDecoder<R> {
    /// Create a new decoder
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Read the next raw frame, or `None` at a clean end of stream
    ///
    /// # Errors
    ///
    /// Returns error on a partial length prefix or a truncated body
    pub fn read_frame(&mut self) -> Result<Option<Vec<u8>>, DecodeError> {
        let mut len_bytes = [0u8; 4];
        let mut filled = 0;
        while filled < len_bytes.len() {
            let n = self
                .reader
                .read(&mut len_bytes[filled..])
                .map_err(|_| DecodeError::Truncated)?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }
        if filled < len_bytes.len() {
            return Err(DecodeError::Truncated);
        }

        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_FRAME_LEN {
            return Err(DecodeError::FrameTooLarge(len));
        }
        let mut buffer = vec![0u8; len];
        self.reader
            .read_exact(&mut buffer)
            .map_err(|_| DecodeError::Truncated)?;
        Ok(Some(buffer))
    }

    /// Decode the next value
    ///
    /// # Errors
    ///
    /// Returns error if the frame is malformed
    pub fn decode<T: for<'de> Deserialize<'de>>(&mut self) -> Result<Option<T>, DecodeError> {
        match self.read_frame()? {
            Some(buffer) => decode(&buffer).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Record {
        version: u64,
        label: String,
        steps: Vec<u32>,
    }

    impl CanonicalEncode for Record {}

    #[test]
    fn test_encode_deterministic() {
        let value = Record {
            version: 4,
            label: "core_directive".to_string(),
            steps: vec![1, 2, 3],
        };
        assert_eq!(value.encode().unwrap(), value.encode().unwrap());
    }

    #[test]
    fn test_stream_framing() {
        let mut encoder = CanonicalEncoder::new(Vec::new());
        for version in 0..3 {
            encoder
                .encode(&Record {
                    version,
                    label: format!("v{}", version),
                    steps: vec![],
                })
                .unwrap();
        }
        let bytes = encoder.into_inner();

        let mut decoder = CanonicalDecoder::new(&bytes[..]);
        let mut seen = Vec::new();
        while let Some(record) = decoder.decode::<Record>().unwrap() {
            seen.push(record.version);
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let mut encoder = CanonicalEncoder::new(Vec::new());
        encoder
            .encode(&Record {
                version: 1,
                label: "x".to_string(),
                steps: vec![9; 8],
            })
            .unwrap();
        let mut bytes = encoder.into_inner();
        bytes.truncate(bytes.len() - 2);

        let mut decoder = CanonicalDecoder::new(&bytes[..]);
        assert_eq!(decoder.decode::<Record>(), Err(DecodeError::Truncated));
    }

    #[test]
    fn test_oversized_prefix_rejected() {
        let bytes = u32::MAX.to_be_bytes();
        let mut decoder = CanonicalDecoder::new(&bytes[..]);
        assert!(matches!(
            decoder.read_frame(),
            Err(DecodeError::FrameTooLarge(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_encoding_is_stable(version in any::<u64>(), label in "[a-z_]{0,16}", steps in proptest::collection::vec(any::<u32>(), 0..8)) {
            let record = Record { version, label, steps };
            let first = record.encode().unwrap();
            let second = record.clone().encode().unwrap();
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(decode::<Record>(&first).unwrap(), record);
        }
    }
}
