use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub const MAX_FRAME_SIZE_BYTES: usize = 8 * 1024 * 1024;
pub const FRAME_HEADER_SIZE_BYTES: usize = 4;

#[derive(Debug)]
pub enum CodecError {
    PayloadTooLarge { size: usize, limit: usize },
    FrameTooShort { size: usize },
    FrameLengthMismatch { declared: usize, actual_payload: usize },
    ProtocolZeroLength,
    ProtocolLengthTooLarge { length: usize, limit: usize },
    JsonEncode(serde_json::Error),
    JsonDecode(serde_json::Error),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PayloadTooLarge { size, limit } => {
                write!(f, "payload size {size} exceeds limit {limit}")
            }
            Self::FrameTooShort { size } => {
                write!(f, "frame size {size} is smaller than 4-byte header")
            }
            Self::FrameLengthMismatch {
                declared,
                actual_payload,
            } => write!(
                f,
                "frame length mismatch: declared {declared} bytes, actual payload {actual_payload} bytes"
            ),
            Self::ProtocolZeroLength => write!(f, "protocol error: frame length cannot be zero"),
            Self::ProtocolLengthTooLarge { length, limit } => write!(
                f,
                "protocol error: frame length {length} exceeds max {limit}"
            ),
            Self::JsonEncode(source) => write!(f, "json encode error: {source}"),
            Self::JsonDecode(source) => write!(f, "json decode error: {source}"),
        }
    }
}

impl std::error::Error for CodecError {}

#[derive(Clone, Copy, Debug)]
pub struct WireCodec {
    max_frame_size_bytes: usize,
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE_BYTES)
    }
}

impl WireCodec {
    pub fn new(max_frame_size_bytes: usize) -> Self {
        Self {
            max_frame_size_bytes,
        }
    }

    pub fn from_app_config(config: &crate::config::AppConfig) -> Self {
        Self::new(config.wire.max_frame_size_bytes)
    }

    pub fn max_frame_size_bytes(&self) -> usize {
        self.max_frame_size_bytes
    }

    pub fn encode_frame<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let payload = serde_json::to_vec(value).map_err(CodecError::JsonEncode)?;
        if payload.is_empty() {
            return Err(CodecError::ProtocolZeroLength);
        }
        if payload.len() > self.max_frame_size_bytes {
            return Err(CodecError::PayloadTooLarge {
                size: payload.len(),
                limit: self.max_frame_size_bytes,
            });
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE_BYTES + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    pub fn decode_frame<T: DeserializeOwned>(&self, frame: &[u8]) -> Result<T, CodecError> {
        if frame.len() < FRAME_HEADER_SIZE_BYTES {
            return Err(CodecError::FrameTooShort { size: frame.len() });
        }

        let declared = self.declared_length(frame)?;
        let payload = &frame[FRAME_HEADER_SIZE_BYTES..];
        if payload.len() != declared {
            return Err(CodecError::FrameLengthMismatch {
                declared,
                actual_payload: payload.len(),
            });
        }

        self.decode_payload(payload)
    }

    pub fn decode_payload<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(payload).map_err(CodecError::JsonDecode)
    }

    fn declared_length(&self, frame: &[u8]) -> Result<usize, CodecError> {
        let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        if declared == 0 {
            return Err(CodecError::ProtocolZeroLength);
        }
        if declared > self.max_frame_size_bytes {
            return Err(CodecError::ProtocolLengthTooLarge {
                length: declared,
                limit: self.max_frame_size_bytes,
            });
        }
        Ok(declared)
    }
}

// Accumulates bytes from a stream socket and yields complete frame payloads.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pending: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    pub fn buffered_len(&self) -> usize {
        self.pending.len()
    }

    pub fn next_payload(&mut self, codec: &WireCodec) -> Result<Option<Vec<u8>>, CodecError> {
        if self.pending.len() < FRAME_HEADER_SIZE_BYTES {
            return Ok(None);
        }

        let declared = codec.declared_length(&self.pending)?;
        let frame_len = FRAME_HEADER_SIZE_BYTES + declared;
        if self.pending.len() < frame_len {
            return Ok(None);
        }

        let payload = self.pending[FRAME_HEADER_SIZE_BYTES..frame_len].to_vec();
        self.pending.drain(..frame_len);
        Ok(Some(payload))
    }
}
