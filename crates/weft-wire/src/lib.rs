use serde::{Deserialize, Serialize};
use std::fmt;
use weft_types::{CategoryFilter, EventsJson, TraceOptions, WatchSpec};

pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;
pub const PROTOCOL_MAGIC: u32 = 0x57454654;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameCodecError {
    PayloadTooLarge { len: usize, max: usize },
    FrameTooShort { len: usize },
    FrameTooLarge { len: usize, max: usize },
    FrameTruncated { expected: usize, actual: usize },
}

impl fmt::Display for FrameCodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PayloadTooLarge { len, max } => {
                write!(f, "payload too large: {len} > {max}")
            }
            Self::FrameTooShort { len } => write!(f, "frame too short: {len}"),
            Self::FrameTooLarge { len, max } => write!(f, "frame too large: {len} > {max}"),
            Self::FrameTruncated { expected, actual } => {
                write!(
                    f,
                    "truncated frame payload: expected {expected}, got {actual}"
                )
            }
        }
    }
}

impl std::error::Error for FrameCodecError {}

#[derive(Debug)]
pub enum WireError {
    Frame(FrameCodecError),
    Json(String),
    MagicMismatch { expected: u32, actual: u32 },
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frame(err) => write!(f, "{err}"),
            Self::Json(err) => write!(f, "{err}"),
            Self::MagicMismatch { expected, actual } => {
                write!(
                    f,
                    "protocol magic mismatch: expected 0x{expected:08x}, got 0x{actual:08x}"
                )
            }
        }
    }
}

impl std::error::Error for WireError {}

impl From<FrameCodecError> for WireError {
    fn from(value: FrameCodecError) -> Self {
        Self::Frame(value)
    }
}

pub fn encode_frame(payload: &[u8], max_payload_bytes: usize) -> Result<Vec<u8>, FrameCodecError> {
    if payload.len() > max_payload_bytes {
        return Err(FrameCodecError::PayloadTooLarge {
            len: payload.len(),
            max: max_payload_bytes,
        });
    }

    let payload_len =
        u32::try_from(payload.len()).map_err(|_| FrameCodecError::PayloadTooLarge {
            len: payload.len(),
            max: u32::MAX as usize,
        })?;

    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&payload_len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

pub fn encode_frame_default(payload: &[u8]) -> Result<Vec<u8>, FrameCodecError> {
    encode_frame(payload, DEFAULT_MAX_FRAME_BYTES)
}

pub fn decode_frame(frame: &[u8], max_payload_bytes: usize) -> Result<&[u8], FrameCodecError> {
    if frame.len() < 4 {
        return Err(FrameCodecError::FrameTooShort { len: frame.len() });
    }

    let mut prefix = [0u8; 4];
    prefix.copy_from_slice(&frame[..4]);
    let payload_len = u32::from_be_bytes(prefix) as usize;
    if payload_len > max_payload_bytes {
        return Err(FrameCodecError::FrameTooLarge {
            len: payload_len,
            max: max_payload_bytes,
        });
    }

    let actual_payload_len = frame.len() - 4;
    if actual_payload_len != payload_len {
        return Err(FrameCodecError::FrameTruncated {
            expected: payload_len,
            actual: actual_payload_len,
        });
    }

    Ok(&frame[4..])
}

pub fn decode_frame_default(frame: &[u8]) -> Result<&[u8], FrameCodecError> {
    decode_frame(frame, DEFAULT_MAX_FRAME_BYTES)
}

pub fn encode_protocol_magic() -> [u8; 4] {
    PROTOCOL_MAGIC.to_be_bytes()
}

pub fn decode_protocol_magic(bytes: [u8; 4]) -> Result<(), WireError> {
    let actual = u32::from_be_bytes(bytes);
    if actual != PROTOCOL_MAGIC {
        return Err(WireError::MagicMismatch {
            expected: PROTOCOL_MAGIC,
            actual,
        });
    }
    Ok(())
}

/// Control request sent from the coordinator to a participant.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CollectorRequest {
    BeginRecording {
        filter: CategoryFilter,
        options: TraceOptions,
    },
    EndRecording,
    BeginMonitoring {
        filter: CategoryFilter,
        options: TraceOptions,
    },
    EndMonitoring,
    CaptureMonitoringSnapshot,
    GetBufferPercentFull,
    SetWatchEvent(WatchSpec),
    CancelWatchEvent,
}

/// Reply sent from a participant back to the coordinator.
///
/// `TraceChunk` may arrive any number of times before the terminal ack of
/// the round that solicited it; everything else is terminal for its round.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantReply {
    RecordingEnded { known_categories: Vec<String> },
    SnapshotCaptured,
    TraceChunk { events: EventsJson },
    BufferPercentFull { percent_full: f32 },
    WatchEventMatched(WatchSpec),
}

pub fn encode_collector_request(
    message: &CollectorRequest,
    max_payload_bytes: usize,
) -> Result<Vec<u8>, WireError> {
    let payload = serde_json::to_vec(message).map_err(|e| WireError::Json(e.to_string()))?;
    Ok(encode_frame(&payload, max_payload_bytes)?)
}

pub fn encode_collector_request_default(message: &CollectorRequest) -> Result<Vec<u8>, WireError> {
    encode_collector_request(message, DEFAULT_MAX_FRAME_BYTES)
}

pub fn decode_collector_request(
    frame: &[u8],
    max_payload_bytes: usize,
) -> Result<CollectorRequest, WireError> {
    let payload = decode_frame(frame, max_payload_bytes)?;
    serde_json::from_slice(payload).map_err(|e| WireError::Json(e.to_string()))
}

pub fn decode_collector_request_default(frame: &[u8]) -> Result<CollectorRequest, WireError> {
    decode_collector_request(frame, DEFAULT_MAX_FRAME_BYTES)
}

pub fn encode_participant_reply(
    message: &ParticipantReply,
    max_payload_bytes: usize,
) -> Result<Vec<u8>, WireError> {
    let payload = serde_json::to_vec(message).map_err(|e| WireError::Json(e.to_string()))?;
    Ok(encode_frame(&payload, max_payload_bytes)?)
}

pub fn encode_participant_reply_default(message: &ParticipantReply) -> Result<Vec<u8>, WireError> {
    encode_participant_reply(message, DEFAULT_MAX_FRAME_BYTES)
}

pub fn decode_participant_reply(
    frame: &[u8],
    max_payload_bytes: usize,
) -> Result<ParticipantReply, WireError> {
    let payload = decode_frame(frame, max_payload_bytes)?;
    serde_json::from_slice(payload).map_err(|e| WireError::Json(e.to_string()))
}

pub fn decode_participant_reply_default(frame: &[u8]) -> Result<ParticipantReply, WireError> {
    decode_participant_reply(frame, DEFAULT_MAX_FRAME_BYTES)
}
