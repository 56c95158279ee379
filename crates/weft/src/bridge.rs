use async_trait::async_trait;
use std::fmt;
use weft_types::{CategoryFilter, SystemTracePayload};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// The platform has no system-tracing facility (the no-op default).
    Unsupported,
    StartFailed(String),
    StopFailed(String),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported => write!(f, "system tracing is not supported on this platform"),
            Self::StartFailed(err) => write!(f, "system tracing failed to start: {err}"),
            Self::StopFailed(err) => write!(f, "system tracing failed to stop: {err}"),
        }
    }
}

impl std::error::Error for BridgeError {}

/// Platform system-tracing facility, folded into the ack protocol as one
/// extra participant.
///
/// Start failure is non-fatal: the coordinator logs it and records without
/// the bridge. Stop failure is fatal for the engagement: the coordinator
/// logs it and never retries, so the operation that awaits the bridge does
/// not complete. That asymmetry is deliberate.
#[async_trait]
pub trait SystemTracingBridge: Send + Sync {
    async fn start_tracing(&self, filter: &CategoryFilter) -> Result<(), BridgeError>;
    async fn stop_tracing(&self) -> Result<SystemTracePayload, BridgeError>;
}

/// Default bridge for platforms without a system tracer.
///
/// Never starts, so recordings proceed without a system-trace section and
/// the output artifact carries no `systemTraceEvents` key.
pub struct NoopBridge;

#[async_trait]
impl SystemTracingBridge for NoopBridge {
    async fn start_tracing(&self, _filter: &CategoryFilter) -> Result<(), BridgeError> {
        Err(BridgeError::Unsupported)
    }

    async fn stop_tracing(&self) -> Result<SystemTracePayload, BridgeError> {
        Err(BridgeError::Unsupported)
    }
}
