//! Multi-participant trace-collection coordinator.
//!
//! One [`Coordinator`] per process orchestrates recording, monitoring, and
//! snapshotting of trace-event streams across a dynamically-changing set of
//! worker participants plus the local process, merging everything into a
//! single `{"traceEvents": [...]}` artifact. Control messages and replies
//! are the [`weft_wire`] vocabulary; how they travel is the transport
//! layer's business. It registers participants, feeds replies into
//! [`Coordinator::deliver_reply`], and removes participants that vanish.

pub mod bridge;
mod coordinator;
mod ids;
mod local;
mod pending;
mod registry;
mod session;
mod sink;
mod watch;

pub use bridge::{BridgeError, NoopBridge, SystemTracingBridge};
pub use coordinator::{Coordinator, CoordinatorConfig};
pub use ids::ParticipantId;
pub use local::LocalTraceLog;
pub use sink::TraceSink;
pub use watch::WatchCallback;
