use serde::{Deserialize, Serialize};
use std::fmt;

/// What the trace session is currently doing.
///
/// Exactly one mode is in effect at a time; the coordinator is the only
/// writer.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TraceMode {
    #[default]
    Idle,
    Recording,
    Monitoring,
}

impl fmt::Display for TraceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Recording => write!(f, "recording"),
            Self::Monitoring => write!(f, "monitoring"),
        }
    }
}

/// Capture options carried by begin-recording/begin-monitoring requests.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TraceOptions {
    /// Overwrite the oldest buffered events once the buffer fills, instead
    /// of dropping new ones.
    pub continuous: bool,
    pub sampling: bool,
    /// Engage the platform system-tracing bridge for this recording.
    pub system_trace: bool,
}

/// Opaque category filter string.
///
/// Syntax and match semantics belong to the front-end that produces it;
/// participants and the local collector receive it verbatim.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct CategoryFilter(String);

impl CategoryFilter {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// The wildcard filter matching every category.
    pub fn all() -> Self {
        Self("*".to_string())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for CategoryFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Raw JSON fragment holding one batch of trace events.
///
/// The fragment is a comma-joined run of event objects, valid inside a JSON
/// array, preserved exactly as the producer assembled it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(transparent)]
pub struct EventsJson(String);

impl EventsJson {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Payload captured by the platform system-tracing facility.
///
/// The embedding into the output artifact is explicit in the variant: a
/// bridge that produces well-formed JSON says so, anything else is carried
/// as opaque text and escaped on write.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SystemTracePayload {
    /// Already well-formed JSON; embedded verbatim.
    Json(String),
    /// Opaque text; embedded as an escaped JSON string.
    Text(String),
}

/// A single (category, event-name) watch subscription.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct WatchSpec {
    pub category: String,
    pub name: String,
}

impl WatchSpec {
    pub fn new(category: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WatchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category, self.name)
    }
}
