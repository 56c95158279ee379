use std::sync::Arc;
use weft_types::WatchSpec;

/// Callback invoked for every reported match of the registered watch pair.
pub type WatchCallback = Arc<dyn Fn(WatchSpec) + Send + Sync>;

/// The single (category, event) subscription.
///
/// Replacing it atomically supersedes the previous registration; a late
/// match report for a superseded pair is dropped by the pair comparison.
pub struct WatchRegistration {
    pub spec: WatchSpec,
    pub on_match: WatchCallback,
}

impl WatchRegistration {
    pub fn matches(&self, reported: &WatchSpec) -> bool {
        self.spec == *reported
    }
}
