use weft_types::{CategoryFilter, TraceMode, TraceOptions};

/// The one process-wide trace session.
///
/// Mutated only on the coordinating task. Guards answer before any side
/// effect happens; a `false` answer leaves the session untouched.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub mode: TraceMode,
    pub filter: CategoryFilter,
    pub options: TraceOptions,
}

impl Session {
    pub fn can_enable_recording(&self) -> bool {
        self.mode != TraceMode::Recording
    }

    pub fn can_disable_recording(&self) -> bool {
        self.mode == TraceMode::Recording
    }

    pub fn can_enable_monitoring(&self) -> bool {
        self.mode != TraceMode::Monitoring
    }

    pub fn can_disable_monitoring(&self) -> bool {
        self.mode == TraceMode::Monitoring
    }

    pub fn begin(&mut self, mode: TraceMode, filter: CategoryFilter, options: TraceOptions) {
        self.mode = mode;
        self.filter = filter;
        self.options = options;
    }

    pub fn end(&mut self) {
        self.mode = TraceMode::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_guards_follow_mode() {
        let mut session = Session::default();
        assert!(session.can_enable_recording());
        assert!(!session.can_disable_recording());

        session.begin(
            TraceMode::Recording,
            CategoryFilter::all(),
            TraceOptions::default(),
        );
        assert!(!session.can_enable_recording());
        assert!(session.can_disable_recording());

        session.end();
        assert_eq!(session.mode, TraceMode::Idle);
    }

    #[test]
    fn monitoring_does_not_block_recording() {
        let mut session = Session::default();
        session.begin(
            TraceMode::Monitoring,
            CategoryFilter::new("net"),
            TraceOptions::default(),
        );
        // One mode field: enabling recording from monitoring is allowed and
        // supersedes the monitoring session.
        assert!(session.can_enable_recording());
        assert!(!session.can_enable_monitoring());
    }
}
