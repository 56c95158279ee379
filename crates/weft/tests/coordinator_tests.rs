use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use weft::{Coordinator, CoordinatorConfig, NoopBridge, ParticipantId, SystemTracingBridge};
use weft::bridge::BridgeError;
use weft_types::{CategoryFilter, EventsJson, SystemTracePayload, TraceMode, TraceOptions};
use weft_wire::{CollectorRequest, ParticipantReply};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn coordinator() -> Coordinator {
    init_logging();
    Coordinator::spawn(CoordinatorConfig::default(), Arc::new(NoopBridge))
}

struct FakeParticipant {
    id: ParticipantId,
    rx: mpsc::UnboundedReceiver<CollectorRequest>,
}

impl FakeParticipant {
    async fn join(coordinator: &Coordinator, name: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = coordinator
            .add_participant(name, tx)
            .await
            .expect("coordinator should be running");
        Self { id, rx }
    }

    fn expect_request(&mut self) -> CollectorRequest {
        self.rx
            .try_recv()
            .expect("participant should have received a request")
    }

    fn expect_no_request(&mut self) {
        assert!(
            self.rx.try_recv().is_err(),
            "participant should not have received a request"
        );
    }
}

fn file_completion() -> (
    impl FnOnce(PathBuf) + Send + 'static,
    oneshot::Receiver<PathBuf>,
) {
    let (tx, rx) = oneshot::channel();
    (
        move |path| {
            let _ = tx.send(path);
        },
        rx,
    )
}

async fn within<T>(rx: oneshot::Receiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("operation should complete")
        .expect("callback should fire")
}

async fn read_artifact(path: &PathBuf) -> String {
    tokio::fs::read_to_string(path)
        .await
        .expect("artifact should be readable")
}

#[tokio::test]
async fn enable_recording_twice_is_rejected() {
    let c = coordinator();
    assert!(
        c.enable_recording(CategoryFilter::all(), TraceOptions::default())
            .await
    );
    assert!(
        !c.enable_recording(CategoryFilter::all(), TraceOptions::default())
            .await
    );
    assert_eq!(c.mode().await, TraceMode::Recording);
}

#[tokio::test]
async fn disable_without_recording_is_rejected() {
    let c = coordinator();
    let (cb, _rx) = file_completion();
    assert!(!c.disable_recording("unused.json", cb).await);
    assert_eq!(c.mode().await, TraceMode::Idle);
}

#[tokio::test]
async fn end_round_merges_remote_and_local_chunks() {
    let c = coordinator();
    let mut a = FakeParticipant::join(&c, "renderer").await;
    let mut b = FakeParticipant::join(&c, "gpu-process").await;

    assert!(
        c.enable_recording(CategoryFilter::new("gpu"), TraceOptions::default())
            .await
    );
    assert!(matches!(
        a.expect_request(),
        CollectorRequest::BeginRecording { .. }
    ));
    assert!(matches!(
        b.expect_request(),
        CollectorRequest::BeginRecording { .. }
    ));

    c.local().record_event("gpu", "swap", r#"{"p":"local"}"#);

    let dir = tempfile::tempdir().expect("tempdir should be created");
    let path = dir.path().join("trace.json");
    let (cb, done) = file_completion();
    assert!(c.disable_recording(&path, cb).await);
    assert_eq!(a.expect_request(), CollectorRequest::EndRecording);
    assert_eq!(b.expect_request(), CollectorRequest::EndRecording);

    c.deliver_reply(a.id, ParticipantReply::TraceChunk {
        events: EventsJson::new(r#"{"p":"a"}"#),
    });
    c.deliver_reply(a.id, ParticipantReply::RecordingEnded {
        known_categories: vec!["cat-a".into()],
    });
    c.deliver_reply(b.id, ParticipantReply::RecordingEnded {
        known_categories: vec!["cat-b".into()],
    });

    let final_path = within(done).await;
    assert_eq!(final_path, path);
    assert_eq!(
        read_artifact(&path).await,
        r#"{"traceEvents": [{"p":"a"},{"p":"local"}]}"#
    );
    assert_eq!(c.mode().await, TraceMode::Idle);
}

#[tokio::test]
async fn completion_fires_once_regardless_of_ack_order() {
    for flip in [false, true] {
        let c = coordinator();
        let a = FakeParticipant::join(&c, "renderer").await;
        let b = FakeParticipant::join(&c, "gpu-process").await;

        assert!(
            c.enable_recording(CategoryFilter::all(), TraceOptions::default())
                .await
        );

        let fired = Arc::new(AtomicUsize::new(0));
        let counted = fired.clone();
        let (tx, done) = oneshot::channel();
        assert!(
            c.disable_recording("", move |_| {
                counted.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(());
            })
            .await
        );

        let order = if flip { [b.id, a.id] } else { [a.id, b.id] };
        for id in order {
            c.deliver_reply(id, ParticipantReply::RecordingEnded {
                known_categories: vec![],
            });
        }
        within(done).await;

        // A late duplicate is ignored; the mode round-trip guarantees it
        // was processed before we look at the counter.
        c.deliver_reply(a.id, ParticipantReply::RecordingEnded {
            known_categories: vec![],
        });
        assert_eq!(c.mode().await, TraceMode::Idle);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test]
async fn removing_an_awaited_participant_acts_as_an_empty_ack() {
    let c = coordinator();
    let a = FakeParticipant::join(&c, "renderer").await;
    let b = FakeParticipant::join(&c, "gpu-process").await;

    assert!(
        c.enable_recording(CategoryFilter::all(), TraceOptions::default())
            .await
    );
    c.local().record_event("gpu", "swap", r#"{"p":"local"}"#);

    let dir = tempfile::tempdir().expect("tempdir should be created");
    let path = dir.path().join("trace.json");
    let (cb, done) = file_completion();
    assert!(c.disable_recording(&path, cb).await);

    // remaining starts at 3: a, b, local.
    c.deliver_reply(a.id, ParticipantReply::RecordingEnded {
        known_categories: vec!["cat1".into()],
    });
    // b vanishes before acking; the synthesized ack drops remaining to 1
    // and triggers the local flush.
    c.remove_participant(b.id);

    within(done).await;
    assert_eq!(
        read_artifact(&path).await,
        r#"{"traceEvents": [{"p":"local"}]}"#
    );

    // The category union from the degraded round was recorded internally.
    let (tx, harvested) = oneshot::channel();
    assert!(
        c.get_categories(move |categories| {
            let _ = tx.send(categories);
        })
        .await
    );
    c.deliver_reply(a.id, ParticipantReply::RecordingEnded {
        known_categories: vec![],
    });
    let categories = within(harvested).await;
    assert!(categories.contains("cat1"));
}

#[tokio::test]
async fn get_categories_restores_idle_and_unions_payloads() {
    let c = coordinator();
    let mut a = FakeParticipant::join(&c, "renderer").await;

    assert_eq!(c.mode().await, TraceMode::Idle);
    let (tx, harvested) = oneshot::channel::<BTreeSet<String>>();
    assert!(
        c.get_categories(move |categories| {
            let _ = tx.send(categories);
        })
        .await
    );

    // The transient round is a wildcard begin immediately followed by end.
    match a.expect_request() {
        CollectorRequest::BeginRecording { filter, .. } => assert_eq!(filter.as_str(), "*"),
        other => panic!("expected begin-recording, got {other:?}"),
    }
    assert_eq!(a.expect_request(), CollectorRequest::EndRecording);

    c.deliver_reply(a.id, ParticipantReply::RecordingEnded {
        known_categories: vec!["remote-cat".into()],
    });

    let categories = within(harvested).await;
    assert!(categories.contains("remote-cat"));
    assert_eq!(c.mode().await, TraceMode::Idle);
}

#[tokio::test]
async fn watch_registration_is_superseded_atomically() {
    let c = coordinator();
    let mut a = FakeParticipant::join(&c, "renderer").await;

    let gpu_matches = Arc::new(AtomicUsize::new(0));
    let net_matches = Arc::new(AtomicUsize::new(0));

    let counted = gpu_matches.clone();
    assert!(
        c.set_watch_event("gpu", "context_lost", Arc::new(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        }))
        .await
    );
    let counted = net_matches.clone();
    assert!(
        c.set_watch_event("net", "timeout", Arc::new(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        }))
        .await
    );
    assert!(matches!(
        a.expect_request(),
        CollectorRequest::SetWatchEvent(_)
    ));
    assert!(matches!(
        a.expect_request(),
        CollectorRequest::SetWatchEvent(_)
    ));

    // Late match for the superseded pair is ignored.
    c.deliver_reply(
        a.id,
        ParticipantReply::WatchEventMatched(weft_types::WatchSpec::new("gpu", "context_lost")),
    );
    // Matches for the current pair land, from a participant and locally.
    c.deliver_reply(
        a.id,
        ParticipantReply::WatchEventMatched(weft_types::WatchSpec::new("net", "timeout")),
    );
    c.local().record_event("net", "timeout", r#"{"p":"x"}"#);

    assert_eq!(c.mode().await, TraceMode::Idle);
    assert_eq!(gpu_matches.load(Ordering::SeqCst), 0);
    assert_eq!(net_matches.load(Ordering::SeqCst), 2);

    assert!(c.cancel_watch_event().await);
    assert_eq!(a.expect_request(), CollectorRequest::CancelWatchEvent);
    assert!(!c.cancel_watch_event().await);
}

#[tokio::test]
async fn empty_watch_pair_is_rejected() {
    let c = coordinator();
    assert!(!c.set_watch_event("", "timeout", Arc::new(|_| {})).await);
    assert!(!c.set_watch_event("net", "", Arc::new(|_| {})).await);
}

#[tokio::test]
async fn buffer_percent_full_reports_the_maximum() {
    let c = coordinator();
    let mut a = FakeParticipant::join(&c, "renderer").await;
    let mut b = FakeParticipant::join(&c, "gpu-process").await;

    let (tx, done) = oneshot::channel();
    assert!(
        c.trace_buffer_percent_full(move |percent| {
            let _ = tx.send(percent);
        })
        .await
    );
    assert_eq!(a.expect_request(), CollectorRequest::GetBufferPercentFull);
    assert_eq!(b.expect_request(), CollectorRequest::GetBufferPercentFull);

    // A second round while one is in flight is rejected.
    assert!(!c.trace_buffer_percent_full(|_| {}).await);

    c.deliver_reply(a.id, ParticipantReply::BufferPercentFull {
        percent_full: 30.0,
    });
    c.deliver_reply(b.id, ParticipantReply::BufferPercentFull {
        percent_full: 80.0,
    });

    let percent = within(done).await;
    assert_eq!(percent, 80.0);
}

#[tokio::test]
async fn snapshot_drains_without_stopping_monitoring() {
    let c = coordinator();
    let mut a = FakeParticipant::join(&c, "renderer").await;

    assert!(
        c.enable_monitoring(CategoryFilter::new("net"), TraceOptions {
            sampling: true,
            ..TraceOptions::default()
        })
        .await
    );
    assert!(matches!(
        a.expect_request(),
        CollectorRequest::BeginMonitoring { .. }
    ));
    c.local().record_event("net", "req", r#"{"p":"m1"}"#);

    let dir = tempfile::tempdir().expect("tempdir should be created");
    let path = dir.path().join("snapshot.json");
    let (cb, done) = file_completion();
    assert!(c.capture_monitoring_snapshot(&path, cb).await);
    assert_eq!(
        a.expect_request(),
        CollectorRequest::CaptureMonitoringSnapshot
    );

    c.deliver_reply(a.id, ParticipantReply::TraceChunk {
        events: EventsJson::new(r#"{"p":"remote"}"#),
    });
    c.deliver_reply(a.id, ParticipantReply::SnapshotCaptured);

    within(done).await;
    assert_eq!(
        read_artifact(&path).await,
        r#"{"traceEvents": [{"p":"remote"},{"p":"m1"}]}"#
    );
    assert_eq!(c.mode().await, TraceMode::Monitoring);

    // Monitoring keeps collecting after the snapshot.
    c.local().record_event("net", "req", r#"{"p":"m2"}"#);
    let (tx, stopped) = oneshot::channel();
    assert!(
        c.disable_monitoring(move || {
            let _ = tx.send(());
        })
        .await
    );
    assert_eq!(a.expect_request(), CollectorRequest::EndMonitoring);
    within(stopped).await;
    assert_eq!(c.mode().await, TraceMode::Idle);
    assert!(!c.disable_monitoring(|| {}).await);
}

#[tokio::test]
async fn participant_joining_mid_round_is_not_awaited() {
    let c = coordinator();
    let a = FakeParticipant::join(&c, "renderer").await;

    assert!(
        c.enable_recording(CategoryFilter::all(), TraceOptions::default())
            .await
    );
    let (cb, done) = file_completion();
    assert!(c.disable_recording("", cb).await);

    // Joins after the awaiting set was snapshotted: catches up on the
    // still-active session but is not tracked by the in-flight round.
    let mut late = FakeParticipant::join(&c, "late-worker").await;
    assert!(matches!(
        late.expect_request(),
        CollectorRequest::BeginRecording { .. }
    ));
    late.expect_no_request();

    c.deliver_reply(a.id, ParticipantReply::RecordingEnded {
        known_categories: vec![],
    });
    within(done).await;
}

#[tokio::test]
async fn joining_participant_catches_up_on_watch_and_session() {
    let c = coordinator();
    assert!(c.set_watch_event("gpu", "context_lost", Arc::new(|_| {})).await);
    assert!(
        c.enable_recording(CategoryFilter::new("gpu"), TraceOptions::default())
            .await
    );

    let mut joiner = FakeParticipant::join(&c, "renderer").await;
    assert!(matches!(
        joiner.expect_request(),
        CollectorRequest::SetWatchEvent(_)
    ));
    assert!(matches!(
        joiner.expect_request(),
        CollectorRequest::BeginRecording { .. }
    ));
    joiner.expect_no_request();
}

#[tokio::test]
async fn sink_open_failure_still_completes_deterministically() {
    let c = coordinator();
    assert!(
        c.enable_recording(CategoryFilter::all(), TraceOptions::default())
            .await
    );
    let path = PathBuf::from("/nonexistent-weft-dir/trace.json");
    let (cb, done) = file_completion();
    assert!(c.disable_recording(&path, cb).await);
    let final_path = within(done).await;
    assert_eq!(final_path, path);
    assert!(!path.exists());
}

struct PayloadBridge;

#[async_trait::async_trait]
impl SystemTracingBridge for PayloadBridge {
    async fn start_tracing(&self, _filter: &CategoryFilter) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn stop_tracing(&self) -> Result<SystemTracePayload, BridgeError> {
        Ok(SystemTracePayload::Json(r#"[{"sys":1}]"#.into()))
    }
}

struct StartFailBridge;

#[async_trait::async_trait]
impl SystemTracingBridge for StartFailBridge {
    async fn start_tracing(&self, _filter: &CategoryFilter) -> Result<(), BridgeError> {
        Err(BridgeError::StartFailed("no kernel tracer".into()))
    }

    async fn stop_tracing(&self) -> Result<SystemTracePayload, BridgeError> {
        Err(BridgeError::Unsupported)
    }
}

#[tokio::test]
async fn bridge_payload_is_embedded_in_the_artifact() {
    init_logging();
    let c = Coordinator::spawn(CoordinatorConfig::default(), Arc::new(PayloadBridge));
    assert!(
        c.enable_recording(CategoryFilter::all(), TraceOptions {
            system_trace: true,
            ..TraceOptions::default()
        })
        .await
    );

    let dir = tempfile::tempdir().expect("tempdir should be created");
    let path = dir.path().join("trace.json");
    let (cb, done) = file_completion();
    assert!(c.disable_recording(&path, cb).await);

    within(done).await;
    assert_eq!(
        read_artifact(&path).await,
        r#"{"traceEvents": [], "systemTraceEvents": [{"sys":1}]}"#
    );
}

#[tokio::test]
async fn bridge_start_failure_does_not_block_recording() {
    init_logging();
    let c = Coordinator::spawn(CoordinatorConfig::default(), Arc::new(StartFailBridge));
    assert!(
        c.enable_recording(CategoryFilter::all(), TraceOptions {
            system_trace: true,
            ..TraceOptions::default()
        })
        .await
    );

    let dir = tempfile::tempdir().expect("tempdir should be created");
    let path = dir.path().join("trace.json");
    let (cb, done) = file_completion();
    assert!(c.disable_recording(&path, cb).await);

    within(done).await;
    let artifact = read_artifact(&path).await;
    assert!(!artifact.contains("systemTraceEvents"));
    assert!(artifact.starts_with(r#"{"traceEvents": ["#));
    assert!(artifact.ends_with("]}"));
}
