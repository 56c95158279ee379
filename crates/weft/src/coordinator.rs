use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use weft_types::{
    CategoryFilter, EventsJson, SystemTracePayload, TraceMode, TraceOptions, WatchSpec,
};
use weft_wire::{CollectorRequest, ParticipantReply};

use crate::bridge::{BridgeError, SystemTracingBridge};
use crate::ids::ParticipantId;
use crate::local::{LocalSignal, LocalTraceLog};
use crate::pending::{
    AckCounter, AckOutcome, AckSource, OpCompletion, OpKind, PendingOp, PercentRound,
};
use crate::registry::ParticipantRegistry;
use crate::session::Session;
use crate::sink::TraceSink;
use crate::watch::{WatchCallback, WatchRegistration};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Capacity of the process-local event buffer.
    pub local_event_capacity: usize,
    /// Largest number of events per flushed local chunk.
    pub flush_chunk_events: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            local_event_capacity: 16_384,
            flush_chunk_events: 1_024,
        }
    }
}

type FileCallback = Box<dyn FnOnce(PathBuf) + Send>;
type CategoriesCallback = Box<dyn FnOnce(BTreeSet<String>) + Send>;
type PercentCallback = Box<dyn FnOnce(f32) + Send>;
type DoneCallback = Box<dyn FnOnce() + Send>;

enum Command {
    EnableRecording {
        filter: CategoryFilter,
        options: TraceOptions,
        reply: oneshot::Sender<bool>,
    },
    DisableRecording {
        path: PathBuf,
        on_complete: FileCallback,
        reply: oneshot::Sender<bool>,
    },
    EnableMonitoring {
        filter: CategoryFilter,
        options: TraceOptions,
        reply: oneshot::Sender<bool>,
    },
    DisableMonitoring {
        on_complete: DoneCallback,
        reply: oneshot::Sender<bool>,
    },
    CaptureSnapshot {
        path: PathBuf,
        on_complete: FileCallback,
        reply: oneshot::Sender<bool>,
    },
    PercentFull {
        on_result: PercentCallback,
        reply: oneshot::Sender<bool>,
    },
    GetCategories {
        on_result: CategoriesCallback,
        reply: oneshot::Sender<bool>,
    },
    SetWatchEvent {
        spec: WatchSpec,
        on_match: WatchCallback,
        reply: oneshot::Sender<bool>,
    },
    CancelWatchEvent {
        reply: oneshot::Sender<bool>,
    },
    AddParticipant {
        name: String,
        tx: mpsc::UnboundedSender<CollectorRequest>,
        reply: oneshot::Sender<ParticipantId>,
    },
    RemoveParticipant {
        id: ParticipantId,
    },
    Reply {
        from: ParticipantId,
        reply: ParticipantReply,
    },
    LocalChunk {
        kind: OpKind,
        events: EventsJson,
    },
    LocalFlushDone {
        kind: OpKind,
        categories: BTreeSet<String>,
    },
    LocalPercent {
        percent_full: f32,
    },
    BridgeStarted {
        result: Result<(), BridgeError>,
    },
    BridgeStopped {
        result: Result<SystemTracePayload, BridgeError>,
    },
    SinkClosed {
        kind: OpKind,
        path: PathBuf,
        completion: OpCompletion,
        categories: BTreeSet<String>,
    },
    Mode {
        reply: oneshot::Sender<TraceMode>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BridgeState {
    Off,
    Starting,
    Running,
    Stopping,
}

/// Handle to the trace-collection coordinator.
///
/// One explicitly constructed instance per process; the transport layer
/// that creates and destroys participants is handed a clone. Every
/// operation is forwarded to a single coordinating task that owns all
/// session, registry, and fan-in state. Acks, join/leave events, bridge
/// completions, and sink closes all arrive there as messages and are never
/// processed on the thread that produced them. The task lives for the life
/// of the process.
#[derive(Clone)]
pub struct Coordinator {
    tx: mpsc::UnboundedSender<Command>,
    local: Arc<LocalTraceLog>,
}

impl Coordinator {
    pub fn spawn(config: CoordinatorConfig, bridge: Arc<dyn SystemTracingBridge>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let local = Arc::new(LocalTraceLog::new(config.local_event_capacity));
        local.attach_signal(signal_tx);

        let task = CoordinatorTask {
            config,
            session: Session::default(),
            registry: ParticipantRegistry::default(),
            end_op: None,
            snapshot_op: None,
            percent_round: None,
            watch: None,
            known_categories: BTreeSet::new(),
            bridge,
            bridge_state: BridgeState::Off,
            local: local.clone(),
            self_tx: tx.clone(),
        };
        tokio::spawn(task.run(rx, signal_rx));

        Self { tx, local }
    }

    /// The process-local collector; instrumentation feeds events here.
    pub fn local(&self) -> &Arc<LocalTraceLog> {
        &self.local
    }

    async fn guarded(&self, command: Command, reply: oneshot::Receiver<bool>) -> bool {
        if self.tx.send(command).is_err() {
            return false;
        }
        reply.await.unwrap_or(false)
    }

    pub async fn enable_recording(&self, filter: CategoryFilter, options: TraceOptions) -> bool {
        let (tx, rx) = oneshot::channel();
        self.guarded(
            Command::EnableRecording {
                filter,
                options,
                reply: tx,
            },
            rx,
        )
        .await
    }

    /// Ends the recording session, draining every participant plus the
    /// local collector into `path`. An empty path discards the data (the
    /// category-harvest round uses this).
    pub async fn disable_recording(
        &self,
        path: impl Into<PathBuf>,
        on_complete: impl FnOnce(PathBuf) + Send + 'static,
    ) -> bool {
        let (tx, rx) = oneshot::channel();
        self.guarded(
            Command::DisableRecording {
                path: path.into(),
                on_complete: Box::new(on_complete),
                reply: tx,
            },
            rx,
        )
        .await
    }

    pub async fn enable_monitoring(&self, filter: CategoryFilter, options: TraceOptions) -> bool {
        let (tx, rx) = oneshot::channel();
        self.guarded(
            Command::EnableMonitoring {
                filter,
                options,
                reply: tx,
            },
            rx,
        )
        .await
    }

    pub async fn disable_monitoring(&self, on_complete: impl FnOnce() + Send + 'static) -> bool {
        let (tx, rx) = oneshot::channel();
        self.guarded(
            Command::DisableMonitoring {
                on_complete: Box::new(on_complete),
                reply: tx,
            },
            rx,
        )
        .await
    }

    pub async fn capture_monitoring_snapshot(
        &self,
        path: impl Into<PathBuf>,
        on_complete: impl FnOnce(PathBuf) + Send + 'static,
    ) -> bool {
        let (tx, rx) = oneshot::channel();
        self.guarded(
            Command::CaptureSnapshot {
                path: path.into(),
                on_complete: Box::new(on_complete),
                reply: tx,
            },
            rx,
        )
        .await
    }

    /// Asks every participant and the local collector how full their trace
    /// buffers are; the callback receives the maximum.
    pub async fn trace_buffer_percent_full(
        &self,
        on_result: impl FnOnce(f32) + Send + 'static,
    ) -> bool {
        let (tx, rx) = oneshot::channel();
        self.guarded(
            Command::PercentFull {
                on_result: Box::new(on_result),
                reply: tx,
            },
            rx,
        )
        .await
    }

    /// Harvests the union of categories known across all participants via
    /// a transient wildcard recording round that produces no artifact and
    /// leaves the session as it found it.
    pub async fn get_categories(
        &self,
        on_result: impl FnOnce(BTreeSet<String>) + Send + 'static,
    ) -> bool {
        let (tx, rx) = oneshot::channel();
        self.guarded(
            Command::GetCategories {
                on_result: Box::new(on_result),
                reply: tx,
            },
            rx,
        )
        .await
    }

    pub async fn set_watch_event(
        &self,
        category: impl Into<String>,
        name: impl Into<String>,
        on_match: WatchCallback,
    ) -> bool {
        let (tx, rx) = oneshot::channel();
        self.guarded(
            Command::SetWatchEvent {
                spec: WatchSpec::new(category, name),
                on_match,
                reply: tx,
            },
            rx,
        )
        .await
    }

    pub async fn cancel_watch_event(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        self.guarded(Command::CancelWatchEvent { reply: tx }, rx).await
    }

    /// Registers a participant; `tx` is its outbound control channel. The
    /// new participant immediately receives the current watch registration
    /// and, if a session is active, the matching begin message.
    pub async fn add_participant(
        &self,
        name: impl Into<String>,
        tx: mpsc::UnboundedSender<CollectorRequest>,
    ) -> Option<ParticipantId> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(Command::AddParticipant {
                name: name.into(),
                tx,
                reply: reply_tx,
            })
            .is_err()
        {
            return None;
        }
        reply_rx.await.ok()
    }

    pub fn remove_participant(&self, id: ParticipantId) {
        let _ = self.tx.send(Command::RemoveParticipant { id });
    }

    /// Transport ingress: a reply arrived from a participant. May be called
    /// from any execution context.
    pub fn deliver_reply(&self, from: ParticipantId, reply: ParticipantReply) {
        let _ = self.tx.send(Command::Reply { from, reply });
    }

    pub async fn mode(&self) -> TraceMode {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Mode { reply: tx }).is_err() {
            return TraceMode::Idle;
        }
        rx.await.unwrap_or(TraceMode::Idle)
    }
}

struct CoordinatorTask {
    config: CoordinatorConfig,
    session: Session,
    registry: ParticipantRegistry,
    end_op: Option<PendingOp>,
    snapshot_op: Option<PendingOp>,
    percent_round: Option<PercentRound>,
    watch: Option<WatchRegistration>,
    known_categories: BTreeSet<String>,
    bridge: Arc<dyn SystemTracingBridge>,
    bridge_state: BridgeState,
    local: Arc<LocalTraceLog>,
    self_tx: mpsc::UnboundedSender<Command>,
}

impl CoordinatorTask {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Command>,
        mut signals: mpsc::UnboundedReceiver<LocalSignal>,
    ) {
        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.handle(cmd);
                }
                signal = signals.recv() => {
                    if let Some(LocalSignal::WatchMatched(spec)) = signal {
                        self.handle_watch_match(spec);
                    }
                }
            }
        }
        debug!("coordinator task stopped");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::EnableRecording {
                filter,
                options,
                reply,
            } => {
                let _ = reply.send(self.enable_recording(filter, options));
            }
            Command::DisableRecording {
                path,
                on_complete,
                reply,
            } => {
                let _ = reply.send(self.disable_recording(path, on_complete));
            }
            Command::EnableMonitoring {
                filter,
                options,
                reply,
            } => {
                let _ = reply.send(self.enable_monitoring(filter, options));
            }
            Command::DisableMonitoring { on_complete, reply } => {
                let _ = reply.send(self.disable_monitoring(on_complete));
            }
            Command::CaptureSnapshot {
                path,
                on_complete,
                reply,
            } => {
                let _ = reply.send(self.capture_snapshot(path, on_complete));
            }
            Command::PercentFull { on_result, reply } => {
                let _ = reply.send(self.trace_buffer_percent_full(on_result));
            }
            Command::GetCategories { on_result, reply } => {
                let _ = reply.send(self.get_categories(on_result));
            }
            Command::SetWatchEvent {
                spec,
                on_match,
                reply,
            } => {
                let _ = reply.send(self.set_watch_event(spec, on_match));
            }
            Command::CancelWatchEvent { reply } => {
                let _ = reply.send(self.cancel_watch_event());
            }
            Command::AddParticipant { name, tx, reply } => {
                let _ = reply.send(self.add_participant(name, tx));
            }
            Command::RemoveParticipant { id } => self.remove_participant(id),
            Command::Reply { from, reply } => self.handle_reply(from, reply),
            Command::LocalChunk { kind, events } => self.local_chunk(kind, events),
            Command::LocalFlushDone { kind, categories } => {
                self.local_flush_done(kind, categories)
            }
            Command::LocalPercent { percent_full } => {
                self.percent_reply(AckSource::Local, Some(percent_full));
            }
            Command::BridgeStarted { result } => self.bridge_started(result),
            Command::BridgeStopped { result } => self.bridge_stopped(result),
            Command::SinkClosed {
                kind,
                path,
                completion,
                categories,
            } => self.sink_closed(kind, path, completion, categories),
            Command::Mode { reply } => {
                let _ = reply.send(self.session.mode);
            }
        }
    }

    fn enable_recording(&mut self, filter: CategoryFilter, options: TraceOptions) -> bool {
        if !self.session.can_enable_recording() {
            return false;
        }
        self.session
            .begin(TraceMode::Recording, filter.clone(), options);
        self.local.begin(&filter, options);
        if options.system_trace && self.bridge_state == BridgeState::Off {
            self.bridge_state = BridgeState::Starting;
            let bridge = self.bridge.clone();
            let tx = self.self_tx.clone();
            let bridge_filter = filter.clone();
            tokio::spawn(async move {
                let result = bridge.start_tracing(&bridge_filter).await;
                let _ = tx.send(Command::BridgeStarted { result });
            });
        }
        self.registry
            .broadcast(&CollectorRequest::BeginRecording { filter, options });
        info!(
            participants = self.registry.len(),
            filter = %self.session.filter,
            system_trace = options.system_trace,
            "recording enabled"
        );
        true
    }

    fn disable_recording(&mut self, path: PathBuf, on_complete: FileCallback) -> bool {
        if !self.session.can_disable_recording() || self.end_op.is_some() {
            return false;
        }
        self.begin_end_round(sink_for(&path), OpCompletion::File(on_complete));
        true
    }

    fn enable_monitoring(&mut self, filter: CategoryFilter, options: TraceOptions) -> bool {
        if !self.session.can_enable_monitoring() {
            return false;
        }
        self.session
            .begin(TraceMode::Monitoring, filter.clone(), options);
        self.local.begin(&filter, options);
        self.registry
            .broadcast(&CollectorRequest::BeginMonitoring { filter, options });
        info!(
            participants = self.registry.len(),
            filter = %self.session.filter,
            "monitoring enabled"
        );
        true
    }

    fn disable_monitoring(&mut self, on_complete: DoneCallback) -> bool {
        if !self.session.can_disable_monitoring() {
            return false;
        }
        self.registry.broadcast(&CollectorRequest::EndMonitoring);
        self.local.stop();
        self.session.end();
        info!("monitoring disabled");
        on_complete();
        true
    }

    fn capture_snapshot(&mut self, path: PathBuf, on_complete: FileCallback) -> bool {
        if !self.session.can_disable_monitoring() || self.snapshot_op.is_some() {
            return false;
        }
        let awaiting = self.registry.ids();
        self.registry
            .broadcast(&CollectorRequest::CaptureMonitoringSnapshot);
        let mut op = PendingOp {
            counter: AckCounter::new(awaiting, false),
            sink: sink_for(&path),
            categories: BTreeSet::new(),
            completion: OpCompletion::File(on_complete),
        };
        info!(
            awaiting = op.counter.awaiting_len(),
            path = %path.display(),
            "snapshot fanout started"
        );
        let flush_now = op.counter.flush_due_at_start();
        self.snapshot_op = Some(op);
        if flush_now {
            self.start_local_flush(OpKind::Snapshot);
        }
        true
    }

    fn trace_buffer_percent_full(&mut self, on_result: PercentCallback) -> bool {
        if self.percent_round.is_some() {
            return false;
        }
        let awaiting = self.registry.ids();
        self.registry
            .broadcast(&CollectorRequest::GetBufferPercentFull);
        let mut round = PercentRound {
            counter: AckCounter::new(awaiting, false),
            max_percent: 0.0,
            on_result,
        };
        info!(
            awaiting = round.counter.awaiting_len(),
            "buffer-usage fanout started"
        );
        let sample_now = round.counter.flush_due_at_start();
        self.percent_round = Some(round);
        if sample_now {
            self.start_local_percent_sample();
        }
        true
    }

    fn get_categories(&mut self, on_result: CategoriesCallback) -> bool {
        if self.session.mode != TraceMode::Idle || self.end_op.is_some() {
            return false;
        }
        // Transient wildcard round: enable, then immediately drain into a
        // discarding sink. Participants answer the end request with their
        // known category lists.
        let filter = CategoryFilter::all();
        let options = TraceOptions::default();
        self.session
            .begin(TraceMode::Recording, filter.clone(), options);
        self.local.begin(&filter, options);
        self.registry
            .broadcast(&CollectorRequest::BeginRecording { filter, options });
        self.begin_end_round(TraceSink::discard(), OpCompletion::Categories(on_result));
        true
    }

    fn begin_end_round(&mut self, sink: TraceSink, completion: OpCompletion) {
        let awaiting = self.registry.ids();
        let engage_bridge = self.bridge_state != BridgeState::Off;
        self.local.stop();
        self.registry.broadcast(&CollectorRequest::EndRecording);
        if self.bridge_state == BridgeState::Running {
            self.spawn_bridge_stop();
        }
        let mut op = PendingOp {
            counter: AckCounter::new(awaiting, engage_bridge),
            sink,
            categories: BTreeSet::new(),
            completion,
        };
        info!(
            awaiting = op.counter.awaiting_len(),
            bridge = engage_bridge,
            "end-recording fanout started"
        );
        let flush_now = op.counter.flush_due_at_start();
        self.end_op = Some(op);
        if flush_now {
            self.start_local_flush(OpKind::EndRecording);
        }
    }

    fn set_watch_event(&mut self, spec: WatchSpec, on_match: WatchCallback) -> bool {
        if spec.category.is_empty() || spec.name.is_empty() {
            return false;
        }
        self.local.set_watch(Some(spec.clone()));
        self.registry
            .broadcast(&CollectorRequest::SetWatchEvent(spec.clone()));
        info!(watch = %spec, "watch event registered");
        self.watch = Some(WatchRegistration { spec, on_match });
        true
    }

    fn cancel_watch_event(&mut self) -> bool {
        if self.watch.take().is_none() {
            return false;
        }
        self.local.set_watch(None);
        self.registry.broadcast(&CollectorRequest::CancelWatchEvent);
        info!("watch event cancelled");
        true
    }

    fn add_participant(
        &mut self,
        name: String,
        tx: mpsc::UnboundedSender<CollectorRequest>,
    ) -> ParticipantId {
        let id = self.registry.add(name, tx);
        if let Some(registration) = &self.watch {
            self.registry
                .send(id, CollectorRequest::SetWatchEvent(registration.spec.clone()));
        }
        match self.session.mode {
            TraceMode::Recording => self.registry.send(id, CollectorRequest::BeginRecording {
                filter: self.session.filter.clone(),
                options: self.session.options,
            }),
            TraceMode::Monitoring => self.registry.send(id, CollectorRequest::BeginMonitoring {
                filter: self.session.filter.clone(),
                options: self.session.options,
            }),
            TraceMode::Idle => {}
        }
        info!(
            participant = %id,
            name = self.registry.name(id).unwrap_or(""),
            mode = %self.session.mode,
            "participant joined"
        );
        id
    }

    fn remove_participant(&mut self, id: ParticipantId) {
        let Some(entry) = self.registry.remove(id) else {
            debug!(participant = %id, "removal of unknown participant ignored");
            return;
        };
        info!(participant = %id, name = %entry.name, "participant removed");
        // Synthesized empty-payload acks keep every in-flight round
        // converging; a vanished participant degrades the result, never
        // blocks it.
        self.apply_sink_ack(OpKind::EndRecording, AckSource::Participant(id));
        self.apply_sink_ack(OpKind::Snapshot, AckSource::Participant(id));
        self.percent_reply(AckSource::Participant(id), None);
    }

    fn handle_reply(&mut self, from: ParticipantId, reply: ParticipantReply) {
        match reply {
            ParticipantReply::RecordingEnded { known_categories } => {
                if let Some(op) = self.end_op.as_mut() {
                    if op.counter.awaits(from) {
                        op.categories.extend(known_categories);
                    }
                }
                self.apply_sink_ack(OpKind::EndRecording, AckSource::Participant(from));
            }
            ParticipantReply::SnapshotCaptured => {
                self.apply_sink_ack(OpKind::Snapshot, AckSource::Participant(from));
            }
            ParticipantReply::TraceChunk { events } => {
                let sink = self
                    .end_op
                    .as_ref()
                    .filter(|op| op.counter.awaits(from))
                    .or_else(|| {
                        self.snapshot_op
                            .as_ref()
                            .filter(|op| op.counter.awaits(from))
                    })
                    .map(|op| &op.sink);
                match sink {
                    Some(sink) => sink.write(events),
                    None => {
                        debug!(participant = %from, "trace chunk with no in-flight round dropped")
                    }
                }
            }
            ParticipantReply::BufferPercentFull { percent_full } => {
                self.percent_reply(AckSource::Participant(from), Some(percent_full));
            }
            ParticipantReply::WatchEventMatched(spec) => self.handle_watch_match(spec),
        }
    }

    fn handle_watch_match(&mut self, spec: WatchSpec) {
        match &self.watch {
            Some(registration) if registration.matches(&spec) => {
                (registration.on_match)(spec);
            }
            _ => debug!(watch = %spec, "match for superseded watch registration ignored"),
        }
    }

    fn local_chunk(&mut self, kind: OpKind, events: EventsJson) {
        match self.op_slot(kind).as_ref() {
            Some(op) => op.sink.write(events),
            None => debug!(%kind, "local chunk after completion dropped"),
        }
    }

    fn local_flush_done(&mut self, kind: OpKind, categories: BTreeSet<String>) {
        if let Some(op) = self.op_slot(kind).as_mut() {
            op.categories.extend(categories);
        }
        self.apply_sink_ack(kind, AckSource::Local);
    }

    fn op_slot(&mut self, kind: OpKind) -> &mut Option<PendingOp> {
        match kind {
            OpKind::EndRecording => &mut self.end_op,
            OpKind::Snapshot => &mut self.snapshot_op,
        }
    }

    fn apply_sink_ack(&mut self, kind: OpKind, source: AckSource) {
        let outcome = match self.op_slot(kind).as_mut() {
            Some(op) => op.counter.apply(source),
            None => return,
        };
        match outcome {
            AckOutcome::Ignored => debug!(%kind, "duplicate or unknown ack ignored"),
            AckOutcome::Progressed {
                local_flush_due,
                complete,
            } => {
                if local_flush_due {
                    self.start_local_flush(kind);
                }
                if complete {
                    self.finalize(kind);
                }
            }
        }
    }

    fn percent_reply(&mut self, source: AckSource, percent_full: Option<f32>) {
        let outcome = match self.percent_round.as_mut() {
            Some(round) => round.counter.apply(source),
            None => return,
        };
        match outcome {
            AckOutcome::Ignored => debug!("duplicate or unknown buffer-usage ack ignored"),
            AckOutcome::Progressed {
                local_flush_due,
                complete,
            } => {
                if let (Some(round), Some(percent)) = (self.percent_round.as_mut(), percent_full) {
                    round.max_percent = round.max_percent.max(percent);
                }
                if local_flush_due {
                    self.start_local_percent_sample();
                }
                if complete {
                    if let Some(round) = self.percent_round.take() {
                        info!(
                            percent_full = round.max_percent,
                            "buffer-usage fan-in complete"
                        );
                        (round.on_result)(round.max_percent);
                    }
                }
            }
        }
    }

    fn start_local_flush(&self, kind: OpKind) {
        let local = self.local.clone();
        let tx = self.self_tx.clone();
        let chunk_events = self.config.flush_chunk_events;
        tokio::spawn(async move {
            let (chunks, categories) = local.drain_chunks(chunk_events);
            for events in chunks {
                let _ = tx.send(Command::LocalChunk { kind, events });
            }
            let _ = tx.send(Command::LocalFlushDone { kind, categories });
        });
    }

    fn start_local_percent_sample(&self) {
        let local = self.local.clone();
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let percent_full = local.percent_full();
            let _ = tx.send(Command::LocalPercent { percent_full });
        });
    }

    fn spawn_bridge_stop(&mut self) {
        self.bridge_state = BridgeState::Stopping;
        let bridge = self.bridge.clone();
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = bridge.stop_tracing().await;
            let _ = tx.send(Command::BridgeStopped { result });
        });
    }

    fn bridge_started(&mut self, result: Result<(), BridgeError>) {
        if self.bridge_state != BridgeState::Starting {
            debug!("bridge start answer outside of startup ignored");
            return;
        }
        match result {
            Ok(()) => {
                let stop_requested = self
                    .end_op
                    .as_ref()
                    .is_some_and(|op| op.counter.bridge_pending());
                if stop_requested {
                    // The end round began while the bridge was still
                    // starting; stop it now that it is up.
                    self.spawn_bridge_stop();
                } else {
                    self.bridge_state = BridgeState::Running;
                    info!("system tracing bridge started");
                }
            }
            Err(e) => {
                warn!(%e, "system tracing bridge failed to start; recording continues without it");
                self.bridge_state = BridgeState::Off;
                self.apply_sink_ack(OpKind::EndRecording, AckSource::Bridge);
            }
        }
    }

    fn bridge_stopped(&mut self, result: Result<SystemTracePayload, BridgeError>) {
        self.bridge_state = BridgeState::Off;
        match result {
            Ok(payload) => {
                if let Some(op) = self
                    .end_op
                    .as_ref()
                    .filter(|op| op.counter.bridge_pending())
                {
                    op.sink.write_system_trace(payload);
                }
                self.apply_sink_ack(OpKind::EndRecording, AckSource::Bridge);
            }
            Err(e) => {
                error!(
                    %e,
                    "system tracing bridge failed to stop; the end-recording round cannot complete"
                );
            }
        }
    }

    fn finalize(&mut self, kind: OpKind) {
        let Some(op) = self.op_slot(kind).take() else {
            return;
        };
        if kind == OpKind::EndRecording {
            self.session.end();
        }
        let PendingOp {
            sink,
            completion,
            categories: harvested,
            counter: _,
        } = op;
        self.known_categories.extend(harvested);
        let categories = self.known_categories.clone();
        info!(%kind, "fan-in complete; closing sink");

        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let path = sink.close().await;
            let _ = tx.send(Command::SinkClosed {
                kind,
                path,
                completion,
                categories,
            });
        });
    }

    fn sink_closed(
        &mut self,
        kind: OpKind,
        path: PathBuf,
        completion: OpCompletion,
        categories: BTreeSet<String>,
    ) {
        info!(%kind, path = %path.display(), "operation complete");
        match completion {
            OpCompletion::File(on_complete) => on_complete(path),
            OpCompletion::Categories(on_result) => on_result(categories),
        }
    }
}

fn sink_for(path: &Path) -> TraceSink {
    if path.as_os_str().is_empty() {
        TraceSink::discard()
    } else {
        TraceSink::spawn(path.to_path_buf())
    }
}
