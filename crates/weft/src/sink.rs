use std::path::PathBuf;

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;
use weft_types::{EventsJson, SystemTracePayload};

enum SinkCmd {
    Write(EventsJson),
    SystemTrace(SystemTracePayload),
    Close(oneshot::Sender<PathBuf>),
}

/// Sequential assembler for one output artifact.
///
/// All writes for a sink funnel through one private task in send order, so
/// interleaved deliveries from different ack handlers never race on the
/// file. Once closed the file is never reopened or re-written.
///
/// A sink whose file cannot be created degrades to a no-op: writes are
/// accepted and dropped, and `close` still answers with the path so the
/// completion callback of the owning operation fires exactly once.
pub struct TraceSink {
    tx: mpsc::UnboundedSender<SinkCmd>,
}

impl TraceSink {
    pub fn spawn(path: PathBuf) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(sink_task(path, rx));
        Self { tx }
    }

    /// Sink that produces no artifact at all; used by the transient
    /// category-harvest round.
    pub fn discard() -> Self {
        Self::spawn(PathBuf::new())
    }

    pub fn write(&self, events: EventsJson) {
        if events.is_empty() {
            return;
        }
        let _ = self.tx.send(SinkCmd::Write(events));
    }

    pub fn write_system_trace(&self, payload: SystemTracePayload) {
        let _ = self.tx.send(SinkCmd::SystemTrace(payload));
    }

    pub async fn close(self) -> PathBuf {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(SinkCmd::Close(reply_tx)).is_err() {
            return PathBuf::new();
        }
        reply_rx.await.unwrap_or_default()
    }
}

async fn sink_task(path: PathBuf, mut rx: mpsc::UnboundedReceiver<SinkCmd>) {
    let mut file = if path.as_os_str().is_empty() {
        None
    } else {
        match File::create(&path).await {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(path = %path.display(), %e, "failed to create trace file; sink degrades to no-op");
                None
            }
        }
    };

    if let Some(f) = file.as_mut() {
        if let Err(e) = f.write_all(b"{\"traceEvents\": [").await {
            warn!(path = %path.display(), %e, "trace file write failed; sink degrades to no-op");
            file = None;
        }
    }

    let mut wrote_any_chunk = false;
    let mut system_trace: Option<SystemTracePayload> = None;

    while let Some(cmd) = rx.recv().await {
        match cmd {
            SinkCmd::Write(events) => {
                let Some(f) = file.as_mut() else { continue };
                let result = write_chunk(f, &events, wrote_any_chunk).await;
                match result {
                    Ok(()) => wrote_any_chunk = true,
                    Err(e) => {
                        warn!(path = %path.display(), %e, "trace file write failed; sink degrades to no-op");
                        file = None;
                    }
                }
            }
            SinkCmd::SystemTrace(payload) => system_trace = Some(payload),
            SinkCmd::Close(reply) => {
                if let Some(f) = file.as_mut() {
                    if let Err(e) = finish_file(f, system_trace.take()).await {
                        warn!(path = %path.display(), %e, "failed to finalize trace file");
                    }
                }
                let _ = reply.send(path.clone());
                return;
            }
        }
    }
}

async fn write_chunk(
    file: &mut File,
    events: &EventsJson,
    wrote_any_chunk: bool,
) -> std::io::Result<()> {
    if wrote_any_chunk {
        file.write_all(b",").await?;
    }
    file.write_all(events.as_str().as_bytes()).await
}

async fn finish_file(
    file: &mut File,
    system_trace: Option<SystemTracePayload>,
) -> std::io::Result<()> {
    file.write_all(b"]").await?;
    if let Some(payload) = system_trace {
        file.write_all(b", \"systemTraceEvents\": ").await?;
        match payload {
            SystemTracePayload::Json(raw) => file.write_all(raw.as_bytes()).await?,
            SystemTracePayload::Text(text) => {
                let escaped = serde_json::Value::String(text).to_string();
                file.write_all(escaped.as_bytes()).await?;
            }
        }
    }
    file.write_all(b"}").await?;
    file.flush().await
}
