//! Progress reporting: a non-blocking event bus. Publishing never
//! fails and never affects correctness — it exists purely so a CLI or TUI
//! can render what the engine is doing.

use mdfeed_db::models::TaskType;
use tokio::sync::mpsc;

/// A named phase of the planning/execution state machine, used to group
/// `PHASE_START`/`PHASE_END` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Planning,
    System,
    Business,
    Flushing,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::System => "system",
            Self::Business => "business",
            Self::Flushing => "flushing",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reportable occurrence. Event order is preserved within a phase; the
/// engine never blocks on, or changes behavior because of, delivery.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    PhaseStart { phase: Phase, total: Option<usize> },
    PhaseEnd { phase: Phase },
    TaskStart { task_id: uuid::Uuid, symbol: Option<String> },
    TaskComplete { task_id: uuid::Uuid, count: usize },
    TaskFailed { task_id: uuid::Uuid, symbol: Option<String>, count: usize, reason: String },
    BatchComplete { task_type: TaskType, count: usize },
    UpdateTotal { total: usize, phase: Option<Phase> },
    Message { text: String },
}

/// The publishing half, cheaply cloned and handed to every producer and
/// consumer worker.
#[derive(Clone)]
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ProgressSink {
    /// Publish is fire-and-forget: a closed receiver (no subscriber
    /// attached) is not an error.
    pub fn publish(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }

    pub fn phase_start(&self, phase: Phase, total: Option<usize>) {
        self.publish(ProgressEvent::PhaseStart { phase, total });
    }

    pub fn phase_end(&self, phase: Phase) {
        self.publish(ProgressEvent::PhaseEnd { phase });
    }

    pub fn message(&self, text: impl Into<String>) {
        self.publish(ProgressEvent::Message { text: text.into() });
    }
}

/// The subscribing half. A single background task drains this and renders
/// or logs events; dropping it simply stops delivery, it never blocks a
/// publisher.
pub struct ProgressStream {
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
}

impl ProgressStream {
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }
}

/// Build a fresh sink/stream pair. One stream should exist per run; the
/// sink is cloned freely.
pub fn channel() -> (ProgressSink, ProgressStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ProgressSink { tx }, ProgressStream { rx })
}

/// Drain a stream to `tracing` at info level, the default delivery worker
/// used when no richer UI is attached.
pub async fn log_delivery_worker(mut stream: ProgressStream) {
    while let Some(event) = stream.recv().await {
        match event {
            ProgressEvent::PhaseStart { phase, total } => {
                tracing::info!(%phase, total = ?total, "phase started");
            }
            ProgressEvent::PhaseEnd { phase } => {
                tracing::info!(%phase, "phase ended");
            }
            ProgressEvent::TaskStart { task_id, symbol } => {
                tracing::debug!(%task_id, symbol = ?symbol, "task started");
            }
            ProgressEvent::TaskComplete { task_id, count } => {
                tracing::debug!(%task_id, count, "task completed");
            }
            ProgressEvent::TaskFailed { task_id, symbol, count, reason } => {
                tracing::warn!(%task_id, symbol = ?symbol, count, reason, "task failed");
            }
            ProgressEvent::BatchComplete { task_type, count } => {
                tracing::debug!(%task_type, count, "batch flushed");
            }
            ProgressEvent::UpdateTotal { total, phase } => {
                tracing::info!(total, phase = ?phase.map(|p| p.to_string()), "total updated");
            }
            ProgressEvent::Message { text } => {
                tracing::info!("{text}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let (sink, mut stream) = channel();
        sink.phase_start(Phase::Planning, Some(3));
        sink.message("hello");
        sink.phase_end(Phase::Planning);
        drop(sink);

        assert!(matches!(stream.recv().await, Some(ProgressEvent::PhaseStart { .. })));
        assert!(matches!(stream.recv().await, Some(ProgressEvent::Message { .. })));
        assert!(matches!(stream.recv().await, Some(ProgressEvent::PhaseEnd { .. })));
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn publishing_after_the_stream_is_dropped_does_not_panic() {
        let (sink, stream) = channel();
        drop(stream);
        sink.message("nobody is listening");
    }
}
