//! Fire-and-forget progress notifications.
//!
//! The engine emits one event kind: a delegated subtask reaching a
//! terminal state. Sinks exist for real-time visibility, not correctness;
//! a sink failure must never fail the engine, so the trait returns nothing
//! and implementations swallow their own errors.

use async_trait::async_trait;

use crate::task::TaskId;
use crate::util::fmt_usd;

/// Progress event emitted by the engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A delegated child reached a terminal state.
    SubtaskCompleted {
        task_id: TaskId,
        /// Truncated child description
        description: String,
        /// Final child cost in nanodollars
        cost_nanos: u64,
        /// Terminal status string (`completed` / `failed` / `stalled`)
        status: String,
    },
}

/// Sink for engine progress events.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, event: EngineEvent);
}

/// Default sink: logs events via `tracing`.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, event: EngineEvent) {
        match event {
            EngineEvent::SubtaskCompleted {
                task_id,
                description,
                cost_nanos,
                status,
            } => {
                tracing::info!(
                    task_id = %task_id,
                    status = %status,
                    cost = %fmt_usd(cost_nanos),
                    "Subtask done: {}",
                    description
                );
            }
        }
    }
}
