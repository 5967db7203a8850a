//! Checkpoint protocol: suspended nodes and how they resume.
//!
//! A node in `checkpoint` status has at most one live entry here. The
//! entry is removed on resume or rejection; the conversation is also
//! persisted in the task row, so approval still works after a process
//! restart even though this map is process-scoped.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::llm::ChatMessage;
use crate::task::TaskId;

/// Why a node suspended and handed control back to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckpointReason {
    /// A planner produced its first plan; approve before any subtask spends
    PlanReady,
    /// The latest response hedged; the operator should redirect
    Uncertainty,
    /// The node is close to a resource limit
    ApproachingLimit,
}

impl CheckpointReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointReason::PlanReady => "plan-ready",
            CheckpointReason::Uncertainty => "uncertainty",
            CheckpointReason::ApproachingLimit => "approaching-limit",
        }
    }
}

impl std::fmt::Display for CheckpointReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conversation state preserved for one suspended node.
///
/// The reasoning service has no memory of its own between calls, so the
/// turns captured here must be restored verbatim on resume.
#[derive(Debug, Clone)]
pub struct PendingCheckpoint {
    pub conversation: Vec<ChatMessage>,
    /// Budget not yet spent at suspension time, in nanodollars
    pub remaining_nanos: u64,
    pub reason: CheckpointReason,
}

/// Process-scoped map of suspended nodes, keyed by task id.
#[derive(Default)]
pub struct PendingCheckpoints {
    inner: Mutex<HashMap<TaskId, PendingCheckpoint>>,
}

impl PendingCheckpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a suspension, replacing any previous entry for the node.
    pub async fn insert(&self, task_id: TaskId, checkpoint: PendingCheckpoint) {
        self.inner.lock().await.insert(task_id, checkpoint);
    }

    /// Remove and return the entry for a node, if any.
    pub async fn take(&self, task_id: &TaskId) -> Option<PendingCheckpoint> {
        self.inner.lock().await.remove(task_id)
    }

    pub async fn contains(&self, task_id: &TaskId) -> bool {
        self.inner.lock().await.contains_key(task_id)
    }
}

/// Pluggable predicate deciding whether response text warrants an
/// uncertainty checkpoint.
pub type UncertaintyDetector = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// The default phrase-based detector.
pub fn default_uncertainty_detector() -> UncertaintyDetector {
    const MARKERS: &[&str] = &[
        "i'm not sure",
        "i'm unsure",
        "this could go either way",
        "do you want me to",
        "should i proceed",
        "before i continue",
        "a few options",
        "which approach",
        "let me know if",
        "would you prefer",
    ];

    Arc::new(|text: &str| {
        let lower = text.to_lowercase();
        MARKERS.iter().any(|marker| lower.contains(marker))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;

    #[tokio::test]
    async fn take_removes_the_entry() {
        let checkpoints = PendingCheckpoints::new();
        let id = TaskId::new();

        checkpoints
            .insert(
                id,
                PendingCheckpoint {
                    conversation: vec![ChatMessage::new(Role::User, "task")],
                    remaining_nanos: 100,
                    reason: CheckpointReason::PlanReady,
                },
            )
            .await;

        assert!(checkpoints.contains(&id).await);
        let entry = checkpoints.take(&id).await.unwrap();
        assert_eq!(entry.conversation.len(), 1);
        assert_eq!(entry.reason, CheckpointReason::PlanReady);

        // A second take is a miss, not a double transition
        assert!(checkpoints.take(&id).await.is_none());
    }

    #[test]
    fn detector_matches_hedging_phrases() {
        let detect = default_uncertainty_detector();
        assert!(detect("I'm not sure this is the right dataset."));
        assert!(detect("Should I proceed with deleting the old files?"));
        assert!(detect("There are a few options here: ..."));
        assert!(!detect("Done. Wrote the summary to notes/summary.md."));
    }

    #[test]
    fn reason_strings_are_kebab_case() {
        assert_eq!(CheckpointReason::PlanReady.as_str(), "plan-ready");
        assert_eq!(CheckpointReason::Uncertainty.as_str(), "uncertainty");
        assert_eq!(
            CheckpointReason::ApproachingLimit.as_str(),
            "approaching-limit"
        );
    }
}
