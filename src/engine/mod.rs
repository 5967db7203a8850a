//! The delegation engine.
//!
//! Owns the task tree: decides whether a submitted task plans or works,
//! enforces depth/budget/fan-out limits, runs the execution loop for every
//! node, cascades child costs to ancestors, and drives the checkpoint
//! protocol. The loop's tool dispatch calls back into the engine only for
//! the delegation tool, so the mutual recursion stays inside this module.

mod checkpoint;
mod recovery;
mod run_loop;

pub use checkpoint::{
    default_uncertainty_detector, CheckpointReason, PendingCheckpoint, PendingCheckpoints,
    UncertaintyDetector,
};
pub use recovery::{run_recovery_sweep, RECOVERY_DIAGNOSTIC};
pub use run_loop::NodeOutcome;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::classifier::Classifier;
use crate::config::Config;
use crate::llm::{FunctionDefinition, LlmClient, ToolDefinition};
use crate::notify::{EngineEvent, NotificationSink};
use crate::task::{NewTask, RepoError, Task, TaskId, TaskRepository, TaskRole, TaskStatus};
use crate::tools::ToolRegistry;
use crate::util::{fmt_usd, nanos_from_usd, truncate_chars, truncate_with_note};

use run_loop::NodeSpec;

/// Tool name the reasoning service uses to spawn a child node.
pub(crate) const DELEGATE_TOOL: &str = "delegate_task";

/// Error recorded when the operator rejects a checkpoint.
pub const REJECTION_MESSAGE: &str = "Checkpoint rejected by user";

/// Characters of a child result reported into the parent conversation.
const SUBTASK_SUMMARY_LIMIT: usize = 500;

/// Phrases in a description that signal decomposable work.
const DECOMPOSITION_SIGNALS: &[&str] = &[
    "go through all",
    "all chapters",
    "every chapter",
    "each chapter",
    "run experiments",
    "step by step",
    "break down",
    "full pipeline",
];

/// Errors surfaced by the engine's public operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("no pending checkpoint for task {0}")]
    CheckpointNotFound(TaskId),

    #[error("stored checkpoint is corrupt: {0}")]
    CorruptCheckpoint(String),

    #[error(transparent)]
    Repo(#[from] RepoError),
}

/// What a submit/resume call hands back to the surface layer.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_reason: Option<CheckpointReason>,
}

impl TaskReport {
    fn from_outcome(task_id: TaskId, outcome: &NodeOutcome) -> Self {
        let checkpoint_reason = match outcome {
            NodeOutcome::Checkpoint { reason, .. } => Some(*reason),
            _ => None,
        };
        Self {
            task_id,
            status: outcome.status(),
            response: outcome.text().to_string(),
            checkpoint_reason,
        }
    }
}

/// Queue and spend counters for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub queued: usize,
    pub in_progress: usize,
    pub daily_cost_nanos: u64,
    pub monthly_cost_nanos: u64,
}

/// Arguments of a `delegate_task` tool call.
#[derive(Debug, Deserialize)]
struct DelegateArgs {
    task_description: String,
    expected_output: String,
    budget_usd: f64,
    #[serde(default)]
    context_files: Vec<String>,
}

/// The delegation engine. One instance drives all task trees.
pub struct Engine {
    config: Config,
    repo: Arc<dyn TaskRepository>,
    llm: Arc<dyn LlmClient>,
    classifier: Arc<dyn Classifier>,
    tools: Arc<ToolRegistry>,
    notifier: Arc<dyn NotificationSink>,
    checkpoints: PendingCheckpoints,
    uncertainty: UncertaintyDetector,
}

impl Engine {
    pub fn new(
        config: Config,
        repo: Arc<dyn TaskRepository>,
        llm: Arc<dyn LlmClient>,
        classifier: Arc<dyn Classifier>,
        tools: Arc<ToolRegistry>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            config,
            repo,
            llm,
            classifier,
            tools,
            notifier,
            checkpoints: PendingCheckpoints::new(),
            uncertainty: default_uncertainty_detector(),
        }
    }

    /// Swap the uncertainty heuristic for another predicate.
    pub fn with_uncertainty_detector(mut self, detector: UncertaintyDetector) -> Self {
        self.uncertainty = detector;
        self
    }

    /// Submit a task and drive it to its first outcome.
    ///
    /// An explicit `requested_budget` (nanodollars) wins over a `$N` prefix
    /// in the description; both are clamped to the configured root range.
    pub async fn submit(
        &self,
        description: &str,
        requested_budget: Option<u64>,
    ) -> Result<TaskReport, EngineError> {
        let (parsed_budget, cleaned) = parse_budget_prefix(description);
        let budget = requested_budget
            .or(parsed_budget)
            .unwrap_or(self.config.default_task_budget)
            .clamp(self.config.min_subtask_budget, self.config.max_task_budget);

        let role = self.decide_role(cleaned, budget);
        let task = self
            .repo
            .create_task(NewTask::root(
                cleaned,
                role,
                budget,
                self.config.max_steps_for_depth(0),
            ))
            .await?;

        tracing::info!(
            task_id = %task.id,
            role = role.as_str(),
            budget = %fmt_usd(budget),
            "Task submitted"
        );

        let outcome = self
            .run_node(NodeSpec {
                task_id: task.id,
                description: cleaned.to_string(),
                depth: 0,
                budget_nanos: budget,
                role,
                resume_conversation: None,
                context_files: Vec::new(),
            })
            .await;

        Ok(TaskReport::from_outcome(task.id, &outcome))
    }

    /// Approve a checkpoint: resume the node with its preserved turns.
    ///
    /// The in-memory entry is preferred; after a restart the conversation
    /// snapshot stored on the task row is used instead.
    pub async fn resume(&self, task_id: &TaskId) -> Result<TaskReport, EngineError> {
        let task = self
            .repo
            .get_task(task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(*task_id))?;
        if task.status != TaskStatus::Checkpoint {
            return Err(EngineError::CheckpointNotFound(*task_id));
        }

        let conversation = match self.checkpoints.take(task_id).await {
            Some(pending) => pending.conversation,
            None => {
                let snapshot = self
                    .repo
                    .load_conversation(task_id)
                    .await?
                    .ok_or(EngineError::CheckpointNotFound(*task_id))?;
                serde_json::from_str(&snapshot)
                    .map_err(|e| EngineError::CorruptCheckpoint(e.to_string()))?
            }
        };

        tracing::info!(task_id = %task_id, "Checkpoint approved, resuming");

        let outcome = self
            .run_node(NodeSpec {
                task_id: *task_id,
                description: task.description.clone(),
                depth: task.depth,
                budget_nanos: task.budget_nanos,
                role: task.role,
                resume_conversation: Some(conversation),
                context_files: Vec::new(),
            })
            .await;

        Ok(TaskReport::from_outcome(*task_id, &outcome))
    }

    /// Reject a checkpoint. Terminal: the node fails and cannot be resumed.
    pub async fn reject(&self, task_id: &TaskId) -> Result<(), EngineError> {
        let task = self
            .repo
            .get_task(task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(*task_id))?;
        if task.status != TaskStatus::Checkpoint {
            return Err(EngineError::CheckpointNotFound(*task_id));
        }

        self.checkpoints.take(task_id).await;
        self.repo
            .update_status(task_id, TaskStatus::Failed, None, Some(REJECTION_MESSAGE))
            .await?;
        self.repo.save_conversation(task_id, None).await?;

        tracing::info!(task_id = %task_id, "Checkpoint rejected, task failed");
        Ok(())
    }

    /// Fail nodes stranded `in_progress` by a crash. Run once at startup.
    pub async fn recover_interrupted(&self) -> Result<Vec<Task>, EngineError> {
        Ok(run_recovery_sweep(self.repo.as_ref()).await?)
    }

    pub async fn task(&self, task_id: &TaskId) -> Result<Option<Task>, EngineError> {
        Ok(self.repo.get_task(task_id).await?)
    }

    pub async fn active_tasks(&self) -> Result<Vec<Task>, EngineError> {
        Ok(self.repo.list_active().await?)
    }

    pub async fn status_summary(&self) -> Result<StatusSummary, EngineError> {
        let active = self.repo.list_active().await?;
        Ok(StatusSummary {
            queued: active
                .iter()
                .filter(|t| t.status == TaskStatus::Queued)
                .count(),
            in_progress: active
                .iter()
                .filter(|t| t.status == TaskStatus::InProgress)
                .count(),
            daily_cost_nanos: self.repo.daily_cost().await?,
            monthly_cost_nanos: self.repo.monthly_cost().await?,
        })
    }

    /// Planner when the budget says the task is worth decomposing, the text
    /// signals decomposable work, or the description is long enough that a
    /// single worker pass is unlikely to cover it.
    pub(crate) fn decide_role(&self, description: &str, budget_nanos: u64) -> TaskRole {
        let lower = description.to_lowercase();
        if budget_nanos > self.config.planner_budget_threshold
            || DECOMPOSITION_SIGNALS.iter().any(|s| lower.contains(s))
            || description.chars().count() > self.config.planner_length_threshold
        {
            TaskRole::Planner
        } else {
            TaskRole::Worker
        }
    }

    /// Handle a `delegate_task` tool call from inside the execution loop.
    ///
    /// Every rejection is a descriptive string, not a fault - the
    /// reasoning service must see it and adapt its plan. On success the
    /// child runs to a terminal state, its cost cascades to every ancestor
    /// exactly once, and a truncated summary goes back into the parent
    /// conversation.
    pub(crate) async fn delegate(
        &self,
        parent_id: TaskId,
        parent_depth: u8,
        arguments: &str,
    ) -> String {
        let args: DelegateArgs = match serde_json::from_str(arguments) {
            Ok(args) => args,
            Err(e) => return format!("Error: invalid delegate_task arguments: {}", e),
        };

        let child_depth = parent_depth + 1;
        if child_depth > self.config.max_delegation_depth {
            return format!(
                "Error: Max delegation depth ({}) reached. Execute directly instead.",
                self.config.max_delegation_depth
            );
        }

        let count = match self.repo.subtask_count(&parent_id).await {
            Ok(count) => count,
            Err(e) => return format!("Error: {}", e),
        };
        if count >= self.config.max_subtasks_per_task {
            return format!(
                "Error: Max subtask limit ({}) reached for this task.",
                self.config.max_subtasks_per_task
            );
        }

        // Remaining budget always comes from the latest persisted spend.
        let parent = match self.repo.get_task(&parent_id).await {
            Ok(Some(parent)) => parent,
            Ok(None) => return "Error: parent task not found".to_string(),
            Err(e) => return format!("Error: {}", e),
        };
        let remaining = parent.remaining_budget();

        let budget = nanos_from_usd(args.budget_usd)
            .max(self.config.min_subtask_budget)
            .min(self.config.max_subtask_budget)
            .min(remaining);
        if budget < self.config.min_subtask_budget {
            return format!(
                "Error: Insufficient budget remaining ({}).",
                fmt_usd(remaining)
            );
        }

        let full_description = format!(
            "{}\n\nExpected output: {}",
            args.task_description, args.expected_output
        );

        let child = match self
            .repo
            .create_task(NewTask::child(
                full_description.clone(),
                parent_id,
                parent_depth,
                budget,
                self.config.max_steps_for_depth(child_depth),
            ))
            .await
        {
            Ok(child) => child,
            Err(e) => return format!("Error: {}", e),
        };

        tracing::info!(
            task_id = %child.id,
            parent_id = %parent_id,
            depth = child_depth,
            budget = %fmt_usd(budget),
            "Delegating subtask"
        );

        let outcome = self
            .run_node(NodeSpec {
                task_id: child.id,
                description: full_description,
                depth: child_depth,
                budget_nanos: budget,
                role: TaskRole::Worker,
                resume_conversation: None,
                context_files: args.context_files,
            })
            .await;

        // Cascade exactly once, after the terminal state, strictly before
        // the result is reported into the parent conversation.
        let child_cost = match self.repo.get_task(&child.id).await {
            Ok(Some(task)) => task.cost_nanos,
            _ => 0,
        };
        if let Err(e) = self.repo.cascade_cost(&child.id, child_cost).await {
            tracing::error!(task_id = %child.id, "Cost cascade failed: {}", e);
        }

        self.notifier
            .notify(EngineEvent::SubtaskCompleted {
                task_id: child.id,
                description: truncate_chars(&args.task_description, 100),
                cost_nanos: child_cost,
                status: outcome.status().as_str().to_string(),
            })
            .await;

        let response = if outcome.text().is_empty() {
            "(no output)".to_string()
        } else {
            truncate_with_note(outcome.text(), SUBTASK_SUMMARY_LIMIT, 50)
        };
        let status_prefix = match outcome.status() {
            TaskStatus::Completed => String::new(),
            other => format!("[{}] ", other),
        };

        format!(
            "{}Subtask result ({}):\n{}",
            status_prefix,
            fmt_usd(child_cost),
            response
        )
    }
}

/// Parse an optional leading `$N` price tag from a task description.
///
/// Returns the budget in nanodollars and the remaining description. The
/// parsed amount is raw - clamping to the configured range is the
/// caller's job.
pub fn parse_budget_prefix(description: &str) -> (Option<u64>, &str) {
    let trimmed = description.trim_start();
    let Some(rest) = trimmed.strip_prefix('$') else {
        return (None, description);
    };
    let token: String = rest.chars().take_while(|c| !c.is_whitespace()).collect();
    match token.parse::<f64>() {
        Ok(usd) if usd > 0.0 && usd.is_finite() => {
            let remainder = rest[token.len()..].trim_start();
            (Some(nanos_from_usd(usd)), remainder)
        }
        _ => (None, description),
    }
}

/// Tool definition for `delegate_task`, appended to the visible tool set
/// at depths that may still spawn children.
pub(crate) fn delegate_tool_definition() -> ToolDefinition {
    ToolDefinition {
        tool_type: "function".to_string(),
        function: FunctionDefinition {
            name: DELEGATE_TOOL.to_string(),
            description: "Delegate a focused subtask to a sub-agent. The sub-agent runs \
                          independently with its own tools and returns only its result. Use this \
                          to decompose work. Each subtask must be self-contained - the sub-agent \
                          has NO memory of this conversation."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "task_description": {
                        "type": "string",
                        "description": "Clear, specific description. Include all needed context (file paths, section names, requirements). The sub-agent knows nothing else."
                    },
                    "expected_output": {
                        "type": "string",
                        "description": "What the result should look like. E.g., 'A 500-word draft saved to chapters/methods.md' or 'Summary of key findings from data/results.csv'"
                    },
                    "budget_usd": {
                        "type": "number",
                        "description": "Max budget in USD. Typical: $0.03 for reads, $0.10 for analysis, $0.50 for writing tasks."
                    },
                    "context_files": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Optional file paths (relative to the workspace) the sub-agent should read before starting. Provide paths instead of pasting content."
                    }
                },
                "required": ["task_description", "expected_output", "budget_usd"]
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use crate::classifier::{Classification, Tier};
    use crate::llm::{ChatMessage, ChatResponse, FunctionCall, Role, TokenUsage, ToolCall};
    use crate::notify::LogSink;
    use crate::task::SqliteTaskRepository;

    const MODEL: &str = "anthropic/claude-sonnet-4.5";

    /// Client that replays a fixed script of responses.
    struct ScriptedLlm {
        script: Mutex<VecDeque<ChatResponse>>,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<ChatResponse>) -> Self {
            Self {
                script: Mutex::new(responses.into()),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn chat_completion(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
            _tools: Option<&[crate::llm::ToolDefinition]>,
        ) -> anyhow::Result<ChatResponse> {
            self.script
                .lock()
                .await
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("scripted client exhausted"))
        }
    }

    /// Classifier that never touches the network.
    struct StaticClassifier;

    #[async_trait]
    impl Classifier for StaticClassifier {
        async fn classify(&self, _description: &str) -> Classification {
            self.classification_for(Tier::Standard)
        }

        fn classification_for(&self, tier: Tier) -> Classification {
            Classification {
                model: MODEL.to_string(),
                tier,
                max_input_tokens: tier.input_ceiling(),
                max_output_tokens: tier.output_ceiling(),
            }
        }
    }

    fn text_response(text: &str, input: u64, output: u64) -> ChatResponse {
        ChatResponse {
            content: Some(text.to_string()),
            tool_calls: None,
            finish_reason: Some("stop".to_string()),
            usage: Some(TokenUsage::new(input, output)),
            model: None,
        }
    }

    fn tool_response(
        text: Option<&str>,
        name: &str,
        args: serde_json::Value,
        input: u64,
        output: u64,
    ) -> ChatResponse {
        ChatResponse {
            content: text.map(|t| t.to_string()),
            tool_calls: Some(vec![ToolCall {
                id: format!("call_{}", name),
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: name.to_string(),
                    arguments: args.to_string(),
                },
            }]),
            finish_reason: Some("tool_calls".to_string()),
            usage: Some(TokenUsage::new(input, output)),
            model: None,
        }
    }

    fn engine_with(script: Vec<ChatResponse>) -> (Engine, Arc<SqliteTaskRepository>) {
        let repo = Arc::new(SqliteTaskRepository::open_in_memory().unwrap());
        let config = Config::new("test-key".to_string(), std::env::temp_dir());
        let engine = Engine::new(
            config,
            repo.clone(),
            Arc::new(ScriptedLlm::new(script)),
            Arc::new(StaticClassifier),
            Arc::new(ToolRegistry::empty()),
            Arc::new(LogSink),
        );
        (engine, repo)
    }

    fn delegate_args(budget_usd: f64) -> serde_json::Value {
        serde_json::json!({
            "task_description": "draft section 1",
            "expected_output": "a finished draft",
            "budget_usd": budget_usd,
        })
    }

    // --- budget prefix parsing ---

    #[test]
    fn budget_prefix_parses_and_strips() {
        let (budget, rest) = parse_budget_prefix("$0.50 summarize chapter 3");
        assert_eq!(budget, Some(500_000_000));
        assert_eq!(rest, "summarize chapter 3");

        let (budget, rest) = parse_budget_prefix("  $1.25  trailing spaces");
        assert_eq!(budget, Some(1_250_000_000));
        assert_eq!(rest, "trailing spaces");
    }

    #[test]
    fn budget_prefix_absent_or_garbage_passes_through() {
        let (budget, rest) = parse_budget_prefix("summarize chapter 3");
        assert_eq!(budget, None);
        assert_eq!(rest, "summarize chapter 3");

        let (budget, rest) = parse_budget_prefix("$abc not a number");
        assert_eq!(budget, None);
        assert_eq!(rest, "$abc not a number");

        let (budget, _) = parse_budget_prefix("$-2 nice try");
        assert_eq!(budget, None);
    }

    #[test]
    fn budget_prefix_with_no_task_text() {
        let (budget, rest) = parse_budget_prefix("$5");
        assert_eq!(budget, Some(5_000_000_000));
        assert_eq!(rest, "");
    }

    // --- role decision ---

    #[test]
    fn role_decision_follows_budget_signals_and_length() {
        let (engine, _) = engine_with(vec![]);

        assert_eq!(
            engine.decide_role("summarize chapter 3", 500_000_000),
            TaskRole::Worker
        );
        // Budget above the threshold
        assert_eq!(
            engine.decide_role("summarize chapter 3", 5_000_000_000),
            TaskRole::Planner
        );
        // Decomposition signal
        assert_eq!(
            engine.decide_role("run experiments on the new data", 1_000_000_000),
            TaskRole::Planner
        );
        // Length threshold
        let long = "x".repeat(300);
        assert_eq!(engine.decide_role(&long, 1_000_000_000), TaskRole::Planner);
    }

    // --- worker flow ---

    #[tokio::test]
    async fn worker_submit_completes_within_budget() {
        let (engine, repo) = engine_with(vec![text_response("Chapter 3 covers X.", 1000, 200)]);

        let report = engine.submit("$0.50 summarize chapter 3", None).await.unwrap();
        assert_eq!(report.status, TaskStatus::Completed);
        assert_eq!(report.response, "Chapter 3 covers X.");
        assert!(report.checkpoint_reason.is_none());

        let task = repo.get_task(&report.task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.role, TaskRole::Worker);
        assert_eq!(task.depth, 0);
        assert_eq!(task.budget_nanos, 500_000_000);
        assert_eq!(task.step_count, 1);
        assert_eq!(task.result.as_deref(), Some("Chapter 3 covers X."));
        // 1000 in * 3000 + 200 out * 15000
        assert_eq!(task.cost_nanos, 6_000_000);
        assert!(task.cost_nanos <= task.budget_nanos);

        // Completed root tasks leave a session memory behind
        let memories = repo.recent_session_memories(5).await.unwrap();
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].task_id, task.id);
    }

    #[tokio::test]
    async fn oversized_budget_is_clamped_to_root_ceiling() {
        let (engine, repo) = engine_with(vec![text_response("plan text", 10, 10)]);
        let report = engine.submit("$99 audit everything", None).await.unwrap();
        let task = repo.get_task(&report.task_id).await.unwrap().unwrap();
        assert_eq!(task.budget_nanos, 15_000_000_000);
    }

    #[tokio::test]
    async fn llm_fault_fails_the_node_without_retry() {
        let (engine, repo) = engine_with(vec![]);
        let report = engine.submit("$0.50 summarize chapter 3", None).await.unwrap();

        assert_eq!(report.status, TaskStatus::Failed);
        assert!(report.response.contains("scripted client exhausted"));

        let task = repo.get_task(&report.task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("scripted client exhausted"));
    }

    // --- planner flow ---

    #[tokio::test]
    async fn planner_first_response_with_tools_checkpoints_before_spending() {
        let (engine, repo) = engine_with(vec![tool_response(
            Some("Plan: draft each section separately."),
            DELEGATE_TOOL,
            delegate_args(1.0),
            500,
            100,
        )]);

        let report = engine
            .submit("$5 go through all chapters and run experiments", None)
            .await
            .unwrap();

        assert_eq!(report.status, TaskStatus::Checkpoint);
        assert_eq!(report.checkpoint_reason, Some(CheckpointReason::PlanReady));
        assert!(!report.response.is_empty());

        let task = repo.get_task(&report.task_id).await.unwrap().unwrap();
        assert_eq!(task.role, TaskRole::Planner);
        assert_eq!(task.status, TaskStatus::Checkpoint);

        // The plan was not executed: no child rows, no delegated spend
        assert_eq!(repo.subtask_count(&task.id).await.unwrap(), 0);

        // Conversation snapshot persisted for restart-safe approval
        let snapshot = repo.load_conversation(&task.id).await.unwrap().unwrap();
        let turns: Vec<ChatMessage> = serde_json::from_str(&snapshot).unwrap();
        assert_eq!(turns.last().unwrap().role, Role::Assistant);
        assert!(turns.last().unwrap().tool_calls.is_some());
        assert!(engine.checkpoints.contains(&task.id).await);
    }

    #[tokio::test]
    async fn approval_executes_the_plan_and_cascades_child_cost() {
        let (engine, repo) = engine_with(vec![
            // Planner step 1: the plan
            tool_response(
                Some("Plan: delegate section 1."),
                DELEGATE_TOOL,
                delegate_args(1.0),
                500,
                100,
            ),
            // Child worker: single text step
            text_response("Section 1 draft done.", 800, 300),
            // Planner after resume: wrap up
            text_response("All subtasks complete.", 600, 150),
        ]);

        let submitted = engine
            .submit("$5 go through all chapters and run experiments", None)
            .await
            .unwrap();
        assert_eq!(submitted.status, TaskStatus::Checkpoint);

        let resumed = engine.resume(&submitted.task_id).await.unwrap();
        assert_eq!(resumed.status, TaskStatus::Completed);
        assert_eq!(resumed.response, "All subtasks complete.");

        // Exactly one child, completed, with the requested budget
        let children = repo.children_of(&submitted.task_id).await.unwrap();
        assert_eq!(children.len(), 1);
        let child = &children[0];
        assert_eq!(child.status, TaskStatus::Completed);
        assert_eq!(child.depth, 1);
        assert_eq!(child.role, TaskRole::Worker);
        assert_eq!(child.budget_nanos, 1_000_000_000);
        // 800 in * 3000 + 300 out * 15000
        assert_eq!(child.cost_nanos, 6_900_000);

        // Parent spend = own two calls + cascaded child cost, exactly once
        let parent = repo.get_task(&submitted.task_id).await.unwrap().unwrap();
        let planner_calls = (500 * 3_000 + 100 * 15_000) + (600 * 3_000 + 150 * 15_000);
        assert_eq!(parent.cost_nanos, planner_calls + child.cost_nanos);

        // The checkpoint entry is consumed: a second approval misses
        assert!(matches!(
            engine.resume(&submitted.task_id).await,
            Err(EngineError::CheckpointNotFound(_))
        ));
    }

    #[tokio::test]
    async fn approval_survives_loss_of_the_in_memory_entry() {
        let (engine, _repo) = engine_with(vec![
            tool_response(Some("Plan."), DELEGATE_TOOL, delegate_args(0.5), 500, 100),
            text_response("child done", 100, 50),
            text_response("wrapped up", 100, 50),
        ]);

        let submitted = engine
            .submit("$5 go through all chapters and run experiments", None)
            .await
            .unwrap();

        // Simulate a restart: the process-scoped map is gone
        engine.checkpoints.take(&submitted.task_id).await;

        let resumed = engine.resume(&submitted.task_id).await.unwrap();
        assert_eq!(resumed.status, TaskStatus::Completed);
        assert_eq!(resumed.response, "wrapped up");
    }

    // --- uncertainty checkpoints ---

    #[tokio::test]
    async fn root_worker_uncertainty_checkpoints_after_tools_run() {
        let (engine, repo) = engine_with(vec![
            tool_response(
                Some("I'm not sure which approach fits. Should I proceed?"),
                "noop_tool",
                serde_json::json!({}),
                100,
                50,
            ),
            text_response("Done after guidance.", 100, 50),
        ]);

        let report = engine.submit("$0.50 tidy the data folder", None).await.unwrap();
        assert_eq!(report.status, TaskStatus::Checkpoint);
        assert_eq!(report.checkpoint_reason, Some(CheckpointReason::Uncertainty));

        // The tool ran before suspension, and its fault became result text
        let snapshot = repo.load_conversation(&report.task_id).await.unwrap().unwrap();
        let turns: Vec<ChatMessage> = serde_json::from_str(&snapshot).unwrap();
        assert_eq!(turns.len(), 3); // user, assistant, tool result
        assert_eq!(turns[2].role, Role::Tool);
        assert!(turns[2]
            .content
            .as_deref()
            .unwrap()
            .contains("Unknown tool 'noop_tool'"));

        let resumed = engine.resume(&report.task_id).await.unwrap();
        assert_eq!(resumed.status, TaskStatus::Completed);
        assert_eq!(resumed.response, "Done after guidance.");

        // The snapshot is cleared once the node completes
        assert!(repo.load_conversation(&report.task_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn re_checkpoint_keeps_every_earlier_turn() {
        let (engine, repo) = engine_with(vec![
            tool_response(
                Some("I'm not sure about the format."),
                "noop_tool",
                serde_json::json!({}),
                100,
                50,
            ),
            tool_response(
                Some("Still unsure - would you prefer CSV or JSON?"),
                "noop_tool",
                serde_json::json!({}),
                100,
                50,
            ),
            text_response("done", 10, 10),
        ]);

        let report = engine.submit("$0.50 export the table", None).await.unwrap();
        assert_eq!(report.status, TaskStatus::Checkpoint);
        let first: Vec<ChatMessage> = serde_json::from_str(
            &repo.load_conversation(&report.task_id).await.unwrap().unwrap(),
        )
        .unwrap();
        assert_eq!(first.len(), 3);

        let again = engine.resume(&report.task_id).await.unwrap();
        assert_eq!(again.status, TaskStatus::Checkpoint);
        let second: Vec<ChatMessage> = serde_json::from_str(
            &repo.load_conversation(&report.task_id).await.unwrap().unwrap(),
        )
        .unwrap();

        // Round-trip: the earlier turns are a strict prefix of the new ones
        assert_eq!(second.len(), 5);
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.role, b.role);
            assert_eq!(a.content, b.content);
        }
    }

    #[tokio::test]
    async fn delegated_children_never_raise_uncertainty_checkpoints() {
        // The hedging text comes from a depth-1 worker; it must complete,
        // not suspend.
        let (engine, repo) = engine_with(vec![
            tool_response(Some("Plan."), DELEGATE_TOOL, delegate_args(0.5), 100, 50),
            text_response("I'm not sure this is right, but here it is.", 100, 50),
            text_response("planner done", 100, 50),
        ]);

        let submitted = engine
            .submit("$5 go through all chapters and run experiments", None)
            .await
            .unwrap();
        let resumed = engine.resume(&submitted.task_id).await.unwrap();
        assert_eq!(resumed.status, TaskStatus::Completed);

        let children = repo.children_of(&submitted.task_id).await.unwrap();
        assert_eq!(children[0].status, TaskStatus::Completed);
    }

    // --- guard rails ---

    #[tokio::test]
    async fn budget_guard_stalls_the_node() {
        // One expensive call: 100k in * 3000 + 30k out * 15000 = $0.75 > $0.50
        let (engine, repo) = engine_with(vec![tool_response(
            None,
            "noop_tool",
            serde_json::json!({}),
            100_000,
            30_000,
        )]);

        let report = engine.submit("$0.50 summarize chapter 3", None).await.unwrap();
        assert_eq!(report.status, TaskStatus::Stalled);
        assert!(report.response.contains("budget"));

        let task = repo.get_task(&report.task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Stalled);
        assert_eq!(task.error.as_deref(), Some("Budget exceeded"));
        assert!(task.cost_nanos > task.budget_nanos);
    }

    #[tokio::test]
    async fn daily_guard_stalls_before_the_first_call() {
        let (engine, repo) = engine_with(vec![]);

        // Pre-existing spend today already beyond the $5 ceiling
        let sink = repo
            .create_task(NewTask::root("earlier", TaskRole::Worker, 15_000_000_000, 12))
            .await
            .unwrap();
        repo.log_cost(crate::task::CostLogEntry {
            task_id: sink.id,
            model: MODEL.to_string(),
            input_tokens: 1,
            output_tokens: 1,
            cost_nanos: 6_000_000_000,
        })
        .await
        .unwrap();

        let report = engine.submit("$0.50 summarize chapter 3", None).await.unwrap();
        assert_eq!(report.status, TaskStatus::Stalled);
        assert!(report.response.contains("Daily budget limit"));

        let task = repo.get_task(&report.task_id).await.unwrap().unwrap();
        assert_eq!(task.error.as_deref(), Some("Daily cost limit exceeded"));
    }

    // --- delegation limits ---

    #[tokio::test]
    async fn delegation_beyond_max_depth_is_rejected_with_text() {
        let (engine, repo) = engine_with(vec![]);
        let root = repo
            .create_task(NewTask::root("root", TaskRole::Planner, 5_000_000_000, 12))
            .await
            .unwrap();
        let deep = repo
            .create_task(NewTask::child("deep", root.id, 1, 500_000_000, 5))
            .await
            .unwrap();

        // deep is at depth 2 == MAX_DELEGATION_DEPTH; a child would exceed it
        let result = engine
            .delegate(deep.id, deep.depth, &delegate_args(0.1).to_string())
            .await;
        assert!(result.starts_with("Error: Max delegation depth (2) reached"));
        assert_eq!(repo.subtask_count(&deep.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sixteenth_delegation_is_rejected_with_text() {
        let (engine, repo) = engine_with(vec![]);
        let root = repo
            .create_task(NewTask::root("root", TaskRole::Planner, 15_000_000_000, 12))
            .await
            .unwrap();
        for i in 0..15 {
            repo.create_task(NewTask::child(format!("c{}", i), root.id, 0, 100_000_000, 8))
                .await
                .unwrap();
        }

        let result = engine
            .delegate(root.id, 0, &delegate_args(0.1).to_string())
            .await;
        assert!(result.starts_with("Error: Max subtask limit (15) reached"));
        assert_eq!(repo.subtask_count(&root.id).await.unwrap(), 15);
    }

    #[tokio::test]
    async fn delegation_budget_clamps_to_parent_remaining() {
        // Child script: one text step
        let (engine, repo) = engine_with(vec![text_response("tiny result", 10, 10)]);
        let root = repo
            .create_task(NewTask::root("root", TaskRole::Planner, 1_000_000_000, 12))
            .await
            .unwrap();
        // Spend $0.97 of the $1.00 budget, leaving $0.03 remaining
        repo.log_cost(crate::task::CostLogEntry {
            task_id: root.id,
            model: MODEL.to_string(),
            input_tokens: 1,
            output_tokens: 1,
            cost_nanos: 970_000_000,
        })
        .await
        .unwrap();

        // A $2.00 request against $0.03 remaining is clamped, not rejected
        let result = engine
            .delegate(root.id, 0, &delegate_args(2.0).to_string())
            .await;
        assert!(result.contains("Subtask result"));

        let children = repo.children_of(&root.id).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].budget_nanos, 30_000_000);
    }

    #[tokio::test]
    async fn delegation_below_budget_floor_is_rejected_with_text() {
        let (engine, repo) = engine_with(vec![]);
        let root = repo
            .create_task(NewTask::root("root", TaskRole::Planner, 1_000_000_000, 12))
            .await
            .unwrap();
        // $0.01 remaining, below the $0.02 floor
        repo.log_cost(crate::task::CostLogEntry {
            task_id: root.id,
            model: MODEL.to_string(),
            input_tokens: 1,
            output_tokens: 1,
            cost_nanos: 990_000_000,
        })
        .await
        .unwrap();

        let result = engine
            .delegate(root.id, 0, &delegate_args(2.0).to_string())
            .await;
        assert!(result.starts_with("Error: Insufficient budget remaining"));
        assert_eq!(repo.subtask_count(&root.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn malformed_delegation_arguments_are_reported_as_text() {
        let (engine, repo) = engine_with(vec![]);
        let root = repo
            .create_task(NewTask::root("root", TaskRole::Planner, 1_000_000_000, 12))
            .await
            .unwrap();

        let result = engine.delegate(root.id, 0, "{\"nope\": true}").await;
        assert!(result.starts_with("Error: invalid delegate_task arguments"));
    }

    // --- rejection ---

    #[tokio::test]
    async fn rejection_is_terminal_and_single_shot() {
        let (engine, repo) = engine_with(vec![tool_response(
            Some("Plan."),
            DELEGATE_TOOL,
            delegate_args(1.0),
            100,
            50,
        )]);

        let submitted = engine
            .submit("$5 go through all chapters and run experiments", None)
            .await
            .unwrap();
        assert_eq!(submitted.status, TaskStatus::Checkpoint);

        engine.reject(&submitted.task_id).await.unwrap();

        let task = repo.get_task(&submitted.task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some(REJECTION_MESSAGE));
        assert!(repo.load_conversation(&task.id).await.unwrap().is_none());

        // A second rejection or a late approval is an explicit miss
        assert!(matches!(
            engine.reject(&submitted.task_id).await,
            Err(EngineError::CheckpointNotFound(_))
        ));
        assert!(matches!(
            engine.resume(&submitted.task_id).await,
            Err(EngineError::CheckpointNotFound(_))
        ));
    }

    // --- status surface ---

    #[tokio::test]
    async fn status_summary_counts_queue_and_spend() {
        let (engine, repo) = engine_with(vec![]);
        let queued = repo
            .create_task(NewTask::root("waiting", TaskRole::Worker, 1_000_000_000, 12))
            .await
            .unwrap();
        let running = repo
            .create_task(NewTask::root("running", TaskRole::Worker, 1_000_000_000, 12))
            .await
            .unwrap();
        repo.update_status(&running.id, TaskStatus::InProgress, None, None)
            .await
            .unwrap();
        repo.log_cost(crate::task::CostLogEntry {
            task_id: queued.id,
            model: MODEL.to_string(),
            input_tokens: 10,
            output_tokens: 10,
            cost_nanos: 1_000_000,
        })
        .await
        .unwrap();

        let summary = engine.status_summary().await.unwrap();
        assert_eq!(summary.queued, 1);
        assert_eq!(summary.in_progress, 1);
        assert_eq!(summary.daily_cost_nanos, 1_000_000);
        assert_eq!(summary.monthly_cost_nanos, 1_000_000);
    }
}
