//! The bounded call/tool loop shared by every node.
//!
//! One loop serves roots and delegated children alike; role and depth only
//! change the prompt, the visible tools, and the step ceiling. The loop
//! has a single fault boundary: any unexpected error fails the node, with
//! no step-level retries.

use async_recursion::async_recursion;

use crate::classifier::Tier;
use crate::cost::cost_nanos;
use crate::engine::checkpoint::{CheckpointReason, PendingCheckpoint};
use crate::engine::{Engine, DELEGATE_TOOL};
use crate::llm::{ChatMessage, ChatOptions, Role, ToolDefinition};
use crate::memory::{extract_keywords, format_context, SessionMemory};
use crate::task::{CostLogEntry, TaskId, TaskRole, TaskStatus};
use crate::tools::resolve_path;
use crate::util::{fmt_usd, truncate_chars};

/// Characters of the final result persisted on the task row.
const RESULT_LIMIT: usize = 1_000;
/// Characters of each injected context file.
const CONTEXT_FILE_LIMIT: usize = 4_000;
/// Recent session summaries injected into a root worker's system prompt.
const RECENT_MEMORIES: u32 = 2;
/// Keyword-matched summaries injected into a root worker's conversation.
const MATCHED_MEMORIES: u32 = 3;

/// Inputs for one run of the loop.
#[derive(Debug, Clone)]
pub(crate) struct NodeSpec {
    pub task_id: TaskId,
    pub description: String,
    pub depth: u8,
    pub budget_nanos: u64,
    pub role: TaskRole,
    /// Preserved conversation when resuming a checkpoint
    pub resume_conversation: Option<Vec<ChatMessage>>,
    /// Workspace files injected into a freshly delegated child
    pub context_files: Vec<String>,
}

/// How one run of the loop ended.
#[derive(Debug, Clone)]
pub enum NodeOutcome {
    /// Natural exit or best-effort stop at the step ceiling
    Completed(String),
    /// Suspended; the conversation is preserved for resume
    Checkpoint {
        text: String,
        reason: CheckpointReason,
    },
    /// A fault terminated the node
    Failed(String),
    /// A budget or daily-spend guard terminated the node
    Stalled(String),
}

impl NodeOutcome {
    /// The task status this outcome maps to.
    pub fn status(&self) -> TaskStatus {
        match self {
            NodeOutcome::Completed(_) => TaskStatus::Completed,
            NodeOutcome::Checkpoint { .. } => TaskStatus::Checkpoint,
            NodeOutcome::Failed(_) => TaskStatus::Failed,
            NodeOutcome::Stalled(_) => TaskStatus::Stalled,
        }
    }

    /// The user-facing text of this outcome.
    pub fn text(&self) -> &str {
        match self {
            NodeOutcome::Completed(text) => text,
            NodeOutcome::Checkpoint { text, .. } => text,
            NodeOutcome::Failed(text) => text,
            NodeOutcome::Stalled(text) => text,
        }
    }
}

impl Engine {
    /// Run one node to an outcome. This is the single entry point the
    /// delegation tool recurses through for child nodes.
    #[async_recursion]
    pub(crate) async fn run_node(&self, spec: NodeSpec) -> NodeOutcome {
        let task_id = spec.task_id;
        match self.drive_loop(spec).await {
            Ok(outcome) => outcome,
            Err(err) => {
                let msg = format!("{:#}", err);
                tracing::error!(task_id = %task_id, "Task failed: {}", msg);
                if let Err(persist_err) = self
                    .repo
                    .update_status(&task_id, TaskStatus::Failed, None, Some(&msg))
                    .await
                {
                    tracing::error!(task_id = %task_id, "Could not persist failure: {}", persist_err);
                }
                NodeOutcome::Failed(format!("Task failed: {}", msg))
            }
        }
    }

    async fn drive_loop(&self, spec: NodeSpec) -> anyhow::Result<NodeOutcome> {
        let resumed = spec.resume_conversation.is_some();

        if !resumed {
            self.repo
                .update_status(&spec.task_id, TaskStatus::Classifying, None, None)
                .await?;
        }

        // Planners are pinned to the complex tier; workers go through the
        // classifier.
        let classification = if spec.role.is_planner() {
            self.classifier.classification_for(Tier::Complex)
        } else {
            self.classifier.classify(&spec.description).await
        };
        self.repo.set_model(&spec.task_id, &classification.model).await?;
        self.repo
            .update_status(&spec.task_id, TaskStatus::InProgress, None, None)
            .await?;

        let system_prompt = self.build_system_prompt(&spec).await?;
        let tool_schemas = self.visible_tools(spec.depth);

        let mut conversation = match spec.resume_conversation.clone() {
            Some(turns) => turns,
            None => self.build_initial_conversation(&spec).await?,
        };

        // An approved plan resumes with its suspended tool requests still
        // unexecuted at the tail; run them before calling the service again.
        if resumed {
            self.execute_pending_tools(&spec, &mut conversation).await;
        }

        let max_steps = self.config.max_steps_for_depth(spec.depth);
        let mut step = 0u32;
        let mut final_text = String::new();

        while step < max_steps {
            step += 1;
            self.repo.set_step_count(&spec.task_id, step).await?;

            // Safety nets, independent of per-call ceilings, checked before
            // every reasoning call.
            let current = self
                .repo
                .get_task(&spec.task_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("task row disappeared"))?;
            if current.cost_nanos > spec.budget_nanos {
                let msg = format!(
                    "Task halted - budget ({}) exceeded. Spent {} so far.",
                    fmt_usd(spec.budget_nanos),
                    fmt_usd(current.cost_nanos)
                );
                self.repo
                    .update_status(&spec.task_id, TaskStatus::Stalled, None, Some("Budget exceeded"))
                    .await?;
                return Ok(NodeOutcome::Stalled(msg));
            }

            let daily = self.repo.daily_cost().await?;
            if daily > self.config.daily_cost_limit {
                let msg = format!(
                    "Daily budget limit ({}) reached. Total today: {}.",
                    fmt_usd(self.config.daily_cost_limit),
                    fmt_usd(daily)
                );
                self.repo
                    .update_status(
                        &spec.task_id,
                        TaskStatus::Stalled,
                        None,
                        Some("Daily cost limit exceeded"),
                    )
                    .await?;
                return Ok(NodeOutcome::Stalled(msg));
            }

            let mut messages = Vec::with_capacity(conversation.len() + 1);
            messages.push(ChatMessage::new(Role::System, system_prompt.clone()));
            messages.extend(conversation.iter().cloned());

            // Faults propagate to run_node's recovery boundary unretried.
            let response = self
                .llm
                .chat_completion_with_options(
                    &classification.model,
                    &messages,
                    Some(&tool_schemas),
                    ChatOptions {
                        temperature: None,
                        max_tokens: Some(classification.max_output_tokens),
                    },
                )
                .await?;

            let (input_tokens, output_tokens) = response
                .usage
                .as_ref()
                .map(|u| (u.prompt_tokens, u.completion_tokens))
                .unwrap_or((0, 0));
            let call_cost = cost_nanos(&classification.model, input_tokens, output_tokens);
            self.repo
                .log_cost(CostLogEntry {
                    task_id: spec.task_id,
                    model: classification.model.clone(),
                    input_tokens,
                    output_tokens,
                    cost_nanos: call_cost,
                })
                .await?;

            let text = response.content.clone().unwrap_or_default();
            if !text.is_empty() {
                final_text = text.clone();
            }
            let tool_calls = response.requested_tools().to_vec();

            // A planner's first plan is never executed: the operator
            // approves it before any subtask spends money.
            if spec.role.is_planner() && step == 1 && !resumed && !tool_calls.is_empty() {
                conversation.push(ChatMessage::assistant_with_tools(
                    response.content.clone(),
                    tool_calls,
                ));
                return self
                    .suspend(&spec, CheckpointReason::PlanReady, final_text, conversation)
                    .await;
            }

            if tool_calls.is_empty() {
                break;
            }

            conversation.push(ChatMessage::assistant_with_tools(
                response.content.clone(),
                tool_calls.clone(),
            ));
            self.run_tool_calls(&spec, &tool_calls, &mut conversation).await;

            // Root workers hand control back when the service hedges.
            if spec.depth == 0
                && !spec.role.is_planner()
                && !text.is_empty()
                && (self.uncertainty.as_ref())(&text)
            {
                return self
                    .suspend(&spec, CheckpointReason::Uncertainty, text, conversation)
                    .await;
            }
        }

        // Step exhaustion is best effort, not failure: keep the last text.
        self.repo
            .update_status(
                &spec.task_id,
                TaskStatus::Completed,
                Some(&truncate_chars(&final_text, RESULT_LIMIT)),
                None,
            )
            .await?;
        self.repo.save_conversation(&spec.task_id, None).await?;

        if spec.depth == 0 {
            let memory = SessionMemory::from_completion(
                spec.task_id,
                &spec.description,
                &final_text,
                classification.tier.as_str(),
                step,
                spec.role,
            );
            self.repo.save_session_memory(&memory).await?;
        }

        Ok(NodeOutcome::Completed(final_text))
    }

    /// Execute tool calls in the order requested, sequentially. Delegation
    /// routes back into the engine; everything else goes to the registry,
    /// which converts faults to result text.
    async fn run_tool_calls(
        &self,
        spec: &NodeSpec,
        tool_calls: &[crate::llm::ToolCall],
        conversation: &mut Vec<ChatMessage>,
    ) {
        for call in tool_calls {
            let result = if call.function.name == DELEGATE_TOOL {
                self.delegate(spec.task_id, spec.depth, &call.function.arguments)
                    .await
            } else {
                self.tools
                    .run_tool(
                        &call.function.name,
                        &call.function.arguments,
                        &self.config.workspace_path,
                    )
                    .await
            };
            conversation.push(ChatMessage::tool_result(call.id.clone(), result));
        }
    }

    /// If the preserved conversation ends in an assistant turn whose tool
    /// requests were never executed (a plan approved at a checkpoint), run
    /// them now so the next service call sees their results.
    async fn execute_pending_tools(&self, spec: &NodeSpec, conversation: &mut Vec<ChatMessage>) {
        let pending = match conversation.last() {
            Some(last) if last.role == Role::Assistant => last.tool_calls.clone(),
            _ => None,
        };
        if let Some(calls) = pending {
            self.run_tool_calls(spec, &calls, conversation).await;
        }
    }

    /// Suspend the node: persist the conversation snapshot, register the
    /// pending checkpoint, and hand control back.
    async fn suspend(
        &self,
        spec: &NodeSpec,
        reason: CheckpointReason,
        text: String,
        conversation: Vec<ChatMessage>,
    ) -> anyhow::Result<NodeOutcome> {
        let snapshot = serde_json::to_string(&conversation)?;
        self.repo
            .update_status(&spec.task_id, TaskStatus::Checkpoint, None, None)
            .await?;
        self.repo
            .save_conversation(&spec.task_id, Some(&snapshot))
            .await?;

        let remaining = self
            .repo
            .get_task(&spec.task_id)
            .await?
            .map(|t| t.remaining_budget())
            .unwrap_or(spec.budget_nanos);
        self.checkpoints
            .insert(
                spec.task_id,
                PendingCheckpoint {
                    conversation,
                    remaining_nanos: remaining,
                    reason,
                },
            )
            .await;

        tracing::info!(task_id = %spec.task_id, reason = %reason, "Task suspended at checkpoint");
        Ok(NodeOutcome::Checkpoint { text, reason })
    }

    /// Tool schemas visible at this depth. The delegation tool disappears
    /// once a child would exceed the depth ceiling.
    fn visible_tools(&self, depth: u8) -> Vec<ToolDefinition> {
        let mut schemas = self.tools.tool_schemas();
        if depth < self.config.max_delegation_depth {
            schemas.push(super::delegate_tool_definition());
        }
        schemas
    }

    async fn build_system_prompt(&self, spec: &NodeSpec) -> anyhow::Result<String> {
        let mut tools_text = self.tools.describe();
        if spec.depth < self.config.max_delegation_depth {
            if !tools_text.is_empty() {
                tools_text.push('\n');
            }
            tools_text.push_str(
                "- delegate_task: Delegate a focused subtask to a sub-agent with its own budget",
            );
        }

        if spec.role.is_planner() {
            return Ok(format!(
                r#"You are a task coordinator. Decompose the task into focused subtasks and delegate them with the delegate_task tool.

## Available Tools
{tools}

## Rules
1. Each subtask must be self-contained - the sub-agent has NO memory of this conversation.
2. Give each subtask a clear budget; keep the total within your own budget.
3. Delegate one subtask at a time and adapt the plan as results come back.
4. When all subtasks are done, summarize the combined outcome."#,
                tools = tools_text
            ));
        }

        if spec.depth > 0 {
            return Ok(format!(
                r#"You are a focused sub-agent executing one delegated subtask.

## Available Tools
{tools}

## Rules
1. The task description is all the context you have. Do not ask questions.
2. Use tools to do the work, then report only the result.
3. Be concise - your output returns to a coordinator with a tight budget."#,
                tools = tools_text
            ));
        }

        // Root worker: inject recent session context.
        let recent = self.repo.recent_session_memories(RECENT_MEMORIES).await?;
        let recent_text = if recent.is_empty() {
            "No recent tasks.".to_string()
        } else {
            format_context(&recent)
        };

        Ok(format!(
            r#"You are an autonomous task executor with access to tools.

## Available Tools
{tools}

## Rules
1. Be concise. You are in a bounded loop - every token costs money.
2. Use tools to accomplish the task - don't just describe what to do.
3. When uncertain, say so explicitly. The engine will ask the operator.
4. Report what you did, not what you could do.

## Recent Context
{recent}"#,
            tools = tools_text,
            recent = recent_text
        ))
    }

    async fn build_initial_conversation(
        &self,
        spec: &NodeSpec,
    ) -> anyhow::Result<Vec<ChatMessage>> {
        let mut conversation = Vec::new();

        // Long-term memory is injected only for depth-0 workers.
        if spec.depth == 0 && !spec.role.is_planner() {
            let keywords = extract_keywords(&spec.description);
            let memories = self
                .repo
                .search_session_memories(&keywords, MATCHED_MEMORIES)
                .await?;
            if !memories.is_empty() {
                conversation.push(ChatMessage::new(
                    Role::User,
                    format!(
                        "Relevant context from past work:\n{}",
                        format_context(&memories)
                    ),
                ));
                conversation.push(ChatMessage::new(
                    Role::Assistant,
                    "Understood, I'll keep that context in mind.",
                ));
            }
        }

        // Context files are injected only for freshly delegated children.
        if spec.depth > 0 && !spec.context_files.is_empty() {
            let mut blocks = Vec::new();
            for file in &spec.context_files {
                let path = resolve_path(file, &self.config.workspace_path);
                match tokio::fs::read_to_string(&path).await {
                    Ok(content) => blocks.push(format!(
                        "=== {} ===\n{}",
                        file,
                        truncate_chars(&content, CONTEXT_FILE_LIMIT)
                    )),
                    Err(e) => blocks.push(format!("=== {} ===\n(unreadable: {})", file, e)),
                }
            }
            conversation.push(ChatMessage::new(
                Role::User,
                format!("Context files:\n\n{}", blocks.join("\n\n")),
            ));
            conversation.push(ChatMessage::new(Role::Assistant, "Context received."));
        }

        conversation.push(ChatMessage::new(Role::User, spec.description.clone()));
        Ok(conversation)
    }
}
