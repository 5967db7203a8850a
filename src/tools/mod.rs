//! Tool system for the execution loop.
//!
//! Tools are named capabilities with a string-in/string-out contract: the
//! reasoning service requests them by name with JSON arguments, and every
//! outcome - including a fault - comes back as result text. Nothing raises
//! past this boundary; the loop keeps running on tool errors.
//!
//! Relative paths resolve from the configured workspace directory;
//! absolute paths are an escape hatch.

mod file_ops;
mod scripts;

pub use file_ops::{EditFile, ListFiles, ReadFile, WriteFile};
pub use scripts::RunCommand;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::llm::{FunctionDefinition, ToolDefinition};
use crate::util::truncate_with_note;

/// Maximum characters of tool output fed back to the reasoning service.
const MAX_TOOL_OUTPUT: usize = 8_000;
/// Characters reserved for the truncation note.
const TOOL_OUTPUT_RESERVE: usize = 500;

/// Resolve a path relative to the workspace.
///
/// Relative paths are joined with `workspace`; absolute paths are used
/// as-is.
pub fn resolve_path(path_str: &str, workspace: &Path) -> PathBuf {
    let path = Path::new(path_str);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

/// Information about a tool for display purposes.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
}

/// Trait for implementing tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    /// A description of what this tool does.
    fn description(&self) -> &str;

    /// JSON schema for the tool's parameters.
    fn parameters_schema(&self) -> Value;

    /// Execute the tool with the given arguments.
    ///
    /// The `workspace` is the default directory for relative paths.
    async fn execute(&self, args: Value, workspace: &Path) -> anyhow::Result<String>;
}

/// Registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create a new registry with all default tools.
    pub fn new() -> Self {
        let mut tools: HashMap<String, Arc<dyn Tool>> = HashMap::new();

        tools.insert("read_file".to_string(), Arc::new(file_ops::ReadFile));
        tools.insert("write_file".to_string(), Arc::new(file_ops::WriteFile));
        tools.insert("edit_file".to_string(), Arc::new(file_ops::EditFile));
        tools.insert("list_files".to_string(), Arc::new(file_ops::ListFiles));
        tools.insert("run_command".to_string(), Arc::new(scripts::RunCommand));

        Self { tools }
    }

    /// Create an empty registry (no built-in tools).
    pub fn empty() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register an additional tool.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// List all available tools.
    pub fn list_tools(&self) -> Vec<ToolInfo> {
        let mut infos: Vec<ToolInfo> = self
            .tools
            .values()
            .map(|t| ToolInfo {
                name: t.name().to_string(),
                description: t.description().to_string(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Human-readable tool list for prompt assembly.
    pub fn describe(&self) -> String {
        self.list_tools()
            .iter()
            .map(|t| format!("- {}: {}", t.name, t.description))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Check if a tool exists by name.
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Get tool schemas in LLM-compatible format.
    pub fn tool_schemas(&self) -> Vec<ToolDefinition> {
        let mut schemas: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                tool_type: "function".to_string(),
                function: FunctionDefinition {
                    name: t.name().to_string(),
                    description: t.description().to_string(),
                    parameters: t.parameters_schema(),
                },
            })
            .collect();
        schemas.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        schemas
    }

    /// Execute a tool by name, converting every fault to result text.
    ///
    /// Output is truncated so a single verbose tool cannot blow up the
    /// conversation's input tokens.
    pub async fn run_tool(&self, name: &str, arguments: &str, workspace: &Path) -> String {
        let Some(tool) = self.tools.get(name) else {
            return format!("Error: Unknown tool '{}'", name);
        };

        let args: Value = if arguments.trim().is_empty() {
            Value::Null
        } else {
            match serde_json::from_str(arguments) {
                Ok(v) => v,
                Err(e) => return format!("Error: invalid arguments for {}: {}", name, e),
            }
        };

        match tool.execute(args, workspace).await {
            Ok(output) => truncate_with_note(&output, MAX_TOOL_OUTPUT, TOOL_OUTPUT_RESERVE),
            Err(e) => format!("Error executing {}: {}", name, e),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
