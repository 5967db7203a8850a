//! File operation tools: read, write, edit, and list.

use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{resolve_path, Tool};

/// Default number of lines returned by `read_file`.
const DEFAULT_READ_LINES: usize = 200;
/// Maximum directory entries returned by `list_files`.
const MAX_LIST_ENTRIES: usize = 50;

fn arg_str<'a>(args: &'a Value, key: &str) -> anyhow::Result<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("missing required argument '{}'", key))
}

/// Read a file, returning a bounded line range.
pub struct ReadFile;

#[async_trait]
impl Tool for ReadFile {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file. Returns the first 200 lines unless a range is given."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path relative to the workspace, or absolute path."
                },
                "start_line": {
                    "type": "integer",
                    "description": "Start reading from this line (1-indexed). Default: 1."
                },
                "end_line": {
                    "type": "integer",
                    "description": "Read up to this line. Default: 200."
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, workspace: &Path) -> anyhow::Result<String> {
        let path = resolve_path(arg_str(&args, "path")?, workspace);
        if !path.exists() {
            return Ok(format!("File not found: {}", path.display()));
        }

        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                return Ok(format!("Cannot read binary file: {}", path.display()));
            }
            Err(e) => return Err(e.into()),
        };

        let start = args
            .get("start_line")
            .and_then(|v| v.as_u64())
            .map(|n| (n as usize).saturating_sub(1))
            .unwrap_or(0);
        let end = args
            .get("end_line")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(start + DEFAULT_READ_LINES);

        let lines: Vec<&str> = raw.lines().collect();
        let total = lines.len();
        let selected = lines
            .iter()
            .skip(start)
            .take(end.saturating_sub(start))
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");

        Ok(format!(
            "[{} - lines {}-{} of {}]\n{}",
            path.display(),
            start + 1,
            end.min(total),
            total,
            selected
        ))
    }
}

/// Write content to a file, creating parent directories as needed.
pub struct WriteFile;

#[async_trait]
impl Tool for WriteFile {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file. Creates directories if needed. Overwrites existing files."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path relative to the workspace."
                },
                "content": {
                    "type": "string",
                    "description": "Content to write."
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, args: Value, workspace: &Path) -> anyhow::Result<String> {
        let path = resolve_path(arg_str(&args, "path")?, workspace);
        let content = arg_str(&args, "content")?;

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&path, content).await?;

        Ok(format!("Written {} bytes to {}", content.len(), path.display()))
    }
}

/// Replace a unique occurrence of a string in a file.
pub struct EditFile;

#[async_trait]
impl Tool for EditFile {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Replace a specific string in a file with new content. The old string must appear exactly once."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path."
                },
                "old_text": {
                    "type": "string",
                    "description": "Exact text to find and replace (must be unique in file)."
                },
                "new_text": {
                    "type": "string",
                    "description": "Replacement text."
                }
            },
            "required": ["path", "old_text", "new_text"]
        })
    }

    async fn execute(&self, args: Value, workspace: &Path) -> anyhow::Result<String> {
        let path = resolve_path(arg_str(&args, "path")?, workspace);
        if !path.exists() {
            return Ok(format!("File not found: {}", path.display()));
        }

        let content = tokio::fs::read_to_string(&path).await?;
        let old_text = arg_str(&args, "old_text")?;
        let new_text = arg_str(&args, "new_text")?;

        let count = content.matches(old_text).count();
        if count == 0 {
            return Ok(format!("Text not found in {}", path.display()));
        }
        if count > 1 {
            return Ok(format!(
                "Text appears {} times in {} - must be unique. Provide more context.",
                count,
                path.display()
            ));
        }

        let updated = content.replacen(old_text, new_text, 1);
        tokio::fs::write(&path, updated).await?;

        Ok(format!("Edited {}: replaced 1 occurrence.", path.display()))
    }
}

/// List directory entries with sizes.
pub struct ListFiles;

#[async_trait]
impl Tool for ListFiles {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List files in a directory. Returns file names and sizes."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory path relative to the workspace. Default: workspace root."
                }
            }
        })
    }

    async fn execute(&self, args: Value, workspace: &Path) -> anyhow::Result<String> {
        let rel = args.get("path").and_then(|v| v.as_str()).unwrap_or("");
        let dir = resolve_path(rel, workspace);
        if !dir.is_dir() {
            return Ok(format!("Directory not found: {}", dir.display()));
        }

        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = reader.next_entry().await? {
            let meta = entry.metadata().await?;
            let mut name = entry.file_name().to_string_lossy().to_string();
            if meta.is_dir() {
                name.push('/');
            }
            entries.push((name, meta.len()));
        }
        entries.sort();

        let total = entries.len();
        let lines: Vec<String> = entries
            .iter()
            .take(MAX_LIST_ENTRIES)
            .map(|(name, size)| format!("  {:<40} {:>8.1} KB", name, *size as f64 / 1024.0))
            .collect();

        let mut header = format!("[{}] - {} items", dir.display(), total);
        if total > MAX_LIST_ENTRIES {
            header.push_str(&format!(" (showing first {})", MAX_LIST_ENTRIES));
        }
        Ok(format!("{}\n{}", header, lines.join("\n")))
    }
}
