//! Configuration for the Overseer engine.
//!
//! Configuration can be set via environment variables:
//! - `OPENROUTER_API_KEY` - Required. Your OpenRouter API key.
//! - `MODEL_LIGHT` - Optional. Model for simple-tier work and tier routing.
//! - `MODEL_HEAVY` - Optional. Model for standard/complex/planner work.
//! - `WORKSPACE_PATH` - Optional. Root directory for file tools. Defaults to cwd.
//! - `DB_PATH` - Optional. SQLite database path. Defaults to `data/overseer.db`.
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `3000`.
//! - `DEFAULT_TASK_BUDGET` - Optional. Root budget in USD when no `$N` prefix.
//! - `MAX_TASK_BUDGET` - Optional. Root budget ceiling in USD.
//! - `MIN_SUBTASK_BUDGET` - Optional. Budget floor in USD for any node.
//! - `MAX_SUBTASK_BUDGET` - Optional. Per-child budget ceiling in USD.
//! - `MAX_DELEGATION_DEPTH` - Optional. Maximum depth of delegated children.
//! - `MAX_SUBTASKS_PER_TASK` - Optional. Fan-out ceiling per parent.
//! - `DAILY_COST_LIMIT` - Optional. Global daily spend ceiling in USD.
//! - `PLANNER_BUDGET_THRESHOLD` - Optional. Budget above which a root plans.
//! - `PLANNER_LENGTH_THRESHOLD` - Optional. Description length planner signal.

use std::path::PathBuf;

use thiserror::Error;

use crate::util::{nanos_from_usd, NANOS_PER_USD};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Per-depth step ceilings for the execution loop.
///
/// Deeper nodes get fewer steps; depths beyond the table reuse the last
/// entry.
const STEP_LIMITS: [u32; 3] = [12, 8, 5];

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// OpenRouter API key
    pub api_key: String,

    /// Model for simple-tier work and tier routing
    pub model_light: String,

    /// Model for standard/complex/planner work
    pub model_heavy: String,

    /// Root directory for file tools and context files
    pub workspace_path: PathBuf,

    /// SQLite database path
    pub db_path: PathBuf,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Root budget in nanodollars when the description carries no `$N` prefix
    pub default_task_budget: u64,

    /// Root budget ceiling in nanodollars
    pub max_task_budget: u64,

    /// Budget floor in nanodollars for any node
    pub min_subtask_budget: u64,

    /// Per-child budget ceiling in nanodollars
    pub max_subtask_budget: u64,

    /// Maximum depth of delegated children (root is depth 0)
    pub max_delegation_depth: u8,

    /// Fan-out ceiling per parent
    pub max_subtasks_per_task: u32,

    /// Global daily spend ceiling in nanodollars
    pub daily_cost_limit: u64,

    /// Roots with a budget above this (nanodollars) are classified planners
    pub planner_budget_threshold: u64,

    /// Descriptions longer than this (chars) are classified planners
    pub planner_length_threshold: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `OPENROUTER_API_KEY` is not set,
    /// or `ConfigError::InvalidValue` for unparseable numeric values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("OPENROUTER_API_KEY".to_string()))?;

        let model_light = std::env::var("MODEL_LIGHT")
            .unwrap_or_else(|_| "anthropic/claude-haiku-4.5".to_string());
        let model_heavy = std::env::var("MODEL_HEAVY")
            .unwrap_or_else(|_| "anthropic/claude-sonnet-4.5".to_string());

        let workspace_path = std::env::var("WORKSPACE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let db_path = std::env::var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/overseer.db"));

        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env_parse("PORT", 3000u16)?;

        Ok(Self {
            api_key,
            model_light,
            model_heavy,
            workspace_path,
            db_path,
            host,
            port,
            default_task_budget: env_usd("DEFAULT_TASK_BUDGET", 1.00)?,
            max_task_budget: env_usd("MAX_TASK_BUDGET", 15.00)?,
            min_subtask_budget: env_usd("MIN_SUBTASK_BUDGET", 0.02)?,
            max_subtask_budget: env_usd("MAX_SUBTASK_BUDGET", 2.00)?,
            max_delegation_depth: env_parse("MAX_DELEGATION_DEPTH", 2u8)?,
            max_subtasks_per_task: env_parse("MAX_SUBTASKS_PER_TASK", 15u32)?,
            daily_cost_limit: env_usd("DAILY_COST_LIMIT", 5.00)?,
            planner_budget_threshold: env_usd("PLANNER_BUDGET_THRESHOLD", 2.00)?,
            planner_length_threshold: env_parse("PLANNER_LENGTH_THRESHOLD", 240usize)?,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(api_key: String, workspace_path: PathBuf) -> Self {
        Self {
            api_key,
            model_light: "anthropic/claude-haiku-4.5".to_string(),
            model_heavy: "anthropic/claude-sonnet-4.5".to_string(),
            workspace_path,
            db_path: PathBuf::from("data/overseer.db"),
            host: "127.0.0.1".to_string(),
            port: 3000,
            default_task_budget: NANOS_PER_USD,
            max_task_budget: 15 * NANOS_PER_USD,
            min_subtask_budget: 20_000_000,
            max_subtask_budget: 2 * NANOS_PER_USD,
            max_delegation_depth: 2,
            max_subtasks_per_task: 15,
            daily_cost_limit: 5 * NANOS_PER_USD,
            planner_budget_threshold: 2 * NANOS_PER_USD,
            planner_length_threshold: 240,
        }
    }

    /// Step ceiling for a node at the given depth.
    pub fn max_steps_for_depth(&self, depth: u8) -> u32 {
        let idx = (depth as usize).min(STEP_LIMITS.len() - 1);
        STEP_LIMITS[idx]
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}

/// Parse a USD env var (e.g. `"1.50"`) into nanodollars.
fn env_usd(name: &str, default_usd: f64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => {
            let usd: f64 = raw
                .parse()
                .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e)))?;
            if !usd.is_finite() || usd < 0.0 {
                return Err(ConfigError::InvalidValue(name.to_string(), raw));
            }
            Ok(nanos_from_usd(usd))
        }
        Err(_) => Ok(nanos_from_usd(default_usd)),
    }
}
