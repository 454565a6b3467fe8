//! Error taxonomy for the orchestrator.
//!
//! `ConfigError` covers load-time failures (fatal, reported and the process
//! exits before the event loop ever starts). `OrchestratorError` covers
//! everything that can go wrong once the loop is running; each variant maps
//! onto one row of the failure taxonomy and, where relevant, the task status
//! that failure produces.

use std::path::PathBuf;

/// Failures that occur while loading `orchestrator.yaml` and its siblings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("duplicate agent abbreviation \"{0}\" — abbreviations must be unique")]
    DuplicateAbbreviation(String),

    #[error("node is missing a required \"name\" field")]
    MissingName,

    #[error("could not derive a 3-4 letter abbreviation from agent name \"{0}\"")]
    UnderivableAbbreviation(String),

    #[error("no prompt file found for agent \"{abbr}\" under {prompts_dir}")]
    MissingPromptFile { abbr: String, prompts_dir: PathBuf },

    #[error("invalid cron expression \"{expr}\" for agent \"{abbr}\": {reason}")]
    InvalidCron {
        abbr: String,
        expr: String,
        reason: String,
    },

    #[error("invalid trigger_content_regex \"{pattern}\" for agent \"{abbr}\": {reason}")]
    InvalidContentRegex {
        abbr: String,
        pattern: String,
        reason: String,
    },
}

/// Failures surfaced while the event loop is running.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("executor binary not found for agent \"{abbr}\" (executor: {executor})")]
    ExecutorNotFound { abbr: String, executor: String },

    #[error("agent \"{abbr}\" exceeded its timeout of {timeout_secs}s")]
    Timeout { abbr: String, timeout_secs: u64 },

    #[error("agent \"{abbr}\" exited with non-zero status {code}")]
    NonZeroExit { abbr: String, code: i32 },

    #[error("agent \"{abbr}\" reported success but produced no validated output under {output_path}")]
    OutputValidation { abbr: String, output_path: PathBuf },

    #[error("post-processing failed for agent \"{abbr}\": {reason}")]
    PostProcess { abbr: String, reason: String },

    #[error("poller \"{name}\" failed: {reason}")]
    Poller { name: String, reason: String },

    #[error("file watcher failed: {0}")]
    Watcher(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
