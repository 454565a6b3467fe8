//! Configuration loading.
//!
//! Reads `orchestrator.yaml` (and an optional sibling `secrets.yaml`) and
//! produces the fully-resolved `AgentDefinition`s and runtime settings the
//! rest of the crate works with.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::agent::{derive_abbreviation, AgentDefinition, Executor, OutputKind, PostProcess, Priority};
use crate::error::ConfigError;

/// Raw deserialisation shape of `orchestrator.yaml`.
#[derive(Debug, Deserialize)]
struct RawConfig {
    orchestrator: RawOrchestrator,
    #[serde(default)]
    defaults: RawDefaults,
    #[serde(default)]
    nodes: Vec<RawNode>,
    #[serde(default)]
    pollers: HashMap<String, RawPollerConfig>,
}

#[derive(Debug, Deserialize)]
struct RawOrchestrator {
    #[serde(default = "default_prompts_dir")]
    prompts_dir: String,
    #[serde(default = "default_tasks_dir")]
    tasks_dir: String,
    #[serde(default = "default_logs_dir")]
    logs_dir: String,
    #[serde(default = "default_max_concurrent")]
    max_concurrent: usize,
    #[serde(default = "default_poll_interval")]
    poll_interval: f64,
    #[serde(default)]
    executors: HashMap<String, RawExecutorOverride>,
}

#[derive(Debug, Deserialize)]
struct RawExecutorOverride {
    command: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawDefaults {
    max_parallel: Option<usize>,
    timeout_secs: Option<u64>,
    priority: Option<String>,
    executor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    #[serde(rename = "type")]
    node_type: String,
    name: Option<String>,
    input_path: Option<Vec<String>>,
    output_path: Option<String>,
    output_kind: Option<String>,
    executor: Option<String>,
    max_parallel: Option<usize>,
    timeout_secs: Option<u64>,
    priority: Option<String>,
    trigger_exclude_glob: Option<String>,
    trigger_content_regex: Option<String>,
    input_pattern: Option<String>,
    post_process: Option<String>,
    cron: Option<String>,
    #[serde(default = "default_create_task")]
    create_task: bool,
}

#[derive(Debug, Deserialize)]
struct RawPollerConfig {
    #[serde(default)]
    pub source_dir: Option<String>,
    #[serde(default)]
    pub target_dir: Option<String>,
    #[serde(default = "default_poller_interval")]
    pub poll_interval: f64,
}

fn default_prompts_dir() -> String {
    "Prompts".to_string()
}
fn default_tasks_dir() -> String {
    "Tasks".to_string()
}
fn default_logs_dir() -> String {
    "Logs".to_string()
}
fn default_max_concurrent() -> usize {
    3
}
fn default_poll_interval() -> f64 {
    1.0
}
fn default_poller_interval() -> f64 {
    60.0
}
fn default_create_task() -> bool {
    true
}

/// Fully resolved settings the orchestrator core runs with.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub vault_root: PathBuf,
    pub prompts_dir: PathBuf,
    pub tasks_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub max_concurrent: usize,
    pub poll_interval: Duration,
    pub executor_overrides: HashMap<String, PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub name: String,
    pub source_dir: PathBuf,
    pub target_dir: PathBuf,
    pub poll_interval: Duration,
}

/// Secrets loaded from a sibling `secrets.yaml`. Never `Debug`-printed or
/// logged beyond a count of keys loaded.
pub struct Secrets {
    values: HashMap<String, String>,
}

impl Secrets {
    fn empty() -> Self {
        Self { values: HashMap::new() }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Everything produced by a successful `load()`.
pub struct LoadedConfig {
    pub settings: OrchestratorSettings,
    pub agents: Vec<AgentDefinition>,
    pub pollers: Vec<PollerSettings>,
    pub secrets: Secrets,
}

/// Load `<vault_root>/orchestrator.yaml` (or an explicit path override) and
/// resolve it into agent definitions and runtime settings.
pub fn load(vault_root: &Path, config_path: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
    let path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(|| vault_root.join("orchestrator.yaml"));

    if !path.exists() {
        return Err(ConfigError::NotFound(path));
    }

    let content = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    let raw: RawConfig = serde_yaml::from_str(&content).map_err(|source| ConfigError::Yaml {
        path: path.clone(),
        source,
    })?;

    let prompts_dir = vault_root.join(&raw.orchestrator.prompts_dir);
    let tasks_dir = vault_root.join(&raw.orchestrator.tasks_dir);
    let logs_dir = vault_root.join(&raw.orchestrator.logs_dir);

    let mut executor_overrides = HashMap::new();
    for (name, cfg) in &raw.orchestrator.executors {
        executor_overrides.insert(name.clone(), PathBuf::from(&cfg.command));
    }

    let settings = OrchestratorSettings {
        vault_root: vault_root.to_path_buf(),
        prompts_dir: prompts_dir.clone(),
        tasks_dir,
        logs_dir,
        max_concurrent: raw.orchestrator.max_concurrent,
        poll_interval: Duration::from_secs_f64(raw.orchestrator.poll_interval),
        executor_overrides,
    };

    let mut agents = Vec::new();
    let mut seen_abbrs = std::collections::HashSet::new();
    for node in &raw.nodes {
        if node.node_type != "agent" {
            continue;
        }
        let agent = resolve_agent(node, &raw.defaults, &prompts_dir, vault_root)?;
        if !seen_abbrs.insert(agent.abbreviation.clone()) {
            return Err(ConfigError::DuplicateAbbreviation(agent.abbreviation));
        }
        agents.push(agent);
    }

    let mut pollers = Vec::new();
    for (name, cfg) in &raw.pollers {
        pollers.push(PollerSettings {
            name: name.clone(),
            source_dir: vault_root.join(cfg.source_dir.as_deref().unwrap_or("")),
            target_dir: vault_root.join(cfg.target_dir.as_deref().unwrap_or("")),
            poll_interval: Duration::from_secs_f64(cfg.poll_interval),
        });
    }

    let secrets = load_secrets(vault_root)?;

    Ok(LoadedConfig {
        settings,
        agents,
        pollers,
        secrets,
    })
}

fn resolve_agent(
    node: &RawNode,
    defaults: &RawDefaults,
    prompts_dir: &Path,
    vault_root: &Path,
) -> Result<AgentDefinition, ConfigError> {
    let name = node.name.clone().ok_or(ConfigError::MissingName)?;
    let abbreviation =
        derive_abbreviation(&name).ok_or_else(|| ConfigError::UnderivableAbbreviation(name.clone()))?;

    let prompt_path = find_prompt_file(prompts_dir, &abbreviation)?;

    let executor_name = node
        .executor
        .clone()
        .or_else(|| defaults.executor.clone())
        .unwrap_or_else(|| "claude_code".to_string());
    let executor = parse_executor(&executor_name);

    let priority_name = node
        .priority
        .clone()
        .or_else(|| defaults.priority.clone());
    let priority = parse_priority(priority_name.as_deref());

    let max_parallel = node
        .max_parallel
        .or(defaults.max_parallel)
        .unwrap_or(1);
    let timeout_secs = node.timeout_secs.or(defaults.timeout_secs).unwrap_or(1800);

    let trigger_content_regex = match &node.trigger_content_regex {
        Some(pattern) => Some(Regex::new(pattern).map_err(|e| ConfigError::InvalidContentRegex {
            abbr: abbreviation.clone(),
            pattern: pattern.clone(),
            reason: e.to_string(),
        })?),
        None => None,
    };

    if let Some(cron_expr) = &node.cron {
        validate_cron(&abbreviation, cron_expr)?;
    }

    let post_process = match node.post_process.as_deref() {
        Some("remove_trigger_content") => Some(PostProcess::RemoveTriggerContent),
        Some(other) => {
            tracing::warn!(abbr = %abbreviation, value = other, "unknown post_process value, ignoring");
            None
        }
        None => None,
    };

    let output_kind = match node.output_kind.as_deref() {
        Some("update_file") => OutputKind::UpdateFile,
        _ => OutputKind::NewFile,
    };

    let input_paths = node
        .input_path
        .clone()
        .unwrap_or_default()
        .into_iter()
        .map(|p| vault_root.join(p).to_string_lossy().to_string())
        .collect();
    let output_path = node
        .output_path
        .as_deref()
        .map(|p| vault_root.join(p))
        .unwrap_or_else(|| vault_root.to_path_buf());

    Ok(AgentDefinition {
        name,
        abbreviation,
        prompt_path,
        input_paths,
        output_path,
        output_kind,
        executor,
        executor_override: None,
        timeout: Duration::from_secs(timeout_secs),
        max_parallel,
        priority,
        trigger_exclude_glob: node.trigger_exclude_glob.clone(),
        trigger_content_regex,
        input_pattern: node.input_pattern.clone(),
        post_process,
        cron: node.cron.clone(),
        create_task: node.create_task,
    })
}

fn parse_executor(name: &str) -> Executor {
    match name {
        "gemini_cli" | "gemini" => Executor::GeminiCli,
        "codex_cli" | "codex" => Executor::CodexCli,
        "custom_script" => Executor::CustomScript,
        _ => Executor::ClaudeCode,
    }
}

fn parse_priority(name: Option<&str>) -> Priority {
    match name {
        Some("low") => Priority::Low,
        Some("high") => Priority::High,
        _ => Priority::Medium,
    }
}

fn validate_cron(abbr: &str, expr: &str) -> Result<(), ConfigError> {
    cron::Schedule::try_from(normalize_cron(expr).as_str()).map_err(|e| ConfigError::InvalidCron {
        abbr: abbr.to_string(),
        expr: expr.to_string(),
        reason: e.to_string(),
    })?;
    Ok(())
}

/// The `cron` crate expects a leading seconds field; accept the standard
/// 5-field form and prepend `0` for seconds.
fn normalize_cron(expr: &str) -> String {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// Scan `prompts_dir` for a file whose name contains `({ABBR})`. First match
/// (by sorted name) wins; a collision is logged, not fatal.
fn find_prompt_file(prompts_dir: &Path, abbr: &str) -> Result<PathBuf, ConfigError> {
    let needle = format!("({abbr})");
    let mut candidates = Vec::new();

    if let Ok(entries) = fs::read_dir(prompts_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "md") {
                if let Some(file_name) = path.file_name().and_then(|n| n.to_str()) {
                    if file_name.contains(&needle) {
                        candidates.push(path);
                    }
                }
            }
        }
    }

    if candidates.is_empty() {
        return Err(ConfigError::MissingPromptFile {
            abbr: abbr.to_string(),
            prompts_dir: prompts_dir.to_path_buf(),
        });
    }

    candidates.sort();
    if candidates.len() > 1 {
        tracing::warn!(
            abbr,
            prompts_dir = %prompts_dir.display(),
            candidates = ?candidates,
            "multiple prompt files match this agent, using the first by sorted name"
        );
    }
    Ok(candidates.remove(0))
}

/// Load `secrets.yaml` next to `orchestrator.yaml`, if present. Returns an
/// empty `Secrets` when the file is absent — secrets are optional.
fn load_secrets(vault_root: &Path) -> Result<Secrets, ConfigError> {
    let path = vault_root.join("secrets.yaml");
    if !path.exists() {
        return Ok(Secrets::empty());
    }
    let content = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    let values: HashMap<String, String> =
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Yaml { path, source })?;
    tracing::info!(count = values.len(), "loaded secrets");
    Ok(Secrets { values })
}

/// Find the vault root by searching upward for `orchestrator.yaml`.
pub fn find_vault_root(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        if dir.join("orchestrator.yaml").exists() {
            return Some(dir);
        }
        if !dir.pop() {
            return None;
        }
    }
}
