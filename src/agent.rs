//! Agent definitions and the registry that matches events to them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use glob::Pattern;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::event::Event;

/// Which external CLI executes an agent's prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Executor {
    ClaudeCode,
    GeminiCli,
    CodexCli,
    CustomScript,
}

impl Executor {
    /// The canonical binary name this executor resolves to on PATH.
    pub fn canonical_name(&self) -> &'static str {
        match self {
            Executor::ClaudeCode => "claude",
            Executor::GeminiCli => "gemini",
            Executor::CodexCli => "codex",
            Executor::CustomScript => "custom_script",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    NewFile,
    UpdateFile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostProcess {
    RemoveTriggerContent,
}

/// An agent definition, immutable after load.
#[derive(Debug, Clone)]
pub struct AgentDefinition {
    pub name: String,
    pub abbreviation: String,
    pub prompt_path: PathBuf,
    pub input_paths: Vec<String>,
    pub output_path: PathBuf,
    pub output_kind: OutputKind,
    pub executor: Executor,
    pub executor_override: Option<PathBuf>,
    pub timeout: Duration,
    pub max_parallel: usize,
    pub priority: Priority,
    pub trigger_exclude_glob: Option<String>,
    pub trigger_content_regex: Option<Regex>,
    pub input_pattern: Option<String>,
    pub post_process: Option<PostProcess>,
    pub cron: Option<String>,
    pub create_task: bool,
}

/// Extract the `ABBR` from a `"Full Name (ABBR)"` style agent name.
///
/// The abbreviation is the last parenthesised group in the name, and must
/// be 3-4 uppercase ASCII letters to count.
pub fn derive_abbreviation(name: &str) -> Option<String> {
    let open = name.rfind('(')?;
    let close = name[open..].find(')')? + open;
    let candidate = &name[open + 1..close];
    if (3..=4).contains(&candidate.len())
        && candidate.chars().all(|c| c.is_ascii_uppercase())
    {
        Some(candidate.to_string())
    } else {
        None
    }
}

/// Holds every loaded agent and answers "which agents match this event?".
pub struct AgentRegistry {
    agents: Vec<AgentDefinition>,
}

impl AgentRegistry {
    pub fn new(agents: Vec<AgentDefinition>) -> Self {
        Self { agents }
    }

    pub fn agents(&self) -> &[AgentDefinition] {
        &self.agents
    }

    pub fn by_name_or_abbr(&self, needle: &str) -> Option<&AgentDefinition> {
        self.agents
            .iter()
            .find(|a| a.name == needle || a.abbreviation == needle)
    }

    /// Find every agent definition that fires for the given event.
    ///
    /// Cron and manual events carry an explicit `agent_name` and bypass all
    /// path/content rules entirely — they name their target directly.
    pub fn match_event(&self, event: &Event) -> Vec<&AgentDefinition> {
        if let Some(name) = event.agent_name() {
            return self
                .by_name_or_abbr(name)
                .into_iter()
                .collect();
        }

        let path = match event.path() {
            Some(p) => p,
            None => return Vec::new(),
        };

        self.agents
            .iter()
            .filter(|agent| !agent.input_paths.is_empty())
            .filter(|agent| self.path_matches(agent, path))
            .filter(|agent| self.extension_matches(agent, path))
            .filter(|agent| !self.excluded(agent, path))
            .filter(|agent| self.content_matches(agent, path))
            .collect()
    }

    /// `.md` always matches; an agent's `input_pattern` glob extends this to
    /// other extensions or names (e.g. `"*.txt"`, `"inbox/*.eml"`).
    fn extension_matches(&self, agent: &AgentDefinition, path: &Path) -> bool {
        if path.extension().is_some_and(|ext| ext == "md") {
            return true;
        }
        agent
            .input_pattern
            .as_deref()
            .and_then(|p| Pattern::new(p).ok())
            .is_some_and(|pattern| pattern.matches_path(path))
    }

    fn path_matches(&self, agent: &AgentDefinition, path: &Path) -> bool {
        agent.input_paths.iter().any(|input| {
            if let Ok(pattern) = Pattern::new(input) {
                if pattern.matches_path(path) {
                    return true;
                }
            }
            // Also treat the entry as a directory prefix, not just a glob.
            path.starts_with(input)
        })
    }

    fn excluded(&self, agent: &AgentDefinition, path: &Path) -> bool {
        match &agent.trigger_exclude_glob {
            Some(glob_str) => Pattern::new(glob_str)
                .map(|p| p.matches_path(path))
                .unwrap_or(false),
            None => false,
        }
    }

    fn content_matches(&self, agent: &AgentDefinition, path: &Path) -> bool {
        let regex = match &agent.trigger_content_regex {
            Some(r) => r,
            None => return true,
        };

        const MAX_BYTES: usize = 64 * 1024;
        let content = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(_) => {
                tracing::debug!(path = %path.display(), "file vanished before content match, skipping");
                return false;
            }
        };
        let truncated = &content[..content.len().min(MAX_BYTES)];
        let text = String::from_utf8_lossy(truncated);
        regex.is_match(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use std::time::SystemTime;

    fn sample_agent(name: &str) -> AgentDefinition {
        AgentDefinition {
            name: name.to_string(),
            abbreviation: derive_abbreviation(name).unwrap(),
            prompt_path: PathBuf::from("prompts/x.md"),
            input_paths: vec!["Ingest/Clippings".to_string()],
            output_path: PathBuf::from("AI/Articles"),
            output_kind: OutputKind::NewFile,
            executor: Executor::ClaudeCode,
            executor_override: None,
            timeout: Duration::from_secs(1800),
            max_parallel: 3,
            priority: Priority::Medium,
            trigger_exclude_glob: None,
            trigger_content_regex: None,
            input_pattern: None,
            post_process: None,
            cron: None,
            create_task: true,
        }
    }

    #[test]
    fn derives_abbreviation_from_trailing_parens() {
        assert_eq!(
            derive_abbreviation("Email Inbox Clipper (EIC)"),
            Some("EIC".to_string())
        );
        assert_eq!(
            derive_abbreviation("Goal Digest Reviewer (GDR)"),
            Some("GDR".to_string())
        );
    }

    #[test]
    fn rejects_lowercase_or_wrong_length() {
        assert_eq!(derive_abbreviation("Something (eic)"), None);
        assert_eq!(derive_abbreviation("Something (AB)"), None);
        assert_eq!(derive_abbreviation("Something (ABCDE)"), None);
        assert_eq!(derive_abbreviation("Something without parens"), None);
    }

    #[test]
    fn picks_last_parenthesised_group() {
        assert_eq!(
            derive_abbreviation("Some (Note) Thing (GDR)"),
            Some("GDR".to_string())
        );
    }

    #[test]
    fn matches_path_inside_input_dir() {
        let registry = AgentRegistry::new(vec![sample_agent("Clipper (EIC)")]);
        let event = Event {
            kind: EventKind::Created,
            path: Some(PathBuf::from("Ingest/Clippings/hello.md")),
            time: SystemTime::now(),
            agent_name: None,
        };
        let matches = registry.match_event(&event);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].abbreviation, "EIC");
    }

    #[test]
    fn rejects_non_markdown_extension() {
        let registry = AgentRegistry::new(vec![sample_agent("Clipper (EIC)")]);
        let event = Event {
            kind: EventKind::Created,
            path: Some(PathBuf::from("Ingest/Clippings/hello.txt")),
            time: SystemTime::now(),
            agent_name: None,
        };
        assert!(registry.match_event(&event).is_empty());
    }

    #[test]
    fn input_pattern_extends_beyond_markdown() {
        let mut agent = sample_agent("Clipper (EIC)");
        agent.input_pattern = Some("**/*.txt".to_string());
        let registry = AgentRegistry::new(vec![agent]);
        let event = Event {
            kind: EventKind::Created,
            path: Some(PathBuf::from("Ingest/Clippings/hello.txt")),
            time: SystemTime::now(),
            agent_name: None,
        };
        let matches = registry.match_event(&event);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].abbreviation, "EIC");

        let unrelated_event = Event {
            kind: EventKind::Created,
            path: Some(PathBuf::from("Ingest/Clippings/hello.csv")),
            time: SystemTime::now(),
            agent_name: None,
        };
        assert!(registry.match_event(&unrelated_event).is_empty());
    }

    #[test]
    fn exclude_glob_drops_event() {
        let mut agent = sample_agent("Clipper (EIC)");
        agent.trigger_exclude_glob = Some("**/draft-*.md".to_string());
        let registry = AgentRegistry::new(vec![agent]);
        let event = Event {
            kind: EventKind::Created,
            path: Some(PathBuf::from("Ingest/Clippings/draft-hello.md")),
            time: SystemTime::now(),
            agent_name: None,
        };
        assert!(registry.match_event(&event).is_empty());
    }

    #[test]
    fn content_regex_requires_match() {
        let dir = tempfile::tempdir().unwrap();
        let input_dir = dir.path().join("Ingest/Clippings");
        std::fs::create_dir_all(&input_dir).unwrap();
        let matching = input_dir.join("note1.md");
        let not_matching = input_dir.join("note2.md");
        std::fs::write(&matching, "%% #ai %%\nbody").unwrap();
        std::fs::write(&not_matching, "nothing interesting here").unwrap();

        let mut agent = sample_agent("Clipper (EIC)");
        agent.input_paths = vec![input_dir.to_string_lossy().to_string()];
        agent.trigger_content_regex = Some(Regex::new(r"%%\s*#ai\b[^%]*%%").unwrap());
        let registry = AgentRegistry::new(vec![agent]);

        let matching_event = Event {
            kind: EventKind::Created,
            path: Some(matching),
            time: SystemTime::now(),
            agent_name: None,
        };
        let not_matching_event = Event {
            kind: EventKind::Created,
            path: Some(not_matching),
            time: SystemTime::now(),
            agent_name: None,
        };
        assert_eq!(registry.match_event(&matching_event).len(), 1);
        assert!(registry.match_event(&not_matching_event).is_empty());
    }

    #[test]
    fn cron_event_bypasses_path_rules() {
        let mut agent = sample_agent("Digest Reviewer (GDR)");
        agent.input_paths = Vec::new();
        agent.cron = Some("0 1 * * *".to_string());
        let registry = AgentRegistry::new(vec![agent]);

        let event = Event {
            kind: EventKind::Cron,
            path: None,
            time: SystemTime::now(),
            agent_name: Some("Digest Reviewer (GDR)".to_string()),
        };
        let matches = registry.match_event(&event);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].abbreviation, "GDR");
    }

    #[test]
    fn unknown_manual_agent_returns_empty() {
        let registry = AgentRegistry::new(vec![sample_agent("Clipper (EIC)")]);
        let event = Event {
            kind: EventKind::Manual,
            path: None,
            time: SystemTime::now(),
            agent_name: Some("Nonexistent (ZZZ)".to_string()),
        };
        assert!(registry.match_event(&event).is_empty());
    }
}
