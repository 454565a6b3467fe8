//! The task manager — every execution attempt is a markdown file with
//! frontmatter, read and rewritten with a real lifecycle state machine
//! (`QUEUED -> IN_PROGRESS -> {PROCESSED, FAILED, TIMEOUT, NEEDS_INPUT}`).

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::agent::{AgentDefinition, Priority};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    InProgress,
    Processed,
    Failed,
    Timeout,
    NeedsInput,
}

impl TaskStatus {
    /// Whether `self -> next` is a legal transition per the lifecycle in
    /// the task file format: `QUEUED -> IN_PROGRESS -> {PROCESSED, FAILED,
    /// TIMEOUT, NEEDS_INPUT}`, with terminal states never transitioning.
    /// `QUEUED -> FAILED` is also legal directly, for orphan recovery on
    /// restart.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, InProgress)
                | (Queued, Failed)
                | (InProgress, Processed)
                | (InProgress, Failed)
                | (InProgress, Timeout)
                | (InProgress, NeedsInput)
        )
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Queued | TaskStatus::InProgress)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Queued => "QUEUED",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Processed => "PROCESSED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Timeout => "TIMEOUT",
            TaskStatus::NeedsInput => "NEEDS_INPUT",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "QUEUED" => Ok(TaskStatus::Queued),
            "IN_PROGRESS" => Ok(TaskStatus::InProgress),
            "PROCESSED" => Ok(TaskStatus::Processed),
            "FAILED" => Ok(TaskStatus::Failed),
            "TIMEOUT" => Ok(TaskStatus::Timeout),
            "NEEDS_INPUT" => Ok(TaskStatus::NeedsInput),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Enough of a task's frontmatter to drain it, returned by `list_queued`.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub path: PathBuf,
    pub agent_abbr: String,
    pub created: DateTime<Utc>,
    pub trigger_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct TaskFrontmatter {
    pub agent: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub created: DateTime<Utc>,
    pub input_file: Option<String>,
    pub output_file: Option<String>,
    pub worker: String,
    pub trigger_data_json: Option<serde_json::Value>,
}

pub struct TaskManager {
    tasks_dir: PathBuf,
}

const MAX_FILENAME_BYTES: usize = 250;
const ELLIPSIS: &str = "...";

impl TaskManager {
    pub fn new(tasks_dir: PathBuf) -> Self {
        Self { tasks_dir }
    }

    pub fn tasks_dir(&self) -> &Path {
        &self.tasks_dir
    }

    /// Create a new task file, resolving filename collisions with a
    /// monotonic `-2`, `-3`, ... suffix.
    pub fn create_task(
        &self,
        agent: &AgentDefinition,
        trigger_title: &str,
        status: TaskStatus,
        worker: String,
        input_file: Option<String>,
        trigger_data_json: Option<serde_json::Value>,
    ) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.tasks_dir)?;

        let now = Utc::now();
        let base_name = sanitize_filename(&now, &agent.abbreviation, trigger_title);

        let mut candidate = self.tasks_dir.join(&base_name);
        let mut counter = 2;
        while candidate.exists() {
            let suffixed = with_counter_suffix(&base_name, counter);
            candidate = self.tasks_dir.join(suffixed);
            counter += 1;
        }

        let frontmatter = TaskFrontmatter {
            agent: agent.name.clone(),
            status,
            priority: agent.priority,
            created: now,
            input_file,
            output_file: None,
            worker,
            trigger_data_json,
        };

        let content = render_task_file(&frontmatter, &[]);
        write_atomic(&candidate, &content)?;
        Ok(candidate)
    }

    /// Rewrite the frontmatter in place (write-temp-then-rename), refusing
    /// illegal lifecycle transitions.
    pub fn update_status(
        &self,
        task_path: &Path,
        new_status: TaskStatus,
        output_file: Option<String>,
    ) -> io::Result<()> {
        let content = fs::read_to_string(task_path)?;
        let (mut frontmatter, body) = parse_task_file(&content)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed task file"))?;

        if !frontmatter.status.can_transition_to(new_status) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "illegal task transition {} -> {}",
                    frontmatter.status, new_status
                ),
            ));
        }

        frontmatter.status = new_status;
        if output_file.is_some() {
            frontmatter.output_file = output_file;
        }

        let new_content = render_task_file(&frontmatter, &body);
        write_atomic(task_path, &new_content)
    }

    /// Append a timestamped line to `## Process Log`, inserting the section
    /// if missing. Best-effort: callers should not fail the surrounding
    /// execution if this errors.
    pub fn append_process_log(&self, task_path: &Path, line: &str) -> io::Result<()> {
        let content = fs::read_to_string(task_path)?;
        let (frontmatter, mut body) = parse_task_file(&content)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed task file"))?;

        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S");
        let entry = format!("[{timestamp}] {line}");

        if let Some(idx) = body.iter().position(|l| l == "## Process Log") {
            body.insert(idx + 1, entry);
        } else {
            body.push("## Process Log".to_string());
            body.push(entry);
        }

        let new_content = render_task_file(&frontmatter, &body);
        write_atomic(task_path, &new_content)
    }

    /// Scan the tasks directory for `QUEUED` tasks, sorted by `created`
    /// ascending (ties broken by filename for determinism).
    pub fn list_queued(&self) -> io::Result<Vec<QueuedTask>> {
        if !self.tasks_dir.exists() {
            return Ok(Vec::new());
        }

        let mut queued = Vec::new();
        for entry in fs::read_dir(&self.tasks_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "md") {
                continue;
            }
            let content = fs::read_to_string(&path)?;
            let Some((frontmatter, _)) = parse_task_file(&content) else {
                continue;
            };
            if frontmatter.status != TaskStatus::Queued {
                continue;
            }
            let abbr = frontmatter
                .worker
                .clone();
            queued.push(QueuedTask {
                path: path.clone(),
                agent_abbr: extract_abbr_from_agent_name(&frontmatter.agent)
                    .unwrap_or(abbr),
                created: frontmatter.created,
                trigger_data: frontmatter.trigger_data_json,
            });
        }

        queued.sort_by(|a, b| {
            a.created
                .cmp(&b.created)
                .then_with(|| a.path.cmp(&b.path))
        });
        Ok(queued)
    }

    /// Find every task whose (date, abbr, sanitised-title) matches and whose
    /// status is non-terminal — used by the core to deduplicate firings.
    pub fn has_active_task_for(&self, abbr: &str, trigger_title: &str) -> io::Result<bool> {
        if !self.tasks_dir.exists() {
            return Ok(false);
        }
        let today = Utc::now();
        let expected_prefix = sanitize_filename(&today, abbr, trigger_title);
        let expected_stem = expected_prefix.trim_end_matches(".md").to_string();

        for entry in fs::read_dir(&self.tasks_dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem != expected_stem && !stem.starts_with(&format!("{expected_stem}-")) {
                continue;
            }
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            if let Some((frontmatter, _)) = parse_task_file(&content) {
                if !frontmatter.status.is_terminal() {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    pub fn read_frontmatter(&self, task_path: &Path) -> io::Result<TaskFrontmatter> {
        let content = fs::read_to_string(task_path)?;
        parse_task_file(&content)
            .map(|(fm, _)| fm)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed task file"))
    }
}

fn extract_abbr_from_agent_name(name: &str) -> Option<String> {
    crate::agent::derive_abbreviation(name)
}

/// Build the `YYYY-MM-DD {ABBR} - {title}.md` filename, truncated so the
/// full name fits within 250 UTF-8 *bytes* (not code points), preserving
/// the date/abbr prefix and appending an ellipsis when truncated.
pub fn sanitize_filename(date: &DateTime<Utc>, abbr: &str, raw_title: &str) -> String {
    let title = sanitize_title(raw_title);
    let prefix = format!("{} {} - ", date.format("%Y-%m-%d"), abbr);
    let suffix = ".md";

    let budget = MAX_FILENAME_BYTES
        .saturating_sub(prefix.len())
        .saturating_sub(suffix.len());

    if title.len() <= budget {
        return format!("{prefix}{title}{suffix}");
    }

    let ellipsis_budget = budget.saturating_sub(ELLIPSIS.len());
    let truncated = truncate_to_byte_boundary(&title, ellipsis_budget);
    format!("{prefix}{truncated}{ELLIPSIS}{suffix}")
}

/// Strip directory components, drop the extension, and replace characters
/// illegal in filenames on common filesystems.
fn sanitize_title(raw: &str) -> String {
    let file_name = Path::new(raw)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(raw);

    file_name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
            c => c,
        })
        .collect()
}

/// Truncate a `&str` to at most `max_bytes` bytes without splitting a
/// multi-byte UTF-8 sequence.
fn truncate_to_byte_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn with_counter_suffix(base_name: &str, counter: u32) -> String {
    let stem = base_name.trim_end_matches(".md");
    format!("{stem}-{counter}.md")
}

fn write_atomic(path: &Path, content: &str) -> io::Result<()> {
    let tmp_path = path.with_extension("md.tmp");
    fs::write(&tmp_path, content)?;
    fs::rename(&tmp_path, path)
}

fn render_task_file(fm: &TaskFrontmatter, body: &[String]) -> String {
    let mut out = String::new();
    out.push_str("---\n");
    out.push_str(&format!("agent: \"{}\"\n", fm.agent));
    out.push_str(&format!("status: {}\n", fm.status));
    out.push_str(&format!("priority: {:?}\n", fm.priority).to_lowercase());
    out.push_str(&format!(
        "created: {}\n",
        fm.created.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    ));
    if let Some(input) = &fm.input_file {
        out.push_str(&format!("input_file: \"[[{input}]]\"\n"));
    }
    if let Some(output) = &fm.output_file {
        out.push_str(&format!("output_file: \"[[{output}]]\"\n"));
    }
    out.push_str(&format!("worker: {}\n", fm.worker));
    if let Some(trigger) = &fm.trigger_data_json {
        out.push_str(&format!(
            "trigger_data_json: '{}'\n",
            serde_json::to_string(trigger).unwrap_or_default()
        ));
    }
    out.push_str("---\n\n");

    if body.is_empty() {
        out.push_str("## Process Log\n");
    } else {
        for line in body {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

fn parse_task_file(content: &str) -> Option<(TaskFrontmatter, Vec<String>)> {
    if !content.starts_with("---") {
        return None;
    }
    let end = content[3..].find("---")? + 3;
    let frontmatter_block = &content[3..end];
    let body: Vec<String> = content[end + 3..]
        .trim_start_matches('\n')
        .lines()
        .map(|l| l.to_string())
        .collect();

    let agent = extract_field(frontmatter_block, "agent")?
        .trim_matches('"')
        .to_string();
    let status: TaskStatus = extract_field(frontmatter_block, "status")?.parse().ok()?;
    let priority = match extract_field(frontmatter_block, "priority").as_deref() {
        Some("high") => Priority::High,
        Some("low") => Priority::Low,
        _ => Priority::Medium,
    };
    let created_str = extract_field(frontmatter_block, "created")?;
    let created = DateTime::parse_from_rfc3339(&created_str)
        .ok()?
        .with_timezone(&Utc);
    let input_file = extract_field(frontmatter_block, "input_file")
        .map(|v| strip_wiki_link(&v));
    let output_file = extract_field(frontmatter_block, "output_file")
        .map(|v| strip_wiki_link(&v));
    let worker = extract_field(frontmatter_block, "worker").unwrap_or_default();
    let trigger_data_json = extract_field(frontmatter_block, "trigger_data_json")
        .and_then(|v| serde_json::from_str(v.trim_matches('\'')).ok());

    Some((
        TaskFrontmatter {
            agent,
            status,
            priority,
            created,
            input_file,
            output_file,
            worker,
            trigger_data_json,
        },
        body,
    ))
}

fn strip_wiki_link(raw: &str) -> String {
    raw.trim_matches('"')
        .trim_start_matches("[[")
        .trim_end_matches("]]")
        .to_string()
}

fn extract_field(frontmatter: &str, key: &str) -> Option<String> {
    for line in frontmatter.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix(key) {
            if let Some(value) = rest.strip_prefix(':') {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}
