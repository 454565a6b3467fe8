//! Execution manager — resolves the executor binary, composes the prompt
//! contract, runs the subprocess, and validates its output.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::SystemTime;

use chrono::Utc;
use tokio::fs as tokio_fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::time::{timeout, Duration};

use crate::agent::{AgentDefinition, Executor, OutputKind, PostProcess};
use crate::config::OrchestratorSettings;
use crate::error::OrchestratorError;
use crate::task::{TaskManager, TaskStatus};

const TIMEOUT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Everything a single execution needs, assembled by `dispatch`.
pub struct ExecutionContext {
    pub agent: AgentDefinition,
    pub task_path: PathBuf,
    pub trigger_path: Option<PathBuf>,
    pub start_time: SystemTime,
}

/// Runs one agent execution to completion, updating the task file's
/// frontmatter and process log as it goes. Slot release is the caller's
/// responsibility (an `ExecutionSlotTable::reserve` guard held across the
/// call), so this function can return early on any error without leaking
/// accounting state.
pub async fn execute(
    ctx: ExecutionContext,
    settings: &OrchestratorSettings,
    task_manager: &TaskManager,
) -> Result<(), OrchestratorError> {
    let abbr = ctx.agent.abbreviation.clone();

    let binary = resolve_executor_binary(&ctx.agent, settings).ok_or_else(|| {
        OrchestratorError::ExecutorNotFound {
            abbr: abbr.clone(),
            executor: ctx.agent.executor.canonical_name().to_string(),
        }
    })?;

    let prompt = compose_prompt(&ctx).await.map_err(OrchestratorError::Io)?;

    tokio_fs::create_dir_all(&settings.logs_dir)
        .await
        .map_err(OrchestratorError::Io)?;
    let log_path = settings.logs_dir.join(log_file_name(&abbr, Utc::now()));

    let mut command = Command::new(&binary);
    command
        .current_dir(&settings.vault_root)
        .arg(&prompt)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let _ = task_manager.append_process_log(&ctx.task_path, &format!("spawning {}", binary.display()));

    let mut child = command.spawn().map_err(OrchestratorError::Io)?;

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");
    let log_path_out = log_path.clone();
    let log_path_err = log_path.clone();

    // Two independent reader tasks: a single task reading both pipes in
    // sequence risks deadlock if the child fills one pipe's buffer while
    // waiting on the other.
    let stdout_task = tokio::spawn(async move { drain_to_log(stdout, log_path_out, "stdout").await });
    let stderr_task = tokio::spawn(async move { drain_to_log(stderr, log_path_err, "stderr").await });

    let wait_result = timeout(ctx.agent.timeout, child.wait()).await;

    let exit_status = match wait_result {
        Ok(status) => status.map_err(OrchestratorError::Io)?,
        Err(_elapsed) => {
            terminate_with_grace(&mut child).await;
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            let _ = task_manager.update_status(&ctx.task_path, TaskStatus::Timeout, None);
            let _ = task_manager.append_process_log(
                &ctx.task_path,
                &format!("timed out after {}s", ctx.agent.timeout.as_secs()),
            );
            return Err(OrchestratorError::Timeout {
                abbr,
                timeout_secs: ctx.agent.timeout.as_secs(),
            });
        }
    };

    let _ = stdout_task.await;
    let _ = stderr_task.await;

    if !exit_status.success() {
        let code = exit_status.code().unwrap_or(-1);
        let _ = task_manager.update_status(&ctx.task_path, TaskStatus::Failed, None);
        let _ = task_manager.append_process_log(&ctx.task_path, &format!("exited with status {code}"));
        return Err(OrchestratorError::NonZeroExit { abbr, code });
    }

    let validated_output = validate_output(&ctx).await;

    match validated_output {
        Some(output_path) => {
            let _ = task_manager.update_status(
                &ctx.task_path,
                TaskStatus::Processed,
                Some(output_path.to_string_lossy().to_string()),
            );
            let _ = task_manager.append_process_log(&ctx.task_path, "output validated");
        }
        None => {
            let _ = task_manager.update_status(&ctx.task_path, TaskStatus::NeedsInput, None);
            let _ = task_manager.append_process_log(&ctx.task_path, "no validated output found");
            return Err(OrchestratorError::OutputValidation {
                abbr: abbr.clone(),
                output_path: ctx.agent.output_path.clone(),
            });
        }
    }

    if let Some(PostProcess::RemoveTriggerContent) = ctx.agent.post_process {
        run_post_process(&ctx).await.map_err(|reason| OrchestratorError::PostProcess {
            abbr: abbr.clone(),
            reason,
        })?;
    }

    Ok(())
}

/// Resolution order: config override, PATH lookup of the canonical name,
/// then (Windows only) `.cmd`/`.bat` on PATH, then `%APPDATA%/npm`.
fn resolve_executor_binary(agent: &AgentDefinition, settings: &OrchestratorSettings) -> Option<PathBuf> {
    if let Some(path) = &agent.executor_override {
        return Some(path.clone());
    }
    let name = agent.executor.canonical_name();
    if let Some(path) = settings.executor_overrides.get(name) {
        return Some(path.clone());
    }
    if let Some(found) = find_on_path(name) {
        return Some(found);
    }

    if cfg!(target_os = "windows") {
        for ext in ["cmd", "bat"] {
            if let Some(found) = find_on_path(&format!("{name}.{ext}")) {
                return Some(found);
            }
        }
        if let Ok(appdata) = env::var("APPDATA") {
            let candidate = PathBuf::from(appdata).join("npm").join(format!("{name}.cmd"));
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    None
}

/// `YYYY-MM-DDTHH-MM-SS-{ABBR}-{short-id}.log`, one file per execution. The
/// short id is the low 6 hex digits of the timestamp's sub-second nanos,
/// enough to disambiguate two executions of the same agent in the same
/// second without pulling in a UUID dependency.
fn log_file_name(abbr: &str, now: chrono::DateTime<Utc>) -> String {
    let short_id = now.timestamp_subsec_nanos() & 0xFFFFFF;
    format!("{}-{abbr}-{short_id:06x}.log", now.format("%Y-%m-%dT%H-%M-%S"))
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let path_var = env::var_os("PATH")?;
    for dir in env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Concatenate the agent's prompt file with an injected "Output contract"
/// preamble naming the task file, the expected output shape, and the
/// update the executor is expected to perform on exit.
async fn compose_prompt(ctx: &ExecutionContext) -> std::io::Result<String> {
    let prompt_body = tokio_fs::read_to_string(&ctx.agent.prompt_path).await?;
    let task_path = ctx.task_path.canonicalize().unwrap_or_else(|_| ctx.task_path.clone());

    let output_kind_desc = match ctx.agent.output_kind {
        OutputKind::NewFile => "create at least one new file",
        OutputKind::UpdateFile => "update the triggering input file",
    };

    let preamble = format!(
        "## Output contract\n\
         Task file: {task}\n\
         Output kind: {kind} ({desc}) under: {output_path}\n\
         When you finish, {kind_instr} {output_path}, then update the `status` field \
         in the task file's frontmatter to PROCESSED (or NEEDS_INPUT if you could not \
         complete the task), and append a line to its `## Process Log` section \
         describing what you did.\n\n",
        task = task_path.display(),
        kind = match ctx.agent.output_kind {
            OutputKind::NewFile => "new_file",
            OutputKind::UpdateFile => "update_file",
        },
        desc = output_kind_desc,
        output_path = ctx.agent.output_path.display(),
        kind_instr = output_kind_desc,
    );

    Ok(format!("{preamble}{prompt_body}"))
}

async fn drain_to_log<R>(reader: R, log_path: PathBuf, stream_name: &'static str)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut file = match tokio_fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .await
    {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(path = %log_path.display(), error = %e, "could not open execution log");
            return;
        }
    };

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let formatted = format!("[{stream_name}] {line}\n");
                if file.write_all(formatted.as_bytes()).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }
}

async fn terminate_with_grace(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        let _ = Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .output()
            .await;
    }

    if timeout(TIMEOUT_GRACE_PERIOD, child.wait()).await.is_err() {
        let _ = child.kill().await;
        let _ = child.wait().await;
    }
}

async fn validate_output(ctx: &ExecutionContext) -> Option<PathBuf> {
    match ctx.agent.output_kind {
        OutputKind::NewFile => find_file_newer_than(&ctx.agent.output_path, ctx.start_time).await,
        OutputKind::UpdateFile => {
            let trigger = ctx.trigger_path.as_ref()?;
            let modified = tokio_fs::metadata(trigger).await.ok()?.modified().ok()?;
            if modified > ctx.start_time {
                Some(trigger.clone())
            } else {
                None
            }
        }
    }
}

async fn find_file_newer_than(dir: &Path, since: SystemTime) -> Option<PathBuf> {
    let mut entries = tokio_fs::read_dir(dir).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let meta = entry.metadata().await.ok()?;
        if meta.is_file() {
            if let Ok(modified) = meta.modified() {
                if modified > since {
                    return Some(entry.path());
                }
            }
        }
    }
    None
}

/// `remove_trigger_content`: read the trigger file, strip the region that
/// matched `trigger_content_regex`, write back atomically.
async fn run_post_process(ctx: &ExecutionContext) -> Result<(), String> {
    let Some(trigger) = &ctx.trigger_path else {
        return Ok(());
    };
    let Some(regex) = &ctx.agent.trigger_content_regex else {
        return Ok(());
    };

    let content = tokio_fs::read_to_string(trigger)
        .await
        .map_err(|e| e.to_string())?;
    let stripped = regex.replace_all(&content, "");

    let tmp_path = trigger.with_extension("md.tmp");
    tokio_fs::write(&tmp_path, stripped.as_bytes())
        .await
        .map_err(|e| e.to_string())?;
    tokio_fs::rename(&tmp_path, trigger)
        .await
        .map_err(|e| e.to_string())?;
    Ok(())
}
