//! End-to-end CLI tests driving the compiled binary against a scratch vault.

use assert_cmd::Command;
use predicates::str::contains;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command as StdCommand};
use std::time::{Duration, Instant};

fn fixture_script() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/custom_script")
}

fn slow_fixture_script() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/slow_script")
}

/// Start `run` as a detached background process against `root`, for
/// scenarios the blocking, one-shot `trigger` command can't exercise
/// (content-pattern gating, cron firing, concurrent overload).
fn spawn_run(root: &Path) -> Child {
    StdCommand::new(env!("CARGO_BIN_EXE_vault-orchestrator"))
        .args(["--root", root.to_str().unwrap(), "run"])
        .spawn()
        .expect("failed to spawn run subprocess")
}

fn kill(mut child: Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Read every task frontmatter `status:` line under `tasks_dir`.
fn task_statuses(tasks_dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(tasks_dir) else { return Vec::new() };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| fs::read_to_string(e.path()).ok())
        .filter_map(|content| {
            content
                .lines()
                .find(|l| l.trim_start().starts_with("status:"))
                .map(|l| l.trim_start_matches("status:").trim().to_string())
        })
        .collect()
}

/// Poll `condition` every 100ms until it's true or `timeout` elapses.
fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

fn write_vault(dir: &Path, orchestrator_yaml: &str) {
    fs::create_dir_all(dir.join("Prompts")).unwrap();
    fs::write(
        dir.join("Prompts").join("clipper-(EIC).md"),
        "# Email Inbox Clipper\nSummarize the clipping.\n",
    )
    .unwrap();
    fs::write(dir.join("orchestrator.yaml"), orchestrator_yaml).unwrap();
}

fn base_yaml(executor_command: &str) -> String {
    format!(
        r#"
orchestrator:
  prompts_dir: Prompts
  tasks_dir: Tasks
  logs_dir: Logs
  max_concurrent: 2
  executors:
    custom_script:
      command: "{executor_command}"
nodes:
  - type: agent
    name: "Email Inbox Clipper (EIC)"
    input_path: ["Ingest/Clippings"]
    output_path: "AI/Articles"
    executor: custom_script
    max_parallel: 2
"#
    )
}

#[test]
fn show_config_prints_resolved_settings() {
    let dir = tempfile::tempdir().unwrap();
    write_vault(dir.path(), &base_yaml(&fixture_script().to_string_lossy()));

    Command::cargo_bin("vault-orchestrator")
        .unwrap()
        .args(["--root", dir.path().to_str().unwrap(), "show-config"])
        .assert()
        .success()
        .stdout(contains("max_concurrent:  2"))
        .stdout(contains("agents:          1"));
}

#[test]
fn list_agents_shows_abbreviation_and_executor() {
    let dir = tempfile::tempdir().unwrap();
    write_vault(dir.path(), &base_yaml(&fixture_script().to_string_lossy()));

    Command::cargo_bin("vault-orchestrator")
        .unwrap()
        .args(["--root", dir.path().to_str().unwrap(), "list-agents"])
        .assert()
        .success()
        .stdout(contains("EIC"))
        .stdout(contains("custom_script"));
}

#[test]
fn missing_config_exits_with_code_two() {
    let dir = tempfile::tempdir().unwrap();

    Command::cargo_bin("vault-orchestrator")
        .unwrap()
        .args(["--root", dir.path().to_str().unwrap(), "show-config"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn trigger_unknown_agent_fails() {
    let dir = tempfile::tempdir().unwrap();
    write_vault(dir.path(), &base_yaml(&fixture_script().to_string_lossy()));

    Command::cargo_bin("vault-orchestrator")
        .unwrap()
        .args(["--root", dir.path().to_str().unwrap(), "trigger", "Nonexistent"])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn trigger_runs_the_custom_script_executor_and_produces_output() {
    let dir = tempfile::tempdir().unwrap();
    write_vault(dir.path(), &base_yaml(&fixture_script().to_string_lossy()));
    fs::create_dir_all(dir.path().join("Ingest/Clippings")).unwrap();
    let trigger_file = dir.path().join("Ingest/Clippings/hello.md");
    fs::write(&trigger_file, "clipped content").unwrap();

    Command::cargo_bin("vault-orchestrator")
        .unwrap()
        .args(["--root", dir.path().to_str().unwrap(), "trigger", "EIC"])
        .assert()
        .success();

    let tasks_dir = dir.path().join("Tasks");
    let task_files: Vec<_> = fs::read_dir(&tasks_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(task_files.len(), 1, "expected exactly one task file to be created");

    let content = fs::read_to_string(task_files[0].path()).unwrap();
    assert!(content.contains("status: PROCESSED"), "task should be marked PROCESSED:\n{content}");

    let output_dir = dir.path().join("AI/Articles");
    assert!(output_dir.exists(), "executor should have created its output directory");
    let outputs: Vec<_> = fs::read_dir(&output_dir).unwrap().filter_map(|e| e.ok()).collect();
    assert_eq!(outputs.len(), 1, "expected exactly one output file");
}

/// Scenario: a slow executor plus more trigger files than `max_concurrent`
/// leaves the excess tasks `QUEUED` instead of running them all at once.
#[test]
fn overload_beyond_max_concurrent_queues_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    write_vault(dir.path(), &base_yaml(&slow_fixture_script().to_string_lossy()));
    fs::create_dir_all(dir.path().join("Ingest/Clippings")).unwrap();
    for name in ["one.md", "two.md", "three.md"] {
        fs::write(dir.path().join("Ingest/Clippings").join(name), format!("clip {name}")).unwrap();
    }

    let child = spawn_run(dir.path());
    let tasks_dir = dir.path().join("Tasks");

    let saw_overload = wait_until(Duration::from_secs(8), || {
        task_statuses(&tasks_dir).iter().filter(|s| *s == "QUEUED").count() >= 1
            && task_statuses(&tasks_dir).iter().filter(|s| *s == "IN_PROGRESS").count() == 2
    });
    kill(child);

    assert!(
        saw_overload,
        "expected 2 IN_PROGRESS and at least 1 QUEUED task, got: {:?}",
        task_statuses(&tasks_dir)
    );
}

/// Scenario: only files matching `trigger_content_regex` produce a task;
/// this gating only applies to file-system-driven events, not `trigger`.
#[test]
fn content_pattern_gating_skips_non_matching_files() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = format!(
        r#"
orchestrator:
  prompts_dir: Prompts
  tasks_dir: Tasks
  logs_dir: Logs
  max_concurrent: 2
  executors:
    custom_script:
      command: "{command}"
nodes:
  - type: agent
    name: "Email Inbox Clipper (EIC)"
    input_path: ["Ingest/Clippings"]
    output_path: "AI/Articles"
    executor: custom_script
    max_parallel: 2
    trigger_content_regex: "TRIGGER_AI"
"#,
        command = fixture_script().to_string_lossy()
    );
    write_vault(dir.path(), &yaml);
    fs::create_dir_all(dir.path().join("Ingest/Clippings")).unwrap();
    fs::write(dir.path().join("Ingest/Clippings/matching.md"), "please TRIGGER_AI on this").unwrap();
    fs::write(dir.path().join("Ingest/Clippings/plain.md"), "nothing to see here").unwrap();

    let child = spawn_run(dir.path());
    let tasks_dir = dir.path().join("Tasks");

    wait_until(Duration::from_secs(5), || tasks_dir.exists() && fs::read_dir(&tasks_dir).map(|d| d.count() > 0).unwrap_or(false));
    std::thread::sleep(Duration::from_millis(500));
    kill(child);

    let task_files: Vec<_> = fs::read_dir(&tasks_dir).unwrap().filter_map(|e| e.ok()).collect();
    assert_eq!(task_files.len(), 1, "only the matching file should have created a task");
    let content = fs::read_to_string(task_files[0].path()).unwrap();
    assert!(content.contains("matching.md"), "task should be for matching.md:\n{content}");
}

/// Scenario: `post_process: remove_trigger_content` strips the matched
/// region from the trigger file once the agent succeeds.
#[test]
fn post_processing_removes_matched_trigger_content() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = format!(
        r#"
orchestrator:
  prompts_dir: Prompts
  tasks_dir: Tasks
  logs_dir: Logs
  max_concurrent: 2
  executors:
    custom_script:
      command: "{command}"
nodes:
  - type: agent
    name: "Email Inbox Clipper (EIC)"
    input_path: ["Ingest/Clippings"]
    output_path: "AI/Articles"
    executor: custom_script
    max_parallel: 2
    trigger_content_regex: "%%\\s*#ai\\b[^%]*%%"
    post_process: remove_trigger_content
"#,
        command = fixture_script().to_string_lossy()
    );
    write_vault(dir.path(), &yaml);
    fs::create_dir_all(dir.path().join("Ingest/Clippings")).unwrap();
    let trigger_file = dir.path().join("Ingest/Clippings/hello.md");
    fs::write(&trigger_file, "before %% #ai %% after").unwrap();

    Command::cargo_bin("vault-orchestrator")
        .unwrap()
        .args(["--root", dir.path().to_str().unwrap(), "trigger", "EIC", trigger_file.to_str().unwrap()])
        .assert()
        .success();

    let remaining = fs::read_to_string(&trigger_file).unwrap();
    assert!(!remaining.contains("#ai"), "trigger content should have been stripped:\n{remaining}");
    assert!(remaining.contains("before") && remaining.contains("after"), "surrounding text should survive:\n{remaining}");
}

/// Scenario: an agent with a `cron` expression fires on its own, without
/// any file-system trigger, driven purely by the `run` event loop.
#[test]
fn cron_agent_fires_without_a_file_trigger() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = format!(
        r#"
orchestrator:
  prompts_dir: Prompts
  tasks_dir: Tasks
  logs_dir: Logs
  max_concurrent: 2
  poll_interval: 0.5
  executors:
    custom_script:
      command: "{command}"
nodes:
  - type: agent
    name: "Email Inbox Clipper (EIC)"
    output_path: "AI/Articles"
    executor: custom_script
    max_parallel: 1
    cron: "*/1 * * * * *"
"#,
        command = fixture_script().to_string_lossy()
    );
    write_vault(dir.path(), &yaml);

    let child = spawn_run(dir.path());
    let tasks_dir = dir.path().join("Tasks");

    let fired = wait_until(Duration::from_secs(6), || {
        tasks_dir.exists() && fs::read_dir(&tasks_dir).map(|d| d.count() > 0).unwrap_or(false)
    });
    kill(child);

    assert!(fired, "cron-scheduled agent should have fired and created a task");
}

/// Scenario: an executor that outlives `timeout_secs` gets killed and its
/// task is marked `TIMEOUT`, not left `IN_PROGRESS` or `FAILED`.
#[test]
fn slow_executor_is_killed_on_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = format!(
        r#"
orchestrator:
  prompts_dir: Prompts
  tasks_dir: Tasks
  logs_dir: Logs
  max_concurrent: 2
  executors:
    custom_script:
      command: "{command}"
nodes:
  - type: agent
    name: "Email Inbox Clipper (EIC)"
    input_path: ["Ingest/Clippings"]
    output_path: "AI/Articles"
    executor: custom_script
    max_parallel: 2
    timeout_secs: 1
"#,
        command = slow_fixture_script().to_string_lossy()
    );
    write_vault(dir.path(), &yaml);
    fs::create_dir_all(dir.path().join("Ingest/Clippings")).unwrap();
    let trigger_file = dir.path().join("Ingest/Clippings/hello.md");
    fs::write(&trigger_file, "clipped content").unwrap();

    Command::cargo_bin("vault-orchestrator")
        .unwrap()
        .args(["--root", dir.path().to_str().unwrap(), "trigger", "EIC"])
        .assert()
        .success();

    let tasks_dir = dir.path().join("Tasks");
    let task_files: Vec<_> = fs::read_dir(&tasks_dir).unwrap().filter_map(|e| e.ok()).collect();
    assert_eq!(task_files.len(), 1);
    let content = fs::read_to_string(task_files[0].path()).unwrap();
    assert!(content.contains("status: TIMEOUT"), "task should be marked TIMEOUT:\n{content}");
}
