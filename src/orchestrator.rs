//! The orchestrator core — the central event loop that ties the agent
//! registry, task manager, execution manager, file monitor, cron scheduler,
//! and poller manager together.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use std::sync::Mutex as StdMutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::agent::{AgentDefinition, AgentRegistry};
use crate::config::{OrchestratorSettings, PollerSettings};
use crate::cron_sched::CronScheduler;
use crate::error::OrchestratorError;
use crate::event::{Event, EventKind};
use crate::exec::{self, ExecutionContext};
use crate::poller::{CopyPoller, PollerManager};
use crate::slots::ExecutionSlotTable;
use crate::task::{TaskManager, TaskStatus};

/// Non-terminal tasks older than this, found on startup, are orphans from
/// a previous crashed or killed run.
const ORPHAN_GRACE_PERIOD: chrono::Duration = chrono::Duration::hours(1);

/// How long in-flight workers are given to finish once shutdown begins.
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub struct Orchestrator {
    settings: Arc<OrchestratorSettings>,
    registry: Arc<AgentRegistry>,
    task_manager: Arc<TaskManager>,
    slots: Arc<ExecutionSlotTable>,
    cron_scheduler: CronScheduler,
    poller_manager: PollerManager,
    worker_handles: Arc<StdMutex<Vec<JoinHandle<()>>>>,
}

impl Orchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        agents: Vec<AgentDefinition>,
        poller_settings: Vec<PollerSettings>,
    ) -> Result<Self, OrchestratorError> {
        let task_manager = TaskManager::new(settings.tasks_dir.clone());
        recover_orphans(&task_manager, Utc::now())?;

        let registry = AgentRegistry::new(agents);
        let cron_scheduler = CronScheduler::new(registry.agents(), Utc::now())?;

        let mut poller_manager = PollerManager::new();
        for poller_cfg in &poller_settings {
            poller_manager.register(Box::new(CopyPoller::new(poller_cfg)), poller_cfg.poll_interval);
        }

        let max_concurrent = settings.max_concurrent;
        Ok(Self {
            settings: Arc::new(settings),
            registry: Arc::new(registry),
            task_manager: Arc::new(task_manager),
            slots: Arc::new(ExecutionSlotTable::new(max_concurrent)),
            cron_scheduler,
            poller_manager,
            worker_handles: Arc::new(StdMutex::new(Vec::new())),
        })
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Drive the central loop until a shutdown signal arrives.
    pub async fn run(mut self) -> Result<(), OrchestratorError> {
        let (event_tx, mut event_rx) = mpsc::channel::<Event>(256);

        let input_paths: Vec<String> = self
            .registry
            .agents()
            .iter()
            .flat_map(|a| a.input_paths.clone())
            .collect();
        let _file_monitor = crate::watch::FileMonitor::start(
            &self.settings.vault_root,
            input_paths,
            event_tx.clone(),
        )?;

        let poller_handles = std::mem::replace(&mut self.poller_manager, PollerManager::new()).spawn_all();

        let poll_interval = self.settings.poll_interval;

        loop {
            let deadline = tokio::time::Instant::now() + poll_interval;
            loop {
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    break;
                }
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("shutdown signal received");
                        self.join_workers(DEFAULT_SHUTDOWN_GRACE).await;
                        for handle in poller_handles {
                            handle.abort();
                        }
                        return Ok(());
                    }
                    maybe_event = event_rx.recv() => {
                        if let Some(event) = maybe_event {
                            self.dispatch(event).await;
                        }
                    }
                    _ = tokio::time::sleep(deadline - now) => {
                        break;
                    }
                }
            }

            let fired = self.cron_scheduler.tick(Utc::now());
            for event in fired {
                self.dispatch(event).await;
            }

            self.drain_one_queued_task().await;
        }
    }

    /// Match the event against the registry and, for each matching agent,
    /// either launch a worker immediately or queue a task file.
    pub async fn dispatch(&self, event: Event) {
        let agents = self.registry.match_event(&event);
        for agent in agents {
            let title = trigger_title(&event, agent);

            match self.task_manager.has_active_task_for(&agent.abbreviation, &title) {
                Ok(true) => {
                    tracing::debug!(agent = %agent.abbreviation, title, "duplicate trigger, skipping");
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "could not check for duplicate task, proceeding anyway");
                }
            }

            if let Some(guard) = self.slots.reserve(&agent.abbreviation, agent.max_parallel) {
                self.spawn_worker(agent.clone(), event.clone(), title, guard);
            } else {
                let trigger_data = trigger_data_json(&event);
                if let Err(e) = self.task_manager.create_task(
                    agent,
                    &title,
                    TaskStatus::Queued,
                    agent.executor.canonical_name().to_string(),
                    event.path().map(path_to_string),
                    Some(trigger_data),
                ) {
                    tracing::warn!(agent = %agent.abbreviation, error = %e, "failed to queue task");
                }
            }
        }
    }

    /// Peek the oldest `QUEUED` task across all agents; if a slot frees up
    /// for its agent, promote it to `IN_PROGRESS` and spawn a worker. At
    /// most one per loop iteration, to avoid thrashing.
    async fn drain_one_queued_task(&self) {
        let queued = match self.task_manager.list_queued() {
            Ok(q) => q,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list queued tasks");
                return;
            }
        };

        for task in queued {
            let Some(agent) = self.registry.by_name_or_abbr(&task.agent_abbr) else {
                continue;
            };
            let Some(guard) = self.slots.reserve(&agent.abbreviation, agent.max_parallel) else {
                continue;
            };

            if let Err(e) = self.task_manager.update_status(&task.path, TaskStatus::InProgress, None) {
                tracing::warn!(path = %task.path.display(), error = %e, "failed to promote queued task");
                continue;
            }

            let event = event_from_trigger_data(agent, task.trigger_data, task.created);
            let ctx = ExecutionContext {
                agent: agent.clone(),
                task_path: task.path,
                trigger_path: event.path().map(PathBuf::from),
                start_time: Utc::now().into(),
            };
            self.spawn_execution(ctx, guard);
            break;
        }
    }

    fn spawn_worker(
        &self,
        agent: AgentDefinition,
        event: Event,
        title: String,
        guard: crate::slots::SlotGuard,
    ) {
        let task_manager = Arc::clone(&self.task_manager);
        let worker = agent.executor.canonical_name().to_string();
        let trigger_path = event.path().map(|p| p.to_path_buf());
        let start_time = Utc::now().into();

        let task_path = match task_manager.create_task(
            &agent,
            &title,
            TaskStatus::InProgress,
            worker,
            trigger_path.as_ref().map(|p| path_to_string(p)),
            None,
        ) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(agent = %agent.abbreviation, error = %e, "failed to create task file");
                return;
            }
        };

        let ctx = ExecutionContext {
            agent,
            task_path,
            trigger_path,
            start_time,
        };
        self.spawn_execution(ctx, guard);
    }

    fn spawn_execution(&self, ctx: ExecutionContext, guard: crate::slots::SlotGuard) {
        let settings = Arc::clone(&self.settings);
        let task_manager = Arc::clone(&self.task_manager);

        let handle = tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = exec::execute(ctx, &settings, &task_manager).await {
                tracing::warn!(error = %e, "agent execution failed");
            }
        });

        self.worker_handles.lock().unwrap().push(handle);
    }

    /// Wait up to `grace` for every worker spawned so far to finish. Used
    /// both at shutdown and by the one-shot `trigger` CLI command, which
    /// needs the process to stay alive until its dispatched worker
    /// completes. Tasks still `IN_PROGRESS` past the grace period are left
    /// on disk for the next startup's orphan recovery.
    pub async fn join_workers(&self, grace: Duration) {
        let pending: Vec<JoinHandle<()>> = std::mem::take(&mut *self.worker_handles.lock().unwrap());
        let joined = tokio::time::timeout(grace, async {
            for handle in pending {
                let _ = handle.await;
            }
        })
        .await;
        if joined.is_err() {
            tracing::warn!("shutdown grace period elapsed with workers still running");
        }
    }
}

fn path_to_string(path: &std::path::Path) -> String {
    path.to_string_lossy().to_string()
}

fn trigger_title(event: &Event, agent: &AgentDefinition) -> String {
    match event.path() {
        Some(path) => path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| agent.name.clone()),
        None => agent.name.clone(),
    }
}

fn trigger_data_json(event: &Event) -> serde_json::Value {
    serde_json::json!({
        "kind": format!("{:?}", event.kind),
        "path": event.path().map(path_to_string),
        "agent_name": event.agent_name(),
    })
}

fn event_from_trigger_data(
    agent: &AgentDefinition,
    trigger_data: Option<serde_json::Value>,
    created: chrono::DateTime<Utc>,
) -> Event {
    let path = trigger_data
        .as_ref()
        .and_then(|v| v.get("path"))
        .and_then(|v| v.as_str())
        .map(PathBuf::from);

    Event {
        kind: if path.is_some() { EventKind::Created } else { EventKind::Manual },
        path,
        time: created.into(),
        agent_name: Some(agent.name.clone()),
    }
}

/// On startup, any task in a non-terminal status whose `created` timestamp
/// predates `now - ORPHAN_GRACE_PERIOD` is transitioned to `FAILED` with a
/// note in its process log. Fresh `QUEUED` tasks remain untouched and
/// eligible for draining.
fn recover_orphans(task_manager: &TaskManager, now: chrono::DateTime<Utc>) -> Result<(), OrchestratorError> {
    let tasks_dir = task_manager.tasks_dir();
    if !tasks_dir.exists() {
        return Ok(());
    }

    for entry in fs::read_dir(tasks_dir).map_err(OrchestratorError::Io)? {
        let entry = entry.map_err(OrchestratorError::Io)?;
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "md") {
            continue;
        }
        let Ok(frontmatter) = task_manager.read_frontmatter(&path) else {
            continue;
        };
        if frontmatter.status.is_terminal() {
            continue;
        }
        if now - frontmatter.created < ORPHAN_GRACE_PERIOD {
            continue;
        }

        if let Err(e) = task_manager.update_status(&path, TaskStatus::Failed, None) {
            tracing::warn!(path = %path.display(), error = %e, "failed to mark orphaned task as FAILED");
            continue;
        }
        let _ = task_manager.append_process_log(&path, "orphaned on restart");
    }

    Ok(())
}
