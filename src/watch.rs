//! File monitor — wraps a recursive filesystem watcher rooted at the vault
//! and normalises its events into the crate's unified `Event` type.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use notify::{Event as NotifyEvent, EventKind as NotifyEventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::error::OrchestratorError;
use crate::event::{Event, EventKind};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Owns the underlying `notify` watcher; dropping it stops the watch.
pub struct FileMonitor {
    _watcher: RecommendedWatcher,
}

impl FileMonitor {
    /// Start watching `vault_root` recursively, forwarding normalised
    /// events that fall under one of `input_paths` onto `tx`.
    pub fn start(
        vault_root: &Path,
        input_paths: Vec<String>,
        tx: mpsc::Sender<Event>,
    ) -> Result<Self, OrchestratorError> {
        let root = vault_root.to_path_buf();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<NotifyEvent>| {
            let notify_event = match res {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(error = %e, "file watcher error");
                    return;
                }
            };
            for event in normalise(&notify_event, &root, &input_paths) {
                if tx.blocking_send(event).is_err() {
                    tracing::debug!("event receiver dropped, watcher event discarded");
                }
            }
        })
        .map_err(|e| OrchestratorError::Watcher(e.to_string()))?;

        watcher
            .watch(vault_root, RecursiveMode::Recursive)
            .map_err(|e| OrchestratorError::Watcher(e.to_string()))?;

        Ok(Self { _watcher: watcher })
    }

    pub fn channel() -> (mpsc::Sender<Event>, mpsc::Receiver<Event>) {
        mpsc::channel(EVENT_CHANNEL_CAPACITY)
    }
}

/// Turn one `notify` event into zero or more of our `Event`s, applying the
/// ignore/rename rules.
fn normalise(event: &NotifyEvent, vault_root: &Path, input_paths: &[String]) -> Vec<Event> {
    let kind = match classify(&event.kind) {
        Some(k) => k,
        None => return Vec::new(),
    };

    event
        .paths
        .iter()
        .filter(|p| p.is_file())
        .filter(|p| is_watched(p, vault_root, input_paths))
        .map(|p| Event {
            kind,
            path: Some(p.clone()),
            time: SystemTime::now(),
            agent_name: None,
        })
        .collect()
}

/// Classify a raw `notify::EventKind`, dropping deletes and treating any
/// rename as a `Created` on its destination — editors that save via
/// temp-file-plus-rename must still trigger downstream agents.
fn classify(kind: &NotifyEventKind) -> Option<EventKind> {
    use notify::event::{CreateKind, ModifyKind, RenameMode};

    match kind {
        NotifyEventKind::Create(CreateKind::File) | NotifyEventKind::Create(CreateKind::Any) => {
            Some(EventKind::Created)
        }
        NotifyEventKind::Modify(ModifyKind::Name(RenameMode::To))
        | NotifyEventKind::Modify(ModifyKind::Name(RenameMode::Any)) => Some(EventKind::Created),
        NotifyEventKind::Modify(ModifyKind::Name(RenameMode::From)) => None,
        NotifyEventKind::Modify(_) => Some(EventKind::Modified),
        NotifyEventKind::Remove(_) => None,
        _ => None,
    }
}

/// `input_paths` are absolute (the registry resolves them against the vault
/// root at config load time), so no relative-path juggling is needed here.
fn is_watched(path: &Path, _vault_root: &Path, input_paths: &[String]) -> bool {
    input_paths.iter().any(|input| {
        path.starts_with(input)
            || glob::Pattern::new(input)
                .map(|p| p.matches_path(path))
                .unwrap_or(false)
    })
}
