//! Poller manager — runs independent, isolated timers that pull files from
//! external sources into the vault for the File Monitor to pick up.

use std::path::PathBuf;
use std::time::Duration;

use crate::config::PollerSettings;
use crate::error::OrchestratorError;

/// A single external-ingestion capability. Implementors fetch from
/// wherever they fetch from and write files into `target_dir`.
pub trait Poller: Send + Sync {
    fn name(&self) -> &str;
    fn poll(&self) -> Result<(), OrchestratorError>;
}

/// Copies any file present in `source_dir` but absent from `target_dir`
/// into `target_dir`. The non-proprietary, testable stand-in for the
/// external pollers (photo libraries, voice transcript feeds, etc.) this
/// crate does not implement directly.
pub struct CopyPoller {
    name: String,
    source_dir: PathBuf,
    target_dir: PathBuf,
}

impl CopyPoller {
    pub fn new(settings: &PollerSettings) -> Self {
        Self {
            name: settings.name.clone(),
            source_dir: settings.source_dir.clone(),
            target_dir: settings.target_dir.clone(),
        }
    }
}

impl Poller for CopyPoller {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll(&self) -> Result<(), OrchestratorError> {
        if !self.source_dir.exists() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.target_dir).map_err(|e| OrchestratorError::Poller {
            name: self.name.clone(),
            reason: e.to_string(),
        })?;

        let entries = std::fs::read_dir(&self.source_dir).map_err(|e| OrchestratorError::Poller {
            name: self.name.clone(),
            reason: e.to_string(),
        })?;

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name() else { continue };
            let dest = self.target_dir.join(file_name);
            if dest.exists() {
                continue;
            }
            std::fs::copy(&path, &dest).map_err(|e| OrchestratorError::Poller {
                name: self.name.clone(),
                reason: format!("copying {}: {e}", path.display()),
            })?;
        }

        Ok(())
    }
}

/// Owns every configured poller and drives each on its own `tokio`
/// interval. A poller's failure is logged and never terminates the
/// orchestrator or any other poller.
pub struct PollerManager {
    pollers: Vec<(Box<dyn Poller>, Duration)>,
}

impl PollerManager {
    pub fn new() -> Self {
        Self { pollers: Vec::new() }
    }

    pub fn register(&mut self, poller: Box<dyn Poller>, interval: Duration) {
        self.pollers.push((poller, interval));
    }

    pub fn is_empty(&self) -> bool {
        self.pollers.is_empty()
    }

    /// Spawn one `tokio` task per poller, each on its own interval timer.
    /// Returns the join handles so the caller can fold them into shutdown.
    pub fn spawn_all(self) -> Vec<tokio::task::JoinHandle<()>> {
        self.pollers
            .into_iter()
            .map(|(poller, interval)| {
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    loop {
                        ticker.tick().await;
                        if let Err(e) = poller.poll() {
                            tracing::warn!(poller = poller.name(), error = %e, "poller failed, continuing");
                        }
                    }
                })
            })
            .collect()
    }
}

impl Default for PollerManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_new_files_from_source_to_target() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        let target = dir.path().join("target");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("photo1.md"), "content").unwrap();

        let poller = CopyPoller::new(&PollerSettings {
            name: "test_poller".to_string(),
            source_dir: source.clone(),
            target_dir: target.clone(),
            poll_interval: Duration::from_secs(60),
        });

        poller.poll().unwrap();
        assert!(target.join("photo1.md").exists());
    }

    #[test]
    fn does_not_overwrite_existing_target_files() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        let target = dir.path().join("target");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(source.join("photo1.md"), "new").unwrap();
        std::fs::write(target.join("photo1.md"), "existing").unwrap();

        let poller = CopyPoller::new(&PollerSettings {
            name: "test_poller".to_string(),
            source_dir: source,
            target_dir: target.clone(),
            poll_interval: Duration::from_secs(60),
        });

        poller.poll().unwrap();
        assert_eq!(std::fs::read_to_string(target.join("photo1.md")).unwrap(), "existing");
    }

    #[test]
    fn missing_source_dir_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let poller = CopyPoller::new(&PollerSettings {
            name: "test_poller".to_string(),
            source_dir: dir.path().join("missing"),
            target_dir: dir.path().join("target"),
            poll_interval: Duration::from_secs(60),
        });
        assert!(poller.poll().is_ok());
    }
}
