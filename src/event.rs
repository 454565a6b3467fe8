//! The unified event type fed into the orchestrator core.
//!
//! File-system events, cron ticks, and manual invocations are all normalised
//! into this one shape before they reach `AgentRegistry::match_event`.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Modified,
    Cron,
    Manual,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub path: Option<PathBuf>,
    pub time: SystemTime,
    /// Set only for `Cron`/`Manual` events, naming the agent directly.
    pub agent_name: Option<String>,
}

impl Event {
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn agent_name(&self) -> Option<&str> {
        self.agent_name.as_deref()
    }

    pub fn cron(agent_name: String, fire_time: SystemTime) -> Self {
        Event {
            kind: EventKind::Cron,
            path: None,
            time: fire_time,
            agent_name: Some(agent_name),
        }
    }

    pub fn manual(agent_name: String, path: Option<PathBuf>) -> Self {
        Event {
            kind: EventKind::Manual,
            path,
            time: SystemTime::now(),
            agent_name: Some(agent_name),
        }
    }
}
