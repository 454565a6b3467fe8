//! Cron scheduler — tracks the next fire time for every cron-bearing agent
//! and emits a cron `Event` once `now` passes it.

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;

use crate::agent::AgentDefinition;
use crate::error::ConfigError;
use crate::event::Event;

struct CronEntry {
    agent_name: String,
    schedule: Schedule,
    next_fire: DateTime<Utc>,
}

pub struct CronScheduler {
    entries: Vec<CronEntry>,
}

impl CronScheduler {
    /// Build a scheduler from every agent carrying a `cron` expression,
    /// seeding each entry's first `next_fire` from `now`.
    pub fn new(agents: &[AgentDefinition], now: DateTime<Utc>) -> Result<Self, ConfigError> {
        let mut entries = Vec::new();
        for agent in agents {
            let Some(expr) = &agent.cron else { continue };
            let schedule = parse(&agent.abbreviation, expr)?;
            let next_fire = schedule.after(&now).next().unwrap_or(now);
            entries.push(CronEntry {
                agent_name: agent.name.clone(),
                schedule,
                next_fire,
            });
        }
        Ok(Self { entries })
    }

    /// Check every entry against `now`; for each one due, emit its event
    /// and recompute `next_fire` strictly after `now` — this is what makes
    /// a missed window (e.g. host sleep) fire at most once on wake, rather
    /// than once per missed tick.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<Event> {
        let mut fired = Vec::new();
        for entry in &mut self.entries {
            if now >= entry.next_fire {
                fired.push(Event::cron(entry.agent_name.clone(), now.into()));
                if let Some(next) = entry.schedule.after(&now).next() {
                    entry.next_fire = next;
                }
            }
        }
        fired
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The `cron` crate's `Schedule` expects a leading seconds field; accept
/// the standard 5-field form and prepend `0`.
fn parse(abbr: &str, expr: &str) -> Result<Schedule, ConfigError> {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| ConfigError::InvalidCron {
        abbr: abbr.to_string(),
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Executor, OutputKind, Priority};
    use std::path::PathBuf;
    use std::time::Duration;

    fn cron_agent(name: &str, expr: &str) -> AgentDefinition {
        AgentDefinition {
            name: name.to_string(),
            abbreviation: crate::agent::derive_abbreviation(name).unwrap(),
            prompt_path: PathBuf::from("prompts/x.md"),
            input_paths: Vec::new(),
            output_path: PathBuf::from("out"),
            output_kind: OutputKind::NewFile,
            executor: Executor::ClaudeCode,
            executor_override: None,
            timeout: Duration::from_secs(60),
            max_parallel: 1,
            priority: Priority::Medium,
            trigger_exclude_glob: None,
            trigger_content_regex: None,
            input_pattern: None,
            post_process: None,
            cron: Some(expr.to_string()),
            create_task: true,
        }
    }

    #[test]
    fn fires_once_when_now_passes_next_fire() {
        let now = DateTime::parse_from_rfc3339("2026-01-01T01:00:00Z").unwrap().with_timezone(&Utc);
        let agent = cron_agent("Goal Digest Reviewer (GDR)", "0 1 * * *");
        let mut scheduler = CronScheduler::new(&[agent], now - chrono::Duration::hours(2)).unwrap();

        let fired = scheduler.tick(now);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].agent_name().unwrap(), "Goal Digest Reviewer (GDR)");
    }

    #[test]
    fn does_not_fire_before_next_fire_time() {
        let now = DateTime::parse_from_rfc3339("2026-01-01T00:30:00Z").unwrap().with_timezone(&Utc);
        let agent = cron_agent("Goal Digest Reviewer (GDR)", "0 1 * * *");
        let mut scheduler = CronScheduler::new(&[agent], now - chrono::Duration::hours(2)).unwrap();

        let fired = scheduler.tick(now);
        assert!(fired.is_empty());
    }

    #[test]
    fn missed_window_after_sleep_fires_at_most_once() {
        // Daily at 01:00; simulate waking up 3 days later. Even though
        // three windows were missed, a single tick must fire exactly once.
        let start = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let agent = cron_agent("Goal Digest Reviewer (GDR)", "0 1 * * *");
        let mut scheduler = CronScheduler::new(&[agent], start).unwrap();

        let woke_up = DateTime::parse_from_rfc3339("2026-01-04T09:00:00Z").unwrap().with_timezone(&Utc);
        let fired = scheduler.tick(woke_up);
        assert_eq!(fired.len(), 1);

        // Next tick at the same moment must not refire.
        let fired_again = scheduler.tick(woke_up);
        assert!(fired_again.is_empty());
    }

    #[test]
    fn invalid_cron_expression_is_rejected() {
        let agent = cron_agent("Goal Digest Reviewer (GDR)", "not a cron expr");
        let now = Utc::now();
        assert!(CronScheduler::new(&[agent], now).is_err());
    }

    #[test]
    fn agents_without_cron_are_skipped() {
        let mut agent = cron_agent("Goal Digest Reviewer (GDR)", "0 1 * * *");
        agent.cron = None;
        let now = Utc::now();
        let scheduler = CronScheduler::new(&[agent], now).unwrap();
        assert!(scheduler.is_empty());
    }
}
