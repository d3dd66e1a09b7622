use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::jobs::Job;
use crate::transport::PublishReport;

/// Connection state of one agent
#[derive(Debug, Clone)]
pub struct AgentState {
    pub id: String,
    pub connected_at: DateTime<Utc>,
    pub last_seen: Instant,
    connection: u64,
    sender: mpsc::Sender<Job>,
}

impl AgentState {
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn is_alive(&self, timeout_ms: u64) -> bool {
        self.last_seen.elapsed().as_millis() < timeout_ms as u128
    }
}

/// Agent as reported to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentInfo {
    pub id: String,
    pub connected_at: DateTime<Utc>,
    pub last_seen_ms: u64,
    pub alive: bool,
}

/// Tracks connected agents and where to send their jobs
#[derive(Debug)]
pub struct AgentDirectory {
    agents: HashMap<String, AgentState>,
    agent_timeout_ms: u64,
    next_connection: u64,
}

impl AgentDirectory {
    pub fn new(agent_timeout_ms: u64) -> Self {
        Self {
            agents: HashMap::new(),
            agent_timeout_ms,
            next_connection: 0,
        }
    }

    /// Register an agent connection. A newer connection for the same id
    /// replaces the older one. Returns a token for [`Self::unregister`].
    pub fn register(&mut self, agent_id: &str, sender: mpsc::Sender<Job>) -> u64 {
        self.next_connection += 1;
        let connection = self.next_connection;
        let replaced = self
            .agents
            .insert(
                agent_id.to_string(),
                AgentState {
                    id: agent_id.to_string(),
                    connected_at: Utc::now(),
                    last_seen: Instant::now(),
                    connection,
                    sender,
                },
            )
            .is_some();

        if replaced {
            tracing::info!(agent_id, "Agent reconnected, replacing previous connection");
        } else {
            tracing::info!(agent_id, "Agent registered");
        }
        connection
    }

    /// Remove an agent, but only if `connection` is still its current one.
    pub fn unregister(&mut self, agent_id: &str, connection: u64) -> bool {
        match self.agents.get(agent_id) {
            Some(state) if state.connection == connection => {
                self.agents.remove(agent_id);
                tracing::info!(agent_id, "Agent unregistered");
                true
            }
            _ => false,
        }
    }

    /// Remove an agent regardless of which connection registered it.
    pub fn remove(&mut self, agent_id: &str) -> bool {
        let removed = self.agents.remove(agent_id).is_some();
        if removed {
            tracing::info!(agent_id, "Agent removed");
        }
        removed
    }

    /// Record activity from an agent
    pub fn touch(&mut self, agent_id: &str) {
        if let Some(state) = self.agents.get_mut(agent_id) {
            state.touch();
        }
    }

    pub fn is_alive(&self, agent_id: &str) -> bool {
        self.agents
            .get(agent_id)
            .is_some_and(|a| a.is_alive(self.agent_timeout_ms))
    }

    /// Ids of agents that stopped sending heartbeats
    pub fn dead_agents(&self) -> Vec<String> {
        self.agents
            .values()
            .filter(|a| !a.is_alive(self.agent_timeout_ms))
            .map(|a| a.id.clone())
            .collect()
    }

    pub fn infos(&self) -> Vec<AgentInfo> {
        let mut infos: Vec<AgentInfo> = self
            .agents
            .values()
            .map(|a| AgentInfo {
                id: a.id.clone(),
                connected_at: a.connected_at,
                last_seen_ms: a.last_seen.elapsed().as_millis() as u64,
                alive: a.is_alive(self.agent_timeout_ms),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Hand `job` to each live target's queue without waiting. Full queues,
    /// closed queues, dead and unknown agents all count as undelivered.
    pub fn fan_out(&self, job: &Job) -> PublishReport {
        let mut report = PublishReport::default();

        for target in &job.targets {
            let Some(state) = self.agents.get(target) else {
                tracing::debug!(job_id = %job.id, agent_id = %target, "Target not connected");
                report.undelivered.push(target.clone());
                continue;
            };
            if !state.is_alive(self.agent_timeout_ms) {
                tracing::debug!(job_id = %job.id, agent_id = %target, "Target missed heartbeats");
                report.undelivered.push(target.clone());
                continue;
            }

            match state.sender.try_send(job.clone()) {
                Ok(()) => report.delivered.push(target.clone()),
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(job_id = %job.id, agent_id = %target, "Agent queue full");
                    report.undelivered.push(target.clone());
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(job_id = %job.id, agent_id = %target, "Agent queue closed");
                    report.undelivered.push(target.clone());
                }
            }
        }

        report
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn job(targets: &[&str]) -> Job {
        Job::new(
            "test.ping".to_string(),
            Vec::new(),
            targets.iter().map(|s| s.to_string()).collect(),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn register_and_unregister() {
        let mut dir = AgentDirectory::new(5000);
        let (tx, _rx) = mpsc::channel(1);
        let conn = dir.register("a", tx);
        assert!(dir.is_alive("a"));
        assert_eq!(dir.infos()[0].id, "a");

        assert!(dir.unregister("a", conn));
        assert!(dir.is_empty());
    }

    #[test]
    fn stale_connection_does_not_unregister_replacement() {
        let mut dir = AgentDirectory::new(5000);
        let (tx1, _rx1) = mpsc::channel(1);
        let (tx2, _rx2) = mpsc::channel(1);
        let old = dir.register("a", tx1);
        let new = dir.register("a", tx2);
        assert_ne!(old, new);

        assert!(!dir.unregister("a", old));
        assert_eq!(dir.len(), 1);
        assert!(dir.unregister("a", new));
    }

    #[test]
    fn agents_time_out_without_heartbeat() {
        let mut dir = AgentDirectory::new(50);
        let (tx, _rx) = mpsc::channel(1);
        dir.register("a", tx);
        assert!(dir.dead_agents().is_empty());

        std::thread::sleep(Duration::from_millis(80));
        assert!(!dir.is_alive("a"));
        assert!(!dir.infos()[0].alive);
        assert_eq!(dir.dead_agents(), vec!["a".to_string()]);

        dir.touch("a");
        assert!(dir.is_alive("a"));
    }

    #[test]
    fn fan_out_reports_delivery_per_target() {
        let mut dir = AgentDirectory::new(5000);
        let (tx, mut rx) = mpsc::channel(1);
        dir.register("a", tx);

        let j = job(&["a", "missing"]);
        let report = dir.fan_out(&j);
        assert_eq!(report.delivered, vec!["a".to_string()]);
        assert_eq!(report.undelivered, vec!["missing".to_string()]);
        assert_eq!(rx.try_recv().unwrap().id, j.id);
    }

    #[test]
    fn fan_out_does_not_block_on_full_queue() {
        let mut dir = AgentDirectory::new(5000);
        let (tx, _rx) = mpsc::channel(1);
        dir.register("a", tx);

        assert_eq!(dir.fan_out(&job(&["a"])).delivered.len(), 1);
        let report = dir.fan_out(&job(&["a"]));
        assert_eq!(report.undelivered, vec!["a".to_string()]);
    }
}
