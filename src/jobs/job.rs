use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One dispatched command instance targeting a set of agents.
///
/// A job is immutable once dispatched: the registry, the transports and
/// every agent only ever read it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub command: String,
    pub arguments: Vec<String>,
    pub targets: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

impl Job {
    pub fn new(
        command: String,
        arguments: Vec<String>,
        targets: BTreeSet<String>,
        timeout: Duration,
    ) -> Self {
        Self::with_id(Uuid::new_v4(), command, arguments, targets, timeout)
    }

    pub fn with_id(
        id: Uuid,
        command: String,
        arguments: Vec<String>,
        targets: BTreeSet<String>,
        timeout: Duration,
    ) -> Self {
        let created_at = Utc::now();
        let deadline = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|d| created_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            id,
            command,
            arguments,
            targets,
            created_at,
            deadline,
        }
    }

    /// True once the wall-clock deadline has passed. Agents use this to skip
    /// work nobody is waiting for any more.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }

    /// Time left until the deadline, zero if it already passed.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.deadline - now).to_std().unwrap_or(Duration::ZERO)
    }
}
