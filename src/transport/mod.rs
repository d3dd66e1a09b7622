//! Message delivery between the master and its agents.
//!
//! A [`Transport`] fans jobs out to agents and hands their replies to the
//! master through a single inbound queue:
//!
//! - **publish**: best-effort delivery of a job to each of its targets
//! - **subscribe**: take the inbound [`AgentReply`] queue (once)
//!
//! Replies from one agent arrive in the order it sent them; there is no
//! ordering across agents. Nothing is retried: a target that cannot be
//! reached is reported in the [`PublishReport`] and left to time out.
//!
//! # Implementations
//!
//! - [`LocalTransport`]: in-process channels, for tests and embedding
//! - [`TcpTransport`]: newline-delimited JSON frames over TCP

pub mod directory;
pub mod local;
pub mod tcp;
pub mod wire;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{DispatchError, Result};
use crate::jobs::{AgentReply, Job};

pub use directory::{AgentDirectory, AgentInfo};
pub use local::LocalTransport;
pub use tcp::TcpTransport;

/// Which targets a publish reached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub delivered: Vec<String>,
    pub undelivered: Vec<String>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `job` to every agent in `job.targets`. Unreachable agents are
    /// listed in the report, not returned as an error; `Err` means the
    /// transport itself is unusable.
    async fn publish(&self, job: &Job) -> Result<PublishReport>;

    /// Take the inbound reply queue. Only one subscriber is supported.
    fn subscribe(&self) -> Result<mpsc::Receiver<AgentReply>>;

    /// Agents this transport currently knows about.
    async fn agents(&self) -> Vec<AgentInfo>;
}

/// The agent's end of a connection: jobs in, replies out.
#[derive(Debug)]
pub struct AgentLink {
    pub agent_id: String,
    pub jobs: mpsc::Receiver<Job>,
    pub replies: mpsc::Sender<AgentReply>,
}

/// Inbound reply queue whose receiver can be taken exactly once.
#[derive(Debug)]
pub(crate) struct ReplyQueue {
    tx: mpsc::Sender<AgentReply>,
    rx: std::sync::Mutex<Option<mpsc::Receiver<AgentReply>>>,
}

impl ReplyQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: std::sync::Mutex::new(Some(rx)),
        }
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<AgentReply> {
        self.tx.clone()
    }

    pub(crate) fn take(&self) -> Result<mpsc::Receiver<AgentReply>> {
        self.rx
            .lock()
            .map_err(|_| DispatchError::Internal("reply queue lock poisoned".to_string()))?
            .take()
            .ok_or_else(|| DispatchError::Transport("already subscribed".to_string()))
    }
}
