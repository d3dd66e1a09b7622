use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};

use crate::config::TransportConfig;
use crate::error::{DispatchError, Result};
use crate::jobs::{AgentReply, Job};
use crate::transport::{AgentDirectory, AgentInfo, AgentLink, PublishReport, ReplyQueue, Transport};

/// In-process transport: every agent gets its own job channel and shares the
/// master's reply queue. Local agents never miss heartbeats.
#[derive(Debug)]
pub struct LocalTransport {
    directory: RwLock<AgentDirectory>,
    replies: ReplyQueue,
    job_buffer: usize,
    closed: AtomicBool,
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new(&TransportConfig::default())
    }
}

impl LocalTransport {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            directory: RwLock::new(AgentDirectory::new(u64::MAX)),
            replies: ReplyQueue::new(config.reply_buffer),
            job_buffer: config.job_buffer,
            closed: AtomicBool::new(false),
        }
    }

    /// Attach an agent and return its end of the link.
    pub async fn connect(&self, agent_id: impl Into<String>) -> AgentLink {
        let agent_id = agent_id.into();
        let (tx, rx) = mpsc::channel(self.job_buffer);
        self.directory.write().await.register(&agent_id, tx);
        AgentLink {
            agent_id,
            jobs: rx,
            replies: self.replies.sender(),
        }
    }

    /// Detach an agent; jobs published afterwards count as undelivered.
    pub async fn disconnect(&self, agent_id: &str) -> bool {
        self.directory.write().await.remove(agent_id)
    }

    /// Inject a reply as if an agent had sent it.
    pub async fn deliver(&self, reply: AgentReply) -> Result<()> {
        self.replies
            .sender()
            .send(reply)
            .await
            .map_err(|_| DispatchError::Transport("reply queue closed".to_string()))
    }

    /// Refuse further publishes.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn publish(&self, job: &Job) -> Result<PublishReport> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::Transport("transport closed".to_string()));
        }
        Ok(self.directory.read().await.fan_out(job))
    }

    fn subscribe(&self) -> Result<mpsc::Receiver<AgentReply>> {
        self.replies.take()
    }

    async fn agents(&self) -> Vec<AgentInfo> {
        self.directory.read().await.infos()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::ReplyPayload;
    use std::time::Duration;

    fn job(targets: &[&str]) -> Job {
        Job::new(
            "test.ping".to_string(),
            Vec::new(),
            targets.iter().map(|s| s.to_string()).collect(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn publish_reaches_connected_agents_only() {
        let transport = LocalTransport::default();
        let mut link = transport.connect("a").await;

        let j = job(&["a", "b"]);
        let report = transport.publish(&j).await.unwrap();
        assert_eq!(report.delivered, vec!["a".to_string()]);
        assert_eq!(report.undelivered, vec!["b".to_string()]);
        assert_eq!(link.jobs.recv().await.unwrap().id, j.id);
    }

    #[tokio::test]
    async fn replies_flow_to_subscriber() {
        let transport = LocalTransport::default();
        let link = transport.connect("a").await;
        let mut replies = transport.subscribe().unwrap();

        let j = job(&["a"]);
        link.replies
            .send(AgentReply::new(j.id, "a", ReplyPayload::Success("true".into())))
            .await
            .unwrap();
        let reply = replies.recv().await.unwrap();
        assert_eq!(reply.job_id, j.id);
        assert_eq!(reply.agent_id, "a");
    }

    #[tokio::test]
    async fn disconnected_agent_is_undelivered() {
        let transport = LocalTransport::default();
        let _link = transport.connect("a").await;
        transport.disconnect("a").await;

        let report = transport.publish(&job(&["a"])).await.unwrap();
        assert!(report.delivered.is_empty());
        assert!(transport.agents().await.is_empty());
    }

    #[tokio::test]
    async fn closed_transport_refuses_publish() {
        let transport = LocalTransport::default();
        transport.close();
        assert!(matches!(
            transport.publish(&job(&["a"])).await,
            Err(DispatchError::Transport(_))
        ));
    }
}
