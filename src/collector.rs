use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::DispatchError;
use crate::jobs::{AgentReply, JobRegistry};

/// Counters kept by the result collector.
#[derive(Debug, Default)]
pub struct CollectorStats {
    accepted: AtomicU64,
    ignored: AtomicU64,
    unknown_job: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CollectorSnapshot {
    pub accepted: u64,
    pub ignored: u64,
    pub unknown_job: u64,
}

impl CollectorStats {
    pub fn snapshot(&self) -> CollectorSnapshot {
        CollectorSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            unknown_job: self.unknown_job.load(Ordering::Relaxed),
        }
    }
}

/// Consumes agent replies and records them against in-flight jobs.
///
/// Replies for jobs the registry no longer knows (late, spurious, or for a
/// run that was abandoned and swept) are dropped and counted, never surfaced
/// to a caller. Completing a job wakes its waiter through the registry's
/// completion signal.
pub struct ResultCollector {
    registry: Arc<JobRegistry>,
    stats: Arc<CollectorStats>,
}

impl ResultCollector {
    pub fn new(registry: Arc<JobRegistry>, stats: Arc<CollectorStats>) -> Self {
        Self { registry, stats }
    }

    /// Process replies until the queue closes or `shutdown` fires.
    pub async fn run(self, mut replies: mpsc::Receiver<AgentReply>, shutdown: CancellationToken) {
        tracing::debug!("Result collector started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                reply = replies.recv() => match reply {
                    Some(reply) => self.handle_reply(reply).await,
                    None => {
                        tracing::info!("Reply queue closed, collector stopping");
                        break;
                    }
                },
            }
        }
    }

    pub async fn handle_reply(&self, reply: AgentReply) {
        let job_id = reply.job_id;
        let agent_id = reply.agent_id.clone();

        match self.registry.record_reply(reply).await {
            Ok(true) => {
                self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(job_id = %job_id, agent_id = %agent_id, "Reply recorded");
            }
            Ok(false) => {
                self.stats.ignored.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(job_id = %job_id, agent_id = %agent_id, "Duplicate or unsolicited reply ignored");
            }
            Err(DispatchError::UnknownJob(_)) => {
                self.stats.unknown_job.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(job_id = %job_id, agent_id = %agent_id, "Discarding reply for unknown job");
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, agent_id = %agent_id, error = %e, "Failed to record reply");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{Job, ReplyPayload};
    use std::time::Duration;
    use tokio::time::Instant;

    fn setup() -> (Arc<JobRegistry>, Arc<CollectorStats>, ResultCollector) {
        let registry = Arc::new(JobRegistry::new());
        let stats = Arc::new(CollectorStats::default());
        let collector = ResultCollector::new(registry.clone(), stats.clone());
        (registry, stats, collector)
    }

    fn ok(job: &Job, agent: &str) -> AgentReply {
        AgentReply::new(job.id, agent, ReplyPayload::Success("ok".to_string()))
    }

    #[tokio::test]
    async fn counts_each_outcome() {
        let (registry, stats, collector) = setup();
        let job = Job::new(
            "test.ping".to_string(),
            Vec::new(),
            ["a".to_string()].into_iter().collect(),
            Duration::from_secs(5),
        );
        registry
            .create(job.clone(), Instant::now() + Duration::from_secs(60))
            .await
            .unwrap();

        collector.handle_reply(ok(&job, "a")).await;
        collector.handle_reply(ok(&job, "a")).await;
        let orphan = Job::new(
            "test.ping".to_string(),
            Vec::new(),
            ["a".to_string()].into_iter().collect(),
            Duration::from_secs(5),
        );
        collector.handle_reply(ok(&orphan, "a")).await;

        assert_eq!(
            stats.snapshot(),
            CollectorSnapshot {
                accepted: 1,
                ignored: 1,
                unknown_job: 1,
            }
        );
    }

    #[tokio::test]
    async fn stops_when_queue_closes() {
        let (_registry, _stats, collector) = setup();
        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(collector.run(rx, CancellationToken::new()));
        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn stops_on_shutdown() {
        let (_registry, _stats, collector) = setup();
        let (_tx, rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(collector.run(rx, shutdown.clone()));
        shutdown.cancel();
        handle.await.unwrap();
    }
}
