use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::jobs::job::Job;
use crate::jobs::reply::{AgentReply, AgentResult};

const DEFAULT_MAX_JOBS: usize = 10_000;

/// Progress of one in-flight job.
///
/// `replies.keys()` and `outstanding` always partition `job.targets`.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub job: Job,
    pub replies: HashMap<String, AgentReply>,
    pub outstanding: BTreeSet<String>,
}

impl JobStatus {
    fn new(job: Job) -> Self {
        let outstanding = job.targets.clone();
        Self {
            job,
            replies: HashMap::new(),
            outstanding,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// Check that replies and outstanding agents partition the target set.
    pub fn is_consistent(&self) -> bool {
        let disjoint = self.replies.keys().all(|a| !self.outstanding.contains(a));
        let covered: BTreeSet<&String> = self
            .replies
            .keys()
            .chain(self.outstanding.iter())
            .collect();
        let targets: BTreeSet<&String> = self.job.targets.iter().collect();
        disjoint && covered == targets
    }

    /// Accept a reply if it is the first one from an outstanding agent.
    fn accept(&mut self, reply: AgentReply) -> bool {
        if !self.outstanding.remove(&reply.agent_id) {
            return false;
        }
        self.replies.insert(reply.agent_id.clone(), reply);
        true
    }

    /// Merge replies with a `Timeout` for every agent that never answered.
    pub fn into_results(self) -> BTreeMap<String, AgentResult> {
        let mut results: BTreeMap<String, AgentResult> = self
            .replies
            .into_iter()
            .map(|(agent, reply)| (agent, reply.payload.into()))
            .collect();
        for agent in self.outstanding {
            results.insert(agent, AgentResult::Timeout);
        }
        results
    }
}

/// Compact view of an in-flight job for listings.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub command: String,
    pub targets: usize,
    pub replied: usize,
    pub outstanding: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

impl From<&JobStatus> for JobSummary {
    fn from(status: &JobStatus) -> Self {
        Self {
            id: status.job.id,
            command: status.job.command.clone(),
            targets: status.job.targets.len(),
            replied: status.replies.len(),
            outstanding: status.outstanding.iter().cloned().collect(),
            created_at: status.job.created_at,
            deadline: status.job.deadline,
        }
    }
}

#[derive(Debug)]
struct JobSlot {
    /// Monotonic point after which the sweeper may evict this entry.
    expires_at: Instant,
    completion: watch::Sender<bool>,
    status: Mutex<JobStatus>,
}

/// Tracks in-flight jobs and their per-agent completion.
///
/// The map is behind a `RwLock`, each job behind its own `Mutex`. Replies for
/// different jobs never contend, replies for the same job are serialized.
/// Map guards are always released before an entry lock is awaited.
#[derive(Debug)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<Uuid, Arc<JobSlot>>>,
    max_jobs: usize,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            max_jobs,
        }
    }

    /// Register a freshly dispatched job.
    pub async fn create(&self, job: Job, expires_at: Instant) -> Result<JobStatus> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(DispatchError::DuplicateId(job.id));
        }
        if jobs.len() >= self.max_jobs {
            return Err(DispatchError::RegistryFull(self.max_jobs));
        }

        let status = JobStatus::new(job);
        let (completion, _) = watch::channel(status.is_complete());
        jobs.insert(
            status.job.id,
            Arc::new(JobSlot {
                expires_at,
                completion,
                status: Mutex::new(status.clone()),
            }),
        );
        Ok(status)
    }

    /// Record an agent's reply. Returns true if this was the first reply from
    /// that agent for the job; duplicates and replies from agents outside the
    /// target set return false and change nothing.
    pub async fn record_reply(&self, reply: AgentReply) -> Result<bool> {
        let job_id = reply.job_id;
        let slot = self.slot(&job_id).await?;
        let mut status = slot.status.lock().await;

        let first = status.accept(reply);
        if first && status.is_complete() {
            slot.completion.send_replace(true);
            tracing::debug!(job_id = %job_id, "All targets replied");
        }
        Ok(first)
    }

    /// Snapshot of a job's progress.
    pub async fn status(&self, job_id: &Uuid) -> Result<JobStatus> {
        let slot = self.slot(job_id).await?;
        let status = slot.status.lock().await;
        Ok(status.clone())
    }

    /// Receiver that turns `true` once every target has replied.
    pub async fn subscribe_completion(&self, job_id: &Uuid) -> Result<watch::Receiver<bool>> {
        let slot = self.slot(job_id).await?;
        Ok(slot.completion.subscribe())
    }

    /// Remove a job, returning its final status if it was present.
    pub async fn evict(&self, job_id: &Uuid) -> Option<JobStatus> {
        let slot = self.jobs.write().await.remove(job_id)?;
        let status = slot.status.lock().await;
        Some(status.clone())
    }

    /// Evict every job whose expiry has passed and that nobody is waiting on
    /// any more. Returns how many were removed.
    pub async fn sweep_expired(&self, now: Instant) -> usize {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, slot| slot.expires_at > now || slot.completion.receiver_count() > 0);
        before - jobs.len()
    }

    /// Summaries of all in-flight jobs, oldest first.
    pub async fn in_flight(&self) -> Vec<JobSummary> {
        let slots: Vec<Arc<JobSlot>> = self.jobs.read().await.values().cloned().collect();

        let mut summaries = Vec::with_capacity(slots.len());
        for slot in slots {
            let status = slot.status.lock().await;
            summaries.push(JobSummary::from(&*status));
        }
        summaries.sort_by_key(|s| s.created_at);
        summaries
    }

    pub async fn contains(&self, job_id: &Uuid) -> bool {
        self.jobs.read().await.contains_key(job_id)
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    async fn slot(&self, job_id: &Uuid) -> Result<Arc<JobSlot>> {
        self.jobs
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or(DispatchError::UnknownJob(*job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::reply::ReplyPayload;
    use std::time::Duration;

    fn job(targets: &[&str]) -> Job {
        Job::new(
            "test.echo".to_string(),
            vec!["hi".to_string()],
            targets.iter().map(|s| s.to_string()).collect(),
            Duration::from_secs(5),
        )
    }

    fn reply(job: &Job, agent: &str) -> AgentReply {
        AgentReply::new(job.id, agent, ReplyPayload::Success("hi".to_string()))
    }

    fn later() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn create_starts_with_all_targets_outstanding() {
        let registry = JobRegistry::new();
        let status = registry.create(job(&["a", "b"]), later()).await.unwrap();
        assert_eq!(status.outstanding.len(), 2);
        assert!(status.replies.is_empty());
        assert!(status.is_consistent());
    }

    #[tokio::test]
    async fn create_rejects_duplicate_id() {
        let registry = JobRegistry::new();
        let j = job(&["a"]);
        registry.create(j.clone(), later()).await.unwrap();
        let err = registry.create(j.clone(), later()).await.unwrap_err();
        assert!(matches!(err, DispatchError::DuplicateId(id) if id == j.id));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn create_enforces_capacity() {
        let registry = JobRegistry::with_capacity(1);
        registry.create(job(&["a"]), later()).await.unwrap();
        let err = registry.create(job(&["a"]), later()).await.unwrap_err();
        assert!(matches!(err, DispatchError::RegistryFull(1)));
    }

    #[tokio::test]
    async fn first_reply_wins() {
        let registry = JobRegistry::new();
        let j = job(&["a", "b"]);
        registry.create(j.clone(), later()).await.unwrap();

        assert!(registry.record_reply(reply(&j, "a")).await.unwrap());
        let dup = AgentReply::new(j.id, "a", ReplyPayload::Failure("late".to_string()));
        assert!(!registry.record_reply(dup).await.unwrap());

        let status = registry.status(&j.id).await.unwrap();
        assert_eq!(
            status.replies["a"].payload,
            ReplyPayload::Success("hi".to_string())
        );
        assert_eq!(status.outstanding.len(), 1);
        assert!(status.is_consistent());
    }

    #[tokio::test]
    async fn reply_from_non_target_is_ignored() {
        let registry = JobRegistry::new();
        let j = job(&["a"]);
        registry.create(j.clone(), later()).await.unwrap();

        assert!(!registry.record_reply(reply(&j, "stranger")).await.unwrap());
        let status = registry.status(&j.id).await.unwrap();
        assert!(status.replies.is_empty());
        assert!(status.is_consistent());
    }

    #[tokio::test]
    async fn unknown_job_is_an_error() {
        let registry = JobRegistry::new();
        let j = job(&["a"]);
        let err = registry.record_reply(reply(&j, "a")).await.unwrap_err();
        assert!(matches!(err, DispatchError::UnknownJob(_)));
        assert!(matches!(
            registry.status(&j.id).await,
            Err(DispatchError::UnknownJob(_))
        ));
    }

    #[tokio::test]
    async fn completion_signal_fires_on_last_reply() {
        let registry = JobRegistry::new();
        let j = job(&["a", "b"]);
        registry.create(j.clone(), later()).await.unwrap();
        let rx = registry.subscribe_completion(&j.id).await.unwrap();

        registry.record_reply(reply(&j, "a")).await.unwrap();
        assert!(!*rx.borrow());
        registry.record_reply(reply(&j, "b")).await.unwrap();
        assert!(*rx.borrow());

        // Subscribing after completion still observes it.
        let late = registry.subscribe_completion(&j.id).await.unwrap();
        assert!(*late.borrow());
    }

    #[tokio::test]
    async fn evict_returns_final_status() {
        let registry = JobRegistry::new();
        let j = job(&["a", "b"]);
        registry.create(j.clone(), later()).await.unwrap();
        registry.record_reply(reply(&j, "a")).await.unwrap();

        let status = registry.evict(&j.id).await.unwrap();
        let results = status.into_results();
        assert_eq!(results["a"], AgentResult::Success("hi".to_string()));
        assert_eq!(results["b"], AgentResult::Timeout);

        assert!(registry.evict(&j.id).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn sweep_removes_only_expired() {
        let registry = JobRegistry::new();
        let now = Instant::now();
        let stale = job(&["a"]);
        let fresh = job(&["a"]);
        registry.create(stale.clone(), now).await.unwrap();
        registry
            .create(fresh.clone(), now + Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(registry.sweep_expired(now + Duration::from_millis(1)).await, 1);
        assert!(!registry.contains(&stale.id).await);
        assert!(registry.contains(&fresh.id).await);
    }

    #[tokio::test]
    async fn sweep_keeps_jobs_with_a_waiter() {
        let registry = JobRegistry::new();
        let now = Instant::now();
        let j = job(&["a"]);
        registry.create(j.clone(), now).await.unwrap();
        let waiter = registry.subscribe_completion(&j.id).await.unwrap();

        let past = now + Duration::from_millis(1);
        assert_eq!(registry.sweep_expired(past).await, 0);
        assert!(registry.contains(&j.id).await);

        drop(waiter);
        assert_eq!(registry.sweep_expired(past).await, 1);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn in_flight_lists_outstanding_agents() {
        let registry = JobRegistry::new();
        let j = job(&["a", "b"]);
        registry.create(j.clone(), later()).await.unwrap();
        registry.record_reply(reply(&j, "b")).await.unwrap();

        let summaries = registry.in_flight().await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].id, j.id);
        assert_eq!(summaries[0].replied, 1);
        assert_eq!(summaries[0].outstanding, vec!["a".to_string()]);
    }
}
