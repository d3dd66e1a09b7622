use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::jobs::{Job, JobRegistry};
use crate::transport::Transport;

/// Stand-in deadline for timeouts too large to add to a monotonic instant.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Counters kept by the dispatcher.
#[derive(Debug, Default)]
pub struct DispatchStats {
    dispatched: AtomicU64,
    undelivered: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchSnapshot {
    pub dispatched: u64,
    pub undelivered: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            undelivered: self.undelivered.load(Ordering::Relaxed),
        }
    }
}

/// A job that was registered and published.
#[derive(Debug, Clone, Copy)]
pub struct Dispatched {
    pub job_id: Uuid,
    pub deadline: Instant,
}

/// Builds jobs, records them in the registry and publishes them.
pub struct Dispatcher {
    registry: Arc<JobRegistry>,
    transport: Arc<dyn Transport>,
    eviction_grace: Duration,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<JobRegistry>,
        transport: Arc<dyn Transport>,
        eviction_grace: Duration,
    ) -> Self {
        Self {
            registry,
            transport,
            eviction_grace,
            stats: DispatchStats::default(),
        }
    }

    /// Dispatch `command` to `targets`.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::TargetSetEmpty`] before anything is recorded or sent
    /// - [`DispatchError::RegistryFull`] if the registry is at capacity
    /// - a transport error if publishing failed, in which case the job has
    ///   already been removed again
    ///
    /// Targets that could not be reached are not an error; they are logged,
    /// counted and will time out.
    pub async fn dispatch<A, S, T, U>(
        &self,
        command: &str,
        arguments: A,
        targets: T,
        timeout: Duration,
    ) -> Result<Dispatched>
    where
        A: IntoIterator<Item = S>,
        S: Into<String>,
        T: IntoIterator<Item = U>,
        U: Into<String>,
    {
        let targets: BTreeSet<String> = targets.into_iter().map(Into::into).collect();
        if targets.is_empty() {
            return Err(DispatchError::TargetSetEmpty);
        }
        let arguments: Vec<String> = arguments.into_iter().map(Into::into).collect();

        let now = Instant::now();
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + FAR_FUTURE);
        let expires_at = deadline
            .checked_add(self.eviction_grace)
            .unwrap_or(deadline);
        let job = Job::new(command.to_string(), arguments, targets, timeout);
        let job_id = job.id;

        self.registry.create(job.clone(), expires_at).await?;

        let report = match self.transport.publish(&job).await {
            Ok(report) => report,
            Err(e) => {
                self.registry.evict(&job_id).await;
                tracing::error!(job_id = %job_id, error = %e, "Publish failed, job withdrawn");
                return Err(e);
            }
        };

        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        if !report.undelivered.is_empty() {
            self.stats
                .undelivered
                .fetch_add(report.undelivered.len() as u64, Ordering::Relaxed);
            tracing::warn!(
                job_id = %job_id,
                undelivered = ?report.undelivered,
                "Some targets could not be reached"
            );
        }
        tracing::info!(
            job_id = %job_id,
            command,
            delivered = report.delivered.len(),
            timeout_ms = timeout.as_millis() as u64,
            "Job dispatched"
        );

        Ok(Dispatched { job_id, deadline })
    }

    pub fn stats(&self) -> DispatchSnapshot {
        self.stats.snapshot()
    }
}
