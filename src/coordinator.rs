use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::collector::{CollectorSnapshot, CollectorStats, ResultCollector};
use crate::config::CoordinatorConfig;
use crate::dispatcher::{DispatchSnapshot, Dispatcher};
use crate::error::{DispatchError, Result};
use crate::jobs::{AgentResult, JobRegistry, JobSummary};
use crate::targeting;
use crate::transport::{AgentInfo, Transport};

/// Front door for running a command across agents and waiting for results.
///
/// Owns the job registry for the lifetime of the master process. Starting a
/// coordinator spawns two background tasks, both stopped by the shutdown
/// token:
///
/// - the [`ResultCollector`], fed by the transport's reply queue
/// - a sweeper that evicts jobs whose `run` call was abandoned
pub struct Coordinator {
    config: CoordinatorConfig,
    registry: Arc<JobRegistry>,
    dispatcher: Dispatcher,
    transport: Arc<dyn Transport>,
    collector_stats: Arc<CollectorStats>,
}

impl Coordinator {
    /// Subscribe to `transport` and start the background tasks.
    ///
    /// # Errors
    ///
    /// Fails if the transport's reply queue was already taken.
    pub fn start(
        transport: Arc<dyn Transport>,
        config: CoordinatorConfig,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let replies = transport.subscribe()?;
        let registry = Arc::new(JobRegistry::with_capacity(config.max_jobs));
        let collector_stats = Arc::new(CollectorStats::default());

        let collector = ResultCollector::new(registry.clone(), collector_stats.clone());
        let collector_shutdown = shutdown.clone();
        tokio::spawn(async move {
            collector.run(replies, collector_shutdown).await;
        });

        let sweeper_registry = registry.clone();
        let sweep_interval = config.sweep_interval();
        tokio::spawn(async move {
            Self::sweep_loop(sweeper_registry, sweep_interval, shutdown).await;
        });

        Ok(Self {
            dispatcher: Dispatcher::new(
                registry.clone(),
                transport.clone(),
                config.eviction_grace(),
            ),
            config,
            registry,
            transport,
            collector_stats,
        })
    }

    /// Run `command` on every agent in `targets` and wait until all of them
    /// replied or `timeout` elapsed. Agents that did not reply in time map to
    /// [`AgentResult::Timeout`].
    ///
    /// Dropping the returned future abandons the job; the sweeper removes it
    /// once its deadline and grace period have passed.
    pub async fn run<A, S, T, U>(
        &self,
        command: &str,
        arguments: A,
        targets: T,
        timeout: Duration,
    ) -> Result<BTreeMap<String, AgentResult>>
    where
        A: IntoIterator<Item = S>,
        S: Into<String>,
        T: IntoIterator<Item = U>,
        U: Into<String>,
    {
        let started = Instant::now();
        let dispatched = self
            .dispatcher
            .dispatch(command, arguments, targets, timeout)
            .await?;
        let job_id = dispatched.job_id;

        let mut completion = self.registry.subscribe_completion(&job_id).await?;
        let waited = tokio::time::timeout_at(dispatched.deadline, async {
            completion.wait_for(|done| *done).await.is_ok()
        })
        .await;

        match waited {
            Ok(true) => tracing::debug!(job_id = %job_id, "All targets replied"),
            Ok(false) => tracing::debug!(job_id = %job_id, "Job removed while waiting"),
            Err(_) => tracing::debug!(job_id = %job_id, "Deadline reached"),
        }

        let status = self
            .registry
            .evict(&job_id)
            .await
            .ok_or(DispatchError::UnknownJob(job_id))?;
        let timed_out = status.outstanding.len();
        let results = status.into_results();

        tracing::info!(
            job_id = %job_id,
            command,
            replied = results.len() - timed_out,
            timed_out,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Job finished"
        );
        Ok(results)
    }

    /// Like [`Self::run`], but `patterns` may contain globs that are expanded
    /// against the live agents the transport currently knows. Agents that
    /// missed heartbeats never match a glob; a literal id is still kept.
    pub async fn run_matching<A, S, P, Q>(
        &self,
        command: &str,
        arguments: A,
        patterns: P,
        timeout: Duration,
    ) -> Result<BTreeMap<String, AgentResult>>
    where
        A: IntoIterator<Item = S>,
        S: Into<String>,
        P: IntoIterator<Item = Q>,
        Q: AsRef<str>,
    {
        let known: Vec<String> = self
            .transport
            .agents()
            .await
            .into_iter()
            .filter(|agent| agent.alive)
            .map(|agent| agent.id)
            .collect();
        let targets = targeting::expand_targets(patterns, &known)?;
        self.run(command, arguments, targets, timeout).await
    }

    async fn sweep_loop(
        registry: Arc<JobRegistry>,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = registry.sweep_expired(Instant::now()).await;
                    if evicted > 0 {
                        tracing::debug!(evicted, "Swept abandoned jobs");
                    }
                }
            }
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.config.default_timeout()
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub async fn in_flight(&self) -> Vec<JobSummary> {
        self.registry.in_flight().await
    }

    pub async fn agents(&self) -> Vec<AgentInfo> {
        self.transport.agents().await
    }

    pub fn collector_stats(&self) -> CollectorSnapshot {
        self.collector_stats.snapshot()
    }

    pub fn dispatch_stats(&self) -> DispatchSnapshot {
        self.dispatcher.stats()
    }
}
