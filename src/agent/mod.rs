//! Agent side of the dispatcher.
//!
//! An agent receives jobs from the master, runs them and replies:
//! - **Execution**: built-in commands via [`CommandExecutor`]
//! - **Heartbeat**: periodic frames keep the agent marked alive on the master
//! - **Reconnect**: after the master goes away, retries with jittered backoff
//!
//! # Execution Flow
//!
//! 1. [`connection::connect`] dials the master and sends `hello`
//! 2. [`serve`] receives jobs from the link, skipping expired ones
//! 3. Each job runs on its own task, bounded by `max_concurrent_jobs`
//! 4. The reply goes back over the same link

pub mod backoff;
pub mod connection;
pub mod executor;

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::jobs::AgentReply;
use crate::transport::AgentLink;

pub use executor::CommandExecutor;

pub struct Agent {
    config: AgentConfig,
    executor: Arc<CommandExecutor>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            executor: Arc::new(CommandExecutor::new(config.allow_shell)),
            config,
        }
    }

    /// Stay connected to the master until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut attempt: u32 = 0;

        while !shutdown.is_cancelled() {
            match connection::connect(&self.config, shutdown.clone()).await {
                Ok((link, pump)) => {
                    attempt = 0;
                    tracing::info!(
                        agent_id = %self.config.agent_id,
                        master = %self.config.master_addr,
                        "Connected to master"
                    );
                    self.serve(link, shutdown.clone()).await;
                    let _ = pump.await;
                }
                Err(e) => {
                    tracing::warn!(
                        master = %self.config.master_addr,
                        error = %e,
                        "Failed to connect to master"
                    );
                }
            }

            let delay = backoff::reconnect_delay(
                attempt,
                self.config.reconnect_min_ms,
                self.config.reconnect_max_ms,
            );
            attempt = attempt.saturating_add(1);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!(agent_id = %self.config.agent_id, "Agent stopped");
    }

    /// Process jobs from an already established link.
    pub async fn serve(&self, link: AgentLink, shutdown: CancellationToken) {
        serve(
            link,
            self.executor.clone(),
            self.config.max_concurrent_jobs,
            shutdown,
        )
        .await;
    }
}

/// Execute every job arriving on `link` and send back its reply. Returns once
/// the link closes or `shutdown` fires; jobs already running finish on their
/// own tasks.
pub async fn serve(
    link: AgentLink,
    executor: Arc<CommandExecutor>,
    max_concurrent_jobs: usize,
    shutdown: CancellationToken,
) {
    let AgentLink {
        agent_id,
        mut jobs,
        replies,
    } = link;
    let slots = Arc::new(Semaphore::new(max_concurrent_jobs.max(1)));

    loop {
        let job = tokio::select! {
            _ = shutdown.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        if job.is_expired(Utc::now()) {
            tracing::debug!(job_id = %job.id, agent_id = %agent_id, "Skipping expired job");
            continue;
        }

        let Ok(permit) = slots.clone().acquire_owned().await else {
            break;
        };
        let executor = executor.clone();
        let replies = replies.clone();
        let agent_id = agent_id.clone();
        tokio::spawn(async move {
            let payload = executor.execute(&job).await;
            let reply = AgentReply::new(job.id, agent_id, payload);
            if replies.send(reply).await.is_err() {
                tracing::warn!(job_id = %job.id, "Link closed before reply could be sent");
            }
            drop(permit);
        });
    }
}
