use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::config::TransportConfig;
use crate::error::{DispatchError, Result};
use crate::jobs::{AgentReply, Job};
use crate::transport::wire::{self, Frame};
use crate::transport::{AgentDirectory, AgentInfo, PublishReport, ReplyQueue, Transport};

/// Master side of the TCP transport.
///
/// Each agent holds one connection. The first frame must be `hello`, after
/// which the master writes `job` frames and reads `heartbeat` and `reply`
/// frames. Replies are attributed to the agent id the connection announced.
pub struct TcpTransport {
    config: TransportConfig,
    local_addr: SocketAddr,
    directory: Arc<RwLock<AgentDirectory>>,
    replies: ReplyQueue,
    shutdown: CancellationToken,
}

impl TcpTransport {
    /// Bind the listener and start accepting agents until `shutdown` fires.
    pub async fn bind(config: TransportConfig, shutdown: CancellationToken) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        let transport = Arc::new(Self {
            directory: Arc::new(RwLock::new(AgentDirectory::new(config.agent_timeout_ms))),
            replies: ReplyQueue::new(config.reply_buffer),
            local_addr,
            config,
            shutdown,
        });

        tracing::info!(addr = %local_addr, "Listening for agents");

        let acceptor = transport.clone();
        tokio::spawn(async move {
            acceptor.accept_loop(listener).await;
        });

        Ok(transport)
    }

    /// Address actually bound, useful when listening on port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let reap_every = Duration::from_millis(self.config.agent_timeout_ms.max(1));
        let mut reaper = tokio::time::interval(reap_every);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Agent listener shutting down");
                    break;
                }
                _ = reaper.tick() => self.reap_dead_agents().await,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let transport = self.clone();
                        tokio::spawn(async move {
                            transport.handle_connection(stream, peer).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept agent connection");
                    }
                }
            }
        }
    }

    /// Drop agents that stopped sending heartbeats. Removing an agent closes
    /// its job queue, which ends the connection task.
    async fn reap_dead_agents(&self) {
        let mut directory = self.directory.write().await;
        for agent_id in directory.dead_agents() {
            tracing::warn!(agent_id = %agent_id, "Agent missed heartbeats, dropping connection");
            directory.remove(&agent_id);
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let mut framed = Framed::new(stream, wire::codec(self.config.max_frame_len));

        let handshake = Duration::from_millis(self.config.agent_timeout_ms);
        let agent_id = match tokio::time::timeout(handshake, framed.next()).await {
            Ok(Some(Ok(line))) => match Frame::decode(&line) {
                Ok(Frame::Hello { agent_id }) if !agent_id.is_empty() => agent_id,
                Ok(_) => {
                    tracing::warn!(peer = %peer, "Expected hello frame, closing connection");
                    return;
                }
                Err(e) => {
                    tracing::warn!(peer = %peer, error = %e, "Malformed hello frame");
                    return;
                }
            },
            Ok(Some(Err(e))) => {
                tracing::warn!(peer = %peer, error = %e, "Failed to read hello frame");
                return;
            }
            Ok(None) => return,
            Err(_) => {
                tracing::warn!(peer = %peer, "Agent did not say hello in time");
                return;
            }
        };

        let (job_tx, mut job_rx) = mpsc::channel::<Job>(self.config.job_buffer);
        let connection = self.directory.write().await.register(&agent_id, job_tx);
        tracing::info!(agent_id = %agent_id, peer = %peer, "Agent connected");

        let reply_tx = self.replies.sender();
        let (mut sink, mut frames) = framed.split();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                job = job_rx.recv() => {
                    let Some(job) = job else {
                        // Directory dropped our sender: superseded or reaped.
                        tracing::info!(agent_id = %agent_id, "Connection no longer registered");
                        break;
                    };
                    let line = match (Frame::Job { job }).encode() {
                        Ok(line) => line,
                        Err(e) => {
                            tracing::error!(agent_id = %agent_id, error = %e, "Failed to encode job");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(line).await {
                        tracing::warn!(agent_id = %agent_id, error = %e, "Failed to send job");
                        break;
                    }
                }

                frame = frames.next() => match frame {
                    Some(Ok(line)) => match Frame::decode(&line) {
                        Ok(Frame::Heartbeat) => {
                            self.directory.write().await.touch(&agent_id);
                        }
                        Ok(Frame::Reply { job_id, agent_id: claimed, payload }) => {
                            if claimed != agent_id {
                                tracing::warn!(
                                    agent_id = %agent_id,
                                    claimed = %claimed,
                                    "Reply names a different agent, attributing to connection"
                                );
                            }
                            self.directory.write().await.touch(&agent_id);
                            let reply = AgentReply::new(job_id, agent_id.clone(), payload);
                            if reply_tx.send(reply).await.is_err() {
                                tracing::warn!("Reply queue closed, dropping connection");
                                break;
                            }
                        }
                        Ok(other) => {
                            tracing::warn!(agent_id = %agent_id, frame = ?other, "Unexpected frame from agent");
                        }
                        Err(e) => {
                            tracing::warn!(agent_id = %agent_id, error = %e, "Malformed frame from agent");
                        }
                    },
                    Some(Err(e)) => {
                        tracing::warn!(agent_id = %agent_id, error = %e, "Agent connection error");
                        break;
                    }
                    None => break,
                }
            }
        }

        if self.directory.write().await.unregister(&agent_id, connection) {
            tracing::info!(agent_id = %agent_id, "Agent disconnected");
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn publish(&self, job: &Job) -> Result<PublishReport> {
        if self.shutdown.is_cancelled() {
            return Err(DispatchError::Transport("transport shut down".to_string()));
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
