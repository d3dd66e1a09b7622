use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::error::{DispatchError, Result};
use crate::jobs::{AgentReply, Job};
use crate::transport::wire::{self, Frame};
use crate::transport::AgentLink;

const LINK_BUFFER: usize = 64;

/// Connect to the master, announce this agent and return the agent's end of
/// the link. The returned task pumps frames until either side closes.
pub async fn connect(
    config: &AgentConfig,
    shutdown: CancellationToken,
) -> Result<(AgentLink, JoinHandle<()>)> {
    let stream = TcpStream::connect(&config.master_addr).await?;
    let mut framed = Framed::new(stream, wire::codec(config.max_frame_len));

    let hello = Frame::Hello {
        agent_id: config.agent_id.clone(),
    }
    .encode()?;
    framed
        .send(hello)
        .await
        .map_err(|e| DispatchError::Transport(e.to_string()))?;

    let (job_tx, job_rx) = mpsc::channel(LINK_BUFFER);
    let (reply_tx, reply_rx) = mpsc::channel(LINK_BUFFER);

    let agent_id = config.agent_id.clone();
    let heartbeat_ms = config.heartbeat_interval_ms;
    let handle = tokio::spawn(async move {
        pump(agent_id, framed, job_tx, reply_rx, heartbeat_ms, shutdown).await;
    });

    Ok((
        AgentLink {
            agent_id: config.agent_id.clone(),
            jobs: job_rx,
            replies: reply_tx,
        },
        handle,
    ))
}

async fn pump(
    agent_id: String,
    framed: Framed<TcpStream, LinesCodec>,
    job_tx: mpsc::Sender<Job>,
    mut reply_rx: mpsc::Receiver<AgentReply>,
    heartbeat_ms: u64,
    shutdown: CancellationToken,
) {
    // Keeps this agent alive in the master's directory.
    let mut heartbeat = tokio::time::interval(Duration::from_millis(heartbeat_ms.max(1)));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let (mut sink, mut frames) = framed.split();

    loop {
        let outbound = tokio::select! {
            _ = shutdown.cancelled() => break,

            _ = heartbeat.tick() => Frame::Heartbeat,

            reply = reply_rx.recv() => match reply {
                Some(reply) => Frame::Reply {
                    job_id: reply.job_id,
                    agent_id: reply.agent_id,
                    payload: reply.payload,
                },
                None => break,
            },

            frame = frames.next() => {
                match frame {
                    Some(Ok(line)) => match Frame::decode(&line) {
                        Ok(Frame::Job { job }) => {
                            if job_tx.send(job).await.is_err() {
                                break;
                            }
                        }
                        Ok(other) => {
                            tracing::warn!(agent_id = %agent_id, frame = ?other, "Unexpected frame from master");
                        }
                        Err(e) => {
                            tracing::warn!(agent_id = %agent_id, error = %e, "Malformed frame from master");
                        }
                    },
                    Some(Err(e)) => {
                        tracing::warn!(agent_id = %agent_id, error = %e, "Master connection error");
                        break;
                    }
                    None => {
                        tracing::info!(agent_id = %agent_id, "Master closed the connection");
                        break;
                    }
                }
                continue;
            }
        };

        let line = match outbound.encode() {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(agent_id = %agent_id, error = %e, "Failed to encode frame");
                continue;
            }
        };
        if let Err(e) = sink.send(line).await {
            tracing::warn!(agent_id = %agent_id, error = %e, "Failed to write to master");
            break;
        }
    }
}
