//! End-to-end tests over real TCP connections on localhost.


use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;

use dispatch_lite::agent::Agent;
use dispatch_lite::config::{AgentConfig, TransportConfig, DEFAULT_MAX_FRAME_LEN};
use dispatch_lite::coordinator::Coordinator;
use dispatch_lite::error::DispatchError;
use dispatch_lite::jobs::{AgentResult, Job, ReplyPayload};
use dispatch_lite::transport::wire::{self, Frame};
use dispatch_lite::transport::{TcpTransport, Transport};
use test_harness::{assert_eventually, test_coordinator_config};

struct TcpCluster {
    transport: Arc<TcpTransport>,
    coordinator: Arc<Coordinator>,
    shutdown: CancellationToken,
}

impl TcpCluster {
    async fn start() -> Self {
        Self::start_with_agent_timeout(2000).await
    }

    async fn start_with_agent_timeout(agent_timeout_ms: u64) -> Self {
        let shutdown = CancellationToken::new();
        let config = TransportConfig::new("127.0.0.1:0".parse().unwrap())
            .with_agent_timeout_ms(agent_timeout_ms);
        let transport = TcpTransport::bind(config, shutdown.clone()).await.unwrap();
        let coordinator =
            Coordinator::start(transport.clone(), test_coordinator_config(), shutdown.clone())
                .unwrap();
        Self {
            transport,
            coordinator: Arc::new(coordinator),
            shutdown,
        }
    }

    fn spawn_agent(&self, agent_id: &str) {
        let config = AgentConfig::new(agent_id, self.transport.local_addr().to_string())
            .with_heartbeat_interval_ms(50);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            Agent::new(config).run(shutdown).await;
        });
    }

    async fn wait_for_agents(&self, ids: &[&str]) {
        let transport = self.transport.clone();
        let expected: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        assert_eventually(
            || {
                let transport = transport.clone();
                let expected = expected.clone();
                async move {
                    let known: Vec<String> =
                        transport.agents().await.into_iter().map(|a| a.id).collect();
                    expected.iter().all(|id| known.contains(id))
                }
            },
            Duration::from_secs(5),
            "agents should connect",
        )
        .await;
    }

    /// Raw connection speaking the wire protocol directly
    async fn raw_client(&self) -> Framed<TcpStream, LinesCodec> {
        let stream = TcpStream::connect(self.transport.local_addr()).await.unwrap();
        Framed::new(stream, wire::codec(DEFAULT_MAX_FRAME_LEN))
    }
}

impl Drop for TcpCluster {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn send(client: &mut Framed<TcpStream, LinesCodec>, frame: Frame) {
    client.send(frame.encode().unwrap()).await.unwrap();
}

async fn next_frame(client: &mut Framed<TcpStream, LinesCodec>) -> Option<Frame> {
    let line = tokio::time::timeout(Duration::from_secs(2), client.next())
        .await
        .expect("timed out waiting for frame")?
        .ok()?;
    Some(Frame::decode(&line).unwrap())
}

#[tokio::test]
async fn test_agents_connect_and_reply_over_tcp() {
    let cluster = TcpCluster::start().await;
    cluster.spawn_agent("web-1");
    cluster.spawn_agent("web-2");
    cluster.wait_for_agents(&["web-1", "web-2"]).await;

    let results = cluster
        .coordinator
        .run("echo", ["over", "tcp"], ["web-1", "web-2"], Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    for result in results.values() {
        assert_eq!(result, &AgentResult::Success("over tcp".to_string()));
    }
}

#[tokio::test]
async fn test_run_matching_over_tcp() {
    let cluster = TcpCluster::start().await;
    cluster.spawn_agent("web-1");
    cluster.spawn_agent("db-1");
    cluster.wait_for_agents(&["web-1", "db-1"]).await;

    let results = cluster
        .coordinator
        .run_matching("test.ping", Vec::<String>::new(), ["*"], Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert!(results.values().all(AgentResult::is_success));
}

#[tokio::test]
async fn test_raw_client_receives_job_frame() {
    let cluster = TcpCluster::start().await;
    let mut client = cluster.raw_client().await;
    send(
        &mut client,
        Frame::Hello {
            agent_id: "raw".to_string(),
        },
    )
    .await;
    cluster.wait_for_agents(&["raw"]).await;

    let coordinator = cluster.coordinator.clone();
    let run = tokio::spawn(async move {
        coordinator
            .run("test.ping", Vec::<String>::new(), ["raw"], Duration::from_secs(5))
            .await
    });

    let job: Job = match next_frame(&mut client).await {
        Some(Frame::Job { job }) => job,
        other => panic!("expected job frame, got {:?}", other),
    };
    assert_eq!(job.command, "test.ping");

    // The reply claims another agent; the connection's identity wins.
    send(
        &mut client,
        Frame::Reply {
            job_id: job.id,
            agent_id: "impostor".to_string(),
            payload: ReplyPayload::Success("pong".to_string()),
        },
    )
    .await;

    let results = run.await.unwrap().unwrap();
    assert_eq!(results["raw"], AgentResult::Success("pong".to_string()));
    assert!(!results.contains_key("impostor"));
}

#[tokio::test]
async fn test_connection_without_hello_is_closed() {
    let cluster = TcpCluster::start().await;
    let mut client = cluster.raw_client().await;

    send(&mut client, Frame::Heartbeat).await;

    assert!(next_frame(&mut client).await.is_none());
    assert!(cluster.transport.agents().await.is_empty());
}

#[tokio::test]
async fn test_disconnected_agent_is_forgotten() {
    let cluster = TcpCluster::start().await;
    let mut client = cluster.raw_client().await;
    send(
        &mut client,
        Frame::Hello {
            agent_id: "short-lived".to_string(),
        },
    )
    .await;
    cluster.wait_for_agents(&["short-lived"]).await;

    drop(client);

    let transport = cluster.transport.clone();
    assert_eventually(
        || {
            let transport = transport.clone();
            async move { transport.agents().await.is_empty() }
        },
        Duration::from_secs(2),
        "agent should be removed after disconnect",
    )
    .await;

    let results = cluster
        .coordinator
        .run("test.ping", Vec::<String>::new(), ["short-lived"], Duration::from_millis(200))
        .await
        .unwrap();
    assert_eq!(results["short-lived"], AgentResult::Timeout);
}

#[tokio::test]
async fn test_silent_agent_is_reaped() {
    let cluster = TcpCluster::start_with_agent_timeout(200).await;
    let mut client = cluster.raw_client().await;
    send(
        &mut client,
        Frame::Hello {
            agent_id: "mute".to_string(),
        },
    )
    .await;
    cluster.wait_for_agents(&["mute"]).await;

    // No heartbeats follow, so the master hangs up.
    assert!(next_frame(&mut client).await.is_none());
    assert!(cluster.transport.agents().await.is_empty());
}

#[tokio::test]
async fn test_heartbeating_agent_is_kept() {
    let cluster = TcpCluster::start_with_agent_timeout(200).await;
    cluster.spawn_agent("chatty");
    cluster.wait_for_agents(&["chatty"]).await;

    tokio::time::sleep(Duration::from_millis(600)).await;

    let agents = cluster.transport.agents().await;
    assert_eq!(agents.len(), 1);
    assert!(agents[0].alive);
}

#[tokio::test]
async fn test_publish_fails_after_shutdown() {
    let cluster = TcpCluster::start().await;
    cluster.shutdown.cancel();

    let job = Job::new(
        "test.ping".to_string(),
        Vec::new(),
        ["web-1".to_string()].into_iter().collect(),
        Duration::from_secs(1),
    );
    let err = cluster.transport.publish(&job).await.unwrap_err();
    assert!(matches!(err, DispatchError::Transport(_)));
}
