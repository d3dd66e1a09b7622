use std::net::SocketAddr;
use std::time::Duration;

/// Default maximum length of a single wire frame (1 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Settings for the coordinator's job bookkeeping.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Timeout applied when a caller does not specify one.
    pub default_timeout_ms: u64,
    /// Maximum number of jobs tracked in the registry at once.
    pub max_jobs: usize,
    /// How often the sweeper looks for abandoned jobs.
    pub sweep_interval_ms: u64,
    /// How long past its deadline an abandoned job is kept before the
    /// sweeper evicts it.
    pub eviction_grace_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5000,
            max_jobs: 10_000,
            sweep_interval_ms: 1000,
            eviction_grace_ms: 5000,
        }
    }
}

impl CoordinatorConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Never zero: `tokio::time::interval` rejects a zero period.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    /// Never zero, so a job is not swept at the instant its waiter times out.
    pub fn eviction_grace(&self) -> Duration {
        Duration::from_millis(self.eviction_grace_ms.max(1))
    }

    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    pub fn with_eviction_grace_ms(mut self, grace_ms: u64) -> Self {
        self.eviction_grace_ms = grace_ms;
        self
    }

    pub fn with_sweep_interval_ms(mut self, interval_ms: u64) -> Self {
        self.sweep_interval_ms = interval_ms;
        self
    }
}

/// Settings shared by transports.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Address the master listens on for agent connections.
    pub listen_addr: SocketAddr,
    /// An agent with no heartbeat for this long is considered dead.
    pub agent_timeout_ms: u64,
    /// Frames longer than this close the connection.
    pub max_frame_len: usize,
    /// Capacity of each agent's outbound job queue.
    pub job_buffer: usize,
    /// Capacity of the inbound reply queue.
    pub reply_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 4506)),
            agent_timeout_ms: 5000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            job_buffer: 64,
            reply_buffer: 1024,
        }
    }
}

impl TransportConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_agent_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.agent_timeout_ms = timeout_ms;
        self
    }
}

/// Configuration for an agent process.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_id: String,
    /// host:port of the master, supports both IP and hostnames
    pub master_addr: String,
    pub heartbeat_interval_ms: u64,
    /// Upper bound on jobs executing concurrently on this agent.
    pub max_concurrent_jobs: usize,
    /// Enables the `cmd.run` built-in. Off unless explicitly requested.
    pub allow_shell: bool,
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
    pub max_frame_len: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: "agent-1".to_string(),
            master_addr: "127.0.0.1:4506".to_string(),
            heartbeat_interval_ms: 500,
            max_concurrent_jobs: 16,
            allow_shell: false,
            reconnect_min_ms: 250,
            reconnect_max_ms: 10_000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl AgentConfig {
    pub fn new(agent_id: impl Into<String>, master_addr: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            master_addr: master_addr.into(),
            ..Default::default()
        }
    }

    pub fn with_shell(mut self, allow_shell: bool) -> Self {
        self.allow_shell = allow_shell;
        self
    }

    pub fn with_heartbeat_interval_ms(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }
}

/// Everything a master process needs to start.
#[derive(Debug, Clone, Default)]
pub struct MasterConfig {
    pub transport: TransportConfig,
    pub coordinator: CoordinatorConfig,
    /// Address for the HTTP API; disabled when unset.
    pub api_addr: Option<SocketAddr>,
}
