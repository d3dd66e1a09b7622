use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::api::{run_api, ApiState};
use crate::config::MasterConfig;
use crate::coordinator::Coordinator;
use crate::transport::TcpTransport;

/// Master process that wires the transport, coordinator and API together
pub struct Master {
    pub config: MasterConfig,
}

impl Master {
    pub fn new(config: MasterConfig) -> Self {
        Self { config }
    }

    /// Run the master until `shutdown` fires.
    ///
    /// 1. Binds the TCP transport and starts accepting agents
    /// 2. Starts the coordinator (result collector and sweeper)
    /// 3. Optionally serves the HTTP API
    ///
    /// # Errors
    ///
    /// Returns an error if the agent listener cannot be bound. The API server
    /// runs as a spawned task and logs its own errors.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
        let transport = TcpTransport::bind(self.config.transport.clone(), shutdown.clone()).await?;
        let coordinator = Arc::new(Coordinator::start(
            transport.clone(),
            self.config.coordinator.clone(),
            shutdown.clone(),
        )?);

        if let Some(api_addr) = self.config.api_addr {
            let state = ApiState {
                coordinator: coordinator.clone(),
            };
            let api_shutdown = shutdown.clone();
            tokio::spawn(async move {
                run_api(api_addr, state, api_shutdown).await;
            });
        }

        tracing::info!(
            agents_addr = %transport.local_addr(),
            api_addr = ?self.config.api_addr,
            "Master ready"
        );

        shutdown.cancelled().await;
        tracing::info!("Master shutting down");
        Ok(())
    }
}
