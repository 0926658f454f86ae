//! Container driver
//!
//! Builds an image from the agent directory, runs it with the container port
//! published to an engine-assigned host port, and talks HTTP to that port.

use super::docker::{ContainerEngine, ContainerSpec};
use super::http::{agent_payload, build_http_client, post_json, probe};
use super::process::build_env;
use super::{
    deliver_with_restarts, DriverReply, RestartCause, Restartable, RuntimeDriver,
    StartContext, StartedInstance,
};
use crate::error::{Error, Result};
use crate::session::{BackingHandle, SessionHandle, Transport};
use crate::types::{AdapterSettings, AgentDescriptor, AgentKind, DriverTimings};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use tracing::{debug, info, warn};

const LOCAL_HOST: &str = "localhost";
const IMAGE_PREFIX: &str = "agentdock";

/// Deterministic image name for an agent id: lowercased, with each other
/// character mapped to `-`. Only trailing separators are dropped, since image
/// names may not end with one.
pub fn image_name(agent_id: &str) -> String {
    let sanitized: String = agent_id
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '-'
            }
        })
        .collect();
    let sanitized = sanitized.trim_end_matches('-');

    if sanitized.is_empty() {
        IMAGE_PREFIX.to_string()
    } else {
        format!("{}-{}", IMAGE_PREFIX, sanitized)
    }
}

/// A container owned by one session
#[derive(Debug, Clone)]
pub struct ContainerInstance {
    pub container_id: String,
    pub image: String,
    pub container_port: u16,
}

/// Driver for [`AgentKind::Container`]
pub struct ContainerDriver {
    engine: Arc<dyn ContainerEngine>,
    container_port: u16,
    passthrough_env: Vec<String>,
    timings: DriverTimings,
    client: Client,
}

impl ContainerDriver {
    pub fn new(settings: &AdapterSettings, engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine,
            container_port: settings.container_port,
            passthrough_env: settings.passthrough_env.clone(),
            timings: settings.timings.clone(),
            client: build_http_client(settings.timings.request_timeout()),
        }
    }

    /// Poll `/health`, then `/`, until one answers or attempts run out.
    /// Containers without a health endpoint are treated as ready.
    async fn wait_healthy(&self, base_url: &str) {
        let timeout = self.timings.health_check_timeout();
        for attempt in 0..self.timings.health_attempts {
            if probe(&self.client, &format!("{}/health", base_url), timeout).await
                || probe(&self.client, base_url, timeout).await
            {
                debug!("Container healthy at {} after {} attempts", base_url, attempt + 1);
                return;
            }
            tokio::time::sleep(self.timings.health_interval()).await;
        }
        info!("No health response from {}, proceeding anyway", base_url);
    }

    /// Re-read the published port, which can change across restarts
    async fn refresh_transport(&self, handle: &mut SessionHandle) -> Result<()> {
        let Some(container) = handle.container_mut() else {
            return Ok(());
        };
        let port = self
            .engine
            .host_port(&container.container_id, container.container_port)
            .await?;
        handle.transport = Transport::http(LOCAL_HOST, port);
        Ok(())
    }
}

#[async_trait]
impl RuntimeDriver for ContainerDriver {
    fn kind(&self) -> AgentKind {
        AgentKind::Container
    }

    async fn start(
        &self,
        descriptor: &AgentDescriptor,
        ctx: &StartContext,
    ) -> Result<StartedInstance> {
        let image = image_name(&descriptor.id);
        let short_id: String = ctx.session_id.chars().take(8).collect();
        let name = format!("{}-{}", image, short_id);

        info!(
            agent_id = %descriptor.id,
            session_id = %ctx.session_id,
            "Starting container {} from image {}",
            name,
            image
        );

        self.engine
            .build_image(&descriptor.root_path, &image)
            .await
            .map_err(|e| Error::start_failed(format!("Image build failed: {}", e)))?;

        let spec = ContainerSpec {
            image: image.clone(),
            name,
            env: build_env(
                &self.passthrough_env,
                &ctx.config,
                &ctx.session_id,
                self.container_port,
            ),
            container_port: self.container_port,
        };
        let container_id = self
            .engine
            .run(&spec)
            .await
            .map_err(|e| Error::start_failed(format!("Container start failed: {}", e)))?;

        let port = match self.engine.host_port(&container_id, self.container_port).await {
            Ok(port) => port,
            Err(e) => {
                if let Err(cleanup) = self.engine.remove(&container_id).await {
                    warn!("Failed to remove container {}: {}", container_id, cleanup);
                }
                return Err(Error::start_failed(format!("Port lookup failed: {}", e)));
            }
        };

        let transport = Transport::http(LOCAL_HOST, port);
        if let Some(base_url) = transport.base_url() {
            self.wait_healthy(&base_url).await;
        }

        Ok(StartedInstance {
            transport,
            backing: Some(BackingHandle::Container(ContainerInstance {
                container_id,
                image,
                container_port: self.container_port,
            })),
        })
    }

    async fn deliver(&self, handle: &mut SessionHandle, message: &str) -> Result<DriverReply> {
        deliver_with_restarts(self, handle, message).await
    }

    async fn stop(&self, handle: &mut SessionHandle) -> Result<()> {
        let Some(container) = handle.container_mut() else {
            return Ok(());
        };
        let container_id = container.container_id.clone();
        info!(session_id = %handle.session_id, "Stopping container {}", container_id);

        let stopped = self.engine.stop(&container_id).await;
        let removed = self.engine.remove(&container_id).await;

        match (stopped, removed) {
            (_, Ok(())) => Ok(()),
            (Err(stop), Err(rm)) => Err(Error::teardown_failed(format!(
                "container {}: stop: {}; remove: {}",
                container_id, stop, rm
            ))),
            (Ok(()), Err(rm)) => Err(Error::teardown_failed(format!(
                "container {}: remove: {}",
                container_id, rm
            ))),
        }
    }
}

#[async_trait]
impl Restartable for ContainerDriver {
    async fn is_running(&self, handle: &mut SessionHandle) -> bool {
        let Some(container) = handle.container_mut() else {
            return false;
        };
        match self.engine.is_running(&container.container_id).await {
            Ok(running) => running,
            Err(e) => {
                warn!("Failed to inspect container {}: {}", container.container_id, e);
                false
            }
        }
    }

    async fn restart(&self, handle: &mut SessionHandle, cause: RestartCause) -> Result<()> {
        let container_id = handle
            .container_mut()
            .map(|c| c.container_id.clone())
            .ok_or_else(|| Error::delivery_failed("Session has no container"))?;

        match cause {
            RestartCause::NotRunning => {
                self.engine.start(&container_id).await?;
                tokio::time::sleep(self.timings.container_resume_grace()).await;
            }
            RestartCause::RequestFailed => {
                if let Err(e) = self.engine.stop(&container_id).await {
                    debug!("Stop before restart failed for {}: {}", container_id, e);
                }
                self.engine.start(&container_id).await?;
                tokio::time::sleep(self.timings.restart_grace()).await;
            }
        }

        self.refresh_transport(handle).await
    }

    async fn exchange(&self, handle: &SessionHandle, message: &str) -> Result<serde_json::Value> {
        let base_url = handle
            .transport
            .base_url()
            .ok_or_else(|| Error::delivery_failed("Session has no HTTP transport"))?;

        post_json(
            &self.client,
            &format!("{}/process", base_url),
            &agent_payload(&handle.session_id, message),
            &[],
        )
        .await
    }
}
