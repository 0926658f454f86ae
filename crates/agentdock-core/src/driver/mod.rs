//! Runtime drivers
//!
//! One driver per [`AgentKind`], each able to start an instance, deliver one
//! message to it and tear it down:
//!
//! - [`DirectProcessDriver`] - entry script spawned as a child process
//! - [`ContainerDriver`] - image built and run through a container engine
//! - [`N8nDriver`] - webhook trigger on an external n8n server
//! - [`VoiceflowDriver`] - stateful turns against the Voiceflow runtime
//!
//! Drivers keep no session bookkeeping of their own. Everything they need
//! lives on the [`SessionHandle`] handed to them by the orchestrator.

mod container;
mod docker;
mod http;
mod n8n;
mod process;
mod voiceflow;

pub use container::{image_name, ContainerDriver, ContainerInstance};
pub use docker::{ContainerEngine, ContainerSpec, DockerCli};
pub use http::{agent_payload, extract_reply};
pub use n8n::{webhook_path, N8nDriver};
pub use process::{build_env, DirectProcessDriver, ProcessInstance};
pub use voiceflow::{reduce_trace, VoiceflowDriver};

use crate::error::{DriverError, Error, Result};
use crate::session::{BackingHandle, SessionHandle, Transport};
use crate::types::{AdapterSettings, AgentDescriptor, AgentKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Restarts a local driver may attempt inside one `deliver` call
pub const MAX_DELIVERY_RESTARTS: u32 = 2;

/// Inputs for starting one instance
#[derive(Debug, Clone)]
pub struct StartContext {
    pub session_id: String,
    /// Caller-supplied settings, exported to the agent as uppercased env vars
    pub config: HashMap<String, String>,
}

/// What a successful `start` hands back to the orchestrator
#[derive(Debug)]
pub struct StartedInstance {
    pub transport: Transport,
    pub backing: Option<BackingHandle>,
}

/// Reply produced by one `deliver`
#[derive(Debug, Clone)]
pub struct DriverReply {
    pub reply: String,
    pub raw: serde_json::Value,
    pub attempts: u32,
}

/// Execution strategy for one agent kind
#[async_trait]
pub trait RuntimeDriver: Send + Sync {
    /// Kind this driver serves
    fn kind(&self) -> AgentKind;

    /// Start an instance of `descriptor`. Never retried.
    async fn start(&self, descriptor: &AgentDescriptor, ctx: &StartContext)
        -> Result<StartedInstance>;

    /// Deliver one message and return the agent's reply
    async fn deliver(&self, handle: &mut SessionHandle, message: &str) -> Result<DriverReply>;

    /// Tear the instance down
    async fn stop(&self, handle: &mut SessionHandle) -> Result<()>;
}

/// Fixed kind -> driver lookup built once at startup
#[derive(Clone, Default)]
pub struct DriverTable {
    drivers: HashMap<AgentKind, Arc<dyn RuntimeDriver>>,
}

impl DriverTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The four production drivers configured from `settings`
    pub fn standard(settings: &AdapterSettings) -> Self {
        let mut table = Self::new();
        table.register(Arc::new(DirectProcessDriver::new(settings)));
        table.register(Arc::new(ContainerDriver::new(
            settings,
            Arc::new(DockerCli::new(
                settings.docker_bin.clone(),
                settings.timings.build_timeout(),
            )),
        )));
        table.register(Arc::new(N8nDriver::new(settings)));
        table.register(Arc::new(VoiceflowDriver::new(settings)));
        table
    }

    /// Register a driver under its own kind, replacing any previous one
    pub fn register(&mut self, driver: Arc<dyn RuntimeDriver>) {
        self.drivers.insert(driver.kind(), driver);
    }

    pub fn with(mut self, driver: Arc<dyn RuntimeDriver>) -> Self {
        self.register(driver);
        self
    }

    pub fn get(&self, kind: AgentKind) -> Option<Arc<dyn RuntimeDriver>> {
        self.drivers.get(&kind).cloned()
    }
}

/// Why a backing instance is being restarted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartCause {
    /// Found dead before sending
    NotRunning,
    /// Alive, but the request failed
    RequestFailed,
}

/// Hooks a driver with a local backing instance exposes to
/// [`deliver_with_restarts`]
#[async_trait]
pub trait Restartable: Send + Sync {
    /// Lazy liveness check of the backing instance
    async fn is_running(&self, handle: &mut SessionHandle) -> bool;

    /// Bring the backing instance back, including any settle wait
    async fn restart(&self, handle: &mut SessionHandle, cause: RestartCause) -> Result<()>;

    /// One request/response exchange returning the raw agent response.
    /// An error here means the instance could not be reached.
    async fn exchange(&self, handle: &SessionHandle, message: &str) -> Result<serde_json::Value>;
}

/// Driver error text without the `Error` display prefixes
fn error_detail(error: Error) -> String {
    match error {
        Error::Driver(
            DriverError::StartFailed(detail)
            | DriverError::DeliveryFailed(detail)
            | DriverError::TeardownFailed(detail),
        ) => detail,
        other => other.to_string(),
    }
}

/// Deliver `message`, restarting the backing instance at most
/// [`MAX_DELIVERY_RESTARTS`] times. Each restart bumps `handle.retry_count`.
///
/// Only a dead instance or a failed exchange triggers a restart. A response
/// in which the agent itself reports failure is returned as `DeliveryFailed`
/// straight away, leaving the instance untouched.
pub async fn deliver_with_restarts<R>(
    driver: &R,
    handle: &mut SessionHandle,
    message: &str,
) -> Result<DriverReply>
where
    R: Restartable + ?Sized,
{
    let mut pending: Option<RestartCause> = None;
    let mut last_error = String::from("no delivery attempted");

    for attempt in 0..=MAX_DELIVERY_RESTARTS {
        if let Some(cause) = pending.take() {
            handle.retry_count += 1;
            warn!(
                session_id = %handle.session_id,
                attempt,
                ?cause,
                "Restarting agent instance"
            );
            if let Err(e) = driver.restart(handle, cause).await {
                last_error = error_detail(e);
                pending = Some(cause);
                continue;
            }
        }

        if !driver.is_running(handle).await {
            last_error = "agent instance is not running".to_string();
            pending = Some(RestartCause::NotRunning);
            continue;
        }

        match driver.exchange(handle, message).await {
            Ok(raw) => {
                let reply = extract_reply(&raw).map_err(|reason| {
                    warn!(
                        session_id = %handle.session_id,
                        attempt,
                        "Agent reported failure: {}",
                        reason
                    );
                    Error::delivery_failed(reason)
                })?;
                debug!(session_id = %handle.session_id, attempt, "Message delivered");
                return Ok(DriverReply {
                    reply,
                    raw,
                    attempts: attempt + 1,
                });
            }
            Err(e) => {
                warn!(session_id = %handle.session_id, attempt, "Delivery failed: {}", e);
                last_error = error_detail(e);
                pending = Some(RestartCause::RequestFailed);
            }
        }
    }

    Err(Error::delivery_failed(format!(
        "{} (gave up after {} restarts)",
        last_error, MAX_DELIVERY_RESTARTS
    )))
}
