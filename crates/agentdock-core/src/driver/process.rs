//! Direct-process driver
//!
//! Spawns the agent's entry script as a child process that serves HTTP on
//! `localhost:<PORT>`. Exit is detected lazily through the child's exit status
//! on the next delivery.

use super::http::{agent_payload, build_http_client, post_json, probe};
use super::{
    deliver_with_restarts, DriverReply, RestartCause, Restartable, RuntimeDriver,
    StartContext, StartedInstance,
};
use crate::error::{Error, Result};
use crate::session::{BackingHandle, SessionHandle, Transport};
use crate::types::{AdapterSettings, AgentDescriptor, AgentKind, DriverTimings};
use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

const LOCAL_HOST: &str = "localhost";
const PORT_RANGE: std::ops::RangeInclusive<u16> = 3000..=9999;

/// Environment for a spawned agent: selected host variables, then the
/// session config with uppercased keys, then `SESSION_ID` and `PORT`.
pub fn build_env(
    passthrough: &[String],
    config: &HashMap<String, String>,
    session_id: &str,
    port: u16,
) -> HashMap<String, String> {
    let mut env = HashMap::new();

    for key in passthrough {
        if let Ok(value) = std::env::var(key) {
            env.insert(key.clone(), value);
        }
    }
    for (key, value) in config {
        env.insert(key.to_uppercase(), value.clone());
    }
    env.insert("SESSION_ID".to_string(), session_id.to_string());
    env.insert("PORT".to_string(), port.to_string());

    env
}

/// Port from `config["port"]`, else a pseudo-random one in 3000-9999.
/// Collisions are possible; callers may retry creation on bind failure.
fn choose_port(config: &HashMap<String, String>) -> Result<u16> {
    match config.get("port") {
        Some(raw) => raw
            .trim()
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| Error::start_failed(format!("Invalid port in session config: {}", raw))),
        None => Ok(rand::thread_rng().gen_range(PORT_RANGE)),
    }
}

/// How to (re)spawn one agent process
#[derive(Debug, Clone)]
pub(crate) struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub session_id: String,
}

/// A running agent process, owned by its session
pub struct ProcessInstance {
    child: Child,
    spec: SpawnSpec,
}

impl ProcessInstance {
    pub(crate) fn spawn(spec: SpawnSpec) -> Result<Self> {
        let child = Self::spawn_child(&spec)?;
        Ok(Self { child, spec })
    }

    fn spawn_child(spec: &SpawnSpec) -> Result<Child> {
        debug!(
            "Spawning agent: {} {:?} (cwd: {:?})",
            spec.program, spec.args, spec.cwd
        );

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::start_failed(format!("Failed to spawn {}: {}", spec.program, e))
            })?;

        // Drain output so the agent can't block on a full pipe
        if let Some(stdout) = child.stdout.take() {
            let session_id = spec.session_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(session_id = %session_id, "agent stdout: {}", line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let session_id = spec.session_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    // Python agents log to stderr by default
                    warn!(session_id = %session_id, "agent stderr: {}", line);
                }
            });
        }

        Ok(child)
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Whether the process has exited, without blocking
    pub fn has_exited(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(session_id = %self.spec.session_id, "Agent process exited: {}", status);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(session_id = %self.spec.session_id, "Failed to poll agent process: {}", e);
                true
            }
        }
    }

    /// Kill the process and reap it
    pub async fn terminate(&mut self) -> std::io::Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        self.child.kill().await
    }

    /// Kill whatever is left and spawn again from the same spec
    pub(crate) async fn respawn(&mut self) -> Result<()> {
        if let Err(e) = self.terminate().await {
            warn!(session_id = %self.spec.session_id, "Failed to kill lingering process: {}", e);
        }
        self.child = Self::spawn_child(&self.spec)?;
        Ok(())
    }
}

/// Driver for [`AgentKind::DirectProcess`]
pub struct DirectProcessDriver {
    interpreter: String,
    passthrough_env: Vec<String>,
    timings: DriverTimings,
    client: Client,
}

impl DirectProcessDriver {
    pub fn new(settings: &AdapterSettings) -> Self {
        Self {
            interpreter: settings.interpreter.clone(),
            passthrough_env: settings.passthrough_env.clone(),
            timings: settings.timings.clone(),
            client: build_http_client(settings.timings.request_timeout()),
        }
    }

    /// Give a fresh process a chance to bind. Proceeds once `/health` or `/`
    /// answers or the attempts run out; fails only if the process dies.
    async fn wait_ready(&self, instance: &mut ProcessInstance, base_url: &str) -> Result<()> {
        let timeout = self.timings.health_check_timeout();
        for attempt in 0..self.timings.health_attempts {
            if instance.has_exited() {
                return Err(Error::start_failed(format!(
                    "Agent process exited during startup ({})",
                    base_url
                )));
            }
            if probe(&self.client, &format!("{}/health", base_url), timeout).await
                || probe(&self.client, base_url, timeout).await
            {
                debug!("Agent ready at {} after {} attempts", base_url, attempt + 1);
                return Ok(());
            }
            tokio::time::sleep(self.timings.health_interval()).await;
        }

        info!("No health response from {}, treating as ready", base_url);
        Ok(())
    }
}

#[async_trait]
impl RuntimeDriver for DirectProcessDriver {
    fn kind(&self) -> AgentKind {
        AgentKind::DirectProcess
    }

    async fn start(
        &self,
        descriptor: &AgentDescriptor,
        ctx: &StartContext,
    ) -> Result<StartedInstance> {
        let entry = descriptor.entry_file.clone().ok_or_else(|| {
            Error::start_failed(format!("Agent {} has no entry script", descriptor.id))
        })?;
        let port = choose_port(&ctx.config)?;

        info!(
            agent_id = %descriptor.id,
            session_id = %ctx.session_id,
            port,
            "Starting agent process: {} {}",
            self.interpreter,
            entry
        );

        let mut instance = ProcessInstance::spawn(SpawnSpec {
            program: self.interpreter.clone(),
            args: vec![entry],
            cwd: descriptor.root_path.clone(),
            env: build_env(&self.passthrough_env, &ctx.config, &ctx.session_id, port),
            session_id: ctx.session_id.clone(),
        })?;

        let transport = Transport::http(LOCAL_HOST, port);
        if let Some(base_url) = transport.base_url() {
            self.wait_ready(&mut instance, &base_url).await?;
        }

        Ok(StartedInstance {
            transport,
            backing: Some(BackingHandle::Process(instance)),
        })
    }

    async fn deliver(&self, handle: &mut SessionHandle, message: &str) -> Result<DriverReply> {
        deliver_with_restarts(self, handle, message).await
    }

    async fn stop(&self, handle: &mut SessionHandle) -> Result<()> {
        let session_id = handle.session_id.clone();
        let Some(instance) = handle.process_mut() else {
            return Ok(());
        };

        info!(session_id = %session_id, "Stopping agent process");
        instance
            .terminate()
            .await
            .map_err(|e| Error::teardown_failed(format!("Failed to kill agent process: {}", e)))
    }
}

#[async_trait]
impl Restartable for DirectProcessDriver {
    async fn is_running(&self, handle: &mut SessionHandle) -> bool {
        handle
            .process_mut()
            .map(|p| !p.has_exited())
            .unwrap_or(false)
    }

    async fn restart(&self, handle: &mut SessionHandle, _cause: RestartCause) -> Result<()> {
        let instance = handle
            .process_mut()
            .ok_or_else(|| Error::delivery_failed("Session has no agent process"))?;
        instance.respawn().await?;
        tokio::time::sleep(self.timings.restart_grace()).await;
        Ok(())
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
