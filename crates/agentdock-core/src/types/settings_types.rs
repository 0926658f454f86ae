//! Adapter settings

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Remote n8n server used by webhook workflows
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct N8nSettings {
    #[serde(default = "default_n8n_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_token: Option<String>,
}

impl Default for N8nSettings {
    fn default() -> Self {
        Self {
            base_url: default_n8n_base_url(),
            api_token: None,
        }
    }
}

fn default_n8n_base_url() -> String {
    "http://localhost:5678".to_string()
}

/// Remote Voiceflow runtime used by flow exports
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceflowSettings {
    #[serde(default = "default_voiceflow_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_token: Option<String>,
    /// Sent as the `versionID` header when set
    #[serde(default)]
    pub version_id: Option<String>,
}

impl Default for VoiceflowSettings {
    fn default() -> Self {
        Self {
            base_url: default_voiceflow_base_url(),
            api_token: None,
            version_id: None,
        }
    }
}

fn default_voiceflow_base_url() -> String {
    "https://general-runtime.voiceflow.com".to_string()
}

/// Timeouts and waits used by the drivers, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverTimings {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Wait after respawning a process or fully cycling a container
    #[serde(default = "default_restart_grace_ms")]
    pub restart_grace_ms: u64,
    /// Wait after starting a stopped container in place
    #[serde(default = "default_container_resume_grace_ms")]
    pub container_resume_grace_ms: u64,
    #[serde(default = "default_health_attempts")]
    pub health_attempts: u32,
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,
    #[serde(default = "default_build_timeout_ms")]
    pub build_timeout_ms: u64,
}

impl DriverTimings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn restart_grace(&self) -> Duration {
        Duration::from_millis(self.restart_grace_ms)
    }

    pub fn container_resume_grace(&self) -> Duration {
        Duration::from_millis(self.container_resume_grace_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    /// Per-request bound on one health check; never below 250ms
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms.max(250))
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_millis(self.build_timeout_ms)
    }
}

impl Default for DriverTimings {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            restart_grace_ms: default_restart_grace_ms(),
            container_resume_grace_ms: default_container_resume_grace_ms(),
            health_attempts: default_health_attempts(),
            health_interval_ms: default_health_interval_ms(),
            build_timeout_ms: default_build_timeout_ms(),
        }
    }
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_restart_grace_ms() -> u64 {
    5_000
}

fn default_container_resume_grace_ms() -> u64 {
    3_000
}

fn default_health_attempts() -> u32 {
    10
}

fn default_health_interval_ms() -> u64 {
    1_000
}

fn default_build_timeout_ms() -> u64 {
    600_000
}

/// Settings handed to the orchestrator at construction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterSettings {
    #[serde(default = "default_agents_dir")]
    pub agents_dir: PathBuf,
    /// Extension of entry scripts, without the dot
    #[serde(default = "default_script_extension")]
    pub script_extension: String,
    /// Program that runs a direct-process entry script
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,
    /// Port agents listen on inside their container
    #[serde(default = "default_container_port")]
    pub container_port: u16,
    #[serde(default = "default_ignored_dirs")]
    pub ignored_dirs: Vec<String>,
    /// Host variables copied into every spawned process or container
    #[serde(default = "default_passthrough_env")]
    pub passthrough_env: Vec<String>,
    #[serde(default)]
    pub n8n: N8nSettings,
    #[serde(default)]
    pub voiceflow: VoiceflowSettings,
    #[serde(default)]
    pub timings: DriverTimings,
}

fn default_agents_dir() -> PathBuf {
    PathBuf::from("./agents")
}

fn default_script_extension() -> String {
    "py".to_string()
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_docker_bin() -> String {
    "docker".to_string()
}

fn default_container_port() -> u16 {
    3000
}

fn default_ignored_dirs() -> Vec<String> {
    ["shared", "docs", "components", "utils", "node_modules", "__pycache__"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_passthrough_env() -> Vec<String> {
    [
        "OPENAI_API_KEY",
        "ANTHROPIC_API_KEY",
        "GEMINI_API_KEY",
        "LLM_PROVIDER",
        "SUPABASE_URL",
        "SUPABASE_KEY",
        "API_BEARER_TOKEN",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            agents_dir: default_agents_dir(),
            script_extension: default_script_extension(),
            interpreter: default_interpreter(),
            docker_bin: default_docker_bin(),
            container_port: default_container_port(),
            ignored_dirs: default_ignored_dirs(),
            passthrough_env: default_passthrough_env(),
            n8n: N8nSettings::default(),
            voiceflow: VoiceflowSettings::default(),
            timings: DriverTimings::default(),
        }
    }
}

impl AdapterSettings {
    /// Default settings file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("agentdock").join("settings.json"))
    }

    /// Load settings from a JSON file, or defaults when no path is given,
    /// then overlay environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => {
                info!("Loading settings from {:?}", path);
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("Failed to read {}: {}", path.display(), e))
                })?;
                serde_json::from_str(&raw).map_err(|e| {
                    Error::Config(format!("Invalid settings in {}: {}", path.display(), e))
                })?
            }
            None => Self::default(),
        };

        settings.apply_env();
        Ok(settings)
    }

    /// Overlay settings from process environment variables
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = lookup("AGENTDOCK_AGENTS_DIR") {
            self.agents_dir = PathBuf::from(dir);
        }
        if let Some(python) = lookup("AGENTDOCK_PYTHON") {
            self.interpreter = python;
        }
        if let Some(docker) = lookup("AGENTDOCK_DOCKER_BIN") {
            self.docker_bin = docker;
        }
        if let Some(url) = lookup("N8N_BASE_URL") {
            self.n8n.base_url = url;
        }
        if let Some(token) = lookup("N8N_API_KEY") {
            self.n8n.api_token = Some(token);
        }
        if let Some(url) = lookup("VOICEFLOW_API_URL") {
            self.voiceflow.base_url = url;
        }
        if let Some(token) = lookup("VOICEFLOW_API_KEY") {
            self.voiceflow.api_token = Some(token);
        }
        if let Some(version) = lookup("VOICEFLOW_VERSION_ID") {
            self.voiceflow.version_id = Some(version);
        }
        debug!("Effective agents dir: {:?}", self.agents_dir);
    }
}
