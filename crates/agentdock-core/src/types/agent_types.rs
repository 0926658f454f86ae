//! Agent descriptor types produced by the scanner

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// How an agent is executed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Entry script spawned as a local child process
    DirectProcess,
    /// Image built from the agent directory and run as a container
    Container,
    /// n8n workflow export triggered over its webhook
    N8nWorkflow,
    /// Voiceflow export driven through the remote runtime
    VoiceflowFlow,
    /// Nothing runnable was recognized
    Unknown,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectProcess => "direct_process",
            Self::Container => "container",
            Self::N8nWorkflow => "n8n_workflow",
            Self::VoiceflowFlow => "voiceflow_flow",
            Self::Unknown => "unknown",
        }
    }
}

impl Default for AgentKind {
    fn default() -> Self {
        Self::Unknown
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A discoverable agent, as classified by one scan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDescriptor {
    /// Directory name, unique within a scan
    pub id: String,
    pub kind: AgentKind,
    pub root_path: PathBuf,
    /// Execution entry point, relative to `root_path`
    pub entry_file: Option<String>,
    /// First top-level README heading, or the id
    pub name: String,
    pub description: String,
    /// File names found directly inside `root_path`, sorted
    pub files: Vec<String>,
}

impl AgentDescriptor {
    /// Absolute path of the entry file, if one was chosen
    pub fn entry_path(&self) -> Option<PathBuf> {
        self.entry_file.as_ref().map(|f| self.root_path.join(f))
    }

    pub fn is_runnable(&self) -> bool {
        self.kind != AgentKind::Unknown
    }
}
