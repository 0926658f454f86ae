//! Session-facing result types

use super::AgentKind;
use serde::{Deserialize, Serialize};

/// Result of a successful session creation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSession {
    pub session_id: String,
    pub agent_id: String,
    pub kind: AgentKind,
}

/// Reply to one delivered message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReply {
    pub session_id: String,
    pub reply: String,
    /// Payload exactly as the agent returned it
    pub raw: serde_json::Value,
    /// Delivery attempts made, 1 when no restart was needed
    pub attempts: u32,
}

/// Snapshot of one live session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub agent_id: String,
    pub kind: AgentKind,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub uptime_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// One teardown that failed during cleanup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupFailure {
    pub session_id: String,
    pub message: String,
}

/// Outcome of stopping every live session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub stopped: usize,
    pub failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}
