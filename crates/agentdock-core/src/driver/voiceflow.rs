//! Voiceflow runtime driver
//!
//! Conversation state lives on the remote runtime and is echoed back with
//! every turn. The driver stores the latest state on the session handle and
//! sends it with the next message.

use super::http::{build_http_client, post_json};
use super::{DriverReply, RuntimeDriver, StartContext, StartedInstance};
use crate::error::{Error, Result};
use crate::session::{SessionHandle, Transport};
use crate::types::{AdapterSettings, AgentDescriptor, AgentKind};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info};

/// Trace entry types that carry user-visible text
const TEXT_TRACE_TYPES: [&str; 2] = ["speak", "text"];

/// Join the text of every speak/text trace entry, one per line
pub fn reduce_trace(trace: &[Value]) -> String {
    trace
        .iter()
        .filter(|entry| {
            entry
                .get("type")
                .and_then(Value::as_str)
                .map(|t| TEXT_TRACE_TYPES.contains(&t))
                .unwrap_or(false)
        })
        .filter_map(|entry| {
            let payload = entry.get("payload")?;
            payload
                .get("message")
                .or_else(|| payload.get("text"))
                .and_then(Value::as_str)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Driver for [`AgentKind::VoiceflowFlow`]
pub struct VoiceflowDriver {
    base_url: String,
    api_token: Option<String>,
    version_id: Option<String>,
    client: Client,
}

impl VoiceflowDriver {
    pub fn new(settings: &AdapterSettings) -> Self {
        Self {
            base_url: settings.voiceflow.base_url.trim_end_matches('/').to_string(),
            api_token: settings.voiceflow.api_token.clone(),
            version_id: settings.voiceflow.version_id.clone(),
            client: build_http_client(settings.timings.request_timeout()),
        }
    }
}

#[async_trait]
impl RuntimeDriver for VoiceflowDriver {
    fn kind(&self) -> AgentKind {
        AgentKind::VoiceflowFlow
    }

    async fn start(
        &self,
        descriptor: &AgentDescriptor,
        _ctx: &StartContext,
    ) -> Result<StartedInstance> {
        let path = descriptor
            .entry_path()
            .ok_or_else(|| Error::start_failed("Flow agent has no entry file"))?;

        let flow = tokio::fs::read(&path)
            .await
            .map_err(|e| Error::start_failed(format!("Failed to read {:?}: {}", path, e)))?;

        info!(
            agent_id = %descriptor.id,
            "Loaded Voiceflow export {:?} ({} bytes)",
            path,
            flow.len()
        );
        Ok(StartedInstance {
            transport: Transport::Voiceflow { flow, state: None },
            backing: None,
        })
    }

    async fn deliver(&self, handle: &mut SessionHandle, message: &str) -> Result<DriverReply> {
        let Transport::Voiceflow { state, .. } = &mut handle.transport else {
            return Err(Error::delivery_failed("Session has no Voiceflow state"));
        };

        let body = json!({
            "action": { "type": "text", "payload": message },
            "sessionID": handle.session_id,
            "state": state,
        });

        let mut headers: Vec<(&str, &str)> = Vec::new();
        if let Some(token) = self.api_token.as_deref() {
            headers.push(("Authorization", token));
        }
        if let Some(version) = self.version_id.as_deref() {
            headers.push(("versionID", version));
        }

        let url = format!("{}/interact", self.base_url);
        let raw = post_json(&self.client, &url, &body, &headers).await?;

        // Some runtimes answer with the bare trace array
        let (new_state, trace) = match &raw {
            Value::Array(trace) => (None, trace.clone()),
            Value::Object(map) => (
                map.get("state").filter(|s| !s.is_null()).cloned(),
                map.get("trace")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
            ),
            other => {
                return Err(Error::delivery_failed(format!(
                    "Unexpected Voiceflow response: {}",
                    other
                )))
            }
        };

        if new_state.is_some() {
            *state = new_state;
        }
        debug!(
            session_id = %handle.session_id,
            entries = trace.len(),
            "Voiceflow turn complete"
        );

        Ok(DriverReply {
            reply: reduce_trace(&trace),
            raw,
            attempts: 1,
        })
    }

    async fn stop(&self, handle: &mut SessionHandle) -> Result<()> {
        if let Transport::Voiceflow { state, .. } = &mut handle.transport {
            *state = None;
        }
        Ok(())
    }
}
