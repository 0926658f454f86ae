//! n8n webhook driver
//!
//! Workflows run on an externally managed n8n server. Nothing is spawned and
//! nothing is restarted; each message is one POST to the workflow's webhook.

use super::http::{build_http_client, extract_reply, post_json};
use super::{DriverReply, RuntimeDriver, StartContext, StartedInstance};
use crate::error::{Error, Result};
use crate::session::{SessionHandle, Transport};
use crate::types::{AdapterSettings, AgentDescriptor, AgentKind};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info};

/// Path of the first webhook trigger node in `workflow`.
///
/// Uses the node's `parameters.path`, falling back to its `webhookId`.
pub fn webhook_path(workflow: &Value) -> Option<String> {
    let nodes = workflow.get("nodes")?.as_array()?;
    let node = nodes.iter().find(|node| {
        node.get("type")
            .and_then(Value::as_str)
            .map(|t| t.to_lowercase().contains("webhook"))
            .unwrap_or(false)
    })?;

    node.pointer("/parameters/path")
        .and_then(Value::as_str)
        .filter(|p| !p.trim().is_empty())
        .or_else(|| node.get("webhookId").and_then(Value::as_str))
        .map(|p| p.trim_matches('/').to_string())
}

/// Driver for [`AgentKind::N8nWorkflow`]
pub struct N8nDriver {
    base_url: String,
    api_token: Option<String>,
    client: Client,
}

impl N8nDriver {
    pub fn new(settings: &AdapterSettings) -> Self {
        Self {
            base_url: settings.n8n.base_url.trim_end_matches('/').to_string(),
            api_token: settings.n8n.api_token.clone(),
            client: build_http_client(settings.timings.request_timeout()),
        }
    }
}

#[async_trait]
impl RuntimeDriver for N8nDriver {
    fn kind(&self) -> AgentKind {
        AgentKind::N8nWorkflow
    }

    async fn start(
        &self,
        descriptor: &AgentDescriptor,
        _ctx: &StartContext,
    ) -> Result<StartedInstance> {
        let path = descriptor
            .entry_path()
            .ok_or_else(|| Error::start_failed("Workflow agent has no entry file"))?;

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::start_failed(format!("Failed to read {:?}: {}", path, e)))?;
        let workflow: Value = serde_json::from_str(&content)
            .map_err(|e| Error::start_failed(format!("Invalid workflow {:?}: {}", path, e)))?;

        info!(agent_id = %descriptor.id, "Loaded n8n workflow from {:?}", path);
        Ok(StartedInstance {
            transport: Transport::Webhook { workflow },
            backing: None,
        })
    }

    async fn deliver(&self, handle: &mut SessionHandle, message: &str) -> Result<DriverReply> {
        let Transport::Webhook { workflow } = &handle.transport else {
            return Err(Error::delivery_failed("Session has no workflow"));
        };
        let path = webhook_path(workflow)
            .ok_or_else(|| Error::delivery_failed("Workflow has no webhook trigger node"))?;

        let url = format!("{}/webhook/{}", self.base_url, path);
        debug!(session_id = %handle.session_id, "Triggering {}", url);

        let bearer = self.api_token.as_ref().map(|t| format!("Bearer {}", t));
        let headers: Vec<(&str, &str)> = bearer
            .as_deref()
            .map(|value| vec![("Authorization", value)])
            .unwrap_or_default();

        let raw = post_json(
            &self.client,
            &url,
            &json!({ "message": message, "sessionId": handle.session_id }),
            &headers,
        )
        .await?;
        let reply = extract_reply(&raw).map_err(Error::delivery_failed)?;

        Ok(DriverReply {
            reply,
            raw,
            attempts: 1,
        })
    }

    async fn stop(&self, handle: &mut SessionHandle) -> Result<()> {
        debug!(session_id = %handle.session_id, "Releasing workflow session");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use axum::{http::HeaderMap, routing::post, Json, Router};
    use std::path::Path;
    use tempfile::TempDir;

    fn workflow() -> Value {
        json!({
            "name": "echo",
            "nodes": [
                { "name": "Start", "type": "n8n-nodes-base.start", "parameters": {} },
                {
                    "name": "Webhook",
                    "type": "n8n-nodes-base.webhook",
                    "webhookId": "f00d",
                    "parameters": { "path": "echo-agent", "httpMethod": "POST" }
                }
            ],
            "connections": {}
        })
    }

    fn descriptor(root: &Path) -> AgentDescriptor {
        AgentDescriptor {
            id: "echo".to_string(),
            kind: AgentKind::N8nWorkflow,
            root_path: root.to_path_buf(),
            entry_file: Some("echo.json".to_string()),
            name: "echo".to_string(),
            description: String::new(),
            files: vec!["echo.json".to_string()],
        }
    }

    fn ctx() -> StartContext {
        StartContext {
            session_id: "s-1".to_string(),
            config: Default::default(),
        }
    }

    /// Fake n8n echoing the body and the Authorization header
    async fn serve_n8n() -> String {
        let app = Router::new().route(
            "/webhook/echo-agent",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                Json(json!({
                    "output": format!("{} from {}", body["message"].as_str().unwrap_or(""), body["sessionId"].as_str().unwrap_or("")),
                    "auth": auth,
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn driver(base_url: &str, token: Option<&str>) -> N8nDriver {
        let mut settings = AdapterSettings::default();
        settings.n8n.base_url = format!("{}/", base_url);
        settings.n8n.api_token = token.map(str::to_string);
        N8nDriver::new(&settings)
    }

    #[test]
    fn test_webhook_path_from_parameters() {
        assert_eq!(webhook_path(&workflow()).as_deref(), Some("echo-agent"));
    }

    #[test]
    fn test_webhook_path_falls_back_to_id() {
        let wf = json!({
            "nodes": [{ "type": "n8n-nodes-base.Webhook", "webhookId": "abc-123", "parameters": {} }],
            "connections": {}
        });
        assert_eq!(webhook_path(&wf).as_deref(), Some("abc-123"));
    }

    #[test]
    fn test_webhook_path_missing() {
        let wf = json!({ "nodes": [{ "type": "n8n-nodes-base.set" }], "connections": {} });
        assert_eq!(webhook_path(&wf), None);
        assert_eq!(webhook_path(&json!({})), None);
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_json() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("echo.json"), "{ not json").unwrap();

        let err = driver("http://localhost:1", None)
            .start(&descriptor(dir.path()), &ctx())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DriverStartFailed);
    }

    #[tokio::test]
    async fn test_deliver_posts_to_webhook_with_bearer() {
        let base = serve_n8n().await;
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("echo.json"), workflow().to_string()).unwrap();
        let driver = driver(&base, Some("n8n-token"));

        let started = driver.start(&descriptor(dir.path()), &ctx()).await.unwrap();
        assert!(started.backing.is_none());
        let mut handle = SessionHandle::new(
            "s-1",
            "echo",
            AgentKind::N8nWorkflow,
            started.transport,
            None,
        );

        let reply = driver.deliver(&mut handle, "hi").await.unwrap();

        assert_eq!(reply.reply, "hi from s-1");
        assert_eq!(reply.raw["auth"], "Bearer n8n-token");
        assert_eq!(reply.attempts, 1);
    }

    #[tokio::test]
    async fn test_server_error_is_not_retried() {
        let base = serve_n8n().await;
        let wf = json!({
            "nodes": [{ "type": "n8n-nodes-base.webhook", "parameters": { "path": "unknown-hook" } }],
            "connections": {}
        });
        let driver = driver(&base, None);
        let mut handle = SessionHandle::new(
            "s-1",
            "echo",
            AgentKind::N8nWorkflow,
            Transport::Webhook { workflow: wf },
            None,
        );

        let err = driver.deliver(&mut handle, "hi").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DeliveryFailed);
        assert!(err.to_string().contains("404"));
        assert_eq!(handle.retry_count, 0);
    }
}
