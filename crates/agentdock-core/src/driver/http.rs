//! HTTP plumbing shared by the drivers

use crate::error::{Error, Result};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{trace, warn};

/// Fields tried, in order, when pulling a reply out of an agent response
const REPLY_FIELDS: [&str; 5] = ["reply", "output", "response", "message", "text"];

pub(crate) fn build_http_client(timeout: Duration) -> Client {
    Client::builder().timeout(timeout).build().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to build HTTP client, using default");
        Client::new()
    })
}

/// Request body understood by agent processes and containers.
///
/// Carries both `{message, sessionId}` and the `{query, session_id, user_id}`
/// shape of agents built on the shared Python base agent.
pub fn agent_payload(session_id: &str, message: &str) -> Value {
    json!({
        "message": message,
        "sessionId": session_id,
        "query": message,
        "session_id": session_id,
        "user_id": session_id,
    })
}

/// POST a JSON body and decode the response. Non-JSON bodies come back as a
/// JSON string. Any transport or status failure is a delivery failure.
pub(crate) async fn post_json(
    client: &Client,
    url: &str,
    body: &Value,
    headers: &[(&str, &str)],
) -> Result<Value> {
    trace!("POST {}", url);

    let mut request = client.post(url).json(body);
    for (name, value) in headers {
        request = request.header(*name, *value);
    }

    let response = request
        .send()
        .await
        .map_err(|e| Error::delivery_failed(format!("POST {} failed: {}", url, e)))?;

    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| Error::delivery_failed(format!("Reading response from {} failed: {}", url, e)))?;

    if !status.is_success() {
        let excerpt: String = text.chars().take(200).collect();
        return Err(Error::delivery_failed(format!(
            "POST {} returned {}: {}",
            url, status, excerpt
        )));
    }

    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}

/// Whether `url` answers a GET with a success status within `timeout`
pub(crate) async fn probe(client: &Client, url: &str, timeout: Duration) -> bool {
    match client.get(url).timeout(timeout).send().await {
        Ok(response) => response.status().is_success(),
        Err(_) => false,
    }
}

/// Pull the reply text out of an agent response.
///
/// A response with `"success": false` is an error carrying its `error` text.
pub fn extract_reply(raw: &Value) -> std::result::Result<String, String> {
    let body = match raw {
        Value::Array(items) => items.first().unwrap_or(raw),
        _ => raw,
    };

    match body {
        Value::String(s) => Ok(s.clone()),
        Value::Object(map) => {
            if map.get("success").and_then(Value::as_bool) == Some(false) {
                let reason = map
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("agent reported failure");
                return Err(reason.to_string());
            }

            Ok(REPLY_FIELDS
                .iter()
                .find_map(|field| map.get(*field).and_then(Value::as_str))
                .map(str::to_string)
                .unwrap_or_else(|| body.to_string()))
        }
        other => Ok(other.to_string()),
    }
}
