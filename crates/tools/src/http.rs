//! HTTP remote provider.
//!
//! Tool servers expose `POST /tools/list` and `POST /tools/call` with
//! JSON bodies. Connections are pooled per endpoint; idle connections
//! close after 60 s.

use std::time::Duration;

use hearth_domain::error::{Error, Result};
use hearth_domain::tool::ToolDefinition;

use crate::{ToolOutput, ToolProvider};

pub struct HttpProvider {
    name: String,
    base_url: String,
    auth_token: Option<String>,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: &str,
        auth_token: Option<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            name: name.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
            client,
        })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(format!("{}{path}", self.base_url))
            .header("Content-Type", "application/json");
        if let Some(token) = &self.auth_token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        builder
    }

    async fn send(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let resp = self
            .post(path)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(e.to_string())
                } else {
                    Error::Http(e.to_string())
                }
            })?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(Error::Tool {
                tool: self.name.clone(),
                message: format!("HTTP {} - {text}", status.as_u16()),
            });
        }
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait::async_trait]
impl ToolProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
        let body = self.send("/tools/list", serde_json::json!({})).await?;
        let tools = body
            .get("tools")
            .cloned()
            .unwrap_or(serde_json::Value::Array(vec![]));
        Ok(serde_json::from_value(tools)?)
    }

    async fn call(&self, tool: &str, arguments: &serde_json::Value) -> Result<ToolOutput> {
        let body = self
            .send(
                "/tools/call",
                serde_json::json!({ "tool": tool, "arguments": arguments }),
            )
            .await?;
        let content = match body.get("content").and_then(|c| c.as_str()) {
            Some(text) => text.to_owned(),
            None => body.to_string(),
        };
        let is_error = body
            .get("is_error")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Ok(ToolOutput { content, is_error })
    }
}
