//! Stdio JSON-RPC admin channel.
//!
//! A parallel control surface for out-of-process supervisors: line-
//! delimited JSON-RPC 2.0 on stdin/stdout, translated onto a running
//! gateway's local HTTP API. One request per line, one response per
//! line; unknown verbs answer with a method-not-found error.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    jsonrpc: Option<String>,
    id: Value,
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
struct RpcError {
    code: i64,
    message: String,
}

const METHOD_NOT_FOUND: i64 = -32601;
const UPSTREAM_ERROR: i64 = -32000;

/// Map an admin verb to the gateway HTTP path.
fn route_for(method: &str, params: Option<&Value>) -> Option<String> {
    match method {
        "health" => Some("/api/v1/health".into()),
        "config.get" => Some("/api/v1/admin/config".into()),
        "tools.list" => Some("/api/v1/tools".into()),
        "policies.list" => Some("/api/v1/policies".into()),
        "cost.summary" => Some("/api/v1/cost".into()),
        "audit.tail" => {
            let limit = params
                .and_then(|p| p.get("limit"))
                .and_then(|l| l.as_u64())
                .unwrap_or(50);
            Some(format!("/api/v1/audit?limit={limit}"))
        }
        _ => None,
    }
}

pub async fn run(base_url: &str) -> anyhow::Result<()> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()?;
    let token = std::env::var("HEARTH_API_TOKEN").ok();

    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let request: RpcRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                let response = RpcResponse {
                    jsonrpc: "2.0",
                    id: Value::Null,
                    result: None,
                    error: Some(RpcError {
                        code: -32700,
                        message: format!("parse error: {e}"),
                    }),
                };
                write_line(&mut stdout, &response).await?;
                continue;
            }
        };
        let _ = &request.jsonrpc;

        let response = match route_for(&request.method, request.params.as_ref()) {
            Some(path) => {
                let mut http = client.get(format!("{base_url}{path}"));
                if let Some(token) = &token {
                    http = http.header("Authorization", format!("Bearer {token}"));
                }
                match http.send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        let body: Value = resp.json().await.unwrap_or(Value::Null);
                        if status.is_success() {
                            RpcResponse {
                                jsonrpc: "2.0",
                                id: request.id,
                                result: Some(body),
                                error: None,
                            }
                        } else {
                            RpcResponse {
                                jsonrpc: "2.0",
                                id: request.id,
                                result: None,
                                error: Some(RpcError {
                                    code: UPSTREAM_ERROR,
                                    message: format!("gateway answered HTTP {status}: {body}"),
                                }),
                            }
                        }
                    }
                    Err(e) => RpcResponse {
                        jsonrpc: "2.0",
                        id: request.id,
                        result: None,
                        error: Some(RpcError {
                            code: UPSTREAM_ERROR,
                            message: format!("gateway unreachable: {e}"),
                        }),
                    },
                }
            }
            None => RpcResponse {
                jsonrpc: "2.0",
                id: request.id,
                result: None,
                error: Some(RpcError {
                    code: METHOD_NOT_FOUND,
                    message: format!("unknown method '{}'", request.method),
                }),
            },
        };

        write_line(&mut stdout, &response).await?;
    }

    Ok(())
}

async fn write_line(stdout: &mut tokio::io::Stdout, response: &RpcResponse) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(response)?;
    line.push('\n');
    stdout.write_all(line.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_verbs_route() {
        assert_eq!(route_for("health", None).as_deref(), Some("/api/v1/health"));
        assert_eq!(route_for("tools.list", None).as_deref(), Some("/api/v1/tools"));
        let params = serde_json::json!({"limit": 5});
        assert_eq!(
            route_for("audit.tail", Some(&params)).as_deref(),
            Some("/api/v1/audit?limit=5")
        );
        assert!(route_for("nonsense", None).is_none());
    }
}
