//! Downstream transports: stdio (child process), SSE, and plain HTTP.
//!
//! Each transport exposes the two operations the router relies on —
//! `list_tools` and `call_tool` — behind a common trait so C3 can hold a
//! `Box<dyn DownstreamTransport>` regardless of which wire protocol the
//! downstream server speaks.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};

/// Auth material resolved by the token cache (C2) and attached to a request.
#[derive(Debug, Clone, Default)]
pub struct ResolvedAuth {
    pub headers: HashMap<String, String>,
}

/// Transport descriptor, per `ServerConfig.transport` in the data model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Sse {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JsonRpcRequest {
    id: u64,
    method: String,
    params: Value,
}

#[derive(Debug, Clone, Deserialize)]
struct JsonRpcResponse {
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcErrorBody>,
}

#[derive(Debug, Clone, Deserialize)]
struct JsonRpcErrorBody {
    message: String,
}

/// The operations the router and connection pool need from a live downstream
/// connection, independent of wire protocol.
#[async_trait]
pub trait DownstreamTransport: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<Value>>;
    async fn call_tool(&self, tool_name: &str, params: Value) -> Result<Value>;
    /// Lightweight liveness probe used by the connection pool's health check.
    async fn ping(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Spawns a child process and speaks newline-delimited JSON-RPC over its
/// stdin/stdout. A background task owns the stdout reader and correlates
/// responses to in-flight calls by request id.
pub struct StdioTransport {
    child: Mutex<Child>,
    stdin: Mutex<tokio::process::ChildStdin>,
    next_id: AtomicU64,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>,
    reader_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StdioTransport {
    pub fn spawn(command: &str, args: &[String], env: &HashMap<String, String>) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| GatewayError::UpstreamFailure(format!("failed to spawn {command}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| GatewayError::Internal("child stdin not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::Internal("child stdout not piped".into()))?;

        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let reader_pending = pending.clone();
        let reader_handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<JsonRpcResponse>(&line) {
                            Ok(resp) => {
                                let mut pending = reader_pending.lock().await;
                                if let Some(tx) = pending.remove(&resp.id) {
                                    let _ = tx.send(resp);
                                }
                            }
                            Err(e) => warn!("failed to parse downstream stdio line: {e}"),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("stdio reader error: {e}");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            next_id: AtomicU64::new(1),
            pending,
            reader_handle: Mutex::new(Some(reader_handle)),
        })
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = JsonRpcRequest {
            id,
            method: method.to_string(),
            params,
        };
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let mut line = serde_json::to_string(&req)?;
        line.push('\n');
        {
            let mut stdin = self.stdin.lock().await;
            stdin
                .write_all(line.as_bytes())
                .await
                .map_err(|e| GatewayError::UpstreamFailure(format!("stdin write failed: {e}")))?;
            stdin
                .flush()
                .await
                .map_err(|e| GatewayError::UpstreamFailure(format!("stdin flush failed: {e}")))?;
        }

        let resp = rx
            .await
            .map_err(|_| GatewayError::UpstreamFailure("downstream closed before responding".into()))?;

        if let Some(err) = resp.error {
            return Err(GatewayError::UpstreamFailure(err.message));
        }
        Ok(resp.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl DownstreamTransport for StdioTransport {
    async fn list_tools(&self) -> Result<Vec<Value>> {
        let result = self.request("list_tools", Value::Null).await?;
        match result {
            Value::Array(items) => Ok(items),
            other => Ok(vec![other]),
        }
    }

    async fn call_tool(&self, tool_name: &str, params: Value) -> Result<Value> {
        self.request(
            "call_tool",
            serde_json::json!({ "name": tool_name, "params": params }),
        )
        .await
    }

    async fn ping(&self) -> Result<()> {
        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => Err(GatewayError::UpstreamFailure(format!(
                "downstream process exited: {status}"
            ))),
            Err(e) => Err(GatewayError::UpstreamFailure(e.to_string())),
        }
    }

    async fn close(&self) -> Result<()> {
        if let Some(handle) = self.reader_handle.lock().await.take() {
            handle.abort();
        }
        let mut child = self.child.lock().await;
        let _ = child.start_kill();
        let _ = child.wait().await;
        Ok(())
    }
}

/// Plain HTTP transport: one POST per `call_tool`/`list_tools`.
pub struct HttpTransport {
    base_url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: &str, headers: HashMap<String, String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            headers,
            client: reqwest::Client::new(),
        }
    }

    fn apply_headers(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut builder = builder;
        for (k, v) in &self.headers {
            builder = builder.header(k, v);
        }
        builder
    }
}

#[async_trait]
impl DownstreamTransport for HttpTransport {
    async fn list_tools(&self) -> Result<Vec<Value>> {
        let url = format!("{}/tools", self.base_url);
        let resp = self
            .apply_headers(self.client.get(&url))
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamFailure(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(GatewayError::UpstreamFailure(format!("HTTP {}", resp.status())));
        }
        let body: Value = resp.json().await.map_err(|e| GatewayError::UpstreamFailure(e.to_string()))?;
        match body {
            Value::Array(items) => Ok(items),
            other => Ok(vec![other]),
        }
    }

    async fn call_tool(&self, tool_name: &str, params: Value) -> Result<Value> {
        let url = format!("{}/tools/{}", self.base_url, tool_name);
        let resp = self
            .apply_headers(self.client.post(&url))
            .json(&params)
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamFailure(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::UpstreamFailure(format!("HTTP {status}: {body}")));
        }
        resp.json().await.map_err(|e| GatewayError::UpstreamFailure(e.to_string()))
    }

    async fn ping(&self) -> Result<()> {
        let url = format!("{}/health", self.base_url);
        let resp = self
            .apply_headers(self.client.get(&url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamFailure(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(GatewayError::UpstreamFailure(format!("HTTP {}", resp.status())))
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// SSE transport: tool calls are sent as a GET carrying the request as a
/// query payload and the first `data:` frame of the response stream is
/// taken as the result. This mirrors how the pack's SSE downstreams behave
/// (request/response framed as a single-shot event stream) rather than a
/// long-lived duplex channel.
pub struct SseTransport {
    url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
}

impl SseTransport {
    pub fn new(url: &str, headers: HashMap<String, String>) -> Self {
        Self {
            url: url.to_string(),
            headers,
            client: reqwest::Client::new(),
        }
    }

    async fn first_event(&self, body: Value) -> Result<Value> {
        let mut builder = self.client.post(&self.url).header("Accept", "text/event-stream").json(&body);
        for (k, v) in &self.headers {
            builder = builder.header(k, v);
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamFailure(format!("SSE request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(GatewayError::UpstreamFailure(format!("HTTP {}", resp.status())));
        }

        let mut stream = resp.bytes_stream();
        let mut buffer = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| GatewayError::UpstreamFailure(format!("SSE stream error: {e}")))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            if let Some(event_end) = buffer.find("\n\n") {
                let event = buffer[..event_end].to_string();
                if let Some(data_line) = event.lines().find(|l| l.starts_with("data:")) {
                    let data = data_line.trim_start_matches("data:").trim();
                    return serde_json::from_str(data).map_err(GatewayError::from);
                }
            }
        }
        Err(GatewayError::UpstreamFailure("SSE stream closed with no data frame".into()))
    }
}

#[async_trait]
impl DownstreamTransport for SseTransport {
    async fn list_tools(&self) -> Result<Vec<Value>> {
        let result = self.first_event(serde_json::json!({ "method": "list_tools" })).await?;
        match result {
            Value::Array(items) => Ok(items),
            other => Ok(vec![other]),
        }
    }

    async fn call_tool(&self, tool_name: &str, params: Value) -> Result<Value> {
        self.first_event(serde_json::json!({ "method": "call_tool", "name": tool_name, "params": params }))
            .await
    }

    async fn ping(&self) -> Result<()> {
        debug!("SSE transport ping for {}", self.url);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Builds the correct transport for a descriptor, merging in auth headers
/// resolved by the token cache for the SSE/HTTP cases.
pub fn build_transport(config: &TransportConfig, auth: &ResolvedAuth) -> Result<Box<dyn DownstreamTransport>> {
    match config {
        TransportConfig::Stdio { command, args, env } => {
            let mut env = env.clone();
            env.extend(auth.headers.clone());
            Ok(Box::new(StdioTransport::spawn(command, args, &env)?))
        }
        TransportConfig::Sse { url, headers } => {
            let mut headers = headers.clone();
            headers.extend(auth.headers.clone());
            Ok(Box::new(SseTransport::new(url, headers)))
        }
        TransportConfig::Http { url, headers } => {
            let mut headers = headers.clone();
            headers.extend(auth.headers.clone());
            Ok(Box::new(HttpTransport::new(url, headers)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_config_deserializes_stdio() {
        let json = serde_json::json!({
            "kind": "stdio",
            "command": "my-tool-server",
            "args": ["--flag"],
        });
        let cfg: TransportConfig = serde_json::from_value(json).unwrap();
        matches!(cfg, TransportConfig::Stdio { .. });
    }

    #[tokio::test]
    async fn http_transport_surfaces_non_success_status() {
        let transport = HttpTransport::new("http://127.0.0.1:1", HashMap::new());
        let result = transport.call_tool("anything", Value::Null).await;
        assert!(result.is_err());
    }
}
