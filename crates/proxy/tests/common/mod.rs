#![allow(dead_code)]

use anyhow::Context as _;
use mcp_stdio_proxy::bridge::BridgeOptions;
use mcp_stdio_proxy::gateway::{GatewaySettings, ProxyGateway};
use mcp_stdio_proxy::http::{AppState, create_router, with_request_counting};
use mcp_stdio_proxy::manager::SessionManager;
use mcp_stdio_proxy::reaper::{ReaperSettings, spawn_idle_reaper};
use mcp_stdio_proxy::registry::{ContainerEvents, ServerLaunchSpec, StaticRegistry};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const ACCEPT_JSON: &str = "application/json";
pub const ACCEPT_SSE: &str = "text/event-stream";

pub const CONTAINER: &str = "c1";
pub const ECHO: &str = "echo";

#[derive(Debug, Clone, Copy)]
pub struct ProxyOptions {
    pub call_timeout: Duration,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub sse_keep_alive: Duration,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(300),
            sse_keep_alive: Duration::from_secs(15),
        }
    }
}

/// An in-process proxy bound to an ephemeral port.
pub struct TestProxy {
    pub base: String,
    pub client: reqwest::Client,
    pub manager: Arc<SessionManager>,
    pub registry: Arc<StaticRegistry>,
    pub events: ContainerEvents,
    shutdown: CancellationToken,
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub fn echo_spec() -> ServerLaunchSpec {
    ServerLaunchSpec {
        command: env!("CARGO_BIN_EXE_mcp-echo-server").to_string(),
        args: Vec::new(),
        env: HashMap::from([("MCP_ECHO_LOG".to_string(), "debug".to_string())]),
    }
}

pub async fn start_proxy(options: ProxyOptions) -> anyhow::Result<TestProxy> {
    let events = ContainerEvents::new();
    let registry = Arc::new(StaticRegistry::new(HashMap::new(), events.clone()));
    registry.insert_server(CONTAINER, ECHO, echo_spec());
    registry.insert_server(
        CONTAINER,
        "broken",
        ServerLaunchSpec {
            command: "/nonexistent/mcp-server-binary".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
        },
    );

    let manager = Arc::new(SessionManager::new(
        registry.clone(),
        BridgeOptions {
            stop_grace: Duration::from_millis(500),
        },
    ));

    let shutdown = CancellationToken::new();
    spawn_idle_reaper(
        manager.clone(),
        ReaperSettings {
            idle_timeout: options.idle_timeout,
            sweep_interval: options.sweep_interval,
        },
        events.subscribe(),
        shutdown.clone(),
    );

    let gateway = ProxyGateway::new(
        manager.clone(),
        GatewaySettings {
            call_timeout: options.call_timeout,
            sse_keep_alive: options.sse_keep_alive,
        },
    );
    let state = Arc::new(AppState::new(gateway, "test"));
    let app = with_request_counting(create_router(state.clone()), state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .context("bind ephemeral port")?;
    let addr = listener.local_addr()?;
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await;
    });

    Ok(TestProxy {
        base: format!("http://{addr}"),
        client: reqwest::Client::new(),
        manager,
        registry,
        events,
        shutdown,
    })
}

impl TestProxy {
    pub fn endpoint(&self, container_id: &str, server_name: &str) -> String {
        format!(
            "{}/containers/{container_id}/mcp-proxy/{server_name}",
            self.base
        )
    }

    pub async fn post(
        &self,
        server_name: &str,
        session_id: Option<&str>,
        accept: &str,
        body: &Value,
    ) -> anyhow::Result<reqwest::Response> {
        self.post_raw(
            CONTAINER,
            server_name,
            session_id,
            accept,
            serde_json::to_vec(body)?,
        )
        .await
    }

    pub async fn post_raw(
        &self,
        container_id: &str,
        server_name: &str,
        session_id: Option<&str>,
        accept: &str,
        body: Vec<u8>,
    ) -> anyhow::Result<reqwest::Response> {
        let mut req = self
            .client
            .post(self.endpoint(container_id, server_name))
            .header("Accept", accept)
            .header("Content-Type", "application/json")
            .body(body);
        if let Some(session_id) = session_id {
            req = req.header("Mcp-Session-Id", session_id);
        }
        req.send().await.context("POST mcp-proxy")
    }

    /// POST in JSON mode and return (status, session id, body).
    pub async fn call_json(
        &self,
        session_id: Option<&str>,
        body: &Value,
    ) -> anyhow::Result<(reqwest::StatusCode, Option<String>, Value)> {
        let resp = self.post(ECHO, session_id, ACCEPT_JSON, body).await?;
        let status = resp.status();
        let session = session_header(&resp);
        let body = resp.json::<Value>().await.context("decode JSON body")?;
        Ok((status, session, body))
    }

    pub async fn status(&self) -> anyhow::Result<Value> {
        self.client
            .get(format!("{}/status", self.base))
            .send()
            .await?
            .json::<Value>()
            .await
            .context("decode /status")
    }
}

pub fn session_header(resp: &reqwest::Response) -> Option<String> {
    resp.headers()
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

pub fn request(id: impl Into<Value>, method: &str, params: Value) -> Value {
    serde_json::json!({"jsonrpc": "2.0", "method": method, "params": params, "id": id.into()})
}

pub fn tool_call(id: impl Into<Value>, name: &str, arguments: Value) -> Value {
    request(
        id,
        "tools/call",
        serde_json::json!({"name": name, "arguments": arguments}),
    )
}

/// Text of the first content item of a `tools/call` result.
pub fn tool_text(reply: &Value) -> &str {
    reply["result"]["content"][0]["text"]
        .as_str()
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Split an SSE body into events. Comments (keep-alives) are skipped.
pub fn decode_sse_events(body: &str) -> Vec<SseEvent> {
    let mut events = Vec::new();
    let mut event: Option<String> = None;
    let mut data: Vec<&str> = Vec::new();

    for line in body.lines() {
        if line.is_empty() {
            if !data.is_empty() {
                events.push(SseEvent {
                    event: event.take(),
                    data: data.join("\n"),
                });
                data.clear();
            }
            event = None;
            continue;
        }
        if line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            data.push(rest.strip_prefix(' ').unwrap_or(rest));
        } else if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        }
    }
    if !data.is_empty() {
        events.push(SseEvent {
            event,
            data: data.join("\n"),
        });
    }
    events
}

pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> anyhow::Result<()>
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .context("condition not met in time")
}
