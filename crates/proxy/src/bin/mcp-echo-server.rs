//! Minimal stdio MCP server used for demos and tests.
//!
//! Reads newline-delimited JSON-RPC from stdin and answers on stdout, one JSON value per
//! line. Logs go to stderr.

use mcp_stdio_proxy::jsonrpc::{INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::io::{self, BufRead as _, Write as _};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const SERVER_NAME: &str = "mcp-echo-server";
const DEFAULT_PROTOCOL_VERSION: &str = "2025-03-26";
const INVALID_PARAMS: i64 = -32602;

#[derive(Default)]
struct EchoServer {
    store: HashMap<String, Value>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_env("MCP_ECHO_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(false)
        .init();

    tracing::info!(pid = std::process::id(), "{SERVER_NAME} ready");

    let mut server = EchoServer::default();
    let stdin = io::stdin();
    let mut out = io::stdout().lock();

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<Value>(&line) {
            Ok(Value::Array(items)) => {
                let replies: Vec<Value> = items
                    .iter()
                    .filter_map(|item| server.handle(item, &mut out))
                    .collect();
                (!replies.is_empty()).then_some(Value::Array(replies))
            }
            Ok(message) => server.handle(&message, &mut out),
            Err(e) => Some(error(Value::Null, PARSE_ERROR, &format!("Parse error: {e}"))),
        };
        if let Some(reply) = reply {
            write_line(&mut out, &reply)?;
        }
    }

    tracing::info!("stdin closed; exiting");
    Ok(())
}

fn write_line(out: &mut impl io::Write, value: &Value) -> io::Result<()> {
    writeln!(out, "{value}")?;
    out.flush()
}

fn result(id: Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "result": result, "id": id})
}

fn error(id: Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "error": {"code": code, "message": message}, "id": id})
}

fn text(value: impl Into<String>) -> Value {
    json!({"content": [{"type": "text", "text": value.into()}], "isError": false})
}

impl EchoServer {
    /// Reply to one message; `None` for notifications and responses.
    fn handle(&mut self, message: &Value, out: &mut impl io::Write) -> Option<Value> {
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            return match message.get("id") {
                // A response from the client; nothing to answer.
                Some(_) if message.get("result").is_some() || message.get("error").is_some() => {
                    None
                }
                id => Some(error(
                    id.cloned().unwrap_or(Value::Null),
                    INVALID_REQUEST,
                    "Invalid Request",
                )),
            };
        };
        let Some(id) = message.get("id").filter(|id| !id.is_null()).cloned() else {
            tracing::debug!(method, "notification");
            return None;
        };
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        tracing::debug!(method, %id, "request");
        Some(match method {
            "initialize" => result(
                id,
                json!({
                    "protocolVersion": params
                        .get("protocolVersion")
                        .and_then(Value::as_str)
                        .unwrap_or(DEFAULT_PROTOCOL_VERSION),
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION")},
                }),
            ),
            "ping" => result(id, json!({})),
            "tools/list" => result(id, json!({"tools": tool_descriptors()})),
            "tools/call" => self.call_tool(id, &params, out),
            _ => error(id, METHOD_NOT_FOUND, &format!("Method not found: {method}")),
        })
    }

    fn call_tool(&mut self, id: Value, params: &Value, out: &mut impl io::Write) -> Value {
        let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
        let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
        let arg_str = |key: &str| args.get(key).and_then(Value::as_str).map(str::to_string);

        match name {
            "echo" => match arg_str("message") {
                Some(message) => result(id, text(message)),
                None => error(id, INVALID_PARAMS, "echo requires a 'message' string"),
            },
            "set" => match arg_str("key") {
                Some(key) => {
                    let value = args.get("value").cloned().unwrap_or(Value::Null);
                    self.store.insert(key, value);
                    result(id, text("ok"))
                }
                None => error(id, INVALID_PARAMS, "set requires a 'key' string"),
            },
            "get" => match arg_str("key") {
                Some(key) => {
                    let value = self.store.get(&key).cloned().unwrap_or(Value::Null);
                    result(id, text(value.to_string()))
                }
                None => error(id, INVALID_PARAMS, "get requires a 'key' string"),
            },
            "pid" => result(id, text(std::process::id().to_string())),
            "sleep" => {
                let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(1000);
                std::thread::sleep(Duration::from_millis(ms));
                result(id, text(format!("slept {ms}ms")))
            }
            "notify" => {
                let message = arg_str("message").unwrap_or_else(|| "working".to_string());
                let notification = json!({
                    "jsonrpc": "2.0",
                    "method": "notifications/message",
                    "params": {"level": "info", "logger": SERVER_NAME, "data": message},
                });
                if let Err(e) = write_line(out, &notification) {
                    tracing::warn!(error = %e, "failed to write notification");
                }
                result(id, text(message))
            }
            "garbage" => {
                if let Err(e) = writeln!(out, "this line is not json").and_then(|()| out.flush()) {
                    tracing::warn!(error = %e, "failed to write garbage line");
                }
                result(id, text("after garbage"))
            }
            "crash" => {
                tracing::warn!("crash requested; exiting without reply");
                std::process::exit(3);
            }
            _ => error(id, INVALID_PARAMS, &format!("Unknown tool: {name}")),
        }
    }
}

fn tool_descriptors() -> Value {
    let tool = |name: &str, description: &str, properties: Value| {
        json!({
            "name": name,
            "description": description,
            "inputSchema": {"type": "object", "properties": properties},
        })
    };
    json!([
        tool("echo", "Echoes back the input message", json!({"message": {"type": "string"}})),
        tool(
            "set",
            "Stores a value for this process",
            json!({"key": {"type": "string"}, "value": {}}),
        ),
        tool("get", "Reads a stored value", json!({"key": {"type": "string"}})),
        tool("pid", "Returns the server process id", json!({})),
        tool("sleep", "Sleeps before replying", json!({"ms": {"type": "integer"}})),
        tool(
            "notify",
            "Emits a log notification, then replies",
            json!({"message": {"type": "string"}}),
        ),
        tool("garbage", "Writes a malformed line, then replies", json!({})),
        tool("crash", "Exits without replying", json!({})),
    ])
}
