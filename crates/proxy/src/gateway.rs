//! MCP proxy gateway: turns one HTTP POST into a session call and renders the replies.

use crate::error::ProxyError;
use crate::jsonrpc::{JsonRpcMessage, Payload, RequestId};
use crate::manager::SessionManager;
use crate::session::{Call, CallEvent, Session, SessionKey};
use axum::Json;
use axum::http::{HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument as _;

pub const HEADER_SESSION_ID: &str = "mcp-session-id";
pub const JSON_MIME_TYPE: &str = "application/json";
pub const EVENT_STREAM_MIME_TYPE: &str = "text/event-stream";

/// Name and data of the frame that ends every SSE response.
pub const DONE_EVENT: &str = "done";
pub const DONE_DATA: &str = "[DONE]";

/// Frames buffered between the call and a slow SSE client.
const SSE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy)]
pub struct GatewaySettings {
    /// Budget for all replies of one call.
    pub call_timeout: Duration,
    pub sse_keep_alive: Duration,
}

/// How replies go back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Json,
    Stream,
}

/// One proxied POST, already split out of the HTTP request.
#[derive(Debug, Clone, Copy)]
pub struct ProxyRequest<'a> {
    pub container_id: &'a str,
    pub server_name: &'a str,
    pub session_id: Option<&'a str>,
    pub accept: Option<&'a str>,
    pub body: &'a [u8],
}

pub struct ProxyGateway {
    manager: Arc<SessionManager>,
    settings: GatewaySettings,
}

impl ProxyGateway {
    #[must_use]
    pub fn new(manager: Arc<SessionManager>, settings: GatewaySettings) -> Self {
        Self { manager, settings }
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub async fn handle(&self, request: ProxyRequest<'_>) -> Response {
        let payload = match Payload::parse(request.body) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!(error = ?e, "rejecting malformed JSON-RPC payload");
                return (StatusCode::BAD_REQUEST, Json(e.to_message())).into_response();
            }
        };

        let Some(delivery) = negotiate(request.accept) else {
            return (
                StatusCode::NOT_ACCEPTABLE,
                "Not Acceptable: Client must accept application/json or text/event-stream",
            )
                .into_response();
        };

        let (session, call) = match self
            .open_call(&request, &payload, delivery == Delivery::Stream)
            .await
        {
            Ok(opened) => opened,
            Err(response) => return response,
        };

        let response = if call.is_complete() {
            // Only notifications or client responses: nothing to wait for.
            StatusCode::ACCEPTED.into_response()
        } else {
            match delivery {
                Delivery::Json => self.collect_json(call, payload.is_batch()).await,
                Delivery::Stream => self.stream_sse(call),
            }
        };
        with_session_id(response, session.id())
    }

    /// Resolve the session and submit the payload to it.
    ///
    /// A reused session whose subprocess died before the write is treated like an unknown
    /// id: it is expired and the payload goes to a fresh session instead.
    async fn open_call(
        &self,
        request: &ProxyRequest<'_>,
        payload: &Payload,
        streaming: bool,
    ) -> Result<(Arc<Session>, Call), Response> {
        let mut session_id = request.session_id;
        loop {
            let (session, created) = self
                .manager
                .get_or_create(request.container_id, request.server_name, session_id)
                .await
                .map_err(|e| {
                    tracing::warn!(error = %e, "failed to resolve session");
                    error_response(&e, payload)
                })?;
            tracing::Span::current().record("session_id", session.id());
            if created && session_id.is_some() {
                tracing::debug!("client session id replaced");
            }

            match session.submit(payload, streaming).await {
                Ok(call) => return Ok((session, call)),
                Err(e) if !created && e.is_fatal_for_session() => {
                    tracing::debug!(error = %e, "reused session closed before submit; retrying");
                    self.manager
                        .expire(session.key(), "subprocess closed")
                        .await;
                    session_id = None;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to forward payload");
                    if e.is_fatal_for_session() {
                        self.manager
                            .expire(session.key(), "subprocess unusable")
                            .await;
                    }
                    return Err(with_session_id(error_response(&e, payload), session.id()));
                }
            }
        }
    }

    /// Explicit session termination (`DELETE`).
    pub async fn terminate(
        &self,
        container_id: &str,
        server_name: &str,
        session_id: Option<&str>,
    ) -> Response {
        let Some(session_id) = session_id else {
            return (
                StatusCode::BAD_REQUEST,
                "Bad Request: Mcp-Session-Id header is required",
            )
                .into_response();
        };

        let key = SessionKey::new(container_id, server_name, session_id);
        if let Err(e) = self.manager.require(&key) {
            return (e.http_status(), e.to_string()).into_response();
        }
        self.manager.expire(&key, "terminated by client").await;
        StatusCode::NO_CONTENT.into_response()
    }

    async fn collect_json(&self, mut call: Call, batch: bool) -> Response {
        let deadline = tokio::time::Instant::now() + self.settings.call_timeout;
        let mut replies = Vec::with_capacity(call.outstanding_len());
        let mut status = StatusCode::OK;

        loop {
            match tokio::time::timeout_at(deadline, call.next()).await {
                Ok(Some(CallEvent::Message(message))) => replies.push(message),
                Ok(Some(CallEvent::Closed(reason))) => {
                    let err = ProxyError::BridgeClosed(reason);
                    status = err.http_status();
                    replies.extend(error_messages(&err, call.outstanding()));
                    self.manager
                        .expire(call.session().key(), "subprocess closed")
                        .await;
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    let err = ProxyError::Timeout(self.settings.call_timeout);
                    tracing::warn!(
                        outstanding = call.outstanding_len(),
                        "timed out waiting for subprocess replies"
                    );
                    status = err.http_status();
                    replies.extend(error_messages(&err, call.outstanding()));
                    break;
                }
            }
        }

        render_json(status, &replies, batch)
    }

    fn stream_sse(&self, call: Call) -> Response {
        let (tx, rx) = mpsc::channel(SSE_CHANNEL_CAPACITY);
        tokio::spawn(
            pump_sse(
                call,
                tx,
                self.manager.clone(),
                self.settings.call_timeout,
            )
            .instrument(tracing::Span::current()),
        );

        let mut resp = Sse::new(ReceiverStream::new(rx))
            .keep_alive(KeepAlive::new().interval(self.settings.sse_keep_alive))
            .into_response();
        resp.headers_mut().insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static(EVENT_STREAM_MIME_TYPE),
        );
        resp
    }
}

/// Forward call events into an SSE body until every reply is out or the client leaves.
async fn pump_sse(
    mut call: Call,
    tx: mpsc::Sender<Result<Event, Infallible>>,
    manager: Arc<SessionManager>,
    timeout: Duration,
) {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        let messages = tokio::select! {
            () = tx.closed() => {
                tracing::debug!(outstanding = call.outstanding_len(), "SSE client disconnected");
                return;
            }
            () = &mut deadline, if !call.is_complete() => {
                tracing::warn!(
                    outstanding = call.outstanding_len(),
                    "timed out waiting for subprocess replies"
                );
                let errors = error_messages(&ProxyError::Timeout(timeout), call.outstanding());
                send_all(&tx, &errors).await;
                break;
            }
            event = call.next() => match event {
                None => break,
                Some(CallEvent::Message(message)) => vec![message],
                Some(CallEvent::Closed(reason)) => {
                    manager.expire(call.session().key(), "subprocess closed").await;
                    error_messages(&ProxyError::BridgeClosed(reason), call.outstanding())
                }
            },
        };
        if !send_all(&tx, &messages).await {
            return;
        }
    }

    let _ = tx
        .send(Ok(Event::default().event(DONE_EVENT).data(DONE_DATA)))
        .await;
}

async fn send_all(
    tx: &mpsc::Sender<Result<Event, Infallible>>,
    messages: &[JsonRpcMessage],
) -> bool {
    for message in messages {
        let event = Event::default().data(message.to_value().to_string());
        if tx.send(Ok(event)).await.is_err() {
            return false;
        }
    }
    true
}

/// One error reply per id, or a single `id: null` error when there are none.
fn error_messages(err: &ProxyError, ids: Vec<RequestId>) -> Vec<JsonRpcMessage> {
    let code = err.jsonrpc_code();
    let message = err.to_string();
    if ids.is_empty() {
        return vec![JsonRpcMessage::error(None, code, message)];
    }
    ids.into_iter()
        .map(|id| JsonRpcMessage::error(Some(id), code, message.clone()))
        .collect()
}

fn error_response(err: &ProxyError, payload: &Payload) -> Response {
    let ids = match err {
        ProxyError::DuplicateRequestId(id) => vec![id.clone()],
        _ => payload.request_ids(),
    };
    render_json(err.http_status(), &error_messages(err, ids), payload.is_batch())
}

fn render_json(status: StatusCode, replies: &[JsonRpcMessage], batch: bool) -> Response {
    let body = match replies {
        [single] if !batch => single.to_value(),
        _ => Value::Array(replies.iter().map(JsonRpcMessage::to_value).collect()),
    };
    (status, Json(body)).into_response()
}

fn with_session_id(mut response: Response, session_id: &str) -> Response {
    match HeaderValue::from_str(session_id) {
        Ok(value) => {
            response.headers_mut().insert(HEADER_SESSION_ID, value);
        }
        Err(e) => tracing::error!(error = %e, session_id, "session id is not a valid header value"),
    }
    response
}

#[derive(Default)]
struct Preference {
    exact: Option<f32>,
    wildcard: Option<f32>,
}

impl Preference {
    fn raise(slot: &mut Option<f32>, q: f32) {
        *slot = Some(slot.map_or(q, |current| current.max(q)));
    }

    fn quality(&self) -> f32 {
        self.exact.or(self.wildcard).unwrap_or(0.0)
    }
}

/// Pick the delivery mode from an `Accept` header.
///
/// Missing header or `*/*` means JSON; a tie between JSON and SSE selects SSE; `None`
/// when neither is acceptable.
#[must_use]
pub fn negotiate(accept: Option<&str>) -> Option<Delivery> {
    let accept = accept.map(str::trim).unwrap_or_default();
    if accept.is_empty() {
        return Some(Delivery::Json);
    }

    let mut json = Preference::default();
    let mut sse = Preference::default();
    for range in accept.split(',') {
        let mut parts = range.split(';');
        let media = parts
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        let q = parts
            .filter_map(|param| {
                let (name, value) = param.split_once('=')?;
                if !name.trim().eq_ignore_ascii_case("q") {
                    return None;
                }
                value.trim().parse::<f32>().ok()
            })
            .next()
            .unwrap_or(1.0)
            .clamp(0.0, 1.0);

        match media.as_str() {
            JSON_MIME_TYPE => Preference::raise(&mut json.exact, q),
            EVENT_STREAM_MIME_TYPE => Preference::raise(&mut sse.exact, q),
            "application/*" | "*/*" => Preference::raise(&mut json.wildcard, q),
            "text/*" => Preference::raise(&mut sse.wildcard, q),
            _ => {}
        }
    }

    let (json_q, sse_q) = (json.quality(), sse.quality());
    if json_q <= 0.0 && sse_q <= 0.0 {
        None
    } else if sse_q >= json_q {
        Some(Delivery::Stream)
    } else {
        Some(Delivery::Json)
    }
}
