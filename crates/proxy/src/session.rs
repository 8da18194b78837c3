//! A session: one bridge, an id, activity tracking and request/reply correlation.

use crate::bridge::{Bridge, BridgeEvent, BridgeOptions};
use crate::error::{ProxyError, Result};
use crate::jsonrpc::{JsonRpcMessage, Payload, RequestId};
use crate::registry::ServerLaunchSpec;
use chrono::{DateTime, Utc};
use futures::StreamExt as _;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument as _;

/// Registry key of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub container_id: String,
    pub server_name: String,
    pub session_id: String,
}

impl SessionKey {
    #[must_use]
    pub fn new(
        container_id: impl Into<String>,
        server_name: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            container_id: container_id.into(),
            server_name: server_name.into(),
            session_id: session_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.container_id, self.server_name, self.session_id
        )
    }
}

/// Sent when a session's subprocess goes away on its own.
#[derive(Debug, Clone)]
pub struct SessionClosed {
    pub key: SessionKey,
    pub reason: String,
}

/// What a call receives from the session.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    Message(JsonRpcMessage),
    Closed(String),
}

/// Answered and abandoned ids remembered per session; older ones may be reused.
const RETIRED_ID_CAPACITY: usize = 1024;

/// Most recently retired request ids, oldest evicted first.
struct RetiredIds {
    order: VecDeque<RequestId>,
    ids: HashSet<RequestId>,
    capacity: usize,
}

impl RetiredIds {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    fn insert(&mut self, id: RequestId) {
        if self.capacity == 0 || !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.ids.remove(&oldest);
        }
    }

    fn contains(&self, id: &RequestId) -> bool {
        self.ids.contains(id)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.order.len()
    }
}

impl Default for RetiredIds {
    fn default() -> Self {
        Self::with_capacity(RETIRED_ID_CAPACITY)
    }
}

struct Waiter {
    call: u64,
    tx: mpsc::UnboundedSender<CallEvent>,
}

/// Pending-request correlation for one session.
#[derive(Default)]
struct CallTable {
    pending: HashMap<RequestId, Waiter>,
    /// Recently answered or abandoned ids; rejected if a client sends them again.
    retired: RetiredIds,
    /// Streaming calls that also receive server-initiated traffic.
    streams: HashMap<u64, mpsc::UnboundedSender<CallEvent>>,
    closed: Option<String>,
}

impl CallTable {
    fn route(&mut self, message: JsonRpcMessage) {
        if let Some(id) = message.response_id()
            && let Some(waiter) = self.pending.remove(id)
        {
            self.retired.insert(id.clone());
            let _ = waiter.tx.send(CallEvent::Message(message));
            return;
        }

        if self.streams.is_empty() {
            tracing::debug!(
                method = message.method().unwrap_or("<response>"),
                "no open stream for server message; dropping"
            );
            return;
        }
        self.streams
            .retain(|_, tx| tx.send(CallEvent::Message(message.clone())).is_ok());
    }

    /// Fail every waiter. Returns `false` if the table was already closed.
    fn close(&mut self, reason: &str) -> bool {
        if self.closed.is_some() {
            return false;
        }
        self.closed = Some(reason.to_string());

        let mut notified = HashSet::new();
        for (id, waiter) in self.pending.drain() {
            self.retired.insert(id);
            if notified.insert(waiter.call) {
                let _ = waiter.tx.send(CallEvent::Closed(reason.to_string()));
            }
        }
        for (call, tx) in self.streams.drain() {
            if notified.insert(call) {
                let _ = tx.send(CallEvent::Closed(reason.to_string()));
            }
        }
        true
    }

    /// Drop a finished or abandoned call's bookkeeping.
    fn release(&mut self, call: u64, ids: &[RequestId]) {
        for id in ids {
            if self.pending.get(id).is_some_and(|w| w.call == call) {
                self.pending.remove(id);
                self.retired.insert(id.clone());
            }
        }
        self.streams.remove(&call);
    }
}

/// Snapshot of a session for status output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub container_id: String,
    pub server_name: String,
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub idle_seconds: u64,
    pub in_flight: usize,
}

pub struct Session {
    key: SessionKey,
    bridge: Bridge,
    created_at: DateTime<Utc>,
    last_active: Mutex<Instant>,
    calls: Arc<Mutex<CallTable>>,
    next_call: AtomicU64,
    in_flight: AtomicUsize,
    dispatcher: JoinHandle<()>,
}

impl Session {
    /// Spawn the subprocess and start routing its output.
    ///
    /// `closed_tx` is told when the subprocess exits on its own.
    pub fn start(
        key: SessionKey,
        spec: &ServerLaunchSpec,
        options: &BridgeOptions,
        closed_tx: mpsc::UnboundedSender<SessionClosed>,
    ) -> Result<Arc<Self>> {
        let span = tracing::info_span!(
            "session",
            container_id = %key.container_id,
            server_name = %key.server_name,
            session_id = %key.session_id,
        );
        let bridge = Bridge::start(spec, options, &span)?;
        let events = bridge
            .recv_stream()
            .ok_or_else(|| ProxyError::BridgeClosed("bridge events already taken".to_string()))?;

        let calls = Arc::new(Mutex::new(CallTable::default()));
        let dispatcher = tokio::spawn(
            dispatch(events, calls.clone(), key.clone(), closed_tx).instrument(span),
        );

        Ok(Arc::new(Self {
            key,
            bridge,
            created_at: Utc::now(),
            last_active: Mutex::new(Instant::now()),
            calls,
            next_call: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            dispatcher,
        }))
    }

    #[must_use]
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.key.session_id
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.bridge.pid()
    }

    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }

    /// Calls that have been submitted and not yet finished or dropped.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.calls.lock().closed.is_some() || self.bridge.is_stopped()
    }

    #[must_use]
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.key.session_id.clone(),
            container_id: self.key.container_id.clone(),
            server_name: self.key.server_name.clone(),
            pid: self.pid(),
            created_at: self.created_at,
            idle_seconds: self.idle_for().as_secs(),
            in_flight: self.in_flight(),
        }
    }

    /// Register the payload's request ids and write it to the subprocess as one frame.
    ///
    /// With `streaming`, the call also receives server-initiated messages until it ends.
    pub async fn submit(self: &Arc<Self>, payload: &Payload, streaming: bool) -> Result<Call> {
        let call_id = self.next_call.fetch_add(1, Ordering::Relaxed);
        let ids = payload.request_ids();
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut calls = self.calls.lock();
            if let Some(reason) = &calls.closed {
                return Err(ProxyError::BridgeClosed(reason.clone()));
            }
            if let Some(dup) = ids
                .iter()
                .find(|id| calls.pending.contains_key(*id) || calls.retired.contains(id))
            {
                return Err(ProxyError::DuplicateRequestId(dup.clone()));
            }
            for id in &ids {
                calls.pending.insert(
                    id.clone(),
                    Waiter {
                        call: call_id,
                        tx: tx.clone(),
                    },
                );
            }
            if streaming {
                calls.streams.insert(call_id, tx);
            }
        }

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let guard = CallGuard {
            session: self.clone(),
            call: call_id,
            ids: ids.clone(),
        };
        self.touch();

        // On failure the guard releases the ids again.
        self.bridge.send(payload).await?;

        Ok(Call {
            rx,
            outstanding: ids.into_iter().collect(),
            closed: None,
            guard,
        })
    }

    /// Stop the subprocess and fail everything still waiting on it.
    pub async fn stop(&self, reason: &str) {
        let _ = self.calls.lock().close(reason);
        self.bridge.stop().await;
        self.dispatcher.abort();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch(
    mut events: tokio_stream::wrappers::ReceiverStream<BridgeEvent>,
    calls: Arc<Mutex<CallTable>>,
    key: SessionKey,
    closed_tx: mpsc::UnboundedSender<SessionClosed>,
) {
    let reason = loop {
        match events.next().await {
            Some(BridgeEvent::Message(message)) => calls.lock().route(message),
            Some(BridgeEvent::Closed(reason)) => break reason,
            None => break "subprocess output stream ended".to_string(),
        }
    };

    // Already closed means the session was stopped on purpose.
    if !calls.lock().close(&reason) {
        return;
    }
    tracing::warn!(reason = %reason, "session subprocess closed");
    let _ = closed_tx.send(SessionClosed { key, reason });
}

struct CallGuard {
    session: Arc<Session>,
    call: u64,
    ids: Vec<RequestId>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.session.calls.lock().release(self.call, &self.ids);
        self.session.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.session.touch();
    }
}

/// One submitted payload waiting for its replies.
///
/// Dropping a call abandons it: its ids stop being routed and the session is free again.
pub struct Call {
    rx: mpsc::UnboundedReceiver<CallEvent>,
    outstanding: HashSet<RequestId>,
    closed: Option<String>,
    guard: CallGuard,
}

impl Call {
    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.guard.session
    }

    /// Number of request ids the payload carried that still await a reply.
    #[must_use]
    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    /// Ids still waiting, in no particular order.
    #[must_use]
    pub fn outstanding(&self) -> Vec<RequestId> {
        self.outstanding.iter().cloned().collect()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// Why the subprocess went away, once [`CallEvent::Closed`] was seen.
    #[must_use]
    pub fn closed_reason(&self) -> Option<&str> {
        self.closed.as_deref()
    }

    /// Next reply (or, for streaming calls, server message).
    ///
    /// Returns `None` once every expected reply arrived or after the session closed.
    pub async fn next(&mut self) -> Option<CallEvent> {
        if self.closed.is_some() || self.outstanding.is_empty() {
            return None;
        }
        let event = match self.rx.recv().await {
            Some(event) => event,
            None => CallEvent::Closed("session dropped".to_string()),
        };
        match &event {
            CallEvent::Message(message) => {
                if let Some(id) = message.response_id() {
                    self.outstanding.remove(id);
                }
                self.guard.session.touch();
            }
            CallEvent::Closed(reason) => self.closed = Some(reason.clone()),
        }
        Some(event)
    }
}
