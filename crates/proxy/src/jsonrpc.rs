//! JSON-RPC 2.0 messages as they cross the proxy.
//!
//! The proxy is a pass-through: it only needs to know which frames are requests (and
//! their ids), which are notifications, and which are responses. Params, results and
//! error payloads are carried as opaque JSON values.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Number, Value, json};
use std::collections::HashSet;
use std::fmt;

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INTERNAL_ERROR: i64 = -32603;

/// Request id: a number or a string.
///
/// Numbers are kept as written (`1`, `1.0` and `u64` values are distinct ids) so a reply
/// echoing the id verbatim always matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(Number),
    String(String),
}

impl RequestId {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => Some(Self::Number(n.clone())),
            Value::String(s) => Some(Self::String(s.clone())),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Number(n) => Value::Number(n.clone()),
            Self::String(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "\"{s}\""),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Result(Value),
    Error(ErrorObject),
}

/// One JSON-RPC frame.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// `id` is `None` only for errors answering something whose id could not be read.
    Response {
        id: Option<RequestId>,
        outcome: Outcome,
    },
}

/// Why a JSON value is not a valid JSON-RPC frame.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidMessage {
    /// Id of the offending frame, when it could still be read.
    pub id: Option<RequestId>,
    pub reason: String,
}

impl InvalidMessage {
    fn new(id: Option<RequestId>, reason: impl Into<String>) -> Self {
        Self {
            id,
            reason: reason.into(),
        }
    }
}

impl JsonRpcMessage {
    #[must_use]
    pub fn request(
        id: impl Into<RequestId>,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Self {
        Self::Request {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    #[must_use]
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification {
            method: method.into(),
            params,
        }
    }

    #[must_use]
    pub fn result(id: RequestId, result: Value) -> Self {
        Self::Response {
            id: Some(id),
            outcome: Outcome::Result(result),
        }
    }

    #[must_use]
    pub fn error(id: Option<RequestId>, code: i64, message: impl Into<String>) -> Self {
        Self::Response {
            id,
            outcome: Outcome::Error(ErrorObject::new(code, message)),
        }
    }

    /// Id of a request; `None` for notifications and responses.
    #[must_use]
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Self::Request { id, .. } => Some(id),
            _ => None,
        }
    }

    /// Id of a response; `None` for requests, notifications and id-less errors.
    #[must_use]
    pub fn response_id(&self) -> Option<&RequestId> {
        match self {
            Self::Response { id, .. } => id.as_ref(),
            _ => None,
        }
    }

    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => Some(method),
            Self::Response { .. } => None,
        }
    }

    /// Builds a frame from a decoded JSON value.
    ///
    /// A missing `jsonrpc` member is tolerated; a present one must be `"2.0"`.
    pub fn from_value(value: &Value) -> Result<Self, InvalidMessage> {
        let Some(obj) = value.as_object() else {
            return Err(InvalidMessage::new(None, "message must be a JSON object"));
        };

        let raw_id = obj.get("id").filter(|v| !v.is_null());
        let id = match raw_id {
            Some(v) => Some(RequestId::from_value(v).ok_or_else(|| {
                InvalidMessage::new(None, "id must be a string or an integer")
            })?),
            None => None,
        };

        match obj.get("jsonrpc") {
            None => {}
            Some(Value::String(v)) if v == JSONRPC_VERSION => {}
            Some(_) => {
                return Err(InvalidMessage::new(id, "jsonrpc must be \"2.0\""));
            }
        }

        if let Some(method) = obj.get("method") {
            let Some(method) = method.as_str() else {
                return Err(InvalidMessage::new(id, "method must be a string"));
            };
            let params = match obj.get("params") {
                None | Some(Value::Null) => None,
                Some(p @ (Value::Object(_) | Value::Array(_))) => Some(p.clone()),
                Some(_) => {
                    return Err(InvalidMessage::new(id, "params must be an object or an array"));
                }
            };
            return Ok(match id {
                Some(id) => Self::Request {
                    id,
                    method: method.to_string(),
                    params,
                },
                None => Self::Notification {
                    method: method.to_string(),
                    params,
                },
            });
        }

        let outcome = match (obj.get("result"), obj.get("error")) {
            (Some(result), None) => Outcome::Result(result.clone()),
            (None, Some(error)) => {
                let error = ErrorObject::deserialize(error).map_err(|e| {
                    InvalidMessage::new(id.clone(), format!("malformed error object: {e}"))
                })?;
                Outcome::Error(error)
            }
            (Some(_), Some(_)) => {
                return Err(InvalidMessage::new(id, "response carries both result and error"));
            }
            (None, None) => {
                return Err(InvalidMessage::new(
                    id,
                    "message is neither a request, a notification nor a response",
                ));
            }
        };
        Ok(Self::Response { id, outcome })
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), Value::String(JSONRPC_VERSION.into()));
        match self {
            Self::Request { id, method, params } => {
                obj.insert("method".into(), Value::String(method.clone()));
                if let Some(params) = params {
                    obj.insert("params".into(), params.clone());
                }
                obj.insert("id".into(), id.to_value());
            }
            Self::Notification { method, params } => {
                obj.insert("method".into(), Value::String(method.clone()));
                if let Some(params) = params {
                    obj.insert("params".into(), params.clone());
                }
            }
            Self::Response { id, outcome } => {
                match outcome {
                    Outcome::Result(result) => {
                        obj.insert("result".into(), result.clone());
                    }
                    Outcome::Error(error) => {
                        obj.insert("error".into(), json!(error));
                    }
                }
                obj.insert("id".into(), id.as_ref().map_or(Value::Null, RequestId::to_value));
            }
        }
        Value::Object(obj)
    }
}

impl Serialize for JsonRpcMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

/// A client POST body: one frame or a non-empty batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Single(JsonRpcMessage),
    Batch(Vec<JsonRpcMessage>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PayloadError {
    /// The body is not JSON.
    Parse(String),
    /// The body is JSON but not an acceptable JSON-RPC payload.
    Invalid(InvalidMessage),
}

impl PayloadError {
    /// JSON-RPC error frame (with `id: null` when no id is known) describing this error.
    #[must_use]
    pub fn to_message(&self) -> JsonRpcMessage {
        match self {
            Self::Parse(detail) => {
                JsonRpcMessage::error(None, PARSE_ERROR, format!("Parse error: {detail}"))
            }
            Self::Invalid(invalid) => JsonRpcMessage::error(
                invalid.id.clone(),
                INVALID_REQUEST,
                format!("Invalid Request: {}", invalid.reason),
            ),
        }
    }
}

impl Payload {
    pub fn parse(body: &[u8]) -> Result<Self, PayloadError> {
        let value: Value =
            serde_json::from_slice(body).map_err(|e| PayloadError::Parse(e.to_string()))?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self, PayloadError> {
        let Value::Array(items) = value else {
            return JsonRpcMessage::from_value(value)
                .map(Self::Single)
                .map_err(PayloadError::Invalid);
        };

        if items.is_empty() {
            return Err(PayloadError::Invalid(InvalidMessage::new(None, "empty batch")));
        }

        let mut seen = HashSet::new();
        let mut messages = Vec::with_capacity(items.len());
        for item in items {
            let message = JsonRpcMessage::from_value(item).map_err(PayloadError::Invalid)?;
            if let Some(id) = message.request_id()
                && !seen.insert(id.clone())
            {
                return Err(PayloadError::Invalid(InvalidMessage::new(
                    Some(id.clone()),
                    format!("duplicate request id {id} in batch"),
                )));
            }
            messages.push(message);
        }
        Ok(Self::Batch(messages))
    }

    #[must_use]
    pub fn is_batch(&self) -> bool {
        matches!(self, Self::Batch(_))
    }

    #[must_use]
    pub fn messages(&self) -> &[JsonRpcMessage] {
        match self {
            Self::Single(message) => std::slice::from_ref(message),
            Self::Batch(messages) => messages,
        }
    }

    /// Ids that expect a correlated reply, in input order.
    #[must_use]
    pub fn request_ids(&self) -> Vec<RequestId> {
        self.messages()
            .iter()
            .filter_map(JsonRpcMessage::request_id)
            .cloned()
            .collect()
    }

    /// One line of JSON, without the trailing newline.
    #[must_use]
    pub fn to_line(&self) -> String {
        match self {
            Self::Single(message) => message.to_value().to_string(),
            Self::Batch(messages) => {
                Value::Array(messages.iter().map(JsonRpcMessage::to_value).collect()).to_string()
            }
        }
    }
}

/// Decodes one stdout line from a subprocess.
///
/// Unlike client payloads, invalid members of an array are skipped individually so that a
/// single bad element does not swallow the replies next to it.
pub fn decode_line(line: &[u8]) -> Result<Vec<JsonRpcMessage>, String> {
    let value: Value = serde_json::from_slice(line).map_err(|e| e.to_string())?;
    match value {
        Value::Array(items) => Ok(items
            .iter()
            .filter_map(|item| match JsonRpcMessage::from_value(item) {
                Ok(message) => Some(message),
                Err(invalid) => {
                    tracing::warn!(
                        reason = %invalid.reason,
                        "dropping invalid element of subprocess batch"
                    );
                    None
                }
            })
            .collect()),
        other => JsonRpcMessage::from_value(&other)
            .map(|m| vec![m])
            .map_err(|invalid| invalid.reason),
    }
}
