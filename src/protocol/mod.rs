//! JSON-RPC 2.0 messages spoken on the control channel and the metering feed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::models::{ParameterValue, ValueFormat};

pub mod framing;
pub mod values;

pub use framing::{encode_frame, FrameBuffer, TERMINATOR, TERMINATOR_STR};
pub use values::{decode_result, decode_updates, decode_value, ParameterUpdate};

pub const JSONRPC_VERSION: &str = "2.0";
pub const DEFAULT_COMMAND_ERROR: &str = "command error";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("frame is no JSON object")]
    NotAnObject,
    #[error("no terminator within {0} buffered bytes")]
    FrameTooLarge(usize),
    #[error("response carries no usable value: {0}")]
    UnexpectedResult(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Method {
    #[serde(rename = "set")]
    Set,
    #[serde(rename = "bmp")]
    Bump,
    #[serde(rename = "sub")]
    Subscribe,
    #[serde(rename = "unsub")]
    Unsubscribe,
    #[serde(rename = "get")]
    Get,
}

/// A request for the processor before it is given an id
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub method: Method,
    pub param: String,
    /// Value to write, used by `set` and `bmp`
    pub value: Option<ParameterValue>,
    /// Format the answer should be delivered in, used by `get`, `sub` and `unsub`
    pub format: Option<ValueFormat>,
}

impl Command {
    pub fn get(param: &str, format: ValueFormat) -> Self {
        Command { method: Method::Get, param: param.to_string(), value: None, format: Some(format) }
    }

    pub fn set(param: &str, value: ParameterValue) -> Self {
        Command { method: Method::Set, param: param.to_string(), value: Some(value), format: None }
    }

    pub fn bump(param: &str, delta: ParameterValue) -> Self {
        Command { method: Method::Bump, param: param.to_string(), value: Some(delta), format: None }
    }

    pub fn subscribe(param: &str, format: ValueFormat) -> Self {
        Command { method: Method::Subscribe, param: param.to_string(), value: None, format: Some(format) }
    }

    pub fn unsubscribe(param: &str, format: ValueFormat) -> Self {
        Command { method: Method::Unsubscribe, param: param.to_string(), value: None, format: Some(format) }
    }

    fn params(&self) -> Map<String, Value> {
        let mut params = Map::new();
        params.insert("param".to_string(), Value::from(self.param.clone()));
        if let Some(value) = &self.value {
            params.insert(value.format().key().to_string(), value.to_json());
        }
        if let Some(format) = &self.format {
            params.insert("fmt".to_string(), Value::from(format.key()));
        }
        return params;
    }
}

#[derive(Serialize)]
struct RequestEnvelope<'a> {
    jsonrpc: &'a str,
    method: Method,
    params: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
}

/// Serialize a command into the JSON text of one request, without terminator
pub fn encode_command(command: &Command, id: Option<u64>) -> Result<String, ProtocolError> {
    let envelope = RequestEnvelope {
        jsonrpc: JSONRPC_VERSION,
        method: command.method,
        params: command.params(),
        id,
    };
    serde_json::to_string(&envelope).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
}

/// What an inbound message turned out to be
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Answer to one of our requests
    Response { id: u64, outcome: Result<Value, String> },
    /// Unsolicited state change pushed by the processor
    Update(Vec<ParameterUpdate>),
    /// Valid JSON we have no use for
    Other,
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

pub fn parse_message(text: &str) -> Result<Inbound, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    if !value.is_object() {
        return Err(ProtocolError::NotAnObject);
    }
    let raw: RawMessage = serde_json::from_value(value).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

    if raw.method.as_deref() == Some("update") {
        let updates = raw.params.as_ref().map(decode_updates).unwrap_or_default();
        return Ok(Inbound::Update(updates));
    }

    if let Some(id) = raw.id.as_ref().and_then(|v| v.as_u64()) {
        let outcome = match raw.error {
            Some(err) if !err.is_null() => Err(error_message(&err)),
            _ => Ok(raw.result.unwrap_or(Value::Null)),
        };
        return Ok(Inbound::Response { id, outcome });
    }

    return Ok(Inbound::Other);
}

fn error_message(err: &Value) -> String {
    match err {
        Value::String(s) if !s.is_empty() => s.clone(),
        Value::Object(obj) => obj
            .get("message")
            .and_then(|m| m.as_str())
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_COMMAND_ERROR)
            .to_string(),
        _ => DEFAULT_COMMAND_ERROR.to_string(),
    }
}
