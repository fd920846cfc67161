//! JSON-RPC message model and LSP parameter shapes.
//!
//! [`Message`] is the unit the codec encodes and decodes. Classification
//! follows the JSON-RPC 2.0 shapes: `{id, method}` is a request, `{method}`
//! a notification, `{id, result | error}` a response.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::error::LspError;
use crate::types::{DiagnosticEntry, DiagnosticSeverity};

pub(crate) const JSONRPC_VERSION: &str = "2.0";

pub(crate) const METHOD_NOT_FOUND: i64 = -32601;

pub(crate) const PUBLISH_DIAGNOSTICS: &str = "textDocument/publishDiagnostics";
pub(crate) const LOG_MESSAGE: &str = "window/logMessage";
pub(crate) const SHOW_MESSAGE: &str = "window/showMessage";

/// A JSON-RPC id. Ids issued by this client are always positive integers;
/// servers may use strings for their own requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Integer(i64),
    String(String),
}

impl RequestId {
    /// The id as a client-issued sequence number, if it can be one.
    #[must_use]
    pub fn as_sequence(&self) -> Option<u64> {
        match self {
            Self::Integer(n) => u64::try_from(*n).ok().filter(|n| *n > 0),
            Self::String(_) => None,
        }
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        Self::Integer(i64::try_from(id).unwrap_or(i64::MAX))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

/// Server-reported error payload of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    /// `Ok` carries `result` (possibly JSON null), `Err` carries `error`.
    pub outcome: Result<Value, ResponseError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// Why a JSON value is not a JSON-RPC message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidMessage {
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("method is not a string")]
    InvalidMethod,
    #[error("response carries both result and error")]
    ResultAndError,
    #[error("invalid error payload: {0}")]
    InvalidError(String),
    #[error("neither a request, response nor notification")]
    Unclassifiable,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl Message {
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request(Request {
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification(Notification::new(method, params))
    }

    pub fn response(id: RequestId, outcome: Result<Value, ResponseError>) -> Self {
        Self::Response(Response { id, outcome })
    }

    /// Reply to a server-initiated request this client does not implement.
    pub(crate) fn method_not_found(id: RequestId, method: &str) -> Self {
        Self::response(
            id,
            Err(ResponseError {
                code: METHOD_NOT_FOUND,
                message: format!("Method not found: {method}"),
                data: None,
            }),
        )
    }

    /// Method name for requests and notifications.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Notification(n) => Some(&n.method),
            Self::Response(_) => None,
        }
    }

    /// Serialize into the JSON-RPC object shape. Absent params are omitted, not null.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
        match self {
            Self::Request(req) => {
                obj.insert("id".into(), id_to_value(&req.id));
                obj.insert("method".into(), Value::from(req.method.as_str()));
                if let Some(params) = &req.params {
                    obj.insert("params".into(), params.clone());
                }
            }
            Self::Notification(notif) => {
                obj.insert("method".into(), Value::from(notif.method.as_str()));
                if let Some(params) = &notif.params {
                    obj.insert("params".into(), params.clone());
                }
            }
            Self::Response(resp) => {
                obj.insert("id".into(), id_to_value(&resp.id));
                match &resp.outcome {
                    Ok(result) => {
                        obj.insert("result".into(), result.clone());
                    }
                    Err(error) => {
                        let error = serde_json::to_value(error).unwrap_or(Value::Null);
                        obj.insert("error".into(), error);
                    }
                }
            }
        }
        Value::Object(obj)
    }

    /// Classify a decoded JSON value.
    pub fn from_value(value: Value) -> Result<Self, InvalidMessage> {
        let Value::Object(mut obj) = value else {
            return Err(InvalidMessage::NotAnObject);
        };

        let id = match obj.remove("id") {
            None => None,
            Some(raw) => Some(
                serde_json::from_value::<RequestId>(raw.clone())
                    .map_err(|_| InvalidMessage::InvalidId(raw.to_string()))?,
            ),
        };
        let method = match obj.remove("method") {
            None => None,
            Some(Value::String(m)) => Some(m),
            Some(_) => return Err(InvalidMessage::InvalidMethod),
        };
        let params = obj.remove("params");
        let result = obj.remove("result");
        let error = obj.remove("error");

        match (id, method) {
            (Some(id), Some(method)) => Ok(Self::Request(Request { id, method, params })),
            (None, Some(method)) => Ok(Self::Notification(Notification { method, params })),
            (Some(id), None) => {
                let outcome = match (result, error) {
                    (Some(_), Some(_)) => return Err(InvalidMessage::ResultAndError),
                    (Some(result), None) => Ok(result),
                    (None, Some(error)) => Err(serde_json::from_value::<ResponseError>(error)
                        .map_err(|e| InvalidMessage::InvalidError(e.to_string()))?),
                    (None, None) => return Err(InvalidMessage::Unclassifiable),
                };
                Ok(Self::Response(Response { id, outcome }))
            }
            (None, None) => Err(InvalidMessage::Unclassifiable),
        }
    }
}

fn id_to_value(id: &RequestId) -> Value {
    match id {
        RequestId::Integer(n) => Value::from(*n),
        RequestId::String(s) => Value::from(s.as_str()),
    }
}

pub(crate) fn initialize_params(root_uri: &str, workspace_name: &str) -> Value {
    serde_json::json!({
        "processId": process::id(),
        "rootUri": root_uri,
        "capabilities": {
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": true
                },
                "publishDiagnostics": {
                    "relatedInformation": true,
                    "tagSupport": { "valueSet": [1, 2] },
                    "codeDescriptionSupport": true
                },
                "hover": {
                    "contentFormat": ["markdown", "plaintext"]
                }
            },
            "workspace": {
                "executeCommand": { "dynamicRegistration": false }
            }
        },
        "workspaceFolders": [{
            "uri": root_uri,
            "name": workspace_name
        }]
    })
}

pub(crate) fn did_open_params(uri: &str, language_id: &str, version: i32, text: &str) -> Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub(crate) fn did_change_params(uri: &str, version: i32, text: &str) -> Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "version": version
        },
        "contentChanges": [{
            "text": text
        }]
    })
}

pub(crate) fn did_save_params(uri: &str) -> Value {
    serde_json::json!({ "textDocument": { "uri": uri } })
}

pub(crate) fn did_close_params(uri: &str) -> Value {
    serde_json::json!({ "textDocument": { "uri": uri } })
}

pub(crate) fn text_document_position_params(uri: &str, line: u32, character: u32) -> Value {
    serde_json::json!({
        "textDocument": { "uri": uri },
        "position": { "line": line, "character": character }
    })
}

pub(crate) fn execute_command_params(command: &str, arguments: Vec<Value>) -> Value {
    serde_json::json!({
        "command": command,
        "arguments": arguments
    })
}

#[derive(Debug, Deserialize)]
pub(crate) struct PublishDiagnosticsParams {
    pub uri: String,
    #[serde(default)]
    pub diagnostics: Vec<LspDiagnostic>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspDiagnostic {
    pub range: LspRange,
    pub severity: Option<u64>,
    pub source: Option<String>,
    pub code: Option<Value>,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspRange {
    pub start: LspPosition,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspPosition {
    pub line: u32,
    pub character: u32,
}

impl LspDiagnostic {
    pub fn to_entry(&self) -> DiagnosticEntry {
        let severity = self
            .severity
            .and_then(DiagnosticSeverity::from_lsp)
            .unwrap_or(DiagnosticSeverity::Information);
        let mut entry = DiagnosticEntry::new(
            severity,
            self.range.start.line,
            self.range.start.character,
            self.message.clone(),
        );
        if let Some(source) = &self.source {
            entry = entry.with_source(source.clone());
        }
        match &self.code {
            Some(Value::String(code)) => entry = entry.with_code(code.clone()),
            Some(Value::Number(code)) => entry = entry.with_code(code.to_string()),
            _ => {}
        }
        entry
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct LogMessageParams {
    #[serde(rename = "type")]
    pub kind: u8,
    pub message: String,
}

pub fn path_to_file_uri(path: &Path) -> Result<Url, LspError> {
    Url::from_file_path(path).map_err(|()| LspError::InvalidUri {
        path: path.to_path_buf(),
    })
}

pub fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    Url::parse(uri)
        .ok()
        .and_then(|u| u.to_file_path().ok())
}
