//! JSON-RPC envelope codec.
//!
//! Classifies a parsed JSON value into one of the four envelope kinds and
//! converts between [`Message`] and `serde_json::Value`. Framing (newlines,
//! SSE events, WebSocket frames) is the transport's job; the line helpers
//! here are shared by the NDJSON-based transports.

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::mcp::protocol::{
    JsonRpcError, JsonRpcErrorResponse, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    RequestId, JSONRPC_VERSION,
};

/// Any JSON-RPC envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Error(JsonRpcErrorResponse),
    Notification(JsonRpcNotification),
}

/// The kind of an envelope, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
    Error,
    Notification,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Request(_) => MessageKind::Request,
            Self::Response(_) => MessageKind::Response,
            Self::Error(_) => MessageKind::Error,
            Self::Notification(_) => MessageKind::Notification,
        }
    }

    /// The envelope id, if it carries one.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(req) => Some(&req.id),
            Self::Response(res) => Some(&res.id),
            Self::Error(err) => err.id.as_ref(),
            Self::Notification(_) => None,
        }
    }

    /// The method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(req) => Some(&req.method),
            Self::Notification(notif) => Some(&notif.method),
            _ => None,
        }
    }

    pub fn request(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request(JsonRpcRequest::new(id, method, params))
    }

    pub fn response(id: RequestId, result: Value) -> Self {
        Self::Response(JsonRpcResponse::new(id, result))
    }

    pub fn error(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self::Error(JsonRpcErrorResponse::new(id, error))
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification(JsonRpcNotification::new(method, params))
    }
}

/// Classify a parsed value by the members it carries.
///
/// `method`+`id` is a request, `id`+`result` a response, `id`+`error` an
/// error response, `method` alone a notification. An error response whose id
/// could not be determined may carry `"id": null` or omit it.
pub fn classify(value: &Value) -> Result<MessageKind> {
    let obj = value
        .as_object()
        .ok_or_else(|| Error::InvalidRequest("message is not a JSON object".to_string()))?;

    match obj.get("jsonrpc").and_then(Value::as_str) {
        Some(JSONRPC_VERSION) => {}
        Some(other) => {
            return Err(Error::InvalidRequest(format!(
                "unsupported jsonrpc version: {}",
                other
            )))
        }
        None => return Err(Error::InvalidRequest("missing jsonrpc version".to_string())),
    }

    let has_id = obj.get("id").map(|v| !v.is_null()).unwrap_or(false);
    let has_method = obj.contains_key("method");

    if has_method && has_id {
        Ok(MessageKind::Request)
    } else if has_method {
        Ok(MessageKind::Notification)
    } else if obj.contains_key("error") {
        Ok(MessageKind::Error)
    } else if has_id && obj.contains_key("result") {
        Ok(MessageKind::Response)
    } else {
        Err(Error::Parse(
            "message is neither request, response nor notification".to_string(),
        ))
    }
}

/// Decode a parsed value into an envelope.
pub fn decode(value: Value) -> Result<Message> {
    if value.is_array() {
        return Err(Error::InvalidRequest(
            "batch messages are not supported".to_string(),
        ));
    }

    let kind = classify(&value)?;
    let invalid = |e: serde_json::Error| Error::InvalidRequest(e.to_string());

    let message = match kind {
        MessageKind::Request => Message::Request(serde_json::from_value(value).map_err(invalid)?),
        MessageKind::Response => {
            Message::Response(serde_json::from_value(value).map_err(invalid)?)
        }
        MessageKind::Error => Message::Error(decode_error_response(value)?),
        MessageKind::Notification => {
            Message::Notification(serde_json::from_value(value).map_err(invalid)?)
        }
    };

    Ok(message)
}

fn decode_error_response(value: Value) -> Result<JsonRpcErrorResponse> {
    let mut obj = match value {
        Value::Object(obj) => obj,
        _ => return Err(Error::InvalidRequest("message is not a JSON object".to_string())),
    };

    // A null or malformed id still yields an addressable-less error response.
    let id = obj
        .remove("id")
        .and_then(|v| serde_json::from_value::<RequestId>(v).ok());
    let error: JsonRpcError = obj
        .remove("error")
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| Error::InvalidRequest(e.to_string()))?
        .ok_or_else(|| Error::InvalidRequest("missing error object".to_string()))?;

    Ok(JsonRpcErrorResponse::new(id, error))
}

/// Encode an envelope into a JSON value.
pub fn encode(message: &Message) -> Value {
    let mut obj = Map::new();
    obj.insert("jsonrpc".to_string(), Value::from(JSONRPC_VERSION));

    match message {
        Message::Request(req) => {
            obj.insert("id".to_string(), id_value(&req.id));
            obj.insert("method".to_string(), Value::from(req.method.clone()));
            if let Some(params) = &req.params {
                obj.insert("params".to_string(), params.clone());
            }
        }
        Message::Response(res) => {
            obj.insert("id".to_string(), id_value(&res.id));
            obj.insert("result".to_string(), res.result.clone());
        }
        Message::Error(err) => {
            obj.insert(
                "id".to_string(),
                err.id.as_ref().map(id_value).unwrap_or(Value::Null),
            );
            let mut error = Map::new();
            error.insert("code".to_string(), Value::from(err.error.code));
            error.insert("message".to_string(), Value::from(err.error.message.clone()));
            if let Some(data) = &err.error.data {
                error.insert("data".to_string(), data.clone());
            }
            obj.insert("error".to_string(), Value::Object(error));
        }
        Message::Notification(notif) => {
            obj.insert("method".to_string(), Value::from(notif.method.clone()));
            if let Some(params) = &notif.params {
                obj.insert("params".to_string(), params.clone());
            }
        }
    }

    Value::Object(obj)
}

fn id_value(id: &RequestId) -> Value {
    match id {
        RequestId::String(s) => Value::from(s.clone()),
        RequestId::Number(n) => Value::from(*n),
    }
}

/// Parse one line of NDJSON (or any single-message text frame).
pub fn decode_line(line: &str) -> Result<Message> {
    let value: Value =
        serde_json::from_str(line.trim()).map_err(|e| Error::Parse(e.to_string()))?;
    decode(value)
}

/// Serialize an envelope into a single line without the trailing newline.
pub fn encode_line(message: &Message) -> String {
    encode(message).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_variants() {
        assert_eq!(
            classify(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})).unwrap(),
            MessageKind::Request
        );
        assert_eq!(
            classify(&json!({"jsonrpc": "2.0", "id": "a", "result": {}})).unwrap(),
            MessageKind::Response
        );
        assert_eq!(
            classify(&json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -1, "message": "x"}}))
                .unwrap(),
            MessageKind::Error
        );
        assert_eq!(
            classify(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"})).unwrap(),
            MessageKind::Notification
        );
    }

    #[test]
    fn test_classify_rejects_unknown_shapes() {
        let err = classify(&json!({"jsonrpc": "2.0", "id": 1})).unwrap_err();
        assert!(matches!(err, Error::Parse(_)));

        let err = classify(&json!({"jsonrpc": "1.0", "id": 1, "method": "x"})).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        let err = classify(&json!("just a string")).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn test_roundtrip_all_variants() {
        let messages = vec![
            Message::request("c-1".into(), "tools/call", Some(json!({"name": "echo"}))),
            Message::request(RequestId::Number(7), "ping", None),
            Message::response("c-1".into(), json!({"tools": []})),
            Message::error(
                Some(RequestId::Number(3)),
                JsonRpcError {
                    code: -32601,
                    message: "Method not found".to_string(),
                    data: Some(json!({"method": "nope"})),
                },
            ),
            Message::error(
                None,
                JsonRpcError {
                    code: -32700,
                    message: "Parse error".to_string(),
                    data: None,
                },
            ),
            Message::notification("notifications/initialized", None),
            Message::notification(
                "notifications/progress",
                Some(json!({"progressToken": 1, "progress": 5})),
            ),
        ];

        for message in messages {
            let decoded = decode(encode(&message)).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_error_with_null_id() {
        let msg = decode(json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": {"code": -32700, "message": "Parse error"}
        }))
        .unwrap();

        match msg {
            Message::Error(err) => {
                assert!(err.id.is_none());
                assert_eq!(err.error.code, -32700);
            }
            other => panic!("Expected error response, got {:?}", other),
        }
    }

    #[test]
    fn test_batch_rejected() {
        let err = decode(json!([{"jsonrpc": "2.0", "method": "ping", "id": 1}])).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn test_decode_line() {
        let msg = decode_line("{\"jsonrpc\":\"2.0\",\"id\":\"x\",\"method\":\"ping\"}\n").unwrap();
        assert_eq!(msg.method(), Some("ping"));
        assert_eq!(msg.id(), Some(&RequestId::String("x".to_string())));

        let err = decode_line("{not json").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn test_encode_line_has_no_newline() {
        let line = encode_line(&Message::notification("notifications/initialized", None));
        assert!(!line.contains('\n'));
        assert!(line.contains("\"method\":\"notifications/initialized\""));
    }

    #[test]
    fn test_invalid_request_params_shape() {
        let err = decode(json!({"jsonrpc": "2.0", "id": 1, "method": 5})).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }
}
