//! Error types for the MCP engine.
//!
//! Every fallible operation in the crate resolves to [`Error`]. Errors that
//! cross the wire are mapped onto JSON-RPC error objects through
//! [`Error::to_jsonrpc`] and rebuilt on the receiving side with
//! [`Error::from_jsonrpc`].

use serde_json::Value;
use thiserror::Error;

use crate::mcp::protocol::{error_codes, JsonRpcError};

/// Result type alias for MCP engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error code taxonomy.
///
/// Standard JSON-RPC codes and MCP wire codes are negative; library-logical
/// codes are positive and are translated before being placed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // ===== JSON-RPC =====
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,

    // ===== MCP wire codes =====
    ConnectionClosed,
    Timeout,
    TransportError,
    UrlElicitationRequired,

    // ===== Library-logical codes =====
    ProtocolVersionMismatch,
    NotInitialized,
    AlreadyInitialized,
    ToolNotFound,
    ResourceNotFound,
    PromptNotFound,
    TaskNotFound,
    CapabilityNotSupported,

    /// A code outside every known range, kept verbatim.
    Other(i32),
}

impl ErrorCode {
    /// Numeric value of this code.
    pub fn as_i32(self) -> i32 {
        match self {
            Self::ParseError => error_codes::PARSE_ERROR,
            Self::InvalidRequest => error_codes::INVALID_REQUEST,
            Self::MethodNotFound => error_codes::METHOD_NOT_FOUND,
            Self::InvalidParams => error_codes::INVALID_PARAMS,
            Self::InternalError => error_codes::INTERNAL_ERROR,
            Self::ConnectionClosed => error_codes::CONNECTION_CLOSED,
            Self::Timeout => error_codes::REQUEST_TIMEOUT,
            Self::TransportError => error_codes::TRANSPORT_ERROR,
            Self::UrlElicitationRequired => error_codes::URL_ELICITATION_REQUIRED,
            Self::ProtocolVersionMismatch => 1,
            Self::NotInitialized => 2,
            Self::AlreadyInitialized => 3,
            Self::ToolNotFound => 4,
            Self::ResourceNotFound => 5,
            Self::PromptNotFound => 6,
            Self::TaskNotFound => 7,
            Self::CapabilityNotSupported => 8,
            Self::Other(code) => code,
        }
    }

    /// Decode a numeric code received from the wire.
    ///
    /// Unknown codes inside the MCP reserved range decode to `InternalError`.
    pub fn from_i32(code: i32) -> Self {
        match code {
            error_codes::PARSE_ERROR => Self::ParseError,
            error_codes::INVALID_REQUEST => Self::InvalidRequest,
            error_codes::METHOD_NOT_FOUND => Self::MethodNotFound,
            error_codes::INVALID_PARAMS => Self::InvalidParams,
            error_codes::INTERNAL_ERROR => Self::InternalError,
            error_codes::CONNECTION_CLOSED => Self::ConnectionClosed,
            error_codes::REQUEST_TIMEOUT => Self::Timeout,
            error_codes::TRANSPORT_ERROR => Self::TransportError,
            error_codes::URL_ELICITATION_REQUIRED => Self::UrlElicitationRequired,
            1 => Self::ProtocolVersionMismatch,
            2 => Self::NotInitialized,
            3 => Self::AlreadyInitialized,
            4 => Self::ToolNotFound,
            5 => Self::ResourceNotFound,
            6 => Self::PromptNotFound,
            7 => Self::TaskNotFound,
            8 => Self::CapabilityNotSupported,
            c if error_codes::MCP_RESERVED.contains(&c) => Self::InternalError,
            c => Self::Other(c),
        }
    }

    /// The code actually placed on the wire.
    ///
    /// Library-logical codes never leave the process as-is.
    pub fn wire_code(self) -> i32 {
        match self {
            Self::ToolNotFound
            | Self::ResourceNotFound
            | Self::PromptNotFound
            | Self::CapabilityNotSupported => error_codes::METHOD_NOT_FOUND,
            Self::ProtocolVersionMismatch
            | Self::NotInitialized
            | Self::AlreadyInitialized
            | Self::TaskNotFound => error_codes::INTERNAL_ERROR,
            other => other.as_i32(),
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_i32())
    }
}

/// Main error type for the MCP engine.
#[derive(Error, Debug)]
pub enum Error {
    // ===== JSON-RPC Errors =====
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// An error response received from the peer.
    #[error("Remote error {code}: {message}")]
    Remote {
        code: ErrorCode,
        message: String,
        data: Option<Value>,
    },

    // ===== MCP Wire Errors =====
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout: operation timed out after {millis} ms")]
    Timeout { millis: u64 },

    #[error("URL elicitation required: {0}")]
    UrlElicitationRequired(String),

    // ===== Session Errors =====
    #[error("Protocol version mismatch: server chose {server}, supported {supported:?}")]
    ProtocolVersionMismatch {
        server: String,
        supported: Vec<String>,
    },

    #[error("Session not initialized")]
    NotInitialized,

    #[error("Session already initialized")]
    AlreadyInitialized,

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Prompt not found: {0}")]
    PromptNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Capability not supported: {0}")]
    CapabilityNotSupported(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    // ===== I/O Errors =====
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // ===== HTTP Errors =====
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("HTTP server error: {0}")]
    HttpServer(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Classify this error into the code taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Parse(_) => ErrorCode::ParseError,
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::MethodNotFound(_) => ErrorCode::MethodNotFound,
            Self::InvalidParams(_) => ErrorCode::InvalidParams,
            Self::Remote { code, .. } => *code,
            Self::ConnectionClosed(_) | Self::Cancelled(_) => ErrorCode::ConnectionClosed,
            Self::Transport(_)
            | Self::Http(_)
            | Self::HttpStatus { .. }
            | Self::HttpServer(_)
            | Self::WebSocket(_)
            | Self::Io(_) => ErrorCode::TransportError,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::UrlElicitationRequired(_) => ErrorCode::UrlElicitationRequired,
            Self::ProtocolVersionMismatch { .. } => ErrorCode::ProtocolVersionMismatch,
            Self::NotInitialized => ErrorCode::NotInitialized,
            Self::AlreadyInitialized => ErrorCode::AlreadyInitialized,
            Self::ToolNotFound(_) => ErrorCode::ToolNotFound,
            Self::ResourceNotFound(_) => ErrorCode::ResourceNotFound,
            Self::PromptNotFound(_) => ErrorCode::PromptNotFound,
            Self::TaskNotFound(_) => ErrorCode::TaskNotFound,
            Self::CapabilityNotSupported(_) => ErrorCode::CapabilityNotSupported,
            Self::Json(_) => ErrorCode::ParseError,
            Self::Internal(_) | Self::Yaml(_) | Self::Config(_) => ErrorCode::InternalError,
        }
    }

    /// Build the JSON-RPC error object sent to the peer.
    pub fn to_jsonrpc(&self) -> JsonRpcError {
        let (message, data) = match self {
            Self::Remote { message, data, .. } => (message.clone(), data.clone()),
            other => (other.to_string(), None),
        };
        JsonRpcError {
            code: self.code().wire_code(),
            message,
            data,
        }
    }

    /// Rebuild an error from a JSON-RPC error object received from the peer.
    pub fn from_jsonrpc(error: JsonRpcError) -> Self {
        Self::Remote {
            code: ErrorCode::from_i32(error.code),
            message: error.message,
            data: error.data,
        }
    }

    /// Whether this error means the underlying connection is gone.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self.code(), ErrorCode::ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::ToolNotFound("echo".to_string());
        assert_eq!(err.to_string(), "Tool not found: echo");

        let timeout = Error::Timeout { millis: 1500 };
        assert_eq!(
            timeout.to_string(),
            "Timeout: operation timed out after 1500 ms"
        );

        let status = Error::HttpStatus {
            status: 409,
            body: "conflict".to_string(),
        };
        assert_eq!(status.to_string(), "HTTP status 409: conflict");
    }

    #[test]
    fn test_standard_codes() {
        assert_eq!(ErrorCode::ParseError.as_i32(), -32700);
        assert_eq!(ErrorCode::InvalidRequest.as_i32(), -32600);
        assert_eq!(ErrorCode::MethodNotFound.as_i32(), -32601);
        assert_eq!(ErrorCode::InvalidParams.as_i32(), -32602);
        assert_eq!(ErrorCode::InternalError.as_i32(), -32603);
    }

    #[test]
    fn test_library_codes_are_translated_on_wire() {
        assert_eq!(ErrorCode::ToolNotFound.wire_code(), -32601);
        assert_eq!(ErrorCode::PromptNotFound.wire_code(), -32601);
        assert_eq!(ErrorCode::CapabilityNotSupported.wire_code(), -32601);
        assert_eq!(ErrorCode::NotInitialized.wire_code(), -32603);
        assert_eq!(ErrorCode::TaskNotFound.wire_code(), -32603);
        assert_eq!(ErrorCode::InvalidParams.wire_code(), -32602);
        assert_eq!(ErrorCode::ConnectionClosed.wire_code(), -32000);
    }

    #[test]
    fn test_reserved_range_decodes_to_internal() {
        assert_eq!(ErrorCode::from_i32(-32050), ErrorCode::InternalError);
        assert_eq!(ErrorCode::from_i32(-32000), ErrorCode::ConnectionClosed);
        assert_eq!(ErrorCode::from_i32(-32042), ErrorCode::UrlElicitationRequired);
        assert_eq!(ErrorCode::from_i32(42_000), ErrorCode::Other(42_000));
    }

    #[test]
    fn test_jsonrpc_roundtrip() {
        let err = Error::ToolNotFound("missing".to_string());
        let wire = err.to_jsonrpc();
        assert_eq!(wire.code, -32601);
        assert!(wire.message.contains("missing"));

        let back = Error::from_jsonrpc(wire);
        assert_eq!(back.code(), ErrorCode::MethodNotFound);
    }

    #[test]
    fn test_remote_error_preserves_data() {
        let err = Error::from_jsonrpc(JsonRpcError {
            code: -32602,
            message: "bad".to_string(),
            data: Some(serde_json::json!({"field": "uri"})),
        });
        let wire = err.to_jsonrpc();
        assert_eq!(wire.code, -32602);
        assert_eq!(wire.message, "bad");
        assert_eq!(wire.data, Some(serde_json::json!({"field": "uri"})));
    }

    #[test]
    fn test_connection_closed_detection() {
        assert!(Error::ConnectionClosed("eof".to_string()).is_connection_closed());
        assert!(Error::Cancelled("user".to_string()).is_connection_closed());
        assert!(!Error::NotInitialized.is_connection_closed());
    }
}
