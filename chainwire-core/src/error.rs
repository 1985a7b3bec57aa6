use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadRequest,
    NotFound,
    PermissionDenied,
    Canceled,
    Internal,
    /// A deferred value was used in a way its settled nature does not allow
    Conflict,
    /// Raised by the invoked function itself rather than by the engine
    Remote,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::NotFound => "not_found",
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::Canceled => "canceled",
            ErrorCode::Internal => "internal",
            ErrorCode::Conflict => "conflict",
            ErrorCode::Remote => "remote",
        };
        write!(f, "{}", s)
    }
}

/// Error shape that travels in `RpcFunctionResult.error` and `RpcEvent.error`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        RpcError {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(code: ErrorCode, message: impl Into<String>, data: Value) -> Self {
        RpcError {
            code,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermissionDenied, message)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Canceled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, message)
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Remote, message)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::bad_request(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = RpcError::new(ErrorCode::BadRequest, "Invalid input");
        assert_eq!(err.code, ErrorCode::BadRequest);
        assert_eq!(err.message, "Invalid input");
        assert_eq!(err.data, None);
    }

    #[test]
    fn test_convenience_constructors() {
        assert_eq!(RpcError::not_found("x").code, ErrorCode::NotFound);
        assert_eq!(RpcError::permission_denied("x").code, ErrorCode::PermissionDenied);
        assert_eq!(RpcError::canceled("x").code, ErrorCode::Canceled);
        assert_eq!(RpcError::internal("x").code, ErrorCode::Internal);
        assert_eq!(RpcError::conflict("x").code, ErrorCode::Conflict);
        assert_eq!(RpcError::remote("x").code, ErrorCode::Remote);
    }

    #[test]
    fn test_error_serialization_with_data() {
        let data = serde_json::json!({"path": ["math", "add"]});
        let err = RpcError::with_data(ErrorCode::NotFound, "Function does not exist", data);
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"code\":\"not_found\""));
        assert!(json.contains("\"data\""));
        let deserialized: RpcError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, deserialized);
    }

    #[test]
    fn test_missing_data_is_skipped() {
        let json = serde_json::to_string(&RpcError::remote("boom")).unwrap();
        assert_eq!(json, r#"{"code":"remote","message":"boom"}"#);
    }

    #[test]
    fn test_error_display() {
        let display = format!("{}", RpcError::internal("Something went wrong"));
        assert!(display.contains("Internal"));
        assert!(display.contains("Something went wrong"));
    }
}
