// ABOUTME: Uniform status/message payloads for environment results
// ABOUTME: Converts Result values into `{"status": "success", ...}` or `{"status": "error", ...}`

use crate::error::{EnvironmentError, Result};
use serde::Serialize;

/// Structured result handed to orchestrating callers.
///
/// Callers branch on `status` instead of handling errors; the success
/// payload's fields are flattened next to it. Shell outcomes already carry
/// their own `status` and are serialized as-is.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response<T> {
    Success(T),
    Error { kind: String, message: String },
}

impl<T> Response<T> {
    pub fn error(err: &EnvironmentError) -> Self {
        Self::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn into_success(self) -> Option<T> {
        match self {
            Self::Success(value) => Some(value),
            Self::Error { .. } => None,
        }
    }
}

impl<T: Serialize> Response<T> {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            serde_json::json!({
                "status": "error",
                "kind": "json",
                "message": e.to_string(),
            })
        })
    }
}

impl<T> From<Result<T>> for Response<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(err) => Self::error(&err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WriteFileResult;
    use serde_json::json;

    #[test]
    fn test_success_flattens_payload() {
        let response: Response<WriteFileResult> = Ok(WriteFileResult {
            path: "/w/a.txt".to_string(),
            size: 5,
        })
        .into();
        assert!(response.is_success());
        assert_eq!(
            response.to_value(),
            json!({"status": "success", "path": "/w/a.txt", "size": 5})
        );
    }

    #[test]
    fn test_error_carries_kind_and_message() {
        let response: Response<WriteFileResult> =
            Err(EnvironmentError::PermissionDenied("../escape".to_string())).into();
        assert!(!response.is_success());
        let value = response.to_value();
        assert_eq!(value["status"], json!("error"));
        assert_eq!(value["kind"], json!("permission_denied"));
        assert!(value["message"].as_str().unwrap().contains("../escape"));
    }
}
