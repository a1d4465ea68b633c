//! Responses returned at the transport boundary.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use veilvault_common::{Error, ErrorKind, ProfileId};
use veilvault_profile::RotationReport;
use veilvault_security::secure_message_for_kind;

/// Result of one request.
///
/// Failures carry only the error kind and a fixed message; technical
/// detail stays in the logs. Successes always carry a payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Response {
    pub fn ok(payload: Value) -> Self {
        Self {
            success: true,
            error_kind: None,
            message: None,
            payload: Some(payload),
        }
    }

    pub fn failure(kind: ErrorKind) -> Self {
        Self {
            success: false,
            error_kind: Some(kind),
            message: Some(secure_message_for_kind(kind).to_string()),
            payload: None,
        }
    }

    pub fn from_error(err: &Error) -> Self {
        Self::failure(err.kind())
    }

    /// Deserialize the payload into `T`.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        self.payload
            .clone()
            .and_then(|p| serde_json::from_value(p).ok())
    }
}

/// Payload of `create_profile`. The recovery key is shown exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileCreated {
    pub profile_id: ProfileId,
    pub recovery_key: String,
}

/// Payload of `change_profile_password`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordChanged {
    pub recovery_key: String,
    pub rotation: RotationReport,
}

/// Payload of `export_audit_log`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditExported {
    pub path: PathBuf,
    pub events: usize,
}

/// Payload of `recover_master_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterKeyRecovered {
    pub profile_id: ProfileId,
    pub master_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_has_no_detail() {
        let err = Error::Authentication("Master key mismatch for /home/alice".to_string());
        let response = Response::from_error(&err);
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"success\":false"));
        assert!(json.contains("\"errorKind\":\"authentication\""));
        assert!(!json.contains("alice"));
        assert!(!json.contains("payload"));
    }

    #[test]
    fn test_ok_round_trip() {
        let response = Response::ok(serde_json::json!({"count": 2}));
        let back: Response = serde_json::from_str(&serde_json::to_string(&response).unwrap()).unwrap();
        assert_eq!(back, response);
        assert!(back.error_kind.is_none());
    }
}
