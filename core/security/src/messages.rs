//! Fixed, non-revealing messages for end users.
//!
//! These never include identifiers, paths or which check failed. The
//! technical detail stays in the sanitized audit log.

use crate::event::SecurityEventType;
use veilvault_common::ErrorKind;

/// User-facing message for a security event type.
pub fn secure_error_message(event_type: SecurityEventType) -> &'static str {
    match event_type {
        SecurityEventType::AuthenticationFailure => {
            "Authentication failed. Please verify your credentials and try again."
        }
        SecurityEventType::EncryptionFailure => {
            "Encryption operation failed. Your data remains secure. Please try again."
        }
        SecurityEventType::VaultCorruption => {
            "Vault integrity issue detected. Automatic recovery procedures have been initiated. Your data is being protected."
        }
        SecurityEventType::UnauthorizedAccess => {
            "Access denied. You don't have sufficient privileges for this operation."
        }
        SecurityEventType::PrivilegeEscalation => {
            "Security violation detected. This action requires elevated privileges."
        }
        SecurityEventType::RateLimitExceeded => {
            "Too many attempts detected. Please wait a few minutes before trying again for security reasons."
        }
        SecurityEventType::SuspiciousActivity => {
            "Suspicious activity detected. Additional security measures have been activated to protect your data."
        }
        SecurityEventType::SystemCompromise => {
            "System security event detected. Protective measures are in effect. Your data remains secure."
        }
    }
}

const GENERIC: &str = "An error occurred. The system has implemented protective measures. Please contact support if the issue persists.";

/// User-facing message for an error kind crossing the API boundary.
///
/// Unknown profiles and bad recovery keys share the authentication message
/// so lookups cannot be used as an oracle.
pub fn secure_message_for_kind(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Authentication | ErrorKind::NotFound => {
            secure_error_message(SecurityEventType::AuthenticationFailure)
        }
        ErrorKind::RateLimited => secure_error_message(SecurityEventType::RateLimitExceeded),
        ErrorKind::Crypto | ErrorKind::SelfTest => {
            secure_error_message(SecurityEventType::EncryptionFailure)
        }
        ErrorKind::Integrity => secure_error_message(SecurityEventType::VaultCorruption),
        ErrorKind::DataLoss => {
            "Some vault content could not be recovered. Intact content has been preserved."
        }
        ErrorKind::Privilege | ErrorKind::NotPermitted => {
            secure_error_message(SecurityEventType::UnauthorizedAccess)
        }
        ErrorKind::InvalidInput => "The request was invalid. Please check the provided values and try again.",
        ErrorKind::AlreadyExists => "An item with that name already exists.",
        ErrorKind::Vault | ErrorKind::Io | ErrorKind::Serialization => GENERIC,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_message_is_generic() {
        let msg = secure_error_message(SecurityEventType::RateLimitExceeded);
        assert!(msg.starts_with("Too many attempts"));
        assert_eq!(secure_message_for_kind(ErrorKind::RateLimited), msg);
    }

    #[test]
    fn test_not_found_indistinguishable_from_auth_failure() {
        assert_eq!(
            secure_message_for_kind(ErrorKind::NotFound),
            secure_message_for_kind(ErrorKind::Authentication)
        );
    }
}
