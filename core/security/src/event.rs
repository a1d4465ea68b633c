//! Security event records.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use veilvault_common::ProfileId;

/// Kind of security-relevant occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    AuthenticationFailure,
    EncryptionFailure,
    VaultCorruption,
    UnauthorizedAccess,
    PrivilegeEscalation,
    RateLimitExceeded,
    SuspiciousActivity,
    SystemCompromise,
}

impl fmt::Display for SecurityEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SecurityEventType::AuthenticationFailure => "authentication_failure",
            SecurityEventType::EncryptionFailure => "encryption_failure",
            SecurityEventType::VaultCorruption => "vault_corruption",
            SecurityEventType::UnauthorizedAccess => "unauthorized_access",
            SecurityEventType::PrivilegeEscalation => "privilege_escalation",
            SecurityEventType::RateLimitExceeded => "rate_limit_exceeded",
            SecurityEventType::SuspiciousActivity => "suspicious_activity",
            SecurityEventType::SystemCompromise => "system_compromise",
        };
        f.write_str(name)
    }
}

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Immutable audit record.
///
/// `description` and `details` and every metadata value have been passed
/// through the sanitizer before the record is constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub event_type: SecurityEventType,
    pub severity: Severity,
    pub profile_id: Option<ProfileId>,
    pub description: String,
    pub details: String,
    pub timestamp: DateTime<Utc>,
    pub source_component: String,
    pub metadata: BTreeMap<String, String>,
}

/// Selection criteria for audit queries. Empty fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub profile_id: Option<ProfileId>,
    pub event_type: Option<SecurityEventType>,
    pub min_severity: Option<Severity>,
    pub since: Option<DateTime<Utc>>,
}

impl EventFilter {
    pub fn for_profile(profile_id: ProfileId) -> Self {
        Self {
            profile_id: Some(profile_id),
            ..Self::default()
        }
    }

    pub fn matches(&self, event: &SecurityEvent) -> bool {
        if let Some(profile_id) = &self.profile_id {
            if event.profile_id.as_ref() != Some(profile_id) {
                return false;
            }
        }
        if let Some(event_type) = self.event_type {
            if event.event_type != event_type {
                return false;
            }
        }
        if let Some(min) = self.min_severity {
            if event.severity < min {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        true
    }
}

/// Aggregate counts over recorded events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStatistics {
    pub total: usize,
    pub by_type: BTreeMap<SecurityEventType, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
}

impl EventStatistics {
    pub(crate) fn add(&mut self, event: &SecurityEvent) {
        self.total += 1;
        *self.by_type.entry(event.event_type).or_default() += 1;
        *self.by_severity.entry(event.severity).or_default() += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(profile: &str, event_type: SecurityEventType, severity: Severity) -> SecurityEvent {
        SecurityEvent {
            id: Uuid::new_v4(),
            event_type,
            severity,
            profile_id: Some(ProfileId::new(profile).unwrap()),
            description: String::new(),
            details: String::new(),
            timestamp: Utc::now(),
            source_component: "test".to_string(),
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_filter_by_profile_and_severity() {
        let e = event("ops", SecurityEventType::AuthenticationFailure, Severity::Warning);

        assert!(EventFilter::default().matches(&e));
        assert!(EventFilter::for_profile(ProfileId::new("ops").unwrap()).matches(&e));
        assert!(!EventFilter::for_profile(ProfileId::new("dev").unwrap()).matches(&e));

        let strict = EventFilter {
            min_severity: Some(Severity::Error),
            ..EventFilter::default()
        };
        assert!(!strict.matches(&e));
    }

    #[test]
    fn test_statistics() {
        let mut stats = EventStatistics::default();
        stats.add(&event("a", SecurityEventType::AuthenticationFailure, Severity::Warning));
        stats.add(&event("a", SecurityEventType::AuthenticationFailure, Severity::Error));
        stats.add(&event("b", SecurityEventType::VaultCorruption, Severity::Critical));

        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_type[&SecurityEventType::AuthenticationFailure], 2);
        assert_eq!(stats.by_severity[&Severity::Critical], 1);
    }

    #[test]
    fn test_event_type_serializes_snake_case() {
        let json = serde_json::to_string(&SecurityEventType::RateLimitExceeded).unwrap();
        assert_eq!(json, "\"rate_limit_exceeded\"");
        assert_eq!(SecurityEventType::RateLimitExceeded.to_string(), "rate_limit_exceeded");
    }
}
