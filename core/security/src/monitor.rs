//! The security monitor: rate limiting, audit events and recovery in one
//! place. Every authentication failure in VeilVault goes through
//! [`SecurityMonitor::handle_authentication_failure`].

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::Duration;
use dashmap::DashMap;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SecurityConfig;
use crate::event::{EventFilter, EventStatistics, SecurityEvent, SecurityEventType, Severity};
use crate::event_log::EventLog;
use crate::messages;
use crate::rate_limit::{RateLimitOutcome, RateLimitState, RateLimiter};
use crate::recovery::{self, FileVerifier, RecoveryReport};
use crate::sanitize::{sanitize, sanitize_metadata};
use veilvault_common::{Clock, ProfileId, Result};

const SYSTEM_KEY: &str = "_system";
const COMPONENT: &str = "security_monitor";

/// Builder for a new security event.
#[derive(Debug, Clone)]
pub struct NewEvent {
    event_type: SecurityEventType,
    severity: Severity,
    source_component: String,
    profile_id: Option<ProfileId>,
    description: String,
    details: String,
    metadata: BTreeMap<String, String>,
}

impl NewEvent {
    pub fn new(event_type: SecurityEventType, severity: Severity, source: impl Into<String>) -> Self {
        Self {
            event_type,
            severity,
            source_component: source.into(),
            profile_id: None,
            description: String::new(),
            details: String::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn profile(mut self, profile_id: Option<&ProfileId>) -> Self {
        self.profile_id = profile_id.cloned();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Technical detail. Sanitized before it is stored.
    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }
}

/// Shared security state for all profiles.
pub struct SecurityMonitor {
    config: SecurityConfig,
    clock: Arc<dyn Clock>,
    limiter: RateLimiter,
    history: DashMap<String, VecDeque<SecurityEvent>>,
    log: EventLog,
}

impl SecurityMonitor {
    /// Create a monitor persisting events to `log_path`.
    ///
    /// # Errors
    /// - `InvalidInput` for an invalid configuration
    /// - I/O errors creating the log directory
    pub fn new(config: SecurityConfig, log_path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let log = EventLog::open(log_path, config.event_flush_threshold, config.max_log_bytes)?;
        let limiter = RateLimiter::new(config.rate_limit.block_duration(), clock.clone());
        info!(log = %log_path.display(), "Security monitor started");
        Ok(Self {
            config,
            clock,
            limiter,
            history: DashMap::new(),
            log,
        })
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Record a security event.
    ///
    /// Description, details and metadata values are sanitized first.
    /// Critical events are written to disk immediately; the rest are
    /// checkpointed in batches. Persistence failures are logged and never
    /// fail the caller.
    pub fn log_security_event(&self, event: NewEvent) -> SecurityEvent {
        let record = SecurityEvent {
            id: Uuid::new_v4(),
            event_type: event.event_type,
            severity: event.severity,
            profile_id: event.profile_id,
            description: sanitize(&event.description),
            details: sanitize(&event.details),
            timestamp: self.clock.now(),
            source_component: event.source_component,
            metadata: sanitize_metadata(event.metadata),
        };

        match record.severity {
            Severity::Info => info!(event_type = %record.event_type, "{}", record.description),
            Severity::Warning => warn!(event_type = %record.event_type, "{}", record.description),
            Severity::Error | Severity::Critical => error!(
                event_type = %record.event_type,
                severity = ?record.severity,
                "{}",
                record.description
            ),
        }

        let key = record
            .profile_id
            .as_ref()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| SYSTEM_KEY.to_string());
        {
            let mut events = self.history.entry(key).or_default();
            events.push_back(record.clone());
            while events.len() > self.config.max_events_in_memory {
                events.pop_front();
            }
        }

        if let Err(e) = self.log.append(record.clone(), record.severity == Severity::Critical) {
            error!(error = %e, "Failed to persist security event");
        }
        record
    }

    /// Count an attempt for `identifier` against an explicit policy.
    ///
    /// Returns `true` if the attempt may proceed. Every outcome is logged;
    /// crossing the threshold and attempts while blocked are also recorded
    /// as `RateLimitExceeded` events.
    pub fn check_rate_limit(&self, identifier: &str, max_attempts: u32, window: Duration) -> bool {
        self.check_inner(identifier, None, max_attempts, window)
    }

    /// Count an authentication attempt for a profile under the configured
    /// policy.
    pub fn check_profile_rate_limit(&self, profile_id: &ProfileId) -> bool {
        let rl = &self.config.rate_limit;
        self.check_inner(profile_id.as_str(), Some(profile_id), rl.max_attempts, rl.window())
    }

    /// Count an attempt for a non-profile identifier under the configured
    /// policy.
    pub fn check_default_rate_limit(&self, identifier: &str) -> bool {
        let rl = &self.config.rate_limit;
        self.check_inner(identifier, None, rl.max_attempts, rl.window())
    }

    fn check_inner(
        &self,
        identifier: &str,
        profile_id: Option<&ProfileId>,
        max_attempts: u32,
        window: Duration,
    ) -> bool {
        match self.limiter.check(identifier, max_attempts, window) {
            RateLimitOutcome::Allowed { attempts, remaining } => {
                debug!(identifier, attempts, remaining, "Rate limit check passed");
                true
            }
            RateLimitOutcome::Exceeded { until } => {
                self.log_security_event(
                    NewEvent::new(SecurityEventType::RateLimitExceeded, Severity::Error, COMPONENT)
                        .profile(profile_id)
                        .description("Attempt limit exceeded; identifier blocked")
                        .meta("identifier", identifier)
                        .meta("max_attempts", max_attempts)
                        .meta("blocked_until", until.to_rfc3339()),
                );
                false
            }
            RateLimitOutcome::Blocked { until } => {
                self.log_security_event(
                    NewEvent::new(SecurityEventType::RateLimitExceeded, Severity::Warning, COMPONENT)
                        .profile(profile_id)
                        .description("Attempt rejected while blocked")
                        .meta("identifier", identifier)
                        .meta("blocked_until", until.to_rfc3339()),
                );
                false
            }
        }
    }

    /// Record an authentication failure for a profile.
    ///
    /// Severity escalates with the profile's current rate-limit state. The
    /// attempt itself was already counted by the rate-limit check that
    /// preceded verification.
    pub fn handle_authentication_failure(
        &self,
        profile_id: Option<&ProfileId>,
        source_component: &str,
        raw_detail: &str,
    ) -> SecurityEvent {
        let identifier = profile_id.map(|p| p.as_str()).unwrap_or(SYSTEM_KEY);
        self.handle_failed_attempt(identifier, profile_id, source_component, raw_detail)
    }

    /// Record an authentication failure counted under `identifier`, such
    /// as a recovery-key lookup that matched no profile.
    pub fn handle_failed_attempt(
        &self,
        identifier: &str,
        profile_id: Option<&ProfileId>,
        source_component: &str,
        raw_detail: &str,
    ) -> SecurityEvent {
        let max = self.config.rate_limit.max_attempts;
        let attempts = self
            .limiter
            .info(identifier)
            .map_or(0, |s| s.attempt_count);
        let blocked = self.limiter.is_blocked(identifier);

        let severity = if blocked {
            Severity::Critical
        } else if attempts + 1 >= max {
            Severity::Error
        } else {
            Severity::Warning
        };

        self.log_security_event(
            NewEvent::new(SecurityEventType::AuthenticationFailure, severity, source_component)
                .profile(profile_id)
                .description("Authentication failed")
                .details(raw_detail)
                .meta("identifier", identifier)
                .meta("attempts", attempts)
                .meta("blocked", blocked),
        )
    }

    /// Record a failed cryptographic operation.
    pub fn handle_encryption_error(
        &self,
        profile_id: Option<&ProfileId>,
        operation: &str,
        raw_detail: &str,
    ) -> SecurityEvent {
        self.log_security_event(
            NewEvent::new(SecurityEventType::EncryptionFailure, Severity::Error, operation)
                .profile(profile_id)
                .description(format!("Cryptographic operation failed: {}", operation))
                .details(raw_detail),
        )
    }

    /// Record vault corruption and run recovery with a caller-supplied
    /// per-file check.
    pub fn handle_vault_corruption(
        &self,
        profile_id: Option<&ProfileId>,
        vault_path: &Path,
        raw_detail: &str,
        verifier: &dyn FileVerifier,
    ) -> Result<RecoveryReport> {
        self.log_security_event(
            NewEvent::new(SecurityEventType::VaultCorruption, Severity::Critical, "vault_handler")
                .profile(profile_id)
                .description("Vault integrity check failed; starting recovery")
                .details(raw_detail),
        );
        self.run_recovery(profile_id, vault_path, verifier)
    }

    /// Recover a vault using the default readable-and-non-empty check.
    /// That check cannot compare folder versions, so the snapshot is never
    /// used and damaged files are quarantined.
    pub fn attempt_vault_recovery(
        &self,
        profile_id: Option<&ProfileId>,
        vault_path: &Path,
    ) -> Result<RecoveryReport> {
        self.run_recovery(profile_id, vault_path, &recovery::readable_and_non_empty)
    }

    fn run_recovery(
        &self,
        profile_id: Option<&ProfileId>,
        vault_path: &Path,
        verifier: &dyn FileVerifier,
    ) -> Result<RecoveryReport> {
        let report = match recovery::recover_vault(vault_path, verifier) {
            Ok(report) => report,
            Err(e) => {
                self.log_security_event(
                    NewEvent::new(SecurityEventType::VaultCorruption, Severity::Critical, COMPONENT)
                        .profile(profile_id)
                        .description("Vault recovery could not run")
                        .details(e.to_string()),
                );
                return Err(e);
            }
        };

        let severity = if report.success {
            Severity::Info
        } else {
            Severity::Critical
        };
        self.log_security_event(
            NewEvent::new(SecurityEventType::VaultCorruption, severity, COMPONENT)
                .profile(profile_id)
                .description(if report.success {
                    "Vault recovery completed"
                } else if report.is_partial() {
                    "Vault recovery partially succeeded"
                } else {
                    "Vault recovery failed"
                })
                .meta("snapshot_folders", report.snapshot_folders.len())
                .meta("recovered", report.recovered_files.len())
                .meta("failed", report.failed_files.len()),
        );
        Ok(report)
    }

    /// Fixed user-facing message for an event type.
    pub fn get_secure_error_message(&self, event_type: SecurityEventType) -> &'static str {
        messages::secure_error_message(event_type)
    }

    pub fn reset_rate_limit(&self, identifier: &str) {
        self.limiter.reset(identifier);
        debug!(identifier, "Rate limit reset");
    }

    pub fn rate_limit_info(&self, identifier: &str) -> Option<RateLimitState> {
        self.limiter.info(identifier)
    }

    pub fn is_blocked(&self, identifier: &str) -> bool {
        self.limiter.is_blocked(identifier)
    }

    /// In-memory events matching `filter`, oldest first.
    pub fn security_events(&self, filter: &EventFilter) -> Vec<SecurityEvent> {
        let mut events: Vec<SecurityEvent> = match &filter.profile_id {
            Some(profile_id) => self
                .history
                .get(profile_id.as_str())
                .map(|e| e.iter().filter(|ev| filter.matches(ev)).cloned().collect())
                .unwrap_or_default(),
            None => self
                .history
                .iter()
                .flat_map(|entry| {
                    entry
                        .value()
                        .iter()
                        .filter(|ev| filter.matches(ev))
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .collect(),
        };
        events.sort_by_key(|e| e.timestamp);
        events
    }

    pub fn event_statistics(&self, filter: &EventFilter) -> EventStatistics {
        let mut stats = EventStatistics::default();
        for event in self.security_events(filter) {
            stats.add(&event);
        }
        stats
    }

    /// Write matching events to `dest` as a JSON array.
    pub fn export_audit_log(&self, dest: &Path, filter: &EventFilter) -> Result<usize> {
        self.flush()?;
        let events = self.security_events(filter);
        let json = serde_json::to_string_pretty(&events)?;
        fs::write(dest, json)?;
        info!(count = events.len(), "Audit log exported");
        Ok(events.len())
    }

    /// Checkpoint buffered events to disk.
    pub fn flush(&self) -> Result<()> {
        self.log.flush()
    }

    pub fn event_log(&self) -> &EventLog {
        &self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use veilvault_common::ManualClock;

    fn monitor(dir: &TempDir) -> (SecurityMonitor, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let monitor = SecurityMonitor::new(
            SecurityConfig::default(),
            &dir.path().join("logs/security_events.jsonl"),
            clock.clone(),
        )
        .unwrap();
        (monitor, clock)
    }

    #[test]
    fn test_logged_details_are_sanitized_on_disk() {
        let dir = TempDir::new().unwrap();
        let (monitor, _) = monitor(&dir);
        let profile = ProfileId::new("ops").unwrap();

        monitor.log_security_event(
            NewEvent::new(SecurityEventType::EncryptionFailure, Severity::Error, "test")
                .profile(Some(&profile))
                .details("failed on /home/alice/private/a.txt password=secret123"),
        );
        monitor.flush().unwrap();

        let on_disk = fs::read_to_string(monitor.event_log().path()).unwrap();
        assert!(!on_disk.contains("/home/alice"));
        assert!(!on_disk.contains("secret123"));
        assert!(on_disk.contains("[REDACTED]"));
    }

    #[test]
    fn test_rate_limit_outcomes_recorded() {
        let dir = TempDir::new().unwrap();
        let (monitor, _) = monitor(&dir);
        let profile = ProfileId::new("ops").unwrap();

        for _ in 0..5 {
            assert!(monitor.check_profile_rate_limit(&profile));
        }
        assert!(!monitor.check_profile_rate_limit(&profile));
        assert!(!monitor.check_profile_rate_limit(&profile));

        let filter = EventFilter {
            profile_id: Some(profile.clone()),
            event_type: Some(SecurityEventType::RateLimitExceeded),
            ..EventFilter::default()
        };
        let events = monitor.security_events(&filter);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].severity, Severity::Error);
        assert_eq!(events[1].severity, Severity::Warning);
    }

    #[test]
    fn test_explicit_policy() {
        let dir = TempDir::new().unwrap();
        let (monitor, clock) = monitor(&dir);

        assert!(monitor.check_rate_limit("recovery", 2, Duration::minutes(1)));
        assert!(monitor.check_rate_limit("recovery", 2, Duration::minutes(1)));
        assert!(!monitor.check_rate_limit("recovery", 2, Duration::minutes(1)));

        clock.advance(Duration::hours(2));
        assert!(monitor.check_rate_limit("recovery", 2, Duration::minutes(1)));
    }

    #[test]
    fn test_authentication_failure_severity_escalates() {
        let dir = TempDir::new().unwrap();
        let (monitor, _) = monitor(&dir);
        let profile = ProfileId::new("ops").unwrap();

        monitor.check_profile_rate_limit(&profile);
        let first = monitor.handle_authentication_failure(Some(&profile), "test", "bad key");
        assert_eq!(first.severity, Severity::Warning);

        for _ in 0..5 {
            monitor.check_profile_rate_limit(&profile);
        }
        let blocked = monitor.handle_authentication_failure(Some(&profile), "test", "bad key");
        assert_eq!(blocked.severity, Severity::Critical);
        assert_eq!(blocked.event_type, SecurityEventType::AuthenticationFailure);
    }

    #[test]
    fn test_reset_and_info() {
        let dir = TempDir::new().unwrap();
        let (monitor, _) = monitor(&dir);

        monitor.check_default_rate_limit("intake");
        assert_eq!(monitor.rate_limit_info("intake").unwrap().attempt_count, 1);
        monitor.reset_rate_limit("intake");
        assert!(monitor.rate_limit_info("intake").is_none());
    }

    #[test]
    fn test_critical_event_flushed_immediately() {
        let dir = TempDir::new().unwrap();
        let (monitor, _) = monitor(&dir);

        monitor.log_security_event(
            NewEvent::new(SecurityEventType::SystemCompromise, Severity::Critical, "test")
                .description("tamper"),
        );
        assert_eq!(monitor.event_log().read_all().unwrap().len(), 1);
    }

    #[test]
    fn test_statistics_and_export() {
        let dir = TempDir::new().unwrap();
        let (monitor, _) = monitor(&dir);
        let profile = ProfileId::new("ops").unwrap();

        monitor.handle_authentication_failure(Some(&profile), "test", "x");
        monitor.handle_encryption_error(Some(&profile), "encrypt_file", "y");
        monitor.handle_encryption_error(None, "self_test", "z");

        let stats = monitor.event_statistics(&EventFilter::for_profile(profile));
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_type[&SecurityEventType::EncryptionFailure], 1);

        let dest = dir.path().join("audit.json");
        let count = monitor.export_audit_log(&dest, &EventFilter::default()).unwrap();
        assert_eq!(count, 3);
        let exported: Vec<SecurityEvent> =
            serde_json::from_str(&fs::read_to_string(dest).unwrap()).unwrap();
        assert_eq!(exported.len(), 3);
    }

    #[test]
    fn test_vault_corruption_runs_recovery() {
        let dir = TempDir::new().unwrap();
        let (monitor, _) = monitor(&dir);
        let vault = dir.path().join("vault");
        fs::create_dir_all(vault.join("hidden/f")).unwrap();
        fs::write(vault.join("hidden/f/0.enc"), b"ok").unwrap();

        let report = monitor
            .handle_vault_corruption(None, &vault, "checksum mismatch", &|_: &Path| true)
            .unwrap();
        assert!(report.success);

        let events = monitor.security_events(&EventFilter {
            event_type: Some(SecurityEventType::VaultCorruption),
            ..EventFilter::default()
        });
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].severity, Severity::Critical);
        assert_eq!(events[1].severity, Severity::Info);
    }

    #[test]
    fn test_default_recovery_quarantines_empty_files() {
        let dir = TempDir::new().unwrap();
        let (monitor, _) = monitor(&dir);
        let vault = dir.path().join("vault");
        fs::create_dir_all(vault.join("hidden/f")).unwrap();
        fs::create_dir_all(vault.join("backup/vault_snapshot/hidden/f")).unwrap();
        fs::write(vault.join("hidden/f/0.enc"), b"ok").unwrap();
        fs::write(vault.join("hidden/f/1.enc"), b"").unwrap();
        fs::write(vault.join("backup/vault_snapshot/hidden/f/1.enc"), b"old").unwrap();

        let report = monitor.attempt_vault_recovery(None, &vault).unwrap();
        assert!(report.is_partial());
        assert!(report.snapshot_folders.is_empty());
        assert!(!vault.join("hidden/f/1.enc").exists());
        assert!(vault.join("hidden/f/0.enc").exists());
    }

    #[test]
    fn test_secure_message() {
        let dir = TempDir::new().unwrap();
        let (monitor, _) = monitor(&dir);
        assert_eq!(
            monitor.get_secure_error_message(SecurityEventType::AuthenticationFailure),
            "Authentication failed. Please verify your credentials and try again."
        );
    }
}
