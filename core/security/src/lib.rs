//! Security events, rate limiting, backups and vault recovery.
//!
//! Everything that decides whether an attempt may proceed, and everything
//! that writes to the audit trail, lives here. Message sanitization runs
//! before any event is stored so secrets never reach the log.

pub mod backup;
pub mod config;
pub mod event;
pub mod event_log;
pub mod messages;
pub mod monitor;
pub mod rate_limit;
pub mod recovery;
pub mod sanitize;

pub use backup::ScopedBackup;
pub use config::{RateLimitConfig, SecurityConfig};
pub use event::{EventFilter, EventStatistics, SecurityEvent, SecurityEventType, Severity};
pub use event_log::EventLog;
pub use messages::{secure_error_message, secure_message_for_kind};
pub use monitor::{NewEvent, SecurityMonitor};
pub use rate_limit::{RateLimitOutcome, RateLimitState, RateLimiter};
pub use recovery::{FileVerifier, RecoveryReport};
pub use sanitize::sanitize;
