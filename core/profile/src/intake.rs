//! Secrets captured by the keystroke listener.
//!
//! The listener reports text it believes to be a master key, prefixed with
//! `T` (temporary unlock) or `P` (permanent unlock), or unprefixed for the
//! default temporary unlock. The engine strips the prefix, picks the
//! profile, and unlocks all of its folders.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::manager::{ProfileManager, UnlockMode, UnlockSummary};
use veilvault_common::{Error, Passphrase, ProfileId, Result};

/// Rate-limit identifier for candidates tried against every profile.
pub const INTAKE_IDENTIFIER: &str = "intake";
const COMPONENT: &str = "secret_intake";

/// How the captured text was introduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntakeMode {
    /// Text starts with `T`.
    Temporary,
    /// Text starts with `P`.
    Permanent,
    /// No prefix.
    DefaultTemporary,
}

impl IntakeMode {
    fn prefix(self) -> Option<char> {
        match self {
            IntakeMode::Temporary => Some('T'),
            IntakeMode::Permanent => Some('P'),
            IntakeMode::DefaultTemporary => None,
        }
    }

    pub fn unlock_mode(self) -> UnlockMode {
        match self {
            IntakeMode::Permanent => UnlockMode::Permanent,
            IntakeMode::Temporary | IntakeMode::DefaultTemporary => UnlockMode::Temporary,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeOutcome {
    pub profile_id: ProfileId,
    pub mode: UnlockMode,
    pub summary: UnlockSummary,
}

impl ProfileManager {
    /// Authenticate captured text and unlock the matching profile's folders.
    ///
    /// Without `profile_id` the active profile is used; with no active
    /// profile the candidate is checked against every profile's verifier
    /// under a shared rate limit.
    ///
    /// # Errors
    /// - `InvalidInput` if an explicit mode's prefix is missing
    /// - `Authentication` / `RateLimited` as for authentication
    ///
    /// # Security
    /// `raw_text` and the stripped candidate are zeroized when this returns.
    pub fn on_candidate_secret_detected(
        &self,
        profile_id: Option<&ProfileId>,
        raw_text: Passphrase,
        mode: IntakeMode,
    ) -> Result<IntakeOutcome> {
        let candidate = strip_prefix(&raw_text, mode)?;
        drop(raw_text);
        if candidate.is_empty() {
            return Err(Error::InvalidInput("Captured text is empty".to_string()));
        }

        let target = match profile_id.cloned().or_else(|| self.active_profile()) {
            Some(id) => id,
            None => self.match_any_profile(&candidate)?,
        };

        let unlock_mode = mode.unlock_mode();
        let summary = self.unlock_folders(&target, &candidate, unlock_mode)?;
        info!(
            profile_id = %target,
            mode = ?unlock_mode,
            unlocked = summary.unlocked.len(),
            "Captured secret accepted"
        );
        Ok(IntakeOutcome {
            profile_id: target,
            mode: unlock_mode,
            summary,
        })
    }

    fn match_any_profile(&self, candidate: &Passphrase) -> Result<ProfileId> {
        if !self.security.check_default_rate_limit(INTAKE_IDENTIFIER) {
            return Err(Error::RateLimited("Captured secrets blocked".to_string()));
        }
        for record in self.store.list()? {
            if self
                .engine
                .verify_credential(candidate, &record.master_key_hash)?
            {
                self.security.reset_rate_limit(INTAKE_IDENTIFIER);
                return Ok(record.id);
            }
        }
        self.security.handle_failed_attempt(
            INTAKE_IDENTIFIER,
            None,
            COMPONENT,
            "Captured secret matched no profile",
        );
        Err(Error::Authentication(
            "Captured secret matched no profile".to_string(),
        ))
    }
}

fn strip_prefix(raw: &Passphrase, mode: IntakeMode) -> Result<Passphrase> {
    let Some(prefix) = mode.prefix() else {
        return Ok(raw.clone());
    };
    let mut chars = raw.expose().chars();
    match chars.next() {
        Some(c) if c.eq_ignore_ascii_case(&prefix) => Ok(Passphrase::new(chars.as_str())),
        _ => Err(Error::InvalidInput(
            "Captured text lacks its mode prefix".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::testing::Fixture;
    use std::fs;
    use veilvault_security::{EventFilter, SecurityEventType};

    #[test]
    fn test_strip_prefix() {
        let raw = Passphrase::new("TM1-key");
        assert_eq!(
            strip_prefix(&raw, IntakeMode::Temporary).unwrap(),
            Passphrase::new("M1-key")
        );
        assert_eq!(
            strip_prefix(&Passphrase::new("pM1-key"), IntakeMode::Permanent).unwrap(),
            Passphrase::new("M1-key")
        );
        assert_eq!(
            strip_prefix(&raw, IntakeMode::DefaultTemporary).unwrap(),
            raw
        );
        assert!(strip_prefix(&raw, IntakeMode::Permanent).is_err());
    }

    #[test]
    fn test_intake_without_profile_finds_owner() {
        let fx = Fixture::new();
        fx.manager.create_profile("Dev", &Passphrase::new("D1-key")).unwrap();
        let ops = fx
            .manager
            .create_profile("Ops", &Passphrase::new("M1-key"))
            .unwrap()
            .profile_id;
        let folder = fx.folder("docs");
        fx.manager
            .lock_folder(&ops, &Passphrase::new("M1-key"), &folder)
            .unwrap();

        let outcome = fx
            .manager
            .on_candidate_secret_detected(None, Passphrase::new("TM1-key"), IntakeMode::Temporary)
            .unwrap();
        assert_eq!(outcome.profile_id, ops);
        assert_eq!(outcome.mode, UnlockMode::Temporary);
        assert_eq!(outcome.summary.unlocked.len(), 1);
        assert_eq!(fs::read(folder.join("a.txt")).unwrap(), b"alpha");
    }

    #[test]
    fn test_intake_uses_active_profile() {
        let fx = Fixture::new();
        let ops = fx
            .manager
            .create_profile("Ops", &Passphrase::new("M1-key"))
            .unwrap()
            .profile_id;
        let folder = fx.folder("docs");
        fx.manager
            .lock_folder(&ops, &Passphrase::new("M1-key"), &folder)
            .unwrap();
        fx.manager.set_active_profile(&ops).unwrap();

        let outcome = fx
            .manager
            .on_candidate_secret_detected(None, Passphrase::new("PM1-key"), IntakeMode::Permanent)
            .unwrap();
        assert_eq!(outcome.mode, UnlockMode::Permanent);
        assert!(folder.join("sub/b.txt").exists());
        assert!(fx.manager.list_folders(&ops).unwrap().is_empty());
    }

    #[test]
    fn test_intake_unmatched_is_logged() {
        let fx = Fixture::new();
        fx.manager
            .create_profile("Ops", &Passphrase::new("M1-key"))
            .unwrap();
        let err = fx
            .manager
            .on_candidate_secret_detected(
                None,
                Passphrase::new("something typed"),
                IntakeMode::DefaultTemporary,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));

        let failures = fx.manager.security().security_events(&EventFilter {
            event_type: Some(SecurityEventType::AuthenticationFailure),
            ..EventFilter::default()
        });
        assert_eq!(failures.len(), 1);
        assert!(!failures[0].details.contains("something typed"));
    }
}
