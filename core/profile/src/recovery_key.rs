//! Recovery key value type.
//!
//! A recovery key is 24 characters drawn from `A-Z0-9`, shown to the user
//! once as six dash-separated groups of four. Parsing is lenient about case,
//! whitespace and dashes; everything downstream sees only the canonical
//! grouped form.

use std::fmt;

use rand::rngs::OsRng;
use rand::Rng;
use zeroize::{Zeroize, ZeroizeOnDrop};

use veilvault_common::{Error, Passphrase, Result};

const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const KEY_CHARS: usize = 24;
const GROUP: usize = 4;

/// A validated recovery key in canonical `XXXX-XXXX-XXXX-XXXX-XXXX-XXXX` form.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct RecoveryKey(String);

impl RecoveryKey {
    /// Generate a fresh key from the OS random source.
    pub fn generate() -> Self {
        let mut raw = String::with_capacity(KEY_CHARS);
        for _ in 0..KEY_CHARS {
            raw.push(CHARSET[OsRng.gen_range(0..CHARSET.len())] as char);
        }
        let key = Self(group(&raw));
        raw.zeroize();
        key
    }

    /// Parse user input.
    ///
    /// Accepts lowercase letters and ignores whitespace and dashes.
    ///
    /// # Errors
    /// - `InvalidInput` unless exactly 24 characters of `A-Z0-9` remain
    ///
    /// # Security
    /// The error never echoes the input.
    pub fn parse(input: &str) -> Result<Self> {
        let mut raw: String = input
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        let valid = raw.len() == KEY_CHARS && raw.bytes().all(|b| CHARSET.contains(&b));
        if !valid {
            raw.zeroize();
            return Err(Error::InvalidInput("Malformed recovery key".to_string()));
        }
        let key = Self(group(&raw));
        raw.zeroize();
        Ok(key)
    }

    /// The canonical grouped text.
    ///
    /// # Security
    /// Show to the user once; never log or persist.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// The canonical text as key-derivation input.
    pub fn to_passphrase(&self) -> Passphrase {
        Passphrase::new(self.0.clone())
    }
}

fn group(raw: &str) -> String {
    let mut out = String::with_capacity(KEY_CHARS + KEY_CHARS / GROUP);
    for (i, c) in raw.chars().enumerate() {
        if i > 0 && i % GROUP == 0 {
            out.push('-');
        }
        out.push(c);
    }
    out
}

impl fmt::Debug for RecoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecoveryKey([REDACTED])")
    }
}
