//! Redaction of sensitive fragments from log text.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

/// Replacement for every redacted fragment.
pub const REDACTED: &str = "[REDACTED]";

// Order matters: recovery-key shapes are removed before the generic long
// token rule could split them.
static PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?:/home|/Users)/[^/\s]+",
        r"(?i)[A-Z]:\\Users\\[^\\\s]+",
        r"(?i)password\s*[=:]\s*\S+",
        r"(?i)key\s*[=:]\s*\S+",
        r"\b[A-Za-z0-9]{4}(?:-[A-Za-z0-9]{4}){3,}\b",
        r"\b[A-Za-z0-9]{20,}\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Replace sensitive fragments with [`REDACTED`].
///
/// Covers home-directory paths, `password=`/`key=` assignments,
/// dash-grouped recovery-key shapes and long alphanumeric tokens.
pub fn sanitize(raw: &str) -> String {
    PATTERNS
        .iter()
        .fold(raw.to_string(), |text, re| re.replace_all(&text, REDACTED).into_owned())
}

/// Sanitize every value of a metadata map. Keys are left as-is.
pub fn sanitize_metadata(metadata: BTreeMap<String, String>) -> BTreeMap<String, String> {
    metadata
        .into_iter()
        .map(|(k, v)| (k, sanitize(&v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_patterns_compile() {
        assert_eq!(PATTERNS.len(), 6);
    }

    #[test]
    fn test_home_path_and_password_removed() {
        let raw = "open failed for /home/alice/secret/plans.txt with password=secret123";
        let clean = sanitize(raw);
        assert!(!clean.contains("/home/alice"));
        assert!(!clean.contains("alice"));
        assert!(!clean.contains("secret123"));
        assert!(clean.contains(REDACTED));
    }

    #[test]
    fn test_macos_and_windows_homes() {
        let clean = sanitize(r"cannot read /Users/bob/x and C:\Users\carol\y");
        assert!(!clean.contains("bob"));
        assert!(!clean.contains("carol"));
    }

    #[test]
    fn test_key_assignment_removed() {
        let clean = sanitize("derived key: 0xdeadbeef and api_key=abc");
        assert!(!clean.contains("deadbeef"));
        assert!(!clean.contains("abc"));
    }

    #[test]
    fn test_recovery_key_shape_removed() {
        let clean = sanitize("tried ABCD-EF12-GH34-IJ56-KL78-MN90 for lookup");
        assert!(!clean.contains("ABCD"));
        assert!(!clean.contains("MN90"));
        assert!(clean.starts_with("tried [REDACTED]"));
    }

    #[test]
    fn test_long_token_removed() {
        let clean = sanitize("token ABCDEFGHIJKLMNOPQRSTUVWXYZ0123 rejected");
        assert_eq!(clean, "token [REDACTED] rejected");
    }

    #[test]
    fn test_plain_text_untouched() {
        let text = "Folder hidden after 3 attempts";
        assert_eq!(sanitize(text), text);
    }

    #[test]
    fn test_metadata_values_sanitized() {
        let mut meta = BTreeMap::new();
        meta.insert("path".to_string(), "/home/dave/docs".to_string());
        let clean = sanitize_metadata(meta);
        assert!(!clean["path"].contains("dave"));
    }

    proptest! {
        #[test]
        fn prop_password_value_never_survives(value in "[a-z0-9]{6,16}") {
            let raw = format!("login failed password={} at step 2", value);
            let clean = sanitize(&raw);
            let needle = format!("password={}", value);
            prop_assert!(!clean.contains(&needle));
            prop_assert!(clean.contains(REDACTED));
        }

        #[test]
        fn prop_home_user_never_survives(user in "[a-z]{3,12}") {
            let raw = format!("stat /home/{}/Documents failed", user);
            let clean = sanitize(&raw);
            let needle = format!("/home/{}", user);
            prop_assert!(!clean.contains(&needle));
        }
    }
}
