//! Credential handling
//!
//! Provider credentials live in configuration (`${VAR}`-expanded) and must
//! never reach logs, error messages, or cache keys. [`Credential`] wraps the
//! raw value so the only way to read it is an explicit [`Credential::expose`]
//! at the point the value is attached to an upstream request.

use serde::{Deserialize, Serialize};

/// An opaque API credential. `Debug` and `Display` are redacted.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    /// Wrap a raw credential value
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Read the raw value. Call only when attaching to an outbound request.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Whether the credential is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential([redacted])")
    }
}

impl std::fmt::Display for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[redacted]")
    }
}

/// Strip a known credential from free-form text before it reaches an error
/// message or a log line.
#[must_use]
pub fn redact(text: &str, credential: Option<&Credential>) -> String {
    match credential {
        Some(cred) if !cred.is_empty() => text.replace(cred.expose(), "[redacted]"),
        _ => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_and_display_are_redacted() {
        let cred = Credential::new("sk-very-secret");
        assert_eq!(format!("{cred:?}"), "Credential([redacted])");
        assert_eq!(cred.to_string(), "[redacted]");
    }

    #[test]
    fn expose_returns_raw_value() {
        let cred = Credential::new("abc123");
        assert_eq!(cred.expose(), "abc123");
    }

    #[test]
    fn redact_scrubs_credential_from_text() {
        let cred = Credential::new("topsecret");
        let msg = "GET https://api.example.com/q?apikey=topsecret failed";
        assert_eq!(
            redact(msg, Some(&cred)),
            "GET https://api.example.com/q?apikey=[redacted] failed"
        );
        assert_eq!(redact(msg, None), msg);
    }

    #[test]
    fn serde_is_transparent() {
        let cred: Credential = serde_json::from_str(r#""key-1""#).unwrap();
        assert_eq!(cred.expose(), "key-1");
        assert_eq!(serde_json::to_string(&cred).unwrap(), r#""key-1""#);
    }
}
