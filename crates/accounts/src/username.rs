use core::fmt;

use serde::{Deserialize, Serialize};

use factline_core::{DomainError, ValueObject};
use factline_events::ClaimKey;

/// Claim namespace for usernames.
pub const USERNAME_NAMESPACE: &str = "username";

const MIN_LEN: usize = 3;
const MAX_LEN: usize = 32;

/// A normalized username: lower-case ASCII letters, digits, `_`, `.` and `-`,
/// between 3 and 32 characters.
///
/// Normalization happens once, here, so "Alice" and "alice" compete for the
/// same claim.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Username(String);

impl Username {
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let normalized = raw.trim().to_ascii_lowercase();
        let len = normalized.chars().count();
        if !(MIN_LEN..=MAX_LEN).contains(&len) {
            return Err(DomainError::validation(format!(
                "username must be {MIN_LEN}..={MAX_LEN} characters, got {len}"
            )));
        }
        if let Some(bad) = normalized
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-')))
        {
            return Err(DomainError::validation(format!(
                "username contains invalid character {bad:?}"
            )));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn claim_key(&self) -> ClaimKey {
        ClaimKey::new(USERNAME_NAMESPACE, &self.0)
    }
}

impl ValueObject for Username {}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Username {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Username> for String {
    fn from(value: Username) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn normalizes_case_and_whitespace() {
        let u = Username::parse("  Alice ").unwrap();
        assert_eq!(u.as_str(), "alice");
        assert_eq!(u.claim_key().as_str(), "username:alice");
    }

    #[test]
    fn rejects_bad_lengths_and_characters() {
        assert!(matches!(Username::parse("ab"), Err(DomainError::Validation(_))));
        assert!(matches!(Username::parse(&"a".repeat(33)), Err(DomainError::Validation(_))));
        assert!(matches!(Username::parse("al ice"), Err(DomainError::Validation(_))));
        assert!(matches!(Username::parse("bob!"), Err(DomainError::Validation(_))));
    }

    #[test]
    fn deserialization_validates() {
        assert!(serde_json::from_str::<Username>("\"x\"").is_err());
        let u: Username = serde_json::from_str("\"Bob.Smith\"").unwrap();
        assert_eq!(u.as_str(), "bob.smith");
    }

    proptest! {
        #[test]
        fn parse_is_idempotent(raw in "[A-Za-z0-9_.-]{3,32}") {
            let once = Username::parse(&raw).unwrap();
            let twice = Username::parse(once.as_str()).unwrap();
            prop_assert_eq!(once, twice);
        }
    }
}
