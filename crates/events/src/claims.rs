//! Uniqueness claims carried by committed events.
//!
//! A claim is a value (a username, an email address) that at most one
//! aggregate may own at a time across the whole log, independent of how
//! aggregates are spread over partitions. Events declare the claims they
//! acquire and release; the coordinator applies those declarations in global
//! commit order.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Namespaced claim key, e.g. `username:alice`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimKey(String);

impl ClaimKey {
    pub fn new(namespace: &str, value: &str) -> Self {
        Self(format!("{namespace}:{value}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn namespace(&self) -> &str {
        self.0.split_once(':').map_or("", |(ns, _)| ns)
    }
}

impl fmt::Display for ClaimKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ClaimKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One change to the ownership of a claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimChange {
    Acquire(ClaimKey),
    Release(ClaimKey),
}

impl ClaimChange {
    pub fn key(&self) -> &ClaimKey {
        match self {
            ClaimChange::Acquire(k) | ClaimChange::Release(k) => k,
        }
    }

    pub fn is_acquire(&self) -> bool {
        matches!(self, ClaimChange::Acquire(_))
    }
}

/// Implemented by event types whose commits change claim ownership.
///
/// The answer must depend only on the event itself, so any process reading
/// the log derives the same ownership table.
pub trait UniqueClaims {
    fn claim_changes(&self) -> Vec<ClaimChange>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        let key = ClaimKey::new("username", "alice");
        assert_eq!(key.as_str(), "username:alice");
        assert_eq!(key.namespace(), "username");
        assert_eq!(ClaimChange::Release(key.clone()).key(), &key);
    }

    #[test]
    fn serializes_as_plain_string() {
        let key = ClaimKey::new("email", "a@b.c");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"email:a@b.c\"");
    }
}
