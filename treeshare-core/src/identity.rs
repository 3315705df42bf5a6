//! Node identity (`user@host`) and originator serial numbers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Node identifier: `user@host`. Stable for the lifetime of a process.
#[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier(String);

impl Identifier {
    /// Build an identifier from its two halves.
    pub fn new(user: &str, host: &str) -> Result<Self, IdentifierError> {
        Self::parse(&format!("{}@{}", user, host))
    }

    /// Parse `user@host`. Exactly one `@`, both halves non-empty.
    pub fn parse(s: &str) -> Result<Self, IdentifierError> {
        let (user, host) = s
            .split_once('@')
            .ok_or_else(|| IdentifierError::MissingSeparator(s.to_string()))?;
        if user.is_empty() || host.is_empty() || host.contains('@') {
            return Err(IdentifierError::Invalid(s.to_string()));
        }
        Ok(Identifier(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[cfg(test)]
    pub fn user(&self) -> &str {
        self.0.split_once('@').map(|(u, _)| u).unwrap_or_default()
    }

    /// Host half; names the per-peer download directory.
    pub fn host(&self) -> &str {
        self.0.split_once('@').map(|(_, h)| h).unwrap_or_default()
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Identifier {
    type Error = IdentifierError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Identifier::parse(&s)
    }
}

impl From<Identifier> for String {
    fn from(id: Identifier) -> Self {
        id.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentifierError {
    #[error("identifier {0:?} has no '@'")]
    MissingSeparator(String),
    #[error("identifier {0:?} is not user@host")]
    Invalid(String),
}

/// Serial numbers for locally originated messages: milliseconds since the Unix epoch,
/// bumped past the previous value when the clock has not moved (or went backwards).
#[derive(Debug, Default)]
pub struct SerialGenerator {
    last: AtomicU64,
}

impl SerialGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let prev = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .unwrap_or(now);
        now.max(prev.saturating_add(1))
    }
}
