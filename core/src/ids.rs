//! Identity and versioning types for interface exceptions.
//!
//! `TransactionId` is the idempotency key of a failure occurrence and
//! `Version` guards every write against stale reads.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for `TransactionId` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid transaction ID: {0}")]
pub struct ParseTransactionIdError(String);

/// Globally unique key of one business failure occurrence.
///
/// A transaction ID maps to at most one stored exception. Redelivering an
/// event with the same transaction ID never creates a second record.
///
/// # Validation
///
/// - `FromStr::from_str()` rejects empty and whitespace-only input and trims
///   surrounding whitespace
/// - `From::from()` and `new()` do not validate
///
/// # Examples
///
/// ```
/// use exception_collector_core::ids::TransactionId;
///
/// let id = TransactionId::new("T1");
/// assert_eq!(id.as_str(), "T1");
///
/// let parsed: TransactionId = " T1 ".parse().unwrap();
/// assert_eq!(parsed, id);
/// assert!("   ".parse::<TransactionId>().is_err());
/// ```
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    /// Create a new `TransactionId` from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the transaction ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert into the inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransactionId {
    type Err = ParseTransactionIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ParseTransactionIdError(
                "Transaction ID cannot be blank".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl From<String> for TransactionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TransactionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for TransactionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Row version for optimistic concurrency control.
///
/// A freshly ingested exception is at [`Version::INITIAL`]. Every accepted
/// write moves it to [`Version::next`]. A write that names a version other
/// than the stored one is rejected as a conflict.
///
/// # Examples
///
/// ```
/// use exception_collector_core::ids::Version;
///
/// let v0 = Version::INITIAL;
/// assert_eq!(v0.next(), Version::new(1));
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// Version of a record that has just been ingested.
    pub const INITIAL: Self = Self(0);

    /// Create a `Version` with the given value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The numeric value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The version that follows this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Identifies one retry attempt: the owning exception plus its 1-based number.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptId {
    /// Owning exception.
    pub transaction_id: TransactionId,
    /// 1-based attempt number, unique per exception.
    pub attempt_number: u32,
}

impl AttemptId {
    /// Create an attempt identifier.
    #[must_use]
    pub fn new(transaction_id: impl Into<TransactionId>, attempt_number: u32) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            attempt_number,
        }
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.transaction_id, self.attempt_number)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn transaction_id_parse_rejects_blank() {
        assert!("".parse::<TransactionId>().is_err());
        assert!(" \t".parse::<TransactionId>().is_err());
        assert_eq!("T-9".parse::<TransactionId>().unwrap().as_str(), "T-9");
    }

    #[test]
    fn transaction_id_serializes_as_plain_string() {
        let json = serde_json::to_string(&TransactionId::new("T1")).unwrap();
        assert_eq!(json, "\"T1\"");
    }

    #[test]
    fn version_ordering() {
        assert!(Version::INITIAL < Version::INITIAL.next());
        assert_eq!(Version::new(41).next().value(), 42);
    }

    #[test]
    fn attempt_id_display() {
        assert_eq!(AttemptId::new("T1", 3).to_string(), "T1#3");
    }
}
