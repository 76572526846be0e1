use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Longest identifier accepted, in bytes.
pub const MAX_ID_LEN: usize = 64;

/// Stable identifier of a work unit.
///
/// Identifiers double as directory names in the flat-file layout and as
/// lease keys, so they are restricted to `[A-Za-z0-9._-]` and may not start
/// with `.` or `_` (the underscore prefix is reserved for store-internal
/// lease keys).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkUnitId(String);

/// Error returned when a string is not a valid work unit identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidWorkUnitId {
    pub raw: String,
    pub reason: &'static str,
}

impl fmt::Display for InvalidWorkUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid work unit id '{}': {}", self.raw, self.reason)
    }
}

impl std::error::Error for InvalidWorkUnitId {}

impl WorkUnitId {
    /// Parse and validate an identifier.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidWorkUnitId`] when the string is empty, too long,
    /// starts with a reserved character, or contains characters outside
    /// `[A-Za-z0-9._-]`.
    pub fn parse(raw: impl Into<String>) -> Result<Self, InvalidWorkUnitId> {
        let raw = raw.into();
        let reason = if raw.is_empty() {
            Some("must not be empty")
        } else if raw.len() > MAX_ID_LEN {
            Some("longer than 64 bytes")
        } else if raw.starts_with('.') || raw.starts_with('_') {
            Some("must not start with '.' or '_'")
        } else if !raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
        {
            Some("allowed characters are A-Z, a-z, 0-9, '.', '_' and '-'")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(InvalidWorkUnitId { raw, reason }),
            None => Ok(Self(raw)),
        }
    }

    /// Derive a short identifier from a title and a nonce.
    ///
    /// The id is `ms-` followed by the first `len` hex characters of a BLAKE3
    /// hash. Callers extend `len` when the shorter id is already taken.
    #[must_use]
    pub fn derive(title: &str, nonce: u128, len: usize) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(title.as_bytes());
        hasher.update(&nonce.to_le_bytes());
        let hex = hasher.finalize().to_hex();
        let len = len.clamp(4, 32);
        Self(format!("ms-{}", &hex[..len]))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for WorkUnitId {
    type Err = InvalidWorkUnitId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for WorkUnitId {
    type Error = InvalidWorkUnitId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<WorkUnitId> for String {
    fn from(id: WorkUnitId) -> Self {
        id.0
    }
}

impl AsRef<str> for WorkUnitId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
