//! Session and commit identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// How much of a rejected input the error keeps for display.
const REJECTED_INPUT_PREVIEW: usize = 48;

/// Error returned when a string is not a fully-resolved commit SHA.
///
/// Checkout strings routinely reach SHA positions by mistake (a branch
/// name, `origin/main`, an abbreviated hash), so the error keeps the
/// offending input for the log line.
#[derive(Debug, Clone, Error)]
#[error("not a full commit SHA: {input}")]
pub struct NotACommitSha {
    input: String,
}

impl NotACommitSha {
    fn new(input: &str) -> Self {
        let mut preview: String = input.chars().take(REJECTED_INPUT_PREVIEW).collect();
        if input.chars().count() > REJECTED_INPUT_PREVIEW {
            preview.push('…');
        }
        NotACommitSha { input: preview }
    }
}

/// A fully-resolved git commit SHA, stored as 40 lowercase hex characters.
///
/// A checkout stays a plain string for its whole life (it may name a
/// branch, a tag, or a commit); a `Sha` only comes into existence once a
/// ref has been resolved through an application's ref map or read back
/// from git output, so holding one is proof of resolution. Sessions carry
/// it as their `commit_id` and seed it into the `commit` variable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Sha(String);

impl Sha {
    /// Validates and normalizes a full commit SHA.
    ///
    /// Exactly 40 hex digits are required; case is folded so two
    /// spellings of the same commit compare and hash identically.
    /// Abbreviated hashes are rejected: an abbreviation is a checkout,
    /// not a resolved commit.
    pub fn parse(input: impl Into<String>) -> Result<Self, NotACommitSha> {
        let input = input.into();
        if input.len() != 40 {
            return Err(NotACommitSha::new(&input));
        }
        let mut normalized = String::with_capacity(40);
        for c in input.chars() {
            match c {
                '0'..='9' | 'a'..='f' => normalized.push(c),
                'A'..='F' => normalized.push(c.to_ascii_lowercase()),
                _ => return Err(NotACommitSha::new(&input)),
            }
        }
        Ok(Sha(normalized))
    }

    /// The SHA as lowercase hex, suitable for ref maps, folder names and
    /// the `commit` session variable.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Sha {
    type Err = NotACommitSha;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Sha::parse(s)
    }
}

impl fmt::Display for Sha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Sha {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A session identifier.
///
/// Freshly generated as a v4 UUID for every non-recycled session. The first
/// dashed segment is the short form used in log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionUuid(Uuid);

impl SessionUuid {
    /// Generates a fresh session identifier.
    pub fn generate() -> Self {
        SessionUuid(Uuid::new_v4())
    }

    /// Parses a session identifier from its canonical dashed form.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(SessionUuid)
    }

    /// Returns the first dashed segment (8 hex characters), used as the
    /// short form in log lines.
    pub fn short(&self) -> String {
        let full = self.0.to_string();
        full.split('-').next().unwrap_or(&full).to_string()
    }
}

impl fmt::Display for SessionUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
