//! Canonical provider identifiers and the single normalization pipeline.
//!
//! All knowledge about the shape of provider ids lives in [`normalize`]:
//! case folding, `_` → `-`, and stripping suffixes that only carry a routing
//! hint. Every other crate goes through [`ProviderId`] and never munges
//! id strings itself.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix of the environment-style names advertised to the executor.
pub const TOKEN_NAME_PREFIX: &str = "PROVIDER_TOKEN_FOR_";

/// Suffixes that mark where a credential is stored. They are removed from the
/// id and kept as a [`SourceHint`].
const HINT_SUFFIXES: &[(&str, SourceHint)] =
    &[("-vault", SourceHint::Vault), ("-remote", SourceHint::Remote)];

/// Canonical identifier for a third-party account type: lower-case,
/// hyphen-separated (e.g. `github`, `google-drive`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProviderId(String);

/// Routing hint carried by a raw id suffix, retained for logging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceHint {
    /// The raw id ended in `-vault` / `_vault`.
    Vault,
    /// The raw id ended in `-remote` / `_remote`.
    Remote,
}

impl fmt::Display for SourceHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vault => write!(f, "vault"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// Output of [`normalize`]: the canonical id plus any stripped hints,
/// outermost suffix first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedId {
    pub id: ProviderId,
    pub hints: Vec<SourceHint>,
}

/// Canonicalize a raw provider identifier.
///
/// Pipeline: trim, lower-case, fold `_` and whitespace to `-`, then strip
/// known hint suffixes repeatedly (so the result is idempotent under a
/// second application). A suffix is only stripped when something remains.
///
/// # Examples
///
/// ```
/// use keyrelay_types::normalize;
/// let n = normalize("Google_Drive_Remote");
/// assert_eq!(n.id.as_str(), "google-drive");
/// ```
#[must_use]
pub fn normalize(raw: &str) -> NormalizedId {
    let mut id: String = raw
        .trim()
        .chars()
        .map(|c| match c {
            '_' => '-',
            c if c.is_whitespace() => '-',
            c => c.to_ascii_lowercase(),
        })
        .collect();

    let mut hints = Vec::new();
    'strip: loop {
        for (suffix, hint) in HINT_SUFFIXES {
            if id.len() > suffix.len() && id.ends_with(suffix) {
                id.truncate(id.len() - suffix.len());
                hints.push(*hint);
                continue 'strip;
            }
        }
        break;
    }

    NormalizedId {
        id: ProviderId(id),
        hints,
    }
}

impl ProviderId {
    /// Build a provider id from any raw spelling, discarding routing hints.
    #[must_use]
    pub fn new(raw: &str) -> Self {
        normalize(raw).id
    }

    /// Borrow the canonical string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if the id is empty after normalization.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Wire-level name under which this credential is advertised to the
    /// executor, e.g. `google-drive` → `PROVIDER_TOKEN_FOR_GOOGLE_DRIVE`.
    #[must_use]
    pub fn token_name(&self) -> String {
        format!(
            "{TOKEN_NAME_PREFIX}{}",
            self.0.to_ascii_uppercase().replace('-', "_")
        )
    }

    /// Inverse of [`ProviderId::token_name`]; `None` if the prefix is missing.
    #[must_use]
    pub fn from_token_name(name: &str) -> Option<Self> {
        let rest = name.strip_prefix(TOKEN_NAME_PREFIX)?;
        if rest.is_empty() {
            return None;
        }
        Some(Self::new(rest))
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ProviderId {
    type Err = crate::RelayError;

    /// Parse and normalize a provider name.
    ///
    /// # Errors
    ///
    /// Returns [`crate::RelayError::Config`] if nothing remains after normalization.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = Self::new(s);
        if id.is_empty() {
            return Err(crate::RelayError::Config(format!(
                "invalid provider id: {s:?}"
            )));
        }
        Ok(id)
    }
}

impl TryFrom<String> for ProviderId {
    type Error = crate::RelayError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ProviderId> for String {
    fn from(id: ProviderId) -> Self {
        id.0
    }
}

impl AsRef<str> for ProviderId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
