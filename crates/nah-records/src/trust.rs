// trust.rs — Trust state recorded at install time.
//
// The engine consumes trust as given: the verification collaborator decides
// whether an install is Verified; composition only carries the result into
// the contract and warns on anything weaker.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Provenance classification of one installed app.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustState {
    Verified,
    Unverified,
    Failed,
    #[default]
    Unknown,
}

impl TrustState {
    pub fn as_str(self) -> &'static str {
        match self {
            TrustState::Verified => "verified",
            TrustState::Unverified => "unverified",
            TrustState::Failed => "failed",
            TrustState::Unknown => "unknown",
        }
    }

    /// Parse a trust state string. Unrecognized values yield `None`; the
    /// install-record parser maps those to `Unknown` with a parse note.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "verified" => Some(TrustState::Verified),
            "unverified" => Some(TrustState::Unverified),
            "failed" => Some(TrustState::Failed),
            "unknown" => Some(TrustState::Unknown),
            _ => None,
        }
    }
}

/// The trust block of an app install record, copied verbatim into the
/// contract.
///
/// Timestamps are RFC3339 strings; staleness is evaluated lexicographically
/// after normalizing a trailing `±00:00` offset to `Z`, so the engine never
/// needs a datetime parse to compare them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustInfo {
    #[serde(default)]
    pub state: TrustState,
    /// What produced this evaluation (e.g. "signature", "registry").
    #[serde(default)]
    pub source: String,
    /// When the evaluation ran (RFC3339).
    #[serde(default)]
    pub evaluated_at: String,
    /// Optional expiry (RFC3339); past-expiry installs are stale.
    #[serde(default)]
    pub expires_at: String,
    /// Optional digest over the evaluation inputs.
    #[serde(default)]
    pub inputs_hash: String,
    /// Host-defined opaque metadata, carried through untouched.
    #[serde(default)]
    pub details: BTreeMap<String, String>,
}

impl TrustInfo {
    /// An entirely empty trust block — no source and no evaluation time —
    /// means the install was never evaluated at all.
    pub fn is_absent(&self) -> bool {
        self.source.is_empty() && self.evaluated_at.is_empty()
    }
}
