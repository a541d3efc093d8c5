// manifest.rs — The parsed app manifest.
//
// The on-disk manifest is a binary tagged-length-value container decoded by
// the packaging collaborator; the engine receives the decoded value. The
// serde derives exist for fixtures and tooling, not because the engine
// parses manifest bytes itself.

use serde::{Deserialize, Serialize};

/// One declared asset export: a stable id naming a path under the app root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetExport {
    pub id: String,
    /// Relative path under the app root.
    pub path: String,
    /// Optional consumer hint (e.g. "font", "plugin").
    #[serde(default)]
    pub kind: String,
}

/// An app's declared identity and requirements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub id: String,
    pub version: String,

    /// Required NAK id; empty for standalone apps.
    #[serde(default)]
    pub nak_id: String,
    /// Raw requirement string (e.g. "^5.4.0"); parsed by the engine.
    #[serde(default)]
    pub nak_version_req: String,
    /// Optional loader preference, resolved into the install record's pin.
    #[serde(default)]
    pub nak_loader: String,

    /// Relative path to the main binary or script under the app root.
    #[serde(default)]
    pub entrypoint_path: String,
    #[serde(default)]
    pub entrypoint_args: Vec<String>,

    /// `KEY=VALUE` defaults, fill-only: applied just when the key is unset.
    #[serde(default)]
    pub env_defaults: Vec<String>,

    /// Relative library directories under the app root.
    #[serde(default)]
    pub lib_dirs: Vec<String>,
    /// Relative asset directories under the app root.
    #[serde(default)]
    pub asset_dirs: Vec<String>,
    #[serde(default)]
    pub asset_exports: Vec<AssetExport>,

    /// Filesystem permission strings, `operation:selector`.
    #[serde(default)]
    pub permissions_filesystem: Vec<String>,
    /// Network permission strings, `operation:selector`.
    #[serde(default)]
    pub permissions_network: Vec<String>,

    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub license: String,
    #[serde(default)]
    pub homepage: String,
}

impl Manifest {
    /// Standalone apps declare no NAK and run their entrypoint directly.
    pub fn is_standalone(&self) -> bool {
        self.nak_id.is_empty()
    }
}
