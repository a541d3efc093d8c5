// nak_record.rs — The per-NAK install record.
//
// Describes one installed Native App Kit: where it lives, which library
// directories it contributes, the environment it needs, and the loaders it
// offers. All paths in an install record are absolute; composition verifies
// they stay under `paths.root` before trusting them.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::env::EnvMap;
use crate::error::RecordError;

/// The `$schema` tag every NAK install record must carry.
pub const NAK_INSTALL_SCHEMA: &str = "nah.nak.install.v1";

/// One named loader a NAK offers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Absolute path to the loader executable, under the NAK root.
    pub exec_path: String,
    /// Argument template; `{NAME}` placeholders are expanded at composition.
    #[serde(default)]
    pub args_template: Vec<String>,
}

/// The `nak` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NakIdentity {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub version: String,
}

/// The `paths` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NakPaths {
    /// Absolute NAK root.
    #[serde(default)]
    pub root: String,
    /// Absolute resource root; defaults to `root` when omitted.
    #[serde(default)]
    pub resource_root: String,
    /// Absolute library directories, trusted once verified under root.
    #[serde(default)]
    pub lib_dirs: Vec<String>,
}

/// The optional `execution` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NakExecution {
    /// Working-directory template, resolved at composition time.
    #[serde(default)]
    pub cwd: String,
}

/// The `provenance` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NakProvenance {
    #[serde(default)]
    pub package_hash: String,
    #[serde(default)]
    pub installed_at: String,
    #[serde(default)]
    pub installed_by: String,
    #[serde(default)]
    pub source: String,
}

/// Persisted record of one installed NAK.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NakInstallRecord {
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub nak: NakIdentity,
    #[serde(default)]
    pub paths: NakPaths,
    #[serde(default)]
    pub environment: EnvMap,
    /// Named loaders; empty for libs-only NAKs.
    #[serde(default)]
    pub loaders: BTreeMap<String, LoaderConfig>,
    #[serde(default)]
    pub execution: Option<NakExecution>,
    #[serde(default)]
    pub provenance: NakProvenance,
    /// Where this record was loaded from, for trace attribution.
    #[serde(default)]
    pub source_path: String,
}

impl NakInstallRecord {
    pub fn has_loaders(&self) -> bool {
        !self.loaders.is_empty()
    }

    /// The resource root, falling back to the NAK root when unset.
    pub fn effective_resource_root(&self) -> &str {
        if self.paths.resource_root.is_empty() {
            &self.paths.root
        } else {
            &self.paths.resource_root
        }
    }
}

/// A parsed record plus the soft issues found along the way.
#[derive(Debug)]
pub struct ParsedNakInstallRecord {
    pub record: NakInstallRecord,
    pub notes: Vec<String>,
}

#[derive(Deserialize)]
struct NakDoc {
    #[serde(rename = "$schema")]
    schema: Option<String>,
    #[serde(default)]
    nak: NakIdentity,
    #[serde(default)]
    paths: NakPaths,
    #[serde(default)]
    environment: EnvMap,
    #[serde(default)]
    loaders: BTreeMap<String, LoaderConfig>,
    #[serde(default)]
    execution: Option<NakExecution>,
    #[serde(default)]
    provenance: NakProvenance,
}

/// Parse a NAK install record document.
///
/// Fatal: unparseable JSON, missing or mismatched `$schema`, a loader with
/// an empty `exec_path` (there is no safe default for "what to execute").
pub fn parse_nak_install_record(
    json_str: &str,
    source_path: &str,
) -> Result<ParsedNakInstallRecord, RecordError> {
    let doc: NakDoc = serde_json::from_str(json_str).map_err(|e| RecordError::Malformed {
        source_path: source_path.to_string(),
        reason: e.to_string(),
    })?;

    let schema = doc.schema.unwrap_or_default();
    if schema.trim() != NAK_INSTALL_SCHEMA {
        return Err(RecordError::SchemaMismatch {
            source_path: source_path.to_string(),
            expected: NAK_INSTALL_SCHEMA,
            found: schema,
        });
    }

    for (name, loader) in &doc.loaders {
        if loader.exec_path.trim().is_empty() {
            return Err(RecordError::MissingField {
                source_path: source_path.to_string(),
                field: format!("loaders.{name}.exec_path"),
            });
        }
    }

    let record = NakInstallRecord {
        schema: NAK_INSTALL_SCHEMA.to_string(),
        nak: doc.nak,
        paths: doc.paths,
        environment: doc.environment,
        loaders: doc.loaders,
        execution: doc.execution,
        provenance: doc.provenance,
        source_path: source_path.to_string(),
    };

    Ok(ParsedNakInstallRecord {
        record,
        notes: Vec::new(),
    })
}

/// Read and parse a NAK install record from disk.
pub fn load_nak_install_record(path: &Path) -> Result<ParsedNakInstallRecord, RecordError> {
    let content = fs::read_to_string(path).map_err(|source| RecordError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_nak_install_record(&content, &path.display().to_string())
}

/// Presence validation: the fields resolution cannot proceed without.
pub fn validate_nak_install_record(record: &NakInstallRecord) -> Result<(), RecordError> {
    if record.schema != NAK_INSTALL_SCHEMA {
        return Err(RecordError::SchemaMismatch {
            source_path: record.source_path.clone(),
            expected: NAK_INSTALL_SCHEMA,
            found: record.schema.clone(),
        });
    }
    for (field, value) in [
        ("nak.id", &record.nak.id),
        ("nak.version", &record.nak.version),
        ("paths.root", &record.paths.root),
    ] {
        if value.trim().is_empty() {
            return Err(RecordError::MissingField {
                source_path: record.source_path.clone(),
                field: field.to_string(),
            });
        }
    }
    Ok(())
}
