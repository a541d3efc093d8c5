// install_record.rs — The per-install app record.
//
// Written once by the installer, read-only here. The `app` section is an
// audit snapshot of what the manifest said at install time; composition
// cross-checks it against the live manifest but never lets it drive
// behavior. The `nak` section is the pin: the exact NAK id, version, and
// record the installer bound this app to.

use serde::{Deserialize, Serialize};

use crate::env::EnvMap;
use crate::error::RecordError;
use crate::trust::{TrustInfo, TrustState};

/// The `$schema` tag every app install record must carry.
pub const APP_INSTALL_SCHEMA: &str = "nah.app.install.v2";

/// The `install` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallIdentity {
    /// Opaque unique id minted by the installer for this install instance.
    #[serde(default)]
    pub instance_id: String,
}

/// The `app` section — an audit snapshot, never behavioral.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSnapshot {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub nak_id: String,
    #[serde(default)]
    pub nak_version_req: String,
}

/// The `nak` section — the app's pinned NAK binding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinnedNak {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub version: String,
    /// Record file name under the NAK registry (e.g. "lua@5.4.6.json").
    #[serde(default)]
    pub record_ref: String,
    /// Loader name resolved at install time; empty means auto-select.
    #[serde(default)]
    pub loader: String,
    /// Audit-only note on why this version was chosen.
    #[serde(default)]
    pub selection_reason: String,
}

/// The `paths` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallPaths {
    /// Absolute root of the installed app tree.
    #[serde(default)]
    pub install_root: String,
}

/// The `provenance` section, carried through for audit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    #[serde(default)]
    pub package_hash: String,
    #[serde(default)]
    pub installed_at: String,
    #[serde(default)]
    pub installed_by: String,
    #[serde(default)]
    pub source: String,
}

/// The `verification` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationInfo {
    #[serde(default)]
    pub last_verified_at: String,
    #[serde(default)]
    pub last_verifier_version: String,
}

/// Per-install argument overrides, applied around the loader template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgumentOverrides {
    #[serde(default)]
    pub prepend: Vec<String>,
    #[serde(default)]
    pub append: Vec<String>,
}

/// Per-install path overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathOverrides {
    #[serde(default)]
    pub library_prepend: Vec<String>,
}

/// The `overrides` section: the highest-precedence configuration layer the
/// installer controls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallOverrides {
    #[serde(default)]
    pub environment: EnvMap,
    #[serde(default)]
    pub arguments: ArgumentOverrides,
    #[serde(default)]
    pub paths: PathOverrides,
}

/// Persisted record of one installed app instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInstallRecord {
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub install: InstallIdentity,
    #[serde(default)]
    pub app: AppSnapshot,
    #[serde(default)]
    pub nak: PinnedNak,
    #[serde(default)]
    pub paths: InstallPaths,
    #[serde(default)]
    pub provenance: Provenance,
    #[serde(default)]
    pub trust: TrustInfo,
    #[serde(default)]
    pub verification: VerificationInfo,
    #[serde(default)]
    pub overrides: InstallOverrides,
    /// Where this record was loaded from, for trace attribution.
    #[serde(default)]
    pub source_path: String,
}

/// A parsed record plus the soft issues found along the way.
#[derive(Debug)]
pub struct ParsedAppInstallRecord {
    pub record: AppInstallRecord,
    pub notes: Vec<String>,
}

/// Raw document shape: the trust state arrives as a plain string so an
/// unrecognized value degrades to Unknown with a note.
#[derive(Deserialize)]
struct RecordDoc {
    #[serde(rename = "$schema")]
    schema: Option<String>,
    #[serde(default)]
    install: InstallIdentity,
    #[serde(default)]
    app: AppSnapshot,
    #[serde(default)]
    nak: PinnedNak,
    #[serde(default)]
    paths: InstallPaths,
    #[serde(default)]
    provenance: Provenance,
    #[serde(default)]
    trust: TrustDoc,
    #[serde(default)]
    verification: VerificationInfo,
    #[serde(default)]
    overrides: InstallOverrides,
}

#[derive(Default, Deserialize)]
struct TrustDoc {
    state: Option<String>,
    #[serde(default)]
    source: String,
    #[serde(default)]
    evaluated_at: String,
    #[serde(default)]
    expires_at: String,
    #[serde(default)]
    inputs_hash: String,
    #[serde(default)]
    details: std::collections::BTreeMap<String, String>,
}

/// Parse an app install record document.
///
/// Fatal: unparseable JSON, missing or mismatched `$schema`. Soft (note):
/// an unrecognized trust state, recorded as `invalid_trust_state:<value>`
/// and mapped to Unknown.
pub fn parse_app_install_record(
    json_str: &str,
    source_path: &str,
) -> Result<ParsedAppInstallRecord, RecordError> {
    let doc: RecordDoc = serde_json::from_str(json_str).map_err(|e| RecordError::Malformed {
        source_path: source_path.to_string(),
        reason: e.to_string(),
    })?;

    let schema = doc.schema.unwrap_or_default();
    if schema.trim() != APP_INSTALL_SCHEMA {
        return Err(RecordError::SchemaMismatch {
            source_path: source_path.to_string(),
            expected: APP_INSTALL_SCHEMA,
            found: schema,
        });
    }

    let mut notes = Vec::new();
    let state = match doc.trust.state.as_deref() {
        None | Some("") => TrustState::Unknown,
        Some(raw) => TrustState::parse(raw).unwrap_or_else(|| {
            notes.push(format!("invalid_trust_state:{raw}"));
            TrustState::Unknown
        }),
    };

    let record = AppInstallRecord {
        schema: APP_INSTALL_SCHEMA.to_string(),
        install: doc.install,
        app: doc.app,
        nak: doc.nak,
        paths: doc.paths,
        provenance: doc.provenance,
        trust: TrustInfo {
            state,
            source: doc.trust.source,
            evaluated_at: doc.trust.evaluated_at,
            expires_at: doc.trust.expires_at,
            inputs_hash: doc.trust.inputs_hash,
            details: doc.trust.details,
        },
        verification: doc.verification,
        overrides: doc.overrides,
        source_path: source_path.to_string(),
    };

    Ok(ParsedAppInstallRecord { record, notes })
}

/// Presence validation: the fields composition cannot proceed without.
pub fn validate_app_install_record(record: &AppInstallRecord) -> Result<(), RecordError> {
    if record.schema != APP_INSTALL_SCHEMA {
        return Err(RecordError::SchemaMismatch {
            source_path: record.source_path.clone(),
            expected: APP_INSTALL_SCHEMA,
            found: record.schema.clone(),
        });
    }
    for (field, value) in [
        ("install.instance_id", &record.install.instance_id),
        ("paths.install_root", &record.paths.install_root),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{EnvOp, EnvValue};

    const SAMPLE: &str = r#"{
        "$schema": "nah.app.install.v2",
        "install": {"instance_id": "9c1f0d6a"},
        "app": {"id": "com.example.game", "version": "1.0.0", "nak_id": "lua",
                "nak_version_req": "^5.4.0"},
        "nak": {"id": "lua", "version": "5.4.6", "record_ref": "lua@5.4.6.json",
                "loader": "default"},
        "paths": {"install_root": "/nah/apps/com.example.game/1.0.0"},
        "trust": {"state": "verified", "source": "signature",
                  "evaluated_at": "2025-10-01T00:00:00Z"},
        "overrides": {
            "environment": {"GAME_DEBUG": {"op": "set", "value": "1"}},
            "arguments": {"prepend": ["--safe-mode"]},
            "paths": {"library_prepend": ["/opt/compat/lib"]}
        }
    }"#;

    #[test]
    fn parses_complete_record() {
        let parsed = parse_app_install_record(SAMPLE, "install.json").unwrap();
        assert!(parsed.notes.is_empty());

        let r = parsed.record;
        assert_eq!(r.install.instance_id, "9c1f0d6a");
        assert_eq!(r.nak.record_ref, "lua@5.4.6.json");
        assert_eq!(r.trust.state, TrustState::Verified);
        assert_eq!(
            r.overrides.environment.get("GAME_DEBUG"),
            Some(&EnvValue::with_op(EnvOp::Set, "1"))
        );
        assert_eq!(r.overrides.arguments.prepend, vec!["--safe-mode"]);
        validate_app_install_record(&r).unwrap();
    }

    #[test]
    fn unknown_trust_state_degrades_with_note() {
        let json = r#"{
            "$schema": "nah.app.install.v2",
            "install": {"instance_id": "x"},
            "paths": {"install_root": "/apps/x"},
            "trust": {"state": "suspicious", "source": "registry",
                      "evaluated_at": "2025-10-01T00:00:00Z"}
        }"#;
        let parsed = parse_app_install_record(json, "install.json").unwrap();
        assert_eq!(parsed.record.trust.state, TrustState::Unknown);
        assert_eq!(parsed.notes, vec!["invalid_trust_state:suspicious"]);
    }

    #[test]
    fn wrong_schema_is_fatal() {
        let json = r#"{"$schema": "nah.app.install.v1"}"#;
        match parse_app_install_record(json, "install.json") {
            Err(RecordError::SchemaMismatch { .. }) => {}
            other => panic!("expected SchemaMismatch, got {other:?}"),
        }
    }

    #[test]
    fn validation_requires_instance_id_and_root() {
        let mut record = parse_app_install_record(SAMPLE, "install.json")
            .unwrap()
            .record;
        record.paths.install_root.clear();
        match validate_app_install_record(&record) {
            Err(RecordError::MissingField { field, .. }) => {
                assert_eq!(field, "paths.install_root");
            }
            other => panic!("expected MissingField, got {other:?}"),
        }
    }
}
