// envelope.rs — The launch contract and its serialized envelope.
//
// The envelope is the engine's only output, and it must be byte-identical
// for identical inputs. Top-level keys appear in a fixed order (serde_json
// is built with preserve_order); every data-driven object — environment,
// warning fields, trust details, exports, trace sections — is inserted in
// sorted key order.

use std::collections::BTreeMap;

use nah_records::{EnvOp, TrustInfo};
use serde_json::{json, Map, Value};

use crate::capability::CapabilityUsage;
use crate::warnings::WarningObject;

/// The envelope's `schema` tag.
pub const CONTRACT_SCHEMA: &str = "nah.launch.contract.v1";

/// Fatal resolution failures. Any of these aborts composition immediately;
/// the envelope then carries warnings and the error but no contract body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriticalError {
    ManifestMissing,
    EntrypointNotFound,
    PathTraversal,
    NakLoaderInvalid,
    InstallRecordInvalid,
}

impl CriticalError {
    pub fn as_str(self) -> &'static str {
        match self {
            CriticalError::ManifestMissing => "MANIFEST_MISSING",
            CriticalError::EntrypointNotFound => "ENTRYPOINT_NOT_FOUND",
            CriticalError::PathTraversal => "PATH_TRAVERSAL",
            CriticalError::NakLoaderInvalid => "NAK_LOADER_INVALID",
            CriticalError::InstallRecordInvalid => "INSTALL_RECORD_INVALID",
        }
    }
}

/// Resolved app identity and paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppFacts {
    pub id: String,
    pub version: String,
    pub root: String,
    pub entrypoint: String,
}

/// Resolved NAK identity and paths; all empty for standalone apps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NakFacts {
    pub id: String,
    pub version: String,
    pub root: String,
    pub resource_root: String,
    pub record_ref: String,
}

/// Exactly what to execute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Execution {
    pub binary: String,
    pub arguments: Vec<String>,
    pub cwd: String,
    pub library_path_env_key: String,
    pub library_paths: Vec<String>,
}

/// Host enforcement ids derived from the app's permissions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Enforcement {
    pub filesystem: Vec<String>,
    pub network: Vec<String>,
}

/// One resolved asset export.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedExport {
    pub id: String,
    /// Absolute path under the app root.
    pub path: String,
    pub kind: String,
}

/// The fully resolved launch description for one app invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchContract {
    pub app: AppFacts,
    pub nak: NakFacts,
    pub execution: Execution,
    /// Flat, fully expanded environment.
    pub environment: BTreeMap<String, String>,
    pub enforcement: Enforcement,
    pub trust: TrustInfo,
    pub exports: BTreeMap<String, ResolvedExport>,
    pub capability_usage: CapabilityUsage,
}

/// One layer's attempted write to one environment key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContribution {
    pub value: String,
    pub source_kind: String,
    pub source_path: String,
    pub precedence_rank: u8,
    pub operation: EnvOp,
    pub accepted: bool,
}

/// Final provenance for one environment key: the winning contribution plus
/// the full write history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceEntry {
    pub value: String,
    pub source_kind: String,
    pub source_path: String,
    pub precedence_rank: u8,
    pub history: Vec<TraceContribution>,
}

/// Trace output: section → key → entry.
pub type Trace = BTreeMap<String, BTreeMap<String, TraceEntry>>;

/// The engine's complete output for one composition run.
#[derive(Debug, Clone, Default)]
pub struct ContractEnvelope {
    pub contract: LaunchContract,
    pub warnings: Vec<WarningObject>,
    pub trace: Option<Trace>,
}

/// Serialize the envelope to deterministic, pretty-printed JSON.
///
/// Contract sections are emitted only when no critical error occurred;
/// `warnings` and `critical_error` are always present; `trace` is present
/// when it was collected and `include_trace` is set.
pub fn serialize_contract_json(
    envelope: &ContractEnvelope,
    include_trace: bool,
    critical_error: Option<CriticalError>,
) -> String {
    let mut root = Map::new();
    root.insert("schema".into(), json!(CONTRACT_SCHEMA));

    if critical_error.is_none() {
        let c = &envelope.contract;

        root.insert(
            "app".into(),
            json!({
                "id": c.app.id,
                "version": c.app.version,
                "root": c.app.root,
                "entrypoint": c.app.entrypoint,
            }),
        );

        root.insert(
            "nak".into(),
            json!({
                "id": c.nak.id,
                "version": c.nak.version,
                "root": c.nak.root,
                "resource_root": c.nak.resource_root,
                "record_ref": c.nak.record_ref,
            }),
        );

        root.insert(
            "execution".into(),
            json!({
                "binary": c.execution.binary,
                "arguments": c.execution.arguments,
                "cwd": c.execution.cwd,
                "library_path_env_key": c.execution.library_path_env_key,
                "library_paths": c.execution.library_paths,
            }),
        );

        // BTreeMap iteration is already sorted.
        root.insert(
            "environment".into(),
            Value::Object(
                c.environment
                    .iter()
                    .map(|(k, v)| (k.clone(), json!(v)))
                    .collect(),
            ),
        );

        root.insert(
            "enforcement".into(),
            json!({
                "filesystem": c.enforcement.filesystem,
                "network": c.enforcement.network,
            }),
        );

        root.insert(
            "trust".into(),
            json!({
                "state": c.trust.state.as_str(),
                "source": c.trust.source,
                "evaluated_at": c.trust.evaluated_at,
                "expires_at": c.trust.expires_at,
                "details": Value::Object(
                    c.trust.details.iter().map(|(k, v)| (k.clone(), json!(v))).collect()
                ),
            }),
        );

        root.insert(
            "exports".into(),
            Value::Object(
                c.exports
                    .iter()
                    .map(|(id, export)| {
                        (
                            id.clone(),
                            json!({
                                "id": export.id,
                                "path": export.path,
                                "type": export.kind,
                            }),
                        )
                    })
                    .collect(),
            ),
        );

        root.insert(
            "capability_usage".into(),
            json!({
                "present": c.capability_usage.present,
                "required_capabilities": c.capability_usage.required_capabilities,
                "optional_capabilities": c.capability_usage.optional_capabilities,
                "critical_capabilities": c.capability_usage.critical_capabilities,
            }),
        );
    }

    root.insert(
        "warnings".into(),
        Value::Array(
            envelope
                .warnings
                .iter()
                .map(|w| {
                    json!({
                        "key": w.key,
                        "action": w.action,
                        "fields": Value::Object(
                            w.fields.iter().map(|(k, v)| (k.clone(), json!(v))).collect()
                        ),
                    })
                })
                .collect(),
        ),
    );

    root.insert(
        "critical_error".into(),
        match critical_error {
            Some(error) => json!(error.as_str()),
            None => Value::Null,
        },
    );

    if include_trace {
        if let Some(trace) = &envelope.trace {
            root.insert("trace".into(), serialize_trace(trace));
        }
    }

    // Pretty-printing a Map cannot fail.
    serde_json::to_string_pretty(&Value::Object(root)).unwrap_or_default()
}

fn serialize_trace(trace: &Trace) -> Value {
    Value::Object(
        trace
            .iter()
            .map(|(section, entries)| {
                let entries_obj: Map<String, Value> = entries
                    .iter()
                    .map(|(key, entry)| {
                        let mut obj = Map::new();
                        obj.insert("value".into(), json!(entry.value));
                        obj.insert("source_kind".into(), json!(entry.source_kind));
                        obj.insert("source_path".into(), json!(entry.source_path));
                        obj.insert("precedence_rank".into(), json!(entry.precedence_rank));
                        if !entry.history.is_empty() {
                            obj.insert(
                                "history".into(),
                                Value::Array(
                                    entry
                                        .history
                                        .iter()
                                        .map(|contribution| {
                                            json!({
                                                "value": contribution.value,
                                                "source_kind": contribution.source_kind,
                                                "source_path": contribution.source_path,
                                                "precedence_rank": contribution.precedence_rank,
                                                "operation": contribution.operation.as_str(),
                                                "accepted": contribution.accepted,
                                            })
                                        })
                                        .collect(),
                                ),
                            );
                        }
                        (key.clone(), Value::Object(obj))
                    })
                    .collect();
                (section.clone(), Value::Object(entries_obj))
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warnings::fields;

    fn sample_envelope() -> ContractEnvelope {
        let mut environment = BTreeMap::new();
        environment.insert("NAH_APP_ID".to_string(), "com.example.x".to_string());
        environment.insert("A_FIRST".to_string(), "1".to_string());

        ContractEnvelope {
            contract: LaunchContract {
                app: AppFacts {
                    id: "com.example.x".into(),
                    version: "1.0.0".into(),
                    root: "/apps/x".into(),
                    entrypoint: "/apps/x/bin/app".into(),
                },
                execution: Execution {
                    binary: "/apps/x/bin/app".into(),
                    cwd: "/apps/x".into(),
                    library_path_env_key: "LD_LIBRARY_PATH".into(),
                    ..Execution::default()
                },
                environment,
                ..LaunchContract::default()
            },
            warnings: vec![WarningObject {
                key: "missing_env_var".into(),
                action: "warn".into(),
                fields: fields([("source_path", "x"), ("missing", "HOME")]),
            }],
            trace: None,
        }
    }

    #[test]
    fn top_level_key_order_is_fixed() {
        let json = serialize_contract_json(&sample_envelope(), false, None);
        let positions: Vec<usize> = [
            "\"schema\"",
            "\"app\"",
            "\"nak\"",
            "\"execution\"",
            "\"environment\"",
            "\"enforcement\"",
            "\"trust\"",
            "\"exports\"",
            "\"capability_usage\"",
            "\"warnings\"",
            "\"critical_error\"",
        ]
        .iter()
        .map(|key| json.find(key).unwrap_or_else(|| panic!("missing {key}")))
        .collect();

        for pair in positions.windows(2) {
            assert!(pair[0] < pair[1], "top-level keys out of order");
        }
    }

    #[test]
    fn critical_error_suppresses_contract_body() {
        let json =
            serialize_contract_json(&sample_envelope(), false, Some(CriticalError::PathTraversal));
        assert!(json.contains("\"critical_error\": \"PATH_TRAVERSAL\""));
        assert!(!json.contains("\"app\""));
        assert!(!json.contains("\"execution\""));
        // Warnings survive.
        assert!(json.contains("\"missing_env_var\""));
    }

    #[test]
    fn serialization_is_deterministic() {
        let envelope = sample_envelope();
        let a = serialize_contract_json(&envelope, false, None);
        let b = serialize_contract_json(&envelope, false, None);
        assert_eq!(a, b);
    }

    #[test]
    fn warning_fields_are_sorted() {
        let json = serialize_contract_json(&sample_envelope(), false, None);
        let missing = json.find("\"missing\"").unwrap();
        let source = json.find("\"source_path\"").unwrap();
        assert!(missing < source);
    }

    #[test]
    fn trace_requires_both_flag_and_data() {
        let mut envelope = sample_envelope();
        assert!(!serialize_contract_json(&envelope, true, None).contains("\"trace\""));

        let mut entries = BTreeMap::new();
        entries.insert(
            "PATH".to_string(),
            TraceEntry {
                value: "/usr/bin".into(),
                source_kind: "profile".into(),
                source_path: "host_profile".into(),
                precedence_rank: 1,
                history: vec![],
            },
        );
        let mut trace = Trace::new();
        trace.insert("environment".to_string(), entries);
        envelope.trace = Some(trace);

        assert!(serialize_contract_json(&envelope, true, None).contains("\"trace\""));
        assert!(!serialize_contract_json(&envelope, false, None).contains("\"trace\""));
    }
}
