// host_profile.rs — Per-deployment policy.
//
// The host profile is the deployment operator's lever: which NAK versions
// may be selected (and how), which environment keys the host injects, how
// each warning class is handled, which capabilities map to real enforcement
// ids, and whether per-run overrides are honored at all.
//
// Parsing policy: the document must be a JSON object with the right
// `$schema`; inside it, an unrecognized mode or action degrades to a parse
// note and the safe default rather than rejecting the profile.

use std::collections::BTreeMap;

use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::env::EnvMap;
use crate::error::RecordError;

/// The `$schema` tag every host profile must carry.
pub const HOST_PROFILE_SCHEMA: &str = "nah.host.profile.v2";

/// How a warning class is handled: surfaced, suppressed, or escalated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningAction {
    #[default]
    Warn,
    Ignore,
    Error,
}

impl WarningAction {
    pub fn as_str(self) -> &'static str {
        match self {
            WarningAction::Warn => "warn",
            WarningAction::Ignore => "ignore",
            WarningAction::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "warn" => Some(WarningAction::Warn),
            "ignore" => Some(WarningAction::Ignore),
            "error" => Some(WarningAction::Error),
            _ => None,
        }
    }
}

/// Policy for choosing among multiple installed NAK versions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingMode {
    /// The highest satisfying version wins.
    #[default]
    Canonical,
    /// The profile's `nak.map` names the record for each selection key.
    Mapped,
}

impl BindingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BindingMode::Canonical => "canonical",
            BindingMode::Mapped => "mapped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "canonical" => Some(BindingMode::Canonical),
            "mapped" => Some(BindingMode::Mapped),
            _ => None,
        }
    }
}

/// Whether per-run overrides (process env / overrides file) are honored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideMode {
    #[default]
    Allow,
    Deny,
    Allowlist,
}

impl OverrideMode {
    pub fn as_str(self) -> &'static str {
        match self {
            OverrideMode::Allow => "allow",
            OverrideMode::Deny => "deny",
            OverrideMode::Allowlist => "allowlist",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Some(OverrideMode::Allow),
            "deny" => Some(OverrideMode::Deny),
            "allowlist" => Some(OverrideMode::Allowlist),
            _ => None,
        }
    }
}

/// The `nak` section: version gating and binding policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NakPolicy {
    #[serde(default)]
    pub binding_mode: BindingMode,
    /// Version patterns admitted when non-empty (literal or prefix `*`).
    #[serde(default)]
    pub allow_versions: Vec<String>,
    /// Version patterns always excluded; deny wins over allow.
    #[serde(default)]
    pub deny_versions: Vec<String>,
    /// Mapped mode: selection key ("MAJOR.MINOR") → record_ref.
    #[serde(default)]
    pub map: BTreeMap<String, String>,
}

/// The `paths` section: host-supplied library path segments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilePaths {
    #[serde(default)]
    pub library_prepend: Vec<String>,
    #[serde(default)]
    pub library_append: Vec<String>,
}

/// The `overrides` section: the gate on per-run overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverridePolicy {
    #[serde(default)]
    pub mode: OverrideMode,
    /// Allowlist mode only: permitted targets, literal or prefix `*`.
    #[serde(default)]
    pub allow_keys: Vec<String>,
}

/// Per-deployment policy, loaded once per run and read-only thereafter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostProfile {
    pub schema: String,
    #[serde(default)]
    pub nak: NakPolicy,
    #[serde(default)]
    pub environment: EnvMap,
    #[serde(default)]
    pub paths: ProfilePaths,
    /// Warning key (lower-cased) → action; lowest-precedence policy layer.
    #[serde(default)]
    pub warnings: BTreeMap<String, WarningAction>,
    /// Capability key → host enforcement id.
    #[serde(default)]
    pub capabilities: BTreeMap<String, String>,
    #[serde(default)]
    pub overrides: OverridePolicy,
    /// Where this profile was loaded from, for trace attribution.
    #[serde(default)]
    pub source_path: String,
}

/// The built-in profile used when a host has none: canonical binding, no
/// version gating, no environment, all overrides allowed.
pub fn builtin_empty_profile() -> HostProfile {
    HostProfile {
        schema: HOST_PROFILE_SCHEMA.to_string(),
        ..HostProfile::default()
    }
}

/// A parsed profile plus the soft issues found along the way.
#[derive(Debug)]
pub struct ParsedHostProfile {
    pub profile: HostProfile,
    pub notes: Vec<String>,
}

/// Raw document shape: enum-valued fields arrive as plain strings so that
/// unrecognized values degrade to notes instead of rejecting the profile.
#[derive(Deserialize)]
struct ProfileDoc {
    #[serde(rename = "$schema")]
    schema: Option<String>,
    #[serde(default)]
    nak: NakDoc,
    #[serde(default)]
    environment: EnvMap,
    #[serde(default)]
    paths: ProfilePaths,
    #[serde(default)]
    warnings: BTreeMap<String, String>,
    #[serde(default)]
    capabilities: BTreeMap<String, String>,
    #[serde(default)]
    overrides: OverrideDoc,
}

#[derive(Default, Deserialize)]
struct NakDoc {
    binding_mode: Option<String>,
    #[serde(default)]
    allow_versions: Vec<String>,
    #[serde(default)]
    deny_versions: Vec<String>,
    #[serde(default)]
    map: BTreeMap<String, String>,
}

#[derive(Default, Deserialize)]
struct OverrideDoc {
    mode: Option<String>,
    #[serde(default)]
    allow_keys: Vec<String>,
}

/// Parse a host profile document.
///
/// Fatal: unparseable JSON, missing or mismatched `$schema`. Soft (note +
/// default): unrecognized binding mode, override mode, or warning action.
pub fn parse_host_profile(
    json_str: &str,
    source_path: &str,
) -> Result<ParsedHostProfile, RecordError> {
    let doc: ProfileDoc =
        serde_json::from_str(json_str).map_err(|e| RecordError::Malformed {
            source_path: source_path.to_string(),
            reason: e.to_string(),
        })?;

    let schema = doc.schema.unwrap_or_default();
    if schema.trim() != HOST_PROFILE_SCHEMA {
        return Err(RecordError::SchemaMismatch {
            source_path: source_path.to_string(),
            expected: HOST_PROFILE_SCHEMA,
            found: schema,
        });
    }

    let mut notes = Vec::new();
    let mut profile = HostProfile {
        schema: HOST_PROFILE_SCHEMA.to_string(),
        environment: doc.environment,
        paths: doc.paths,
        capabilities: doc.capabilities,
        source_path: source_path.to_string(),
        ..HostProfile::default()
    };

    if let Some(mode) = doc.nak.binding_mode {
        match BindingMode::parse(&mode) {
            Some(parsed) => profile.nak.binding_mode = parsed,
            None => notes.push(format!("invalid binding_mode '{mode}', using canonical")),
        }
    }
    profile.nak.allow_versions = doc.nak.allow_versions;
    profile.nak.deny_versions = doc.nak.deny_versions;
    profile.nak.map = doc.nak.map;

    for (key, action) in doc.warnings {
        let key = key.to_ascii_lowercase();
        match WarningAction::parse(&action) {
            Some(parsed) => {
                profile.warnings.insert(key, parsed);
            }
            None => notes.push(format!("invalid warning action '{action}' for '{key}'")),
        }
    }

    if let Some(mode) = doc.overrides.mode {
        match OverrideMode::parse(&mode) {
            Some(parsed) => profile.overrides.mode = parsed,
            None => notes.push(format!("invalid override mode '{mode}', using allow")),
        }
    }
    profile.overrides.allow_keys = doc.overrides.allow_keys;

    Ok(ParsedHostProfile { profile, notes })
}

/// Does a version string match an allow/deny pattern?
///
/// Patterns are literal versions or prefixes ending in `*` (e.g. `"5.4.*"`).
/// Matching goes through `glob::Pattern`; a pattern that fails to compile
/// matches nothing (fail-closed).
pub fn version_matches_pattern(version: &str, pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    match Pattern::new(pattern) {
        Ok(p) => p.matches(version),
        Err(_) => false,
    }
}

/// Is a version admitted by the profile's allow/deny rules?
///
/// Deny patterns always exclude. When the allow list is non-empty, only
/// listed versions pass; an empty allow list admits everything not denied.
pub fn version_allowed_by_profile(version: &str, profile: &HostProfile) -> bool {
    for pattern in &profile.nak.deny_versions {
        if version_matches_pattern(version, pattern) {
            return false;
        }
    }

    if profile.nak.allow_versions.is_empty() {
        return true;
    }

    profile
        .nak
        .allow_versions
        .iter()
        .any(|pattern| version_matches_pattern(version, pattern))
}

/// Is an override target (`"ENVIRONMENT"` or `"WARNINGS_<KEY>"`) permitted?
///
/// Unsupported targets are always denied; supported ones are gated by the
/// profile's override mode. Allowlist entries are literal targets or
/// prefixes ending in `*`.
pub fn is_override_permitted(target: &str, profile: &HostProfile) -> bool {
    let supported = target == "ENVIRONMENT" || target.starts_with("WARNINGS_");
    if !supported {
        return false;
    }

    match profile.overrides.mode {
        OverrideMode::Deny => false,
        OverrideMode::Allow => true,
        OverrideMode::Allowlist => profile.overrides.allow_keys.iter().any(|pattern| {
            match pattern.strip_suffix('*') {
                Some(prefix) => target.starts_with(prefix),
                None => pattern == target,
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile_json(body: &str) -> String {
        format!(r#"{{"$schema": "nah.host.profile.v2", {body}}}"#)
    }

    #[test]
    fn parses_full_profile() {
        let json = profile_json(
            r#"
            "nak": {
                "binding_mode": "mapped",
                "allow_versions": ["5.4.*"],
                "deny_versions": ["5.4.1"],
                "map": {"5.4": "lua@5.4.6.json"}
            },
            "environment": {"NAH_HOST": "prod", "EXTRA": {"op": "append", "value": "x"}},
            "paths": {"library_prepend": ["/opt/host/lib"]},
            "warnings": {"NAK_NOT_FOUND": "error", "missing_env_var": "ignore"},
            "capabilities": {"filesystem.read": "sandbox.fs.ro"},
            "overrides": {"mode": "allowlist", "allow_keys": ["ENVIRONMENT"]}
        "#,
        );

        let parsed = parse_host_profile(&json, "profile.json").unwrap();
        assert!(parsed.notes.is_empty());

        let p = parsed.profile;
        assert_eq!(p.nak.binding_mode, BindingMode::Mapped);
        assert_eq!(p.nak.map.get("5.4").unwrap(), "lua@5.4.6.json");
        // Warning keys are stored lower-cased.
        assert_eq!(p.warnings.get("nak_not_found"), Some(&WarningAction::Error));
        assert_eq!(
            p.warnings.get("missing_env_var"),
            Some(&WarningAction::Ignore)
        );
        assert_eq!(p.overrides.mode, OverrideMode::Allowlist);
        assert_eq!(p.source_path, "profile.json");
    }

    #[test]
    fn schema_mismatch_is_fatal() {
        let err = parse_host_profile(r#"{"$schema": "nah.host.profile.v1"}"#, "p.json");
        match err {
            Err(RecordError::SchemaMismatch { found, .. }) => {
                assert_eq!(found, "nah.host.profile.v1");
            }
            other => panic!("expected SchemaMismatch, got {other:?}"),
        }
    }

    #[test]
    fn invalid_modes_degrade_to_notes() {
        let json = profile_json(
            r#""nak": {"binding_mode": "sideways"}, "overrides": {"mode": "maybe"},
               "warnings": {"nak_not_found": "explode"}"#,
        );
        let parsed = parse_host_profile(&json, "p.json").unwrap();
        assert_eq!(parsed.notes.len(), 3);
        assert_eq!(parsed.profile.nak.binding_mode, BindingMode::Canonical);
        assert_eq!(parsed.profile.overrides.mode, OverrideMode::Allow);
        assert!(parsed.profile.warnings.is_empty());
    }

    #[test]
    fn deny_patterns_win_over_allow() {
        let mut profile = builtin_empty_profile();
        profile.nak.allow_versions = vec!["5.4.*".into()];
        profile.nak.deny_versions = vec!["5.4.1".into()];

        assert!(version_allowed_by_profile("5.4.6", &profile));
        assert!(!version_allowed_by_profile("5.4.1", &profile));
        assert!(!version_allowed_by_profile("5.5.0", &profile)); // not in allow list
    }

    #[test]
    fn empty_allow_list_admits_everything_not_denied() {
        let mut profile = builtin_empty_profile();
        profile.nak.deny_versions = vec!["2.*".into()];

        assert!(version_allowed_by_profile("1.0.0", &profile));
        assert!(!version_allowed_by_profile("2.9.9", &profile));
    }

    #[test]
    fn override_gate_modes() {
        let mut profile = builtin_empty_profile();
        assert!(is_override_permitted("ENVIRONMENT", &profile));
        assert!(is_override_permitted("WARNINGS_NAK_NOT_FOUND", &profile));
        assert!(!is_override_permitted("BINARY", &profile));

        profile.overrides.mode = OverrideMode::Deny;
        assert!(!is_override_permitted("ENVIRONMENT", &profile));

        profile.overrides.mode = OverrideMode::Allowlist;
        profile.overrides.allow_keys = vec!["WARNINGS_*".into()];
        assert!(is_override_permitted("WARNINGS_TRUST_STATE_STALE", &profile));
        assert!(!is_override_permitted("ENVIRONMENT", &profile));
    }
}
