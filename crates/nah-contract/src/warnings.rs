// warnings.rs — The warning policy and per-run collector.
//
// Every anomaly the engine can survive flows through one collector. Each
// emission is resolved to an effective action at emission time:
//
//   1. Per-run overrides (NAH_OVERRIDE_WARNINGS_* / overrides file) — highest
//   2. Host profile warning policy — lowest
//   3. Default: warn
//
// Overrides are not retroactive: registering one mid-run only affects
// emissions after that point. Ignored warnings are still recorded (tests
// inspect them) but dropped from the reported set.

use std::collections::{BTreeMap, HashMap};

use nah_records::{HostProfile, WarningAction};

/// Every warning key the engine can emit. Closed set; dynamic lookups parse
/// back into this enum case-insensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Warning {
    InvalidManifest,
    InvalidConfiguration,
    ProfileInvalid,
    ProfileMissing,
    ProfileParseError,
    NakPinInvalid,
    NakNotFound,
    NakVersionUnsupported,
    NakLoaderRequired,
    NakLoaderMissing,
    BinaryNotFound,
    CapabilityMissing,
    CapabilityMalformed,
    CapabilityUnknown,
    MissingEnvVar,
    InvalidTrustState,
    OverrideDenied,
    OverrideInvalid,
    InvalidLibraryPath,
    TrustStateUnknown,
    TrustStateUnverified,
    TrustStateFailed,
    TrustStateStale,
}

impl Warning {
    pub fn key(self) -> &'static str {
        match self {
            Warning::InvalidManifest => "invalid_manifest",
            Warning::InvalidConfiguration => "invalid_configuration",
            Warning::ProfileInvalid => "profile_invalid",
            Warning::ProfileMissing => "profile_missing",
            Warning::ProfileParseError => "profile_parse_error",
            Warning::NakPinInvalid => "nak_pin_invalid",
            Warning::NakNotFound => "nak_not_found",
            Warning::NakVersionUnsupported => "nak_version_unsupported",
            Warning::NakLoaderRequired => "nak_loader_required",
            Warning::NakLoaderMissing => "nak_loader_missing",
            Warning::BinaryNotFound => "binary_not_found",
            Warning::CapabilityMissing => "capability_missing",
            Warning::CapabilityMalformed => "capability_malformed",
            Warning::CapabilityUnknown => "capability_unknown",
            Warning::MissingEnvVar => "missing_env_var",
            Warning::InvalidTrustState => "invalid_trust_state",
            Warning::OverrideDenied => "override_denied",
            Warning::OverrideInvalid => "override_invalid",
            Warning::InvalidLibraryPath => "invalid_library_path",
            Warning::TrustStateUnknown => "trust_state_unknown",
            Warning::TrustStateUnverified => "trust_state_unverified",
            Warning::TrustStateFailed => "trust_state_failed",
            Warning::TrustStateStale => "trust_state_stale",
        }
    }

    /// Parse a warning key, case-insensitively. Unknown keys yield `None`.
    pub fn parse(key: &str) -> Option<Self> {
        match key.trim().to_ascii_lowercase().as_str() {
            "invalid_manifest" => Some(Warning::InvalidManifest),
            "invalid_configuration" => Some(Warning::InvalidConfiguration),
            "profile_invalid" => Some(Warning::ProfileInvalid),
            "profile_missing" => Some(Warning::ProfileMissing),
            "profile_parse_error" => Some(Warning::ProfileParseError),
            "nak_pin_invalid" => Some(Warning::NakPinInvalid),
            "nak_not_found" => Some(Warning::NakNotFound),
            "nak_version_unsupported" => Some(Warning::NakVersionUnsupported),
            "nak_loader_required" => Some(Warning::NakLoaderRequired),
            "nak_loader_missing" => Some(Warning::NakLoaderMissing),
            "binary_not_found" => Some(Warning::BinaryNotFound),
            "capability_missing" => Some(Warning::CapabilityMissing),
            "capability_malformed" => Some(Warning::CapabilityMalformed),
            "capability_unknown" => Some(Warning::CapabilityUnknown),
            "missing_env_var" => Some(Warning::MissingEnvVar),
            "invalid_trust_state" => Some(Warning::InvalidTrustState),
            "override_denied" => Some(Warning::OverrideDenied),
            "override_invalid" => Some(Warning::OverrideInvalid),
            "invalid_library_path" => Some(Warning::InvalidLibraryPath),
            "trust_state_unknown" => Some(Warning::TrustStateUnknown),
            "trust_state_unverified" => Some(Warning::TrustStateUnverified),
            "trust_state_failed" => Some(Warning::TrustStateFailed),
            "trust_state_stale" => Some(Warning::TrustStateStale),
            _ => None,
        }
    }
}

/// One reported warning: stable key, effective action, diagnostic fields.
///
/// Fields stay a flat sorted string map so serialization is deterministic
/// without any per-key schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarningObject {
    pub key: String,
    pub action: String,
    pub fields: BTreeMap<String, String>,
}

/// Internal record of one emission, with the action that was effective at
/// the moment it happened.
#[derive(Debug, Clone)]
struct Emission {
    key: String,
    fields: BTreeMap<String, String>,
    effective_action: WarningAction,
}

/// Per-run warning sink. One instance per composition; never shared, never
/// global.
#[derive(Debug, Default)]
pub struct WarningCollector {
    /// Host profile policy, keys lower-cased. Lowest precedence.
    policy: HashMap<String, WarningAction>,
    /// Per-run overrides, keys lower-cased. Highest precedence.
    overrides: HashMap<String, WarningAction>,
    emitted: Vec<Emission>,
}

impl WarningCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A collector seeded with the profile's warning policy.
    pub fn for_profile(profile: &HostProfile) -> Self {
        Self {
            policy: profile
                .warnings
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), *v))
                .collect(),
            overrides: HashMap::new(),
            emitted: Vec::new(),
        }
    }

    /// Record an anomaly. The action is resolved now, not at reporting time.
    pub fn emit(&mut self, warning: Warning, fields: BTreeMap<String, String>) {
        self.emit_key(warning.key(), fields);
    }

    /// Record an anomaly by raw key (used for keys arriving from input data).
    pub fn emit_key(&mut self, key: &str, fields: BTreeMap<String, String>) {
        let effective_action = self.effective_action(key);
        self.emitted.push(Emission {
            key: key.to_string(),
            fields,
            effective_action,
        });
    }

    /// Register a per-run override. Affects only later emissions.
    pub fn apply_override(&mut self, key: &str, action: WarningAction) {
        self.overrides.insert(key.to_ascii_lowercase(), action);
    }

    /// The action currently in force for a key: override, then policy, then
    /// the default (warn). Case-insensitive.
    pub fn effective_action(&self, key: &str) -> WarningAction {
        let key = key.to_ascii_lowercase();
        if let Some(action) = self.overrides.get(&key) {
            return *action;
        }
        if let Some(action) = self.policy.get(&key) {
            return *action;
        }
        WarningAction::Warn
    }

    /// The reported set: everything emitted whose action is not Ignore, in
    /// emission order.
    pub fn warnings(&self) -> Vec<WarningObject> {
        self.emitted
            .iter()
            .filter(|e| e.effective_action != WarningAction::Ignore)
            .map(|e| WarningObject {
                key: e.key.clone(),
                action: e.effective_action.as_str().to_string(),
                fields: e.fields.clone(),
            })
            .collect()
    }

    /// True when any emission was escalated to Error. Callers use this to
    /// refuse to launch after an otherwise-successful composition.
    pub fn has_errors(&self) -> bool {
        self.emitted
            .iter()
            .any(|e| e.effective_action == WarningAction::Error)
    }

    /// True when anything non-ignored was emitted.
    pub fn has_effective_warnings(&self) -> bool {
        self.emitted
            .iter()
            .any(|e| e.effective_action != WarningAction::Ignore)
    }

    /// Number of raw emissions, including ignored ones.
    pub fn emission_count(&self) -> usize {
        self.emitted.len()
    }

    pub fn clear(&mut self) {
        self.emitted.clear();
    }
}

/// Build a fields map from key/value pairs.
pub fn fields<const N: usize>(pairs: [(&str, &str); N]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
