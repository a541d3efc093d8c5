// compose.rs — The contract composition pipeline.
//
// Composition is a strictly ordered sequence of steps over one mutable
// builder. Each step either updates the builder or aborts with a critical
// error; there is no other control flow. Warnings accumulate in the run's
// collector throughout and survive an abort.
//
// The environment is built in seven precedence layers, later layers
// overwriting earlier ones per key:
//
//   1. host profile            (env operations)
//   2. NAK install record      (env operations)
//   3. manifest defaults       (fill-only KEY=VALUE)
//   4. install-record override (env operations)
//   5. NAH standard variables  (unconditional)
//   6. process NAH_OVERRIDE_*  (gated, lexicographic order)
//   7. overrides file          (gated)
//
// After layer 7 the map is frozen; placeholder expansion and every
// template expansion run against that frozen map.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use nah_records::{
    is_override_permitted, AppInstallRecord, EnvOp, EnvValue, HostProfile, Manifest,
    NakInstallRecord, TrustState, WarningAction,
};
use nah_semver::parse_requirement;

use crate::capability::derive_enforcement;
use crate::envelope::{
    ContractEnvelope, CriticalError, LaunchContract, Trace, TraceContribution, TraceEntry,
};
use crate::expand::{expand_environment_map, Expander};
use crate::paths::{is_absolute_path, is_path_under_root, library_path_env_key, normalize_under_root};
use crate::resolve::{load_pinned_nak, NakPin};
use crate::warnings::{fields, Warning, WarningCollector};

/// Everything one composition run reads. All inputs are explicit; two runs
/// with equal inputs produce byte-identical envelopes.
#[derive(Debug, Clone, Default)]
pub struct ComposeInputs {
    /// NAH root directory (registry lives under it).
    pub nah_root: String,
    pub manifest: Manifest,
    pub install_record: AppInstallRecord,
    pub profile: HostProfile,
    /// Snapshot of the process environment at call time.
    pub process_env: BTreeMap<String, String>,
    /// Optional JSON overrides file.
    pub overrides_file: Option<PathBuf>,
    /// Current time, RFC3339 UTC; used only for trust staleness.
    pub now: String,
    /// Collect per-key environment provenance.
    pub trace: bool,
}

/// The outcome of one composition run.
#[derive(Debug, Clone, Default)]
pub struct ComposeResult {
    pub envelope: ContractEnvelope,
    pub critical_error: Option<CriticalError>,
    /// Free-text diagnostics for the critical error; never serialized.
    pub critical_error_context: Option<String>,
    /// True when any warning's effective action was Error. Composition still
    /// succeeds; callers decide whether to refuse the launch.
    pub has_policy_errors: bool,
}

impl ComposeResult {
    pub fn ok(&self) -> bool {
        self.critical_error.is_none()
    }
}

/// The current time as an RFC3339 UTC string, in the format `now` expects.
pub fn current_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// A parsed overrides file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverridesFile {
    pub environment: BTreeMap<String, String>,
    pub warnings: BTreeMap<String, String>,
}

/// Parse an overrides file: a JSON object with only `environment` and/or
/// `warnings` keys, each an object of strings. Anything else is a shape
/// error; unparseable JSON is a parse failure.
pub fn parse_overrides_file(content: &str) -> Result<OverridesFile, &'static str> {
    let value: serde_json::Value =
        serde_json::from_str(content).map_err(|_| "parse_failure")?;
    let object = value.as_object().ok_or("invalid_shape")?;

    let mut overrides = OverridesFile::default();
    for (key, section) in object {
        let target = match key.as_str() {
            "environment" => &mut overrides.environment,
            "warnings" => &mut overrides.warnings,
            _ => return Err("invalid_shape"),
        };
        let section = section.as_object().ok_or("invalid_shape")?;
        for (k, v) in section {
            let v = v.as_str().ok_or("invalid_shape")?;
            target.insert(k.clone(), v.to_string());
        }
    }
    Ok(overrides)
}

/// Compose the launch contract for one app invocation.
pub fn compose_contract(inputs: &ComposeInputs) -> ComposeResult {
    tracing::debug!(
        "composing contract for {}@{}",
        inputs.manifest.id,
        inputs.manifest.version
    );

    let mut composer = Composer {
        inputs,
        warnings: WarningCollector::for_profile(&inputs.profile),
        contract: LaunchContract::default(),
        nak: None,
        pin: NakPin::default(),
        env: BTreeMap::new(),
        env_history: BTreeMap::new(),
        loader_name: None,
        loader_args: Vec::new(),
        expanded_cwd: String::new(),
        lib_prepend: Vec::new(),
        lib_append: Vec::new(),
        override_lib_prepend: Vec::new(),
        override_args_prepend: Vec::new(),
        override_args_append: Vec::new(),
        entry_args: Vec::new(),
    };

    let outcome = composer.run();
    let has_policy_errors = composer.warnings.has_errors();
    let warnings = composer.warnings.warnings();

    match outcome {
        Ok(()) => {
            let trace = inputs.trace.then(|| composer.build_trace());
            ComposeResult {
                envelope: ContractEnvelope {
                    contract: composer.contract,
                    warnings,
                    trace,
                },
                critical_error: None,
                critical_error_context: None,
                has_policy_errors,
            }
        }
        Err(abort) => {
            tracing::warn!("composition aborted: {}", abort.error.as_str());
            ComposeResult {
                envelope: ContractEnvelope {
                    contract: LaunchContract::default(),
                    warnings,
                    trace: None,
                },
                critical_error: Some(abort.error),
                critical_error_context: abort.context,
                has_policy_errors,
            }
        }
    }
}

/// A step failure: the error that aborts composition plus free-text context.
struct Abort {
    error: CriticalError,
    context: Option<String>,
}

impl Abort {
    fn new(error: CriticalError) -> Self {
        Self {
            error,
            context: None,
        }
    }

    fn with_context(error: CriticalError, context: impl Into<String>) -> Self {
        Self {
            error,
            context: Some(context.into()),
        }
    }
}

type StepResult = Result<(), Abort>;

/// The in-progress composition: inputs, accumulator, and scratch space for
/// expanded pieces shared between steps.
struct Composer<'a> {
    inputs: &'a ComposeInputs,
    warnings: WarningCollector,
    contract: LaunchContract,
    nak: Option<NakInstallRecord>,
    pin: NakPin,
    env: BTreeMap<String, String>,
    env_history: BTreeMap<String, Vec<TraceContribution>>,
    /// Loader chosen for execution; `None` when no usable choice exists.
    loader_name: Option<String>,
    loader_args: Vec<String>,
    expanded_cwd: String,
    lib_prepend: Vec<String>,
    lib_append: Vec<String>,
    override_lib_prepend: Vec<String>,
    override_args_prepend: Vec<String>,
    override_args_append: Vec<String>,
    entry_args: Vec<String>,
}

impl<'a> Composer<'a> {
    fn run(&mut self) -> StepResult {
        self.check_inputs()?;
        self.resolve_pinned_nak();
        self.derive_app_facts()?;
        self.check_nak_requirement();
        self.derive_nak_facts()?;
        self.build_environment();
        self.expand_everything();
        self.derive_capabilities();
        self.choose_binary()?;
        self.choose_cwd()?;
        self.assemble_library_paths()?;
        self.resolve_exports()?;
        self.evaluate_trust();
        self.contract.environment = std::mem::take(&mut self.env);
        Ok(())
    }

    // Step 1: input sanity and audit-snapshot cross-checks.
    fn check_inputs(&mut self) -> StepResult {
        let manifest = &self.inputs.manifest;
        let record = &self.inputs.install_record;

        if manifest.id.trim().is_empty() {
            return Err(Abort::with_context(
                CriticalError::ManifestMissing,
                "manifest has no id",
            ));
        }
        if record.paths.install_root.trim().is_empty() {
            return Err(Abort::with_context(
                CriticalError::InstallRecordInvalid,
                "install record has no paths.install_root",
            ));
        }

        // The app section is an audit snapshot; disagreement is suspicious
        // but not behavioral.
        if !record.app.id.is_empty() && record.app.id != manifest.id {
            self.warnings.emit(
                Warning::InvalidConfiguration,
                fields([
                    ("reason", "app_field_mismatch"),
                    ("source_path", "install_record.app"),
                    ("fields", "id"),
                ]),
            );
        }
        if !record.app.version.is_empty() && record.app.version != manifest.version {
            self.warnings.emit(
                Warning::InvalidConfiguration,
                fields([
                    ("reason", "app_field_mismatch"),
                    ("source_path", "install_record.app"),
                    ("fields", "version"),
                ]),
            );
        }
        Ok(())
    }

    // Step 2: resolve the pinned NAK. Standalone apps skip this entirely;
    // failures degrade to an unresolved NAK, never an abort.
    fn resolve_pinned_nak(&mut self) {
        let manifest = &self.inputs.manifest;
        if manifest.is_standalone() {
            return;
        }

        let record = &self.inputs.install_record;
        self.pin = NakPin {
            id: record.nak.id.clone(),
            version: record.nak.version.clone(),
            record_ref: record.nak.record_ref.clone(),
        };

        if self.pin.record_ref.is_empty() || self.pin.id.is_empty() || self.pin.version.is_empty()
        {
            self.warnings.emit(
                Warning::NakPinInvalid,
                fields([("reason", "pin_fields_missing")]),
            );
            return;
        }

        self.nak = load_pinned_nak(
            &self.pin,
            manifest,
            &self.inputs.profile,
            &self.inputs.nah_root,
            &mut self.warnings,
        );
    }

    // Step 3: app identity and the entrypoint, which must live under the
    // app root and exist on disk.
    fn derive_app_facts(&mut self) -> StepResult {
        let manifest = &self.inputs.manifest;
        self.contract.app.id = manifest.id.clone();
        self.contract.app.version = manifest.version.clone();
        self.contract.app.root = self.inputs.install_record.paths.install_root.clone();

        if manifest.entrypoint_path.is_empty() {
            self.warnings.emit(
                Warning::InvalidManifest,
                fields([("reason", "entrypoint_missing")]),
            );
            return Err(Abort::new(CriticalError::EntrypointNotFound));
        }
        if is_absolute_path(&manifest.entrypoint_path) {
            self.warnings.emit(
                Warning::InvalidManifest,
                fields([("reason", "entrypoint_absolute")]),
            );
            return Err(Abort::new(CriticalError::EntrypointNotFound));
        }

        let entrypoint =
            normalize_under_root(&self.contract.app.root, &manifest.entrypoint_path, false)
                .map_err(|_| {
                    Abort::with_context(
                        CriticalError::PathTraversal,
                        format!(
                            "entrypoint '{}' escapes app root '{}'",
                            manifest.entrypoint_path, self.contract.app.root
                        ),
                    )
                })?;

        if !Path::new(&entrypoint).is_file() {
            return Err(Abort::with_context(
                CriticalError::EntrypointNotFound,
                format!("entrypoint '{entrypoint}' does not exist"),
            ));
        }

        self.contract.app.entrypoint = entrypoint;
        Ok(())
    }

    // Step 4: a NAK-dependent app without a usable version requirement is
    // suspicious but survivable.
    fn check_nak_requirement(&mut self) {
        let manifest = &self.inputs.manifest;
        if !manifest.is_standalone() && parse_requirement(&manifest.nak_version_req).is_none() {
            self.warnings.emit(
                Warning::InvalidManifest,
                fields([("reason", "nak_version_req_invalid")]),
            );
        }
    }

    // Step 5: NAK identity and path security. Every lib_dir and loader
    // exec_path must be absolute and inside the NAK root.
    fn derive_nak_facts(&mut self) -> StepResult {
        let Some(nak) = &self.nak else {
            return Ok(());
        };

        self.contract.nak.id = nak.nak.id.clone();
        self.contract.nak.version = nak.nak.version.clone();
        self.contract.nak.root = nak.paths.root.clone();
        self.contract.nak.resource_root = nak.effective_resource_root().to_string();
        self.contract.nak.record_ref = self.pin.record_ref.clone();

        for lib_dir in &nak.paths.lib_dirs {
            if !is_absolute_path(lib_dir) {
                return Err(Abort::with_context(
                    CriticalError::PathTraversal,
                    format!("NAK lib_dir '{lib_dir}' is not absolute"),
                ));
            }
            if !is_path_under_root(&nak.paths.root, lib_dir) {
                return Err(Abort::with_context(
                    CriticalError::PathTraversal,
                    format!(
                        "NAK lib_dir '{lib_dir}' escapes NAK root '{}'",
                        nak.paths.root
                    ),
                ));
            }
        }

        for (name, loader) in &nak.loaders {
            if !is_absolute_path(&loader.exec_path) {
                return Err(Abort::with_context(
                    CriticalError::PathTraversal,
                    format!("NAK loader '{name}' exec_path '{}' is not absolute", loader.exec_path),
                ));
            }
            if !is_path_under_root(&nak.paths.root, &loader.exec_path) {
                return Err(Abort::with_context(
                    CriticalError::PathTraversal,
                    format!(
                        "NAK loader '{name}' exec_path '{}' escapes NAK root '{}'",
                        loader.exec_path, nak.paths.root
                    ),
                ));
            }
        }

        Ok(())
    }

    // Step 6: the seven-layer environment algebra.
    fn build_environment(&mut self) {
        let inputs = self.inputs;

        // Layer 1: host profile.
        self.apply_env_layer(&inputs.profile.environment, "profile", "host_profile", 1);

        // Layer 2: NAK install record.
        if let Some(nak) = self.nak.clone() {
            let record_ref = self.pin.record_ref.clone();
            self.apply_env_layer(&nak.environment, "nak", &record_ref, 2);
        }

        // Layer 3: manifest KEY=VALUE defaults, fill-only.
        for entry in &inputs.manifest.env_defaults {
            let Some((key, value)) = entry.split_once('=') else {
                continue;
            };
            let accepted = !self.env.contains_key(key);
            if accepted {
                self.env.insert(key.to_string(), value.to_string());
            }
            self.record_contribution(key, value, "manifest", "app_manifest", 3, EnvOp::Set, accepted);
        }

        // Layer 4: install-record overrides.
        self.apply_env_layer(
            &inputs.install_record.overrides.environment,
            "install_override",
            &inputs.install_record.source_path,
            4,
        );

        // Layer 5: NAH standard variables, unconditional.
        let standard = [
            ("NAH_APP_ID", self.contract.app.id.clone()),
            ("NAH_APP_VERSION", self.contract.app.version.clone()),
            ("NAH_APP_ROOT", self.contract.app.root.clone()),
            ("NAH_APP_ENTRY", self.contract.app.entrypoint.clone()),
        ];
        for (key, value) in standard {
            self.env.insert(key.to_string(), value.clone());
            self.record_contribution(key, &value, "nah_standard", "nah", 5, EnvOp::Set, true);
        }
        if self.nak.is_some() {
            let nak_vars = [
                ("NAH_NAK_ID", self.contract.nak.id.clone()),
                ("NAH_NAK_VERSION", self.contract.nak.version.clone()),
                ("NAH_NAK_ROOT", self.contract.nak.root.clone()),
            ];
            for (key, value) in nak_vars {
                self.env.insert(key.to_string(), value.clone());
                self.record_contribution(key, &value, "nah_standard", "nah", 5, EnvOp::Set, true);
            }
        }

        // Layer 6: process-environment overrides, lexicographic key order.
        self.apply_process_overrides();

        // Layer 7: the overrides file.
        self.apply_overrides_file();
    }

    /// Apply one env-op layer and record its contributions.
    fn apply_env_layer(
        &mut self,
        entries: &BTreeMap<String, EnvValue>,
        source_kind: &str,
        source_path: &str,
        rank: u8,
    ) {
        for (key, env_value) in entries {
            match apply_env_op(self.env.get(key).map(String::as_str), env_value) {
                Some(new_value) => {
                    self.env.insert(key.clone(), new_value.clone());
                    self.record_contribution(
                        key, &new_value, source_kind, source_path, rank, env_value.op, true,
                    );
                }
                None => {
                    self.env.remove(key);
                    self.record_contribution(
                        key, "", source_kind, source_path, rank, env_value.op, true,
                    );
                }
            }
        }
    }

    /// Layer 6: `NAH_OVERRIDE_*` process-environment variables.
    fn apply_process_overrides(&mut self) {
        // BTreeMap iteration is lexicographic, which is exactly the
        // required application order.
        let overrides: Vec<(String, String)> = self
            .inputs
            .process_env
            .iter()
            .filter(|(key, _)| key.starts_with("NAH_OVERRIDE_"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (key, value) in overrides {
            let target = &key["NAH_OVERRIDE_".len()..];

            if target == "ENVIRONMENT" {
                if !is_override_permitted(target, &self.inputs.profile) {
                    self.emit_override_denied(&key, "process_env", &key);
                    continue;
                }
                match parse_json_string_object(&value) {
                    Some(entries) => {
                        for (k, v) in entries {
                            self.env.insert(k.clone(), v.clone());
                            self.record_contribution(
                                &k, &v, "process_env", &key, 6, EnvOp::Set, true,
                            );
                        }
                    }
                    None => {
                        self.emit_override_invalid(&key, "parse_failure", "process_env", &key);
                    }
                }
            } else if let Some(warning_key) = target.strip_prefix("WARNINGS_") {
                if !is_override_permitted(target, &self.inputs.profile) {
                    self.emit_override_denied(&key, "process_env", &key);
                    continue;
                }
                self.apply_warning_override(&key, warning_key, &value, "process_env", &key);
            } else {
                // Unknown override target: always denied.
                self.emit_override_denied(&key, "process_env", &key);
            }
        }
    }

    /// Layer 7: the overrides file, same gate as layer 6.
    fn apply_overrides_file(&mut self) {
        let Some(path) = &self.inputs.overrides_file else {
            return;
        };
        let path_str = path.display().to_string();

        let content = match fs::read_to_string(path) {
            Ok(content) if !content.is_empty() => content,
            _ => {
                self.emit_override_invalid(
                    "OVERRIDES_FILE",
                    "parse_failure",
                    "overrides_file",
                    &path_str,
                );
                return;
            }
        };

        let overrides = match parse_overrides_file(&content) {
            Ok(overrides) => overrides,
            Err(reason) => {
                self.emit_override_invalid("OVERRIDES_FILE", reason, "overrides_file", &path_str);
                return;
            }
        };

        if !overrides.environment.is_empty() {
            if !is_override_permitted("ENVIRONMENT", &self.inputs.profile) {
                self.emit_override_denied(
                    "NAH_OVERRIDE_ENVIRONMENT",
                    "overrides_file",
                    &format!("{path_str}:environment"),
                );
            } else {
                let source_path = format!("{path_str}:environment");
                for (k, v) in &overrides.environment {
                    self.env.insert(k.clone(), v.clone());
                    self.record_contribution(
                        k, v, "overrides_file", &source_path, 7, EnvOp::Set, true,
                    );
                }
            }
        }

        // BTreeMap iteration applies warning keys in lexicographic order.
        for (warning_key, action) in &overrides.warnings {
            let target = format!("WARNINGS_{warning_key}");
            let source_ref = format!("{path_str}:warnings.{warning_key}");
            let label = format!("NAH_OVERRIDE_WARNINGS_{warning_key}");

            if !is_override_permitted(&target, &self.inputs.profile) {
                self.emit_override_denied(&label, "overrides_file", &source_ref);
                continue;
            }
            self.apply_warning_override(&label, warning_key, action, "overrides_file", &source_ref);
        }
    }

    /// Validate and register one warning-policy override.
    fn apply_warning_override(
        &mut self,
        label: &str,
        warning_key: &str,
        action_value: &str,
        source_kind: &str,
        source_ref: &str,
    ) {
        let Some(action) = WarningAction::parse(action_value) else {
            self.emit_override_invalid(label, "invalid_value", source_kind, source_ref);
            return;
        };
        if Warning::parse(warning_key).is_none() {
            self.emit_override_invalid(label, "unknown_warning_key", source_kind, source_ref);
            return;
        }
        self.warnings.apply_override(warning_key, action);
    }

    fn emit_override_denied(&mut self, target: &str, source_kind: &str, source_ref: &str) {
        tracing::warn!("override denied: {target} from {source_kind}");
        self.warnings.emit(
            Warning::OverrideDenied,
            fields([
                ("target", target),
                ("source_kind", source_kind),
                ("source_ref", source_ref),
            ]),
        );
    }

    fn emit_override_invalid(
        &mut self,
        target: &str,
        reason: &str,
        source_kind: &str,
        source_ref: &str,
    ) {
        self.warnings.emit(
            Warning::OverrideInvalid,
            fields([
                ("target", target),
                ("reason", reason),
                ("source_kind", source_kind),
                ("source_ref", source_ref),
            ]),
        );
    }

    // Step 7: expand the frozen environment, then every template that reads
    // it. Missing names fall back to the process-environment snapshot.
    fn expand_everything(&mut self) {
        expand_environment_map(&mut self.env, Some(&self.inputs.process_env), &mut self.warnings);

        let env = self.env.clone();
        let expander = Expander::new(&env, Some(&self.inputs.process_env));

        if let Some(nak) = &self.nak {
            if nak.has_loaders() {
                let pinned = &self.inputs.install_record.nak.loader;
                let chosen = if !pinned.is_empty() {
                    Some(pinned.clone())
                } else if nak.loaders.contains_key("default") {
                    Some("default".to_string())
                } else if nak.loaders.len() == 1 {
                    nak.loaders.keys().next().cloned()
                } else {
                    None
                };

                if let Some(name) = &chosen {
                    if let Some(loader) = nak.loaders.get(name) {
                        self.loader_args = expander.expand_list(
                            &loader.args_template,
                            &format!("nak_record.loaders.{name}.args_template"),
                            &mut self.warnings,
                        );
                    }
                }
                self.loader_name = chosen;
            }

            if let Some(execution) = &nak.execution {
                if !execution.cwd.is_empty() {
                    self.expanded_cwd = expander
                        .expand(&execution.cwd, "nak_record.execution.cwd", &mut self.warnings)
                        .value;
                }
            }
        }

        self.lib_prepend = expander.expand_list(
            &self.inputs.profile.paths.library_prepend,
            "profile.paths.library_prepend",
            &mut self.warnings,
        );
        self.lib_append = expander.expand_list(
            &self.inputs.profile.paths.library_append,
            "profile.paths.library_append",
            &mut self.warnings,
        );

        let overrides = &self.inputs.install_record.overrides;
        self.override_lib_prepend = expander.expand_list(
            &overrides.paths.library_prepend,
            "install_record.overrides.paths.library_prepend",
            &mut self.warnings,
        );
        self.override_args_prepend = expander.expand_list(
            &overrides.arguments.prepend,
            "install_record.overrides.arguments.prepend",
            &mut self.warnings,
        );
        self.override_args_append = expander.expand_list(
            &overrides.arguments.append,
            "install_record.overrides.arguments.append",
            &mut self.warnings,
        );

        self.entry_args = expander.expand_list(
            &self.inputs.manifest.entrypoint_args,
            "manifest.entrypoint_args",
            &mut self.warnings,
        );
    }

    // Step 8: capabilities and enforcement.
    fn derive_capabilities(&mut self) {
        let enforcement = derive_enforcement(
            &self.inputs.manifest.permissions_filesystem,
            &self.inputs.manifest.permissions_network,
            &self.inputs.profile,
            &mut self.warnings,
        );
        self.contract.enforcement.filesystem = enforcement.filesystem;
        self.contract.enforcement.network = enforcement.network;
        self.contract.capability_usage = enforcement.capability_usage;
    }

    // Step 9: the execution binary and stitched argument list.
    fn choose_binary(&mut self) -> StepResult {
        match &self.nak {
            Some(nak) if nak.has_loaders() => match &self.loader_name {
                Some(name) => match nak.loaders.get(name) {
                    Some(loader) => {
                        self.contract.execution.binary = loader.exec_path.clone();
                        self.contract.execution.arguments = self.loader_args.clone();
                    }
                    None => {
                        self.warnings.emit(
                            Warning::NakLoaderMissing,
                            fields([
                                ("requested", name.as_str()),
                                ("reason", "loader not found in NAK"),
                            ]),
                        );
                        return Err(Abort::with_context(
                            CriticalError::NakLoaderInvalid,
                            format!("pinned loader '{name}' not present in NAK"),
                        ));
                    }
                },
                None => {
                    // Multiple loaders, no pin, no default: fall back to
                    // the app's own entrypoint.
                    self.warnings.emit(
                        Warning::NakLoaderRequired,
                        fields([(
                            "reason",
                            "NAK has multiple loaders but none was pinned or named default",
                        )]),
                    );
                    self.contract.execution.binary = self.contract.app.entrypoint.clone();
                }
            },
            // Standalone app, libs-only NAK, or unresolved NAK.
            _ => {
                self.contract.execution.binary = self.contract.app.entrypoint.clone();
            }
        }

        let arguments = &mut self.contract.execution.arguments;
        arguments.splice(0..0, self.override_args_prepend.iter().cloned());
        arguments.extend(self.entry_args.iter().cloned());
        arguments.extend(self.override_args_append.iter().cloned());
        Ok(())
    }

    // Step 10: working directory.
    fn choose_cwd(&mut self) -> StepResult {
        if let Some(nak) = &self.nak {
            if !self.expanded_cwd.is_empty() {
                if is_absolute_path(&self.expanded_cwd) {
                    self.contract.execution.cwd = self.expanded_cwd.clone();
                } else {
                    self.contract.execution.cwd =
                        normalize_under_root(&nak.paths.root, &self.expanded_cwd, false).map_err(
                            |_| {
                                Abort::with_context(
                                    CriticalError::PathTraversal,
                                    format!(
                                        "execution.cwd '{}' escapes NAK root '{}'",
                                        self.expanded_cwd, nak.paths.root
                                    ),
                                )
                            },
                        )?;
                }
                return Ok(());
            }
        }
        self.contract.execution.cwd = self.contract.app.root.clone();
        Ok(())
    }

    // Steps 11–12: the library path list, in fixed assembly order.
    fn assemble_library_paths(&mut self) -> StepResult {
        self.contract.execution.library_path_env_key = library_path_env_key().to_string();

        let mut paths: Vec<String> = Vec::new();

        let prepend = self.lib_prepend.clone();
        self.push_absolute_only(&mut paths, &prepend, "profile.paths.library_prepend");
        let override_prepend = self.override_lib_prepend.clone();
        self.push_absolute_only(
            &mut paths,
            &override_prepend,
            "install_record.overrides.paths.library_prepend",
        );

        // NAK lib_dirs were verified under the NAK root in step 5.
        if let Some(nak) = &self.nak {
            paths.extend(nak.paths.lib_dirs.iter().cloned());
        }

        for lib_dir in &self.inputs.manifest.lib_dirs {
            if is_absolute_path(lib_dir) {
                self.warnings.emit(
                    Warning::InvalidManifest,
                    fields([("reason", "lib_dir_absolute")]),
                );
                continue;
            }
            let resolved = normalize_under_root(&self.contract.app.root, lib_dir, false)
                .map_err(|_| {
                    Abort::with_context(
                        CriticalError::PathTraversal,
                        format!(
                            "manifest lib_dir '{lib_dir}' escapes app root '{}'",
                            self.contract.app.root
                        ),
                    )
                })?;
            paths.push(resolved);
        }

        let append = self.lib_append.clone();
        self.push_absolute_only(&mut paths, &append, "profile.paths.library_append");

        self.contract.execution.library_paths = paths;
        Ok(())
    }

    /// Host-supplied library paths must already be absolute; anything else
    /// is skipped with a warning.
    fn push_absolute_only(&mut self, out: &mut Vec<String>, paths: &[String], source_path: &str) {
        for path in paths {
            if !is_absolute_path(path) {
                self.warnings.emit(
                    Warning::InvalidLibraryPath,
                    fields([("value", path.as_str()), ("source_path", source_path)]),
                );
                continue;
            }
            out.push(path.clone());
        }
    }

    // Step 12: asset exports; later duplicate ids overwrite earlier ones.
    fn resolve_exports(&mut self) -> StepResult {
        for export in &self.inputs.manifest.asset_exports {
            if is_absolute_path(&export.path) {
                self.warnings.emit(
                    Warning::InvalidManifest,
                    fields([("reason", "asset_export_absolute")]),
                );
                continue;
            }
            let resolved = normalize_under_root(&self.contract.app.root, &export.path, false)
                .map_err(|_| {
                    Abort::with_context(
                        CriticalError::PathTraversal,
                        format!(
                            "asset export '{}' path '{}' escapes app root '{}'",
                            export.id, export.path, self.contract.app.root
                        ),
                    )
                })?;

            self.contract.exports.insert(
                export.id.clone(),
                crate::envelope::ResolvedExport {
                    id: export.id.clone(),
                    path: resolved,
                    kind: export.kind.clone(),
                },
            );
        }
        Ok(())
    }

    // Step 13: trust evaluation.
    fn evaluate_trust(&mut self) {
        let trust = &self.inputs.install_record.trust;
        self.contract.trust = trust.clone();

        if trust.is_absent() {
            self.contract.trust.state = TrustState::Unknown;
            self.warnings.emit(Warning::TrustStateUnknown, BTreeMap::new());
        } else {
            match trust.state {
                TrustState::Verified => {}
                TrustState::Unverified => {
                    self.warnings.emit(Warning::TrustStateUnverified, BTreeMap::new());
                }
                TrustState::Failed => {
                    self.warnings.emit(Warning::TrustStateFailed, BTreeMap::new());
                }
                TrustState::Unknown => {
                    self.warnings.emit(Warning::TrustStateUnknown, BTreeMap::new());
                }
            }
        }

        if !trust.expires_at.is_empty()
            && !self.inputs.now.is_empty()
            && timestamp_before(&trust.expires_at, &self.inputs.now)
        {
            self.warnings.emit(Warning::TrustStateStale, BTreeMap::new());
        }
    }

    fn record_contribution(
        &mut self,
        key: &str,
        value: &str,
        source_kind: &str,
        source_path: &str,
        rank: u8,
        operation: EnvOp,
        accepted: bool,
    ) {
        if !self.inputs.trace {
            return;
        }
        self.env_history
            .entry(key.to_string())
            .or_default()
            .push(TraceContribution {
                value: value.to_string(),
                source_kind: source_kind.to_string(),
                source_path: source_path.to_string(),
                precedence_rank: rank,
                operation,
                accepted,
            });
    }

    /// Per-key provenance: the final value, the winning contributor (the
    /// last accepted write), and the full history.
    fn build_trace(&self) -> Trace {
        let mut entries: BTreeMap<String, TraceEntry> = BTreeMap::new();
        for (key, history) in &self.env_history {
            let mut entry = TraceEntry {
                value: self
                    .contract
                    .environment
                    .get(key)
                    .cloned()
                    .unwrap_or_default(),
                ..TraceEntry::default()
            };
            if let Some(winner) = history.iter().rev().find(|c| c.accepted) {
                entry.source_kind = winner.source_kind.clone();
                entry.source_path = winner.source_path.clone();
                entry.precedence_rank = winner.precedence_rank;
            }
            entry.history = history.clone();
            entries.insert(key.clone(), entry);
        }

        let mut trace = Trace::new();
        trace.insert("environment".to_string(), entries);
        trace
    }
}

/// Apply one environment operation against the current value of its key.
/// `None` means the key is removed.
fn apply_env_op(current: Option<&str>, env_value: &EnvValue) -> Option<String> {
    match env_value.op {
        EnvOp::Set => Some(env_value.value.clone()),
        EnvOp::Prepend => match current {
            Some(existing) if !existing.is_empty() => Some(format!(
                "{}{}{}",
                env_value.value, env_value.separator, existing
            )),
            _ => Some(env_value.value.clone()),
        },
        EnvOp::Append => match current {
            Some(existing) if !existing.is_empty() => Some(format!(
                "{}{}{}",
                existing, env_value.separator, env_value.value
            )),
            _ => Some(env_value.value.clone()),
        },
        EnvOp::Unset => None,
    }
}

/// Normalize a trailing `+00:00` / `-00:00` offset to `Z` so RFC3339 UTC
/// timestamps compare lexicographically.
fn normalize_rfc3339(timestamp: &str) -> String {
    if let Some(stripped) = timestamp
        .strip_suffix("+00:00")
        .or_else(|| timestamp.strip_suffix("-00:00"))
    {
        return format!("{stripped}Z");
    }
    timestamp.to_string()
}

/// Is timestamp `a` strictly before timestamp `b`?
fn timestamp_before(a: &str, b: &str) -> bool {
    normalize_rfc3339(a) < normalize_rfc3339(b)
}

/// Parse a JSON object of string values; `None` on any other shape.
/// Non-string member values are skipped.
fn parse_json_string_object(content: &str) -> Option<BTreeMap<String, String>> {
    let value: serde_json::Value = serde_json::from_str(content).ok()?;
    let object = value.as_object()?;
    Some(
        object
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_ops_behave_like_set_on_unset_keys() {
        let prepend = EnvValue::with_op(EnvOp::Prepend, "/a");
        assert_eq!(apply_env_op(None, &prepend), Some("/a".to_string()));

        let append = EnvValue::with_op(EnvOp::Append, "/b");
        assert_eq!(apply_env_op(None, &append), Some("/b".to_string()));
    }

    #[test]
    fn env_ops_join_with_separator() {
        let prepend = EnvValue::with_op(EnvOp::Prepend, "/a");
        assert_eq!(
            apply_env_op(Some("/zed"), &prepend),
            Some("/a:/zed".to_string())
        );

        let append = EnvValue::with_op(EnvOp::Append, "/b");
        assert_eq!(
            apply_env_op(Some("/zed"), &append),
            Some("/zed:/b".to_string())
        );

        let unset = EnvValue::with_op(EnvOp::Unset, "");
        assert_eq!(apply_env_op(Some("/zed"), &unset), None);
    }

    #[test]
    fn timestamps_compare_after_offset_normalization() {
        assert!(timestamp_before(
            "2020-01-01T00:00:00Z",
            "2024-01-01T00:00:00Z"
        ));
        assert!(!timestamp_before(
            "2024-01-01T00:00:00Z",
            "2020-01-01T00:00:00Z"
        ));
        // +00:00 and Z are the same instant.
        assert!(!timestamp_before(
            "2024-01-01T00:00:00+00:00",
            "2024-01-01T00:00:00Z"
        ));
        assert!(timestamp_before(
            "2024-01-01T00:00:00+00:00",
            "2024-01-01T00:00:01Z"
        ));
    }

    #[test]
    fn overrides_file_shape_is_strict() {
        let ok = parse_overrides_file(
            r#"{"environment": {"A": "1"}, "warnings": {"nak_not_found": "ignore"}}"#,
        )
        .unwrap();
        assert_eq!(ok.environment.get("A").unwrap(), "1");
        assert_eq!(ok.warnings.get("nak_not_found").unwrap(), "ignore");

        assert_eq!(parse_overrides_file("not json"), Err("parse_failure"));
        assert_eq!(parse_overrides_file("[1, 2]"), Err("invalid_shape"));
        assert_eq!(
            parse_overrides_file(r#"{"extra": {}}"#),
            Err("invalid_shape")
        );
        assert_eq!(
            parse_overrides_file(r#"{"environment": {"A": 1}}"#),
            Err("invalid_shape")
        );
        assert_eq!(
            parse_overrides_file(r#"{"environment": "nope"}"#),
            Err("invalid_shape")
        );
    }

    #[test]
    fn json_string_object_filters_non_strings() {
        let parsed = parse_json_string_object(r#"{"A": "1", "B": 2}"#).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed.get("A").unwrap(), "1");

        assert!(parse_json_string_object("[]").is_none());
        assert!(parse_json_string_object("garbage").is_none());
    }

    #[test]
    fn timestamp_helper_produces_rfc3339_utc() {
        let now = current_timestamp();
        assert!(now.ends_with('Z'));
        assert_eq!(now.len(), "2026-01-01T00:00:00Z".len());
    }
}
