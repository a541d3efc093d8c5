// resolve.rs — NAK selection and pin revalidation.
//
// Two moments touch the registry. At install time, select_nak_for_install
// picks the version to pin from whatever the registry scanner found. At
// launch time, load_pinned_nak re-reads the pinned record and re-checks
// every assumption the pin was made under — identity, version, requirement,
// host policy — because records and profiles can change between install and
// launch.
//
// Nothing here is fatal. An app whose NAK cannot be resolved still gets a
// contract and runs its own entrypoint directly (libs-only and standalone
// apps depend on exactly that).

use std::path::Path;

use nah_records::{
    load_nak_install_record, validate_nak_install_record, version_allowed_by_profile, HostProfile,
    Manifest, NakInstallRecord, RecordError,
};
use nah_semver::{parse_requirement, parse_version, satisfies, Requirement};

use crate::warnings::{fields, Warning, WarningCollector};

/// One entry the registry scanner found: just enough to select without
/// loading every record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NakRegistryEntry {
    pub id: String,
    pub version: String,
    /// Record file name, e.g. "lua@5.4.6.json".
    pub record_ref: String,
    /// Absolute path to the record file.
    pub record_path: String,
}

/// An app's binding to one specific NAK install record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NakPin {
    pub id: String,
    pub version: String,
    pub record_ref: String,
}

/// Outcome of install-time selection.
#[derive(Debug, Clone, Default)]
pub struct NakSelection {
    /// The chosen pin, or `None` when nothing qualified.
    pub pin: Option<NakPin>,
    /// Audit-only note on how the choice was made.
    pub selection_reason: String,
}

/// Select the NAK to pin for `manifest` at install time.
///
/// Filters the registry to the manifest's NAK id, drops versions the
/// profile forbids or the requirement rejects, then applies the binding
/// mode: Mapped looks the requirement's selection key up in
/// `profile.nak.map` and insists the mapped record survived filtering;
/// Canonical takes the highest satisfying version.
pub fn select_nak_for_install(
    manifest: &Manifest,
    profile: &HostProfile,
    registry: &[NakRegistryEntry],
    warnings: &mut WarningCollector,
) -> NakSelection {
    let unresolved = NakSelection::default();

    let Some(requirement) = parse_requirement(&manifest.nak_version_req) else {
        warnings.emit(
            Warning::InvalidManifest,
            fields([("reason", "nak_version_req_invalid")]),
        );
        return unresolved;
    };

    let same_id: Vec<&NakRegistryEntry> = registry
        .iter()
        .filter(|entry| entry.id == manifest.nak_id)
        .collect();
    if same_id.is_empty() {
        warnings.emit(
            Warning::NakNotFound,
            fields([("nak_id", manifest.nak_id.as_str())]),
        );
        return unresolved;
    }

    let candidates: Vec<&NakRegistryEntry> = same_id
        .into_iter()
        .filter(|entry| {
            if !version_allowed_by_profile(&entry.version, profile) {
                return false;
            }
            match parse_version(&entry.version) {
                Some(version) => satisfies(version, &requirement),
                None => false,
            }
        })
        .collect();

    if candidates.is_empty() {
        warnings.emit(
            Warning::NakVersionUnsupported,
            fields([
                ("nak_id", manifest.nak_id.as_str()),
                ("nak_version_req", manifest.nak_version_req.as_str()),
            ]),
        );
        return unresolved;
    }

    let selected = match profile.nak.binding_mode {
        nah_records::BindingMode::Mapped => {
            let key = requirement.selection_key();
            let Some(mapped_ref) = profile.nak.map.get(&key) else {
                warnings.emit(
                    Warning::NakVersionUnsupported,
                    fields([
                        ("nak_id", manifest.nak_id.as_str()),
                        ("selection_key", key.as_str()),
                    ]),
                );
                return unresolved;
            };
            match candidates
                .iter()
                .find(|entry| &entry.record_ref == mapped_ref)
            {
                Some(entry) => *entry,
                None => {
                    warnings.emit(
                        Warning::NakVersionUnsupported,
                        fields([
                            ("nak_id", manifest.nak_id.as_str()),
                            ("reason", "mapped_record_not_found"),
                        ]),
                    );
                    return unresolved;
                }
            }
        }
        nah_records::BindingMode::Canonical => {
            match candidates.iter().max_by_key(|entry| {
                // Filtered above, so the version parses.
                parse_version(&entry.version)
            }) {
                Some(entry) => *entry,
                None => return unresolved,
            }
        }
    };

    tracing::debug!(
        "selected NAK {}@{} via {:?} binding",
        selected.id,
        selected.version,
        profile.nak.binding_mode
    );

    NakSelection {
        pin: Some(NakPin {
            id: selected.id.clone(),
            version: selected.version.clone(),
            record_ref: selected.record_ref.clone(),
        }),
        selection_reason: format!(
            "matched {}, allowed by profile",
            requirement.selection_key()
        ),
    }
}

/// Revalidate an already-pinned NAK at contract-build time.
///
/// Reads `<nah_root>/registry/naks/<record_ref>` and re-checks everything.
/// Any mismatch degrades to `None` plus a specific warning; composition
/// then falls back to running the app entrypoint directly.
pub fn load_pinned_nak(
    pin: &NakPin,
    manifest: &Manifest,
    profile: &HostProfile,
    nah_root: &str,
    warnings: &mut WarningCollector,
) -> Option<NakInstallRecord> {
    if pin.record_ref.is_empty() {
        warnings.emit(
            Warning::NakPinInvalid,
            fields([("reason", "record_ref_empty")]),
        );
        return None;
    }

    let record_path = Path::new(nah_root)
        .join("registry/naks")
        .join(&pin.record_ref);
    let record_path_str = record_path.display().to_string();

    let record = match load_nak_install_record(&record_path) {
        Ok(parsed) => parsed.record,
        Err(RecordError::Io { .. }) => {
            tracing::warn!("pinned NAK record unreadable: {record_path_str}");
            warnings.emit(
                Warning::NakPinInvalid,
                fields([
                    ("reason", "record_not_found"),
                    ("path", record_path_str.as_str()),
                ]),
            );
            return None;
        }
        Err(err) => {
            warnings.emit(
                Warning::NakPinInvalid,
                fields([("reason", "parse_error"), ("error", &err.to_string())]),
            );
            return None;
        }
    };

    if let Err(err) = validate_nak_install_record(&record) {
        warnings.emit(
            Warning::NakPinInvalid,
            fields([("reason", "validation_failed"), ("error", &err.to_string())]),
        );
        return None;
    }

    if manifest.nak_id.is_empty() {
        warnings.emit(
            Warning::InvalidManifest,
            fields([("reason", "nak_id_missing")]),
        );
        return None;
    }

    if pin.id != record.nak.id || record.nak.id != manifest.nak_id {
        warnings.emit(
            Warning::NakVersionUnsupported,
            fields([
                ("reason", "id_mismatch"),
                ("pin_id", pin.id.as_str()),
                ("record_id", record.nak.id.as_str()),
                ("manifest_nak_id", manifest.nak_id.as_str()),
            ]),
        );
        return None;
    }

    if pin.version != record.nak.version {
        warnings.emit(
            Warning::NakPinInvalid,
            fields([
                ("reason", "version_mismatch"),
                ("pin_version", pin.version.as_str()),
                ("record_version", record.nak.version.as_str()),
            ]),
        );
        return None;
    }

    let Some(record_version) = parse_version(&record.nak.version) else {
        warnings.emit(
            Warning::NakPinInvalid,
            fields([
                ("reason", "invalid_version"),
                ("version", record.nak.version.as_str()),
            ]),
        );
        return None;
    };

    let requirement: Requirement = match parse_requirement(&manifest.nak_version_req) {
        Some(requirement) => requirement,
        None => {
            warnings.emit(
                Warning::InvalidManifest,
                fields([("reason", "nak_version_req_invalid")]),
            );
            return None;
        }
    };

    if !satisfies(record_version, &requirement) {
        warnings.emit(
            Warning::NakVersionUnsupported,
            fields([
                ("reason", "requirement_not_satisfied"),
                ("version", record.nak.version.as_str()),
                ("requirement", manifest.nak_version_req.as_str()),
            ]),
        );
        return None;
    }

    if !version_allowed_by_profile(&record.nak.version, profile) {
        warnings.emit(
            Warning::NakVersionUnsupported,
            fields([
                ("reason", "denied_by_profile"),
                ("version", record.nak.version.as_str()),
            ]),
        );
        return None;
    }

    tracing::debug!("pinned NAK {}@{} revalidated", record.nak.id, record.nak.version);
    Some(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nah_records::{builtin_empty_profile, BindingMode};

    fn entry(id: &str, version: &str) -> NakRegistryEntry {
        NakRegistryEntry {
            id: id.to_string(),
            version: version.to_string(),
            record_ref: format!("{id}@{version}.json"),
            record_path: format!("/nah/registry/naks/{id}@{version}.json"),
        }
    }

    fn lua_manifest(req: &str) -> Manifest {
        Manifest {
            id: "com.example.game".into(),
            version: "1.0.0".into(),
            nak_id: "lua".into(),
            nak_version_req: req.into(),
            entrypoint_path: "scripts/main.lua".into(),
            ..Manifest::default()
        }
    }

    #[test]
    fn canonical_mode_picks_highest_satisfying() {
        let registry = [
            entry("lua", "5.3.6"),
            entry("lua", "5.4.2"),
            entry("lua", "5.4.6"),
            entry("lua", "6.0.0"),
            entry("node", "20.11.0"),
        ];
        let profile = builtin_empty_profile();
        let mut w = WarningCollector::new();

        let selection =
            select_nak_for_install(&lua_manifest("^5.4.0"), &profile, &registry, &mut w);
        let pin = selection.pin.unwrap();
        assert_eq!(pin.version, "5.4.6");
        assert_eq!(pin.record_ref, "lua@5.4.6.json");
        assert!(w.warnings().is_empty());
    }

    #[test]
    fn deny_list_excludes_candidates() {
        let registry = [entry("lua", "5.4.2"), entry("lua", "5.4.6")];
        let mut profile = builtin_empty_profile();
        profile.nak.deny_versions = vec!["5.4.6".into()];
        let mut w = WarningCollector::new();

        let selection =
            select_nak_for_install(&lua_manifest("^5.4.0"), &profile, &registry, &mut w);
        assert_eq!(selection.pin.unwrap().version, "5.4.2");
    }

    #[test]
    fn unknown_id_warns_nak_not_found() {
        let registry = [entry("node", "20.11.0")];
        let profile = builtin_empty_profile();
        let mut w = WarningCollector::new();

        let selection =
            select_nak_for_install(&lua_manifest("^5.4.0"), &profile, &registry, &mut w);
        assert!(selection.pin.is_none());
        assert_eq!(w.warnings()[0].key, "nak_not_found");
    }

    #[test]
    fn unsatisfiable_requirement_warns_version_unsupported() {
        let registry = [entry("lua", "5.3.6")];
        let profile = builtin_empty_profile();
        let mut w = WarningCollector::new();

        let selection =
            select_nak_for_install(&lua_manifest("^5.4.0"), &profile, &registry, &mut w);
        assert!(selection.pin.is_none());
        assert_eq!(w.warnings()[0].key, "nak_version_unsupported");
    }

    #[test]
    fn invalid_requirement_warns_invalid_manifest() {
        let registry = [entry("lua", "5.4.6")];
        let profile = builtin_empty_profile();
        let mut w = WarningCollector::new();

        let selection =
            select_nak_for_install(&lua_manifest("not-a-range"), &profile, &registry, &mut w);
        assert!(selection.pin.is_none());
        assert_eq!(w.warnings()[0].key, "invalid_manifest");
    }

    #[test]
    fn mapped_mode_follows_profile_map() {
        let registry = [entry("lua", "5.4.2"), entry("lua", "5.4.6")];
        let mut profile = builtin_empty_profile();
        profile.nak.binding_mode = BindingMode::Mapped;
        profile
            .nak
            .map
            .insert("5.4".into(), "lua@5.4.2.json".into());
        let mut w = WarningCollector::new();

        let selection =
            select_nak_for_install(&lua_manifest("^5.4.0"), &profile, &registry, &mut w);
        // Mapped mode honors the operator's choice, not the highest version.
        assert_eq!(selection.pin.unwrap().version, "5.4.2");
    }

    #[test]
    fn mapped_mode_misses_are_not_fatal() {
        let registry = [entry("lua", "5.4.6")];
        let mut profile = builtin_empty_profile();
        profile.nak.binding_mode = BindingMode::Mapped;
        let mut w = WarningCollector::new();

        // No map entry for "5.4" at all.
        let selection =
            select_nak_for_install(&lua_manifest("^5.4.0"), &profile, &registry, &mut w);
        assert!(selection.pin.is_none());
        assert_eq!(w.warnings()[0].key, "nak_version_unsupported");

        // Map points at a record that didn't survive filtering.
        profile.nak.map.insert("5.4".into(), "lua@9.9.9.json".into());
        let mut w = WarningCollector::new();
        let selection =
            select_nak_for_install(&lua_manifest("^5.4.0"), &profile, &registry, &mut w);
        assert!(selection.pin.is_none());
        assert_eq!(
            w.warnings()[0].fields.get("reason").unwrap(),
            "mapped_record_not_found"
        );
    }

    #[test]
    fn empty_pin_record_ref_is_invalid() {
        let profile = builtin_empty_profile();
        let mut w = WarningCollector::new();

        let loaded = load_pinned_nak(
            &NakPin::default(),
            &lua_manifest("^5.4.0"),
            &profile,
            "/nonexistent",
            &mut w,
        );
        assert!(loaded.is_none());
        assert_eq!(
            w.warnings()[0].fields.get("reason").unwrap(),
            "record_ref_empty"
        );
    }

    #[test]
    fn missing_record_file_degrades_to_unresolved() {
        let profile = builtin_empty_profile();
        let mut w = WarningCollector::new();

        let pin = NakPin {
            id: "lua".into(),
            version: "5.4.6".into(),
            record_ref: "lua@5.4.6.json".into(),
        };
        let loaded = load_pinned_nak(
            &pin,
            &lua_manifest("^5.4.0"),
            &profile,
            "/definitely/not/here",
            &mut w,
        );
        assert!(loaded.is_none());
        assert_eq!(
            w.warnings()[0].fields.get("reason").unwrap(),
            "record_not_found"
        );
    }
}
