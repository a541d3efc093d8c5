// capability.rs — Permission parsing and enforcement derivation.
//
// Manifest permissions are `operation:selector` strings. The operation maps
// to a fixed capability domain (filesystem or network); the host profile
// then maps capability keys to its own enforcement identifiers. A permission
// the profile cannot enforce is requested-but-unenforceable: reported, not
// fatal.

use nah_records::HostProfile;

use crate::warnings::{fields, Warning, WarningCollector};

/// A permission normalized into capability form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capability {
    /// Capability key, e.g. `filesystem.read`; a raw operation string for
    /// unknown operations; empty for malformed permissions.
    pub key: String,
    /// The operation as declared (`read`, `connect`, ...).
    pub operation: String,
    /// The resource selector after the first colon, opaque to the engine.
    pub selector: String,
}

impl Capability {
    /// The full capability string recorded in `capability_usage`:
    /// `key[:selector]`.
    pub fn full(&self) -> String {
        if self.selector.is_empty() {
            self.key.clone()
        } else {
            format!("{}:{}", self.key, self.selector)
        }
    }
}

/// Derived enforcement for one app.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnforcementSet {
    /// Host enforcement ids for filesystem capabilities, in declared order.
    pub filesystem: Vec<String>,
    /// Host enforcement ids for network capabilities, in declared order.
    pub network: Vec<String>,
    pub capability_usage: CapabilityUsage,
}

/// What the app asked for, independent of what the host can enforce.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityUsage {
    /// True iff the manifest declared any permission at all.
    pub present: bool,
    /// Full capability strings in manifest declaration order, filesystem
    /// entries before network entries.
    pub required_capabilities: Vec<String>,
    /// Reserved; always empty in v1.
    pub optional_capabilities: Vec<String>,
    /// Reserved; always empty in v1.
    pub critical_capabilities: Vec<String>,
}

/// Map one permission string to a capability.
///
/// No colon at all is malformed (empty capability). An operation outside
/// the fixed filesystem/network sets passes through with its raw operation
/// as the key so hosts can still map vendor extensions.
pub fn derive_capability(permission: &str, warnings: &mut WarningCollector) -> Capability {
    let Some((operation, selector)) = permission.split_once(':') else {
        warnings.emit(
            Warning::CapabilityMalformed,
            fields([("permission", permission)]),
        );
        return Capability {
            key: permission.to_string(),
            ..Capability::default()
        };
    };

    let key = match operation {
        "read" | "write" | "execute" => format!("filesystem.{operation}"),
        "connect" | "listen" | "bind" => format!("network.{operation}"),
        other => {
            warnings.emit(Warning::CapabilityUnknown, fields([("operation", other)]));
            other.to_string()
        }
    };

    Capability {
        key,
        operation: operation.to_string(),
        selector: selector.to_string(),
    }
}

/// Derive the enforcement set from the manifest's permission lists.
///
/// Declaration order is preserved throughout: filesystem permissions first,
/// then network permissions, each in source order. A capability key missing
/// from the profile map emits `capability_missing` and contributes no
/// enforcement id.
pub fn derive_enforcement(
    filesystem_permissions: &[String],
    network_permissions: &[String],
    profile: &HostProfile,
    warnings: &mut WarningCollector,
) -> EnforcementSet {
    let mut result = EnforcementSet {
        capability_usage: CapabilityUsage {
            present: !filesystem_permissions.is_empty() || !network_permissions.is_empty(),
            ..CapabilityUsage::default()
        },
        ..EnforcementSet::default()
    };

    for (permissions, domain) in [
        (filesystem_permissions, Domain::Filesystem),
        (network_permissions, Domain::Network),
    ] {
        for permission in permissions {
            let capability = derive_capability(permission, warnings);
            result
                .capability_usage
                .required_capabilities
                .push(capability.full());

            match lookup_enforcement(&capability.key, profile) {
                Some(enforcement_id) => match domain {
                    Domain::Filesystem => result.filesystem.push(enforcement_id),
                    Domain::Network => result.network.push(enforcement_id),
                },
                None => {
                    warnings.emit(
                        Warning::CapabilityMissing,
                        fields([("capability", capability.key.as_str())]),
                    );
                }
            }
        }
    }

    result
}

enum Domain {
    Filesystem,
    Network,
}

fn lookup_enforcement(capability_key: &str, profile: &HostProfile) -> Option<String> {
    profile.capabilities.get(capability_key).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nah_records::builtin_empty_profile;

    fn profile_with(caps: &[(&str, &str)]) -> HostProfile {
        let mut profile = builtin_empty_profile();
        for (k, v) in caps {
            profile.capabilities.insert(k.to_string(), v.to_string());
        }
        profile
    }

    #[test]
    fn maps_filesystem_and_network_operations() {
        let mut w = WarningCollector::new();
        let cap = derive_capability("read:/data", &mut w);
        assert_eq!(cap.key, "filesystem.read");
        assert_eq!(cap.selector, "/data");
        assert_eq!(cap.full(), "filesystem.read:/data");

        let cap = derive_capability("connect:api.example.com:443", &mut w);
        assert_eq!(cap.key, "network.connect");
        assert_eq!(cap.selector, "api.example.com:443");
        assert!(w.warnings().is_empty());
    }

    #[test]
    fn unknown_operation_passes_through_with_warning() {
        let mut w = WarningCollector::new();
        let cap = derive_capability("teleport:elsewhere", &mut w);
        assert_eq!(cap.key, "teleport");

        let reported = w.warnings();
        assert_eq!(reported[0].key, "capability_unknown");
        assert_eq!(reported[0].fields.get("operation").unwrap(), "teleport");
    }

    #[test]
    fn missing_colon_is_malformed() {
        let mut w = WarningCollector::new();
        let cap = derive_capability("read", &mut w);
        assert_eq!(cap.operation, "");
        assert_eq!(cap.selector, "");
        assert_eq!(w.warnings()[0].key, "capability_malformed");
    }

    #[test]
    fn enforcement_preserves_declaration_order() {
        let profile = profile_with(&[
            ("filesystem.read", "sb.fs.ro"),
            ("filesystem.write", "sb.fs.rw"),
            ("network.connect", "sb.net.out"),
        ]);
        let mut w = WarningCollector::new();

        let set = derive_enforcement(
            &["write:/save".into(), "read:/assets".into()],
            &["connect:example.com".into()],
            &profile,
            &mut w,
        );

        assert!(set.capability_usage.present);
        assert_eq!(
            set.capability_usage.required_capabilities,
            vec![
                "filesystem.write:/save",
                "filesystem.read:/assets",
                "network.connect:example.com"
            ]
        );
        assert_eq!(set.filesystem, vec!["sb.fs.rw", "sb.fs.ro"]);
        assert_eq!(set.network, vec!["sb.net.out"]);
        assert!(w.warnings().is_empty());
    }

    #[test]
    fn unmapped_capability_warns_and_contributes_nothing() {
        let profile = profile_with(&[]);
        let mut w = WarningCollector::new();

        let set = derive_enforcement(&["read:/assets".into()], &[], &profile, &mut w);

        assert!(set.filesystem.is_empty());
        assert_eq!(
            set.capability_usage.required_capabilities,
            vec!["filesystem.read:/assets"]
        );
        let reported = w.warnings();
        assert_eq!(reported[0].key, "capability_missing");
        assert_eq!(
            reported[0].fields.get("capability").unwrap(),
            "filesystem.read"
        );
    }

    #[test]
    fn no_permissions_means_not_present() {
        let profile = profile_with(&[]);
        let mut w = WarningCollector::new();
        let set = derive_enforcement(&[], &[], &profile, &mut w);
        assert!(!set.capability_usage.present);
        assert!(set.capability_usage.required_capabilities.is_empty());
    }
}
