//! # nah-records
//!
//! The configuration-record data model consumed by the launch contract
//! engine: the app [`Manifest`], the per-deployment [`HostProfile`], the
//! per-install [`AppInstallRecord`], and the per-NAK [`NakInstallRecord`],
//! plus the environment-operation algebra and trust types shared between
//! them.
//!
//! Records live on disk as JSON. Parsing here is deliberately tolerant:
//! a record is rejected only when it is structurally unusable (bad JSON,
//! wrong `$schema`, a required section missing). Everything softer — an
//! unrecognized binding mode, an invalid warning action — degrades to a
//! parse note and a safe default, so one sloppy field never bricks an
//! installed app. The engine decides which notes become user-visible
//! warnings.

pub mod env;
pub mod error;
pub mod host_profile;
pub mod install_record;
pub mod manifest;
pub mod nak_record;
pub mod trust;

pub use env::{EnvMap, EnvOp, EnvValue};
pub use error::RecordError;
pub use host_profile::{
    builtin_empty_profile, is_override_permitted, parse_host_profile, version_allowed_by_profile,
    version_matches_pattern, BindingMode, HostProfile, OverrideMode, ParsedHostProfile,
    WarningAction, HOST_PROFILE_SCHEMA,
};
pub use install_record::{
    parse_app_install_record, validate_app_install_record, AppInstallRecord,
    ParsedAppInstallRecord, APP_INSTALL_SCHEMA,
};
pub use manifest::{AssetExport, Manifest};
pub use nak_record::{
    load_nak_install_record, parse_nak_install_record, validate_nak_install_record, LoaderConfig,
    NakInstallRecord, ParsedNakInstallRecord, NAK_INSTALL_SCHEMA,
};
pub use trust::{TrustInfo, TrustState};
