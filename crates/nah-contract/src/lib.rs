//! # nah-contract
//!
//! The launch contract resolution engine. Given an app's parsed manifest,
//! its install record, the host profile, and a snapshot of the process
//! environment, [`compose_contract`] deterministically computes the exact
//! binary to execute, its arguments, working directory, environment, library
//! search paths, and the sandbox enforcement that applies.
//!
//! ## Key invariants
//!
//! - **No escape**: every path a package declares is verified to resolve
//!   under its declared root, or composition aborts with `PATH_TRAVERSAL`
//!   and emits no contract body.
//! - **Determinism**: identical inputs produce byte-identical envelopes;
//!   every map ordering that feeds output is explicitly sorted.
//! - **Three-tier failures**: silent defaults (missing placeholder → empty
//!   string), policy-controlled warnings, and a small fixed set of critical
//!   errors that abort composition. Warnings escalated to Error by policy
//!   never become critical errors; callers check
//!   [`ComposeResult::has_policy_errors`] themselves.
//! - **No ambient state**: each run owns its warning collector and
//!   environment accumulator; runs may proceed concurrently.

pub mod capability;
pub mod compose;
pub mod envelope;
pub mod expand;
pub mod paths;
pub mod resolve;
pub mod warnings;

pub use capability::{derive_capability, derive_enforcement, Capability, CapabilityUsage, EnforcementSet};
pub use compose::{
    compose_contract, current_timestamp, parse_overrides_file, ComposeInputs, ComposeResult,
    OverridesFile,
};
pub use envelope::{
    serialize_contract_json, ContractEnvelope, CriticalError, LaunchContract, Trace,
    TraceContribution, TraceEntry, CONTRACT_SCHEMA,
};
pub use expand::{expand_environment_map, Expander, MAX_EXPANDED_SIZE, MAX_PLACEHOLDERS};
pub use paths::{
    is_absolute_path, is_path_under_root, library_path_env_key, normalize_under_root,
    path_list_separator, PathError,
};
pub use resolve::{load_pinned_nak, select_nak_for_install, NakPin, NakRegistryEntry, NakSelection};
pub use warnings::{Warning, WarningCollector, WarningObject};
