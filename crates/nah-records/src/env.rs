// env.rs — The environment-operation algebra.
//
// Configuration layers don't write raw strings into the environment; they
// declare *operations*. A plain JSON string means Set. The object form
// selects one of the four operations and, for prepend/append, the joining
// separator. Unset removes the variable from the accumulated map entirely.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One of the four environment operations a configuration layer may declare.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvOp {
    #[default]
    Set,
    Prepend,
    Append,
    Unset,
}

impl EnvOp {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvOp::Set => "set",
            EnvOp::Prepend => "prepend",
            EnvOp::Append => "append",
            EnvOp::Unset => "unset",
        }
    }
}

/// An environment value paired with its operation.
///
/// The default separator is `":"`; Windows-flavored records override it
/// with `";"` where they join path-like values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "EnvEntry")]
pub struct EnvValue {
    pub op: EnvOp,
    pub value: String,
    pub separator: String,
}

impl EnvValue {
    pub fn set(value: impl Into<String>) -> Self {
        Self {
            op: EnvOp::Set,
            value: value.into(),
            separator: default_separator(),
        }
    }

    pub fn with_op(op: EnvOp, value: impl Into<String>) -> Self {
        Self {
            op,
            value: value.into(),
            separator: default_separator(),
        }
    }
}

/// An environment section: key → operation, in sorted key order.
pub type EnvMap = BTreeMap<String, EnvValue>;

fn default_separator() -> String {
    ":".to_string()
}

/// Wire form of an environment entry: a bare string is shorthand for Set.
#[derive(Deserialize)]
#[serde(untagged)]
enum EnvEntry {
    Plain(String),
    Full {
        #[serde(default)]
        op: EnvOp,
        #[serde(default)]
        value: String,
        #[serde(default = "default_separator")]
        separator: String,
    },
}

impl From<EnvEntry> for EnvValue {
    fn from(entry: EnvEntry) -> Self {
        match entry {
            EnvEntry::Plain(value) => EnvValue::set(value),
            EnvEntry::Full {
                op,
                value,
                separator,
            } => EnvValue {
                op,
                value,
                separator,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_string_parses_as_set() {
        let v: EnvValue = serde_json::from_str("\"hello\"").unwrap();
        assert_eq!(v, EnvValue::set("hello"));
    }

    #[test]
    fn object_form_parses_operation_and_separator() {
        let v: EnvValue =
            serde_json::from_str(r#"{"op": "prepend", "value": "/opt/lib", "separator": ";"}"#)
                .unwrap();
        assert_eq!(v.op, EnvOp::Prepend);
        assert_eq!(v.value, "/opt/lib");
        assert_eq!(v.separator, ";");
    }

    #[test]
    fn unset_needs_no_value() {
        let v: EnvValue = serde_json::from_str(r#"{"op": "unset"}"#).unwrap();
        assert_eq!(v.op, EnvOp::Unset);
        assert_eq!(v.value, "");
    }

    #[test]
    fn separator_defaults_to_colon() {
        let v: EnvValue = serde_json::from_str(r#"{"op": "append", "value": "x"}"#).unwrap();
        assert_eq!(v.separator, ":");
    }
}
