// expand.rs — Placeholder expansion.
//
// Three token forms are recognized: `{NAME}` (the record format's native
// form) and the shell-style `${NAME}` / `$NAME`. Expansion is single-pass:
// a substituted value is never rescanned, so there is no recursion and no
// cycle to detect. Limits bound the work instead: at most MAX_PLACEHOLDERS
// tokens per input, at most MAX_EXPANDED_SIZE output bytes.
//
// A name missing from the environment map falls back to the composition's
// process-environment snapshot; only when both miss does it expand to empty
// with a missing_env_var warning.

use std::collections::BTreeMap;

use crate::warnings::{fields, Warning, WarningCollector};

/// Maximum placeholder tokens in one input string.
pub const MAX_PLACEHOLDERS: usize = 128;
/// Maximum expanded output size in bytes (64 KiB).
pub const MAX_EXPANDED_SIZE: usize = 64 * 1024;

/// Result of expanding one string. On failure the partial output is
/// discarded and `value` is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expansion {
    pub value: String,
    pub ok: bool,
}

/// Expansion context: the resolved environment plus the process-environment
/// fallback snapshot.
pub struct Expander<'a> {
    env: &'a BTreeMap<String, String>,
    fallback: Option<&'a BTreeMap<String, String>>,
}

impl<'a> Expander<'a> {
    pub fn new(
        env: &'a BTreeMap<String, String>,
        fallback: Option<&'a BTreeMap<String, String>>,
    ) -> Self {
        Self { env, fallback }
    }

    /// Expand every placeholder in `input`, labeling any warnings with
    /// `source_path`.
    pub fn expand(
        &self,
        input: &str,
        source_path: &str,
        warnings: &mut WarningCollector,
    ) -> Expansion {
        let bytes = input.as_bytes();
        let mut output = String::with_capacity(input.len());
        let mut placeholder_count = 0usize;
        let mut i = 0usize;

        while i < bytes.len() {
            let token = match bytes[i] {
                b'{' => scan_braced(&input[i..], 0),
                b'$' if bytes.get(i + 1) == Some(&b'{') => scan_braced(&input[i + 1..], 1),
                b'$' => scan_bare(&input[i + 1..]),
                _ => None,
            };

            match token {
                Some((name, token_len)) => {
                    placeholder_count += 1;
                    if placeholder_count > MAX_PLACEHOLDERS {
                        warnings.emit(
                            Warning::InvalidConfiguration,
                            fields([
                                ("reason", "placeholder_limit"),
                                ("source_path", source_path),
                            ]),
                        );
                        return Expansion {
                            value: String::new(),
                            ok: false,
                        };
                    }

                    match self.lookup(&name) {
                        Some(value) => output.push_str(value),
                        None => {
                            warnings.emit(
                                Warning::MissingEnvVar,
                                fields([
                                    ("missing", name.as_str()),
                                    ("source_path", source_path),
                                ]),
                            );
                        }
                    }
                    i += token_len;
                }
                None => {
                    // Not a placeholder here; copy one character literally.
                    let ch = input[i..].chars().next().unwrap_or('\u{fffd}');
                    output.push(ch);
                    i += ch.len_utf8();
                }
            }

            if output.len() > MAX_EXPANDED_SIZE {
                warnings.emit(
                    Warning::InvalidConfiguration,
                    fields([
                        ("reason", "expansion_overflow"),
                        ("source_path", source_path),
                    ]),
                );
                return Expansion {
                    value: String::new(),
                    ok: false,
                };
            }
        }

        Expansion {
            value: output,
            ok: true,
        }
    }

    /// Expand a list of strings, labeling each element `prefix[index]`.
    /// Elements that fail expansion become empty strings.
    pub fn expand_list(
        &self,
        input: &[String],
        prefix: &str,
        warnings: &mut WarningCollector,
    ) -> Vec<String> {
        input
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let expansion = self.expand(item, &format!("{prefix}[{i}]"), warnings);
                if expansion.ok {
                    expansion.value
                } else {
                    String::new()
                }
            })
            .collect()
    }

    fn lookup(&self, name: &str) -> Option<&'a str> {
        if let Some(value) = self.env.get(name) {
            return Some(value);
        }
        self.fallback.and_then(|f| f.get(name)).map(String::as_str)
    }
}

/// Expand every value of `environment` against a snapshot taken before any
/// expansion in this pass, in lexicographic key order. Single pass: no
/// key's expansion can observe another key's already-expanded value.
pub fn expand_environment_map(
    environment: &mut BTreeMap<String, String>,
    fallback: Option<&BTreeMap<String, String>>,
    warnings: &mut WarningCollector,
) {
    let snapshot = environment.clone();
    let expander = Expander::new(&snapshot, fallback);

    let keys: Vec<String> = environment.keys().cloned().collect();
    for key in keys {
        let source_path = format!("environment.{key}");
        let expansion = expander.expand(&environment[&key], &source_path, warnings);
        let value = if expansion.ok {
            expansion.value
        } else {
            String::new()
        };
        environment.insert(key, value);
    }
}

/// Scan a braced token. `rest` starts at the `{`; `extra` is how many bytes
/// precede it within the whole token (1 for the `$` of `${NAME}`). Returns
/// the name and full token length, or `None` when the text is literal
/// (no `}`, empty name, nested `{`).
fn scan_braced(rest: &str, extra: usize) -> Option<(String, usize)> {
    let close = rest.find('}')?;
    let name = &rest[1..close];
    if name.is_empty() || name.contains('{') {
        return None;
    }
    Some((name.to_string(), close + 1 + extra))
}

/// Scan a bare `$NAME` token. `rest` starts just after the `$`. Names are
/// `[A-Za-z_][A-Za-z0-9_]*`; the returned length includes the `$`.
fn scan_bare(rest: &str) -> Option<(String, usize)> {
    let bytes = rest.as_bytes();
    let first = *bytes.first()?;
    if !(first.is_ascii_alphabetic() || first == b'_') {
        return None;
    }
    let mut end = 1;
    while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
        end += 1;
    }
    Some((rest[..end].to_string(), end + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn expands_braced_tokens() {
        let e = env(&[("NAME", "world")]);
        let expander = Expander::new(&e, None);
        let mut w = WarningCollector::new();

        let r = expander.expand("hello {NAME}!", "test", &mut w);
        assert_eq!(r.value, "hello world!");
        assert!(r.ok);
        assert!(w.warnings().is_empty());
    }

    #[test]
    fn expands_shell_style_tokens() {
        let e = env(&[("ROOT", "/apps/x"), ("V", "2")]);
        let expander = Expander::new(&e, None);
        let mut w = WarningCollector::new();

        assert_eq!(expander.expand("${ROOT}/bin", "t", &mut w).value, "/apps/x/bin");
        assert_eq!(expander.expand("$ROOT/bin", "t", &mut w).value, "/apps/x/bin");
        assert_eq!(expander.expand("v$V.0", "t", &mut w).value, "v2.0");
        assert!(w.warnings().is_empty());
    }

    #[test]
    fn missing_variable_expands_empty_with_warning() {
        let e = env(&[]);
        let expander = Expander::new(&e, None);
        let mut w = WarningCollector::new();

        let r = expander.expand("a{GONE}b", "cfg.args", &mut w);
        assert_eq!(r.value, "ab");
        assert!(r.ok);

        let reported = w.warnings();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].key, "missing_env_var");
        assert_eq!(reported[0].fields.get("missing").unwrap(), "GONE");
        assert_eq!(reported[0].fields.get("source_path").unwrap(), "cfg.args");
    }

    #[test]
    fn process_env_fallback_fills_misses() {
        let e = env(&[]);
        let process = env(&[("HOME", "/home/u")]);
        let expander = Expander::new(&e, Some(&process));
        let mut w = WarningCollector::new();

        let r = expander.expand("{HOME}/cache", "t", &mut w);
        assert_eq!(r.value, "/home/u/cache");
        assert!(w.warnings().is_empty());
    }

    #[test]
    fn nested_brace_names_are_literal() {
        let e = env(&[("B", "x")]);
        let expander = Expander::new(&e, None);
        let mut w = WarningCollector::new();

        let r = expander.expand("{a{B}", "t", &mut w);
        assert_eq!(r.value, "{ax");
        assert!(w.warnings().is_empty());
    }

    #[test]
    fn unterminated_and_bare_dollars_are_literal() {
        let e = env(&[]);
        let expander = Expander::new(&e, None);
        let mut w = WarningCollector::new();

        assert_eq!(expander.expand("{open", "t", &mut w).value, "{open");
        assert_eq!(expander.expand("cost: $5", "t", &mut w).value, "cost: $5");
        assert_eq!(expander.expand("end$", "t", &mut w).value, "end$");
        assert!(w.warnings().is_empty());
    }

    #[test]
    fn placeholder_limit_discards_output() {
        let e = env(&[("X", "v")]);
        let expander = Expander::new(&e, None);
        let mut w = WarningCollector::new();

        let input = "{X}".repeat(MAX_PLACEHOLDERS + 1);
        let r = expander.expand(&input, "t", &mut w);
        assert!(!r.ok);
        assert_eq!(r.value, "");

        let reported = w.warnings();
        assert_eq!(reported[0].key, "invalid_configuration");
        assert_eq!(reported[0].fields.get("reason").unwrap(), "placeholder_limit");
    }

    #[test]
    fn oversized_output_discards_output() {
        let big = "x".repeat(40 * 1024);
        let e = env(&[("BIG", &big)]);
        let expander = Expander::new(&e, None);
        let mut w = WarningCollector::new();

        let r = expander.expand("{BIG}{BIG}", "t", &mut w);
        assert!(!r.ok);
        assert_eq!(r.value, "");
        assert_eq!(
            w.warnings()[0].fields.get("reason").unwrap(),
            "expansion_overflow"
        );
    }

    #[test]
    fn map_expansion_uses_pre_pass_snapshot() {
        let mut map = env(&[("A", "{B}"), ("B", "x")]);
        let mut w = WarningCollector::new();

        expand_environment_map(&mut map, None, &mut w);
        // A saw the snapshot where B was still "x"; single pass, no fixed point.
        assert_eq!(map.get("A").unwrap(), "x");
        assert_eq!(map.get("B").unwrap(), "x");
    }

    #[test]
    fn map_expansion_is_order_independent_across_keys() {
        // Z refers to A; A's own expansion must not be visible to Z.
        let mut map = env(&[("A", "{B}"), ("B", "x"), ("Z", "{A}")]);
        let mut w = WarningCollector::new();

        expand_environment_map(&mut map, None, &mut w);
        assert_eq!(map.get("Z").unwrap(), "{B}");
    }

    #[test]
    fn list_expansion_labels_elements() {
        let e = env(&[]);
        let expander = Expander::new(&e, None);
        let mut w = WarningCollector::new();

        let out = expander.expand_list(
            &["ok".to_string(), "{MISSING}".to_string()],
            "loader.args_template",
            &mut w,
        );
        assert_eq!(out, vec!["ok".to_string(), "".to_string()]);
        assert_eq!(
            w.warnings()[0].fields.get("source_path").unwrap(),
            "loader.args_template[1]"
        );
    }
}
