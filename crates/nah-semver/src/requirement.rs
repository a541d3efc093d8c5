// requirement.rs — Version requirement parsing and satisfaction.
//
// Five requirement forms are recognized:
//
//   bounded   ">=1.2.0 <2.0.0"   half-open interval, both bounds explicit
//   caret     "^1.2.3"           floor at the version, ceiling one step above
//                                the first non-zero component
//   tilde     "~1.2.3"           floor at the version, ceiling at next minor
//   wildcard  "1.2.*" / "1.2.x"  any patch of MAJOR.MINOR
//   exact     "1.2.3"            that version only
//
// Every requirement also carries a selection key — "MAJOR.MINOR" of its
// inclusive floor — used by mapped binding to look up a host-chosen record.

use std::fmt;

use crate::version::{parse_version, Version};

/// Which of the five requirement forms a requirement was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequirementKind {
    Exact,
    Caret,
    Tilde,
    Wildcard,
    Bounded,
}

/// A parsed version requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub kind: RequirementKind,
    /// Inclusive lower bound. For wildcard this is `MAJOR.MINOR.0`.
    pub lower: Version,
    /// Exclusive upper bound for caret / tilde / bounded forms.
    pub upper: Option<Version>,
}

impl Requirement {
    /// The `"MAJOR.MINOR"` key derived from the inclusive floor, used to
    /// index `profile.nak.map` in mapped binding mode.
    pub fn selection_key(&self) -> String {
        format!("{}.{}", self.lower.major, self.lower.minor)
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            RequirementKind::Exact => write!(f, "{}", self.lower),
            RequirementKind::Caret => write!(f, "^{}", self.lower),
            RequirementKind::Tilde => write!(f, "~{}", self.lower),
            RequirementKind::Wildcard => {
                write!(f, "{}.{}.*", self.lower.major, self.lower.minor)
            }
            RequirementKind::Bounded => match &self.upper {
                Some(upper) => write!(f, ">={} <{}", self.lower, upper),
                None => write!(f, ">={}", self.lower),
            },
        }
    }
}

/// Parse a requirement string into one of the five supported forms.
///
/// Returns `None` for anything unrecognized; callers treat that the same as
/// "no version can satisfy this".
pub fn parse_requirement(input: &str) -> Option<Requirement> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }

    if let Some(rest) = s.strip_prefix('^') {
        return parse_caret(rest.trim());
    }
    if let Some(rest) = s.strip_prefix('~') {
        return parse_tilde(rest.trim());
    }
    if s.contains(">=") || s.contains('<') {
        return parse_bounded(s);
    }
    if let Some(req) = parse_wildcard(s) {
        return Some(req);
    }

    let exact = parse_version(s)?;
    Some(Requirement {
        kind: RequirementKind::Exact,
        lower: exact,
        upper: None,
    })
}

/// `^X.Y.Z` — ceiling one step above the first non-zero component.
fn parse_caret(rest: &str) -> Option<Requirement> {
    let lower = parse_version(rest)?;
    let upper = if lower.major > 0 {
        Version::new(lower.major + 1, 0, 0)
    } else if lower.minor > 0 {
        Version::new(0, lower.minor + 1, 0)
    } else {
        Version::new(0, 0, lower.patch + 1)
    };
    Some(Requirement {
        kind: RequirementKind::Caret,
        lower,
        upper: Some(upper),
    })
}

/// `~X.Y.Z` — ceiling at the next minor.
fn parse_tilde(rest: &str) -> Option<Requirement> {
    let lower = parse_version(rest)?;
    Some(Requirement {
        kind: RequirementKind::Tilde,
        lower,
        upper: Some(Version::new(lower.major, lower.minor + 1, 0)),
    })
}

/// `>=X.Y.Z <A.B.C` — whitespace-separated bounds, lower bound required.
fn parse_bounded(s: &str) -> Option<Requirement> {
    let mut lower = None;
    let mut upper = None;

    for token in s.split_whitespace() {
        if let Some(rest) = token.strip_prefix(">=") {
            if lower.is_some() {
                return None;
            }
            lower = Some(parse_version(rest)?);
        } else if let Some(rest) = token.strip_prefix('<') {
            if upper.is_some() {
                return None;
            }
            upper = Some(parse_version(rest)?);
        } else {
            return None;
        }
    }

    Some(Requirement {
        kind: RequirementKind::Bounded,
        lower: lower?,
        upper,
    })
}

/// `X.Y.*` or `X.Y.x` — any patch of the given major.minor.
fn parse_wildcard(s: &str) -> Option<Requirement> {
    let mut parts = s.split('.');
    let major = parts.next()?;
    let minor = parts.next()?;
    let patch = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    if !matches!(patch, "*" | "x" | "X") {
        return None;
    }

    let lower = parse_version(&format!("{major}.{minor}.0"))?;
    Some(Requirement {
        kind: RequirementKind::Wildcard,
        lower,
        upper: None,
    })
}

/// Does `version` satisfy `requirement`?
///
/// Exact compares for equality; wildcard compares major and minor; the
/// interval forms test inclusive-lower, exclusive-upper.
pub fn satisfies(version: Version, requirement: &Requirement) -> bool {
    match requirement.kind {
        RequirementKind::Exact => version == requirement.lower,
        RequirementKind::Wildcard => {
            version.major == requirement.lower.major && version.minor == requirement.lower.minor
        }
        RequirementKind::Caret | RequirementKind::Tilde | RequirementKind::Bounded => {
            if version < requirement.lower {
                return false;
            }
            match requirement.upper {
                Some(upper) => version < upper,
                None => true,
            }
        }
    }
}

/// Pick the highest version in `versions` that satisfies `requirement`.
pub fn select_best(versions: &[Version], requirement: &Requirement) -> Option<Version> {
    versions
        .iter()
        .copied()
        .filter(|v| satisfies(*v, requirement))
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        parse_version(s).unwrap()
    }

    fn req(s: &str) -> Requirement {
        parse_requirement(s).unwrap_or_else(|| panic!("should parse {s:?}"))
    }

    #[test]
    fn caret_bounds() {
        let r = req("^1.2.3");
        assert_eq!(r.kind, RequirementKind::Caret);
        assert!(satisfies(v("1.2.3"), &r));
        assert!(satisfies(v("1.9.0"), &r));
        assert!(!satisfies(v("2.0.0"), &r));
        assert!(!satisfies(v("1.2.2"), &r));
    }

    #[test]
    fn caret_zero_major_caps_at_next_minor() {
        let r = req("^0.3.1");
        assert!(satisfies(v("0.3.9"), &r));
        assert!(!satisfies(v("0.4.0"), &r));
    }

    #[test]
    fn caret_zero_minor_caps_at_next_patch() {
        let r = req("^0.0.5");
        assert!(satisfies(v("0.0.5"), &r));
        assert!(!satisfies(v("0.0.6"), &r));
    }

    #[test]
    fn tilde_caps_at_next_minor() {
        let r = req("~1.2.0");
        assert!(satisfies(v("1.2.3"), &r));
        assert!(!satisfies(v("1.3.0"), &r));
    }

    #[test]
    fn wildcard_matches_any_patch() {
        let r = req("1.2.*");
        assert!(satisfies(v("1.2.0"), &r));
        assert!(satisfies(v("1.2.5"), &r));
        assert!(!satisfies(v("1.3.0"), &r));

        let rx = req("1.2.x");
        assert!(satisfies(v("1.2.99"), &rx));
    }

    #[test]
    fn exact_matches_only_itself() {
        let r = req("5.4.6");
        assert_eq!(r.kind, RequirementKind::Exact);
        assert!(satisfies(v("5.4.6"), &r));
        assert!(!satisfies(v("5.4.7"), &r));
    }

    #[test]
    fn bounded_is_half_open() {
        let r = req(">=1.0.0 <2.0.0");
        assert_eq!(r.kind, RequirementKind::Bounded);
        assert!(satisfies(v("1.0.0"), &r));
        assert!(satisfies(v("1.9.9"), &r));
        assert!(!satisfies(v("2.0.0"), &r));
        assert!(!satisfies(v("0.9.9"), &r));
    }

    #[test]
    fn bounded_without_upper_is_open_ended() {
        let r = req(">=3.1.0");
        assert!(satisfies(v("9.0.0"), &r));
        assert!(!satisfies(v("3.0.9"), &r));
    }

    #[test]
    fn rejects_malformed_requirements() {
        for bad in ["", "^", "~x.y.z", ">=1.0", "1.*.2", "1.2.3 4.5.6", "< <1.0.0"] {
            assert!(parse_requirement(bad).is_none(), "should reject {bad:?}");
        }
    }

    #[test]
    fn selection_key_is_floor_major_minor() {
        assert_eq!(req("^5.4.0").selection_key(), "5.4");
        assert_eq!(req(">=1.2.3 <2.0.0").selection_key(), "1.2");
        assert_eq!(req("20.11.*").selection_key(), "20.11");
    }

    #[test]
    fn select_best_picks_highest_satisfying() {
        let versions = [v("5.3.0"), v("5.4.6"), v("5.4.2"), v("6.0.0")];
        assert_eq!(select_best(&versions, &req("^5.3.0")), Some(v("5.4.6")));
        assert_eq!(select_best(&versions, &req("^7.0.0")), None);
    }
}
