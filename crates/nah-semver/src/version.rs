// version.rs — Core semantic version (MAJOR.MINOR.PATCH).
//
// Pre-release and build metadata are rejected on purpose: NAK install
// records pin released versions only, so a `-` or `+` suffix in a version
// field is a data error, not something to interpret.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A core semantic version.
///
/// Ordering is the strict numeric order on (major, minor, patch), which is
/// what "highest satisfying version wins" selection relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Parse a core version string.
///
/// Accepts exactly `MAJOR.MINOR.PATCH` with decimal components. Leading and
/// trailing whitespace is tolerated. Anything else — missing components,
/// non-digits, pre-release (`-`) or build (`+`) suffixes — yields `None`.
pub fn parse_version(input: &str) -> Option<Version> {
    let s = input.trim();
    if s.is_empty() || s.contains('-') || s.contains('+') {
        return None;
    }

    let mut parts = s.split('.');
    let major = parse_component(parts.next()?)?;
    let minor = parse_component(parts.next()?)?;
    let patch = parse_component(parts.next()?)?;
    if parts.next().is_some() {
        return None;
    }

    Some(Version::new(major, minor, patch))
}

fn parse_component(part: &str) -> Option<u64> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_versions() {
        assert_eq!(parse_version("1.2.3"), Some(Version::new(1, 2, 3)));
        assert_eq!(parse_version("0.0.0"), Some(Version::new(0, 0, 0)));
        assert_eq!(parse_version(" 10.20.30 "), Some(Version::new(10, 20, 30)));
    }

    #[test]
    fn rejects_malformed_versions() {
        for bad in ["", "1", "1.2", "1.2.3.4", "a.b.c", "1..3", "1.2.x", "01a.0.0"] {
            assert_eq!(parse_version(bad), None, "should reject {bad:?}");
        }
    }

    #[test]
    fn rejects_prerelease_and_build_suffixes() {
        assert_eq!(parse_version("1.2.3-alpha"), None);
        assert_eq!(parse_version("1.2.3+build.5"), None);
        assert_eq!(parse_version("1.2.3-rc.1+meta"), None);
    }

    #[test]
    fn orders_numerically() {
        let v = |s: &str| parse_version(s).unwrap();
        assert!(v("1.2.3") < v("1.2.4"));
        assert!(v("1.2.9") < v("1.10.0"));
        assert!(v("2.0.0") > v("1.99.99"));
        assert_eq!(v("1.2.3"), v("1.2.3"));
    }

    #[test]
    fn displays_canonically() {
        assert_eq!(Version::new(5, 4, 6).to_string(), "5.4.6");
    }
}
