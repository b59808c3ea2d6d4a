//! Semantic version parsing and total ordering.
//!
//! Implements the precedence rules of semver 2.0.0: numeric core, optional
//! dot-separated pre-release identifiers (numeric ones compare numerically,
//! others lexically; any pre-release sorts below the same core version
//! without one), and build metadata that never participates in ordering.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::RegistryError;

#[derive(Debug, Clone, Eq)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub pre_release: Vec<Identifier>,
    pub build: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    Numeric(u64),
    Alphanumeric(String),
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Numeric(n) => write!(f, "{n}"),
            Identifier::Alphanumeric(s) => write!(f, "{s}"),
        }
    }
}

impl Ord for Identifier {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Identifier::Numeric(a), Identifier::Numeric(b)) => a.cmp(b),
            (Identifier::Numeric(_), Identifier::Alphanumeric(_)) => Ordering::Less,
            (Identifier::Alphanumeric(_), Identifier::Numeric(_)) => Ordering::Greater,
            (Identifier::Alphanumeric(a), Identifier::Alphanumeric(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for Identifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn is_numeric_no_leading_zero(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) && (s == "0" || !s.starts_with('0'))
}

fn parse_identifiers(segment: &str, allow_leading_zero: bool) -> Result<Vec<String>, ()> {
    if segment.is_empty() {
        return Err(());
    }
    for part in segment.split('.') {
        if part.is_empty() {
            return Err(());
        }
        if !part.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            return Err(());
        }
        if !allow_leading_zero
            && part.bytes().all(|b| b.is_ascii_digit())
            && !is_numeric_no_leading_zero(part)
        {
            return Err(());
        }
    }
    Ok(segment.split('.').map(str::to_string).collect())
}

impl FromStr for Version {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RegistryError::InvalidVersion(s.to_string());

        let (core_and_pre, build) = match s.split_once('+') {
            Some((a, b)) => (a, Some(b)),
            None => (s, None),
        };
        let (core, pre_release) = match core_and_pre.split_once('-') {
            Some((a, b)) => (a, Some(b)),
            None => (core_and_pre, None),
        };

        let mut core_parts = core.split('.');
        let major = core_parts.next().ok_or_else(invalid)?;
        let minor = core_parts.next().ok_or_else(invalid)?;
        let patch = core_parts.next().ok_or_else(invalid)?;
        if core_parts.next().is_some() {
            return Err(invalid());
        }
        if !is_numeric_no_leading_zero(major)
            || !is_numeric_no_leading_zero(minor)
            || !is_numeric_no_leading_zero(patch)
        {
            return Err(invalid());
        }
        let major = major.parse::<u64>().map_err(|_| invalid())?;
        let minor = minor.parse::<u64>().map_err(|_| invalid())?;
        let patch = patch.parse::<u64>().map_err(|_| invalid())?;

        let pre_release = match pre_release {
            Some(seg) => parse_identifiers(seg, false)
                .map_err(|_| invalid())?
                .into_iter()
                .map(|part| {
                    if is_numeric_no_leading_zero(&part) {
                        Identifier::Numeric(part.parse().unwrap())
                    } else {
                        Identifier::Alphanumeric(part)
                    }
                })
                .collect(),
            None => Vec::new(),
        };

        let build = match build {
            Some(seg) => {
                parse_identifiers(seg, true).map_err(|_| invalid())?;
                seg.to_string()
            }
            None => String::new(),
        };

        Ok(Version { major, minor, patch, pre_release, build })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if !self.pre_release.is_empty() {
            write!(f, "-")?;
            let parts: Vec<String> = self.pre_release.iter().map(|i| i.to_string()).collect();
            write!(f, "{}", parts.join("."))?;
        }
        if !self.build.is_empty() {
            write!(f, "+{}", self.build)?;
        }
        Ok(())
    }
}

/// Equality and ordering both ignore build metadata, per semver precedence.
impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.cmp(&other.patch))
            .then_with(|| match (self.pre_release.is_empty(), other.pre_release.is_empty()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => self.pre_release.cmp(&other.pre_release),
            })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Version {
    /// A byte-comparable sort key, useful for store-level ORDER BY columns
    /// that can't run our comparator directly.
    pub fn sort_key(&self) -> (u64, u64, u64, bool, Vec<Identifier>) {
        (self.major, self.minor, self.patch, self.pre_release.is_empty(), self.pre_release.clone())
    }

    pub fn in_range(&self, min: &Version, max: Option<&Version>) -> bool {
        self >= min && max.map(|m| self <= m).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_version() {
        let v: Version = "1.2.3".parse().unwrap();
        assert_eq!((v.major, v.minor, v.patch), (1, 2, 3));
    }

    #[test]
    fn rejects_missing_patch() {
        assert!("1.2".parse::<Version>().is_err());
    }

    #[test]
    fn rejects_leading_v() {
        assert!("v1.2.3".parse::<Version>().is_err());
    }

    #[test]
    fn rejects_leading_zero() {
        assert!("1.02.3".parse::<Version>().is_err());
        assert!("1.0.3".parse::<Version>().is_ok());
    }

    #[test]
    fn rejects_empty_pre_release_segment() {
        assert!("1.2.3-".parse::<Version>().is_err());
        assert!("1.2.3-a..b".parse::<Version>().is_err());
    }

    #[test]
    fn pre_release_sorts_below_release() {
        let pre: Version = "1.0.0-alpha".parse().unwrap();
        let rel: Version = "1.0.0".parse().unwrap();
        assert!(pre < rel);
    }

    #[test]
    fn numeric_pre_release_compares_numerically() {
        let a: Version = "1.0.0-2".parse().unwrap();
        let b: Version = "1.0.0-10".parse().unwrap();
        assert!(a < b);
    }

    #[test]
    fn alphanumeric_pre_release_compares_lexically() {
        let a: Version = "1.0.0-alpha".parse().unwrap();
        let b: Version = "1.0.0-beta".parse().unwrap();
        assert!(a < b);
    }

    #[test]
    fn build_metadata_ignored_in_ordering_and_equality() {
        let a: Version = "1.0.0+001".parse().unwrap();
        let b: Version = "1.0.0+002".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.cmp(&b), Ordering::Equal);
    }

    #[test]
    fn total_order_is_transitive() {
        let versions = [
            "1.0.0-alpha", "1.0.0-alpha.1", "1.0.0-alpha.beta", "1.0.0-beta", "1.0.0-beta.2",
            "1.0.0-beta.11", "1.0.0-rc.1", "1.0.0", "2.0.0", "2.1.0", "2.1.1",
        ];
        let parsed: Vec<Version> = versions.iter().map(|v| v.parse().unwrap()).collect();
        for pair in parsed.windows(2) {
            assert!(pair[0] < pair[1], "{} should be < {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn in_range_respects_open_upper_bound() {
        let min: Version = "0.5.0".parse().unwrap();
        let candidate: Version = "0.6.50".parse().unwrap();
        assert!(candidate.in_range(&min, None));
    }
}
