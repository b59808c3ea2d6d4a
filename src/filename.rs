//! Artifact filename grammar.
//!
//! Binary shape: `{name}-{version}(-{build})?-{py}-{abi}-{platform}.island`
//! Source shape: `{name}-{version}.tar.gz`
//!
//! Normalization mirrors the wheel filename convention this is modeled on
//! (see `uv-publish`'s `DistFilename` in the reference pack): the
//! distribution name is lowercased with runs of non-alphanumerics collapsed
//! to a single underscore, and the version's `-` is encoded as `_` while `+`
//! (build metadata) is preserved verbatim.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::RegistryError;
use crate::version::Version;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformTag {
    pub python: String,
    pub abi: String,
    pub platform: String,
}

impl PlatformTag {
    pub fn is_pure(&self) -> bool {
        self.python.starts_with("py3") && self.abi == "none" && self.platform == "any"
    }
}

impl std::fmt::Display for PlatformTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.python, self.abi, self.platform)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedFilename {
    Binary { name: String, version: String, build_tag: Option<String>, tag: PlatformTag },
    Source { name: String, version: String },
}

impl ParsedFilename {
    pub fn normalized_name(&self) -> &str {
        match self {
            ParsedFilename::Binary { name, .. } => name,
            ParsedFilename::Source { name, .. } => name,
        }
    }

    pub fn normalized_version(&self) -> &str {
        match self {
            ParsedFilename::Binary { version, .. } => version,
            ParsedFilename::Source { version, .. } => version,
        }
    }
}

static NON_ALNUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9]+").unwrap());

/// Lowercase, collapse runs of non-alphanumeric characters to a single `_`.
pub fn normalize_name(name: &str) -> String {
    NON_ALNUM.replace_all(&name.to_lowercase(), "_").trim_matches('_').to_string()
}

/// Encode a version for filename use: `-` becomes `_`, `+` is preserved.
pub fn normalize_version_for_filename(version: &str) -> String {
    version.replace('-', "_")
}

pub fn build_source_filename(name: &str, version: &str) -> String {
    format!("{}-{}.tar.gz", normalize_name(name), normalize_version_for_filename(version))
}

pub fn build_binary_filename(
    name: &str,
    version: &str,
    build_tag: Option<&str>,
    tag: &PlatformTag,
) -> String {
    let base = format!("{}-{}", normalize_name(name), normalize_version_for_filename(version));
    let with_build = match build_tag {
        Some(b) => format!("{base}-{b}"),
        None => base,
    };
    format!("{with_build}-{tag}.island")
}

pub fn parse_filename(filename: &str) -> Result<ParsedFilename, RegistryError> {
    let invalid = || RegistryError::InvalidFilename(filename.to_string());

    if let Some(stem) = filename.strip_suffix(".tar.gz") {
        let mut parts = stem.rsplitn(2, '-');
        let version = parts.next().ok_or_else(invalid)?;
        let name = parts.next().ok_or_else(invalid)?;
        if name.is_empty() || version.is_empty() {
            return Err(invalid());
        }
        return Ok(ParsedFilename::Source { name: name.to_string(), version: version.to_string() });
    }

    if let Some(stem) = filename.strip_suffix(".island") {
        let segments: Vec<&str> = stem.split('-').collect();
        // {name}-{version}(-{build})?-{py}-{abi}-{plat}: 5 or 6 hyphen-separated segments.
        if segments.len() < 5 {
            return Err(invalid());
        }
        let platform = segments[segments.len() - 1].to_string();
        let abi = segments[segments.len() - 2].to_string();
        let python = segments[segments.len() - 3].to_string();
        let head = &segments[..segments.len() - 3];
        // head is [name, version] or [name, version, build]; name itself may
        // contain no hyphens post-normalization, so the version is always
        // the element immediately after the name.
        if head.len() < 2 {
            return Err(invalid());
        }
        let name = head[0].to_string();
        let version = head[1].to_string();
        let build_tag = if head.len() > 2 { Some(head[2..].join("-")) } else { None };
        if name.is_empty() || version.is_empty() {
            return Err(invalid());
        }
        return Ok(ParsedFilename::Binary {
            name,
            version,
            build_tag,
            tag: PlatformTag { python, abi, platform },
        });
    }

    Err(invalid())
}

/// Check that a parsed filename agrees with the manifest's (name, version)
/// and, for binaries, with a declared platform tag.
pub fn check_agreement(
    parsed: &ParsedFilename,
    manifest_name: &str,
    manifest_version: &Version,
    declared_tag: Option<&str>,
) -> Result<(), RegistryError> {
    if parsed.normalized_name() != normalize_name(manifest_name) {
        return Err(RegistryError::NameMismatch);
    }
    if parsed.normalized_version() != normalize_version_for_filename(&manifest_version.to_string())
    {
        return Err(RegistryError::VersionMismatch);
    }
    if let (ParsedFilename::Binary { tag, .. }, Some(declared)) = (parsed, declared_tag) {
        if tag.to_string() != declared {
            return Err(RegistryError::TagMismatch);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_binary_filename() {
        let tag = PlatformTag { python: "py3".into(), abi: "none".into(), platform: "any".into() };
        let filename = build_binary_filename("Pokemon Emerald", "1.0.0", None, &tag);
        assert_eq!(filename, "pokemon_emerald-1.0.0-py3-none-any.island");

        let parsed = parse_filename(&filename).unwrap();
        match parsed {
            ParsedFilename::Binary { name, version, tag: parsed_tag, build_tag } => {
                assert_eq!(name, "pokemon_emerald");
                assert_eq!(version, "1.0.0");
                assert_eq!(parsed_tag, tag);
                assert!(build_tag.is_none());
            }
            _ => panic!("expected binary"),
        }
    }

    #[test]
    fn round_trips_source_filename() {
        let filename = build_source_filename("pokemon_emerald", "1.0.0");
        assert_eq!(filename, "pokemon_emerald-1.0.0.tar.gz");
        let parsed = parse_filename(&filename).unwrap();
        assert_eq!(parsed.normalized_name(), "pokemon_emerald");
        assert_eq!(parsed.normalized_version(), "1.0.0");
    }

    #[test]
    fn round_trips_with_build_tag() {
        let tag = PlatformTag { python: "py3".into(), abi: "none".into(), platform: "any".into() };
        let filename = build_binary_filename("emerald", "1.0.0", Some("build1"), &tag);
        let parsed = parse_filename(&filename).unwrap();
        match parsed {
            ParsedFilename::Binary { build_tag, .. } => {
                assert_eq!(build_tag.as_deref(), Some("build1"));
            }
            _ => panic!("expected binary"),
        }
    }

    #[test]
    fn rejects_malformed_filename() {
        assert!(parse_filename("not-a-valid-name").is_err());
        assert!(parse_filename("justaname.island").is_err());
    }

    #[test]
    fn name_normalization_collapses_non_alnum() {
        assert_eq!(normalize_name("Pokémon!!Emerald"), "pok_mon_emerald");
    }

    #[test]
    fn pure_platform_tag_detection() {
        let pure = PlatformTag { python: "py3".into(), abi: "none".into(), platform: "any".into() };
        assert!(pure.is_pure());
        let not_pure =
            PlatformTag { python: "py3".into(), abi: "cp311".into(), platform: "linux_x86_64".into() };
        assert!(!not_pure.is_pure());
    }
}
