//! Publish manifest validation.
//!
//! Mirrors the field-naming and doc-comment density of `ktra`'s `Metadata`
//! struct (a cargo-registry metadata model in the reference pack): typed
//! accessors for the fields the registry understands, with the full
//! original JSON object kept alongside so unknown keys survive round-trips.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FieldError, RegistryError};
use crate::version::Version;

static ENTRY_POINT_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawManifest {
    pub name: String,
    pub version: String,
    pub game: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    pub minimum_ap_version: String,
    #[serde(default)]
    pub maximum_ap_version: Option<String>,
    pub entry_points: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default)]
    pub maturity: Option<String>,

    /// The verbatim accepted object, unknown keys included, stored as the
    /// version's manifest snapshot, so old versions keep fields that future
    /// clients introduced.
    #[serde(flatten)]
    pub extra: std::collections::BTreeMap<String, Value>,
}

/// A manifest that has passed validation: typed fields plus the snapshot.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub name: String,
    pub version: Version,
    pub game: String,
    pub description: Option<String>,
    pub authors: Vec<String>,
    pub minimum_compat: Version,
    pub maximum_compat: Option<Version>,
    pub entry_points: std::collections::BTreeMap<String, String>,
    pub platforms: Vec<String>,
    pub snapshot: Value,
}

const MAX_DESCRIPTION_LEN: usize = 500;

pub fn validate(raw: RawManifest, snapshot: Value) -> Result<Manifest, RegistryError> {
    let mut errors = Vec::new();

    if raw.name.trim().is_empty() {
        errors.push(field_error("name", "must not be empty", &raw.name));
    }

    let version = match raw.version.parse::<Version>() {
        Ok(v) => Some(v),
        Err(_) => {
            errors.push(field_error("version", "not a valid semantic version", &raw.version));
            None
        }
    };

    if raw.game.trim().is_empty() {
        errors.push(field_error("game", "must not be empty", &raw.game));
    }

    if raw.entry_points.is_empty() {
        errors.push(field_error("entry_points", "must declare at least one entry point", &Value::Null));
    }
    for id in raw.entry_points.keys() {
        if !ENTRY_POINT_ID.is_match(id) {
            errors.push(field_error(
                &format!("entry_points.{id}"),
                "identifier must match [A-Za-z_][A-Za-z0-9_]*",
                id,
            ));
        }
    }

    let minimum_compat = match raw.minimum_ap_version.parse::<Version>() {
        Ok(v) => Some(v),
        Err(_) => {
            errors.push(field_error(
                "minimum_ap_version",
                "not a valid semantic version",
                &raw.minimum_ap_version,
            ));
            None
        }
    };

    let maximum_compat = match &raw.maximum_ap_version {
        Some(s) => match s.parse::<Version>() {
            Ok(v) => Some(Some(v)),
            Err(_) => {
                errors.push(field_error("maximum_ap_version", "not a valid semantic version", s));
                None
            }
        },
        None => Some(None),
    };

    if let Some(desc) = &raw.description {
        if desc.chars().count() > MAX_DESCRIPTION_LEN {
            errors.push(field_error(
                "description",
                &format!("must be at most {MAX_DESCRIPTION_LEN} characters"),
                desc,
            ));
        }
    }

    if !errors.is_empty() {
        return Err(RegistryError::InvalidManifest(errors));
    }

    Ok(Manifest {
        name: raw.name,
        version: version.expect("validated above"),
        game: raw.game,
        description: raw.description,
        authors: raw.authors,
        minimum_compat: minimum_compat.expect("validated above"),
        maximum_compat: maximum_compat.expect("validated above"),
        entry_points: raw.entry_points,
        platforms: raw.platforms,
        snapshot,
    })
}

fn field_error(field: &str, message: &str, value: &impl Serialize) -> FieldError {
    FieldError {
        field: field.to_string(),
        message: message.to_string(),
        offending_value: serde_json::to_value(value).ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RawManifest {
        RawManifest {
            name: "pokemon-emerald".into(),
            version: "1.0.0".into(),
            game: "Pokemon Emerald".into(),
            description: None,
            authors: vec![],
            minimum_ap_version: "0.5.0".into(),
            maximum_ap_version: None,
            entry_points: [("pokemon_emerald".to_string(), "pokemon_emerald.world:World".to_string())]
                .into_iter()
                .collect(),
            license: None,
            homepage: None,
            repository: None,
            keywords: vec![],
            platforms: vec![],
            maturity: None,
            extra: Default::default(),
        }
    }

    #[test]
    fn valid_manifest_passes() {
        let raw = sample();
        let snapshot = serde_json::to_value(&raw).unwrap();
        assert!(validate(raw, snapshot).is_ok());
    }

    #[test]
    fn rejects_missing_entry_points() {
        let mut raw = sample();
        raw.entry_points.clear();
        let snapshot = serde_json::to_value(&raw).unwrap();
        let err = validate(raw, snapshot).unwrap_err();
        match err {
            RegistryError::InvalidManifest(fields) => {
                assert!(fields.iter().any(|f| f.field == "entry_points"));
            }
            _ => panic!("expected invalid-manifest"),
        }
    }

    #[test]
    fn rejects_bad_entry_point_identifier() {
        let mut raw = sample();
        raw.entry_points.insert("9bad".to_string(), "target".to_string());
        let snapshot = serde_json::to_value(&raw).unwrap();
        assert!(validate(raw, snapshot).is_err());
    }

    #[test]
    fn unknown_keys_survive_in_snapshot() {
        let raw = sample();
        let mut snapshot = serde_json::to_value(&raw).unwrap();
        snapshot["future_field"] = serde_json::json!("kept");
        let manifest = validate(raw, snapshot).unwrap();
        assert_eq!(manifest.snapshot["future_field"], "kept");
    }

    #[test]
    fn rejects_oversized_description() {
        let mut raw = sample();
        raw.description = Some("x".repeat(501));
        let snapshot = serde_json::to_value(&raw).unwrap();
        assert!(validate(raw, snapshot).is_err());
    }
}
