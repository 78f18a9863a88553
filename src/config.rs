//! Model hyper-parameters from a preset plus an optional JSON override.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Overlay the fields of the JSON object in `overrides` onto `preset`.
///
/// Nested objects are merged field by field; any other value replaces the
/// preset's.
pub fn apply_overrides<T>(preset: T, overrides: Option<&Path>) -> Result<T>
where
    T: Serialize + DeserializeOwned,
{
    let Some(path) = overrides else {
        return Ok(preset);
    };

    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let patch: Value =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    if !patch.is_object() {
        bail!("{}: expected a JSON object", path.display());
    }

    let mut merged = serde_json::to_value(preset).context("serializing preset")?;
    merge(&mut merged, patch);
    let config = serde_json::from_value(merged)
        .with_context(|| format!("{}: invalid configuration", path.display()))?;
    log::info!("configuration overridden from {}", path.display());
    Ok(config)
}

fn merge(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => merge(existing, value),
                    Some(existing) => *existing = value,
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::train::{BoostConfig, DenseConfig, HiddenLayer};
    use std::io::Write;

    fn json_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn no_file_keeps_the_preset() {
        let config = apply_overrides(BoostConfig::default(), None).unwrap();
        assert_eq!(config, BoostConfig::default());
    }

    #[test]
    fn overrides_a_subset_of_fields() {
        let file = json_file(r#"{ "estimators": 10, "learning_rate": 0.1 }"#);
        let config = apply_overrides(BoostConfig::default(), Some(file.path())).unwrap();
        assert_eq!(config.estimators, 10);
        assert_eq!(config.learning_rate, 0.1);
        assert_eq!(config.max_depth, 3);
    }

    #[test]
    fn nested_fields_merge() {
        let file = json_file(r#"{ "hidden": { "units": 8 }, "iterations": 3 }"#);
        let config = apply_overrides(DenseConfig::frame_stack(), Some(file.path())).unwrap();
        assert_eq!(
            config.hidden,
            Some(HiddenLayer {
                units: 8,
                keep_probability: 0.2
            })
        );
        assert_eq!(config.iterations, 3);
        assert!(config.mean_bias);
    }

    #[test]
    fn null_removes_an_optional_layer() {
        let file = json_file(r#"{ "hidden": null }"#);
        let config = apply_overrides(DenseConfig::frame_stack(), Some(file.path())).unwrap();
        assert_eq!(config.hidden, None);
    }

    #[test]
    fn rejects_bad_documents() {
        let not_object = json_file("[1, 2]");
        assert!(apply_overrides(BoostConfig::default(), Some(not_object.path())).is_err());

        let wrong_type = json_file(r#"{ "max_depth": "deep" }"#);
        assert!(apply_overrides(BoostConfig::default(), Some(wrong_type.path())).is_err());
    }

    #[test]
    fn misspelled_fields_are_rejected() {
        let top_level = json_file(r#"{ "estimator": 10 }"#);
        let err = apply_overrides(BoostConfig::default(), Some(top_level.path())).unwrap_err();
        assert!(format!("{err:#}").contains("estimator"), "{err:#}");

        let nested = json_file(r#"{ "hidden": { "keep_prob": 0.5 } }"#);
        assert!(apply_overrides(DenseConfig::frame_stack(), Some(nested.path())).is_err());
    }
}
