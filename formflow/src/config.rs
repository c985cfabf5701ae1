use crate::state::FieldValues;
use anyhow::{Context, Result};
use indexmap::IndexMap;
use shared::{FieldKey, GroupId, StoreConfig};
use std::path::Path;

pub fn load_config(path: &Path) -> Result<StoreConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = StoreConfig::from_toml_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Initial values and row counts described by the `[form]` section.
///
/// Group rows win over `initial_values` entries that address the same key.
pub(crate) fn initial_state(config: &StoreConfig) -> (FieldValues, IndexMap<GroupId, usize>) {
    let mut values: FieldValues = config
        .form
        .initial_values
        .iter()
        .map(|(raw, value)| (FieldKey::parse(raw), value.clone()))
        .collect();

    let mut groups = IndexMap::new();
    for (group, rows) in &config.form.groups {
        for (row, row_values) in rows.iter().enumerate() {
            for (field, value) in row_values {
                values.insert(FieldKey::row(group.clone(), row, field.clone()), value.clone());
            }
        }
        groups.insert(group.clone(), rows.len());
    }

    (values, groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_load_config_reports_missing_file() {
        let error = load_config(Path::new("/nonexistent/formflow.toml")).unwrap_err();
        assert!(error.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_load_config_from_disk() {
        let path = std::env::temp_dir().join(format!("formflow-config-{}.toml", std::process::id()));
        std::fs::write(&path, "[timing]\nprocessing_debounce_ms = 250\n").unwrap();

        let config = load_config(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.timing.processing_debounce_ms, 250);
        assert_eq!(config.concurrency.requests, 5);
    }

    #[test]
    fn test_initial_state_flattens_groups() {
        let config = StoreConfig::from_toml_str(
            r#"
            [form.initial_values]
            name = "Ada"

            [[form.groups.limits]]
            threshold = { min = 0, max = 30 }

            [[form.groups.limits]]
            threshold = { min = 30 }
            "#,
        )
        .unwrap();

        let (values, groups) = initial_state(&config);
        assert_eq!(values[&FieldKey::new("name")], json!("Ada"));
        assert_eq!(
            values[&FieldKey::row("limits", 1, "threshold")],
            json!({ "min": 30 })
        );
        assert_eq!(groups["limits"], 2);
    }
}
