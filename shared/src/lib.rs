use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

// ===== VALUE TYPES =====

/// Any serialisable field value. "undefined" is the absence of a value.
pub type FieldValue = serde_json::Value;

/// Free-form properties attached to a field (options, labels, visibility...).
pub type FieldProps = serde_json::Map<String, serde_json::Value>;

pub type GroupId = String;

/// Identity of a field inside one store.
///
/// Plain fields only carry `field`. Fields inside a dynamic group also carry the
/// group and the row index; a grouped key without a row is a template key whose
/// configuration applies to every row of the group.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldKey {
    pub group: Option<GroupId>,
    pub row: Option<usize>,
    pub field: String,
}

impl FieldKey {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            group: None,
            row: None,
            field: field.into(),
        }
    }

    pub fn row(group: impl Into<GroupId>, row: usize, field: impl Into<String>) -> Self {
        Self {
            group: Some(group.into()),
            row: Some(row),
            field: field.into(),
        }
    }

    pub fn template(group: impl Into<GroupId>, field: impl Into<String>) -> Self {
        Self {
            group: Some(group.into()),
            row: None,
            field: field.into(),
        }
    }

    /// Recover a key from the runtime string form `{row}_{field}`.
    ///
    /// Strings that do not start with a row index become plain keys.
    pub fn parse(raw: &str) -> Self {
        if let Some((prefix, field)) = raw.split_once('_') {
            if !prefix.is_empty() && !field.is_empty() && prefix.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(row) = prefix.parse::<usize>() {
                    return Self {
                        group: None,
                        row: Some(row),
                        field: field.to_string(),
                    };
                }
            }
        }
        Self::new(raw)
    }

    pub fn is_template(&self) -> bool {
        self.group.is_some() && self.row.is_none()
    }

    /// The group-independent key used to look up configuration registered once
    /// for every row.
    pub fn template_key(&self) -> Option<FieldKey> {
        self.row.map(|_| Self {
            group: self.group.clone(),
            row: None,
            field: self.field.clone(),
        })
    }

    /// Same group and field at another row.
    pub fn at_row(&self, row: usize) -> FieldKey {
        Self {
            group: self.group.clone(),
            row: Some(row),
            field: self.field.clone(),
        }
    }

    /// Another field in the same group and row.
    pub fn sibling(&self, field: impl Into<String>) -> FieldKey {
        Self {
            group: self.group.clone(),
            row: self.row,
            field: field.into(),
        }
    }

    pub fn same_row(&self, other: &FieldKey) -> bool {
        self.row.is_some() && self.group == other.group && self.row == other.row
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.row, &self.group) {
            (Some(row), _) => write!(f, "{}_{}", row, self.field),
            (None, Some(group)) => write!(f, "{}[*].{}", group, self.field),
            (None, None) => f.write_str(&self.field),
        }
    }
}

impl From<&str> for FieldKey {
    fn from(raw: &str) -> Self {
        FieldKey::parse(raw)
    }
}

impl From<String> for FieldKey {
    fn from(raw: String) -> Self {
        FieldKey::parse(&raw)
    }
}

// ===== FORM STATE TYPES =====

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FormMode {
    #[default]
    Create,
    Edit,
    View,
}

/// Outcome of an asynchronous data request, as exposed to the rendering layer.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RequestState {
    #[serde(rename = "successed")]
    pub succeeded: bool,
    pub data: Option<FieldValue>,
    pub error: Option<String>,
    pub loading: bool,
}

impl RequestState {
    pub fn loading() -> Self {
        Self {
            loading: true,
            ..Self::default()
        }
    }

    pub fn success(data: FieldValue) -> Self {
        Self {
            succeeded: true,
            data: Some(data),
            error: None,
            loading: false,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            data: None,
            error: Some(error.into()),
            loading: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub queued: usize,
    pub running: usize,
    pub max_concurrent: usize,
}

impl SchedulerStatus {
    pub fn is_running(&self) -> bool {
        self.queued > 0 || self.running > 0
    }
}

// ===== CONFIG TYPES =====

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct StoreConfig {
    #[serde(default)]
    pub concurrency: ConcurrencySection,
    #[serde(default)]
    pub timing: TimingSection,
    #[serde(default)]
    pub form: FormSection,
}

impl StoreConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ConcurrencySection {
    pub effects: usize,
    pub requests: usize,
}

impl ConcurrencySection {
    pub const DEFAULT_EFFECTS: usize = 3;
    pub const DEFAULT_REQUESTS: usize = 5;
}

impl Default for ConcurrencySection {
    fn default() -> Self {
        Self {
            effects: Self::DEFAULT_EFFECTS,
            requests: Self::DEFAULT_REQUESTS,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TimingSection {
    pub processing_debounce_ms: u64,
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            processing_debounce_ms: 100,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct FormSection {
    #[serde(default)]
    pub mode: FormMode,
    /// Initial values keyed by runtime field key (`name`, `0_amount`, ...).
    #[serde(default)]
    pub initial_values: IndexMap<String, FieldValue>,
    /// Initial rows of dynamic groups, one `field -> value` table per row.
    #[serde(default)]
    pub groups: IndexMap<GroupId, Vec<IndexMap<String, FieldValue>>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_row_key() {
        let key = FieldKey::parse("12_threshold");
        assert_eq!(key.row, Some(12));
        assert_eq!(key.field, "threshold");
        assert_eq!(key.to_string(), "12_threshold");
    }

    #[test]
    fn test_parse_plain_key_with_underscore() {
        let key = FieldKey::parse("first_name");
        assert_eq!(key, FieldKey::new("first_name"));

        let key = FieldKey::parse("_hidden");
        assert_eq!(key, FieldKey::new("_hidden"));
    }

    #[test]
    fn test_template_key_keeps_group() {
        let key = FieldKey::row("limits", 3, "threshold");
        assert_eq!(key.template_key(), Some(FieldKey::template("limits", "threshold")));
        assert!(FieldKey::template("limits", "threshold").is_template());
        assert_eq!(FieldKey::new("name").template_key(), None);
    }

    #[test]
    fn test_sibling_and_at_row() {
        let key = FieldKey::row("limits", 1, "min");
        assert_eq!(key.sibling("max"), FieldKey::row("limits", 1, "max"));
        assert_eq!(key.at_row(2), FieldKey::row("limits", 2, "min"));
        assert!(key.same_row(&key.sibling("max")));
        assert!(!key.same_row(&key.at_row(2)));
    }

    #[test]
    fn test_config_defaults_from_partial_toml() {
        let config = StoreConfig::from_toml_str(
            r#"
            [concurrency]
            effects = 2
            requests = 8

            [form]
            mode = "edit"

            [form.initial_values]
            name = "Ada"
            0_amount = 12

            [[form.groups.limits]]
            threshold = { min = 0, max = 30 }

            [[form.groups.limits]]
            threshold = { min = 30 }
            "#,
        )
        .unwrap();

        assert_eq!(config.concurrency.effects, 2);
        assert_eq!(config.timing.processing_debounce_ms, 100);
        assert_eq!(config.form.mode, FormMode::Edit);
        assert_eq!(config.form.initial_values["name"], serde_json::json!("Ada"));
        assert_eq!(config.form.initial_values["0_amount"], serde_json::json!(12));
        assert_eq!(config.form.groups["limits"].len(), 2);
        assert_eq!(
            config.form.groups["limits"][1]["threshold"],
            serde_json::json!({ "min": 30 })
        );
    }

    #[test]
    fn test_request_state_serialises_legacy_field_name() {
        let json = serde_json::to_value(RequestState::success(serde_json::json!([1]))).unwrap();
        assert_eq!(json["successed"], serde_json::json!(true));
        assert_eq!(json["loading"], serde_json::json!(false));
    }
}
