//! Stateless rule evaluation.
//!
//! [`validate`] checks one value against one [`ValidationRule`] in a fixed order:
//! transform, required, empty short-circuit, pattern, length and bounds, and
//! finally the optional async custom validator.

use crate::row::{RowContext, RowValues};
use crate::state::FieldValues;
use futures::FutureExt;
use futures::future::BoxFuture;
use regex::Regex;
use shared::{FieldKey, FieldValue, FormMode};
use std::future::Future;
use std::sync::Arc;

pub type TransformFn = Arc<dyn Fn(Option<FieldValue>) -> Option<FieldValue> + Send + Sync>;

pub type CustomValidator =
    Arc<dyn Fn(ValidatorArgs) -> BoxFuture<'static, anyhow::Result<ValidatorVerdict>> + Send + Sync>;

/// What a custom validator decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidatorVerdict {
    Valid,
    /// Invalid, reported with the rule's message.
    Invalid,
    /// Invalid, reported with this message.
    Message(String),
}

impl From<bool> for ValidatorVerdict {
    fn from(valid: bool) -> Self {
        if valid { Self::Valid } else { Self::Invalid }
    }
}

impl From<String> for ValidatorVerdict {
    fn from(message: String) -> Self {
        Self::Message(message)
    }
}

impl From<&str> for ValidatorVerdict {
    fn from(message: &str) -> Self {
        Self::Message(message.to_string())
    }
}

#[derive(Clone, Default)]
pub struct ValidationRule {
    pub required: bool,
    /// Overrides every built-in message of this rule.
    pub message: Option<String>,
    pub pattern: Option<Regex>,
    pub len: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub transform: Option<TransformFn>,
    pub validator: Option<CustomValidator>,
    /// Re-validate this field when any of these fields change.
    pub dependent_fields: Vec<String>,
    /// Re-validate these fields when this field changes.
    pub affect_fields: Vec<String>,
}

impl ValidationRule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required() -> Self {
        Self {
            required: true,
            ..Self::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_pattern(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.pattern = Some(Regex::new(pattern)?);
        Ok(self)
    }

    pub fn with_len(mut self, len: f64) -> Self {
        self.len = Some(len);
        self
    }

    pub fn with_min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn with_max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn with_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(Option<FieldValue>) -> Option<FieldValue> + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }

    pub fn with_validator<F, Fut, V>(mut self, validator: F) -> Self
    where
        F: Fn(ValidatorArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
        V: Into<ValidatorVerdict> + 'static,
    {
        self.validator = Some(Arc::new(move |args| {
            validator(args).map(|result| result.map(Into::into)).boxed()
        }));
        self
    }

    pub fn with_dependent_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependent_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_affect_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.affect_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    fn message_or(&self, fallback: impl FnOnce() -> String) -> String {
        self.message.clone().unwrap_or_else(fallback)
    }
}

impl std::fmt::Debug for ValidationRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationRule")
            .field("required", &self.required)
            .field("message", &self.message)
            .field("pattern", &self.pattern.as_ref().map(Regex::as_str))
            .field("len", &self.len)
            .field("min", &self.min)
            .field("max", &self.max)
            .field("transform", &self.transform.is_some())
            .field("validator", &self.validator.is_some())
            .field("dependent_fields", &self.dependent_fields)
            .field("affect_fields", &self.affect_fields)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ValidationContext {
    pub key: FieldKey,
    pub values: FieldValues,
    pub mode: FormMode,
}

/// Everything a custom validator gets to look at.
#[derive(Debug, Clone)]
pub struct ValidatorArgs {
    pub value: Option<FieldValue>,
    pub context: ValidationContext,
    pub row: Option<RowContext>,
    /// Values of the validated field's row, keyed by field id.
    pub row_values: RowValues,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub valid: bool,
    pub message: Option<String>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            valid: true,
            message: None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            message: Some(message.into()),
        }
    }

    pub fn into_errors(self) -> Vec<String> {
        match self.message {
            Some(message) if !self.valid => vec![message],
            _ => Vec::new(),
        }
    }
}

pub fn is_empty(value: Option<&FieldValue>) -> bool {
    match value {
        None | Some(FieldValue::Null) => true,
        Some(FieldValue::String(text)) => text.is_empty(),
        Some(_) => false,
    }
}

/// Same-row values of `key`, keyed by field id. Empty for keys outside a row.
pub fn row_values_of(key: &FieldKey, values: &FieldValues) -> RowValues {
    values
        .iter()
        .filter(|(other, _)| key.same_row(other))
        .map(|(other, value)| (other.field.clone(), value.clone()))
        .collect()
}

/// Size used by `len`/`min`/`max`: character count for strings, the value for
/// numbers, element count for arrays.
fn measure(value: &FieldValue) -> Option<f64> {
    match value {
        FieldValue::String(text) => Some(text.chars().count() as f64),
        FieldValue::Number(number) => number.as_f64(),
        FieldValue::Array(items) => Some(items.len() as f64),
        _ => None,
    }
}

fn check_pattern(value: &FieldValue, pattern: &Regex) -> bool {
    match value {
        FieldValue::String(text) => pattern.is_match(text),
        FieldValue::Number(number) => pattern.is_match(&number.to_string()),
        _ => true,
    }
}

fn check_bounds(value: &FieldValue, rule: &ValidationRule) -> Option<String> {
    let size = measure(value)?;
    let unit = match value {
        FieldValue::Number(_) => "",
        FieldValue::Array(_) => " item(s)",
        _ => " character(s)",
    };

    if let Some(len) = rule.len {
        if size != len {
            return Some(rule.message_or(|| format!("Must be exactly {}{}", len, unit)));
        }
    }
    if let Some(min) = rule.min {
        if size < min {
            return Some(rule.message_or(|| format!("Must be at least {}{}", min, unit)));
        }
    }
    if let Some(max) = rule.max {
        if size > max {
            return Some(rule.message_or(|| format!("Must be at most {}{}", max, unit)));
        }
    }
    None
}

pub async fn validate(
    value: Option<FieldValue>,
    rule: &ValidationRule,
    context: ValidationContext,
    row: Option<RowContext>,
) -> ValidationResult {
    let value = match &rule.transform {
        Some(transform) => transform(value),
        None => value,
    };

    if is_empty(value.as_ref()) {
        if rule.required {
            return ValidationResult::invalid(rule.message_or(|| "This field is required".to_string()));
        }
        return ValidationResult::valid();
    }

    if let (Some(current), Some(pattern)) = (&value, &rule.pattern) {
        if !check_pattern(current, pattern) {
            return ValidationResult::invalid(rule.message_or(|| "Invalid format".to_string()));
        }
    }

    if let Some(message) = value.as_ref().and_then(|current| check_bounds(current, rule)) {
        return ValidationResult::invalid(message);
    }

    let Some(validator) = &rule.validator else {
        return ValidationResult::valid();
    };

    let key = context.key.clone();
    let row_values = row_values_of(&key, &context.values);
    let args = ValidatorArgs {
        value,
        context,
        row,
        row_values,
    };

    match validator(args).await {
        Ok(ValidatorVerdict::Valid) => ValidationResult::valid(),
        Ok(ValidatorVerdict::Invalid) => {
            ValidationResult::invalid(rule.message_or(|| "Invalid value".to_string()))
        }
        Ok(ValidatorVerdict::Message(message)) => ValidationResult::invalid(message),
        Err(error) => {
            log::error!("[validator] custom validator for {} failed: {:#}", key, error);
            ValidationResult::invalid(format!("{:#}", error))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(key: FieldKey) -> ValidationContext {
        ValidationContext {
            key,
            values: FieldValues::new(),
            mode: FormMode::Create,
        }
    }

    async fn check(value: Option<FieldValue>, rule: &ValidationRule) -> ValidationResult {
        validate(value, rule, context(FieldKey::new("field")), None).await
    }

    #[tokio::test]
    async fn test_required_rejects_empty_values() {
        let rule = ValidationRule::required();
        for empty in [None, Some(json!(null)), Some(json!(""))] {
            let result = check(empty, &rule).await;
            assert!(!result.valid);
            assert_eq!(result.message.as_deref(), Some("This field is required"));
        }
        assert!(check(Some(json!(0)), &rule).await.valid);
    }

    #[tokio::test]
    async fn test_empty_optional_value_short_circuits() {
        let rule = ValidationRule::new()
            .with_min(3.0)
            .with_validator(|_| async { Ok(false) });
        assert!(check(Some(json!("")), &rule).await.valid);
    }

    #[tokio::test]
    async fn test_string_bounds_compare_length() {
        let rule = ValidationRule::new().with_max(3.0);
        assert!(check(Some(json!("999")), &rule).await.valid);
        assert!(!check(Some(json!("1000")), &rule).await.valid);

        let rule = ValidationRule::new().with_max(3.0);
        assert!(!check(Some(json!(999)), &rule).await.valid);
    }

    #[tokio::test]
    async fn test_pattern_and_custom_message() {
        let rule = ValidationRule::new()
            .with_pattern(r"^\d+$")
            .unwrap()
            .with_message("digits only");
        assert_eq!(
            check(Some(json!("12a")), &rule).await,
            ValidationResult::invalid("digits only")
        );
        assert!(check(Some(json!(42)), &rule).await.valid);
    }

    #[tokio::test]
    async fn test_transform_runs_first() {
        let rule = ValidationRule::required().with_transform(|value| match value {
            Some(FieldValue::String(text)) => Some(json!(text.trim())),
            other => other,
        });
        assert!(!check(Some(json!("   ")), &rule).await.valid);
    }

    #[tokio::test]
    async fn test_custom_validator_verdicts() {
        let rule = ValidationRule::new()
            .with_message("rule message")
            .with_validator(|args| async move { Ok(args.value != Some(json!("bad"))) });
        assert_eq!(
            check(Some(json!("bad")), &rule).await,
            ValidationResult::invalid("rule message")
        );

        let rule = ValidationRule::new().with_validator(|_| async { Ok("taken") });
        assert_eq!(
            check(Some(json!("x")), &rule).await,
            ValidationResult::invalid("taken")
        );

        let rule = ValidationRule::new()
            .with_validator(|_| async { Err::<bool, _>(anyhow::anyhow!("lookup failed")) });
        assert_eq!(
            check(Some(json!("x")), &rule).await,
            ValidationResult::invalid("lookup failed")
        );
    }

    #[tokio::test]
    async fn test_custom_validator_sees_row_values() {
        let key = FieldKey::row("limits", 1, "max");
        let mut values = FieldValues::new();
        values.insert(FieldKey::row("limits", 1, "min"), json!(10));
        values.insert(FieldKey::row("limits", 0, "min"), json!(99));
        values.insert(key.clone(), json!(5));

        let rule = ValidationRule::new().with_validator(|args| async move {
            let min = args.row_values.get("min").and_then(FieldValue::as_f64).unwrap_or_default();
            let max = args.value.as_ref().and_then(FieldValue::as_f64).unwrap_or_default();
            Ok(if max >= min { ValidatorVerdict::Valid } else { "max below min".into() })
        });

        let result = validate(
            Some(json!(5)),
            &rule,
            ValidationContext {
                key,
                values,
                mode: FormMode::Edit,
            },
            None,
        )
        .await;
        assert_eq!(result, ValidationResult::invalid("max below min"));
    }
}
