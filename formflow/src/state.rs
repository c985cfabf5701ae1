//! Field and form state as exposed by the store.

use indexmap::IndexMap;
use serde::Serialize;
use shared::{FieldKey, FieldProps, FieldValue};

pub type FieldValues = IndexMap<FieldKey, FieldValue>;

/// Partial updates returned by effects, actions and row helpers.
pub type FieldUpdates = IndexMap<FieldKey, FieldUpdate>;

#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct FieldState {
    pub value: Option<FieldValue>,
    pub touched: bool,
    pub dirty: bool,
    pub errors: Vec<String>,
    pub validating: bool,
    pub processing: bool,
    #[serde(rename = "fieldProps")]
    pub props: FieldProps,
}

impl FieldState {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A partial write to one field: its value, its props, or both.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldUpdate {
    /// `Some(None)` clears the value.
    pub value: Option<Option<FieldValue>>,
    /// Shallow-merged into the field's current props.
    pub props: Option<FieldProps>,
}

impl FieldUpdate {
    pub fn value(value: FieldValue) -> Self {
        Self {
            value: Some(Some(value)),
            props: None,
        }
    }

    pub fn clear() -> Self {
        Self {
            value: Some(None),
            props: None,
        }
    }

    pub fn props(props: FieldProps) -> Self {
        Self {
            value: None,
            props: Some(props),
        }
    }

    pub fn with_props(mut self, props: FieldProps) -> Self {
        self.props = Some(props);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.props.is_none()
    }
}

#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormFlags {
    pub submitting: bool,
    pub submitted: bool,
    pub processing: bool,
    pub disabled: bool,
    pub requesting: bool,
}
