//! Store-owned state and its write helpers.
//!
//! Everything a store knows lives in one [`StoreState`] behind the store's
//! mutex. Writes go through the helpers below so every observable change is
//! published exactly once, and equal writes publish nothing.

use crate::effects::{Action, Effect, ProcessingBatches};
use crate::init::{InitPhase, InitState};
use crate::notify::{FieldChange, FormEvent, Notifier};
use crate::registry::{DependencyGraph, ValidateEffect, is_form_level, lookup, shift_group_key, shift_group_map};
use crate::requests::RequestRegistry;
use crate::row::{RowContext, RowInfo, RowValues};
use crate::state::{FieldState, FieldValues, FormFlags};
use crate::validator::{ValidationRule, row_values_of};
use futures::future::BoxFuture;
use indexmap::{IndexMap, IndexSet};
use shared::{FieldKey, FieldProps, FieldValue, FormMode, GroupId, RequestState};
use std::sync::Arc;

pub type SubmitHandler =
    Arc<dyn Fn(FieldValues) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FormFlag {
    Submitting,
    Submitted,
    Processing,
    Disabled,
    Requesting,
}

#[derive(Default)]
pub(crate) struct StoreState {
    pub fields: IndexMap<FieldKey, FieldState>,
    pub initial_values: FieldValues,
    pub initial_groups: IndexMap<GroupId, usize>,
    pub groups: IndexMap<GroupId, usize>,
    pub row_infos: IndexMap<FieldKey, RowInfo>,
    pub flags: FormFlags,
    pub mode: FormMode,
    pub notifier: Notifier,

    pub rules: IndexMap<FieldKey, ValidationRule>,
    /// changed field -> fields to re-validate
    pub validation_graph: DependencyGraph,
    /// Field ids passed to `register_field_dependencies`, per field.
    pub dependency_registrations: IndexMap<FieldKey, Vec<String>>,
    /// Field ids passed to `register_field_affects`, per field.
    pub affect_registrations: IndexMap<FieldKey, Vec<String>>,
    pub validate_effects: IndexMap<FieldKey, Vec<ValidateEffect>>,
    pub validation_generations: IndexMap<FieldKey, u64>,

    pub effects: IndexMap<FieldKey, Effect>,
    pub actions: IndexMap<FieldKey, Action>,
    /// trigger field -> fields whose action it runs
    pub action_graph: DependencyGraph,
    pub processing: ProcessingBatches,

    pub requests: RequestRegistry,
    pub init: InitState,
    pub on_submit: Option<SubmitHandler>,

    generation: u64,
    pub destroyed: bool,
}

impl StoreState {
    pub fn new(initial_values: FieldValues, initial_groups: IndexMap<GroupId, usize>, mode: FormMode) -> Self {
        let mut state = Self {
            initial_groups: initial_groups.clone(),
            groups: initial_groups,
            mode,
            ..Self::default()
        };
        state.load_initial(initial_values);
        state
    }

    /// Replaces every value with `initial_values` and remembers them for
    /// dirty tracking and reset.
    pub fn load_initial(&mut self, initial_values: FieldValues) {
        for (key, value) in &initial_values {
            self.fields.entry(key.clone()).or_default().value = Some(value.clone());
        }
        self.initial_values = initial_values;
    }

    /// Store-wide counter, so generations never repeat across keys.
    pub fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub fn init_settled(&self) -> bool {
        self.init.phase == InitPhase::Settled
    }

    // ===== READS =====

    pub fn value(&self, key: &FieldKey) -> Option<FieldValue> {
        self.fields.get(key).and_then(|field| field.value.clone())
    }

    pub fn values(&self) -> FieldValues {
        self.fields
            .iter()
            .filter_map(|(key, field)| Some((key.clone(), field.value.clone()?)))
            .collect()
    }

    pub fn errors(&self) -> IndexMap<FieldKey, Vec<String>> {
        self.fields
            .iter()
            .filter(|(_, field)| !field.errors.is_empty())
            .map(|(key, field)| (key.clone(), field.errors.clone()))
            .collect()
    }

    pub fn has_rule(&self, key: &FieldKey) -> bool {
        lookup(&self.rules, key).is_some()
    }

    pub fn row_count(&self, group: &str) -> usize {
        self.groups.get(group).copied().unwrap_or_default()
    }

    /// Row index of `key`: from the key itself, else from a registered row info.
    pub fn row_of(&self, key: &FieldKey) -> Option<usize> {
        key.row
            .or_else(|| lookup(&self.row_infos, key).map(|info| info.current_row))
    }

    /// Group of `key`: from the key itself, else from a registered row info.
    pub fn group_of(&self, key: &FieldKey) -> Option<GroupId> {
        key.group
            .clone()
            .or_else(|| lookup(&self.row_infos, key).and_then(|info| info.group.clone()))
    }

    /// Concrete fields reached from `source` through `graph`.
    ///
    /// Template dependents reached from outside their row expand to every row
    /// of their group. An edge between a form-level field and a row field is
    /// ignored when the row has its own field of the form-level name.
    pub fn dependents(&self, graph: &DependencyGraph, source: &FieldKey) -> Vec<FieldKey> {
        let mut found = IndexSet::new();
        for dependent in graph.dependents_of(source) {
            if self.shadowed(source, &dependent) {
                continue;
            }
            match &dependent.group {
                Some(group) if dependent.is_template() => {
                    found.extend((0..self.row_count(group)).map(|row| dependent.at_row(row)));
                }
                _ => {
                    found.insert(dependent);
                }
            }
        }
        found.shift_remove(source);
        found.into_iter().collect()
    }

    fn shadowed(&self, source: &FieldKey, dependent: &FieldKey) -> bool {
        let (plain, scoped) = match (is_form_level(source), is_form_level(dependent)) {
            (true, false) => (source, dependent),
            (false, true) => (dependent, source),
            _ => return false,
        };
        self.row_scope_has_field(&scoped.group, &plain.field)
    }

    /// Whether rows of `group` know a field named `field`, by value or by
    /// any registration.
    fn row_scope_has_field(&self, group: &Option<GroupId>, field: &str) -> bool {
        let in_scope =
            |key: &FieldKey| &key.group == group && (key.row.is_some() || key.is_template()) && key.field == field;
        self.fields.keys().any(in_scope)
            || self.rules.keys().any(in_scope)
            || self.effects.keys().any(in_scope)
            || self.actions.keys().any(in_scope)
            || self.row_infos.keys().any(in_scope)
            || self.requests.configs.keys().any(in_scope)
    }

    /// False for row keys pointing past the end of their group.
    pub fn row_exists(&self, key: &FieldKey) -> bool {
        let Some(row) = key.row else {
            return true;
        };
        match &key.group {
            Some(group) if self.groups.contains_key(group) => row < self.row_count(group),
            _ => self
                .fields
                .keys()
                .any(|other| other.group == key.group && other.row == Some(row)),
        }
    }

    fn implicit_row_count(&self, group: &Option<GroupId>) -> usize {
        self.fields
            .keys()
            .filter(|key| &key.group == group)
            .filter_map(|key| key.row)
            .max()
            .map_or(0, |row| row + 1)
    }

    fn row_snapshot(&self, group: &Option<GroupId>, row: usize) -> RowValues {
        self.fields
            .iter()
            .filter(|(key, _)| &key.group == group && key.row == Some(row))
            .filter_map(|(key, field)| Some((key.field.clone(), field.value.clone()?)))
            .collect()
    }

    pub fn group_rows(&self, group: &str) -> Vec<RowValues> {
        let owner = Some(group.to_string());
        (0..self.row_count(group))
            .map(|row| self.row_snapshot(&owner, row))
            .collect()
    }

    pub fn row_values(&self, key: &FieldKey) -> RowValues {
        row_values_of(key, &self.values())
    }

    /// Builds the row snapshot of `key`, or `None` for fields outside any row.
    pub fn row_context(&self, key: &FieldKey) -> Option<RowContext> {
        let registered = lookup(&self.row_infos, key);
        let row = self.row_of(key)?;
        let group = key
            .group
            .clone()
            .or_else(|| registered.and_then(|info| info.group.clone()));
        let total_rows = match &group {
            Some(name) if self.groups.contains_key(name) => self.row_count(name),
            _ => registered
                .map(|info| info.total_rows)
                .unwrap_or_else(|| self.implicit_row_count(&group))
                .max(row + 1),
        };
        let rows = (0..total_rows).map(|index| self.row_snapshot(&group, index)).collect();
        Some(RowContext::build(RowInfo::new(group, row, total_rows), rows))
    }

    // ===== WRITES =====

    /// Engine write: publishes and reports a change only if the value differs.
    pub fn write_value(&mut self, key: &FieldKey, value: Option<FieldValue>) -> bool {
        if self.value(key) == value {
            return false;
        }
        self.store_value(key, value);
        true
    }

    /// Host write: always publishes and marks the field touched.
    pub fn force_write_value(&mut self, key: &FieldKey, value: Option<FieldValue>) {
        self.store_value(key, value);
        self.set_touched(key, true);
    }

    fn store_value(&mut self, key: &FieldKey, value: Option<FieldValue>) {
        let dirty = self.initial_values.get(key) != value.as_ref();
        let field = self.fields.entry(key.clone()).or_default();
        field.value = value.clone();
        field.dirty = dirty;
        self.notifier.publish_field(key, FieldChange::Value(value));
    }

    pub fn set_touched(&mut self, key: &FieldKey, touched: bool) {
        let field = self.fields.entry(key.clone()).or_default();
        if field.touched != touched {
            field.touched = touched;
            self.notifier.publish_field(key, FieldChange::Touched(touched));
        }
    }

    pub fn set_errors(&mut self, key: &FieldKey, errors: Vec<String>) -> bool {
        let field = self.fields.entry(key.clone()).or_default();
        if field.errors == errors {
            return false;
        }
        field.errors = errors.clone();
        self.notifier.publish_field(key, FieldChange::Errors(errors));
        true
    }

    pub fn set_validating(&mut self, key: &FieldKey, validating: bool) {
        let field = self.fields.entry(key.clone()).or_default();
        if field.validating != validating {
            field.validating = validating;
            self.notifier.publish_field(key, FieldChange::Validating(validating));
        }
    }

    pub fn set_field_processing(&mut self, key: &FieldKey, processing: bool) {
        let field = self.fields.entry(key.clone()).or_default();
        if field.processing != processing {
            field.processing = processing;
            self.notifier.publish_field(key, FieldChange::Processing(processing));
        }
    }

    /// Shallow merge into the field's props.
    pub fn merge_props(&mut self, key: &FieldKey, props: FieldProps) -> bool {
        let field = self.fields.entry(key.clone()).or_default();
        let mut merged = field.props.clone();
        merged.extend(props);
        if merged == field.props {
            return false;
        }
        field.props = merged.clone();
        self.notifier.publish_field(key, FieldChange::Props(merged));
        true
    }

    pub fn replace_props(&mut self, key: &FieldKey, props: FieldProps) {
        let field = self.fields.entry(key.clone()).or_default();
        if field.props != props {
            field.props = props.clone();
            self.notifier.publish_field(key, FieldChange::Props(props));
        }
    }

    pub fn set_request_state(&mut self, key: &FieldKey, state: RequestState) {
        if self.requests.states.get(key) == Some(&state) {
            return;
        }
        self.requests.states.insert(key.clone(), state.clone());
        self.publish_request_state(key, state);
    }

    pub fn publish_request_state(&mut self, key: &FieldKey, state: RequestState) {
        self.notifier.publish_field(key, FieldChange::Request(state));
    }

    pub fn set_flag(&mut self, flag: FormFlag, on: bool) -> bool {
        let (slot, event): (&mut bool, fn(bool) -> FormEvent) = match flag {
            FormFlag::Submitting => (&mut self.flags.submitting, FormEvent::Submitting),
            FormFlag::Submitted => (&mut self.flags.submitted, FormEvent::Submitted),
            FormFlag::Processing => (&mut self.flags.processing, FormEvent::Processing),
            FormFlag::Disabled => (&mut self.flags.disabled, FormEvent::Disabled),
            FormFlag::Requesting => (&mut self.flags.requesting, FormEvent::Requesting),
        };
        if *slot == on {
            return false;
        }
        *slot = on;
        self.notifier.publish_form(event(on));
        true
    }

    // ===== ROWS =====

    /// Moves every row-keyed entry of `group` through `shift`. Rows mapped to
    /// `None` are forgotten.
    pub fn shift_group(&mut self, group: &GroupId, shift: impl Fn(usize) -> Option<usize>) {
        shift_group_map(&mut self.fields, group, &shift);
        shift_group_map(&mut self.rules, group, &shift);
        shift_group_map(&mut self.dependency_registrations, group, &shift);
        shift_group_map(&mut self.affect_registrations, group, &shift);
        shift_group_map(&mut self.validate_effects, group, &shift);
        shift_group_map(&mut self.validation_generations, group, &shift);
        shift_group_map(&mut self.effects, group, &shift);
        shift_group_map(&mut self.actions, group, &shift);
        shift_group_map(&mut self.row_infos, group, &shift);

        self.validation_graph
            .remap(|key| shift_group_key(key, group, &shift));
        self.action_graph
            .remap(|key| shift_group_key(key, group, &shift));
        self.requests.shift_group(group, &shift);
        self.notifier
            .remap(|key| shift_group_key(key, group, &shift));
    }

    /// Brings registered row infos of `group` in line with its keys and size.
    pub fn refresh_row_infos(&mut self, group: &GroupId) {
        let total_rows = self.row_count(group);
        for (key, info) in self.row_infos.iter_mut() {
            if key.group.as_ref() != Some(group) {
                continue;
            }
            let current_row = key.row.unwrap_or(info.current_row);
            *info = RowInfo::new(Some(group.clone()), current_row, total_rows);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> StoreState {
        let values = FieldValues::from([
            (FieldKey::new("name"), json!("Ada")),
            (FieldKey::row("lines", 0, "qty"), json!(1)),
            (FieldKey::row("lines", 1, "qty"), json!(2)),
        ]);
        StoreState::new(values, IndexMap::from([("lines".to_string(), 2)]), FormMode::Create)
    }

    #[test]
    fn test_write_value_tracks_dirty_and_skips_equal_writes() {
        let mut state = state();
        let name = FieldKey::new("name");

        assert!(!state.write_value(&name, Some(json!("Ada"))));
        assert!(state.write_value(&name, Some(json!("Grace"))));
        assert!(state.fields[&name].dirty);
        assert!(state.write_value(&name, Some(json!("Ada"))));
        assert!(!state.fields[&name].dirty);
        assert!(!state.fields[&name].touched);
    }

    #[test]
    fn test_row_context_uses_group_size() {
        let state = state();
        let context = state.row_context(&FieldKey::row("lines", 0, "qty")).unwrap();
        assert_eq!(context.total_rows(), 2);
        assert!(!context.is_last());
        assert_eq!(context.row_value(1, "qty"), Some(&json!(2)));
        assert!(state.row_context(&FieldKey::new("name")).is_none());
    }

    #[test]
    fn test_row_exists() {
        let state = state();
        assert!(state.row_exists(&FieldKey::row("lines", 1, "qty")));
        assert!(!state.row_exists(&FieldKey::row("lines", 2, "qty")));
        assert!(state.row_exists(&FieldKey::new("anything")));
    }

    #[test]
    fn test_shift_group_moves_values_down() {
        let mut state = state();
        state.shift_group(&"lines".to_string(), |row| match row {
            0 => None,
            row => Some(row - 1),
        });
        assert_eq!(state.value(&FieldKey::row("lines", 0, "qty")), Some(json!(2)));
        assert_eq!(state.value(&FieldKey::row("lines", 1, "qty")), None);
    }

    #[test]
    fn test_merge_props_is_shallow() {
        let mut state = state();
        let key = FieldKey::new("name");
        let mut props = FieldProps::new();
        props.insert("label".to_string(), json!("Name"));
        assert!(state.merge_props(&key, props.clone()));
        assert!(!state.merge_props(&key, props));

        let mut more = FieldProps::new();
        more.insert("hidden".to_string(), json!(true));
        assert!(state.merge_props(&key, more));
        assert_eq!(state.fields[&key].props.len(), 2);
    }
}
