use super::Store;
use crate::registry::lookup;
use crate::validator::{self, ValidationContext};
use futures::future::join_all;
use indexmap::IndexSet;
use shared::FieldKey;

impl Store {
    /// Validates one field and replaces its errors with the outcome.
    ///
    /// Fields without a rule are valid and end up with no errors. When a newer
    /// validation of the same field starts before this one finishes, this
    /// result is dropped.
    pub async fn validate(&self, key: impl Into<FieldKey>) -> bool {
        let key = key.into();
        let (rule, generation, value, context, row) = {
            let mut state = self.state();
            let Some(rule) = lookup(&state.rules, &key).cloned() else {
                state.set_errors(&key, Vec::new());
                return true;
            };
            let generation = state.next_generation();
            state.validation_generations.insert(key.clone(), generation);
            state.set_validating(&key, true);

            let context = ValidationContext {
                key: key.clone(),
                values: state.values(),
                mode: state.mode,
            };
            (rule, generation, state.value(&key), context, state.row_context(&key))
        };

        let result = validator::validate(value, &rule, context, row).await;
        let valid = result.valid;

        let mut state = self.state();
        if state.validation_generations.get(&key) != Some(&generation) {
            log::debug!("[store] dropping superseded validation of {}", key);
            return valid;
        }
        state.set_errors(&key, result.into_errors());
        state.set_validating(&key, false);
        valid
    }

    /// Validates every field that has a rule, template rules once per row.
    pub async fn validate_all(&self) -> bool {
        let keys = self.validation_keys();
        join_all(keys.into_iter().map(|key| self.validate(key)))
            .await
            .into_iter()
            .all(|valid| valid)
    }

    pub fn is_field_valid(&self, key: impl Into<FieldKey>) -> bool {
        self.state()
            .fields
            .get(&key.into())
            .is_none_or(|field| field.errors.is_empty())
    }

    pub fn is_valid(&self) -> bool {
        self.state()
            .fields
            .values()
            .all(|field| field.errors.is_empty())
    }

    fn validation_keys(&self) -> Vec<FieldKey> {
        let state = self.state();
        let mut keys = IndexSet::new();
        for key in state.rules.keys() {
            match &key.group {
                Some(group) if key.is_template() => {
                    keys.extend((0..state.row_count(group)).map(|row| key.at_row(row)));
                }
                _ => {
                    if state.row_exists(key) {
                        keys.insert(key.clone());
                    }
                }
            }
        }
        keys.into_iter().collect()
    }

    /// Second and third propagation passes of one value change: dependents
    /// from the validation graph, then targets of the field's validate
    /// effects. Targets without a rule or on a missing row are skipped.
    pub(crate) async fn revalidate_after_change(&self, source: &FieldKey) {
        let targets: Vec<FieldKey> = {
            let state = self.state();
            let mut targets: IndexSet<FieldKey> = state
                .dependents(&state.validation_graph, source)
                .into_iter()
                .collect();

            let group = state.group_of(source);
            let row = state.row_of(source);
            for effect in lookup(&state.validate_effects, source).into_iter().flatten() {
                targets.extend(effect.targets(source, group.as_ref(), row));
            }

            targets
                .into_iter()
                .filter(|target| state.has_rule(target) && state.row_exists(target))
                .collect()
        };

        if targets.is_empty() {
            return;
        }
        log::debug!("[store] {} changed, re-validating {} field(s)", source, targets.len());
        join_all(targets.into_iter().map(|target| self.validate(target))).await;
    }

    /// Re-runs validations that a row move left without a current result.
    pub(crate) fn revalidate_stale(&self, keys: Vec<FieldKey>) {
        if keys.is_empty() {
            return;
        }
        let store = self.clone();
        let work = self.begin_work();
        tokio::spawn(async move {
            let _work = work;
            join_all(keys.into_iter().map(|key| store.validate(key))).await;
        });
    }
}
