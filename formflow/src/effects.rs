//! Effects and actions.
//!
//! An [`Effect`] belongs to the field whose change fires it and may write any
//! other field. An [`Action`] belongs to the field it writes and fires when one
//! of its `effected_by` fields changes. Both run on the effect scheduler.
//!
//! Per value change: the effect first, then every matching action, then field
//! requests once the effect scheduler has drained.

use crate::registry::lookup;
use crate::row::{RowContext, RowValues};
use crate::state::{FieldUpdate, FieldUpdates};
use crate::store::{FormFlag, Store};
use anyhow::Context as _;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use indexmap::IndexMap;
use shared::{FieldKey, FieldValue};
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::time::{Duration, sleep};

pub type EffectHandler =
    Arc<dyn Fn(EffectContext) -> BoxFuture<'static, anyhow::Result<FieldUpdates>> + Send + Sync>;

pub type ActionHandler =
    Arc<dyn Fn(ActionContext) -> BoxFuture<'static, anyhow::Result<FieldUpdate>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct Effect {
    /// Field ids cleared before the handler runs, resolved in the changing
    /// field's row.
    pub clear_fields: Vec<String>,
    pub handler: Option<EffectHandler>,
}

impl Effect {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clear_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.clear_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(EffectContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<FieldUpdates>> + Send + 'static,
    {
        self.handler = Some(Arc::new(move |context| handler(context).boxed()));
        self
    }
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect")
            .field("clear_fields", &self.clear_fields)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

#[derive(Clone)]
pub struct Action {
    /// Field ids whose change runs this action: the owning field's row first,
    /// then the form-level field of that id.
    pub effected_by: Vec<String>,
    pub handler: ActionHandler,
}

impl Action {
    pub fn new<I, S, F, Fut>(effected_by: I, handler: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(ActionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<FieldUpdate>> + Send + 'static,
    {
        Self {
            effected_by: effected_by.into_iter().map(Into::into).collect(),
            handler: Arc::new(move |context| handler(context).boxed()),
        }
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("effected_by", &self.effected_by)
            .finish_non_exhaustive()
    }
}

/// Handed to an effect handler.
#[derive(Clone)]
pub struct EffectContext {
    pub store: Store,
    pub key: FieldKey,
    pub value: Option<FieldValue>,
    pub row: Option<RowContext>,
    pub row_values: RowValues,
}

/// Handed to an action handler. `key` is the field the action writes.
#[derive(Clone)]
pub struct ActionContext {
    pub store: Store,
    pub key: FieldKey,
    pub value: Option<FieldValue>,
    pub trigger: FieldKey,
    pub trigger_value: Option<FieldValue>,
    pub row: Option<RowContext>,
}

/// Open effect batches and the field each one belongs to. The form-level
/// `processing` flag is up while any batch that outlived the debounce delay is
/// still open; a field stays processing until its last batch closes.
#[derive(Debug, Default)]
pub(crate) struct ProcessingBatches {
    next_id: u64,
    active: IndexMap<u64, FieldKey>,
}

impl ProcessingBatches {
    pub fn begin(&mut self, key: &FieldKey) -> u64 {
        self.next_id += 1;
        self.active.insert(self.next_id, key.clone());
        self.next_id
    }

    pub fn is_active(&self, id: u64) -> bool {
        self.active.contains_key(&id)
    }

    pub fn is_field_active(&self, key: &FieldKey) -> bool {
        self.active.values().any(|active| active == key)
    }

    /// Returns true once no batch is left open.
    pub fn finish(&mut self, id: u64) -> bool {
        self.active.shift_remove(&id);
        self.active.is_empty()
    }

    pub fn clear(&mut self) {
        self.active.clear();
    }
}

/// Closes its batch on drop, also when the change pass is aborted.
struct ProcessingBatch {
    store: Weak<crate::store::StoreInner>,
    id: u64,
    key: FieldKey,
}

impl Drop for ProcessingBatch {
    fn drop(&mut self) {
        let Some(inner) = self.store.upgrade() else {
            return;
        };
        let store = Store { inner };
        let mut state = store.state();
        let form_idle = state.processing.finish(self.id);
        if !state.processing.is_field_active(&self.key) {
            state.set_field_processing(&self.key, false);
        }
        if form_idle {
            state.set_flag(FormFlag::Processing, false);
        }
    }
}

impl Store {
    /// First propagation pass of one value change.
    pub(crate) async fn run_change(&self, key: &FieldKey, value: Option<FieldValue>) {
        let (effect, actions) = {
            let state = self.state();
            let effect = lookup(&state.effects, key).cloned();
            let actions: Vec<(FieldKey, Action)> = state
                .dependents(&state.action_graph, key)
                .into_iter()
                .filter(|action_key| state.row_exists(action_key))
                .filter_map(|action_key| {
                    let action = lookup(&state.actions, &action_key).cloned()?;
                    Some((action_key, action))
                })
                .collect();
            (effect, actions)
        };

        if effect.is_some() || !actions.is_empty() {
            let _batch = self.begin_processing(key);

            if let Some(effect) = effect {
                self.run_effect(key, value.clone(), effect).await;
            }
            join_all(
                actions
                    .into_iter()
                    .map(|(action_key, action)| self.run_action(action_key, action, key, value.clone())),
            )
            .await;
        }

        self.inner.effect_scheduler.wait_for_completion().await;
        self.trigger_field_requests(key);
    }

    async fn run_effect(&self, key: &FieldKey, value: Option<FieldValue>, effect: Effect) {
        if !effect.clear_fields.is_empty() {
            let cleared: FieldUpdates = effect
                .clear_fields
                .iter()
                .map(|field| (key.sibling(field.as_str()), FieldUpdate::clear()))
                .collect();
            self.apply_updates(cleared);
        }

        let Some(handler) = effect.handler else {
            return;
        };

        let context = {
            let state = self.state();
            EffectContext {
                store: self.clone(),
                key: key.clone(),
                value,
                row: state.row_context(key),
                row_values: state.row_values(key),
            }
        };
        let store = self.clone();
        let key = key.clone();
        self.inner
            .effect_scheduler
            .add(async move {
                let updates = handler(context)
                    .await
                    .with_context(|| format!("effect of field {} failed", key))?;
                store.apply_updates(updates);
                Ok(())
            })
            .await;
    }

    async fn run_action(
        &self,
        action_key: FieldKey,
        action: Action,
        trigger: &FieldKey,
        trigger_value: Option<FieldValue>,
    ) {
        let context = {
            let state = self.state();
            ActionContext {
                store: self.clone(),
                value: state.value(&action_key),
                row: state.row_context(&action_key),
                key: action_key.clone(),
                trigger: trigger.clone(),
                trigger_value,
            }
        };
        let store = self.clone();
        self.inner
            .effect_scheduler
            .add(async move {
                let update = (action.handler)(context)
                    .await
                    .with_context(|| format!("action of field {} failed", action_key))?;
                store.apply_updates(FieldUpdates::from([(action_key, update)]));
                Ok(())
            })
            .await;
    }

    fn begin_processing(&self, key: &FieldKey) -> ProcessingBatch {
        let id = {
            let mut state = self.state();
            state.set_field_processing(key, true);
            state.processing.begin(key)
        };

        let delay = Duration::from_millis(self.inner.timing.processing_debounce_ms);
        let store = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            sleep(delay).await;
            let Some(inner) = store.upgrade() else {
                return;
            };
            let store = Store { inner };
            let mut state = store.state();
            if state.processing.is_active(id) {
                state.set_flag(FormFlag::Processing, true);
            }
        });

        ProcessingBatch {
            store: Arc::downgrade(&self.inner),
            id,
            key: key.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processing_batches_lower_flag_when_last_closes() {
        let mut batches = ProcessingBatches::default();
        let first = batches.begin(&FieldKey::new("a"));
        let second = batches.begin(&FieldKey::new("b"));

        assert!(!batches.finish(first));
        assert!(!batches.is_active(first));
        assert!(batches.is_active(second));
        assert!(batches.finish(second));
    }

    #[test]
    fn test_field_stays_active_while_a_later_batch_is_open() {
        let mut batches = ProcessingBatches::default();
        let key = FieldKey::new("slow");
        let first = batches.begin(&key);
        let second = batches.begin(&key);

        batches.finish(first);
        assert!(batches.is_field_active(&key));
        batches.finish(second);
        assert!(!batches.is_field_active(&key));
    }
}
