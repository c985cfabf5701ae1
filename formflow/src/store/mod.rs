//! The form store.
//!
//! A [`Store`] owns one form: values, field states, every registration and the
//! two schedulers. Writes are applied synchronously under the state lock;
//! everything that reacts to a value change is handed to the dispatcher loop
//! through `value_changed_relay` and runs as its own task:
//!
//! 1. the field's effect, then its actions, then dependent field requests
//! 2. re-validation of dependent fields
//! 3. re-validation of fields reached through validate effects
//!
//! Pass 1 runs concurrently with passes 2 and 3.

mod arena;
mod groups;
mod lifecycle;
mod validation;

pub use arena::SubmitHandler;
pub(crate) use arena::{FormFlag, StoreState};

use crate::config::initial_state;
use crate::dataflow::{DroppableTask, Relay, relay};
use crate::effects::{Action, Effect};
use crate::notify::{FieldEvent, FormEvent, Subscription, SubscriptionId};
use crate::registry::{DependencyGraph, ValidateEffect, referenced_keys};
use crate::row::RowInfo;
use crate::scheduler::Scheduler;
use crate::state::{FieldState, FieldUpdates, FieldValues, FormFlags};
use crate::validator::ValidationRule;
use futures::StreamExt;
use futures::channel::mpsc::UnboundedReceiver;
use futures_signals::signal::Mutable;
use indexmap::IndexMap;
use shared::{FieldKey, FieldProps, FieldValue, FormMode, SchedulerStatus, StoreConfig, TimingSection};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Counts one unit of in-flight propagation work until dropped.
pub(crate) struct PendingWork {
    pending: Mutable<usize>,
}

impl Drop for PendingWork {
    fn drop(&mut self) {
        let mut pending = self.pending.lock_mut();
        *pending = pending.saturating_sub(1);
    }
}

pub(crate) struct ValueChanged {
    key: FieldKey,
    value: Option<FieldValue>,
    work: PendingWork,
}

pub(crate) struct StoreInner {
    state: Mutex<StoreState>,
    pub(crate) timing: TimingSection,
    pub(crate) effect_scheduler: Scheduler,
    pub(crate) request_scheduler: Scheduler,
    value_changed_relay: Relay<ValueChanged>,
    pending: Mutable<usize>,
    dispatcher: Mutex<Option<DroppableTask>>,
}

/// Handle to one form. Clones share the same form.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<StoreInner>,
}

impl Store {
    /// Creates a store and starts its dispatcher loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: StoreConfig) -> Self {
        let (initial_values, initial_groups) = initial_state(&config);
        let (value_changed_relay, value_changed_stream) = relay();

        let inner = Arc::new(StoreInner {
            state: Mutex::new(StoreState::new(initial_values, initial_groups, config.form.mode)),
            timing: config.timing.clone(),
            effect_scheduler: Scheduler::new("effects", config.concurrency.effects),
            request_scheduler: Scheduler::new("requests", config.concurrency.requests),
            value_changed_relay,
            pending: Mutable::new(0),
            dispatcher: Mutex::new(None),
        });

        let dispatcher = start_dispatcher(Arc::downgrade(&inner), value_changed_stream);
        *inner
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(dispatcher);

        log::debug!(
            "[store] created (effects: {}, requests: {})",
            config.concurrency.effects,
            config.concurrency.requests
        );
        Self { inner }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, StoreState> {
        // Writers never leave the state half-updated across a panic point.
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn begin_work(&self) -> PendingWork {
        *self.inner.pending.lock_mut() += 1;
        PendingWork {
            pending: self.inner.pending.clone(),
        }
    }

    fn emit_change(&self, key: FieldKey, value: Option<FieldValue>) {
        if self.state().destroyed {
            return;
        }
        self.inner.value_changed_relay.send(ValueChanged {
            key,
            value,
            work: self.begin_work(),
        });
    }

    /// Merges engine-side updates. Only values that actually change propagate.
    pub(crate) fn apply_updates(&self, updates: FieldUpdates) {
        let changed: Vec<(FieldKey, Option<FieldValue>)> = {
            let mut state = self.state();
            let mut changed = Vec::new();
            for (key, update) in updates {
                if let Some(props) = update.props {
                    state.merge_props(&key, props);
                }
                if let Some(value) = update.value {
                    if state.write_value(&key, value.clone()) {
                        changed.push((key, value));
                    }
                }
            }
            changed
        };
        for (key, value) in changed {
            self.emit_change(key, value);
        }
    }

    async fn propagate(self, change: ValueChanged) {
        let ValueChanged { key, value, work } = change;
        let _work = work;
        futures::join!(self.run_change(&key, value), self.revalidate_after_change(&key));
    }

    // ===== VALUES =====

    /// Host write. Always propagates, even when the value is unchanged.
    pub fn set_value(&self, key: impl Into<FieldKey>, value: FieldValue) {
        let key = key.into();
        self.state().force_write_value(&key, Some(value.clone()));
        self.emit_change(key, Some(value));
    }

    /// Host write that leaves the field undefined.
    pub fn clear_value(&self, key: impl Into<FieldKey>) {
        let key = key.into();
        self.state().force_write_value(&key, None);
        self.emit_change(key, None);
    }

    pub fn get_value(&self, key: impl Into<FieldKey>) -> Option<FieldValue> {
        self.state().value(&key.into())
    }

    pub fn values(&self) -> FieldValues {
        self.state().values()
    }

    /// Fields with at least one error.
    pub fn errors(&self) -> IndexMap<FieldKey, Vec<String>> {
        self.state().errors()
    }

    pub fn get_field_state(&self, key: impl Into<FieldKey>) -> FieldState {
        self.state().fields.get(&key.into()).cloned().unwrap_or_default()
    }

    /// Edits a field state in place. A changed value propagates like an
    /// engine write.
    pub fn set_field_state(&self, key: impl Into<FieldKey>, edit: impl FnOnce(&mut FieldState)) {
        let key = key.into();
        let changed_value = {
            let mut state = self.state();
            let before = state.fields.get(&key).cloned().unwrap_or_default();
            let mut after = before.clone();
            edit(&mut after);

            let changed_value = (after.value != before.value).then(|| after.value.clone());
            if let Some(value) = &changed_value {
                state.write_value(&key, value.clone());
            }
            state.set_touched(&key, after.touched);
            state.set_errors(&key, after.errors);
            state.set_validating(&key, after.validating);
            state.set_field_processing(&key, after.processing);
            state.replace_props(&key, after.props);
            if let Some(field) = state.fields.get_mut(&key) {
                field.dirty = after.dirty;
            }
            changed_value
        };
        if let Some(value) = changed_value {
            self.emit_change(key, value);
        }
    }

    pub fn set_touched(&self, key: impl Into<FieldKey>) {
        self.state().set_touched(&key.into(), true);
    }

    /// Shallow-merges `props` into the field's props.
    pub fn set_field_props(&self, key: impl Into<FieldKey>, props: FieldProps) {
        self.state().merge_props(&key.into(), props);
    }

    // ===== FORM FLAGS =====

    pub fn flags(&self) -> FormFlags {
        self.state().flags
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.state().set_flag(FormFlag::Disabled, disabled);
    }

    pub fn is_disabled(&self) -> bool {
        self.state().flags.disabled
    }

    pub fn set_requesting(&self, requesting: bool) {
        self.state().set_flag(FormFlag::Requesting, requesting);
    }

    pub fn is_requesting(&self) -> bool {
        self.state().flags.requesting
    }

    pub fn is_processing(&self) -> bool {
        self.state().flags.processing
    }

    pub fn is_submitting(&self) -> bool {
        self.state().flags.submitting
    }

    pub fn is_submitted(&self) -> bool {
        self.state().flags.submitted
    }

    pub fn set_form_mode(&self, mode: FormMode) {
        let mut state = self.state();
        if state.mode != mode {
            state.mode = mode;
            state.notifier.publish_form(FormEvent::Mode(mode));
        }
    }

    pub fn get_form_mode(&self) -> FormMode {
        self.state().mode
    }

    pub fn get_request_scheduler_status(&self) -> SchedulerStatus {
        self.inner.request_scheduler.status()
    }

    pub fn get_effect_scheduler_status(&self) -> SchedulerStatus {
        self.inner.effect_scheduler.status()
    }

    // ===== SUBSCRIPTIONS =====

    pub fn subscribe(&self, key: impl Into<FieldKey>) -> Subscription<FieldEvent> {
        self.state().notifier.subscribe_field(key.into())
    }

    pub fn subscribe_form(&self) -> Subscription<FormEvent> {
        self.state().notifier.subscribe_form()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.state().notifier.unsubscribe(id)
    }

    // ===== REGISTRATION =====

    /// Registers the validation rule of `key`, replacing any earlier rule and
    /// the dependency edges that came with it.
    ///
    /// Field ids name the field in the same row; ids of a row field also
    /// reach the form-level field of that name.
    pub fn register_field_validator(&self, key: impl Into<FieldKey>, rule: ValidationRule) {
        let key = key.into();
        let mut state = self.state();

        if let Some(previous) = state.rules.get(&key).cloned() {
            log::warn!("[store] validator for {} registered twice, keeping the latest", key);
            unlink_sources(&mut state.validation_graph, &key, &previous.dependent_fields);
            unlink_dependents(&mut state.validation_graph, &key, &previous.affect_fields);
        }

        link_sources(&mut state.validation_graph, &key, &rule.dependent_fields);
        link_dependents(&mut state.validation_graph, &key, &rule.affect_fields);
        state.rules.insert(key, rule);
    }

    pub fn register_field_row_info(&self, key: impl Into<FieldKey>, info: RowInfo) {
        let key = key.into();
        let mut state = self.state();
        if state.row_infos.insert(key.clone(), info).is_some() {
            log::warn!("[store] row info for {} registered twice, keeping the latest", key);
        }
    }

    /// Re-validate `key` whenever one of `fields` changes. A second call
    /// replaces the fields of the first.
    pub fn register_field_dependencies<I, S>(&self, key: impl Into<FieldKey>, fields: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let key = key.into();
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        let mut state = self.state();
        if let Some(previous) = state.dependency_registrations.insert(key.clone(), fields.clone()) {
            log::warn!("[store] dependencies of {} registered twice, keeping the latest", key);
            unlink_sources(&mut state.validation_graph, &key, &previous);
        }
        link_sources(&mut state.validation_graph, &key, &fields);
    }

    /// Re-validate `fields` whenever `key` changes. A second call replaces the
    /// fields of the first.
    pub fn register_field_affects<I, S>(&self, key: impl Into<FieldKey>, fields: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let key = key.into();
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        let mut state = self.state();
        if let Some(previous) = state.affect_registrations.insert(key.clone(), fields.clone()) {
            log::warn!("[store] affected fields of {} registered twice, keeping the latest", key);
            unlink_dependents(&mut state.validation_graph, &key, &previous);
        }
        link_dependents(&mut state.validation_graph, &key, &fields);
    }

    pub fn register_field_validate_effects(&self, key: impl Into<FieldKey>, effects: Vec<ValidateEffect>) {
        let key = key.into();
        let mut state = self.state();
        if state.validate_effects.insert(key.clone(), effects).is_some() {
            log::warn!("[store] validate effects for {} registered twice, keeping the latest", key);
        }
    }

    pub fn register_effects(&self, key: impl Into<FieldKey>, effect: Effect) {
        let key = key.into();
        let mut state = self.state();
        if state.effects.insert(key.clone(), effect).is_some() {
            log::warn!("[store] effect for {} registered twice, keeping the latest", key);
        }
    }

    pub fn register_actions(&self, key: impl Into<FieldKey>, action: Action) {
        let key = key.into();
        let mut state = self.state();
        state.action_graph.remove_dependent(&key);
        link_sources(&mut state.action_graph, &key, &action.effected_by);
        if state.actions.insert(key.clone(), action).is_some() {
            log::warn!("[store] action for {} registered twice, keeping the latest", key);
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("effect_scheduler", &self.inner.effect_scheduler)
            .field("request_scheduler", &self.inner.request_scheduler)
            .field("pending", &self.inner.pending.get())
            .finish_non_exhaustive()
    }
}

/// Edges from every field `ids` refers to, to `key`.
fn link_sources(graph: &mut DependencyGraph, key: &FieldKey, ids: &[String]) {
    for id in ids {
        for source in referenced_keys(key, id) {
            graph.add_edge(source, key.clone());
        }
    }
}

fn unlink_sources(graph: &mut DependencyGraph, key: &FieldKey, ids: &[String]) {
    for id in ids {
        for source in referenced_keys(key, id) {
            graph.remove_edge(&source, key);
        }
    }
}

/// Edges from `key` to every field `ids` refers to.
fn link_dependents(graph: &mut DependencyGraph, key: &FieldKey, ids: &[String]) {
    for id in ids {
        for dependent in referenced_keys(key, id) {
            graph.add_edge(key.clone(), dependent);
        }
    }
}

fn unlink_dependents(graph: &mut DependencyGraph, key: &FieldKey, ids: &[String]) {
    for id in ids {
        for dependent in referenced_keys(key, id) {
            graph.remove_edge(key, &dependent);
        }
    }
}

/// Hands every value change to its own propagation task. Holds the store
/// weakly so dropping the last handle stops the loop.
fn start_dispatcher(
    store: Weak<StoreInner>,
    mut value_changed_stream: UnboundedReceiver<ValueChanged>,
) -> DroppableTask {
    DroppableTask::start(async move {
        while let Some(change) = value_changed_stream.next().await {
            let Some(inner) = store.upgrade() else {
                break;
            };
            let store = Store { inner };
            tokio::spawn(store.propagate(change));
        }
        log::debug!("[store] dispatcher stopped");
    })
}
