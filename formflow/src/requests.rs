//! Field requests: pull-based option data per field.
//!
//! A field's request runs on the request scheduler and is re-dispatched, with
//! the field's value cleared, whenever one of its `effected_by` fields changes.
//! Every dispatch takes a fresh generation; a result only lands if its
//! generation is still the field's latest.

use crate::error::{StoreError, StoreResult};
use crate::registry::{DependencyGraph, lookup, referenced_keys, shift_group_map};
use crate::row::RowContext;
use crate::scheduler::Completion;
use crate::state::{FieldUpdate, FieldUpdates};
use crate::store::Store;
use crate::validator::is_empty;
use anyhow::Context as _;
use futures::FutureExt;
use futures::future::BoxFuture;
use indexmap::{IndexMap, IndexSet};
use shared::{FieldKey, FieldValue, GroupId, RequestState};
use std::future::Future;
use std::sync::Arc;

pub type RequestHandler =
    Arc<dyn Fn(RequestContext) -> BoxFuture<'static, anyhow::Result<Vec<FieldValue>>> + Send + Sync>;

/// Resolves the full record of the currently selected value.
pub type SearchByIdHandler = Arc<
    dyn Fn(RequestContext, FieldValue) -> BoxFuture<'static, anyhow::Result<Option<FieldValue>>>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub struct FieldRequestConfig {
    pub effected_by: Vec<String>,
    pub handler: RequestHandler,
    pub searched_by_id: Option<SearchByIdHandler>,
}

impl FieldRequestConfig {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<FieldValue>>> + Send + 'static,
    {
        Self {
            effected_by: Vec::new(),
            handler: Arc::new(move |context| handler(context).boxed()),
            searched_by_id: None,
        }
    }

    pub fn with_effected_by<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.effected_by = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_searched_by_id<F, Fut>(mut self, search: F) -> Self
    where
        F: Fn(RequestContext, FieldValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<FieldValue>>> + Send + 'static,
    {
        self.searched_by_id = Some(Arc::new(move |context, id| search(context, id).boxed()));
        self
    }
}

impl std::fmt::Debug for FieldRequestConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldRequestConfig")
            .field("effected_by", &self.effected_by)
            .field("searched_by_id", &self.searched_by_id.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct RequestContext {
    pub store: Store,
    pub key: FieldKey,
    pub keyword: Option<String>,
    /// The field's value when the request was dispatched.
    pub value: Option<FieldValue>,
    pub row: Option<RowContext>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOptions {
    pub keyword: Option<String>,
}

impl DispatchOptions {
    pub fn keyword(keyword: impl Into<String>) -> Self {
        Self {
            keyword: Some(keyword.into()),
        }
    }
}

#[derive(Default)]
pub(crate) struct RequestRegistry {
    pub configs: IndexMap<FieldKey, FieldRequestConfig>,
    /// trigger field -> fields whose request it invalidates
    pub graph: DependencyGraph,
    pub states: IndexMap<FieldKey, RequestState>,
    pub generations: IndexMap<FieldKey, u64>,
}

impl RequestRegistry {
    /// Returns true when an earlier registration was replaced.
    pub fn register(&mut self, key: FieldKey, config: FieldRequestConfig) -> bool {
        self.graph.remove_dependent(&key);
        for trigger in &config.effected_by {
            for source in referenced_keys(&key, trigger) {
                self.graph.add_edge(source, key.clone());
            }
        }
        self.configs.insert(key, config).is_some()
    }

    pub fn unregister(&mut self, key: &FieldKey) -> bool {
        self.graph.remove_dependent(key);
        self.states.shift_remove(key);
        self.generations.shift_remove(key);
        self.configs.shift_remove(key).is_some()
    }

    pub fn is_current(&self, key: &FieldKey, generation: u64) -> bool {
        self.generations.get(key) == Some(&generation)
    }

    /// Keys whose request dispatches on its own once init requests settle.
    /// Template registrations expand to every existing row of their group.
    pub fn independent_keys(&self, groups: &IndexMap<GroupId, usize>) -> Vec<FieldKey> {
        let mut keys = IndexSet::new();
        for (key, config) in &self.configs {
            if !config.effected_by.is_empty() {
                continue;
            }
            match &key.group {
                Some(group) if key.is_template() => {
                    let rows = groups.get(group).copied().unwrap_or_default();
                    keys.extend((0..rows).map(|row| key.at_row(row)));
                }
                _ => {
                    keys.insert(key.clone());
                }
            }
        }
        keys.into_iter().collect()
    }

    pub fn shift_group(&mut self, group: &GroupId, shift: impl Fn(usize) -> Option<usize>) {
        shift_group_map(&mut self.configs, group, &shift);
        shift_group_map(&mut self.states, group, &shift);
        shift_group_map(&mut self.generations, group, &shift);
        self.graph
            .remap(|key| crate::registry::shift_group_key(key, group, &shift));
    }

    /// Forgets every result; in-flight requests are discarded when they land.
    pub fn reset(&mut self) {
        self.states.clear();
        self.generations.clear();
    }
}

/// Identity used to de-duplicate option lists: `id`, then `value`, then the
/// item itself.
fn option_identity(item: &FieldValue) -> &FieldValue {
    item.get("id").or_else(|| item.get("value")).unwrap_or(item)
}

/// De-duplicates `options` and prepends `selected` unless it is already listed.
pub fn merge_selected(options: Vec<FieldValue>, selected: Option<FieldValue>) -> Vec<FieldValue> {
    let mut merged: Vec<FieldValue> = Vec::with_capacity(options.len() + 1);
    for item in options {
        if !merged
            .iter()
            .any(|seen| option_identity(seen) == option_identity(&item))
        {
            merged.push(item);
        }
    }
    if let Some(selected) = selected {
        if !merged
            .iter()
            .any(|seen| option_identity(seen) == option_identity(&selected))
        {
            merged.insert(0, selected);
        }
    }
    merged
}

impl Store {
    /// Registers the request of `key`. A request with no `effected_by` is
    /// dispatched right away when init requests have already settled.
    pub fn register_field_request(&self, key: impl Into<FieldKey>, config: FieldRequestConfig) {
        let key = key.into();
        let independent = config.effected_by.is_empty();
        let dispatch_now = {
            let mut state = self.state();
            if state.requests.register(key.clone(), config) {
                log::warn!("[store] field request for {} registered twice, keeping the latest", key);
            }
            independent && state.init_settled()
        };

        if dispatch_now {
            let keys = if key.is_template() {
                let rows = self.row_count(key.group.as_deref().unwrap_or_default());
                (0..rows).map(|row| key.at_row(row)).collect()
            } else {
                vec![key]
            };
            for key in keys {
                self.dispatch_logged(key);
            }
        }
    }

    pub fn unregister_field_request(&self, key: impl Into<FieldKey>) -> bool {
        let key = key.into();
        let mut state = self.state();
        let removed = state.requests.unregister(&key);
        if removed {
            state.publish_request_state(&key, RequestState::default());
        }
        removed
    }

    /// Queues the request of `key` on the request scheduler.
    ///
    /// The returned [`Completion`] may be dropped; the result is recorded in
    /// the field's request state either way.
    pub fn dispatch_field_request(
        &self,
        key: impl Into<FieldKey>,
        options: DispatchOptions,
    ) -> StoreResult<Completion> {
        let key = key.into();
        let (config, generation, context) = {
            let mut state = self.state();
            if state.destroyed {
                return Err(StoreError::Destroyed);
            }
            let config = lookup(&state.requests.configs, &key)
                .cloned()
                .ok_or_else(|| StoreError::UnknownFieldRequest(key.clone()))?;

            let generation = state.next_generation();
            state.requests.generations.insert(key.clone(), generation);

            let mut loading = state.requests.states.get(&key).cloned().unwrap_or_default();
            loading.loading = true;
            loading.error = None;
            state.set_request_state(&key, loading);

            let context = RequestContext {
                store: self.clone(),
                key: key.clone(),
                keyword: options.keyword,
                value: state.value(&key),
                row: state.row_context(&key),
            };
            (config, generation, context)
        };

        log::debug!("[store] dispatching field request for {} (generation {})", key, generation);

        let store = self.clone();
        Ok(self.inner.request_scheduler.add(async move {
            let selected_id = context.value.clone().filter(|value| !is_empty(Some(value)));
            let resolve_selected = async {
                match (&config.searched_by_id, selected_id) {
                    (Some(search), Some(id)) => search(context.clone(), id).await,
                    _ => Ok(None),
                }
            };
            let (options, selected) = futures::join!((config.handler)(context.clone()), resolve_selected);

            let selected = selected.unwrap_or_else(|error| {
                log::warn!("[store] resolving selected value of {} failed: {:#}", key, error);
                None
            });
            let result = options.map(|options| merge_selected(options, selected));

            let mut state = store.state();
            if !state.requests.is_current(&key, generation) {
                log::debug!("[store] discarding stale field request result for {}", key);
                return Ok(());
            }
            match result {
                Ok(options) => {
                    state.set_request_state(&key, RequestState::success(FieldValue::Array(options)));
                    Ok(())
                }
                Err(error) => {
                    state.set_request_state(&key, RequestState::failure(format!("{:#}", error)));
                    Err(error).with_context(|| format!("field request for {} failed", key))
                }
            }
        }))
    }

    /// Option list of the last successful request of `key`.
    pub fn get_field_data(&self, key: impl Into<FieldKey>) -> Option<FieldValue> {
        let key = key.into();
        self.state()
            .requests
            .states
            .get(&key)
            .and_then(|state| state.data.clone())
    }

    pub fn get_field_request_state(&self, key: impl Into<FieldKey>) -> Option<RequestState> {
        let key = key.into();
        self.state().requests.states.get(&key).cloned()
    }

    pub(crate) fn dispatch_logged(&self, key: FieldKey) {
        if let Err(error) = self.dispatch_field_request(key.clone(), DispatchOptions::default()) {
            log::warn!("[store] could not dispatch field request for {}: {}", key, error);
        }
    }

    /// Clears, invalidates and re-dispatches every request depending on `source`.
    pub(crate) fn trigger_field_requests(&self, source: &FieldKey) {
        let dependents: Vec<FieldKey> = {
            let mut state = self.state();
            let dependents: Vec<FieldKey> = state
                .dependents(&state.requests.graph, source)
                .into_iter()
                .filter(|key| state.row_exists(key))
                .collect();
            for key in &dependents {
                state.requests.states.shift_remove(key);
                state.publish_request_state(key, RequestState::default());
            }
            dependents
        };
        if dependents.is_empty() {
            return;
        }

        log::debug!(
            "[store] {} changed, re-requesting {} dependent field(s)",
            source,
            dependents.len()
        );
        self.apply_updates(
            dependents
                .iter()
                .map(|key| (key.clone(), FieldUpdate::clear()))
                .collect::<FieldUpdates>(),
        );
        for key in dependents {
            self.dispatch_logged(key);
        }
    }

    /// Dispatches every request without `effected_by`.
    pub(crate) fn dispatch_independent_requests(&self) {
        let keys = {
            let state = self.state();
            state.requests.independent_keys(&state.groups)
        };
        for key in keys {
            self.dispatch_logged(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_prepends_missing_selected_item() {
        let options = vec![json!({"id": 1, "label": "one"}), json!({"id": 2, "label": "two"})];
        let merged = merge_selected(options, Some(json!({"id": 9, "label": "nine"})));
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0]["id"], json!(9));
    }

    #[test]
    fn test_merge_keeps_listed_selected_item_in_place() {
        let options = vec![json!({"value": "a"}), json!({"value": "b"}), json!({"value": "a"})];
        let merged = merge_selected(options, Some(json!({"value": "b", "label": "B"})));
        assert_eq!(merged, vec![json!({"value": "a"}), json!({"value": "b"})]);
    }

    #[test]
    fn test_independent_keys_expand_templates() {
        let mut registry = RequestRegistry::default();
        let config = FieldRequestConfig::new(|_| async { Ok(Vec::new()) });
        registry.register(FieldKey::template("lines", "product"), config.clone());
        registry.register(FieldKey::new("country"), config.clone());
        registry.register(
            FieldKey::new("city"),
            config.with_effected_by(["country"]),
        );

        let groups = IndexMap::from([("lines".to_string(), 2)]);
        assert_eq!(
            registry.independent_keys(&groups),
            vec![
                FieldKey::row("lines", 0, "product"),
                FieldKey::row("lines", 1, "product"),
                FieldKey::new("country"),
            ]
        );
        assert_eq!(
            registry.graph.dependents_of(&FieldKey::new("country")),
            vec![FieldKey::new("city")]
        );
    }
}
