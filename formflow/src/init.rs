//! Form-level init requests.
//!
//! Named startup requests with their own `depends` graph. They run once, layer
//! by layer in topological order, on the request scheduler. Field requests with
//! no trigger fields dispatch once every init request has settled.

use crate::error::{StoreError, StoreResult};
use crate::store::{FormFlag, Store};
use anyhow::Context as _;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use indexmap::{IndexMap, IndexSet};
use shared::{FieldValue, FormMode, RequestState};
use std::future::Future;
use std::sync::Arc;

pub type InitHandler =
    Arc<dyn Fn(InitRequestContext) -> BoxFuture<'static, anyhow::Result<FieldValue>> + Send + Sync>;

pub type InitRequests = IndexMap<String, InitRequest>;

#[derive(Clone)]
pub struct InitRequest {
    pub depends: Vec<String>,
    /// Modes the request runs in; `None` runs in every mode.
    pub modes: Option<Vec<FormMode>>,
    pub req: InitHandler,
}

impl InitRequest {
    pub fn new<F, Fut>(req: F) -> Self
    where
        F: Fn(InitRequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<FieldValue>> + Send + 'static,
    {
        Self {
            depends: Vec::new(),
            modes: None,
            req: Arc::new(move |context| req(context).boxed()),
        }
    }

    pub fn with_depends<I, S>(mut self, depends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends = depends.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_modes(mut self, modes: impl IntoIterator<Item = FormMode>) -> Self {
        self.modes = Some(modes.into_iter().collect());
        self
    }

    pub fn runs_in(&self, mode: FormMode) -> bool {
        self.modes.as_ref().is_none_or(|modes| modes.contains(&mode))
    }
}

impl std::fmt::Debug for InitRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitRequest")
            .field("depends", &self.depends)
            .field("modes", &self.modes)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct InitRequestContext {
    pub store: Store,
    pub name: String,
    pub mode: FormMode,
    /// Results of the requests this one depends on. Skipped or failed
    /// dependencies are missing.
    pub dependencies: IndexMap<String, FieldValue>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InitPhase {
    #[default]
    Idle,
    Running,
    Settled,
}

#[derive(Default)]
pub(crate) struct InitState {
    pub requests: InitRequests,
    pub phase: InitPhase,
    pub data: IndexMap<String, FieldValue>,
    pub states: IndexMap<String, RequestState>,
}

/// Groups requests into layers whose dependencies all sit in earlier layers.
pub fn topological_layers(requests: &InitRequests) -> StoreResult<Vec<Vec<String>>> {
    let mut in_degree: IndexMap<&str, usize> = IndexMap::new();
    let mut dependents: IndexMap<&str, Vec<&str>> = IndexMap::new();

    for (name, request) in requests {
        let depends: IndexSet<&str> = request.depends.iter().map(String::as_str).collect();
        for dependency in &depends {
            if !requests.contains_key(*dependency) {
                return Err(StoreError::UnknownInitRequest {
                    request: name.clone(),
                    dependency: dependency.to_string(),
                });
            }
            dependents.entry(*dependency).or_default().push(name.as_str());
        }
        in_degree.insert(name.as_str(), depends.len());
    }

    let mut layers = Vec::new();
    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut placed = 0;

    while !ready.is_empty() {
        let mut next = Vec::new();
        for name in &ready {
            for dependent in dependents.get(name).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(*dependent);
                    }
                }
            }
        }
        placed += ready.len();
        layers.push(ready.iter().map(|name| name.to_string()).collect());
        ready = next;
    }

    if placed < requests.len() {
        let remaining: IndexSet<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree > 0)
            .map(|(name, _)| *name)
            .collect();
        return Err(StoreError::InitRequestCycle(find_cycle(requests, &remaining)));
    }
    Ok(layers)
}

/// Walks `depends` edges inside the unresolved set until a request repeats.
fn find_cycle(requests: &InitRequests, remaining: &IndexSet<&str>) -> Vec<String> {
    let mut path: Vec<&str> = Vec::new();
    let mut current = remaining.first().copied();

    while let Some(name) = current {
        if let Some(start) = path.iter().position(|seen| *seen == name) {
            let mut cycle: Vec<String> = path[start..].iter().map(|name| name.to_string()).collect();
            cycle.push(name.to_string());
            return cycle;
        }
        path.push(name);
        current = requests.get(name).and_then(|request| {
            request
                .depends
                .iter()
                .map(String::as_str)
                .find(|dependency| remaining.contains(dependency))
        });
    }
    path.into_iter().map(str::to_string).collect()
}

impl Store {
    /// Replaces the init request set. Ignored once init requests have started.
    pub fn set_init_reqs(&self, requests: InitRequests) {
        let mut state = self.state();
        if state.init.phase != InitPhase::Idle {
            log::warn!("[store] init requests already executed, ignoring new set");
            return;
        }
        state.init.requests = requests;
    }

    /// Starts the init requests in the background.
    ///
    /// Runs at most once per store; later calls return `Ok(())` without doing
    /// anything. A dependency cycle or an unknown dependency is reported before
    /// any request starts and leaves the store ready for another attempt.
    /// Await [`Store::wait_for_idle`] to know when everything has settled.
    pub fn execute_init_reqs(&self) -> StoreResult<()> {
        let (layers, work) = {
            let mut state = self.state();
            if state.init.phase != InitPhase::Idle {
                log::debug!("[store] init requests already {:?}", state.init.phase);
                return Ok(());
            }
            let layers = topological_layers(&state.init.requests)?;
            state.init.phase = InitPhase::Running;
            state.set_flag(FormFlag::Requesting, true);
            (layers, self.begin_work())
        };

        log::info!("[store] executing init requests in {} layer(s)", layers.len());
        let store = self.clone();
        tokio::spawn(async move {
            let _work = work;
            store.run_init_layers(layers).await;
        });
        Ok(())
    }

    async fn run_init_layers(&self, layers: Vec<Vec<String>>) {
        for layer in layers {
            let runs: Vec<_> = layer
                .into_iter()
                .filter_map(|name| self.start_init_request(name))
                .collect();
            join_all(runs).await;
        }

        {
            let mut state = self.state();
            state.init.phase = InitPhase::Settled;
            state.set_flag(FormFlag::Requesting, false);
        }
        log::info!("[store] init requests settled");
        self.dispatch_independent_requests();
    }

    fn start_init_request(&self, name: String) -> Option<crate::scheduler::Completion> {
        let (request, context) = {
            let mut state = self.state();
            let request = state.init.requests.get(&name)?.clone();
            if !request.runs_in(state.mode) {
                log::debug!("[store] init request `{}` skipped in {:?} mode", name, state.mode);
                return None;
            }
            let dependencies = request
                .depends
                .iter()
                .filter_map(|dependency| {
                    let data = state.init.data.get(dependency)?;
                    Some((dependency.clone(), data.clone()))
                })
                .collect();
            state.init.states.insert(name.clone(), RequestState::loading());
            let context = InitRequestContext {
                store: self.clone(),
                name: name.clone(),
                mode: state.mode,
                dependencies,
            };
            (request, context)
        };

        let store = self.clone();
        Some(self.inner.request_scheduler.add(async move {
            let result = (request.req)(context).await;
            let mut state = store.state();
            match result {
                Ok(data) => {
                    state.init.data.insert(name.clone(), data.clone());
                    state.init.states.insert(name, RequestState::success(data));
                    Ok(())
                }
                Err(error) => {
                    state
                        .init
                        .states
                        .insert(name.clone(), RequestState::failure(format!("{:#}", error)));
                    Err(error).with_context(|| format!("init request `{}` failed", name))
                }
            }
        }))
    }

    /// Result of the init request `name`, once it succeeded.
    pub fn get_context_data(&self, name: &str) -> Option<FieldValue> {
        self.state().init.data.get(name).cloned()
    }

    pub fn get_context_request_state(&self, name: &str) -> Option<RequestState> {
        self.state().init.states.get(name).cloned()
    }

    pub fn init_phase(&self) -> InitPhase {
        self.state().init.phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(depends: &[&str]) -> InitRequest {
        InitRequest::new(|_| async { Ok(json!(null)) }).with_depends(depends.iter().copied())
    }

    #[test]
    fn test_layers_follow_depends() {
        let requests = InitRequests::from([
            ("user".to_string(), request(&[])),
            ("orders".to_string(), request(&["user", "catalog"])),
            ("catalog".to_string(), request(&[])),
            ("summary".to_string(), request(&["orders"])),
        ]);
        assert_eq!(
            topological_layers(&requests).unwrap(),
            vec![
                vec!["user".to_string(), "catalog".to_string()],
                vec!["orders".to_string()],
                vec!["summary".to_string()],
            ]
        );
    }

    #[test]
    fn test_cycle_is_reported_with_its_path() {
        let requests = InitRequests::from([
            ("root".to_string(), request(&[])),
            ("a".to_string(), request(&["root", "c"])),
            ("b".to_string(), request(&["a"])),
            ("c".to_string(), request(&["b"])),
        ]);
        match topological_layers(&requests) {
            Err(StoreError::InitRequestCycle(cycle)) => {
                assert_eq!(cycle, vec!["a", "c", "b", "a"]);
            }
            other => panic!("expected a cycle, got {:?}", other.map(|layers| layers.len())),
        }
    }

    #[test]
    fn test_unknown_dependency() {
        let requests = InitRequests::from([("a".to_string(), request(&["missing"]))]);
        assert!(matches!(
            topological_layers(&requests),
            Err(StoreError::UnknownInitRequest { dependency, .. }) if dependency == "missing"
        ));
    }

    #[test]
    fn test_mode_gating() {
        let request = request(&[]).with_modes([FormMode::Edit, FormMode::View]);
        assert!(request.runs_in(FormMode::Edit));
        assert!(!request.runs_in(FormMode::Create));
    }
}
