use super::{FormFlag, Store, SubmitHandler};
use crate::error::{StoreError, StoreResult};
use crate::notify::{FieldChange, FormEvent};
use crate::state::FieldValues;
use futures::FutureExt;
use futures_signals::signal::SignalExt;
use shared::FieldKey;
use std::future::Future;
use std::sync::{Arc, PoisonError};

impl Store {
    /// Resolves once no value change is being propagated and both schedulers
    /// are empty.
    ///
    /// Handlers must not await this: their own work keeps the store busy.
    pub async fn wait_for_idle(&self) {
        loop {
            self.inner.pending.signal().wait_for(0).await;
            futures::join!(
                self.inner.effect_scheduler.wait_for_completion(),
                self.inner.request_scheduler.wait_for_completion()
            );
            if self.inner.pending.get() == 0
                && !self.inner.effect_scheduler.is_running()
                && !self.inner.request_scheduler.is_running()
            {
                return;
            }
        }
    }

    /// Handler invoked by [`Store::submit`] with the validated values.
    pub fn on_submit<F, Fut>(&self, handler: F)
    where
        F: Fn(FieldValues) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: SubmitHandler = Arc::new(move |values| handler(values).boxed());
        self.state().on_submit = Some(handler);
    }

    /// Settles pending work, validates every field and hands the values to
    /// the submit handler.
    pub async fn submit(&self) -> StoreResult<FieldValues> {
        self.state().set_flag(FormFlag::Submitting, true);
        let result = self.submit_inner().await;
        self.state().set_flag(FormFlag::Submitting, false);
        result
    }

    async fn submit_inner(&self) -> StoreResult<FieldValues> {
        self.wait_for_idle().await;

        if !self.validate_all().await {
            let errors = self.errors();
            log::info!("[store] submit blocked by {} invalid field(s)", errors.len());
            return Err(StoreError::Invalid { errors });
        }

        let (values, handler) = {
            let mut state = self.state();
            state.set_flag(FormFlag::Submitted, true);
            (state.values(), state.on_submit.clone())
        };

        if let Some(handler) = handler {
            handler(values.clone()).await.map_err(StoreError::Submit)?;
        }
        Ok(values)
    }

    /// Restores initial values and group sizes and forgets touched, dirty,
    /// errors and field request data. Registrations are kept.
    pub fn reset(&self) {
        let dropped =
            self.inner.effect_scheduler.clear() + self.inner.request_scheduler.clear();

        let mut state = self.state();
        let initial_groups = state.initial_groups.clone();
        let mut resized = Vec::new();
        for (group, total) in &initial_groups {
            let total = *total;
            if state.row_count(group) != total {
                resized.push((group.clone(), total));
            }
            state.shift_group(group, |row| (row < total).then_some(row));
        }
        state.groups = initial_groups;
        let groups: Vec<_> = state.groups.keys().cloned().collect();
        for group in &groups {
            state.refresh_row_infos(group);
        }
        for (group, total) in resized {
            state.notifier.publish_form(FormEvent::RowsChanged { group, total });
        }

        let keys: Vec<FieldKey> = state.fields.keys().cloned().collect();
        for key in keys {
            let initial = state.initial_values.get(&key).cloned();
            state.write_value(&key, initial);
            state.set_touched(&key, false);
            state.set_errors(&key, Vec::new());
            state.set_validating(&key, false);
            if let Some(field) = state.fields.get_mut(&key) {
                field.dirty = false;
            }
        }
        let missing: Vec<_> = state
            .initial_values
            .iter()
            .filter(|(key, _)| !state.fields.contains_key(*key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        for (key, value) in missing {
            state.write_value(&key, Some(value));
        }

        let requested: Vec<FieldKey> = state.requests.states.keys().cloned().collect();
        state.requests.reset();
        for key in requested {
            state
                .notifier
                .publish_field(&key, FieldChange::Request(Default::default()));
        }
        state.validation_generations.clear();
        state.set_flag(FormFlag::Submitted, false);
        state.notifier.publish_form(FormEvent::Reset);

        log::info!("[store] reset ({} queued task(s) dropped)", dropped);
    }

    /// Stops the dispatcher, drops queued work and ends every subscription.
    ///
    /// Values stay readable; further changes no longer propagate. Dropping the
    /// last handle to a store has the same effect.
    pub fn destroy(&self) {
        let dispatcher = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(dispatcher);

        self.inner.effect_scheduler.clear();
        self.inner.request_scheduler.clear();

        let mut state = self.state();
        state.destroyed = true;
        state.processing.clear();
        state.notifier.close();
        log::debug!("[store] destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.state().destroyed
    }
}
