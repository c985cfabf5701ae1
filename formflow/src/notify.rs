//! Explicit publish/subscribe for store state.
//!
//! Every state slice change is pushed through the relays of the subscribers
//! registered for it. Subscribers that dropped their [`Subscription`] are pruned
//! on the next publish.

use crate::dataflow::{Relay, relay};
use futures::Stream;
use futures::channel::mpsc::UnboundedReceiver;
use indexmap::IndexMap;
use shared::{FieldKey, FieldProps, FieldValue, FormMode, GroupId, RequestState};
use std::pin::Pin;
use std::task::{Context, Poll};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, PartialEq)]
pub enum FieldChange {
    Value(Option<FieldValue>),
    Errors(Vec<String>),
    Props(FieldProps),
    Validating(bool),
    Processing(bool),
    Touched(bool),
    Request(RequestState),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldEvent {
    pub key: FieldKey,
    pub change: FieldChange,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FormEvent {
    Submitting(bool),
    Submitted(bool),
    Processing(bool),
    Disabled(bool),
    Requesting(bool),
    Mode(FormMode),
    Reset,
    RowsChanged { group: GroupId, total: usize },
}

/// Stream of events for one subscriber. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription<T> {
    id: SubscriptionId,
    events: UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Notifier {
    next_id: u64,
    field_subscribers: IndexMap<FieldKey, Vec<(SubscriptionId, Relay<FieldEvent>)>>,
    form_subscribers: Vec<(SubscriptionId, Relay<FormEvent>)>,
}

impl Notifier {
    fn next_id(&mut self) -> SubscriptionId {
        self.next_id += 1;
        SubscriptionId(self.next_id)
    }

    pub fn subscribe_field(&mut self, key: FieldKey) -> Subscription<FieldEvent> {
        let id = self.next_id();
        let (field_event_relay, events) = relay();
        self.field_subscribers
            .entry(key)
            .or_default()
            .push((id, field_event_relay));
        Subscription { id, events }
    }

    pub fn subscribe_form(&mut self) -> Subscription<FormEvent> {
        let id = self.next_id();
        let (form_event_relay, events) = relay();
        self.form_subscribers.push((id, form_event_relay));
        Subscription { id, events }
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let mut removed = false;
        self.field_subscribers.retain(|_, subscribers| {
            let before = subscribers.len();
            subscribers.retain(|(subscriber, _)| *subscriber != id);
            removed |= before != subscribers.len();
            !subscribers.is_empty()
        });
        let before = self.form_subscribers.len();
        self.form_subscribers.retain(|(subscriber, _)| *subscriber != id);
        removed || before != self.form_subscribers.len()
    }

    pub fn publish_field(&mut self, key: &FieldKey, change: FieldChange) {
        let Some(subscribers) = self.field_subscribers.get_mut(key) else {
            return;
        };
        subscribers.retain(|(_, relay)| !relay.is_closed());
        for (_, relay) in subscribers.iter() {
            relay.send(FieldEvent {
                key: key.clone(),
                change: change.clone(),
            });
        }
        if subscribers.is_empty() {
            self.field_subscribers.shift_remove(key);
        }
    }

    pub fn publish_form(&mut self, event: FormEvent) {
        self.form_subscribers.retain(|(_, relay)| !relay.is_closed());
        for (_, relay) in &self.form_subscribers {
            relay.send(event.clone());
        }
    }

    /// Re-keys field subscriptions after rows of a group moved.
    pub fn remap(&mut self, remap: impl Fn(&FieldKey) -> Option<FieldKey>) {
        let subscribers = std::mem::take(&mut self.field_subscribers);
        for (key, relays) in subscribers {
            if let Some(key) = remap(&key) {
                self.field_subscribers.entry(key).or_default().extend(relays);
            }
        }
    }

    /// Drops every subscriber; their streams end.
    pub fn close(&mut self) {
        self.field_subscribers.clear();
        self.form_subscribers.clear();
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.field_subscribers.values().map(Vec::len).sum::<usize>() + self.form_subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn test_field_events_reach_only_their_subscribers() {
        let mut notifier = Notifier::default();
        let mut name = notifier.subscribe_field(FieldKey::new("name"));
        let mut other = notifier.subscribe_field(FieldKey::new("other"));

        notifier.publish_field(&FieldKey::new("name"), FieldChange::Value(Some(json!("Ada"))));
        notifier.close();

        assert_eq!(
            name.next().await,
            Some(FieldEvent {
                key: FieldKey::new("name"),
                change: FieldChange::Value(Some(json!("Ada"))),
            })
        );
        assert_eq!(name.next().await, None);
        assert_eq!(other.next().await, None);
    }

    #[test]
    fn test_dropped_subscriptions_are_pruned() {
        let mut notifier = Notifier::default();
        let kept = notifier.subscribe_form();
        drop(notifier.subscribe_form());
        drop(notifier.subscribe_field(FieldKey::new("name")));

        notifier.publish_form(FormEvent::Reset);
        notifier.publish_field(&FieldKey::new("name"), FieldChange::Touched(true));

        assert_eq!(notifier.subscriber_count(), 1);
        assert!(notifier.unsubscribe(kept.id()));
        assert!(!notifier.unsubscribe(kept.id()));
    }
}
