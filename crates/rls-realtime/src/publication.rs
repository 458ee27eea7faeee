//! Publication filter: decides whether a change reaches a subscriber

use std::sync::Arc;

use rls_common::Result;
use rls_engine::{ClaimsContext, EnforcementGate, RowSource};

use crate::cdc::ChangeEvent;
use crate::subscription::Subscription;

/// Applies a subscriber's `SELECT` policies to change events
#[derive(Clone)]
pub struct PublicationFilter {
    gate: Arc<EnforcementGate>,
    source: Arc<dyn RowSource>,
}

impl PublicationFilter {
    /// `source` is read by policy sub-queries, e.g. membership lookups
    pub fn new(gate: Arc<EnforcementGate>, source: Arc<dyn RowSource>) -> Self {
        Self { gate, source }
    }

    /// Whether `subscriber` may receive `event`.
    ///
    /// The subscriber's `SELECT` predicate is evaluated against the new row
    /// for inserts and updates, and the old row for deletes. Tables without
    /// RLS broadcast unconditionally.
    ///
    /// # Errors
    /// Propagates predicate evaluation and recursion errors.
    pub fn should_broadcast(&self, event: &ChangeEvent, subscriber: &ClaimsContext) -> Result<bool> {
        let Some(row) = event.visible_row() else {
            return Ok(false);
        };
        self.gate
            .can_read(&event.table, row, subscriber, self.source.as_ref())
    }

    /// Whether `event` is delivered on `subscription`: the table and change
    /// type are subscribed, the subscriber may read the row, and the row
    /// passes the subscription's own filter
    ///
    /// # Errors
    /// Propagates predicate evaluation and recursion errors.
    pub fn admits(&self, event: &ChangeEvent, subscription: &Subscription) -> Result<bool> {
        if !subscription.matches(event) || !self.should_broadcast(event, &subscription.claims)? {
            return Ok(false);
        }
        match (&subscription.filter, event.visible_row()) {
            (None, _) => Ok(true),
            (Some(filter), Some(row)) => self
                .gate
                .session(&subscription.claims, self.source.as_ref())
                .matches(filter, &event.table, row),
            (Some(_), None) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::{EventFilter, SubscriptionRequest};
    use rls_common::Row;
    use rls_engine::{
        DefinerRegistry, ExpressionEvaluator, MemoryStorage, PolicyCommand, PolicyDefinition,
        PolicyResolver, PolicyStore,
    };
    use serde_json::json;

    fn filter(store: &Arc<PolicyStore>, storage: Arc<MemoryStorage>) -> PublicationFilter {
        let resolver = Arc::new(PolicyResolver::new(Arc::clone(store), true));
        let evaluator = Arc::new(ExpressionEvaluator::new(Arc::new(DefinerRegistry::new()), 16));
        PublicationFilter::new(Arc::new(EnforcementGate::new(resolver, evaluator)), storage)
    }

    fn row(value: serde_json::Value) -> Row {
        Row::from_value(value).unwrap()
    }

    #[test]
    fn test_rls_disabled_broadcasts() {
        let store = Arc::new(PolicyStore::new());
        let filter = filter(&store, Arc::new(MemoryStorage::new()));
        let event = ChangeEvent::insert("notes", row(json!({"owner": "bob"})));

        assert!(filter
            .should_broadcast(&event, &ClaimsContext::anonymous("anon"))
            .unwrap());
    }

    #[test]
    fn test_owner_only_delivery() {
        let store = Arc::new(PolicyStore::new());
        store.enable_rls("notes");
        store
            .create_policy(
                PolicyDefinition::new("own", "notes", PolicyCommand::Select)
                    .with_using("owner = auth.uid()"),
            )
            .unwrap();
        let filter = filter(&store, Arc::new(MemoryStorage::new()));

        let alice = ClaimsContext::authenticated("alice", "authenticated");
        let bob = ClaimsContext::authenticated("bob", "authenticated");

        let insert = ChangeEvent::insert("notes", row(json!({"owner": "bob"})));
        assert!(!filter.should_broadcast(&insert, &alice).unwrap());
        assert!(filter.should_broadcast(&insert, &bob).unwrap());

        // Deletes are judged on the row as it was
        let delete = ChangeEvent::delete("notes", row(json!({"owner": "alice"})));
        assert!(filter.should_broadcast(&delete, &alice).unwrap());
        assert!(!filter.should_broadcast(&delete, &bob).unwrap());
    }

    #[test]
    fn test_membership_subquery_reads_storage() {
        let store = Arc::new(PolicyStore::new());
        store.enable_rls("messages");
        store
            .create_policy(
                PolicyDefinition::new("members", "messages", PolicyCommand::Select).with_using(
                    "room_id in (select room_id from members where user_id = auth.uid())",
                ),
            )
            .unwrap();
        let storage = Arc::new(MemoryStorage::new());
        storage.seed("members", [row(json!({"room_id": 1, "user_id": "alice"}))]);
        let filter = filter(&store, storage);

        let event = ChangeEvent::insert("messages", row(json!({"room_id": 1, "body": "hi"})));
        let alice = ClaimsContext::authenticated("alice", "authenticated");
        let carol = ClaimsContext::authenticated("carol", "authenticated");

        assert!(filter.should_broadcast(&event, &alice).unwrap());
        assert!(!filter.should_broadcast(&event, &carol).unwrap());
    }

    #[test]
    fn test_subscription_filter_narrows_policy() {
        let store = Arc::new(PolicyStore::new());
        let filter = filter(&store, Arc::new(MemoryStorage::new()));
        let anon = ClaimsContext::anonymous("anon");

        let room_7 = Subscription::new(
            SubscriptionRequest::table("messages").filter("room_id = 7"),
            anon.clone(),
        )
        .unwrap();
        let inserts = Subscription::new(
            SubscriptionRequest::table("messages").event(EventFilter::Insert),
            anon,
        )
        .unwrap();

        let in_7 = ChangeEvent::insert("messages", row(json!({"room_id": 7})));
        let in_8 = ChangeEvent::insert("messages", row(json!({"room_id": 8})));
        let gone = ChangeEvent::delete("messages", row(json!({"room_id": 7})));

        assert!(filter.admits(&in_7, &room_7).unwrap());
        assert!(!filter.admits(&in_8, &room_7).unwrap());
        assert!(filter.admits(&gone, &room_7).unwrap());
        assert!(!filter.admits(&gone, &inserts).unwrap());
    }
}
