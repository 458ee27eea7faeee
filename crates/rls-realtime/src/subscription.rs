//! Change subscriptions

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use rls_common::{Error, Result};
use rls_engine::{parse_predicate, ClaimsContext, Expr};

use crate::cdc::{ChangeEvent, ChangeType};

/// Which change types a subscription listens for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventFilter {
    #[default]
    #[serde(rename = "*")]
    All,
    Insert,
    Update,
    Delete,
}

impl EventFilter {
    pub fn accepts(self, change_type: ChangeType) -> bool {
        matches!(
            (self, change_type),
            (EventFilter::All, _)
                | (EventFilter::Insert, ChangeType::Insert)
                | (EventFilter::Update, ChangeType::Update)
                | (EventFilter::Delete, ChangeType::Delete)
        )
    }
}

/// What a subscriber asks to receive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    /// Table name, or `*` for every table
    pub table: String,
    #[serde(default)]
    pub event: EventFilter,
    /// Optional row filter in predicate syntax, e.g. `room_id = 7`
    #[serde(default)]
    pub filter: Option<String>,
}

impl SubscriptionRequest {
    pub fn table(table: &str) -> Self {
        Self {
            table: table.to_string(),
            event: EventFilter::All,
            filter: None,
        }
    }

    #[must_use]
    pub fn event(mut self, event: EventFilter) -> Self {
        self.event = event;
        self
    }

    #[must_use]
    pub fn filter(mut self, filter: &str) -> Self {
        self.filter = Some(filter.to_string());
        self
    }
}

/// A registered subscription, bound to the subscriber's claims
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: Uuid,
    pub table: String,
    pub event: EventFilter,
    pub filter: Option<Arc<Expr>>,
    pub claims: ClaimsContext,
}

impl Subscription {
    /// Compile a request for `claims`
    ///
    /// # Errors
    /// Returns `InvalidQuery` if the row filter does not parse.
    pub fn new(request: SubscriptionRequest, claims: ClaimsContext) -> Result<Self> {
        let filter = request
            .filter
            .as_deref()
            .map(parse_predicate)
            .transpose()
            .map_err(|e| Error::InvalidQuery(e.to_string()))?
            .map(Arc::new);

        Ok(Self {
            id: Uuid::new_v4(),
            table: request.table,
            event: request.event,
            filter,
            claims,
        })
    }

    /// Whether the event's table and type are subscribed to.
    /// Row filters and policies are applied separately.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        (self.table == "*" || self.table == event.table) && self.event.accepts(event.change_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rls_common::Row;

    fn anon() -> ClaimsContext {
        ClaimsContext::anonymous("anon")
    }

    #[test]
    fn test_subscription_matches() {
        let sub = Subscription::new(
            SubscriptionRequest::table("users").event(EventFilter::Insert),
            anon(),
        )
        .unwrap();

        assert!(sub.matches(&ChangeEvent::insert("users", Row::new())));
        assert!(!sub.matches(&ChangeEvent::delete("users", Row::new())));
        assert!(!sub.matches(&ChangeEvent::insert("posts", Row::new())));
    }

    #[test]
    fn test_wildcard_subscription() {
        let sub = Subscription::new(SubscriptionRequest::table("*"), anon()).unwrap();

        assert!(sub.matches(&ChangeEvent::insert("users", Row::new())));
        assert!(sub.matches(&ChangeEvent::delete("posts", Row::new())));
    }

    #[test]
    fn test_request_from_json() {
        let request: SubscriptionRequest =
            serde_json::from_str(r#"{"table": "messages", "event": "*", "filter": "room_id = 7"}"#)
                .unwrap();
        assert_eq!(request.event, EventFilter::All);

        let sub = Subscription::new(request, anon()).unwrap();
        assert!(sub.filter.is_some());

        let bad = SubscriptionRequest::table("messages").filter("room_id = = 7");
        assert!(matches!(
            Subscription::new(bad, anon()),
            Err(Error::InvalidQuery(_))
        ));
    }
}
