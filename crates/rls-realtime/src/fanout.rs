//! Subscriber registry and policy-filtered change delivery

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

use rls_common::config::RealtimeConfig;
use rls_common::Result;
use rls_engine::{ClaimsContext, RowChange};

use crate::cdc::{CdcListener, ChangeEvent};
use crate::publication::PublicationFilter;
use crate::subscription::{Subscription, SubscriptionRequest};

struct Subscriber {
    subscription: Subscription,
    sender: mpsc::Sender<ChangeEvent>,
}

/// Receiving end of a subscription
pub struct SubscriberHandle {
    pub id: Uuid,
    pub events: mpsc::Receiver<ChangeEvent>,
}

/// Routes change events to subscribers allowed to see them
pub struct ChangeFanout {
    config: RealtimeConfig,
    filter: PublicationFilter,
    cdc_listener: Arc<CdcListener>,
    subscribers: RwLock<HashMap<Uuid, Subscriber>>,
}

impl ChangeFanout {
    /// Create a fan-out fed by its own CDC listener
    pub fn new(config: &RealtimeConfig, filter: PublicationFilter) -> Arc<Self> {
        let fanout = Arc::new(Self {
            config: config.clone(),
            filter,
            cdc_listener: Arc::new(CdcListener::new()),
            subscribers: RwLock::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&fanout);
        fanout.cdc_listener.on_all(move |event| {
            if let Some(fanout) = weak.upgrade() {
                fanout.publish(event);
            }
        });
        fanout
    }

    /// Register a subscriber with its claims
    ///
    /// # Errors
    /// Returns `InvalidQuery` if the request's row filter does not parse.
    pub fn subscribe(
        &self,
        request: SubscriptionRequest,
        claims: ClaimsContext,
    ) -> Result<SubscriberHandle> {
        let subscription = Subscription::new(request, claims)?;
        let id = subscription.id;
        let (sender, events) = mpsc::channel(self.config.channel_capacity);

        tracing::debug!(
            subscriber = %id,
            table = %subscription.table,
            role = %subscription.claims.role(),
            "subscriber registered"
        );
        self.subscribers.write().insert(
            id,
            Subscriber {
                subscription,
                sender,
            },
        );
        Ok(SubscriberHandle { id, events })
    }

    /// Remove a subscriber; returns whether it was registered
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        self.subscribers.write().remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Emit committed changes through the CDC listener
    pub fn publish_changes(&self, changes: Vec<RowChange>) -> usize {
        self.cdc_listener.emit_changes(changes)
    }

    /// Deliver one event to every subscriber admitted by the publication
    /// filter; returns the number of deliveries.
    ///
    /// Evaluation errors withhold the event from that subscriber. Subscribers
    /// whose receiver is gone are dropped.
    pub fn publish(&self, event: &ChangeEvent) -> usize {
        let targets: Vec<(Subscription, mpsc::Sender<ChangeEvent>)> = self
            .subscribers
            .read()
            .values()
            .map(|s| (s.subscription.clone(), s.sender.clone()))
            .collect();

        let mut delivered = 0;
        let mut closed = Vec::new();

        for (subscription, sender) in targets {
            match self.filter.admits(event, &subscription) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::error!(
                        subscriber = %subscription.id,
                        table = %event.table,
                        error = %e,
                        "publication filter failed, event withheld"
                    );
                    continue;
                }
            }

            match sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        subscriber = %subscription.id,
                        table = %event.table,
                        "subscriber channel full, event dropped"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(subscription.id),
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self.subscribers.write();
            for id in closed {
                subscribers.remove(&id);
                tracing::debug!(subscriber = %id, "subscriber disconnected");
            }
        }

        delivered
    }
}
