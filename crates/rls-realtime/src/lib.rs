//! RLS-filtered change notifications
//!
//! Committed row changes become events that reach only subscribers whose
//! `SELECT` policies admit the affected row:
//! - Change data capture from executor writes
//! - Table, change type and row-filter subscriptions
//! - Publication filter reusing policy evaluation
//! - Bounded per-subscriber delivery over `tokio` channels

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cdc;
pub mod fanout;
pub mod publication;
pub mod subscription;

pub use cdc::{CdcListener, ChangeEvent, ChangeType};
pub use fanout::{ChangeFanout, SubscriberHandle};
pub use publication::PublicationFilter;
pub use subscription::{EventFilter, Subscription, SubscriptionRequest};
