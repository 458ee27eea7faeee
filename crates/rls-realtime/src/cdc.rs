//! Change data capture
//!
//! Turns committed row changes into events and hands them to listeners.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use rls_common::{Operation, Row};
use rls_engine::RowChange;

/// Change type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

impl ChangeType {
    /// Map a write operation; `SELECT` produces no change
    pub fn from_operation(operation: Operation) -> Option<Self> {
        match operation {
            Operation::Insert => Some(ChangeType::Insert),
            Operation::Update => Some(ChangeType::Update),
            Operation::Delete => Some(ChangeType::Delete),
            Operation::Select => None,
        }
    }
}

/// A committed change to one row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    pub table: String,
    pub commit_timestamp: String,
    pub new: Option<Row>,
    pub old: Option<Row>,
}

impl ChangeEvent {
    fn build(change_type: ChangeType, table: &str, new: Option<Row>, old: Option<Row>) -> Self {
        Self {
            id: Uuid::new_v4(),
            change_type,
            table: table.to_string(),
            commit_timestamp: chrono::Utc::now().to_rfc3339(),
            new,
            old,
        }
    }

    pub fn insert(table: &str, record: Row) -> Self {
        Self::build(ChangeType::Insert, table, Some(record), None)
    }

    pub fn update(table: &str, old: Row, new: Row) -> Self {
        Self::build(ChangeType::Update, table, Some(new), Some(old))
    }

    pub fn delete(table: &str, old: Row) -> Self {
        Self::build(ChangeType::Delete, table, None, Some(old))
    }

    /// Build the event for a committed change, if it carries the row image
    /// its kind requires
    pub fn from_change(change: RowChange) -> Option<Self> {
        let change_type = ChangeType::from_operation(change.operation)?;
        match (change_type, change.old, change.new) {
            (ChangeType::Insert, _, Some(new)) => Some(Self::insert(&change.table, new)),
            (ChangeType::Update, Some(old), Some(new)) => {
                Some(Self::update(&change.table, old, new))
            }
            (ChangeType::Delete, Some(old), _) => Some(Self::delete(&change.table, old)),
            _ => None,
        }
    }

    /// The row a subscriber must be able to read to receive this event:
    /// the new row for INSERT and UPDATE, the old row for DELETE
    pub fn visible_row(&self) -> Option<&Row> {
        match self.change_type {
            ChangeType::Insert | ChangeType::Update => self.new.as_ref(),
            ChangeType::Delete => self.old.as_ref(),
        }
    }
}

/// CDC callback type
pub type CdcCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Dispatches change events to per-table and global listeners
pub struct CdcListener {
    callbacks: RwLock<HashMap<String, Vec<CdcCallback>>>,
    global_callbacks: RwLock<Vec<CdcCallback>>,
}

impl CdcListener {
    pub fn new() -> Self {
        Self {
            callbacks: RwLock::new(HashMap::new()),
            global_callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Register a callback for changes to one table
    pub fn on_table<F>(&self, table: &str, callback: F)
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.callbacks
            .write()
            .entry(table.to_string())
            .or_default()
            .push(Arc::new(callback));
    }

    /// Register a callback for every change
    pub fn on_all<F>(&self, callback: F)
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.global_callbacks.write().push(Arc::new(callback));
    }

    /// Deliver an event to its table's callbacks, then to global ones
    pub fn emit(&self, event: &ChangeEvent) {
        tracing::debug!(
            table = %event.table,
            change = ?event.change_type,
            id = %event.id,
            "emitting change event"
        );

        // Snapshot callbacks so listeners may register others while running
        let table_callbacks: Vec<CdcCallback> = self
            .callbacks
            .read()
            .get(&event.table)
            .cloned()
            .unwrap_or_default();
        let global: Vec<CdcCallback> = self.global_callbacks.read().clone();

        for callback in table_callbacks.iter().chain(global.iter()) {
            callback(event);
        }
    }

    /// Emit events for a batch of committed changes; returns how many were emitted
    pub fn emit_changes(&self, changes: impl IntoIterator<Item = RowChange>) -> usize {
        let mut emitted = 0;
        for event in changes.into_iter().filter_map(ChangeEvent::from_change) {
            self.emit(&event);
            emitted += 1;
        }
        emitted
    }
}

impl Default for CdcListener {
    fn default() -> Self {
        Self::new()
    }
}
