//! In-memory reference storage
//!
//! A transactional table map that drives the enforcement gate the way an
//! external executor would: full scans, no indexes. Every write runs in a
//! transaction over a working copy, so a failed policy check leaves the
//! committed tables untouched.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use rls_common::{Error, Operation, Result, Row};

use crate::context::ClaimsContext;
use crate::evaluator::RowSource;
use crate::expr::Expr;
use crate::gate::{EnforcementGate, GateSession, ReadQuery, WriteDecision};
use crate::parser::parse_predicate;

/// One committed row change, as handed to change fan-out
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub table: String,
    pub operation: Operation,
    /// Row before the change (UPDATE, DELETE)
    pub old: Option<Row>,
    /// Row after the change (INSERT, UPDATE)
    pub new: Option<Row>,
}

/// In-memory tables
#[derive(Default)]
pub struct MemoryStorage {
    tables: RwLock<HashMap<String, Vec<Row>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty table; existing tables are left alone
    pub fn create_table(&self, table: &str) {
        self.tables.write().entry(table.to_string()).or_default();
    }

    /// Load rows without any policy check
    pub fn seed(&self, table: &str, rows: impl IntoIterator<Item = Row>) {
        self.tables
            .write()
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    /// Run `f` against a consistent read view
    ///
    /// # Errors
    /// Propagates the error returned by `f`.
    pub fn read<T>(&self, f: impl FnOnce(&Snapshot) -> Result<T>) -> Result<T> {
        let tables = self.tables.read();
        f(&Snapshot { tables: &tables })
    }

    /// Run `f` in a transaction; its changes commit only if it returns `Ok`
    ///
    /// # Errors
    /// Propagates the error returned by `f`, after discarding its changes.
    pub fn transaction<T>(&self, f: impl FnOnce(&mut Transaction) -> Result<T>) -> Result<T> {
        let mut tables = self.tables.write();
        let mut tx = Transaction {
            tables: tables.clone(),
        };

        match f(&mut tx) {
            Ok(value) => {
                *tables = tx.tables;
                Ok(value)
            }
            Err(e) => {
                tracing::debug!(error = %e, "transaction rolled back");
                Err(e)
            }
        }
    }
}

impl RowSource for MemoryStorage {
    fn scan(&self, table: &str) -> Result<Vec<Row>> {
        scan_map(&self.tables.read(), table)
    }
}

fn scan_map(tables: &HashMap<String, Vec<Row>>, table: &str) -> Result<Vec<Row>> {
    tables
        .get(table)
        .cloned()
        .ok_or_else(|| Error::TableNotFound(table.to_string()))
}

/// Read view held for the duration of one read
pub struct Snapshot<'a> {
    tables: &'a HashMap<String, Vec<Row>>,
}

impl RowSource for Snapshot<'_> {
    fn scan(&self, table: &str) -> Result<Vec<Row>> {
        scan_map(self.tables, table)
    }
}

/// Working copy of all tables
pub struct Transaction {
    tables: HashMap<String, Vec<Row>>,
}

impl Transaction {
    fn rows_mut(&mut self, table: &str) -> Result<&mut Vec<Row>> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| Error::TableNotFound(table.to_string()))
    }
}

impl RowSource for Transaction {
    fn scan(&self, table: &str) -> Result<Vec<Row>> {
        scan_map(&self.tables, table)
    }
}

/// UPDATE request
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub table: String,
    pub filter: Option<Expr>,
    pub changes: Row,
    /// Single-row request: zero affected rows is a rejection
    pub expect_one: bool,
}

impl UpdateRequest {
    pub fn new(table: &str, changes: Row) -> Self {
        Self {
            table: table.to_string(),
            filter: None,
            changes,
            expect_one: false,
        }
    }

    /// # Errors
    /// Returns `InvalidQuery` if the filter does not compile.
    pub fn filter(mut self, sql: &str) -> Result<Self> {
        self.filter = Some(parse_predicate(sql).map_err(|e| Error::InvalidQuery(e.to_string()))?);
        Ok(self)
    }

    #[must_use]
    pub fn expect_one(mut self) -> Self {
        self.expect_one = true;
        self
    }
}

/// DELETE request
#[derive(Debug, Clone)]
pub struct DeleteRequest {
    pub table: String,
    pub filter: Option<Expr>,
    pub expect_one: bool,
}

impl DeleteRequest {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            filter: None,
            expect_one: false,
        }
    }

    /// # Errors
    /// Returns `InvalidQuery` if the filter does not compile.
    pub fn filter(mut self, sql: &str) -> Result<Self> {
        self.filter = Some(parse_predicate(sql).map_err(|e| Error::InvalidQuery(e.to_string()))?);
        Ok(self)
    }

    #[must_use]
    pub fn expect_one(mut self) -> Self {
        self.expect_one = true;
        self
    }
}

/// Executes reads and writes against [`MemoryStorage`] through the gate
pub struct Executor {
    storage: Arc<MemoryStorage>,
    gate: Arc<EnforcementGate>,
}

impl Executor {
    pub fn new(storage: Arc<MemoryStorage>, gate: Arc<EnforcementGate>) -> Self {
        Self { storage, gate }
    }

    pub fn storage(&self) -> &Arc<MemoryStorage> {
        &self.storage
    }

    /// Rows matching `query` that the caller may see
    ///
    /// # Errors
    /// `TableNotFound`, or predicate evaluation and recursion errors.
    pub fn select(&self, query: &ReadQuery, claims: &ClaimsContext) -> Result<Vec<Row>> {
        self.storage
            .read(|snapshot| self.gate.session(claims, snapshot).select(query))
    }

    /// Insert rows; all of them pass `with_check` or none is written
    ///
    /// # Errors
    /// `PolicyCheckViolation` if any row fails the check.
    pub fn insert(
        &self,
        table: &str,
        rows: Vec<Row>,
        claims: &ClaimsContext,
    ) -> Result<Vec<RowChange>> {
        self.storage.transaction(|tx| {
            let mut changes = Vec::with_capacity(rows.len());
            for row in rows {
                let decision = self.gate.session(claims, &*tx).authorize_write(
                    table,
                    Operation::Insert,
                    None,
                    Some(&row),
                )?;
                if let WriteDecision::Reject(_) = decision {
                    return Err(Error::check_violation(table, Operation::Insert));
                }

                tx.rows_mut(table)?.push(row.clone());
                changes.push(RowChange {
                    table: table.to_string(),
                    operation: Operation::Insert,
                    old: None,
                    new: Some(row),
                });
            }
            Ok(changes)
        })
    }

    /// Update matching visible rows; every post-image must pass `with_check`
    ///
    /// # Errors
    /// `PolicyCheckViolation` if no UPDATE policy applies, if any post-image
    /// fails the check, or if an `expect_one` request affects no row.
    pub fn update(&self, request: &UpdateRequest, claims: &ClaimsContext) -> Result<Vec<RowChange>> {
        let table = request.table.as_str();
        self.storage.transaction(|tx| {
            let planned = {
                let session = self.gate.session(claims, &*tx);
                session.ensure_write_policies(table, Operation::Update)?;
                let mut planned = Vec::new();
                for (index, row) in tx.scan(table)?.into_iter().enumerate() {
                    if !eligible(&session, request.filter.as_ref(), table, Operation::Update, &row)? {
                        continue;
                    }
                    let updated = row.merged(&request.changes);
                    let decision =
                        session.authorize_write(table, Operation::Update, None, Some(&updated))?;
                    if let WriteDecision::Reject(_) = decision {
                        return Err(Error::check_violation(table, Operation::Update));
                    }
                    planned.push((index, row, updated));
                }
                planned
            };

            if request.expect_one && planned.is_empty() {
                return Err(Error::check_violation(table, Operation::Update));
            }

            let rows = tx.rows_mut(table)?;
            let mut changes = Vec::with_capacity(planned.len());
            for (index, old, new) in planned {
                rows[index] = new.clone();
                changes.push(RowChange {
                    table: table.to_string(),
                    operation: Operation::Update,
                    old: Some(old),
                    new: Some(new),
                });
            }
            Ok(changes)
        })
    }

    /// Delete matching visible rows
    ///
    /// # Errors
    /// `PolicyCheckViolation` if no DELETE policy applies, or if an
    /// `expect_one` request affects no row.
    pub fn delete(&self, request: &DeleteRequest, claims: &ClaimsContext) -> Result<Vec<RowChange>> {
        let table = request.table.as_str();
        self.storage.transaction(|tx| {
            let doomed = {
                let session = self.gate.session(claims, &*tx);
                session.ensure_write_policies(table, Operation::Delete)?;
                let mut doomed = Vec::new();
                for (index, row) in tx.scan(table)?.into_iter().enumerate() {
                    if eligible(&session, request.filter.as_ref(), table, Operation::Delete, &row)? {
                        doomed.push((index, row));
                    }
                }
                doomed
            };

            if request.expect_one && doomed.is_empty() {
                return Err(Error::check_violation(table, Operation::Delete));
            }

            let rows = tx.rows_mut(table)?;
            let mut changes = Vec::with_capacity(doomed.len());
            for (index, old) in doomed.into_iter().rev() {
                rows.remove(index);
                changes.push(RowChange {
                    table: table.to_string(),
                    operation: Operation::Delete,
                    old: Some(old),
                    new: None,
                });
            }
            changes.reverse();
            Ok(changes)
        })
    }
}

/// Caller's filter matches and the row passes `using`
fn eligible(
    session: &GateSession<'_>,
    filter: Option<&Expr>,
    table: &str,
    operation: Operation,
    row: &Row,
) -> Result<bool> {
    if let Some(filter) = filter {
        if !session.matches(filter, table, row)? {
            return Ok(false);
        }
    }
    Ok(session
        .authorize_write(table, operation, Some(row), None)?
        .is_allowed())
}
