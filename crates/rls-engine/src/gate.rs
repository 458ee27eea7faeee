//! Enforcement gate: every table operation passes through here
//!
//! Reads get the effective `using` predicate pushed into their filter before
//! any row is materialized. Writes are decided row by row: `using` on the
//! existing row, `with_check` on the proposed one.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;

use rls_common::{Error, Operation, Result, Row};

use crate::context::ClaimsContext;
use crate::evaluator::{EvalEnv, ExpressionEvaluator, RowSource, VisibleRows};
use crate::expr::Expr;
use crate::parser::parse_predicate;
use crate::resolver::{PolicyResolver, Predicate};

/// Per-operation gate states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Received,
    ResolvingPolicy,
    Filtering,
    Checking,
    Completed,
    Rejected,
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GateState::Received => "received",
            GateState::ResolvingPolicy => "resolving_policy",
            GateState::Filtering => "filtering",
            GateState::Checking => "checking",
            GateState::Completed => "completed",
            GateState::Rejected => "rejected",
        })
    }
}

/// Tracks one operation through the gate
struct Transit<'a> {
    table: &'a str,
    operation: Operation,
    state: GateState,
}

impl<'a> Transit<'a> {
    fn new(table: &'a str, operation: Operation) -> Self {
        tracing::trace!(table, %operation, state = %GateState::Received, "gate");
        Self {
            table,
            operation,
            state: GateState::Received,
        }
    }

    fn enter(&mut self, next: GateState) {
        tracing::trace!(
            table = self.table,
            operation = %self.operation,
            from = %self.state,
            to = %next,
            "gate"
        );
        self.state = next;
    }

    fn reject(&mut self, role: &str, reason: &str) {
        self.enter(GateState::Rejected);
        tracing::warn!(
            target: "rls::audit",
            table = self.table,
            operation = %self.operation,
            role,
            reason,
            "write rejected by row level security"
        );
    }
}

/// Outcome of [`EnforcementGate::authorize_write`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteDecision {
    Allow,
    Reject(String),
}

impl WriteDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, WriteDecision::Allow)
    }
}

/// Structured read request: a table plus the caller's own filter
#[derive(Debug, Clone, PartialEq)]
pub struct ReadQuery {
    pub table: String,
    pub filter: Option<Expr>,
    pub limit: Option<usize>,
}

impl ReadQuery {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            filter: None,
            limit: None,
        }
    }

    /// Add a filter written as SQL boolean expression text
    ///
    /// # Errors
    /// Returns `InvalidQuery` if the text does not compile.
    pub fn filter(self, sql: &str) -> Result<Self> {
        let expr = parse_predicate(sql).map_err(|e| Error::InvalidQuery(e.to_string()))?;
        Ok(self.with_filter(expr))
    }

    /// AND another condition onto the filter
    #[must_use]
    pub fn with_filter(mut self, expr: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => Expr::and(vec![existing, expr]),
            None => expr,
        });
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Intercepts table operations and applies row level security
pub struct EnforcementGate {
    resolver: Arc<PolicyResolver>,
    evaluator: Arc<ExpressionEvaluator>,
}

impl EnforcementGate {
    pub fn new(resolver: Arc<PolicyResolver>, evaluator: Arc<ExpressionEvaluator>) -> Self {
        Self { resolver, evaluator }
    }

    pub fn resolver(&self) -> &Arc<PolicyResolver> {
        &self.resolver
    }

    pub fn evaluator(&self) -> &Arc<ExpressionEvaluator> {
        &self.evaluator
    }

    /// Start one operation: the clock is read once and shared by every check
    pub fn session<'a>(
        &'a self,
        claims: &'a ClaimsContext,
        source: &'a dyn RowSource,
    ) -> GateSession<'a> {
        GateSession {
            gate: self,
            env: EvalEnv {
                claims,
                source,
                rows: self,
                now: Utc::now(),
            },
        }
    }

    fn bypassed(claims: &ClaimsContext, table: &str, operation: Operation) -> bool {
        match claims.bypass() {
            Some(token) => {
                tracing::info!(
                    target: "rls::audit",
                    issuer = %token.issuer(),
                    table,
                    %operation,
                    "row level security bypassed"
                );
                true
            }
            None => false,
        }
    }

    /// Rewrite a read so it only matches rows the caller may see.
    ///
    /// The caller's filter is kept and the `using` predicate is ANDed onto
    /// it; a denied read becomes a filter that is constantly false.
    pub fn filter_for_read(&self, query: &ReadQuery, claims: &ClaimsContext) -> ReadQuery {
        let mut transit = Transit::new(&query.table, Operation::Select);
        if Self::bypassed(claims, &query.table, Operation::Select) {
            transit.enter(GateState::Completed);
            return query.clone();
        }

        transit.enter(GateState::ResolvingPolicy);
        let resolved = self.resolver.resolve(&query.table, Operation::Select, claims);

        transit.enter(GateState::Filtering);
        let rewritten = match &resolved.using {
            Predicate::Allow => query.clone(),
            other => query.clone().with_filter(other.to_expr()),
        };
        transit.enter(GateState::Completed);
        rewritten
    }

    /// Run a read against `source`, returning only visible matching rows
    ///
    /// # Errors
    /// Propagates predicate evaluation and recursion errors.
    pub fn select(
        &self,
        query: &ReadQuery,
        claims: &ClaimsContext,
        source: &dyn RowSource,
    ) -> Result<Vec<Row>> {
        self.session(claims, source).select(query)
    }

    /// Whether the caller could `SELECT` this row
    ///
    /// # Errors
    /// Propagates predicate evaluation and recursion errors.
    pub fn can_read(
        &self,
        table: &str,
        row: &Row,
        claims: &ClaimsContext,
        source: &dyn RowSource,
    ) -> Result<bool> {
        self.session(claims, source).can_read(table, row)
    }

    /// Decide a single write; see [`GateSession::authorize_write`]
    ///
    /// # Errors
    /// Propagates predicate evaluation and recursion errors.
    pub fn authorize_write(
        &self,
        table: &str,
        operation: Operation,
        existing: Option<&Row>,
        proposed: Option<&Row>,
        claims: &ClaimsContext,
        source: &dyn RowSource,
    ) -> Result<WriteDecision> {
        self.session(claims, source)
            .authorize_write(table, operation, existing, proposed)
    }

    fn test(
        &self,
        predicate: &Predicate,
        table: &str,
        row: &Row,
        env: &EvalEnv<'_>,
        depth: u32,
    ) -> Result<bool> {
        match predicate {
            Predicate::Allow => Ok(true),
            Predicate::Deny => Ok(false),
            Predicate::Filter(expr) => {
                self.evaluator
                    .evaluate(expr, table, row, env, depth)
                    .map_err(|e| {
                        tracing::error!(table, error = %e, "policy evaluation failed");
                        e
                    })
            }
        }
    }
}

/// One operation passing through the gate
pub struct GateSession<'a> {
    gate: &'a EnforcementGate,
    env: EvalEnv<'a>,
}

impl GateSession<'_> {
    pub fn claims(&self) -> &ClaimsContext {
        self.env.claims
    }

    /// Run a read, returning only visible matching rows
    ///
    /// # Errors
    /// Propagates predicate evaluation and recursion errors.
    pub fn select(&self, query: &ReadQuery) -> Result<Vec<Row>> {
        let rewritten = self.gate.filter_for_read(query, self.env.claims);
        if matches!(rewritten.filter, Some(ref f) if *f == Expr::FALSE) {
            return Ok(vec![]);
        }

        let mut rows = Vec::new();
        for row in self.env.source.scan(&rewritten.table)? {
            if rewritten.limit.is_some_and(|limit| rows.len() >= limit) {
                break;
            }
            let keep = match &rewritten.filter {
                Some(filter) => self.matches(filter, &rewritten.table, &row)?,
                None => true,
            };
            if keep {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// Evaluate a caller-supplied filter against a row
    ///
    /// # Errors
    /// Propagates predicate evaluation and recursion errors.
    pub fn matches(&self, filter: &Expr, table: &str, row: &Row) -> Result<bool> {
        self.gate.evaluator.evaluate(filter, table, row, &self.env, 0)
    }

    /// Whether the caller could `SELECT` this row
    ///
    /// # Errors
    /// Propagates predicate evaluation and recursion errors.
    pub fn can_read(&self, table: &str, row: &Row) -> Result<bool> {
        if self.env.claims.bypass().is_some() {
            return Ok(true);
        }
        let resolved = self
            .gate
            .resolver
            .resolve(table, Operation::Select, self.env.claims);
        self.gate.test(&resolved.using, table, row, &self.env, 0)
    }

    /// Reject an UPDATE or DELETE outright when RLS is on and no policy
    /// applies to the caller's role
    ///
    /// # Errors
    /// `PolicyCheckViolation` when there is nothing that could grant the write.
    pub fn ensure_write_policies(&self, table: &str, operation: Operation) -> Result<()> {
        if self.env.claims.bypass().is_some() {
            return Ok(());
        }
        let resolved = self.gate.resolver.resolve(table, operation, self.env.claims);
        if resolved.denies_all_writes() {
            tracing::debug!(
                table,
                %operation,
                role = %self.env.claims.role(),
                "no applicable write policy"
            );
            return Err(Error::check_violation(table, operation));
        }
        Ok(())
    }

    /// Decide a write.
    ///
    /// `existing` is checked against `using` (UPDATE/DELETE eligibility) and
    /// `proposed` against `with_check` (INSERT/UPDATE). A rejected existing
    /// row should be treated by the caller as not matching at all.
    ///
    /// # Errors
    /// Propagates predicate evaluation and recursion errors.
    pub fn authorize_write(
        &self,
        table: &str,
        operation: Operation,
        existing: Option<&Row>,
        proposed: Option<&Row>,
    ) -> Result<WriteDecision> {
        let claims = self.env.claims;
        let mut transit = Transit::new(table, operation);
        if EnforcementGate::bypassed(claims, table, operation) {
            transit.enter(GateState::Completed);
            return Ok(WriteDecision::Allow);
        }

        transit.enter(GateState::ResolvingPolicy);
        let resolved = self.gate.resolver.resolve(table, operation, claims);

        if let Some(row) = existing.filter(|_| operation != Operation::Insert) {
            transit.enter(GateState::Filtering);
            if !self.gate.test(&resolved.using, table, row, &self.env, 0)? {
                transit.enter(GateState::Rejected);
                return Ok(WriteDecision::Reject(format!(
                    "row is not visible for {operation} on table \"{table}\""
                )));
            }
        }

        if let Some(row) = proposed.filter(|_| operation != Operation::Delete) {
            transit.enter(GateState::Checking);
            if !self.gate.test(&resolved.check, table, row, &self.env, 0)? {
                let reason =
                    format!("new row violates row-level security policy for table \"{table}\"");
                transit.reject(claims.role(), &reason);
                return Ok(WriteDecision::Reject(reason));
            }
        }

        transit.enter(GateState::Completed);
        Ok(WriteDecision::Allow)
    }
}

impl VisibleRows for EnforcementGate {
    fn visible_rows(&self, table: &str, env: &EvalEnv<'_>, depth: u32) -> Result<Vec<Row>> {
        let rows = env.source.scan(table)?;
        if env.claims.bypass().is_some() {
            return Ok(rows);
        }

        let resolved = self.resolver.resolve(table, Operation::Select, env.claims);
        match &resolved.using {
            Predicate::Allow => Ok(rows),
            Predicate::Deny => Ok(vec![]),
            predicate => {
                let mut visible = Vec::with_capacity(rows.len());
                for row in rows {
                    if self.test(predicate, table, &row, env, depth)? {
                        visible.push(row);
                    }
                }
                Ok(visible)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use serde_json::json;

    use crate::context::ServiceKeyAuthority;
    use crate::functions::DefinerRegistry;
    use crate::policy::{PolicyCommand, PolicyDefinition, PolicyStore};

    struct Tables(HashMap<String, Vec<Row>>);

    impl RowSource for Tables {
        fn scan(&self, table: &str) -> Result<Vec<Row>> {
            Ok(self.0.get(table).cloned().unwrap_or_default())
        }
    }

    fn rows(values: serde_json::Value) -> Vec<Row> {
        values
            .as_array()
            .unwrap()
            .iter()
            .map(|v| Row::from_value(v.clone()).unwrap())
            .collect()
    }

    fn setup() -> (Arc<PolicyStore>, EnforcementGate, Tables) {
        let store = Arc::new(PolicyStore::new());
        let resolver = Arc::new(PolicyResolver::new(Arc::clone(&store), true));
        let evaluator = Arc::new(ExpressionEvaluator::new(Arc::new(DefinerRegistry::new()), 16));
        let tables = Tables(HashMap::from([
            (
                "docs".to_string(),
                rows(json!([
                    {"id": 1, "owner": "alice", "team_id": 1},
                    {"id": 2, "owner": "bob", "team_id": 2}
                ])),
            ),
            (
                "members".to_string(),
                rows(json!([
                    {"team_id": 1, "user_id": "alice"},
                    {"team_id": 2, "user_id": "bob"}
                ])),
            ),
        ]));
        (store, EnforcementGate::new(resolver, evaluator), tables)
    }

    fn alice() -> ClaimsContext {
        ClaimsContext::authenticated("alice", "authenticated")
    }

    #[test]
    fn test_filter_for_read_keeps_caller_filter() {
        let (store, gate, _) = setup();
        store.enable_rls("docs");
        store
            .create_policy(
                PolicyDefinition::new("own", "docs", PolicyCommand::Select)
                    .with_using("owner = auth.uid()"),
            )
            .unwrap();

        let query = ReadQuery::new("docs").filter("id > 0").unwrap();
        let rewritten = gate.filter_for_read(&query, &alice());
        assert!(matches!(rewritten.filter, Some(Expr::And(ref parts)) if parts.len() == 2));
    }

    #[test]
    fn test_select_default_deny() {
        let (store, gate, tables) = setup();
        store.enable_rls("docs");

        let rows = gate.select(&ReadQuery::new("docs"), &alice(), &tables).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_select_owner_only() {
        let (store, gate, tables) = setup();
        store.enable_rls("docs");
        store
            .create_policy(
                PolicyDefinition::new("own", "docs", PolicyCommand::Select)
                    .with_using("owner = auth.uid()"),
            )
            .unwrap();

        let rows = gate.select(&ReadQuery::new("docs"), &alice(), &tables).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("owner"), Some(&json!("alice")));
    }

    #[test]
    fn test_joined_table_rls_applies_to_subquery() {
        let (store, gate, tables) = setup();
        store.enable_rls("docs");
        store.enable_rls("members");
        store
            .create_policy(
                PolicyDefinition::new("team", "docs", PolicyCommand::Select).with_using(
                    "team_id in (select team_id from members)",
                ),
            )
            .unwrap();
        store
            .create_policy(
                PolicyDefinition::new("self", "members", PolicyCommand::Select)
                    .with_using("user_id = auth.uid()"),
            )
            .unwrap();

        let rows = gate.select(&ReadQuery::new("docs"), &alice(), &tables).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("team_id"), Some(&json!(1)));
    }

    #[test]
    fn test_cyclic_policies_hit_recursion_limit() {
        let (store, gate, tables) = setup();
        store.enable_rls("docs");
        store.enable_rls("members");
        store
            .create_policy(
                PolicyDefinition::new("docs_via_members", "docs", PolicyCommand::Select)
                    .with_using("exists (select 1 from members)"),
            )
            .unwrap();
        store
            .create_policy(
                PolicyDefinition::new("members_via_docs", "members", PolicyCommand::Select)
                    .with_using("exists (select 1 from docs)"),
            )
            .unwrap();

        let err = gate.select(&ReadQuery::new("docs"), &alice(), &tables).unwrap_err();
        assert!(matches!(err, Error::PolicyRecursionLimitExceeded { max_depth: 16 }));
    }

    #[test]
    fn test_authorize_insert() {
        let (store, gate, tables) = setup();
        store.enable_rls("docs");
        store
            .create_policy(
                PolicyDefinition::new("own", "docs", PolicyCommand::Insert)
                    .with_check("owner = auth.uid()"),
            )
            .unwrap();

        let mine = Row::from_value(json!({"id": 3, "owner": "alice", "team_id": 1})).unwrap();
        let theirs = Row::from_value(json!({"id": 4, "owner": "bob", "team_id": 1})).unwrap();

        let allowed = gate
            .authorize_write("docs", Operation::Insert, None, Some(&mine), &alice(), &tables)
            .unwrap();
        assert!(allowed.is_allowed());

        let rejected = gate
            .authorize_write("docs", Operation::Insert, None, Some(&theirs), &alice(), &tables)
            .unwrap();
        assert!(matches!(rejected, WriteDecision::Reject(_)));
    }

    #[test]
    fn test_bypass_token_skips_policies() {
        let (store, gate, tables) = setup();
        store.enable_rls("docs");

        let authority = ServiceKeyAuthority::new("tests", "a-very-long-service-key").unwrap();
        let token = authority.authenticate("a-very-long-service-key").unwrap();
        let service = ClaimsContext::anonymous("service_role").with_bypass(token);

        let rows = gate.select(&ReadQuery::new("docs"), &service, &tables).unwrap();
        assert_eq!(rows.len(), 2);

        // The role name alone grants nothing
        let pretender = ClaimsContext::anonymous("service_role");
        assert!(gate.select(&ReadQuery::new("docs"), &pretender, &tables).unwrap().is_empty());
    }

    #[test]
    fn test_limit() {
        let (_, gate, tables) = setup();
        let rows = gate
            .select(&ReadQuery::new("docs").limit(1), &alice(), &tables)
            .unwrap();
        assert_eq!(rows.len(), 1);
    }
}
