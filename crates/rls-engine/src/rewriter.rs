//! SQL query rewriter for RLS enforcement
//!
//! Every table a `SELECT` reads is replaced by a derived table that applies
//! the table's `using` predicate, with the caller's claims bound as literals:
//!
//! ```text
//! SELECT title FROM docs
//!   => SELECT title FROM (SELECT * FROM docs WHERE (owner = 'u1')) AS docs
//! ```
//!
//! Sub-queries inside a policy get the RLS of the tables they read embedded
//! as well, down to the configured recursion depth. Security-definer calls
//! are inlined without RLS on their body.

use std::convert::Infallible;
use std::ops::ControlFlow;
use std::sync::Arc;

use sqlparser::ast::{
    visit_relations, Expr as SqlExpr, Ident, ObjectName, Query, SetExpr, Statement, TableAlias,
    TableFactor, TableWithJoins,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use rls_common::{Error, Operation, Result};

use crate::context::ClaimsContext;
use crate::datum::Datum;
use crate::evaluator::ExpressionEvaluator;
use crate::expr::{ColumnRef, Expr, Literal, SubQuery, TableRef};
use crate::functions::{FunctionContext, SecurityDefiner};
use crate::resolver::{PolicyResolver, Predicate};

/// Query rewriter that injects RLS conditions into SQL queries
pub struct QueryRewriter {
    resolver: Arc<PolicyResolver>,
    evaluator: Arc<ExpressionEvaluator>,
}

impl QueryRewriter {
    /// Create a new query rewriter
    pub fn new(resolver: Arc<PolicyResolver>, evaluator: Arc<ExpressionEvaluator>) -> Self {
        Self {
            resolver,
            evaluator,
        }
    }

    /// Rewrite a SELECT query with RLS conditions
    ///
    /// # Errors
    /// `InvalidQuery` for anything other than a single `SELECT`, or for query
    /// shapes whose every table read cannot be secured;
    /// `PolicyRecursionLimitExceeded` for cyclic policies.
    pub fn rewrite_select(&self, sql: &str, claims: &ClaimsContext) -> Result<String> {
        let mut query = parse_single_query(sql)?;

        if let Some(token) = claims.bypass() {
            tracing::info!(
                target: "rls::audit",
                issuer = %token.issuer(),
                "row level security bypassed for query rewrite"
            );
            return Ok(query.to_string());
        }

        let mut relations = 0usize;
        let visited = visit_relations(&*query, |_| {
            relations += 1;
            ControlFlow::<Infallible>::Continue(())
        });
        match visited {
            ControlFlow::Continue(()) => {}
            ControlFlow::Break(never) => match never {},
        }

        let secured = self.secure_query(&mut query, claims)?;
        if secured != relations {
            return Err(Error::InvalidQuery(
                "query reads tables in positions that cannot be secured".to_string(),
            ));
        }

        let rewritten = query.to_string();
        tracing::debug!(original = sql, rewritten = %rewritten, "rewrote query");
        Ok(rewritten)
    }

    fn secure_query(&self, query: &mut Query, claims: &ClaimsContext) -> Result<usize> {
        if query.with.is_some() {
            return Err(Error::InvalidQuery(
                "WITH clauses are not supported".to_string(),
            ));
        }
        self.secure_set_expr(&mut query.body, claims)
    }

    fn secure_set_expr(&self, body: &mut SetExpr, claims: &ClaimsContext) -> Result<usize> {
        match body {
            SetExpr::Select(select) => {
                let mut secured = 0;
                for source in &mut select.from {
                    secured += self.secure_table_with_joins(source, claims)?;
                }
                if let Some(selection) = &mut select.selection {
                    secured += self.secure_expr(selection, claims)?;
                }
                Ok(secured)
            }
            SetExpr::Query(query) => self.secure_query(query, claims),
            SetExpr::SetOperation { left, right, .. } => {
                Ok(self.secure_set_expr(left, claims)? + self.secure_set_expr(right, claims)?)
            }
            SetExpr::Values(_) => Ok(0),
            other => Err(Error::InvalidQuery(format!("unsupported query body {other}"))),
        }
    }

    fn secure_table_with_joins(
        &self,
        source: &mut TableWithJoins,
        claims: &ClaimsContext,
    ) -> Result<usize> {
        let mut secured = self.secure_factor(&mut source.relation, claims)?;
        for join in &mut source.joins {
            secured += self.secure_factor(&mut join.relation, claims)?;
        }
        Ok(secured)
    }

    fn secure_factor(&self, factor: &mut TableFactor, claims: &ClaimsContext) -> Result<usize> {
        let derived = match factor {
            TableFactor::Table { name, alias, .. } => {
                let table = relation_name(name)?;
                let Some(predicate) = self.secured_predicate(&table, claims, 0)? else {
                    return Ok(1);
                };

                let short = name.0.last().cloned().unwrap_or_else(|| Ident::new(&table));
                let alias = alias.clone().unwrap_or_else(|| TableAlias {
                    name: short,
                    columns: vec![],
                });
                TableFactor::Derived {
                    lateral: false,
                    subquery: parse_single_query(&format!("SELECT * FROM {name} WHERE {predicate}"))?,
                    alias: Some(alias),
                }
            }
            TableFactor::Derived { subquery, .. } => return self.secure_query(subquery, claims),
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => return self.secure_table_with_joins(table_with_joins, claims),
            other => return Err(Error::InvalidQuery(format!("unsupported table source {other}"))),
        };

        *factor = derived;
        Ok(1)
    }

    fn secure_expr(&self, expr: &mut SqlExpr, claims: &ClaimsContext) -> Result<usize> {
        match expr {
            SqlExpr::Subquery(query) | SqlExpr::Exists { subquery: query, .. } => {
                self.secure_query(query, claims)
            }
            SqlExpr::InSubquery { expr, subquery, .. } => {
                Ok(self.secure_expr(expr, claims)? + self.secure_query(subquery, claims)?)
            }
            SqlExpr::BinaryOp { left, right, .. } => {
                Ok(self.secure_expr(left, claims)? + self.secure_expr(right, claims)?)
            }
            SqlExpr::UnaryOp { expr, .. }
            | SqlExpr::Nested(expr)
            | SqlExpr::IsNull(expr)
            | SqlExpr::IsNotNull(expr) => self.secure_expr(expr, claims),
            SqlExpr::Between {
                expr, low, high, ..
            } => Ok(self.secure_expr(expr, claims)?
                + self.secure_expr(low, claims)?
                + self.secure_expr(high, claims)?),
            SqlExpr::InList { expr, list, .. } => {
                let mut secured = self.secure_expr(expr, claims)?;
                for item in list {
                    secured += self.secure_expr(item, claims)?;
                }
                Ok(secured)
            }
            _ => Ok(0),
        }
    }

    /// The bound `using` predicate of `table`, or `None` when unrestricted
    fn secured_predicate(
        &self,
        table: &str,
        claims: &ClaimsContext,
        depth: u32,
    ) -> Result<Option<Expr>> {
        if depth > self.evaluator.max_depth() {
            return Err(Error::PolicyRecursionLimitExceeded {
                max_depth: self.evaluator.max_depth(),
            });
        }

        let resolved = self.resolver.resolve(table, Operation::Select, claims);
        match &resolved.using {
            Predicate::Allow => Ok(None),
            Predicate::Deny => Ok(Some(Expr::FALSE)),
            Predicate::Filter(expr) => {
                let binder = Binder {
                    rewriter: self,
                    claims,
                    depth,
                    params: &[],
                    elevated: false,
                };
                Ok(Some(binder.bind(expr)?))
            }
        }
    }
}

/// Binds claims and embeds nested RLS into one policy predicate
struct Binder<'a> {
    rewriter: &'a QueryRewriter,
    claims: &'a ClaimsContext,
    depth: u32,
    params: &'a [Expr],
    elevated: bool,
}

impl Binder<'_> {
    fn bind(&self, expr: &Expr) -> Result<Expr> {
        expr.transform(&mut |node: &Expr| self.bind_node(node))
    }

    fn bind_node(&self, node: &Expr) -> Result<Option<Expr>> {
        match node {
            Expr::Param(n) => n
                .checked_sub(1)
                .and_then(|i| self.params.get(i))
                .cloned()
                .map(Some)
                .ok_or_else(|| Error::InvalidQuery(format!("there is no parameter ${n}"))),
            Expr::Function { name, args } => self.bind_call(name, args).map(Some),
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                let [Expr::Function { name, args }] = list.as_slice() else {
                    return Ok(None);
                };
                let Some(definer) = self.definer(name) else {
                    return Ok(None);
                };
                if !definer.returns_set() {
                    return Ok(None);
                }
                Ok(Some(Expr::InSubquery {
                    expr: Box::new(self.bind(expr)?),
                    subquery: Box::new(self.inline(&definer, args)?),
                    negated: *negated,
                }))
            }
            Expr::InSubquery {
                expr,
                subquery,
                negated,
            } => Ok(Some(Expr::InSubquery {
                expr: Box::new(self.bind(expr)?),
                subquery: Box::new(self.secure_subquery(subquery)?),
                negated: *negated,
            })),
            Expr::Exists { subquery, negated } => Ok(Some(Expr::Exists {
                subquery: Box::new(self.secure_subquery(subquery)?),
                negated: *negated,
            })),
            _ => Ok(None),
        }
    }

    fn definer(&self, name: &str) -> Option<Arc<SecurityDefiner>> {
        self.rewriter.evaluator.definers().get(name)
    }

    fn bind_call(&self, name: &str, args: &[Expr]) -> Result<Expr> {
        let args = args
            .iter()
            .map(|a| self.bind(a))
            .collect::<Result<Vec<_>>>()?;

        if let Some(definer) = self.definer(name) {
            if definer.returns_set() {
                return Err(Error::InvalidQuery(format!(
                    "{name}() returns a set and can only appear in IN (...)"
                )));
            }
            return Ok(Expr::Exists {
                subquery: Box::new(self.inline(&definer, &args)?),
                negated: false,
            });
        }

        // Only claim lookups are bound; other built-ins run in the executor
        if !name.starts_with("auth.") {
            return Ok(Expr::Function {
                name: name.to_string(),
                args,
            });
        }

        let function = self
            .rewriter
            .evaluator
            .functions()
            .get(name)
            .ok_or_else(|| Error::InvalidQuery(format!("function {name}() does not exist")))?;
        let values = args
            .iter()
            .map(|a| match a {
                Expr::Literal(literal) => Ok(Datum::from_literal(literal)),
                other => Err(Error::InvalidQuery(format!(
                    "{name}() needs literal arguments, got {other}"
                ))),
            })
            .collect::<Result<Vec<_>>>()?;

        let ctx = FunctionContext {
            claims: self.claims,
            now: chrono::Utc::now(),
        };
        Ok(Expr::Literal(literal_of(function.evaluate(&values, &ctx)?)))
    }

    /// Substitute a helper's body, unsecured, for its call
    fn inline(&self, definer: &SecurityDefiner, args: &[Expr]) -> Result<SubQuery> {
        if args.len() != definer.params() {
            return Err(Error::InvalidQuery(format!(
                "{}() takes {} argument(s), got {}",
                definer.name(),
                definer.params(),
                args.len()
            )));
        }
        let depth = self.depth + 1;
        if depth > self.rewriter.evaluator.max_depth() {
            return Err(Error::PolicyRecursionLimitExceeded {
                max_depth: self.rewriter.evaluator.max_depth(),
            });
        }

        let args = args
            .iter()
            .map(|a| self.bind(a))
            .collect::<Result<Vec<_>>>()?;
        let elevated = Binder {
            rewriter: self.rewriter,
            claims: self.claims,
            depth,
            params: &args,
            elevated: true,
        };
        definer.body().transform(&mut |node: &Expr| elevated.bind_node(node))
    }

    /// Bind a sub-query and AND the RLS of every table it reads into its filter
    fn secure_subquery(&self, subquery: &SubQuery) -> Result<SubQuery> {
        let mut bound = subquery.transform(&mut |node: &Expr| self.bind_node(node))?;
        if self.elevated {
            return Ok(bound);
        }

        let mut conditions: Vec<Expr> = bound.filter.take().into_iter().collect();
        for table in &bound.from {
            if let Some(predicate) =
                self.rewriter
                    .secured_predicate(&table.table, self.claims, self.depth + 1)?
            {
                conditions.push(requalify(&predicate, table)?);
            }
        }
        bound.filter = if conditions.is_empty() {
            None
        } else {
            Some(Expr::and(conditions))
        };
        Ok(bound)
    }
}

/// Point a table's own predicate at its alias inside a sub-query
fn requalify(predicate: &Expr, table: &TableRef) -> Result<Expr> {
    let name = table.alias.as_deref().unwrap_or(&table.table);
    predicate.transform(&mut |node: &Expr| {
        Ok(match node {
            Expr::Column(ColumnRef {
                qualifier: None,
                name: column,
            }) => Some(Expr::Column(ColumnRef::qualified(name, column))),
            Expr::Column(ColumnRef {
                qualifier: Some(q),
                name: column,
            }) if *q == table.table => Some(Expr::Column(ColumnRef::qualified(name, column))),
            // Unqualified names inside deeper sub-queries bind there
            Expr::InSubquery {
                expr,
                subquery,
                negated,
            } => Some(Expr::InSubquery {
                expr: Box::new(requalify(expr, table)?),
                subquery: Box::new(rename_qualifier(subquery, table)?),
                negated: *negated,
            }),
            Expr::Exists { subquery, negated } => Some(Expr::Exists {
                subquery: Box::new(rename_qualifier(subquery, table)?),
                negated: *negated,
            }),
            _ => None,
        })
    })
}

fn rename_qualifier(subquery: &SubQuery, table: &TableRef) -> Result<SubQuery> {
    let Some(alias) = &table.alias else {
        return Ok(subquery.clone());
    };
    subquery.transform(&mut |node: &Expr| {
        Ok(match node {
            Expr::Column(ColumnRef {
                qualifier: Some(q),
                name,
            }) if *q == table.table => Some(Expr::Column(ColumnRef::qualified(alias, name))),
            _ => None,
        })
    })
}

fn literal_of(value: Datum) -> Literal {
    match value {
        Datum::Null => Literal::Null,
        Datum::Bool(b) => Literal::Bool(b),
        Datum::Int(i) => Literal::Int(i),
        Datum::Float(x) => Literal::Float(x),
        Datum::Text(s) => Literal::Text(s),
        Datum::Interval(d) => Literal::Interval(d),
        other => other.to_text().map_or(Literal::Null, Literal::Text),
    }
}

fn relation_name(name: &ObjectName) -> Result<String> {
    if name.0.is_empty() {
        return Err(Error::InvalidQuery("empty table name".to_string()));
    }
    Ok(name
        .0
        .iter()
        .map(|i| i.value.as_str())
        .collect::<Vec<_>>()
        .join("."))
}

fn parse_single_query(sql: &str) -> Result<Box<Query>> {
    let dialect = PostgreSqlDialect {};
    let mut statements =
        Parser::parse_sql(&dialect, sql).map_err(|e| Error::InvalidQuery(e.to_string()))?;

    match (statements.pop(), statements.is_empty()) {
        (Some(Statement::Query(query)), true) => Ok(query),
        _ => Err(Error::InvalidQuery(
            "expected exactly one SELECT statement".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::context::ServiceKeyAuthority;
    use crate::functions::DefinerRegistry;
    use crate::policy::{PolicyCommand, PolicyDefinition, PolicyStore};

    fn setup() -> (Arc<PolicyStore>, Arc<DefinerRegistry>, QueryRewriter) {
        let store = Arc::new(PolicyStore::new());
        let definers = Arc::new(DefinerRegistry::new());
        let resolver = Arc::new(PolicyResolver::new(Arc::clone(&store), true));
        let evaluator = Arc::new(ExpressionEvaluator::new(Arc::clone(&definers), 16));
        (store, definers, QueryRewriter::new(resolver, evaluator))
    }

    fn alice() -> ClaimsContext {
        ClaimsContext::authenticated("alice", "authenticated")
    }

    #[test]
    fn test_rls_disabled_leaves_query_alone() {
        let (_, _, rewriter) = setup();
        let sql = rewriter.rewrite_select("SELECT * FROM docs WHERE id = 1", &alice()).unwrap();
        assert_eq!(sql, "SELECT * FROM docs WHERE id = 1");
    }

    #[test]
    fn test_rewrite_binds_claims() {
        let (store, _, rewriter) = setup();
        store.enable_rls("docs");
        store
            .create_policy(
                PolicyDefinition::new("own", "docs", PolicyCommand::Select)
                    .with_using("owner = auth.uid()"),
            )
            .unwrap();

        let sql = rewriter.rewrite_select("SELECT title FROM docs", &alice()).unwrap();
        assert!(sql.contains("SELECT * FROM docs WHERE (owner = 'alice')"), "{sql}");
        assert!(sql.ends_with("AS docs"), "{sql}");
        assert!(!sql.contains("auth.uid"));
    }

    #[test]
    fn test_rewrite_keeps_quoted_identifiers() {
        let (store, _, rewriter) = setup();
        store.enable_rls("Orders");
        store
            .create_policy(
                PolicyDefinition::new("own", "Orders", PolicyCommand::Select)
                    .with_using(r#""ownerId" = auth.uid()"#),
            )
            .unwrap();

        let sql = rewriter
            .rewrite_select(r#"SELECT * FROM "Orders""#, &alice())
            .unwrap();
        assert!(
            sql.contains(r#"SELECT * FROM "Orders" WHERE ("ownerId" = 'alice')"#),
            "{sql}"
        );
        assert!(sql.ends_with(r#"AS "Orders""#), "{sql}");
    }

    #[test]
    fn test_default_deny_rewrites_to_false() {
        let (store, _, rewriter) = setup();
        store.enable_rls("docs");

        let sql = rewriter.rewrite_select("SELECT * FROM docs d", &alice()).unwrap();
        assert!(sql.contains("WHERE false"), "{sql}");
        assert!(sql.ends_with("AS d"), "{sql}");
    }

    #[test]
    fn test_joined_policy_is_embedded() {
        let (store, _, rewriter) = setup();
        store.enable_rls("docs");
        store.enable_rls("members");
        store
            .create_policy(
                PolicyDefinition::new("team", "docs", PolicyCommand::Select)
                    .with_using("team_id in (select team_id from members)"),
            )
            .unwrap();
        store
            .create_policy(
                PolicyDefinition::new("self", "members", PolicyCommand::Select)
                    .with_using("user_id = auth.uid()"),
            )
            .unwrap();

        let sql = rewriter.rewrite_select("SELECT * FROM docs", &alice()).unwrap();
        assert!(sql.contains("members.user_id = 'alice'"), "{sql}");
    }

    #[test]
    fn test_definer_is_inlined_without_rls() {
        let (store, definers, rewriter) = setup();
        store.enable_rls("docs");
        store.enable_rls("members");
        definers
            .register(
                SecurityDefiner::new(
                    "private.user_teams",
                    1,
                    "select team_id from members where user_id = $1",
                )
                .unwrap(),
            )
            .unwrap();
        store
            .create_policy(
                PolicyDefinition::new("team", "docs", PolicyCommand::Select)
                    .with_using("team_id in (private.user_teams(auth.uid()))"),
            )
            .unwrap();

        let sql = rewriter.rewrite_select("SELECT * FROM docs", &alice()).unwrap();
        assert!(sql.contains("SELECT team_id FROM members WHERE (user_id = 'alice')"), "{sql}");
        assert!(!sql.contains("false"), "{sql}");
    }

    #[test]
    fn test_cyclic_policies_fail() {
        let (store, _, rewriter) = setup();
        store.enable_rls("a");
        store.enable_rls("b");
        store
            .create_policy(
                PolicyDefinition::new("p", "a", PolicyCommand::Select)
                    .with_using("exists (select 1 from b)"),
            )
            .unwrap();
        store
            .create_policy(
                PolicyDefinition::new("p", "b", PolicyCommand::Select)
                    .with_using("exists (select 1 from a)"),
            )
            .unwrap();

        let err = rewriter.rewrite_select("SELECT * FROM a", &alice()).unwrap_err();
        assert!(matches!(err, Error::PolicyRecursionLimitExceeded { .. }));
    }

    #[test]
    fn test_where_clause_subqueries_are_secured() {
        let (store, _, rewriter) = setup();
        store.enable_rls("members");

        let sql = rewriter
            .rewrite_select(
                "SELECT * FROM docs WHERE team_id IN (SELECT team_id FROM members)",
                &alice(),
            )
            .unwrap();
        assert!(sql.contains("(SELECT * FROM members WHERE false) AS members"), "{sql}");
    }

    #[test]
    fn test_unsupported_shapes_are_rejected() {
        let (_, _, rewriter) = setup();
        assert!(rewriter
            .rewrite_select("SELECT (SELECT count(*) FROM members) FROM docs", &alice())
            .is_err());
        assert!(rewriter
            .rewrite_select("WITH x AS (SELECT * FROM docs) SELECT * FROM x", &alice())
            .is_err());
        assert!(rewriter.rewrite_select("DELETE FROM docs", &alice()).is_err());
    }

    #[test]
    fn test_bypass_leaves_query_alone() {
        let (store, _, rewriter) = setup();
        store.enable_rls("docs");
        let authority = ServiceKeyAuthority::new("tests", "a-very-long-service-key").unwrap();
        let service = ClaimsContext::anonymous("service_role")
            .with_bypass(authority.authenticate("a-very-long-service-key").unwrap());

        let sql = rewriter.rewrite_select("SELECT * FROM docs", &service).unwrap();
        assert_eq!(sql, "SELECT * FROM docs");
    }
}
