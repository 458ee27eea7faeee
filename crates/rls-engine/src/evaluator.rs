//! Predicate interpreter
//!
//! Evaluates a compiled [`Expr`] against one candidate row and the caller's
//! claims using SQL three-valued logic. Only a definite `true` admits a row.
//!
//! Sub-queries read other tables through [`VisibleRows`], which is the
//! enforcement gate itself, so a joined table's own policies apply to the
//! sub-query. Security-definer helpers are the one exception: their body
//! reads through [`RowSource`] directly.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use rls_common::{Error, Result, Row};

use crate::context::ClaimsContext;
use crate::datum::{like_match, Datum};
use crate::expr::{ColumnRef, CompareOp, Expr, SubQuery};
use crate::functions::{DefinerRegistry, FunctionContext, FunctionRegistry, SecurityDefiner};

/// Raw, unfiltered access to table rows
pub trait RowSource: Send + Sync {
    /// All rows currently stored in `table`
    fn scan(&self, table: &str) -> Result<Vec<Row>>;
}

/// Rows of a table that the principal in `env` may read.
///
/// `depth` is the nesting level of the policy evaluation asking for them.
pub trait VisibleRows: Send + Sync {
    fn visible_rows(&self, table: &str, env: &EvalEnv<'_>, depth: u32) -> Result<Vec<Row>>;
}

/// Everything an evaluation needs besides the predicate and the row
#[derive(Clone, Copy)]
pub struct EvalEnv<'a> {
    pub claims: &'a ClaimsContext,
    pub source: &'a dyn RowSource,
    pub rows: &'a dyn VisibleRows,
    /// Clock reading shared by the whole operation
    pub now: DateTime<Utc>,
}

struct Binding<'s> {
    table: &'s str,
    alias: Option<&'s str>,
    row: &'s Row,
    /// Columns seen on any row of the table; a row missing one reads `NULL`
    columns: Option<&'s HashSet<&'s str>>,
}

impl Binding<'_> {
    fn answers_to(&self, qualifier: &str) -> bool {
        match self.alias {
            Some(alias) => alias == qualifier,
            None => self.table == qualifier,
        }
    }

    fn has_column(&self, name: &str) -> bool {
        self.row.contains_column(name) || self.columns.is_some_and(|c| c.contains(name))
    }

    fn value(&self, name: &str) -> Datum {
        self.row.get(name).map_or(Datum::Null, Datum::from_json)
    }
}

/// Row bindings visible to an expression, innermost query first
struct Scope<'s> {
    bindings: Vec<Binding<'s>>,
    parent: Option<&'s Scope<'s>>,
}

impl Scope<'_> {
    /// Resolve a column, innermost query first.
    ///
    /// An unqualified name moves to the enclosing query only when no table
    /// of the current one has that column.
    fn lookup(&self, column: &ColumnRef) -> Result<Datum> {
        let mut scope = Some(self);
        while let Some(current) = scope {
            match &column.qualifier {
                Some(qualifier) => {
                    if let Some(binding) = current.bindings.iter().find(|b| b.answers_to(qualifier)) {
                        if !binding.has_column(&column.name) {
                            return Err(Error::evaluation(format!("column {column} does not exist")));
                        }
                        return Ok(binding.value(&column.name));
                    }
                }
                None => {
                    let mut owners = current.bindings.iter().filter(|b| b.has_column(&column.name));
                    if let Some(owner) = owners.next() {
                        if owners.next().is_some() {
                            return Err(Error::evaluation(format!(
                                "column reference {column} is ambiguous"
                            )));
                        }
                        return Ok(owner.value(&column.name));
                    }
                }
            }
            scope = current.parent;
        }

        Err(Error::evaluation(match &column.qualifier {
            Some(q) => format!("missing FROM-clause entry for {q}"),
            None => format!("column {column} does not exist"),
        }))
    }
}

#[derive(Clone, Copy)]
struct Cx<'c> {
    env: &'c EvalEnv<'c>,
    depth: u32,
    params: &'c [Datum],
    /// Inside a security-definer body: tables are read without RLS
    elevated: bool,
}

/// Interprets policy predicates
pub struct ExpressionEvaluator {
    functions: FunctionRegistry,
    definers: Arc<DefinerRegistry>,
    max_depth: u32,
}

impl ExpressionEvaluator {
    pub fn new(definers: Arc<DefinerRegistry>, max_depth: u32) -> Self {
        Self {
            functions: FunctionRegistry::new(),
            definers,
            max_depth,
        }
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    pub fn definers(&self) -> &DefinerRegistry {
        &self.definers
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Decide whether `row` of `table` satisfies `predicate`.
    ///
    /// `NULL` results count as `false`.
    ///
    /// # Errors
    /// `PredicateEvaluationError` for non-boolean results, unknown functions
    /// or missing columns; `PolicyRecursionLimitExceeded` when nested
    /// sub-queries go deeper than the configured limit.
    pub fn evaluate(
        &self,
        predicate: &Expr,
        table: &str,
        row: &Row,
        env: &EvalEnv<'_>,
        depth: u32,
    ) -> Result<bool> {
        let scope = Scope {
            bindings: vec![Binding {
                table,
                alias: None,
                row,
                columns: None,
            }],
            parent: None,
        };
        let cx = Cx {
            env,
            depth,
            params: &[],
            elevated: false,
        };

        let result = self.eval(predicate, &scope, cx)?.as_tristate()?;
        Ok(result == Some(true))
    }

    fn tristate(&self, expr: &Expr, scope: &Scope<'_>, cx: Cx<'_>) -> Result<Option<bool>> {
        self.eval(expr, scope, cx)?.as_tristate()
    }

    fn eval(&self, expr: &Expr, scope: &Scope<'_>, cx: Cx<'_>) -> Result<Datum> {
        match expr {
            Expr::Literal(literal) => Ok(Datum::from_literal(literal)),
            Expr::Column(column) => scope.lookup(column),
            Expr::Param(n) => n
                .checked_sub(1)
                .and_then(|i| cx.params.get(i))
                .cloned()
                .ok_or_else(|| Error::evaluation(format!("there is no parameter ${n}"))),
            Expr::Function { name, args } => self.call(name, args, scope, cx),
            Expr::Compare { op, left, right } => {
                let left = self.eval(left, scope, cx)?;
                let right = self.eval(right, scope, cx)?;
                Ok(tristate_datum(compare(*op, &left, &right)?))
            }
            Expr::Arithmetic { op, left, right } => {
                let left = self.eval(left, scope, cx)?;
                let right = self.eval(right, scope, cx)?;
                left.arithmetic(*op, &right)
            }
            // Every operand is evaluated so that an error anywhere surfaces
            Expr::And(parts) => {
                let mut result = Some(true);
                for part in parts {
                    result = kleene_and(result, self.tristate(part, scope, cx)?);
                }
                Ok(tristate_datum(result))
            }
            Expr::Or(parts) => {
                let mut result = Some(false);
                for part in parts {
                    result = kleene_or(result, self.tristate(part, scope, cx)?);
                }
                Ok(tristate_datum(result))
            }
            Expr::Not(inner) => Ok(tristate_datum(self.tristate(inner, scope, cx)?.map(|b| !b))),
            Expr::IsNull { expr, negated } => {
                let is_null = self.eval(expr, scope, cx)?.is_null();
                Ok(Datum::Bool(is_null != *negated))
            }
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => {
                let value = self.eval(expr, scope, cx)?;
                let low = self.eval(low, scope, cx)?;
                let high = self.eval(high, scope, cx)?;
                let within = kleene_and(
                    compare(CompareOp::GtEq, &value, &low)?,
                    compare(CompareOp::LtEq, &value, &high)?,
                );
                Ok(tristate_datum(negate(within, *negated)))
            }
            Expr::Like {
                expr,
                pattern,
                negated,
                case_insensitive,
            } => {
                let value = self.eval(expr, scope, cx)?;
                let pattern = self.eval(pattern, scope, cx)?;
                let matched = match (value.to_text(), pattern.to_text()) {
                    (Some(text), Some(pattern)) => {
                        Some(like_match(&text, &pattern, *case_insensitive))
                    }
                    _ => None,
                };
                Ok(tristate_datum(negate(matched, *negated)))
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                let value = self.eval(expr, scope, cx)?;
                let mut candidates = Vec::with_capacity(list.len());
                for item in list {
                    flatten_into(self.eval(item, scope, cx)?, &mut candidates);
                }
                Ok(tristate_datum(negate(membership(&value, &candidates)?, *negated)))
            }
            Expr::InSubquery {
                expr,
                subquery,
                negated,
            } => {
                let value = self.eval(expr, scope, cx)?;
                let candidates = self.project(subquery, scope, cx)?;
                Ok(tristate_datum(negate(membership(&value, &candidates)?, *negated)))
            }
            Expr::Exists { subquery, negated } => {
                let exists = self.any_match(subquery, scope, cx)?;
                Ok(Datum::Bool(exists != *negated))
            }
        }
    }

    fn call(&self, name: &str, args: &[Expr], scope: &Scope<'_>, cx: Cx<'_>) -> Result<Datum> {
        let values = args
            .iter()
            .map(|arg| self.eval(arg, scope, cx))
            .collect::<Result<Vec<_>>>()?;

        if let Some(function) = self.functions.get(name) {
            let ctx = FunctionContext {
                claims: cx.env.claims,
                now: cx.env.now,
            };
            return function.evaluate(&values, &ctx);
        }

        match self.definers.get(name) {
            Some(definer) => self.call_definer(&definer, &values, cx),
            None => Err(Error::evaluation(format!("function {name}() does not exist"))),
        }
    }

    fn call_definer(&self, definer: &SecurityDefiner, args: &[Datum], cx: Cx<'_>) -> Result<Datum> {
        if args.len() != definer.params() {
            return Err(Error::evaluation(format!(
                "{}() takes {} argument(s), got {}",
                definer.name(),
                definer.params(),
                args.len()
            )));
        }

        tracing::debug!(
            target: "rls::audit",
            function = %definer.name(),
            role = %cx.env.claims.role(),
            depth = cx.depth,
            "security definer invoked"
        );

        // The body sees only its parameters, never the caller's row
        let root = Scope {
            bindings: vec![],
            parent: None,
        };
        let elevated = Cx {
            env: cx.env,
            depth: cx.depth,
            params: args,
            elevated: true,
        };

        if definer.returns_set() {
            Ok(Datum::List(self.project(definer.body(), &root, elevated)?))
        } else {
            Ok(Datum::Bool(self.any_match(definer.body(), &root, elevated)?))
        }
    }

    fn any_match(&self, subquery: &SubQuery, scope: &Scope<'_>, cx: Cx<'_>) -> Result<bool> {
        let mut found = false;
        self.for_each_match(subquery, scope, cx, |_, _| {
            found = true;
            Ok(())
        })?;
        Ok(found)
    }

    fn project(&self, subquery: &SubQuery, scope: &Scope<'_>, cx: Cx<'_>) -> Result<Vec<Datum>> {
        let Some(projection) = &subquery.projection else {
            return Err(Error::evaluation(
                "sub-query used as a set must select exactly one column".to_string(),
            ));
        };

        let mut values = Vec::new();
        self.for_each_match(subquery, scope, cx, |inner, cx| {
            flatten_into(self.eval(projection, inner, cx)?, &mut values);
            Ok(())
        })?;
        Ok(values)
    }

    /// Run `visit` for every combination of `FROM` rows passing the filter
    fn for_each_match<F>(
        &self,
        subquery: &SubQuery,
        scope: &Scope<'_>,
        cx: Cx<'_>,
        mut visit: F,
    ) -> Result<()>
    where
        F: FnMut(&Scope<'_>, Cx<'_>) -> Result<()>,
    {
        let depth = cx.depth + 1;
        if depth > self.max_depth {
            tracing::warn!(max_depth = self.max_depth, "policy recursion limit reached");
            return Err(Error::PolicyRecursionLimitExceeded {
                max_depth: self.max_depth,
            });
        }
        let cx = Cx { depth, ..cx };

        let mut tables = Vec::with_capacity(subquery.from.len());
        for table in &subquery.from {
            let rows = if cx.elevated {
                cx.env.source.scan(&table.table)?
            } else {
                cx.env.rows.visible_rows(&table.table, cx.env, depth)?
            };
            if rows.is_empty() {
                return Ok(());
            }
            tables.push(rows);
        }
        let shapes: Vec<HashSet<&str>> = tables
            .iter()
            .map(|rows| rows.iter().flat_map(Row::columns).collect())
            .collect();

        // Odometer over the cross product of the FROM tables
        let mut cursor = vec![0usize; tables.len()];
        loop {
            let inner = Scope {
                bindings: subquery
                    .from
                    .iter()
                    .zip(tables.iter().zip(&shapes))
                    .zip(&cursor)
                    .map(|((table, (rows, shape)), &i)| Binding {
                        table: &table.table,
                        alias: table.alias.as_deref(),
                        row: &rows[i],
                        columns: Some(shape),
                    })
                    .collect(),
                parent: Some(scope),
            };

            let keep = match &subquery.filter {
                Some(filter) => self.tristate(filter, &inner, cx)? == Some(true),
                None => true,
            };
            if keep {
                visit(&inner, cx)?;
            }

            let mut position = cursor.len();
            loop {
                if position == 0 {
                    return Ok(());
                }
                position -= 1;
                cursor[position] += 1;
                if cursor[position] < tables[position].len() {
                    break;
                }
                cursor[position] = 0;
            }
        }
    }
}

fn tristate_datum(value: Option<bool>) -> Datum {
    value.map_or(Datum::Null, Datum::Bool)
}

fn negate(value: Option<bool>, negated: bool) -> Option<bool> {
    value.map(|b| b != negated)
}

fn kleene_and(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (Some(false), _) | (_, Some(false)) => Some(false),
        (Some(true), Some(true)) => Some(true),
        _ => None,
    }
}

fn kleene_or(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (Some(true), _) | (_, Some(true)) => Some(true),
        (Some(false), Some(false)) => Some(false),
        _ => None,
    }
}

fn compare(op: CompareOp, left: &Datum, right: &Datum) -> Result<Option<bool>> {
    Ok(left.compare(right)?.map(|ordering| match op {
        CompareOp::Eq => ordering.is_eq(),
        CompareOp::NotEq => ordering.is_ne(),
        CompareOp::Lt => ordering.is_lt(),
        CompareOp::LtEq => ordering.is_le(),
        CompareOp::Gt => ordering.is_gt(),
        CompareOp::GtEq => ordering.is_ge(),
    }))
}

fn flatten_into(value: Datum, out: &mut Vec<Datum>) {
    match value {
        Datum::List(items) => out.extend(items),
        other => out.push(other),
    }
}

/// SQL `IN`: true on a match, unknown if any comparison was unknown
fn membership(value: &Datum, candidates: &[Datum]) -> Result<Option<bool>> {
    if value.is_null() {
        return Ok(None);
    }
    let mut result = Some(false);
    for candidate in candidates {
        result = kleene_or(result, value.sql_eq(candidate)?);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use rstest::rstest;
    use serde_json::json;

    use crate::parser::parse_predicate;

    /// Rows with no RLS at all
    struct Tables(HashMap<String, Vec<Row>>);

    impl Tables {
        fn new(tables: &[(&str, serde_json::Value)]) -> Self {
            Self(
                tables
                    .iter()
                    .map(|(name, rows)| {
                        let rows = rows
                            .as_array()
                            .unwrap()
                            .iter()
                            .map(|r| Row::from_value(r.clone()).unwrap())
                            .collect();
                        ((*name).to_string(), rows)
                    })
                    .collect(),
            )
        }
    }

    impl RowSource for Tables {
        fn scan(&self, table: &str) -> Result<Vec<Row>> {
            Ok(self.0.get(table).cloned().unwrap_or_default())
        }
    }

    impl VisibleRows for Tables {
        fn visible_rows(&self, table: &str, _env: &EvalEnv<'_>, _depth: u32) -> Result<Vec<Row>> {
            self.scan(table)
        }
    }

    /// Hides every row, to tell elevated reads apart from gated ones
    struct NothingVisible;

    impl VisibleRows for NothingVisible {
        fn visible_rows(&self, _table: &str, _env: &EvalEnv<'_>, _depth: u32) -> Result<Vec<Row>> {
            Ok(vec![])
        }
    }

    fn members() -> Tables {
        Tables::new(&[(
            "team_members",
            json!([
                {"team_id": 1, "user_id": "alice"},
                {"team_id": 2, "user_id": "bob"}
            ]),
        )])
    }

    fn check_with(
        evaluator: &ExpressionEvaluator,
        tables: &Tables,
        rows: &dyn VisibleRows,
        predicate: &str,
        row: serde_json::Value,
        claims: &ClaimsContext,
    ) -> Result<bool> {
        let env = EvalEnv {
            claims,
            source: tables,
            rows,
            now: Utc::now(),
        };
        let predicate = parse_predicate(predicate).unwrap();
        evaluator.evaluate(&predicate, "docs", &Row::from_value(row).unwrap(), &env, 0)
    }

    fn check(predicate: &str, row: serde_json::Value, claims: &ClaimsContext) -> Result<bool> {
        let tables = members();
        let evaluator = ExpressionEvaluator::new(Arc::new(DefinerRegistry::new()), 16);
        check_with(&evaluator, &tables, &tables, predicate, row, claims)
    }

    #[rstest]
    #[case("owner = auth.uid()", json!({"owner": "alice"}), true)]
    #[case("owner = auth.uid()", json!({"owner": "bob"}), false)]
    #[case("owner = auth.uid()", json!({"owner": null}), false)]
    #[case("not (owner = auth.uid())", json!({"owner": null}), false)]
    #[case("owner = auth.uid() or is_public", json!({"owner": "bob", "is_public": true}), true)]
    #[case("docs.owner = 'alice' and archived is null", json!({"owner": "alice", "archived": null}), true)]
    #[case("lower(title) like '%draft%'", json!({"title": "My DRAFT"}), true)]
    #[case("level between 1 and 3", json!({"level": 4}), false)]
    #[case("status in ('open', 'pending')", json!({"status": "open"}), true)]
    #[case("status not in ('open', null)", json!({"status": "closed"}), false)]
    fn test_evaluate_predicates(
        #[case] predicate: &str,
        #[case] row: serde_json::Value,
        #[case] expected: bool,
    ) {
        let claims = ClaimsContext::authenticated("alice", "authenticated");
        assert_eq!(check(predicate, row, &claims).unwrap(), expected);
    }

    #[test]
    fn test_anonymous_never_matches_owner_check() {
        let anon = ClaimsContext::anonymous("anon");
        assert!(!check("owner = auth.uid()", json!({"owner": "alice"}), &anon).unwrap());
    }

    #[test]
    fn test_missing_column_is_an_error() {
        let claims = ClaimsContext::authenticated("alice", "authenticated");
        let err = check("owner_id = auth.uid()", json!({"owner": "alice"}), &claims).unwrap_err();
        assert!(matches!(err, Error::PredicateEvaluationError(_)));
    }

    #[test]
    fn test_undefined_function_is_an_error() {
        let claims = ClaimsContext::authenticated("alice", "authenticated");
        let err = check("owner = pg_sleep(1)", json!({"owner": "alice"}), &claims).unwrap_err();
        assert!(matches!(err, Error::PredicateEvaluationError(_)));
    }

    #[test]
    fn test_error_not_masked_by_or() {
        let claims = ClaimsContext::authenticated("alice", "authenticated");
        let result = check("true or nope = 1", json!({"owner": "alice"}), &claims);
        assert!(result.is_err());
    }

    #[test]
    fn test_non_boolean_result_is_an_error() {
        let claims = ClaimsContext::authenticated("alice", "authenticated");
        assert!(check("owner", json!({"owner": "alice"}), &claims).is_err());
    }

    #[test]
    fn test_membership_subquery() {
        let claims = ClaimsContext::authenticated("alice", "authenticated");
        let predicate = "team_id in (select team_id from team_members where user_id = auth.uid())";

        assert!(check(predicate, json!({"team_id": 1}), &claims).unwrap());
        assert!(!check(predicate, json!({"team_id": 2}), &claims).unwrap());
    }

    #[test]
    fn test_exists_correlates_with_outer_row() {
        let claims = ClaimsContext::authenticated("alice", "authenticated");
        let predicate = "exists (select 1 from team_members m \
                         where m.team_id = docs.team_id and m.user_id = auth.uid())";

        assert!(check(predicate, json!({"team_id": 1}), &claims).unwrap());
        assert!(!check(predicate, json!({"team_id": 2}), &claims).unwrap());
    }

    #[test]
    fn test_unqualified_column_stays_in_sub_query_table() {
        let tables = Tables::new(&[(
            "collaborators",
            json!([
                {"doc_id": 1, "user_id": "bob"},
                {"doc_id": 2, "user_id": "carol", "owner": "carol"}
            ]),
        )]);
        let evaluator = ExpressionEvaluator::new(Arc::new(DefinerRegistry::new()), 16);
        let claims = ClaimsContext::authenticated("alice", "authenticated");

        // `id` exists on no collaborators row, so it correlates with docs
        let correlated = "exists (select 1 from collaborators where doc_id = id)";
        assert!(check_with(&evaluator, &tables, &tables, correlated, json!({"id": 1, "owner": "alice"}), &claims)
            .unwrap());

        // `owner` is a collaborators column, NULL on the first row
        let shadowed = "exists (select 1 from collaborators where doc_id = id and owner = 'alice')";
        assert!(!check_with(&evaluator, &tables, &tables, shadowed, json!({"id": 1, "owner": "alice"}), &claims)
            .unwrap());

        let qualified =
            "exists (select 1 from collaborators where doc_id = id and docs.owner = 'alice')";
        assert!(check_with(&evaluator, &tables, &tables, qualified, json!({"id": 1, "owner": "alice"}), &claims)
            .unwrap());
    }

    #[test]
    fn test_time_window() {
        let claims = ClaimsContext::authenticated("alice", "authenticated");
        let recent = (Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
        let stale = (Utc::now() - chrono::Duration::days(2)).to_rfc3339();
        let predicate = "created_at > now() - interval '1 day'";

        assert!(check(predicate, json!({"created_at": recent}), &claims).unwrap());
        assert!(!check(predicate, json!({"created_at": stale}), &claims).unwrap());
    }

    #[test]
    fn test_recursion_limit() {
        let tables = members();
        let evaluator = ExpressionEvaluator::new(Arc::new(DefinerRegistry::new()), 0);
        let claims = ClaimsContext::authenticated("alice", "authenticated");

        let err = check_with(
            &evaluator,
            &tables,
            &tables,
            "exists (select 1 from team_members)",
            json!({}),
            &claims,
        )
        .unwrap_err();
        assert!(matches!(err, Error::PolicyRecursionLimitExceeded { max_depth: 0 }));
    }

    #[test]
    fn test_definer_reads_past_rls() {
        let tables = members();
        let definers = Arc::new(DefinerRegistry::new());
        definers
            .register(
                SecurityDefiner::new(
                    "private.user_teams",
                    1,
                    "select team_id from team_members where user_id = $1",
                )
                .unwrap(),
            )
            .unwrap();
        let evaluator = ExpressionEvaluator::new(definers, 16);
        let claims = ClaimsContext::authenticated("alice", "authenticated");

        // A plain sub-query sees nothing through the gate
        let gated = "team_id in (select team_id from team_members where user_id = auth.uid())";
        assert!(!check_with(&evaluator, &tables, &NothingVisible, gated, json!({"team_id": 1}), &claims)
            .unwrap());

        // The helper body is elevated
        let elevated = "team_id in (private.user_teams(auth.uid()))";
        assert!(check_with(&evaluator, &tables, &NothingVisible, elevated, json!({"team_id": 1}), &claims)
            .unwrap());
        assert!(!check_with(&evaluator, &tables, &NothingVisible, elevated, json!({"team_id": 2}), &claims)
            .unwrap());

        let wrong_arity = "team_id in (private.user_teams())";
        assert!(check_with(&evaluator, &tables, &NothingVisible, wrong_arity, json!({"team_id": 1}), &claims)
            .is_err());
    }

    proptest::proptest! {
        #[test]
        fn prop_predicate_and_negation_never_both_admit(
            a in proptest::option::of(proptest::prelude::any::<i32>()),
            b in proptest::option::of(proptest::prelude::any::<i32>()),
        ) {
            let claims = ClaimsContext::anonymous("anon");
            let row = json!({"a": a, "b": b});

            let holds = check("a < b", row.clone(), &claims).unwrap();
            let negated = check("not (a < b)", row, &claims).unwrap();

            proptest::prop_assert!(!(holds && negated));
            if a.is_none() || b.is_none() {
                proptest::prop_assert!(!holds && !negated);
            } else {
                proptest::prop_assert!(holds != negated);
            }
        }
    }
}
