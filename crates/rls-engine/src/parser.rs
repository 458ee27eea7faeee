//! Compiles policy expression text into the predicate tree
//!
//! Expressions are parsed with `sqlparser`'s PostgreSQL dialect, then
//! lowered into [`Expr`]. Anything outside the supported subset is rejected
//! here, when the policy is registered, rather than at evaluation time.

use chrono::Duration;
use sqlparser::ast::{
    BinaryOperator, Expr as SqlExpr, FunctionArg, FunctionArgExpr, Ident, JoinConstraint,
    JoinOperator, Query, SelectItem, SetExpr, TableFactor, UnaryOperator, Value,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;

use rls_common::{Error, Result};

use crate::expr::{ArithmeticOp, ColumnRef, CompareOp, Expr, Literal, SubQuery, TableRef};

/// Parse a policy predicate such as `auth.uid() = user_id`
///
/// # Errors
/// Returns `InvalidPolicy` for syntax errors or unsupported constructs.
pub fn parse_predicate(source: &str) -> Result<Expr> {
    let dialect = PostgreSqlDialect {};
    let mut parser = Parser::new(&dialect)
        .try_with_sql(source)
        .map_err(|e| invalid(source, &e.to_string()))?;

    let parsed = parser
        .parse_expr()
        .map_err(|e| invalid(source, &e.to_string()))?;

    if parser.peek_token().token != Token::EOF {
        return Err(invalid(source, "unexpected trailing input"));
    }

    convert(&parsed).map_err(|e| match e {
        Error::InvalidPolicy(message) => invalid(source, &message),
        other => other,
    })
}

fn invalid(source: &str, message: &str) -> Error {
    Error::InvalidPolicy(format!("cannot compile `{source}`: {message}"))
}

fn unsupported(what: impl std::fmt::Display) -> Error {
    Error::InvalidPolicy(format!("unsupported expression: {what}"))
}

fn boxed(expr: &SqlExpr) -> Result<Box<Expr>> {
    convert(expr).map(Box::new)
}

/// Lower a `sqlparser` expression into the predicate tree
pub(crate) fn convert(expr: &SqlExpr) -> Result<Expr> {
    match expr {
        SqlExpr::Identifier(ident) => Ok(convert_identifier(ident)),
        SqlExpr::CompoundIdentifier(parts) => match parts.as_slice() {
            [] => Err(unsupported("empty identifier")),
            [single] => Ok(convert_identifier(single)),
            [.., qualifier, name] => Ok(Expr::Column(ColumnRef::qualified(
                &qualifier.value,
                &name.value,
            ))),
        },
        SqlExpr::Value(value) => convert_value(value),
        SqlExpr::Nested(inner) => convert(inner),
        SqlExpr::UnaryOp { op, expr } => match op {
            UnaryOperator::Not => Ok(Expr::Not(boxed(expr)?)),
            UnaryOperator::Plus => convert(expr),
            UnaryOperator::Minus => match convert(expr)? {
                Expr::Literal(Literal::Int(i)) => Ok(Expr::Literal(Literal::Int(-i))),
                Expr::Literal(Literal::Float(x)) => Ok(Expr::Literal(Literal::Float(-x))),
                other => Ok(Expr::Arithmetic {
                    op: ArithmeticOp::Minus,
                    left: Box::new(Expr::Literal(Literal::Int(0))),
                    right: Box::new(other),
                }),
            },
            other => Err(unsupported(format!("unary operator {other}"))),
        },
        SqlExpr::BinaryOp { left, op, right } => convert_binary(left, op, right),
        SqlExpr::IsNull(inner) => Ok(Expr::IsNull {
            expr: boxed(inner)?,
            negated: false,
        }),
        SqlExpr::IsNotNull(inner) => Ok(Expr::IsNull {
            expr: boxed(inner)?,
            negated: true,
        }),
        SqlExpr::Between {
            expr,
            negated,
            low,
            high,
        } => Ok(Expr::Between {
            expr: boxed(expr)?,
            low: boxed(low)?,
            high: boxed(high)?,
            negated: *negated,
        }),
        SqlExpr::Like {
            negated,
            expr,
            pattern,
            ..
        } => Ok(Expr::Like {
            expr: boxed(expr)?,
            pattern: boxed(pattern)?,
            negated: *negated,
            case_insensitive: false,
        }),
        SqlExpr::ILike {
            negated,
            expr,
            pattern,
            ..
        } => Ok(Expr::Like {
            expr: boxed(expr)?,
            pattern: boxed(pattern)?,
            negated: *negated,
            case_insensitive: true,
        }),
        SqlExpr::InList {
            expr,
            list,
            negated,
        } => Ok(Expr::InList {
            expr: boxed(expr)?,
            list: list.iter().map(convert).collect::<Result<_>>()?,
            negated: *negated,
        }),
        SqlExpr::InSubquery {
            expr,
            subquery,
            negated,
        } => {
            let subquery = convert_query(subquery)?;
            if subquery.projection.is_none() {
                return Err(unsupported("IN sub-query must select exactly one column"));
            }
            Ok(Expr::InSubquery {
                expr: boxed(expr)?,
                subquery: Box::new(subquery),
                negated: *negated,
            })
        }
        SqlExpr::Exists { subquery, negated } => Ok(Expr::Exists {
            subquery: Box::new(convert_query(subquery)?),
            negated: *negated,
        }),
        SqlExpr::Function(function) => {
            let name = object_name(&function.name.0);
            let args = function
                .args
                .iter()
                .map(|arg| match arg {
                    FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => convert(e),
                    other => Err(unsupported(format!("function argument {other}"))),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Expr::Function { name, args })
        }
        SqlExpr::Interval(interval) => {
            let unit = interval.leading_field.as_ref().map(ToString::to_string);
            let text = match interval.value.as_ref() {
                SqlExpr::Value(Value::SingleQuotedString(s)) => s.clone(),
                SqlExpr::Value(Value::Number(n, _)) => n.clone(),
                other => return Err(unsupported(format!("interval value {other}"))),
            };
            let text = match unit {
                Some(unit) => format!("{text} {unit}"),
                None => text,
            };
            parse_interval(&text).map(|d| Expr::Literal(Literal::Interval(d)))
        }
        other => Err(unsupported(other)),
    }
}

fn convert_identifier(ident: &Ident) -> Expr {
    let lowered = ident.value.to_ascii_lowercase();
    if ident.quote_style.is_none() && (lowered == "current_user" || lowered == "current_role") {
        return Expr::Function {
            name: "auth.role".to_string(),
            args: vec![],
        };
    }
    Expr::Column(ColumnRef::new(&ident.value))
}

fn object_name(parts: &[Ident]) -> String {
    let name = parts
        .iter()
        .map(|p| p.value.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join(".");
    match name.as_str() {
        "current_user" | "current_role" | "session_user" => "auth.role".to_string(),
        _ => name,
    }
}

fn convert_value(value: &Value) -> Result<Expr> {
    let literal = match value {
        Value::Null => Literal::Null,
        Value::Boolean(b) => Literal::Bool(*b),
        Value::SingleQuotedString(s) => Literal::Text(s.clone()),
        Value::Number(n, _) => {
            if let Ok(i) = n.parse::<i64>() {
                Literal::Int(i)
            } else {
                n.parse::<f64>()
                    .map(Literal::Float)
                    .map_err(|_| unsupported(format!("number {n}")))?
            }
        }
        Value::Placeholder(p) => {
            let index = p
                .strip_prefix('$')
                .and_then(|n| n.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .ok_or_else(|| unsupported(format!("placeholder {p}")))?;
            return Ok(Expr::Param(index));
        }
        other => return Err(unsupported(format!("literal {other}"))),
    };
    Ok(Expr::Literal(literal))
}

fn convert_binary(left: &SqlExpr, op: &BinaryOperator, right: &SqlExpr) -> Result<Expr> {
    let compare = |op: CompareOp| -> Result<Expr> {
        Ok(Expr::compare(op, convert(left)?, convert(right)?))
    };
    let arithmetic = |op: ArithmeticOp| -> Result<Expr> {
        Ok(Expr::Arithmetic {
            op,
            left: boxed(left)?,
            right: boxed(right)?,
        })
    };

    match op {
        BinaryOperator::And => Ok(Expr::and(vec![convert(left)?, convert(right)?])),
        BinaryOperator::Or => Ok(Expr::or(vec![convert(left)?, convert(right)?])),
        BinaryOperator::Eq => compare(CompareOp::Eq),
        BinaryOperator::NotEq => compare(CompareOp::NotEq),
        BinaryOperator::Lt => compare(CompareOp::Lt),
        BinaryOperator::LtEq => compare(CompareOp::LtEq),
        BinaryOperator::Gt => compare(CompareOp::Gt),
        BinaryOperator::GtEq => compare(CompareOp::GtEq),
        BinaryOperator::Plus => arithmetic(ArithmeticOp::Plus),
        BinaryOperator::Minus => arithmetic(ArithmeticOp::Minus),
        BinaryOperator::Multiply => arithmetic(ArithmeticOp::Multiply),
        BinaryOperator::Divide => arithmetic(ArithmeticOp::Divide),
        BinaryOperator::StringConcat => arithmetic(ArithmeticOp::Concat),
        other => Err(unsupported(format!("operator {other}"))),
    }
}

fn convert_table_factor(factor: &TableFactor) -> Result<TableRef> {
    match factor {
        TableFactor::Table { name, alias, .. } => {
            let table = name
                .0
                .last()
                .map(|ident| ident.value.clone())
                .ok_or_else(|| unsupported("empty table name"))?;
            Ok(TableRef {
                table,
                alias: alias.as_ref().map(|a| a.name.value.clone()),
            })
        }
        other => Err(unsupported(format!("table source {other}"))),
    }
}

/// Lower a sub-query into the predicate tree's auxiliary query form
pub(crate) fn convert_query(query: &Query) -> Result<SubQuery> {
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Err(unsupported(format!("sub-query {query}")));
    };

    let projection = match select.projection.as_slice() {
        [SelectItem::UnnamedExpr(e)] | [SelectItem::ExprWithAlias { expr: e, .. }] => {
            Some(convert(e)?)
        }
        _ => None,
    };

    let mut from = Vec::new();
    let mut conditions = Vec::new();
    for source in &select.from {
        from.push(convert_table_factor(&source.relation)?);
        for join in &source.joins {
            from.push(convert_table_factor(&join.relation)?);
            match &join.join_operator {
                JoinOperator::Inner(JoinConstraint::On(on)) => conditions.push(convert(on)?),
                JoinOperator::Inner(JoinConstraint::None) | JoinOperator::CrossJoin => {}
                _ => return Err(unsupported("only inner joins are supported in policies")),
            }
        }
    }

    if let Some(selection) = &select.selection {
        conditions.push(convert(selection)?);
    }

    Ok(SubQuery {
        projection,
        from,
        filter: if conditions.is_empty() {
            None
        } else {
            Some(Expr::and(conditions))
        },
    })
}

/// Parse interval text such as `1 day`, `25 hours` or `1 day 2 hours`
///
/// # Errors
/// Returns `InvalidPolicy` for unknown units or malformed amounts.
pub fn parse_interval(text: &str) -> Result<Duration> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.is_empty() || tokens.len() % 2 != 0 {
        return Err(unsupported(format!("interval '{text}'")));
    }

    let mut total = Duration::zero();
    for pair in tokens.chunks(2) {
        let amount: i64 = pair[0]
            .parse()
            .map_err(|_| unsupported(format!("interval amount '{}'", pair[0])))?;
        let unit = pair[1].to_ascii_lowercase();
        let part = match unit.trim_end_matches('s') {
            "second" | "sec" => Duration::try_seconds(amount),
            "minute" | "min" => Duration::try_minutes(amount),
            "hour" => Duration::try_hours(amount),
            "day" => Duration::try_days(amount),
            "week" => Duration::try_weeks(amount),
            "month" | "mon" => amount.checked_mul(30).and_then(Duration::try_days),
            "year" => amount.checked_mul(365).and_then(Duration::try_days),
            _ => return Err(unsupported(format!("interval unit '{unit}'"))),
        };
        total = part
            .and_then(|part| total.checked_add(&part))
            .ok_or_else(|| unsupported(format!("interval '{text}' out of range")))?;
    }
    Ok(total)
}
