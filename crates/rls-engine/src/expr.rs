//! Predicate expression tree
//!
//! Policies are compiled once into this tree (see [`crate::parser`]) and
//! interpreted per row by [`crate::evaluator::ExpressionEvaluator`]. Claims
//! are never substituted into the tree itself, so a compiled predicate is
//! shared across every principal holding the same role.

use std::fmt;

use chrono::Duration;

use rls_common::Result;

/// Literal value appearing in a predicate
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Interval(Duration),
}

/// Reference to a column, optionally qualified by table name or alias
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub qualifier: Option<String>,
    pub name: String,
}

impl ColumnRef {
    pub fn new(name: &str) -> Self {
        Self {
            qualifier: None,
            name: name.to_string(),
        }
    }

    pub fn qualified(qualifier: &str, name: &str) -> Self {
        Self {
            qualifier: Some(qualifier.to_string()),
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticOp {
    Plus,
    Minus,
    Multiply,
    Divide,
    Concat,
}

/// A table in a sub-query `FROM` list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub table: String,
    pub alias: Option<String>,
}

/// Auxiliary query used by `EXISTS (...)` and `x IN (...)`.
///
/// Multiple `from` entries form an inner join; join conditions are folded
/// into `filter`.
#[derive(Debug, Clone, PartialEq)]
pub struct SubQuery {
    pub projection: Option<Expr>,
    pub from: Vec<TableRef>,
    pub filter: Option<Expr>,
}

/// Boolean predicate over a row and the claims context
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    Column(ColumnRef),
    /// Positional parameter (`$1`), bound only inside security-definer helpers
    Param(usize),
    Function {
        name: String,
        args: Vec<Expr>,
    },
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Arithmetic {
        op: ArithmeticOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        negated: bool,
        case_insensitive: bool,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    InSubquery {
        expr: Box<Expr>,
        subquery: Box<SubQuery>,
        negated: bool,
    },
    Exists {
        subquery: Box<SubQuery>,
        negated: bool,
    },
}

impl Expr {
    pub const TRUE: Expr = Expr::Literal(Literal::Bool(true));
    pub const FALSE: Expr = Expr::Literal(Literal::Bool(false));

    pub fn column(name: &str) -> Self {
        Expr::Column(ColumnRef::new(name))
    }

    pub fn text(value: &str) -> Self {
        Expr::Literal(Literal::Text(value.to_string()))
    }

    pub fn compare(op: CompareOp, left: Expr, right: Expr) -> Self {
        Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Conjunction, flattening nested `AND`s
    pub fn and(parts: Vec<Expr>) -> Self {
        Self::connective(parts, true)
    }

    /// Disjunction, flattening nested `OR`s
    pub fn or(parts: Vec<Expr>) -> Self {
        Self::connective(parts, false)
    }

    fn connective(parts: Vec<Expr>, conjunction: bool) -> Self {
        let mut flat = Vec::with_capacity(parts.len());
        for part in parts {
            match (part, conjunction) {
                (Expr::And(inner), true) | (Expr::Or(inner), false) => flat.extend(inner),
                (other, _) => flat.push(other),
            }
        }
        match (flat.len(), conjunction) {
            (0, true) => Expr::TRUE,
            (0, false) => Expr::FALSE,
            (1, _) => flat.pop().unwrap_or(Expr::FALSE),
            (_, true) => Expr::And(flat),
            (_, false) => Expr::Or(flat),
        }
    }

    /// Rebuild the tree, letting `f` replace any node.
    ///
    /// `f` sees nodes outermost first; when it returns a replacement the
    /// node's children are not visited.
    ///
    /// # Errors
    /// Propagates the first error returned by `f`.
    pub fn transform<F>(&self, f: &mut F) -> Result<Expr>
    where
        F: FnMut(&Expr) -> Result<Option<Expr>>,
    {
        if let Some(replaced) = f(self)? {
            return Ok(replaced);
        }

        Ok(match self {
            Expr::Literal(_) | Expr::Column(_) | Expr::Param(_) => self.clone(),
            Expr::Function { name, args } => Expr::Function {
                name: name.clone(),
                args: args
                    .iter()
                    .map(|a| a.transform(f))
                    .collect::<Result<_>>()?,
            },
            Expr::Compare { op, left, right } => Expr::Compare {
                op: *op,
                left: Box::new(left.transform(f)?),
                right: Box::new(right.transform(f)?),
            },
            Expr::Arithmetic { op, left, right } => Expr::Arithmetic {
                op: *op,
                left: Box::new(left.transform(f)?),
                right: Box::new(right.transform(f)?),
            },
            Expr::And(parts) => Expr::And(
                parts
                    .iter()
                    .map(|p| p.transform(f))
                    .collect::<Result<_>>()?,
            ),
            Expr::Or(parts) => Expr::Or(
                parts
                    .iter()
                    .map(|p| p.transform(f))
                    .collect::<Result<_>>()?,
            ),
            Expr::Not(expr) => Expr::Not(Box::new(expr.transform(f)?)),
            Expr::IsNull { expr, negated } => Expr::IsNull {
                expr: Box::new(expr.transform(f)?),
                negated: *negated,
            },
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => Expr::Between {
                expr: Box::new(expr.transform(f)?),
                low: Box::new(low.transform(f)?),
                high: Box::new(high.transform(f)?),
                negated: *negated,
            },
            Expr::Like {
                expr,
                pattern,
                negated,
                case_insensitive,
            } => Expr::Like {
                expr: Box::new(expr.transform(f)?),
                pattern: Box::new(pattern.transform(f)?),
                negated: *negated,
                case_insensitive: *case_insensitive,
            },
            Expr::InList {
                expr,
                list,
                negated,
            } => Expr::InList {
                expr: Box::new(expr.transform(f)?),
                list: list
                    .iter()
                    .map(|e| e.transform(f))
                    .collect::<Result<_>>()?,
                negated: *negated,
            },
            Expr::InSubquery {
                expr,
                subquery,
                negated,
            } => Expr::InSubquery {
                expr: Box::new(expr.transform(f)?),
                subquery: Box::new(subquery.transform(f)?),
                negated: *negated,
            },
            Expr::Exists { subquery, negated } => Expr::Exists {
                subquery: Box::new(subquery.transform(f)?),
                negated: *negated,
            },
        })
    }
}

impl SubQuery {
    /// Apply [`Expr::transform`] to the projection and filter
    ///
    /// # Errors
    /// Propagates the first error returned by `f`.
    pub fn transform<F>(&self, f: &mut F) -> Result<SubQuery>
    where
        F: FnMut(&Expr) -> Result<Option<Expr>>,
    {
        Ok(SubQuery {
            projection: self.projection.as_ref().map(|p| p.transform(f)).transpose()?,
            from: self.from.clone(),
            filter: self.filter.as_ref().map(|p| p.transform(f)).transpose()?,
        })
    }

}

// ============================================================================
// SQL rendering
// ============================================================================

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Null => f.write_str("NULL"),
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::Int(i) => write!(f, "{i}"),
            Literal::Float(x) => write!(f, "{x}"),
            Literal::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Literal::Interval(d) => write!(f, "INTERVAL '{} seconds'", d.num_seconds()),
        }
    }
}

/// Keywords PostgreSQL refuses as bare column or table names
const RESERVED: &[&str] = &[
    "all", "analyse", "analyze", "and", "any", "array", "as", "asc", "asymmetric", "both",
    "case", "cast", "check", "collate", "column", "constraint", "create", "current_catalog",
    "current_date", "current_role", "current_time", "current_timestamp", "current_user",
    "default", "deferrable", "desc", "distinct", "do", "else", "end", "except", "false",
    "fetch", "for", "foreign", "from", "grant", "group", "having", "in", "initially",
    "intersect", "into", "lateral", "leading", "limit", "localtime", "localtimestamp", "not",
    "null", "offset", "on", "only", "or", "order", "placing", "primary", "references",
    "returning", "select", "session_user", "some", "symmetric", "table", "then", "to",
    "trailing", "true", "union", "unique", "user", "using", "variadic", "when", "where",
    "window", "with",
];

/// Write an identifier so it reads back as exactly `name`
fn write_ident(f: &mut fmt::Formatter<'_>, name: &str) -> fmt::Result {
    let bare = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !RESERVED.contains(&name);
    if bare {
        f.write_str(name)
    } else {
        write!(f, "\"{}\"", name.replace('"', "\"\""))
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(qualifier) = &self.qualifier {
            write_ident(f, qualifier)?;
            f.write_str(".")?;
        }
        write_ident(f, &self.name)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_ident(f, &self.table)?;
        if let Some(alias) = &self.alias {
            f.write_str(" AS ")?;
            write_ident(f, alias)?;
        }
        Ok(())
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "<>",
            CompareOp::Lt => "<",
            CompareOp::LtEq => "<=",
            CompareOp::Gt => ">",
            CompareOp::GtEq => ">=",
        })
    }
}

impl fmt::Display for ArithmeticOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArithmeticOp::Plus => "+",
            ArithmeticOp::Minus => "-",
            ArithmeticOp::Multiply => "*",
            ArithmeticOp::Divide => "/",
            ArithmeticOp::Concat => "||",
        })
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, parts: &[Expr], sep: &str) -> fmt::Result {
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{part}")?;
    }
    Ok(())
}

fn not_kw(negated: bool) -> &'static str {
    if negated {
        "NOT "
    } else {
        ""
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(lit) => write!(f, "{lit}"),
            Expr::Column(col) => write!(f, "{col}"),
            Expr::Param(n) => write!(f, "${n}"),
            Expr::Function { name, args } => {
                write!(f, "{name}(")?;
                write_joined(f, args, ", ")?;
                f.write_str(")")
            }
            Expr::Compare { op, left, right } => write!(f, "({left} {op} {right})"),
            Expr::Arithmetic { op, left, right } => write!(f, "({left} {op} {right})"),
            Expr::And(parts) => {
                f.write_str("(")?;
                write_joined(f, parts, " AND ")?;
                f.write_str(")")
            }
            Expr::Or(parts) => {
                f.write_str("(")?;
                write_joined(f, parts, " OR ")?;
                f.write_str(")")
            }
            Expr::Not(expr) => write!(f, "(NOT {expr})"),
            Expr::IsNull { expr, negated } => write!(f, "({expr} IS {}NULL)", not_kw(*negated)),
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => write!(f, "({expr} {}BETWEEN {low} AND {high})", not_kw(*negated)),
            Expr::Like {
                expr,
                pattern,
                negated,
                case_insensitive,
            } => {
                let kw = if *case_insensitive { "ILIKE" } else { "LIKE" };
                write!(f, "({expr} {}{kw} {pattern})", not_kw(*negated))
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                write!(f, "({expr} {}IN (", not_kw(*negated))?;
                write_joined(f, list, ", ")?;
                f.write_str("))")
            }
            Expr::InSubquery {
                expr,
                subquery,
                negated,
            } => write!(f, "({expr} {}IN ({subquery}))", not_kw(*negated)),
            Expr::Exists { subquery, negated } => {
                write!(f, "({}EXISTS ({subquery}))", not_kw(*negated))
            }
        }
    }
}

impl fmt::Display for SubQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.projection {
            Some(projection) => write!(f, "SELECT {projection}")?,
            None => f.write_str("SELECT 1")?,
        }
        for (i, table) in self.from.iter().enumerate() {
            f.write_str(if i == 0 { " FROM " } else { ", " })?;
            write!(f, "{table}")?;
        }
        if let Some(filter) = &self.filter {
            write!(f, " WHERE {filter}")?;
        }
        Ok(())
    }
}
