//! Functions callable from policy predicates
//!
//! Two kinds exist:
//! - built-in scalar functions, a fixed allow-list (`auth.*`, `now()`, string helpers)
//! - security-definer helpers, registered by an administrator, which run one
//!   specific sub-query with RLS lifted for that sub-query only

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use rls_common::{Error, Result};

use crate::context::ClaimsContext;
use crate::datum::Datum;
use crate::expr::SubQuery;
use crate::parser::convert_query;

/// Inputs available to built-in functions
pub struct FunctionContext<'a> {
    pub claims: &'a ClaimsContext,
    pub now: DateTime<Utc>,
}

/// Scalar function trait
pub trait ScalarFunction: Send + Sync {
    /// Function name
    fn name(&self) -> &str;

    /// Evaluate the function
    fn evaluate(&self, args: &[Datum], ctx: &FunctionContext<'_>) -> Result<Datum>;
}

type BuiltinFn = fn(&[Datum], &FunctionContext<'_>) -> Result<Datum>;

struct Builtin {
    name: &'static str,
    arity: Option<usize>,
    func: BuiltinFn,
}

impl ScalarFunction for Builtin {
    fn name(&self) -> &str {
        self.name
    }

    fn evaluate(&self, args: &[Datum], ctx: &FunctionContext<'_>) -> Result<Datum> {
        if let Some(arity) = self.arity {
            if args.len() != arity {
                return Err(Error::evaluation(format!(
                    "{}() takes {arity} argument(s), got {}",
                    self.name,
                    args.len()
                )));
            }
        }
        (self.func)(args, ctx)
    }
}

/// Allow-listed built-in functions
pub struct FunctionRegistry {
    scalar_functions: HashMap<&'static str, Arc<dyn ScalarFunction>>,
}

impl FunctionRegistry {
    /// Create the registry with every built-in function
    pub fn new() -> Self {
        let mut registry = Self {
            scalar_functions: HashMap::new(),
        };

        registry.builtin("auth.uid", Some(0), |_, ctx| {
            Ok(ctx
                .claims
                .principal_id()
                .map_or(Datum::Null, |id| Datum::Text(id.to_string())))
        });
        registry.builtin("auth.role", Some(0), |_, ctx| {
            Ok(Datum::Text(ctx.claims.role().to_string()))
        });
        registry.builtin("auth.email", Some(0), |_, ctx| {
            Ok(ctx
                .claims
                .email()
                .map_or(Datum::Null, |e| Datum::Text(e.to_string())))
        });
        registry.builtin("auth.claim", Some(1), |args, ctx| match &args[0] {
            Datum::Text(key) => Ok(ctx.claims.claim(key).map_or(Datum::Null, Datum::from_json)),
            Datum::Null => Ok(Datum::Null),
            other => Err(Error::evaluation(format!(
                "auth.claim() expects text, got {}",
                other.type_name()
            ))),
        });
        registry.builtin("now", Some(0), |_, ctx| Ok(Datum::Timestamp(ctx.now)));
        registry.builtin("current_timestamp", Some(0), |_, ctx| {
            Ok(Datum::Timestamp(ctx.now))
        });
        registry.builtin("lower", Some(1), |args, _| {
            Ok(text_map(&args[0], |s| s.to_lowercase()))
        });
        registry.builtin("upper", Some(1), |args, _| {
            Ok(text_map(&args[0], |s| s.to_uppercase()))
        });
        registry.builtin("trim", Some(1), |args, _| {
            Ok(text_map(&args[0], |s| s.trim().to_string()))
        });
        registry.builtin("length", Some(1), |args, _| {
            Ok(args[0].to_text().map_or(Datum::Null, |s| {
                Datum::Int(i64::try_from(s.chars().count()).unwrap_or(i64::MAX))
            }))
        });
        registry.builtin("concat", None, |args, _| {
            Ok(Datum::Text(args.iter().filter_map(Datum::to_text).collect()))
        });
        registry.builtin("coalesce", None, |args, _| {
            Ok(args
                .iter()
                .find(|a| !a.is_null())
                .cloned()
                .unwrap_or(Datum::Null))
        });

        registry
    }

    fn builtin(&mut self, name: &'static str, arity: Option<usize>, func: BuiltinFn) {
        self.scalar_functions
            .insert(name, Arc::new(Builtin { name, arity, func }));
    }

    /// Get a built-in function
    pub fn get(&self, name: &str) -> Option<Arc<dyn ScalarFunction>> {
        self.scalar_functions.get(name).cloned()
    }

    /// Names of every allow-listed function
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.scalar_functions.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn text_map(value: &Datum, f: impl Fn(&str) -> String) -> Datum {
    value.to_text().map_or(Datum::Null, |s| Datum::Text(f(&s)))
}

/// An elevated helper: one fixed sub-query evaluated without the calling
/// principal's RLS on the tables it reads.
///
/// The body is a `SELECT` whose positional parameters (`$1`, `$2`, ...) are
/// bound to the call arguments. With a single projected column the helper
/// returns the set of projected values, otherwise whether any row matched.
#[derive(Debug, Clone)]
pub struct SecurityDefiner {
    name: String,
    params: usize,
    body: SubQuery,
}

impl SecurityDefiner {
    /// Compile a helper from its `SELECT` body
    ///
    /// # Errors
    /// Returns `InvalidPolicy` if the body does not compile.
    pub fn new(name: &str, params: usize, body_sql: &str) -> Result<Self> {
        let dialect = PostgreSqlDialect {};
        let query = Parser::new(&dialect)
            .try_with_sql(body_sql)
            .and_then(|mut parser| parser.parse_query())
            .map_err(|e| Error::InvalidPolicy(format!("function {name}: {e}")))?;

        Ok(Self {
            name: name.to_ascii_lowercase(),
            params,
            body: convert_query(&query)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> usize {
        self.params
    }

    pub fn body(&self) -> &SubQuery {
        &self.body
    }

    /// Whether the helper yields a set of values rather than a boolean
    pub fn returns_set(&self) -> bool {
        self.body.projection.is_some()
    }
}

/// Capability registry of security-definer helpers
#[derive(Default)]
pub struct DefinerRegistry {
    definers: RwLock<HashMap<String, Arc<SecurityDefiner>>>,
}

impl DefinerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow-list a helper
    ///
    /// # Errors
    /// Returns `InvalidPolicy` if the name collides with a built-in or an
    /// existing helper.
    pub fn register(&self, definer: SecurityDefiner) -> Result<()> {
        if FunctionRegistry::new().get(definer.name()).is_some() {
            return Err(Error::InvalidPolicy(format!(
                "function {} shadows a built-in",
                definer.name()
            )));
        }

        let mut definers = self.definers.write();
        if definers.contains_key(definer.name()) {
            return Err(Error::InvalidPolicy(format!(
                "function {} already exists",
                definer.name()
            )));
        }

        tracing::info!(function = %definer.name(), "registered security definer");
        definers.insert(definer.name().to_string(), Arc::new(definer));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<SecurityDefiner>> {
        self.definers.read().get(name).cloned()
    }
}
