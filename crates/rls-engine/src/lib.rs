//! Row Level Security (RLS) engine
//!
//! PostgreSQL-style row level security over a relational store:
//! - Policy definition and storage
//! - Predicate compilation and three-valued evaluation
//! - Policy resolution (permissive OR, restrictive AND) with a per-role cache
//! - Enforcement gate for reads and writes
//! - SQL query rewriting with security predicates
//! - Security-definer helpers and service-key bypass

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod context;
pub mod datum;
pub mod evaluator;
pub mod expr;
pub mod functions;
pub mod gate;
pub mod parser;
pub mod policy;
pub mod resolver;
pub mod rewriter;
pub mod storage;

pub use context::{BypassToken, ClaimsContext, ServiceKeyAuthority};
pub use evaluator::{EvalEnv, ExpressionEvaluator, RowSource, VisibleRows};
pub use expr::Expr;
pub use functions::{DefinerRegistry, FunctionRegistry, SecurityDefiner};
pub use gate::{EnforcementGate, GateSession, GateState, ReadQuery, WriteDecision};
pub use parser::parse_predicate;
pub use policy::{
    Policy, PolicyCatalog, PolicyCommand, PolicyDefinition, PolicyKind, PolicyStore,
};
pub use resolver::{EffectivePredicate, PolicyResolver, Predicate};
pub use rewriter::QueryRewriter;
pub use storage::{DeleteRequest, Executor, MemoryStorage, RowChange, UpdateRequest};
