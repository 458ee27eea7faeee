//! RLS Policy definitions and storage

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use rls_common::{Error, Operation, Result};

use crate::expr::Expr;
use crate::parser::parse_predicate;

/// RLS Policy command types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PolicyCommand {
    #[default]
    All,
    Select,
    Insert,
    Update,
    Delete,
}

impl PolicyCommand {
    /// Check if this command applies to a given operation
    pub fn applies_to(self, operation: Operation) -> bool {
        match self {
            PolicyCommand::All => true,
            PolicyCommand::Select => operation == Operation::Select,
            PolicyCommand::Insert => operation == Operation::Insert,
            PolicyCommand::Update => operation == Operation::Update,
            PolicyCommand::Delete => operation == Operation::Delete,
        }
    }

}

impl fmt::Display for PolicyCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PolicyCommand::All => "ALL",
            PolicyCommand::Select => "SELECT",
            PolicyCommand::Insert => "INSERT",
            PolicyCommand::Update => "UPDATE",
            PolicyCommand::Delete => "DELETE",
        })
    }
}

/// How a policy combines with the other policies on its table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    /// OR-ed with the other permissive policies
    #[default]
    Permissive,
    /// AND-ed on top of the permissive result
    Restrictive,
}

/// Structured policy record as supplied by the administrative collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDefinition {
    /// Policy name, unique per table
    pub name: String,
    /// Table name
    pub table: String,
    /// Command this policy applies to
    #[serde(default)]
    pub command: PolicyCommand,
    /// Roles this policy applies to (empty = all roles)
    #[serde(default)]
    pub roles: Vec<String>,
    /// USING expression (for SELECT, UPDATE, DELETE)
    #[serde(default)]
    pub using: Option<String>,
    /// WITH CHECK expression (for INSERT, UPDATE)
    #[serde(default)]
    pub with_check: Option<String>,
    /// Whether the policy is permissive or restrictive
    #[serde(default)]
    pub kind: PolicyKind,
}

impl PolicyDefinition {
    /// Start a policy definition
    pub fn new(name: &str, table: &str, command: PolicyCommand) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            command,
            roles: vec![],
            using: None,
            with_check: None,
            kind: PolicyKind::Permissive,
        }
    }

    /// Set USING expression
    #[must_use]
    pub fn with_using(mut self, expr: &str) -> Self {
        self.using = Some(expr.to_string());
        self
    }

    /// Set WITH CHECK expression
    #[must_use]
    pub fn with_check(mut self, expr: &str) -> Self {
        self.with_check = Some(expr.to_string());
        self
    }

    /// Set roles
    #[must_use]
    pub fn for_roles(mut self, roles: &[&str]) -> Self {
        self.roles = roles.iter().map(ToString::to_string).collect();
        self
    }

    /// Make policy restrictive
    #[must_use]
    pub fn restrictive(mut self) -> Self {
        self.kind = PolicyKind::Restrictive;
        self
    }

    /// Validate and compile into a [`Policy`]
    ///
    /// # Errors
    /// Returns `InvalidPolicy` for missing clauses or predicates that do not compile.
    pub fn compile(self) -> Result<Policy> {
        Policy::compile(self)
    }
}

/// A compiled predicate together with its source text
#[derive(Debug, Clone)]
pub struct CompiledPredicate {
    source: String,
    expr: Arc<Expr>,
}

impl CompiledPredicate {
    /// Compile predicate text
    ///
    /// # Errors
    /// Returns `InvalidPolicy` if the text does not compile.
    pub fn compile(source: &str) -> Result<Self> {
        Ok(Self {
            source: source.to_string(),
            expr: Arc::new(parse_predicate(source)?),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }
}

/// RLS Policy, validated and compiled
#[derive(Debug, Clone)]
pub struct Policy {
    /// Unique policy ID
    pub id: Uuid,
    /// Policy name
    pub name: String,
    /// Table name
    pub table: String,
    /// Command this policy applies to
    pub command: PolicyCommand,
    /// Roles this policy applies to (empty = all roles)
    pub roles: HashSet<String>,
    /// Combination kind
    pub kind: PolicyKind,
    /// USING predicate: which existing rows are visible
    pub using: Option<CompiledPredicate>,
    /// WITH CHECK predicate: which new row values are allowed
    pub with_check: Option<CompiledPredicate>,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

impl Policy {
    fn compile(def: PolicyDefinition) -> Result<Self> {
        let invalid = |msg: &str| Error::InvalidPolicy(format!("{} on {}: {msg}", def.name, def.table));

        if def.name.trim().is_empty() || def.table.trim().is_empty() {
            return Err(Error::InvalidPolicy(
                "policy name and table are required".to_string(),
            ));
        }
        match def.command {
            PolicyCommand::Select | PolicyCommand::Update | PolicyCommand::Delete | PolicyCommand::All
                if def.using.is_none() =>
            {
                return Err(invalid("a USING expression is required"));
            }
            PolicyCommand::Select if def.with_check.is_some() => {
                return Err(invalid("SELECT policies cannot have WITH CHECK"));
            }
            PolicyCommand::Insert if def.using.is_none() && def.with_check.is_none() => {
                return Err(invalid("an INSERT policy needs WITH CHECK"));
            }
            _ => {}
        }

        let using = def.using.as_deref().map(CompiledPredicate::compile).transpose()?;
        let with_check = def
            .with_check
            .as_deref()
            .map(CompiledPredicate::compile)
            .transpose()?;

        // `public` is the PostgreSQL spelling of "every role"
        let roles: HashSet<String> = if def.roles.iter().any(|r| r.eq_ignore_ascii_case("public")) {
            HashSet::new()
        } else {
            def.roles.into_iter().collect()
        };

        Ok(Self {
            id: Uuid::new_v4(),
            name: def.name,
            table: def.table,
            command: def.command,
            roles,
            kind: def.kind,
            using,
            with_check,
            created_at: Utc::now(),
        })
    }

    /// Check if policy applies to a given role
    pub fn applies_to_role(&self, role: &str) -> bool {
        self.roles.is_empty() || self.roles.contains(role)
    }

    /// Predicate to apply to a proposed row: WITH CHECK, falling back to USING
    pub fn check_predicate(&self) -> Option<&Expr> {
        self.with_check
            .as_ref()
            .or(self.using.as_ref())
            .map(CompiledPredicate::expr)
    }
}

/// Bulk policy catalog, as loaded from configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyCatalog {
    /// Tables with RLS switched on
    pub enable_rls: Vec<String>,
    /// Policies to register
    pub policies: Vec<PolicyDefinition>,
}

#[derive(Debug, Default)]
struct TableSecurity {
    rls_enabled: bool,
    version: u64,
    policies: Vec<Arc<Policy>>,
}

impl TableSecurity {
    fn bump(&mut self) {
        self.version += 1;
    }
}

/// Consistent view of one table's security state
#[derive(Debug, Clone)]
pub struct TableSnapshot {
    pub rls_enabled: bool,
    pub version: u64,
    pub policies: Vec<Arc<Policy>>,
}

/// Called with the table name, under the store's write lock, after every mutation
pub type InvalidationHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Policy store for managing RLS policies
pub struct PolicyStore {
    /// Security state by table
    tables: RwLock<HashMap<String, TableSecurity>>,
    hooks: RwLock<Vec<InvalidationHook>>,
}

impl PolicyStore {
    /// Create a new policy store
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            hooks: RwLock::new(Vec::new()),
        }
    }

    /// Register a hook run synchronously whenever a table's policies change
    pub fn on_invalidate(&self, hook: InvalidationHook) {
        self.hooks.write().push(hook);
    }

    fn notify(&self, table: &str) {
        for hook in self.hooks.read().iter() {
            hook(table);
        }
    }

    /// Enable RLS on a table
    pub fn enable_rls(&self, table: &str) {
        let mut tables = self.tables.write();
        let state = tables.entry(table.to_string()).or_default();
        state.rls_enabled = true;
        state.bump();
        self.notify(table);
        tracing::info!(table, "row level security enabled");
    }

    /// Disable RLS on a table
    pub fn disable_rls(&self, table: &str) {
        let mut tables = self.tables.write();
        let state = tables.entry(table.to_string()).or_default();
        state.rls_enabled = false;
        state.bump();
        self.notify(table);
        tracing::warn!(table, "row level security disabled");
    }

    /// Check if RLS is enabled for a table
    pub fn is_rls_enabled(&self, table: &str) -> bool {
        self.tables
            .read()
            .get(table)
            .is_some_and(|s| s.rls_enabled)
    }

    /// Register a compiled policy
    ///
    /// # Errors
    /// Returns `DuplicatePolicyName` if the table already has a policy with this name.
    pub fn register(&self, policy: Policy) -> Result<()> {
        let mut tables = self.tables.write();
        let state = tables.entry(policy.table.clone()).or_default();

        if state.policies.iter().any(|p| p.name == policy.name) {
            return Err(Error::DuplicatePolicyName {
                table: policy.table,
                name: policy.name,
            });
        }

        tracing::info!(
            table = %policy.table,
            policy = %policy.name,
            command = %policy.command,
            "policy registered"
        );
        let table = policy.table.clone();
        state.policies.push(Arc::new(policy));
        state.bump();
        self.notify(&table);
        Ok(())
    }

    /// Compile and register a policy definition
    ///
    /// # Errors
    /// Returns `InvalidPolicy` or `DuplicatePolicyName`.
    pub fn create_policy(&self, definition: PolicyDefinition) -> Result<()> {
        self.register(definition.compile()?)
    }

    /// Drop a policy
    ///
    /// # Errors
    /// Returns `PolicyNotFound` if the table has no policy with this name.
    pub fn drop_policy(&self, table: &str, name: &str) -> Result<()> {
        let mut tables = self.tables.write();
        let not_found = || Error::PolicyNotFound {
            table: table.to_string(),
            name: name.to_string(),
        };

        let state = tables.get_mut(table).ok_or_else(not_found)?;
        let position = state
            .policies
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(not_found)?;

        state.policies.remove(position);
        state.bump();
        self.notify(table);
        tracing::info!(table, policy = name, "policy dropped");
        Ok(())
    }

    /// Get all policies for a table, in registration order
    pub fn policies(&self, table: &str) -> Vec<Arc<Policy>> {
        self.tables
            .read()
            .get(table)
            .map(|s| s.policies.clone())
            .unwrap_or_default()
    }

    /// Policies declared for `operation` directly or through ALL, in registration order
    pub fn policies_for(&self, table: &str, operation: Operation) -> Vec<Arc<Policy>> {
        self.policies(table)
            .into_iter()
            .filter(|p| p.command.applies_to(operation))
            .collect()
    }

    /// Read RLS flag, version and policies under a single lock acquisition
    pub fn snapshot(&self, table: &str) -> TableSnapshot {
        self.tables.read().get(table).map_or(
            TableSnapshot {
                rls_enabled: false,
                version: 0,
                policies: vec![],
            },
            |s| TableSnapshot {
                rls_enabled: s.rls_enabled,
                version: s.version,
                policies: s.policies.clone(),
            },
        )
    }

    /// Register a whole catalog; either everything is applied or nothing is
    ///
    /// # Errors
    /// Returns the first compile or duplicate-name error, leaving the store untouched.
    pub fn load_catalog(&self, catalog: PolicyCatalog) -> Result<usize> {
        let compiled = catalog
            .policies
            .into_iter()
            .map(PolicyDefinition::compile)
            .collect::<Result<Vec<_>>>()?;

        let mut tables = self.tables.write();

        let mut seen: HashSet<(String, String)> = HashSet::new();
        for policy in &compiled {
            let existing = tables
                .get(&policy.table)
                .is_some_and(|s| s.policies.iter().any(|p| p.name == policy.name));
            if existing || !seen.insert((policy.table.clone(), policy.name.clone())) {
                return Err(Error::DuplicatePolicyName {
                    table: policy.table.clone(),
                    name: policy.name.clone(),
                });
            }
        }

        let count = compiled.len();
        let mut touched: HashSet<String> = catalog.enable_rls.iter().cloned().collect();
        for table in &catalog.enable_rls {
            tables.entry(table.clone()).or_default().rls_enabled = true;
        }
        for policy in compiled {
            touched.insert(policy.table.clone());
            tables
                .entry(policy.table.clone())
                .or_default()
                .policies
                .push(Arc::new(policy));
        }
        for table in &touched {
            if let Some(state) = tables.get_mut(table) {
                state.bump();
            }
            self.notify(table);
        }

        tracing::info!(policies = count, tables = touched.len(), "policy catalog loaded");
        Ok(count)
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_policy_creation() {
        let policy = PolicyDefinition::new("users_policy", "users", PolicyCommand::Select)
            .with_using("auth.uid() = user_id")
            .compile()
            .unwrap();

        assert_eq!(policy.name, "users_policy");
        assert_eq!(
            policy.using.as_ref().map(CompiledPredicate::source),
            Some("auth.uid() = user_id")
        );
        assert!(policy.applies_to_role("anon"));
    }

    #[test]
    fn test_policy_validation() {
        let missing_using = PolicyDefinition::new("p", "users", PolicyCommand::Update).compile();
        assert!(matches!(missing_using, Err(Error::InvalidPolicy(_))));

        let select_check = PolicyDefinition::new("p", "users", PolicyCommand::Select)
            .with_using("true")
            .with_check("true")
            .compile();
        assert!(matches!(select_check, Err(Error::InvalidPolicy(_))));

        let bad_expr = PolicyDefinition::new("p", "users", PolicyCommand::Select)
            .with_using("user_id = ")
            .compile();
        assert!(matches!(bad_expr, Err(Error::InvalidPolicy(_))));

        let insert_only_check = PolicyDefinition::new("p", "users", PolicyCommand::Insert)
            .with_check("true")
            .compile();
        assert!(insert_only_check.is_ok());
    }

    #[test]
    fn test_oversized_interval_is_invalid_policy() {
        let store = PolicyStore::new();
        let result = store.create_policy(
            PolicyDefinition::new("recent", "stories", PolicyCommand::Select)
                .with_using("created_at > now() - interval '9999999999999999 days'"),
        );
        assert!(matches!(result, Err(Error::InvalidPolicy(_))));
        assert!(store.policies("stories").is_empty());
    }

    #[test]
    fn test_public_role_means_everyone() {
        let policy = PolicyDefinition::new("p", "users", PolicyCommand::Select)
            .with_using("true")
            .for_roles(&["public"])
            .compile()
            .unwrap();
        assert!(policy.applies_to_role("anon"));

        let scoped = PolicyDefinition::new("p", "users", PolicyCommand::Select)
            .with_using("true")
            .for_roles(&["authenticated"])
            .compile()
            .unwrap();
        assert!(!scoped.applies_to_role("anon"));
    }

    #[test]
    fn test_policy_store() {
        let store = PolicyStore::new();

        store
            .create_policy(
                PolicyDefinition::new("test_policy", "users", PolicyCommand::All).with_using("true"),
            )
            .unwrap();

        let duplicate = store.create_policy(
            PolicyDefinition::new("test_policy", "users", PolicyCommand::Select).with_using("true"),
        );
        assert!(matches!(duplicate, Err(Error::DuplicatePolicyName { .. })));

        assert_eq!(store.policies("users").len(), 1);
        assert_eq!(store.policies_for("users", Operation::Delete).len(), 1);

        store.drop_policy("users", "test_policy").unwrap();
        assert!(store.policies("users").is_empty());
        assert!(matches!(
            store.drop_policy("users", "test_policy"),
            Err(Error::PolicyNotFound { .. })
        ));
        assert!(matches!(
            store.drop_policy("nope", "test_policy"),
            Err(Error::PolicyNotFound { .. })
        ));
    }

    #[test]
    fn test_policies_for_keeps_registration_order() {
        let store = PolicyStore::new();
        for (name, command) in [
            ("a", PolicyCommand::Select),
            ("b", PolicyCommand::Insert),
            ("c", PolicyCommand::All),
        ] {
            store
                .create_policy(PolicyDefinition::new(name, "t", command).with_using("true"))
                .unwrap();
        }

        let names: Vec<_> = store
            .policies_for("t", Operation::Select)
            .iter()
            .map(|p| p.name.clone())
            .collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[test]
    fn test_enable_rls_bumps_version() {
        let store = PolicyStore::new();

        assert!(!store.is_rls_enabled("users"));
        assert_eq!(store.snapshot("users").version, 0);

        store.enable_rls("users");
        assert!(store.is_rls_enabled("users"));
        let v1 = store.snapshot("users").version;

        store.disable_rls("users");
        assert!(!store.is_rls_enabled("users"));
        assert!(store.snapshot("users").version > v1);
    }

    #[test]
    fn test_invalidation_hook_runs_on_mutation() {
        let store = PolicyStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        store.on_invalidate(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        store
            .create_policy(PolicyDefinition::new("p", "t", PolicyCommand::Select).with_using("true"))
            .unwrap();
        store.drop_policy("t", "p").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_load_catalog_is_all_or_nothing() {
        let store = PolicyStore::new();
        let catalog: PolicyCatalog = serde_json::from_value(serde_json::json!({
            "enable_rls": ["profiles"],
            "policies": [
                {"name": "read", "table": "profiles", "command": "SELECT", "using": "true"},
                {"name": "read", "table": "profiles", "command": "SELECT", "using": "true"}
            ]
        }))
        .unwrap();

        assert!(store.load_catalog(catalog).is_err());
        assert!(store.policies("profiles").is_empty());
        assert!(!store.is_rls_enabled("profiles"));

        let catalog = PolicyCatalog {
            enable_rls: vec!["profiles".to_string()],
            policies: vec![
                PolicyDefinition::new("read", "profiles", PolicyCommand::Select).with_using("true")
            ],
        };
        assert_eq!(store.load_catalog(catalog).unwrap(), 1);
        assert!(store.is_rls_enabled("profiles"));
    }
}
