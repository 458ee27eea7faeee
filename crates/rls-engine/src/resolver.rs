//! Policy resolution: from (table, operation, role) to one effective predicate

use std::sync::Arc;

use dashmap::DashMap;

use rls_common::Operation;

use crate::context::ClaimsContext;
use crate::expr::Expr;
use crate::policy::{Policy, PolicyKind, PolicyStore};

/// A resolved predicate, simplified where it is constant
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// No restriction
    Allow,
    /// Nothing passes
    Deny,
    /// Rows pass when the expression evaluates to `true`
    Filter(Arc<Expr>),
}

impl Predicate {
    /// Disjunction of policy predicates; no parts means deny
    fn any(parts: Vec<&Expr>) -> Self {
        if parts.iter().any(|p| **p == Expr::TRUE) {
            return Predicate::Allow;
        }
        let parts: Vec<Expr> = parts
            .into_iter()
            .filter(|p| **p != Expr::FALSE)
            .cloned()
            .collect();
        if parts.is_empty() {
            Predicate::Deny
        } else {
            Predicate::Filter(Arc::new(Expr::or(parts)))
        }
    }

    /// Conjunction with restrictive policy predicates
    fn restrict(self, parts: &[&Expr]) -> Self {
        if parts.iter().any(|p| **p == Expr::FALSE) {
            return Predicate::Deny;
        }
        let mut all: Vec<Expr> = parts
            .iter()
            .filter(|p| ***p != Expr::TRUE)
            .map(|p| (*p).clone())
            .collect();
        match self {
            Predicate::Deny => Predicate::Deny,
            _ if all.is_empty() => self,
            Predicate::Allow => Predicate::Filter(Arc::new(Expr::and(all))),
            Predicate::Filter(expr) => {
                all.insert(0, (*expr).clone());
                Predicate::Filter(Arc::new(Expr::and(all)))
            }
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Predicate::Allow)
    }

    pub fn is_deny(&self) -> bool {
        matches!(self, Predicate::Deny)
    }

    /// The predicate as an expression, constants included
    pub fn to_expr(&self) -> Expr {
        match self {
            Predicate::Allow => Expr::TRUE,
            Predicate::Deny => Expr::FALSE,
            Predicate::Filter(expr) => (**expr).clone(),
        }
    }
}

/// Combined `using` and `with_check` predicates for one (table, operation, role)
#[derive(Debug, Clone, PartialEq)]
pub struct EffectivePredicate {
    /// Gates which existing rows are visible or eligible
    pub using: Predicate,
    /// Gates which new row values may be written
    pub check: Predicate,
    /// Names of the applied policies, in registration order
    pub policies: Vec<String>,
    /// Table version this was resolved against
    pub version: u64,
    /// RLS was enabled when this was resolved
    pub enforced: bool,
}

impl EffectivePredicate {
    fn unrestricted(version: u64) -> Self {
        Self {
            using: Predicate::Allow,
            check: Predicate::Allow,
            policies: vec![],
            version,
            enforced: false,
        }
    }

    /// RLS is on and no policy applies, so nothing may be written
    pub fn denies_all_writes(&self) -> bool {
        self.enforced && self.policies.is_empty()
    }

    fn combine(applicable: &[Arc<Policy>], version: u64) -> Self {
        let (permissive, restrictive): (Vec<_>, Vec<_>) = applicable
            .iter()
            .partition(|p| p.kind == PolicyKind::Permissive);

        let policies = applicable.iter().map(|p| p.name.clone()).collect();

        // Restrictive policies alone never grant anything
        if permissive.is_empty() {
            return Self {
                using: Predicate::Deny,
                check: Predicate::Deny,
                policies,
                version,
                enforced: true,
            };
        }

        let using = Predicate::any(
            permissive
                .iter()
                .filter_map(|p| p.using.as_ref().map(|u| u.expr()))
                .collect(),
        );
        let check = Predicate::any(permissive.iter().filter_map(|p| p.check_predicate()).collect());

        let restrict_using: Vec<&Expr> = restrictive
            .iter()
            .filter_map(|p| p.using.as_ref().map(|u| u.expr()))
            .collect();
        let restrict_check: Vec<&Expr> = restrictive
            .iter()
            .filter_map(|p| p.check_predicate())
            .collect();

        Self {
            using: using.restrict(&restrict_using),
            check: check.restrict(&restrict_check),
            policies,
            version,
            enforced: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    table: String,
    operation: Operation,
    role: String,
}

/// Selects and combines the policies applicable to an operation
pub struct PolicyResolver {
    store: Arc<PolicyStore>,
    cache: Arc<DashMap<CacheKey, Arc<EffectivePredicate>>>,
    cache_enabled: bool,
}

impl PolicyResolver {
    /// Create a resolver over `store`, evicting its cache on every store mutation
    pub fn new(store: Arc<PolicyStore>, cache_enabled: bool) -> Self {
        let cache: Arc<DashMap<CacheKey, Arc<EffectivePredicate>>> = Arc::new(DashMap::new());

        let evict = Arc::clone(&cache);
        store.on_invalidate(Arc::new(move |table: &str| {
            evict.retain(|key, _| key.table != table);
        }));

        Self {
            store,
            cache,
            cache_enabled,
        }
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    /// Resolve the effective predicate for `claims.role()`.
    ///
    /// Compiled predicates are unbound, so the result depends on the role
    /// alone and is shared by every principal holding it.
    pub fn resolve(
        &self,
        table: &str,
        operation: Operation,
        claims: &ClaimsContext,
    ) -> Arc<EffectivePredicate> {
        let snapshot = self.store.snapshot(table);
        if !snapshot.rls_enabled {
            return Arc::new(EffectivePredicate::unrestricted(snapshot.version));
        }

        let key = CacheKey {
            table: table.to_string(),
            operation,
            role: claims.role().to_string(),
        };

        if self.cache_enabled {
            if let Some(hit) = self.cache.get(&key) {
                if hit.version == snapshot.version {
                    tracing::debug!(table, %operation, role = %key.role, "policy cache hit");
                    return Arc::clone(hit.value());
                }
            }
        }

        let applicable: Vec<Arc<Policy>> = snapshot
            .policies
            .into_iter()
            .filter(|p| p.command.applies_to(operation) && p.applies_to_role(&key.role))
            .collect();

        let resolved = Arc::new(EffectivePredicate::combine(&applicable, snapshot.version));
        tracing::debug!(
            table,
            %operation,
            role = %key.role,
            policies = ?resolved.policies,
            "resolved effective predicate"
        );

        if self.cache_enabled {
            self.cache.insert(key, Arc::clone(&resolved));
        }
        resolved
    }

    /// Number of cached resolutions
    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PolicyCommand, PolicyDefinition};

    fn setup() -> (Arc<PolicyStore>, PolicyResolver) {
        let store = Arc::new(PolicyStore::new());
        let resolver = PolicyResolver::new(Arc::clone(&store), true);
        (store, resolver)
    }

    fn user() -> ClaimsContext {
        ClaimsContext::authenticated("u1", "authenticated")
    }

    #[test]
    fn test_rls_disabled_is_unrestricted() {
        let (store, resolver) = setup();
        store
            .create_policy(PolicyDefinition::new("p", "docs", PolicyCommand::All).with_using("false"))
            .unwrap();

        let resolved = resolver.resolve("docs", Operation::Select, &user());
        assert!(resolved.using.is_allow());
        assert!(resolved.check.is_allow());
        assert!(!resolved.denies_all_writes());
    }

    #[test]
    fn test_no_applicable_policy_denies() {
        let (store, resolver) = setup();
        store.enable_rls("docs");
        store
            .create_policy(
                PolicyDefinition::new("admins", "docs", PolicyCommand::All)
                    .with_using("true")
                    .for_roles(&["admin"]),
            )
            .unwrap();

        let resolved = resolver.resolve("docs", Operation::Select, &user());
        assert!(resolved.using.is_deny());
        assert!(resolved.check.is_deny());
        assert!(resolved.policies.is_empty());
        assert!(resolved.denies_all_writes());
    }

    #[test]
    fn test_permissive_policies_are_or_combined() {
        let (store, resolver) = setup();
        store.enable_rls("docs");
        store
            .create_policy(
                PolicyDefinition::new("own", "docs", PolicyCommand::Select)
                    .with_using("owner = auth.uid()"),
            )
            .unwrap();
        store
            .create_policy(
                PolicyDefinition::new("published", "docs", PolicyCommand::Select)
                    .with_using("published"),
            )
            .unwrap();

        let resolved = resolver.resolve("docs", Operation::Select, &user());
        assert!(matches!(&resolved.using, Predicate::Filter(e) if matches!(**e, Expr::Or(_))));
        assert_eq!(resolved.policies, vec!["own", "published"]);

        store
            .create_policy(PolicyDefinition::new("all", "docs", PolicyCommand::Select).with_using("true"))
            .unwrap();
        assert!(resolver.resolve("docs", Operation::Select, &user()).using.is_allow());
    }

    #[test]
    fn test_using_doubles_as_check() {
        let (store, resolver) = setup();
        store.enable_rls("profiles");
        store
            .create_policy(
                PolicyDefinition::new("own", "profiles", PolicyCommand::Update)
                    .with_using("auth.uid() = id"),
            )
            .unwrap();

        let resolved = resolver.resolve("profiles", Operation::Update, &user());
        assert_eq!(resolved.using, resolved.check);
        assert!(!resolved.check.is_deny());
    }

    #[test]
    fn test_restrictive_policies_are_and_combined() {
        let (store, resolver) = setup();
        store.enable_rls("docs");
        store
            .create_policy(
                PolicyDefinition::new("not_deleted", "docs", PolicyCommand::Select)
                    .with_using("deleted_at is null")
                    .restrictive(),
            )
            .unwrap();

        // A restrictive policy alone grants nothing
        assert!(resolver.resolve("docs", Operation::Select, &user()).using.is_deny());

        store
            .create_policy(PolicyDefinition::new("all", "docs", PolicyCommand::Select).with_using("true"))
            .unwrap();
        let resolved = resolver.resolve("docs", Operation::Select, &user());
        assert!(matches!(&resolved.using, Predicate::Filter(e) if matches!(**e, Expr::IsNull { .. })));
    }

    #[test]
    fn test_cache_is_invalidated_on_mutation() {
        let (store, resolver) = setup();
        store.enable_rls("docs");
        store
            .create_policy(PolicyDefinition::new("all", "docs", PolicyCommand::Select).with_using("true"))
            .unwrap();

        let first = resolver.resolve("docs", Operation::Select, &user());
        let again = resolver.resolve("docs", Operation::Select, &user());
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(resolver.cached_entries(), 1);

        store.drop_policy("docs", "all").unwrap();
        assert_eq!(resolver.cached_entries(), 0);
        assert!(resolver.resolve("docs", Operation::Select, &user()).using.is_deny());
    }

    #[test]
    fn test_cache_shared_across_principals_with_same_role() {
        let (store, resolver) = setup();
        store.enable_rls("docs");
        store
            .create_policy(
                PolicyDefinition::new("own", "docs", PolicyCommand::Select)
                    .with_using("owner = auth.uid()"),
            )
            .unwrap();

        let alice = ClaimsContext::authenticated("alice", "authenticated");
        let bob = ClaimsContext::authenticated("bob", "authenticated");
        let a = resolver.resolve("docs", Operation::Select, &alice);
        let b = resolver.resolve("docs", Operation::Select, &bob);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_concurrent_mutation_never_serves_stale_predicate() {
        use std::collections::HashMap;
        use std::sync::atomic::{AtomicBool, Ordering};

        let (store, resolver) = setup();
        store.enable_rls("docs");
        let done = AtomicBool::new(false);

        let (expected, observed) = std::thread::scope(|scope| {
            let readers: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        let mut seen = Vec::new();
                        while !done.load(Ordering::Acquire) {
                            let resolved = resolver.resolve("docs", Operation::Select, &user());
                            seen.push((resolved.version, resolved.policies.clone()));
                        }
                        seen
                    })
                })
                .collect();

            let mut expected: HashMap<u64, Vec<String>> = HashMap::new();
            let mut record = |store: &PolicyStore| {
                let snapshot = store.snapshot("docs");
                let names: Vec<String> = snapshot.policies.iter().map(|p| p.name.clone()).collect();
                expected.insert(snapshot.version, names.clone());
                names
            };
            record(&store);

            for i in 0..200 {
                let name = format!("p{i}");
                store
                    .create_policy(
                        PolicyDefinition::new(&name, "docs", PolicyCommand::Select).with_using("true"),
                    )
                    .unwrap();
                let names = record(&store);
                assert_eq!(resolver.resolve("docs", Operation::Select, &user()).policies, names);

                if i % 2 == 1 {
                    store.drop_policy("docs", &format!("p{}", i - 1)).unwrap();
                    let names = record(&store);
                    assert_eq!(resolver.resolve("docs", Operation::Select, &user()).policies, names);
                }
            }
            done.store(true, Ordering::Release);

            let observed: Vec<_> = readers
                .into_iter()
                .flat_map(|reader| reader.join().unwrap())
                .collect();
            (expected, observed)
        });

        for (version, policies) in observed {
            assert_eq!(expected.get(&version), Some(&policies), "version {version}");
        }
        let last = store.snapshot("docs");
        assert_eq!(
            resolver.resolve("docs", Operation::Select, &user()).version,
            last.version
        );
    }
}
