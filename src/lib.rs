//! Row Level Security for `LumaDB`
//!
//! Ties the policy engine, the in-memory executor and change fan-out
//! together behind one configured entry point.
//!
//! # Components
//!
//! - **Policy Store** - Per-table policies with RLS switches and versions
//! - **Policy Resolver** - Permissive/restrictive combination with a role cache
//! - **Enforcement Gate** - Read filtering and write checks
//! - **Query Rewriter** - SQL `SELECT` rewriting with bound security predicates
//! - **Change Fan-out** - Change events delivered only to subscribers that can read them

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod telemetry;

pub use rls_common as common;
pub use rls_engine as engine;
pub use rls_realtime as realtime;

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use rls_common::config::RlsConfig;
use rls_common::{Result, Row, TokenClaims};
use rls_engine::{
    ClaimsContext, DefinerRegistry, DeleteRequest, EnforcementGate, Executor,
    ExpressionEvaluator, MemoryStorage, PolicyCatalog, PolicyResolver, PolicyStore,
    QueryRewriter, ReadQuery, RowChange, SecurityDefiner, ServiceKeyAuthority, UpdateRequest,
};
use rls_realtime::{ChangeFanout, PublicationFilter, SubscriberHandle, SubscriptionRequest};

/// A fully wired RLS engine over in-memory storage
pub struct RlsEngine {
    config: RlsConfig,
    store: Arc<PolicyStore>,
    definers: Arc<DefinerRegistry>,
    gate: Arc<EnforcementGate>,
    rewriter: QueryRewriter,
    executor: Executor,
    fanout: Arc<ChangeFanout>,
    service_keys: Option<ServiceKeyAuthority>,
}

impl RlsEngine {
    /// Create an engine with the given configuration
    ///
    /// # Errors
    /// Returns `ConfigError` if the configuration is invalid.
    pub fn new(config: RlsConfig) -> Result<Self> {
        config.validate()?;
        info!(
            max_recursion_depth = config.engine.max_recursion_depth,
            cache_enabled = config.engine.cache_enabled,
            "initializing row level security engine"
        );

        let store = Arc::new(PolicyStore::new());
        let definers = Arc::new(DefinerRegistry::new());
        let resolver = Arc::new(PolicyResolver::new(
            Arc::clone(&store),
            config.engine.cache_enabled,
        ));
        let evaluator = Arc::new(ExpressionEvaluator::new(
            Arc::clone(&definers),
            config.engine.max_recursion_depth,
        ));
        let gate = Arc::new(EnforcementGate::new(Arc::clone(&resolver), Arc::clone(&evaluator)));
        let rewriter = QueryRewriter::new(resolver, evaluator);

        let storage = Arc::new(MemoryStorage::new());
        let executor = Executor::new(Arc::clone(&storage), Arc::clone(&gate));
        let fanout = ChangeFanout::new(
            &config.realtime,
            PublicationFilter::new(Arc::clone(&gate), storage),
        );

        let service_keys = config
            .auth
            .service_key
            .as_deref()
            .map(|key| ServiceKeyAuthority::new("service_role", key))
            .transpose()?;

        Ok(Self {
            config,
            store,
            definers,
            gate,
            rewriter,
            executor,
            fanout,
            service_keys,
        })
    }

    /// Create an engine from a TOML configuration file
    ///
    /// # Errors
    /// Returns `IoError` if the file cannot be read, `ConfigError` if it is
    /// not valid configuration.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::new(RlsConfig::from_toml_str(&content)?)
    }

    #[must_use]
    pub fn config(&self) -> &RlsConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    #[must_use]
    pub fn gate(&self) -> &Arc<EnforcementGate> {
        &self.gate
    }

    #[must_use]
    pub fn rewriter(&self) -> &QueryRewriter {
        &self.rewriter
    }

    #[must_use]
    pub fn storage(&self) -> &Arc<MemoryStorage> {
        self.executor.storage()
    }

    #[must_use]
    pub fn fanout(&self) -> &Arc<ChangeFanout> {
        &self.fanout
    }

    /// Load a policy catalog from TOML; all of it applies or none does
    ///
    /// # Errors
    /// Returns `ConfigError` for malformed TOML, or the first policy
    /// validation error.
    pub fn load_catalog_toml(&self, content: &str) -> Result<usize> {
        let catalog: PolicyCatalog = toml::from_str(content)
            .map_err(|e| rls_common::Error::ConfigError(e.to_string()))?;
        let loaded = self.store.load_catalog(catalog)?;
        info!(policies = loaded, "policy catalog loaded");
        Ok(loaded)
    }

    /// Allow-list a security-definer helper
    ///
    /// # Errors
    /// Returns `InvalidPolicy` if the body does not compile or the name is taken.
    pub fn register_definer(&self, name: &str, params: usize, body_sql: &str) -> Result<()> {
        self.definers
            .register(SecurityDefiner::new(name, params, body_sql)?)
    }

    /// Context for a request without a principal
    #[must_use]
    pub fn anonymous(&self) -> ClaimsContext {
        ClaimsContext::anonymous(&self.config.auth.anon_role)
    }

    /// Context for a principal holding the default authenticated role
    #[must_use]
    pub fn authenticated(&self, principal_id: &str) -> ClaimsContext {
        ClaimsContext::authenticated(principal_id, &self.config.auth.authenticated_role)
    }

    /// Context from verified token claims
    #[must_use]
    pub fn claims_from_token(&self, claims: &TokenClaims) -> ClaimsContext {
        ClaimsContext::from_token_claims(claims)
    }

    /// Attach a bypass token if `service_key` is the configured key
    #[must_use]
    pub fn elevate(&self, claims: ClaimsContext, service_key: &str) -> Option<ClaimsContext> {
        let token = self.service_keys.as_ref()?.authenticate(service_key)?;
        Some(claims.with_bypass(token))
    }

    /// Rows of a table visible to the caller
    ///
    /// # Errors
    /// Propagates storage and evaluation errors.
    pub fn select(&self, query: &ReadQuery, claims: &ClaimsContext) -> Result<Vec<Row>> {
        self.executor.select(query, claims)
    }

    /// Rewrite a SQL `SELECT` for the caller
    ///
    /// # Errors
    /// Returns `InvalidQuery` for unsupported SQL, or evaluation errors from
    /// inlined helpers.
    pub fn rewrite_select(&self, sql: &str, claims: &ClaimsContext) -> Result<String> {
        self.rewriter.rewrite_select(sql, claims)
    }

    /// Insert rows and notify subscribers
    ///
    /// # Errors
    /// `PolicyCheckViolation` if any row fails the check; nothing is written.
    pub fn insert(&self, table: &str, rows: Vec<Row>, claims: &ClaimsContext) -> Result<Vec<RowChange>> {
        let changes = self.executor.insert(table, rows, claims)?;
        self.publish(&changes);
        Ok(changes)
    }

    /// Update rows and notify subscribers
    ///
    /// # Errors
    /// `PolicyCheckViolation` if a new row fails the check, or if the request
    /// expected one row and none was eligible.
    pub fn update(&self, request: &UpdateRequest, claims: &ClaimsContext) -> Result<Vec<RowChange>> {
        let changes = self.executor.update(request, claims)?;
        self.publish(&changes);
        Ok(changes)
    }

    /// Delete rows and notify subscribers
    ///
    /// # Errors
    /// `PolicyCheckViolation` if the request expected one row and none was
    /// eligible.
    pub fn delete(&self, request: &DeleteRequest, claims: &ClaimsContext) -> Result<Vec<RowChange>> {
        let changes = self.executor.delete(request, claims)?;
        self.publish(&changes);
        Ok(changes)
    }

    /// Subscribe to changes the caller is allowed to see
    ///
    /// # Errors
    /// Returns `InvalidQuery` if the row filter does not parse.
    pub fn subscribe(
        &self,
        request: SubscriptionRequest,
        claims: ClaimsContext,
    ) -> Result<SubscriberHandle> {
        self.fanout.subscribe(request, claims)
    }

    fn publish(&self, changes: &[RowChange]) {
        if !changes.is_empty() {
            self.fanout.publish_changes(changes.to_vec());
        }
    }
}
