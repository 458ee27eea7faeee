//! Claims context for request-scoped security information

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde_json::{Map, Value};
use sha2::Sha256;

use rls_common::{Error, Result, TokenClaims};

type HmacSha256 = Hmac<Sha256>;

/// Immutable snapshot of the calling principal for one operation
#[derive(Debug, Clone)]
pub struct ClaimsContext {
    role: String,
    principal_id: Option<String>,
    attributes: Map<String, Value>,
    bypass: Option<BypassToken>,
}

impl ClaimsContext {
    /// Create an anonymous context
    pub fn anonymous(role: &str) -> Self {
        Self {
            role: role.to_string(),
            principal_id: None,
            attributes: Map::new(),
            bypass: None,
        }
    }

    /// Create an authenticated context
    pub fn authenticated(principal_id: impl Into<String>, role: &str) -> Self {
        Self {
            role: role.to_string(),
            principal_id: Some(principal_id.into()),
            attributes: Map::new(),
            bypass: None,
        }
    }

    /// Build context from token claims
    ///
    /// Only `role`, `sub` and the attribute bag are taken from the claims.
    /// Nothing in a claim set can elevate the context past RLS.
    pub fn from_token_claims(claims: &TokenClaims) -> Self {
        let mut attributes = claims.extra.clone();
        if let Some(email) = &claims.email {
            attributes.insert("email".to_string(), Value::String(email.clone()));
        }
        if let Some(phone) = &claims.phone {
            attributes.insert("phone".to_string(), Value::String(phone.clone()));
        }
        if !claims.app_metadata.is_null() {
            attributes.insert("app_metadata".to_string(), claims.app_metadata.clone());
        }
        if !claims.user_metadata.is_null() {
            attributes.insert("user_metadata".to_string(), claims.user_metadata.clone());
        }

        Self {
            role: claims.role.clone(),
            principal_id: claims.sub.clone(),
            attributes,
            bypass: None,
        }
    }

    /// Add an attribute while building the context
    #[must_use]
    pub fn with_attribute(mut self, key: &str, value: Value) -> Self {
        self.attributes.insert(key.to_string(), value);
        self
    }

    /// Attach an elevated capability obtained from a [`ServiceKeyAuthority`]
    #[must_use]
    pub fn with_bypass(mut self, token: BypassToken) -> Self {
        self.bypass = Some(token);
        self
    }

    /// Principal role (`auth.role()`)
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Principal id (`auth.uid()`)
    pub fn principal_id(&self) -> Option<&str> {
        self.principal_id.as_deref()
    }

    /// Principal email (`auth.email()`)
    pub fn email(&self) -> Option<&str> {
        self.attributes.get("email").and_then(Value::as_str)
    }

    /// Look up an arbitrary attribute (`auth.claim(key)`)
    pub fn claim(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// The bypass capability, if this context carries one
    pub fn bypass(&self) -> Option<&BypassToken> {
        self.bypass.as_ref()
    }
}

/// Capability that disables policy enforcement for one operation.
///
/// It has no public constructor and no serde implementation; the only way
/// to obtain one is [`ServiceKeyAuthority::authenticate`].
#[derive(Clone)]
pub struct BypassToken {
    issuer: Arc<str>,
    issued_at: DateTime<Utc>,
}

impl BypassToken {
    fn new(issuer: &str) -> Self {
        Self {
            issuer: Arc::from(issuer),
            issued_at: Utc::now(),
        }
    }

    /// Name of the authority that issued this token
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Issue time
    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }
}

impl fmt::Debug for BypassToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BypassToken")
            .field("issuer", &self.issuer)
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// Verifies service keys and issues [`BypassToken`]s
pub struct ServiceKeyAuthority {
    issuer: String,
    secret: [u8; 32],
    expected_tag: Vec<u8>,
}

impl ServiceKeyAuthority {
    /// Create an authority accepting exactly `service_key`
    ///
    /// # Errors
    /// Returns `InternalError` if the MAC cannot be initialised.
    pub fn new(issuer: &str, service_key: &str) -> Result<Self> {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);

        let mut mac = Self::mac(&secret)?;
        mac.update(service_key.as_bytes());
        let expected_tag = mac.finalize().into_bytes().to_vec();

        Ok(Self {
            issuer: issuer.to_string(),
            secret,
            expected_tag,
        })
    }

    fn mac(secret: &[u8]) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(secret).map_err(|e| Error::InternalError(e.to_string()))
    }

    /// Verify a presented key in constant time and issue a token on success
    pub fn authenticate(&self, presented_key: &str) -> Option<BypassToken> {
        let mut mac = Self::mac(&self.secret).ok()?;
        mac.update(presented_key.as_bytes());

        if mac.verify_slice(&self.expected_tag).is_ok() {
            tracing::info!(target: "rls::audit", issuer = %self.issuer, "bypass token issued");
            Some(BypassToken::new(&self.issuer))
        } else {
            tracing::warn!(target: "rls::audit", issuer = %self.issuer, "rejected service key");
            None
        }
    }
}
