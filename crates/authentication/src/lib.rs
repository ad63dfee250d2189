//! Request authentication for the HTTP surface.
//!
//! An [`Authenticator`] inspects request headers and produces an
//! [`AuthResult`], optionally attaching a tenant id for multi-tenant
//! deployments. Handlers treat an absent authenticator as "no
//! authentication": every request passes.

use std::{
    collections::{
        HashMap,
        HashSet,
    },
    sync::Arc,
};

use async_trait::async_trait;
use http::{
    header::AUTHORIZATION,
    HeaderMap,
};
use sha2::{
    Digest,
    Sha256,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthResult {
    pub authenticated: bool,
    pub tenant_id: Option<String>,
    pub error: Option<String>,
}

impl AuthResult {
    pub fn success(tenant_id: Option<String>) -> Self {
        Self {
            authenticated: true,
            tenant_id,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            authenticated: false,
            tenant_id: None,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, headers: &HeaderMap) -> AuthResult;
}

/// Accepts every request.
pub struct NoAuthenticator;

#[async_trait]
impl Authenticator for NoAuthenticator {
    async fn authenticate(&self, _headers: &HeaderMap) -> AuthResult {
        AuthResult::success(None)
    }
}

struct UserInfo {
    password_hash: String,
    tenant_id: Option<String>,
}

/// `Authorization: Basic` against a user table with SHA-256-hashed
/// passwords.
#[derive(Default)]
pub struct BasicAuthenticator {
    users: HashMap<String, UserInfo>,
}

pub fn hash_password(password: &str) -> String {
    let digest = Sha256::digest(password.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

impl BasicAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user with an already-hashed password.
    pub fn add_user(
        &mut self,
        username: impl Into<String>,
        password_hash: impl Into<String>,
        tenant_id: Option<String>,
    ) {
        self.users.insert(username.into(), UserInfo {
            password_hash: password_hash.into(),
            tenant_id,
        });
    }

    pub fn add_user_with_password(
        &mut self,
        username: impl Into<String>,
        password: &str,
        tenant_id: Option<String>,
    ) {
        self.add_user(username, hash_password(password), tenant_id);
    }

    fn parse_basic(header: &str) -> Option<(String, String)> {
        let encoded = header.strip_prefix("Basic ")?;
        let decoded = base64::decode(encoded.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;
        Some((username.to_string(), password.to_string()))
    }
}

#[async_trait]
impl Authenticator for BasicAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> AuthResult {
        let Some(header) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
            return AuthResult::failure("missing Authorization header");
        };
        let Some((username, password)) = Self::parse_basic(header) else {
            return AuthResult::failure("malformed Basic authorization");
        };
        let Some(user) = self.users.get(&username) else {
            return AuthResult::failure("unknown user");
        };
        if hash_password(&password) != user.password_hash {
            return AuthResult::failure("invalid password");
        }
        AuthResult::success(user.tenant_id.clone())
    }
}

/// `Authorization: Bearer` against a token table.
#[derive(Default)]
pub struct BearerAuthenticator {
    tokens: HashMap<String, Option<String>>,
}

impl BearerAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_token(&mut self, token: impl Into<String>, tenant_id: Option<String>) {
        self.tokens.insert(token.into(), tenant_id);
    }
}

#[async_trait]
impl Authenticator for BearerAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> AuthResult {
        let Some(header) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
            return AuthResult::failure("missing Authorization header");
        };
        let Some(token) = header.strip_prefix("Bearer ") else {
            return AuthResult::failure("not Bearer authorization");
        };
        match self.tokens.get(token.trim()) {
            Some(tenant_id) => AuthResult::success(tenant_id.clone()),
            None => AuthResult::failure("unknown token"),
        }
    }
}

/// Tenant header authentication, commonly `X-Scope-OrgID`. Optionally
/// validates the value against an allowlist.
pub struct HeaderAuthenticator {
    header_name: String,
    valid_tenants: HashSet<String>,
    validate_tenants: bool,
    require_header: bool,
}

impl Default for HeaderAuthenticator {
    fn default() -> Self {
        Self {
            header_name: "X-Scope-OrgID".to_string(),
            valid_tenants: HashSet::new(),
            validate_tenants: false,
            require_header: true,
        }
    }
}

impl HeaderAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tenant_header(&mut self, header_name: impl Into<String>) {
        self.header_name = header_name.into();
    }

    pub fn add_valid_tenant(&mut self, tenant_id: impl Into<String>) {
        self.valid_tenants.insert(tenant_id.into());
        self.validate_tenants = true;
    }

    pub fn set_validate_tenants(&mut self, validate: bool) {
        self.validate_tenants = validate;
    }

    pub fn set_require_header(&mut self, require: bool) {
        self.require_header = require;
    }
}

#[async_trait]
impl Authenticator for HeaderAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> AuthResult {
        let value = headers
            .get(&self.header_name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty());
        let Some(tenant_id) = value else {
            if self.require_header {
                return AuthResult::failure(format!("missing {} header", self.header_name));
            }
            return AuthResult::success(None);
        };
        if self.validate_tenants && !self.valid_tenants.contains(tenant_id) {
            return AuthResult::failure(format!("unknown tenant {tenant_id}"));
        }
        AuthResult::success(Some(tenant_id.to_string()))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompositeMode {
    /// First success wins.
    Any,
    /// Every inner authenticator must succeed.
    All,
}

pub struct CompositeAuthenticator {
    mode: CompositeMode,
    inner: Vec<Arc<dyn Authenticator>>,
}

impl CompositeAuthenticator {
    pub fn new(mode: CompositeMode) -> Self {
        Self {
            mode,
            inner: Vec::new(),
        }
    }

    pub fn add(&mut self, authenticator: Arc<dyn Authenticator>) {
        self.inner.push(authenticator);
    }
}

#[async_trait]
impl Authenticator for CompositeAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> AuthResult {
        if self.inner.is_empty() {
            return AuthResult::success(None);
        }
        match self.mode {
            CompositeMode::Any => {
                let mut last_error = None;
                for authenticator in &self.inner {
                    let result = authenticator.authenticate(headers).await;
                    if result.authenticated {
                        return result;
                    }
                    last_error = result.error;
                }
                AuthResult::failure(
                    last_error.unwrap_or_else(|| "all authenticators rejected".to_string()),
                )
            },
            CompositeMode::All => {
                let mut tenant_id = None;
                for authenticator in &self.inner {
                    let result = authenticator.authenticate(headers).await;
                    if !result.authenticated {
                        return result;
                    }
                    if result.tenant_id.is_some() {
                        tenant_id = result.tenant_id;
                    }
                }
                AuthResult::success(tenant_id)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use http::{
        header::AUTHORIZATION,
        HeaderMap,
        HeaderValue,
    };

    use super::{
        AuthResult,
        Authenticator,
        BasicAuthenticator,
        BearerAuthenticator,
        CompositeAuthenticator,
        CompositeMode,
        HeaderAuthenticator,
        NoAuthenticator,
    };

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[tokio::test]
    async fn test_no_authenticator_accepts_everything() {
        let result = NoAuthenticator.authenticate(&HeaderMap::new()).await;
        assert_eq!(result, AuthResult::success(None));
    }

    #[tokio::test]
    async fn test_basic_authenticator() {
        let mut auth = BasicAuthenticator::new();
        auth.add_user_with_password("alice", "s3cret", Some("tenant-a".to_string()));

        let encoded = base64::encode("alice:s3cret");
        let ok = auth
            .authenticate(&headers(&[("authorization", &format!("Basic {encoded}"))]))
            .await;
        assert!(ok.authenticated);
        assert_eq!(ok.tenant_id.as_deref(), Some("tenant-a"));

        let bad_password = base64::encode("alice:wrong");
        let rejected = auth
            .authenticate(&headers(&[(
                "authorization",
                &format!("Basic {bad_password}"),
            )]))
            .await;
        assert!(!rejected.authenticated);
        assert_eq!(rejected.error.as_deref(), Some("invalid password"));

        let missing = auth.authenticate(&HeaderMap::new()).await;
        assert!(!missing.authenticated);

        let not_basic = auth
            .authenticate(&headers(&[("authorization", "Bearer tok")]))
            .await;
        assert_eq!(
            not_basic.error.as_deref(),
            Some("malformed Basic authorization")
        );
    }

    #[tokio::test]
    async fn test_bearer_authenticator() {
        let mut auth = BearerAuthenticator::new();
        auth.add_token("tok-1", None);

        let ok = auth
            .authenticate(&headers(&[("authorization", "Bearer tok-1")]))
            .await;
        assert!(ok.authenticated);

        let rejected = auth
            .authenticate(&headers(&[("authorization", "Bearer nope")]))
            .await;
        assert_eq!(rejected.error.as_deref(), Some("unknown token"));
    }

    #[tokio::test]
    async fn test_header_authenticator() {
        let mut auth = HeaderAuthenticator::new();
        let ok = auth
            .authenticate(&headers(&[("x-scope-orgid", "team-1")]))
            .await;
        assert!(ok.authenticated);
        assert_eq!(ok.tenant_id.as_deref(), Some("team-1"));

        let missing = auth.authenticate(&HeaderMap::new()).await;
        assert!(!missing.authenticated);

        // With an allowlist, unknown tenants are rejected.
        auth.add_valid_tenant("team-1");
        let unknown = auth
            .authenticate(&headers(&[("x-scope-orgid", "team-2")]))
            .await;
        assert!(!unknown.authenticated);

        // Optional header mode.
        auth.set_require_header(false);
        let optional = auth.authenticate(&HeaderMap::new()).await;
        assert!(optional.authenticated);
        assert_eq!(optional.tenant_id, None);
    }

    #[tokio::test]
    async fn test_composite_any_and_all() {
        let mut bearer = BearerAuthenticator::new();
        bearer.add_token("tok-1", Some("tenant-b".to_string()));
        let bearer = Arc::new(bearer);
        let mut header = HeaderAuthenticator::new();
        header.set_require_header(true);
        let header = Arc::new(header);

        let mut any = CompositeAuthenticator::new(CompositeMode::Any);
        any.add(header.clone());
        any.add(bearer.clone());
        // Bearer succeeds even though the header check fails.
        let result = any
            .authenticate(&headers(&[("authorization", "Bearer tok-1")]))
            .await;
        assert!(result.authenticated);
        assert_eq!(result.tenant_id.as_deref(), Some("tenant-b"));

        let mut all = CompositeAuthenticator::new(CompositeMode::All);
        all.add(header);
        all.add(bearer);
        // ALL fails without the header...
        let result = all
            .authenticate(&headers(&[("authorization", "Bearer tok-1")]))
            .await;
        assert!(!result.authenticated);
        // ...and succeeds with both credentials present.
        let result = all
            .authenticate(&headers(&[
                ("authorization", "Bearer tok-1"),
                ("x-scope-orgid", "team-9"),
            ]))
            .await;
        assert!(result.authenticated);
        assert_eq!(result.tenant_id.as_deref(), Some("tenant-b"));
    }
}
