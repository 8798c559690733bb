use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::{Map, Value};
use std::sync::RwLock;

use crate::config::AuthConfig;
use crate::error::{KininError, Result};

#[cfg(test)]
use mockall::automock;

/// Short-lived bearer tokens handed out by the identity provider
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthSession {
    pub id_token: Option<String>,
    pub access_token: Option<String>,
}

impl AuthSession {
    pub fn is_authenticated(&self) -> bool {
        self.id_token.is_some()
    }
}

/// The signed-in user as reported by the identity provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub username: String,
    pub user_id: Option<String>,
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Id,
    Access,
}

impl TokenKind {
    fn missing_message(&self) -> &'static str {
        match self {
            TokenKind::Id => "Missing idToken. Are you logged in?",
            TokenKind::Access => "Missing accessToken. Are you logged in?",
        }
    }
}

/// Boundary to the hosted identity service. Only bearer tokens are consumed.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn fetch_session(&self) -> Result<AuthSession>;
    async fn current_principal(&self) -> Result<Option<Principal>>;
    async fn sign_in_redirect(&self) -> Result<()>;
    async fn sign_out(&self) -> Result<()>;
}

/// Picks one token out of the current session or fails with `AuthMissing`.
pub async fn require_token(identity: &dyn IdentityProvider, kind: TokenKind) -> Result<String> {
    let session = identity.fetch_session().await?;
    let token = match kind {
        TokenKind::Id => session.id_token,
        TokenKind::Access => session.access_token,
    };
    token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| KininError::AuthMissing(kind.missing_message().to_string()))
}

/// Decodes the (unverified) payload segment of a JWT.
///
/// Signature checks belong to the API; the client only displays claims.
pub fn decode_jwt_claims(token: &str) -> Option<Map<String, Value>> {
    let mut parts = token.split('.');
    let payload = parts.nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    match serde_json::from_slice::<Value>(&bytes).ok()? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

pub fn groups_claim(claims: &Map<String, Value>) -> Vec<String> {
    claims
        .get("cognito:groups")
        .and_then(|v| v.as_array())
        .map(|groups| {
            groups
                .iter()
                .filter_map(|g| g.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Principal derived from ID token claims
pub fn principal_from_id_token(token: &str) -> Option<Principal> {
    let claims = decode_jwt_claims(token)?;
    let text = |key: &str| claims.get(key).and_then(|v| v.as_str()).map(str::to_string);
    let username = text("cognito:username")
        .or_else(|| text("username"))
        .or_else(|| text("sub"))?;
    Some(Principal {
        username,
        user_id: text("sub"),
        groups: groups_claim(&claims),
    })
}

/// Identity backed by pre-issued tokens (configuration or environment).
///
/// Suits headless callers and tests; there is no interactive sign-in.
#[derive(Debug, Default)]
pub struct StaticIdentity {
    session: RwLock<AuthSession>,
}

impl StaticIdentity {
    pub fn new(id_token: Option<String>, access_token: Option<String>) -> Self {
        Self {
            session: RwLock::new(AuthSession {
                id_token,
                access_token,
            }),
        }
    }

    pub fn from_config(cfg: &AuthConfig) -> Self {
        Self::new(cfg.id_token.clone(), cfg.access_token.clone())
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Result<AuthSession> {
        self.session
            .read()
            .map(|s| s.clone())
            .map_err(|_| KininError::Internal("identity lock poisoned".to_string()))
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn fetch_session(&self) -> Result<AuthSession> {
        self.snapshot()
    }

    async fn current_principal(&self) -> Result<Option<Principal>> {
        Ok(self
            .snapshot()?
            .id_token
            .as_deref()
            .and_then(principal_from_id_token))
    }

    async fn sign_in_redirect(&self) -> Result<()> {
        Err(KininError::AuthMissing(
            "Interactive sign-in is not available; provide tokens via configuration".to_string(),
        ))
    }

    async fn sign_out(&self) -> Result<()> {
        let mut session = self
            .session
            .write()
            .map_err(|_| KininError::Internal("identity lock poisoned".to_string()))?;
        *session = AuthSession::default();
        tracing::info!("Signed out; cleared static tokens");
        Ok(())
    }
}
