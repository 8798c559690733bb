use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

use crate::auth::{IdentityProvider, TokenKind, require_token};
use crate::envelope::classify_response;
use crate::error::Result;
use crate::transport::{ApiRequest, RawResponse, Transport};

/// How a call authenticates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Auth {
    /// Fail with `AuthMissing` before sending when the token is absent
    Required(TokenKind),
    /// Attach the token when one is available
    Optional(TokenKind),
    None,
}

/// Shared request core: token acquisition, send, envelope decoding.
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    identity: Arc<dyn IdentityProvider>,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            transport,
            identity,
        }
    }

    pub fn identity(&self) -> &Arc<dyn IdentityProvider> {
        &self.identity
    }

    pub async fn token(&self, kind: TokenKind) -> Result<String> {
        require_token(self.identity.as_ref(), kind).await
    }

    async fn bearer(&self, auth: Auth) -> Result<Option<String>> {
        match auth {
            Auth::Required(kind) => self.token(kind).await.map(Some),
            Auth::Optional(kind) => {
                let session = self.identity.fetch_session().await.ok();
                Ok(session.and_then(|s| match kind {
                    TokenKind::Id => s.id_token,
                    TokenKind::Access => s.access_token,
                }))
            }
            Auth::None => Ok(None),
        }
    }

    async fn send(&self, req: ApiRequest, auth: Auth) -> Result<RawResponse> {
        let bearer = self.bearer(auth).await?;
        let req = req.bearer(bearer);
        self.transport.send(&req).await
    }

    /// Sends `req` and returns the decoded payload.
    pub async fn call(&self, req: ApiRequest, auth: Auth) -> Result<Value> {
        let response = self.send(req, auth).await?;
        classify_response(response.status, &response.text)
    }

    /// For writes whose reply carries nothing the caller needs: any 2xx is
    /// success whatever the body, other statuses are classified as usual.
    pub async fn call_unit(&self, req: ApiRequest, auth: Auth) -> Result<()> {
        let response = self.send(req, auth).await?;
        if (200..300).contains(&response.status) {
            return Ok(());
        }
        classify_response(response.status, &response.text).map(|_| ())
    }

    /// Like [`call`](Self::call), deserializing into `T`.
    pub async fn call_as<T: DeserializeOwned>(&self, req: ApiRequest, auth: Auth) -> Result<T> {
        let value = self.call(req, auth).await?;
        Ok(serde_json::from_value(value)?)
    }
}
