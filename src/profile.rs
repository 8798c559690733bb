use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, warn};

use crate::api::{ApiClient, Auth};
use crate::auth::TokenKind;
use crate::error::{KininError, Result};
use crate::models::{BiographyProfile, CloseAccountRequest, EmailPrefsRequest, FeedbackRequest};
use crate::store::SessionStore;
use crate::transport::ApiRequest;

/// Phrase the user must type before the account is deleted
pub const ACCOUNT_CONFIRM_PHRASE: &str = "delete my account and all data";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailPrefsOp {
    Unsubscribe,
    Resubscribe,
    Status,
}

impl EmailPrefsOp {
    fn path(&self) -> &'static str {
        match self {
            EmailPrefsOp::Unsubscribe => "/email_prefs/unsubscribe",
            EmailPrefsOp::Resubscribe => "/email_prefs/resubscribe",
            EmailPrefsOp::Status => "/email_prefs/status",
        }
    }
}

/// Profile, feedback, account and email-preference endpoints
pub struct ProfileClient {
    api: Arc<ApiClient>,
    store: SessionStore,
}

impl ProfileClient {
    pub fn new(api: Arc<ApiClient>, store: SessionStore) -> Self {
        Self { api, store }
    }

    /// JSON schema describing the editable profile fields
    pub async fn get_profile_schema(&self) -> Result<Option<Value>> {
        let payload = self
            .api
            .call(ApiRequest::get("/profile/schema"), Auth::Required(TokenKind::Id))
            .await?;
        Ok(payload.get("schema").cloned().filter(|v| !v.is_null()))
    }

    pub async fn get_profile(&self) -> Result<BiographyProfile> {
        let payload = self
            .api
            .call(ApiRequest::get("/profile"), Auth::Required(TokenKind::Id))
            .await?;
        biography_from(&payload)
    }

    /// Schema and profile fetched together, as the profile editor needs both
    pub async fn open_profile(&self) -> Result<(Option<Value>, BiographyProfile)> {
        futures::future::try_join(self.get_profile_schema(), self.get_profile()).await
    }

    /// Saves the biography profile. `age` is free text: blank clears it.
    pub async fn save_profile(&self, preferred_name: &str, age: &str) -> Result<BiographyProfile> {
        let preferred = preferred_name.trim();
        if preferred.is_empty() {
            return Err(KininError::Validation(
                "Preferred name is required.".to_string(),
            ));
        }
        let age = match age.trim() {
            "" => None,
            raw => Some(raw.parse::<u32>().map_err(|_| {
                KininError::Validation(format!("Age must be a whole number, got '{raw}'."))
            })?),
        };

        let body = json!({
            "biography_user_profile": {
                "preferred_name": preferred,
                "age": age,
            }
        });
        let payload = self
            .api
            .call(ApiRequest::put("/profile", body), Auth::Required(TokenKind::Id))
            .await?;
        let mut saved = biography_from(&payload)?;
        if saved.preferred_name.as_deref().is_none_or(str::is_empty) {
            saved.preferred_name = Some(preferred.to_string());
        }
        info!("Profile saved");
        Ok(saved)
    }

    /// Posts feedback. Signed-in users attach their token; anonymous feedback
    /// is accepted too.
    pub async fn submit_feedback(
        &self,
        message: &str,
        username: Option<&str>,
        email: Option<&str>,
    ) -> Result<()> {
        let message = message.trim();
        if message.is_empty() {
            return Err(KininError::Validation("Please enter a message.".to_string()));
        }

        let username = match username.map(str::trim).filter(|u| !u.is_empty()) {
            Some(name) => name.to_string(),
            None => self
                .api
                .identity()
                .current_principal()
                .await
                .ok()
                .flatten()
                .map(|p| p.username)
                .unwrap_or_default(),
        };
        let request = FeedbackRequest {
            message: message.to_string(),
            username,
            email: email.map(str::trim).filter(|e| !e.is_empty()).map(str::to_string),
        };
        self.api
            .call_unit(
                ApiRequest::post("/feedback", serde_json::to_value(&request)?),
                Auth::Optional(TokenKind::Id),
            )
            .await
    }

    /// Deletes the account server-side, signs out and wipes local state.
    ///
    /// The confirmation phrase is checked before any request is sent.
    pub async fn close_account(
        &self,
        confirmation: &str,
        username: &str,
        password: &str,
    ) -> Result<()> {
        if confirmation.trim().to_lowercase() != ACCOUNT_CONFIRM_PHRASE {
            return Err(KininError::Validation(format!(
                "Type \"{ACCOUNT_CONFIRM_PHRASE}\" to confirm."
            )));
        }
        let request = CloseAccountRequest {
            confirmation: confirmation.to_string(),
            username: username.to_string(),
            password: password.to_string(),
        };
        self.api
            .call_unit(
                ApiRequest::post("/account/close", serde_json::to_value(&request)?),
                Auth::Required(TokenKind::Id),
            )
            .await?;

        info!("Account deleted; signing out");
        if let Err(e) = self.api.identity().sign_out().await {
            warn!("Sign-out after account deletion failed: {}", e);
        }
        self.store.clear_account();
        Ok(())
    }

    /// Email preference links work without signing in; the signed link's
    /// `exp` and `token` authorize the change.
    pub async fn email_prefs(
        &self,
        op: EmailPrefsOp,
        email: &str,
        exp: &str,
        token: &str,
    ) -> Result<Value> {
        let request = EmailPrefsRequest {
            email: email.trim().to_lowercase(),
            exp: exp.trim().to_string(),
            token: token.trim().to_string(),
        };
        if request.email.is_empty() || request.exp.is_empty() || request.token.is_empty() {
            return Err(KininError::Validation(
                "email, exp and token are required".to_string(),
            ));
        }
        let req = ApiRequest::post(op.path(), serde_json::to_value(&request)?);
        match self.api.call(req, Auth::None).await {
            Ok(value) => Ok(value),
            // An undecodable success still counts as success
            Err(KininError::Decode(_)) => Ok(json!({})),
            Err(e) => Err(e),
        }
    }
}

fn biography_from(payload: &Value) -> Result<BiographyProfile> {
    match payload.get("biography_user_profile") {
        Some(Value::Null) | None => Ok(BiographyProfile::default()),
        Some(bp) => Ok(serde_json::from_value(bp.clone())?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::test_tokens::user_token;
    use crate::auth::{AuthSession, IdentityProvider, MockIdentityProvider, StaticIdentity};
    use crate::store::MemoryStore;
    use crate::transport::HttpMethod;
    use crate::transport::mock::MockTransport;

    fn client(transport: Arc<MockTransport>) -> ProfileClient {
        let api = Arc::new(ApiClient::new(
            transport,
            Arc::new(StaticIdentity::new(Some(user_token()), Some("acc".into()))),
        ));
        ProfileClient::new(api, SessionStore::new(Arc::new(MemoryStore::new())))
    }

    #[tokio::test]
    async fn open_profile_fetches_schema_and_profile() {
        let transport = Arc::new(
            MockTransport::new()
                .respond_enveloped(200, json!({"schema": {"type": "object"}}))
                .respond_enveloped(
                    200,
                    json!({"biography_user_profile": {"preferred_name": "Jess", "age": 41}}),
                ),
        );
        let profile = client(transport.clone());
        let (schema, bio) = profile.open_profile().await.unwrap();
        assert_eq!(schema, Some(json!({"type": "object"})));
        assert_eq!(bio.preferred_name.as_deref(), Some("Jess"));
        assert_eq!(bio.age, Some(41));
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn save_profile_validates_before_sending() {
        let transport = Arc::new(MockTransport::new());
        let profile = client(transport.clone());

        let err = profile.save_profile("   ", "30").await.unwrap_err();
        assert_eq!(err.to_string(), "Preferred name is required.");
        let err = profile.save_profile("Jess", "thirty").await.unwrap_err();
        assert!(matches!(err, KininError::Validation(_)));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn save_profile_sends_null_age_when_blank() {
        let transport = Arc::new(MockTransport::new().respond(200, json!({})));
        let profile = client(transport.clone());

        let saved = profile.save_profile(" Jess ", "").await.unwrap();
        assert_eq!(saved.preferred_name.as_deref(), Some("Jess"));
        let req = &transport.requests()[0];
        assert_eq!(req.method, HttpMethod::Put);
        assert_eq!(
            req.body,
            Some(json!({"biography_user_profile": {"preferred_name": "Jess", "age": null}}))
        );
    }

    #[tokio::test]
    async fn anonymous_feedback_has_no_bearer() {
        let transport = Arc::new(MockTransport::new().respond(200, json!({"ok": true})));
        let api = Arc::new(ApiClient::new(
            transport.clone(),
            Arc::new(StaticIdentity::anonymous()),
        ));
        let profile = ProfileClient::new(api, SessionStore::new(Arc::new(MemoryStore::new())));

        profile
            .submit_feedback(" love it ", None, Some(" a@b.c "))
            .await
            .unwrap();
        let req = &transport.requests()[0];
        assert_eq!(req.bearer, None);
        assert_eq!(
            req.body,
            Some(json!({"message": "love it", "username": "", "email": "a@b.c"}))
        );
    }

    #[tokio::test]
    async fn signed_in_feedback_defaults_username() {
        let transport = Arc::new(MockTransport::new().respond(200, json!({})));
        let profile = client(transport.clone());
        profile.submit_feedback("hi", None, None).await.unwrap();
        let body = transport.requests()[0].body.clone().unwrap();
        assert_eq!(body["username"], json!("jess"));
        assert!(body.get("email").is_none());
    }

    #[tokio::test]
    async fn close_account_requires_phrase() {
        let transport = Arc::new(MockTransport::new());
        let profile = client(transport.clone());
        let err = profile
            .close_account("delete my account", "jess", "pw")
            .await
            .unwrap_err();
        assert!(matches!(err, KininError::Validation(_)));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn close_account_signs_out_and_clears_store() {
        let transport = Arc::new(MockTransport::new().respond(200, json!({"deleted": true})));
        let mut identity = MockIdentityProvider::new();
        identity.expect_fetch_session().returning(|| {
            Ok(AuthSession {
                id_token: Some("id".into()),
                access_token: None,
            })
        });
        identity
            .expect_sign_out()
            .times(1)
            .returning(|| Err(KininError::Internal("already signed out".into())));
        let store = SessionStore::new(Arc::new(MemoryStore::new()));
        store.set_session_id("s-1");
        store.set_journey_version("4");
        let profile = ProfileClient::new(
            Arc::new(ApiClient::new(transport.clone(), Arc::new(identity))),
            store.clone(),
        );

        profile
            .close_account("  Delete My Account and all data ", "jess", "pw")
            .await
            .unwrap();

        assert_eq!(store.session_id(), None);
        assert_eq!(store.journey_version(), None);
        assert_eq!(transport.requests()[0].path, "/account/close");
    }

    #[tokio::test]
    async fn close_account_accepts_empty_success_body() {
        let transport = Arc::new(MockTransport::new().respond_text(200, ""));
        let store = SessionStore::new(Arc::new(MemoryStore::new()));
        store.set_session_id("s-1");
        store.set_labels(crate::models::LabelGroup::UserFocus, &["career".to_string()]);
        let identity = Arc::new(StaticIdentity::new(Some(user_token()), Some("acc".into())));
        let profile = ProfileClient::new(
            Arc::new(ApiClient::new(transport, identity.clone())),
            store.clone(),
        );

        profile
            .close_account("delete my account and all data", "jess", "pw")
            .await
            .unwrap();

        assert_eq!(store.session_id(), None);
        assert!(store.labels().user_focus_labels.is_empty());
        assert!(!identity.fetch_session().await.unwrap().is_authenticated());
    }

    #[tokio::test]
    async fn feedback_accepts_non_json_success_body() {
        let transport = Arc::new(MockTransport::new().respond_text(200, "OK"));
        let profile = client(transport.clone());
        profile.submit_feedback("great", Some("jess"), None).await.unwrap();
        assert_eq!(transport.requests()[0].path, "/feedback");
    }

    #[tokio::test]
    async fn email_prefs_normalize_email_and_skip_auth() {
        let transport = Arc::new(
            MockTransport::new()
                .respond_enveloped(200, json!({"global_unsubscribed": true}))
                .respond_text(200, ""),
        );
        let profile = client(transport.clone());

        let out = profile
            .email_prefs(EmailPrefsOp::Unsubscribe, " Jess@Example.COM ", "123", "tok")
            .await
            .unwrap();
        assert_eq!(out, json!({"global_unsubscribed": true}));
        let req = &transport.requests()[0];
        assert_eq!(req.path, "/email_prefs/unsubscribe");
        assert_eq!(req.bearer, None);
        assert_eq!(req.body.as_ref().unwrap()["email"], json!("jess@example.com"));

        let out = profile
            .email_prefs(EmailPrefsOp::Status, "jess@example.com", "123", "tok")
            .await
            .unwrap();
        assert_eq!(out, json!({}));
    }
}
