pub mod admin;
pub mod api;
pub mod auth;
pub mod config;
pub mod envelope;
pub mod error;
pub mod models;
pub mod poller;
pub mod profile;
pub mod store;
pub mod transport;
pub mod turn;

use std::sync::Arc;

use crate::admin::AdminClient;
use crate::api::ApiClient;
use crate::auth::{IdentityProvider, StaticIdentity};
use crate::config::Config;
use crate::error::{KininError, Result};
use crate::profile::ProfileClient;
use crate::store::{FileStore, KeyValueStore, MemoryStore, SessionStore};
use crate::transport::{HttpTransport, Transport};
use crate::turn::TurnClient;

pub use crate::envelope::{classify_response, decode_envelope};
pub use crate::error::KininError as Error;
pub use crate::poller::{PollerState, StatusPoller};
pub use crate::turn::InterviewState;

/// Entry point tying the API clients to one identity, transport and store.
pub struct KininClient {
    store: SessionStore,
    turns: TurnClient,
    profile: ProfileClient,
    admin: AdminClient,
    beta_lite: bool,
}

impl KininClient {
    pub fn new(cfg: &Config) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(
            &cfg.api.base_url,
            cfg.request_timeout(),
        )?);
        let identity = Arc::new(StaticIdentity::from_config(&cfg.auth));

        let store: Arc<dyn KeyValueStore> = match &cfg.store.path {
            Some(path) => Arc::new(FileStore::open(path)?),
            None => Arc::new(MemoryStore::new()),
        };

        tracing::info!(
            "Kinin client ready (api: {}, beta_lite: {})",
            transport.base_url(),
            cfg.api.beta_lite
        );
        Ok(Self::with_parts(transport, identity, store, cfg))
    }

    /// Builds the client around caller-supplied collaborators.
    pub fn with_parts(
        transport: Arc<dyn Transport>,
        identity: Arc<dyn IdentityProvider>,
        store: Arc<dyn KeyValueStore>,
        cfg: &Config,
    ) -> Self {
        let api = Arc::new(ApiClient::new(transport, identity));
        let store = SessionStore::new(store);

        let turns = TurnClient::new(
            Arc::clone(&api),
            store.clone(),
            cfg.poll_interval(),
            cfg.poller.max_ticks,
        );
        let profile = ProfileClient::new(Arc::clone(&api), store.clone());
        let admin = AdminClient::new(api, store.clone());

        Self {
            store,
            turns,
            profile,
            admin,
            beta_lite: cfg.api.beta_lite,
        }
    }

    pub fn turns(&self) -> &TurnClient {
        &self.turns
    }

    pub fn profile(&self) -> &ProfileClient {
        &self.profile
    }

    /// Operator endpoints; unavailable in beta-lite deployments.
    pub fn admin(&self) -> Result<&AdminClient> {
        if self.beta_lite {
            return Err(KininError::Validation(
                "Admin tools are disabled in beta-lite mode".to_string(),
            ));
        }
        Ok(&self.admin)
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Deletes the account and drops every piece of local interview state.
    pub async fn close_account(
        &self,
        confirmation: &str,
        username: &str,
        password: &str,
    ) -> Result<()> {
        self.profile
            .close_account(confirmation, username, password)
            .await?;
        self.turns.reset_after_account_closed();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::test_tokens::user_token;
    use crate::transport::mock::MockTransport;
    use serde_json::json;

    fn client(transport: Arc<MockTransport>, cfg: &Config) -> KininClient {
        KininClient::with_parts(
            transport,
            Arc::new(StaticIdentity::new(Some(user_token()), Some("acc".into()))),
            Arc::new(MemoryStore::new()),
            cfg,
        )
    }

    #[test]
    fn admin_is_gated_by_beta_lite() {
        let mut cfg = Config::default();
        assert!(client(Arc::new(MockTransport::new()), &cfg).admin().is_ok());

        cfg.api.beta_lite = true;
        let err = client(Arc::new(MockTransport::new()), &cfg)
            .admin()
            .err()
            .unwrap();
        assert!(matches!(err, KininError::Validation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn closing_account_resets_interview() {
        let transport = Arc::new(
            MockTransport::new()
                .respond_enveloped(
                    200,
                    json!({"session_id": "s-1", "assistant": "Hello", "processing": false}),
                )
                .respond_enveloped(200, json!({"session_id": "s-1", "processing": false}))
                .respond(200, json!({"deleted": true})),
        );
        let kinin = client(transport.clone(), &Config::default());

        kinin.turns().start_session().await.unwrap();
        kinin.turns().polling_finished().await;
        assert_eq!(kinin.store().session_id().as_deref(), Some("s-1"));

        kinin
            .close_account("delete my account and all data", "jess", "pw")
            .await
            .unwrap();

        assert_eq!(kinin.store().session_id(), None);
        let state = kinin.turns().state();
        assert!(state.chat.is_empty());
        assert_eq!(state.session_id, None);
    }
}
