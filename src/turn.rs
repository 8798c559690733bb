use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use crate::api::{ApiClient, Auth};
use crate::auth::TokenKind;
use crate::error::{KininError, Result};
use crate::models::{
    AccessBlocked, ChatEntry, LabelGroups, Progress, TurnPayload, TurnRequest, UiState,
    normalize_labels,
};
use crate::poller::{PollerState, StatusObserver, StatusPoller};
use crate::store::SessionStore;
use crate::transport::ApiRequest;

/// Client-held view of the interview, as a renderer would read it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InterviewState {
    pub session_id: Option<String>,
    pub journey_version: Option<String>,
    pub labels: LabelGroups,
    pub ui_state: Option<UiState>,
    /// Last progress that carried a numeric percent
    pub last_progress: Option<Progress>,
    pub chat: Vec<ChatEntry>,
    pub access_blocked: Option<AccessBlocked>,
    /// Dismissible top-level error banner
    pub error: Option<String>,
    pub busy: bool,
}

impl InterviewState {
    pub fn progress_for_display(&self) -> Progress {
        self.ui_state
            .as_ref()
            .and_then(|s| s.progress.clone())
            .or_else(|| self.last_progress.clone())
            .unwrap_or_else(Progress::zero)
    }

    fn set_ui_state(&mut self, ui_state: UiState) {
        if let Some(progress) = &ui_state.progress {
            if progress.percent.is_some() {
                self.last_progress = Some(progress.clone());
            }
        }
        self.ui_state = Some(ui_state);
    }
}

/// Idempotency token for a single send; the server dedupes retries by it.
pub fn client_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Applies server-pushed state to the in-memory view and the durable store.
#[derive(Clone)]
struct StateSync {
    state: Arc<Mutex<InterviewState>>,
    store: SessionStore,
}

impl StateSync {
    fn lock(&self) -> MutexGuard<'_, InterviewState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn merge_journey_version(&self, state: &mut InterviewState, version: Option<String>) {
        if let Some(version) = version {
            self.store.set_journey_version(&version);
            state.journey_version = Some(version);
        }
    }

    fn merge_labels(&self, state: &mut InterviewState, payload: &TurnPayload) {
        for (group, values) in payload.labels.groups() {
            if let Some(values) = values {
                let labels = normalize_labels(values);
                self.store.set_labels(group, &labels);
                state.labels.set(group, labels);
            }
        }
    }

    fn merge_ui_state(&self, state: &mut InterviewState, ui_state: UiState) {
        if let Some(mode) = ui_state.mode {
            self.store.set_mode(mode);
        }
        state.set_ui_state(ui_state);
    }

    /// Merges a turn response. Returns the session id after the merge.
    fn apply_turn(&self, state: &mut InterviewState, payload: &TurnPayload) -> Option<String> {
        let returned = payload.session_id.clone().filter(|s| !s.is_empty());
        if let Some(new_id) = returned {
            if state.session_id.as_deref() != Some(new_id.as_str()) {
                info!(session_id = %new_id, "Session assigned");
                self.store.set_session_id(&new_id);
                state.session_id = Some(new_id);
            }
        }
        self.merge_journey_version(state, payload.display_journey_version());
        self.merge_labels(state, payload);
        if let Some(ui_state) = payload.ui_state.clone() {
            self.merge_ui_state(state, ui_state);
        }
        state.session_id.clone()
    }

    /// Merges a status refresh: only UI state, journey version and labels.
    fn apply_status(&self, state: &mut InterviewState, payload: &TurnPayload) {
        if let Some(ui_state) = payload.ui_state.clone() {
            self.merge_journey_version(state, ui_state.display_journey_version());
            self.merge_ui_state(state, ui_state);
        }
        self.merge_labels(state, payload);
    }
}

impl StatusObserver for StateSync {
    fn on_status(&self, payload: &TurnPayload) {
        let mut state = self.lock();
        self.apply_status(&mut state, payload);
    }
}

/// Drives the `/turn` endpoint and keeps [`InterviewState`] current.
pub struct TurnClient {
    api: Arc<ApiClient>,
    sync: StateSync,
    poller: StatusPoller,
}

impl TurnClient {
    pub fn new(
        api: Arc<ApiClient>,
        store: SessionStore,
        poll_interval: Duration,
        poll_max_ticks: Option<u32>,
    ) -> Self {
        let initial = InterviewState {
            session_id: store.session_id(),
            journey_version: store.journey_version(),
            labels: store.labels(),
            ..Default::default()
        };
        let sync = StateSync {
            state: Arc::new(Mutex::new(initial)),
            store,
        };
        let poller = StatusPoller::new(
            api.clone(),
            Arc::new(sync.clone()),
            poll_interval,
            poll_max_ticks,
        );
        Self { api, sync, poller }
    }

    /// Snapshot of the current interview view
    pub fn state(&self) -> InterviewState {
        self.sync.lock().clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.sync.lock().session_id.clone()
    }

    pub fn poller_state(&self) -> PollerState {
        self.poller.state()
    }

    /// Waits for the current status polling run to end.
    pub async fn polling_finished(&self) {
        self.poller.finished().await;
    }

    pub fn stop_polling(&self) {
        self.poller.stop();
    }

    pub fn dismiss_error(&self) {
        self.sync.lock().error = None;
    }

    fn begin(&self) -> Option<String> {
        let mut state = self.sync.lock();
        state.error = None;
        state.busy = true;
        state.session_id.clone()
    }

    /// Records a failure in the view: access-blocked switches to the
    /// restricted state, anything else becomes the banner.
    fn fail<T>(&self, err: KininError) -> Result<T> {
        let mut state = self.sync.lock();
        state.busy = false;
        match &err {
            KininError::AccessBlocked(blocked) => {
                info!(reason = %blocked.reason, "Access blocked");
                state.access_blocked = Some(blocked.clone());
            }
            other => state.error = other.banner_message(),
        }
        Err(err)
    }

    async fn post_turn(&self, request: &TurnRequest) -> Result<TurnPayload> {
        let body = serde_json::to_value(request)?;
        // Message sends carry an idempotency key, so a connection retry is safe
        let req = ApiRequest::post("/turn", body).retry_safe(request.client_request_id.is_some());
        self.api.call_as(req, Auth::Required(TokenKind::Id)).await
    }

    fn maybe_poll(&self, session_id: Option<String>) {
        if let Some(session_id) = session_id {
            self.poller.start(&session_id);
        }
    }

    /// Opens (or resumes) the interview and fetches the assistant's intro.
    pub async fn start_session(&self) -> Result<TurnPayload> {
        let session_id = self.begin();
        let request = TurnRequest::start(session_id);
        let payload = match self.post_turn(&request).await {
            Ok(payload) => payload,
            Err(e) => return self.fail(e),
        };

        let current = {
            let mut state = self.sync.lock();
            state.busy = false;
            state.access_blocked = None;
            let current = self.sync.apply_turn(&mut state, &payload);
            if let Some(intro) = &payload.assistant {
                state.chat = vec![ChatEntry::assistant(intro.clone())];
            }
            current
        };
        info!(session_id = ?current, "Interview session started");
        self.maybe_poll(current);
        Ok(payload)
    }

    /// Sends one user message. Blank messages are ignored and return `None`.
    pub async fn send_turn(&self, message: &str) -> Result<Option<TurnPayload>> {
        let message = message.trim();
        if message.is_empty() {
            self.sync.lock().error = None;
            return Ok(None);
        }

        let session_id = self.begin();
        let request = TurnRequest::message(session_id, message.to_string(), client_request_id());
        debug!(client_request_id = ?request.client_request_id, "Sending turn");
        let payload = match self.post_turn(&request).await {
            Ok(payload) => payload,
            Err(e) => return self.fail(e),
        };

        let current = {
            let mut state = self.sync.lock();
            state.busy = false;
            state.access_blocked = None;
            let current = self.sync.apply_turn(&mut state, &payload);
            state.chat.push(ChatEntry::user(message));
            if let Some(reply) = &payload.assistant {
                state.chat.push(ChatEntry::assistant(reply.clone()));
            }
            current
        };
        self.maybe_poll(current);
        Ok(Some(payload))
    }

    /// Closes the interview session. Polling stops and the transcript clears.
    pub async fn end_session(&self) -> Result<TurnPayload> {
        let session_id = self.begin();
        let request = TurnRequest::end(session_id);
        let payload = match self.post_turn(&request).await {
            Ok(payload) => payload,
            Err(e) => return self.fail(e),
        };

        self.poller.stop();
        let mut state = self.sync.lock();
        state.busy = false;
        state.access_blocked = None;
        let next = payload.session_id.clone().unwrap_or_default();
        self.sync.store.set_session_id(&next);
        state.session_id = Some(next).filter(|s| !s.is_empty());
        self.sync
            .merge_journey_version(&mut state, payload.display_journey_version());
        self.sync.merge_labels(&mut state, &payload);
        state.chat.clear();
        state.ui_state = None;
        info!("Interview session ended");
        Ok(payload)
    }

    /// One-shot status refresh outside the polling loop. No-op without a session.
    pub async fn refresh_status(&self) -> Result<()> {
        let Some(session_id) = self.session_id() else {
            return Ok(());
        };
        let req = ApiRequest::get("/turn/status").query("session_id", &session_id);
        match self
            .api
            .call_as::<TurnPayload>(req, Auth::Required(TokenKind::Access))
            .await
        {
            Ok(payload) => {
                let mut state = self.sync.lock();
                self.sync.apply_status(&mut state, &payload);
                Ok(())
            }
            Err(e) => self.fail(e),
        }
    }

    /// Stops polling, signs out and clears the transcript.
    pub async fn logout(&self) -> Result<()> {
        self.poller.stop();
        {
            let mut state = self.sync.lock();
            state.error = None;
            state.access_blocked = None;
            state.chat.clear();
        }
        self.api.identity().sign_out().await
    }

    /// Forgets everything tied to a deleted account.
    pub(crate) fn reset_after_account_closed(&self) {
        self.poller.stop();
        self.sync.store.clear_account();
        let mut state = self.sync.lock();
        *state = InterviewState::default();
    }
}
