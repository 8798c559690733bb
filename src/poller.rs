//! Turn-status polling.
//!
//! After a turn request the server keeps evaluating the conversation in the
//! background. [`StatusPoller`] re-fetches `/turn/status` on a fixed interval
//! until the server reports `processing: false`, the run is stopped, or a
//! newer run supersedes it.
//!
//! Each run gets a monotonically increasing id and its own
//! [`CancellationToken`]. Starting a run bumps the id and cancels the previous
//! token under the same lock a tick holds while delivering its payload, so a
//! superseded run can never deliver a snapshot after its successor started.
//!
//! Any number of callers may wait on [`StatusPoller::finished`]; every
//! waiter is woken when the current run leaves [`PollerState::Polling`].

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::{ApiClient, Auth};
use crate::auth::TokenKind;
use crate::error::Result;
use crate::models::TurnPayload;
use crate::transport::ApiRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Polling,
    Converged,
    Cancelled,
    /// Stopped after the configured tick ceiling
    Exhausted,
}

/// Where status snapshots come from
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch_status(&self, session_id: &str) -> Result<TurnPayload>;
}

#[async_trait]
impl StatusSource for ApiClient {
    async fn fetch_status(&self, session_id: &str) -> Result<TurnPayload> {
        let req = ApiRequest::get("/turn/status").query("session_id", session_id);
        self.call_as(req, Auth::Required(TokenKind::Access)).await
    }
}

/// Receives snapshots from the current run. Called with the poller lock held,
/// so implementations must not call back into the poller.
pub trait StatusObserver: Send + Sync {
    fn on_status(&self, payload: &TurnPayload);
}

struct RunSlot {
    run_id: u64,
    state: PollerState,
    cancel: Option<CancellationToken>,
}

struct Shared {
    slot: Mutex<RunSlot>,
    done: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RunSlot> {
        // A panicking observer must not wedge the poller
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct StatusPoller {
    source: Arc<dyn StatusSource>,
    observer: Arc<dyn StatusObserver>,
    interval: Duration,
    max_ticks: Option<u32>,
    shared: Arc<Shared>,
}

impl StatusPoller {
    pub fn new(
        source: Arc<dyn StatusSource>,
        observer: Arc<dyn StatusObserver>,
        interval: Duration,
        max_ticks: Option<u32>,
    ) -> Self {
        Self {
            source,
            observer,
            interval,
            max_ticks,
            shared: Arc::new(Shared {
                slot: Mutex::new(RunSlot {
                    run_id: 0,
                    state: PollerState::Idle,
                    cancel: None,
                }),
                done: Notify::new(),
            }),
        }
    }

    pub fn state(&self) -> PollerState {
        self.shared.lock().state
    }

    pub fn current_run(&self) -> u64 {
        self.shared.lock().run_id
    }

    /// Starts a new run for `session_id`, superseding any previous run.
    ///
    /// Must be called from within a tokio runtime. Returns the new run id.
    pub fn start(&self, session_id: &str) -> u64 {
        let mut slot = self.shared.lock();
        if let Some(previous) = slot.cancel.take() {
            previous.cancel();
        }
        slot.run_id += 1;
        let run_id = slot.run_id;
        let token = CancellationToken::new();
        slot.cancel = Some(token.clone());
        slot.state = PollerState::Polling;

        let run = PollRun {
            run_id,
            session_id: session_id.to_string(),
            token,
            source: Arc::clone(&self.source),
            observer: Arc::clone(&self.observer),
            shared: Arc::clone(&self.shared),
            interval: self.interval,
            max_ticks: self.max_ticks,
        };
        tokio::spawn(run.run());
        debug!(run_id, session_id, "Status polling started");
        run_id
    }

    /// Cancels the current run, if any.
    pub fn stop(&self) {
        let mut slot = self.shared.lock();
        if let Some(token) = slot.cancel.take() {
            token.cancel();
            slot.state = PollerState::Cancelled;
            debug!(run_id = slot.run_id, "Status polling stopped");
        }
        drop(slot);
        self.shared.done.notify_waiters();
    }

    /// Waits until no run is polling. Returns at once when idle; a run
    /// started while waiting is waited for too.
    pub async fn finished(&self) {
        loop {
            let notified = self.shared.done.notified();
            tokio::pin!(notified);
            // Register before checking so a finish in between is not missed
            notified.as_mut().enable();
            if self.state() != PollerState::Polling {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

struct PollRun {
    run_id: u64,
    session_id: String,
    token: CancellationToken,
    source: Arc<dyn StatusSource>,
    observer: Arc<dyn StatusObserver>,
    shared: Arc<Shared>,
    interval: Duration,
    max_ticks: Option<u32>,
}

impl PollRun {
    /// Marks the run finished if it is still the current one.
    fn finish(&self, slot: &mut RunSlot, state: PollerState) {
        if slot.run_id == self.run_id {
            slot.state = state;
            slot.cancel = None;
        }
    }

    async fn run(self) {
        let mut ticks: u32 = 0;
        loop {
            ticks += 1;
            let outcome = tokio::select! {
                biased;
                _ = self.token.cancelled() => return,
                res = self.source.fetch_status(&self.session_id) => res,
            };

            match outcome {
                Ok(payload) => {
                    let mut slot = self.shared.lock();
                    if slot.run_id != self.run_id || self.token.is_cancelled() {
                        return;
                    }
                    self.observer.on_status(&payload);
                    if payload.processing_finished() {
                        self.finish(&mut slot, PollerState::Converged);
                        info!(run_id = self.run_id, ticks, "Turn processing finished");
                        return;
                    }
                }
                Err(e) => {
                    // Transient failures never end the run
                    debug!(run_id = self.run_id, tick = ticks, "Status poll failed: {}", e);
                }
            }

            if let Some(max) = self.max_ticks {
                if ticks >= max {
                    let mut slot = self.shared.lock();
                    self.finish(&mut slot, PollerState::Exhausted);
                    info!(run_id = self.run_id, ticks, "Status polling gave up at tick ceiling");
                    return;
                }
            }

            tokio::select! {
                biased;
                _ = self.token.cancelled() => return,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

impl Drop for PollRun {
    fn drop(&mut self) {
        {
            let mut slot = self.shared.lock();
            if slot.run_id == self.run_id && slot.state == PollerState::Polling {
                // Task ended without reaching a verdict (aborted or panicked)
                slot.state = PollerState::Cancelled;
                slot.cancel = None;
            }
        }
        self.shared.done.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KininError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    fn payload(session: &str, processing: bool) -> TurnPayload {
        serde_json::from_value(json!({
            "session_id": session,
            "ui_state": {"processing": processing}
        }))
        .unwrap()
    }

    /// Reports `processing: true` until call `finish_on`, failing on `fail_on`
    struct ScriptedSource {
        calls: Mutex<Vec<(String, Instant)>>,
        finish_on: usize,
        fail_on: Option<usize>,
        latency: Duration,
    }

    impl ScriptedSource {
        fn new(finish_on: usize) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                finish_on,
                fail_on: None,
                latency: Duration::ZERO,
            }
        }

        fn calls(&self) -> Vec<(String, Instant)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StatusSource for ScriptedSource {
        async fn fetch_status(&self, session_id: &str) -> Result<TurnPayload> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                calls.push((session_id.to_string(), Instant::now()));
                calls.len()
            };
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            if self.fail_on == Some(n) {
                return Err(KininError::Api {
                    status: 502,
                    detail: "Bad Gateway".to_string(),
                });
            }
            Ok(payload(session_id, n < self.finish_on))
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl StatusObserver for Recorder {
        fn on_status(&self, payload: &TurnPayload) {
            self.seen
                .lock()
                .unwrap()
                .push(payload.session_id.clone().unwrap_or_default());
        }
    }

    fn poller(source: Arc<ScriptedSource>, recorder: Arc<Recorder>, max: Option<u32>) -> StatusPoller {
        StatusPoller::new(source, recorder, Duration::from_secs(1), max)
    }

    #[tokio::test(start_paused = true)]
    async fn converges_after_exactly_n_ticks() {
        let source = Arc::new(ScriptedSource::new(4));
        let recorder = Arc::new(Recorder::default());
        let poller = poller(source.clone(), recorder.clone(), None);

        poller.start("s1");
        poller.finished().await;

        let calls = source.calls();
        assert_eq!(calls.len(), 4);
        for pair in calls.windows(2) {
            assert!(pair[1].1 - pair[0].1 >= Duration::from_secs(1));
        }
        assert_eq!(recorder.seen().len(), 4);
        assert_eq!(poller.state(), PollerState::Converged);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.calls().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_failures_are_swallowed() {
        let source = Arc::new(ScriptedSource {
            fail_on: Some(2),
            ..ScriptedSource::new(3)
        });
        let recorder = Arc::new(Recorder::default());
        let poller = poller(source.clone(), recorder.clone(), None);

        poller.start("s1");
        poller.finished().await;

        assert_eq!(source.calls().len(), 3);
        assert_eq!(recorder.seen().len(), 2);
        assert_eq!(poller.state(), PollerState::Converged);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_run_supersedes_older_one() {
        let source = Arc::new(ScriptedSource {
            latency: Duration::from_millis(500),
            ..ScriptedSource::new(usize::MAX)
        });
        let recorder = Arc::new(Recorder::default());
        let poller = poller(source.clone(), recorder.clone(), Some(5));

        let first = poller.start("old");
        tokio::time::sleep(Duration::from_millis(1700)).await;
        let seen_before = recorder.seen().len();
        let second = poller.start("new");
        assert!(second > first);

        poller.finished().await;

        let seen = recorder.seen();
        assert!(seen[..seen_before].iter().all(|s| s == "old"));
        assert!(seen[seen_before..].iter().all(|s| s == "new"));
        assert_eq!(seen[seen_before..].len(), 5);
        assert_eq!(poller.state(), PollerState::Exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_tick() {
        let source = Arc::new(ScriptedSource::new(usize::MAX));
        let recorder = Arc::new(Recorder::default());
        let poller = poller(source.clone(), recorder.clone(), None);

        poller.start("s1");
        tokio::time::sleep(Duration::from_millis(2500)).await;
        poller.stop();
        let calls = source.calls().len();
        assert_eq!(poller.state(), PollerState::Cancelled);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.calls().len(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_ceiling_ends_the_run() {
        let source = Arc::new(ScriptedSource::new(usize::MAX));
        let recorder = Arc::new(Recorder::default());
        let poller = poller(source.clone(), recorder.clone(), Some(3));

        poller.start("s1");
        poller.finished().await;
        assert_eq!(source.calls().len(), 3);
        assert_eq!(poller.state(), PollerState::Exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn every_waiter_sees_the_run_finish() {
        let source = Arc::new(ScriptedSource::new(3));
        let poller = poller(source.clone(), Arc::new(Recorder::default()), None);

        poller.start("s1");
        let waits = async {
            tokio::join!(poller.finished(), poller.finished(), poller.finished());
            poller.state()
        };
        let state = tokio::time::timeout(Duration::from_secs(60), waits)
            .await
            .unwrap();
        assert_eq!(state, PollerState::Converged);
        assert_eq!(source.calls().len(), 3);

        // Waiting again after the run ended returns immediately
        poller.finished().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_wakes_waiters() {
        let source = Arc::new(ScriptedSource::new(usize::MAX));
        let poller = Arc::new(poller(source, Arc::new(Recorder::default()), None));

        poller.start("s1");
        let waiter = {
            let poller = Arc::clone(&poller);
            tokio::spawn(async move {
                poller.finished().await;
                poller.state()
            })
        };
        tokio::time::sleep(Duration::from_millis(2500)).await;
        poller.stop();

        let state = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, PollerState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn loose_status_payload_still_converges() {
        use crate::auth::StaticIdentity;
        use crate::transport::mock::MockTransport;

        let transport = Arc::new(MockTransport::new().respond_enveloped(
            200,
            json!({
                "session_id": null,
                "ui_state": {
                    "processing": false,
                    "covered_fields": null,
                    "uncovered_fields": ["age", 7],
                    "progress": {"complete_steps": 2.0, "total_steps": null, "percent": "25"},
                    "panel": {"unknown": true}
                },
                "user_focus_labels": null
            }),
        ));
        let api = Arc::new(ApiClient::new(
            transport.clone(),
            Arc::new(StaticIdentity::new(Some("id".into()), Some("acc".into()))),
        ));
        let recorder = Arc::new(Recorder::default());
        let poller = StatusPoller::new(api, recorder.clone(), Duration::from_secs(1), Some(5));

        poller.start("s1");
        poller.finished().await;

        assert_eq!(poller.state(), PollerState::Converged);
        assert_eq!(transport.requests().len(), 1);
        assert_eq!(recorder.seen().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_cancels_the_run() {
        let source = Arc::new(ScriptedSource::new(usize::MAX));
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let poller = poller(source.clone(), Arc::new(Recorder::default()), None);
            poller.start("s1");
            tokio::time::sleep(Duration::from_millis(1500)).await;
            counter.store(source.calls().len(), Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(source.calls().len(), counter.load(Ordering::SeqCst));
    }
}
