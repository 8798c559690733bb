//! Operator endpoints: user lookup, transcripts, feedback, invites,
//! entitlements, token metrics and user purge.
//!
//! Every call authenticates with the access token, whose group claims the
//! API checks. The list helpers (`sort_turns`, `filter_feedback`,
//! `filter_invites`, `parse_bulk_lines`) are pure and run client-side.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, Auth};
use crate::auth::{TokenKind, decode_jwt_claims, groups_claim};
use crate::error::{KininError, Result};
use crate::models::{
    deserialize_lenient_bool, deserialize_lenient_f64, deserialize_lenient_number,
    deserialize_null_default,
};
use crate::store::SessionStore;
use crate::transport::ApiRequest;

/// Page size the admin list endpoints are asked for
pub const PAGE_LIMIT: u32 = 50;
/// Invite source tag recorded by the API
pub const INVITE_SOURCE: &str = "admin_crm_ui";
const DEFAULT_FEEDBACK_DAYS: i64 = 7;
/// Keeps the cutoff inside chrono's representable range
const MAX_FEEDBACK_DAYS: i64 = 1_000_000;
const DEFAULT_METRICS_DAYS: i64 = 30;

/// One page of a paginated admin listing
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct Page<T> {
    #[serde(default = "Vec::new", deserialize_with = "deserialize_null_default")]
    pub items: Vec<T>,
    /// Opaque cursor; pass back as `start_key` to continue
    #[serde(default)]
    pub next_start_key: Option<Value>,
}

impl<T> Page<T> {
    pub fn has_more(&self) -> bool {
        self.next_start_key.as_ref().is_some_and(|k| !k.is_null())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserMatch {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JourneyStep {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JourneyOverview {
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub steps: Vec<JourneyStep>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JourneyOverview {
    /// Steps tallied by status; a step without one counts as `unknown`.
    pub fn status_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for step in &self.steps {
            let status = step
                .status
                .as_deref()
                .filter(|s| !s.is_empty())
                .unwrap_or("unknown");
            *counts.entry(status.to_string()).or_insert(0) += 1;
        }
        counts
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TurnRecord {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(rename = "ts#session_id#turn_id", default)]
    pub sort_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FeedbackRecord {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl FeedbackRecord {
    fn created_at_ms(&self) -> Option<i64> {
        parse_timestamp_ms(self.created_at.as_deref()?)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InviteMetadata {
    #[serde(default)]
    pub first_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InviteRecord {
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub email: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub access_status: Option<String>,
    #[serde(default)]
    pub email_status: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub metadata: Option<InviteMetadata>,
}

impl InviteRecord {
    pub fn first_name(&self) -> Option<&str> {
        self.metadata.as_ref()?.first_name.as_deref()
    }

    /// `access_status`, falling back to the legacy `status` field
    pub fn effective_status(&self) -> Option<&str> {
        self.access_status
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.status.as_deref())
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct InviteResult {
    #[serde(default, deserialize_with = "deserialize_lenient_bool")]
    pub invite_existed: bool,
    #[serde(default, deserialize_with = "deserialize_lenient_bool")]
    pub email_sent: bool,
}

/// A single `email[,first_name]` row of a bulk invite paste
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkInvite {
    pub email: String,
    pub first_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedBulk {
    pub items: Vec<BulkInvite>,
    pub invalid: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkAddReport {
    pub created: usize,
    pub updated: usize,
    pub emails_sent: usize,
    /// `(email, error message)` per failed add
    pub failed: Vec<(String, String)>,
    pub invalid: Vec<String>,
}

impl BulkAddReport {
    pub fn summary(&self) -> String {
        let mut out = format!("Bulk complete. Created: {}.", self.created);
        if self.updated > 0 {
            out.push_str(&format!(" Updated existing: {}.", self.updated));
        }
        out.push_str(&format!(" Emails sent: {}.", self.emails_sent));
        if !self.failed.is_empty() {
            out.push_str(&format!(" Failed: {}.", self.failed.len()));
        }
        if !self.invalid.is_empty() {
            out.push_str(&format!(" Invalid lines: {}.", self.invalid.len()));
        }
        out
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Entitlement {
    #[serde(default)]
    pub target_user_id: Option<String>,
    #[serde(default)]
    pub access_state: Option<String>,
    #[serde(default)]
    pub plan_state: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TokenTotals {
    #[serde(default, deserialize_with = "deserialize_lenient_number")]
    pub input_tokens: f64,
    #[serde(default, deserialize_with = "deserialize_lenient_number")]
    pub output_tokens: f64,
    #[serde(default, deserialize_with = "deserialize_lenient_number")]
    pub total_tokens: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DayTokens {
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub day_utc: String,
    #[serde(flatten)]
    pub tokens: TokenTotals,
    #[serde(default, deserialize_with = "deserialize_lenient_f64")]
    pub running_avg_tokens_per_day: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TokenMetrics {
    #[serde(default, deserialize_with = "deserialize_lenient_f64")]
    pub range_days: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_lenient_f64")]
    pub active_days: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub totals: TokenTotals,
    #[serde(default, deserialize_with = "deserialize_lenient_f64")]
    pub avg_tokens_per_day: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_lenient_f64")]
    pub avg_tokens_per_active_day: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub day_series: Vec<DayTokens>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub agent_breakdown: Vec<Value>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub model_breakdown: Vec<Value>,
}

impl TokenMetrics {
    pub fn max_daily_tokens(&self) -> f64 {
        self.day_series
            .iter()
            .map(|d| d.tokens.total_tokens)
            .fold(0.0, f64::max)
    }
}

/// Decoded (unverified) claims of the current tokens
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenClaims {
    pub id: Option<Map<String, Value>>,
    pub access: Option<Map<String, Value>>,
}

impl TokenClaims {
    pub fn groups(&self) -> Vec<String> {
        self.access
            .as_ref()
            .or(self.id.as_ref())
            .map(groups_claim)
            .unwrap_or_default()
    }
}

pub struct AdminClient {
    api: Arc<ApiClient>,
    store: SessionStore,
}

impl AdminClient {
    pub fn new(api: Arc<ApiClient>, store: SessionStore) -> Self {
        Self { api, store }
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        debug!("Admin call {}", path);
        self.api
            .call(ApiRequest::post(path, body), Auth::Required(TokenKind::Access))
            .await
    }

    /// Last user id the operator worked with, restored across sessions
    pub fn remembered_user_id(&self) -> Option<String> {
        self.store.admin_user_id()
    }

    /// Remembers a lookup match as the working user
    pub fn select_user(&self, user: &UserMatch) {
        self.store
            .set_admin_user_id(user.sub.as_deref().unwrap_or_default());
    }

    pub async fn lookup_user(
        &self,
        username: Option<&str>,
        email: Option<&str>,
    ) -> Result<Vec<UserMatch>> {
        let username = non_blank(username);
        let email = non_blank(email);
        if username.is_none() && email.is_none() {
            return Err(KininError::Validation(
                "username or email required".to_string(),
            ));
        }
        let mut body = Map::new();
        if let Some(u) = username {
            body.insert("username".into(), json!(u));
        }
        if let Some(e) = email {
            body.insert("email".into(), json!(e));
        }
        let payload = self.post("/admin/lookup_user", Value::Object(body)).await?;
        match payload.get("matches") {
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(m) => Ok(serde_json::from_value(m.clone())?),
        }
    }

    pub async fn journey_overview(&self, target_user_id: &str) -> Result<JourneyOverview> {
        let target = required(target_user_id, "target_user_id")?;
        self.store.set_admin_user_id(target);
        let payload = self
            .post(
                "/admin/get_user_journey_overview",
                json!({"target_user_id": target}),
            )
            .await?;
        Ok(serde_json::from_value(payload)?)
    }

    pub async fn list_user_turns(
        &self,
        target_user_id: &str,
        session_id: Option<&str>,
        start_key: Option<&Value>,
    ) -> Result<Page<TurnRecord>> {
        let target = required(target_user_id, "target_user_id")?;
        let mut body = json!({"target_user_id": target, "limit": PAGE_LIMIT});
        if let Some(sid) = non_blank(session_id) {
            body["session_id"] = json!(sid);
        }
        if let Some(key) = start_key {
            body["start_key"] = key.clone();
        }
        let payload = self.post("/admin/list_user_turns", body).await?;
        Ok(serde_json::from_value(payload)?)
    }

    /// Lists feedback and records the newest `created_at` as the last-seen
    /// marker.
    pub async fn list_feedback(
        &self,
        user_id: Option<&str>,
        start_key: Option<&Value>,
    ) -> Result<Page<FeedbackRecord>> {
        let mut body = json!({"limit": PAGE_LIMIT});
        if let Some(uid) = non_blank(user_id) {
            body["user_id"] = json!(uid);
        }
        if let Some(key) = start_key {
            body["start_key"] = key.clone();
        }
        let payload = self.post("/admin/list_feedback", body).await?;
        let page: Page<FeedbackRecord> = serde_json::from_value(payload)?;

        if let Some(newest) = page.items.iter().filter_map(FeedbackRecord::created_at_ms).max() {
            let seen = self.store.feedback_last_seen_ms().unwrap_or(0);
            self.store.set_feedback_last_seen_ms(newest.max(seen));
        }
        Ok(page)
    }

    pub async fn list_invites(
        &self,
        status: Option<&str>,
        start_key: Option<&Value>,
    ) -> Result<Page<InviteRecord>> {
        let mut body = json!({"limit": PAGE_LIMIT});
        if let Some(s) = non_blank(status) {
            body["status"] = json!(s);
        }
        if let Some(key) = start_key {
            body["start_key"] = key.clone();
        }
        let payload = self.post("/admin/invites/list", body).await?;
        Ok(serde_json::from_value(payload)?)
    }

    /// Creates or updates an invite. The API reports whether the address was
    /// already invited and whether an email went out.
    pub async fn add_invite(
        &self,
        email: &str,
        first_name: Option<&str>,
        note: Option<&str>,
        send_email: bool,
    ) -> Result<InviteResult> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(KininError::Validation("email required".to_string()));
        }
        let mut body = json!({
            "email": email,
            "send_email": send_email,
            "source": INVITE_SOURCE,
        });
        if let Some(name) = non_blank(first_name) {
            body["first_name"] = json!(name);
        }
        if let Some(note) = non_blank(note) {
            body["note"] = json!(note);
        }
        let payload = self.post("/admin/invites/add", body).await?;
        Ok(serde_json::from_value(payload)?)
    }

    /// Re-sends the invite email, keeping the stored first name and note
    pub async fn resend_invite(&self, invite: &InviteRecord) -> Result<InviteResult> {
        self.add_invite(
            &invite.email,
            invite.first_name(),
            invite.note.as_deref(),
            true,
        )
        .await
    }

    /// Blocks the address for new signups
    pub async fn revoke_invite(&self, email: &str) -> Result<()> {
        let email = required(email, "email")?;
        self.api
            .call_unit(
                ApiRequest::post("/admin/invites/revoke", json!({"email": email})),
                Auth::Required(TokenKind::Access),
            )
            .await?;
        info!("Revoked invite for {}", email);
        Ok(())
    }

    /// Adds every valid row of a bulk paste, one request per address.
    ///
    /// Individual failures are collected in the report instead of aborting
    /// the batch.
    pub async fn bulk_add_invites(
        &self,
        raw: &str,
        note: Option<&str>,
        send_email: bool,
    ) -> Result<BulkAddReport> {
        let parsed = parse_bulk_lines(raw);
        if parsed.items.is_empty() {
            return Err(KininError::Validation(
                "Enter one email per line. Optionally use: email,first_name".to_string(),
            ));
        }

        let mut report = BulkAddReport {
            invalid: parsed.invalid,
            ..Default::default()
        };
        for row in &parsed.items {
            match self
                .add_invite(&row.email, row.first_name.as_deref(), note, send_email)
                .await
            {
                Ok(result) => {
                    if result.invite_existed {
                        report.updated += 1;
                    } else {
                        report.created += 1;
                    }
                    if result.email_sent {
                        report.emails_sent += 1;
                    }
                }
                Err(e) => {
                    warn!("Bulk invite for {} failed: {}", row.email, e);
                    report.failed.push((row.email.clone(), e.to_string()));
                }
            }
        }
        info!("{}", report.summary());
        Ok(report)
    }

    pub async fn get_entitlement(&self, target_user_id: &str) -> Result<Entitlement> {
        let target = required(target_user_id, "target_user_id")?;
        let payload = self
            .post("/admin/entitlements/get", json!({"target_user_id": target}))
            .await?;
        Ok(serde_json::from_value(payload)?)
    }

    pub async fn set_entitlement(
        &self,
        target_user_id: &str,
        access_state: &str,
        plan_state: &str,
    ) -> Result<Entitlement> {
        let target = required(target_user_id, "target_user_id")?;
        let access_state = required(access_state, "access_state")?;
        let plan_state = required(plan_state, "plan_state")?;
        let payload = self
            .post(
                "/admin/entitlements/set",
                json!({
                    "target_user_id": target,
                    "access_state": access_state,
                    "plan_state": plan_state,
                }),
            )
            .await?;
        Ok(serde_json::from_value(payload)?)
    }

    pub async fn user_token_metrics(
        &self,
        target_user_id: &str,
        start_day_utc: &str,
        end_day_utc: &str,
    ) -> Result<TokenMetrics> {
        let target = required(target_user_id, "target_user_id")?;
        self.store.set_admin_user_id(target);
        let payload = self
            .post(
                "/admin/metrics/user_tokens",
                json!({
                    "target_user_id": target,
                    "start_day_utc": start_day_utc.trim(),
                    "end_day_utc": end_day_utc.trim(),
                }),
            )
            .await?;
        Ok(serde_json::from_value(payload)?)
    }

    pub async fn global_token_metrics(
        &self,
        start_day_utc: &str,
        end_day_utc: &str,
    ) -> Result<TokenMetrics> {
        let payload = self
            .post(
                "/admin/metrics/global_tokens",
                json!({
                    "start_day_utc": start_day_utc.trim(),
                    "end_day_utc": end_day_utc.trim(),
                }),
            )
            .await?;
        Ok(serde_json::from_value(payload)?)
    }

    /// Permanently removes a user and their data. The operator's password is
    /// re-checked server-side.
    pub async fn purge_user(&self, target_user_id: &str, password: &str) -> Result<Value> {
        let target = required(target_user_id, "target_user_id")?;
        if password.trim().is_empty() {
            return Err(KininError::Validation(
                "admin password required".to_string(),
            ));
        }
        let payload = self
            .post(
                "/admin/purge_user",
                json!({"target_user_id": target, "password": password}),
            )
            .await?;
        warn!("Purged user {}", target);
        Ok(payload)
    }

    /// Claims of the current ID and access tokens, for display only
    pub async fn token_claims(&self) -> Result<TokenClaims> {
        let session = self.api.identity().fetch_session().await?;
        Ok(TokenClaims {
            id: session.id_token.as_deref().and_then(decode_jwt_claims),
            access: session.access_token.as_deref().and_then(decode_jwt_claims),
        })
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn required<'a>(value: &'a str, field: &str) -> Result<&'a str> {
    non_blank(Some(value)).ok_or_else(|| KininError::Validation(format!("{field} required")))
}

fn normalize_email(value: &str) -> String {
    value.trim().to_lowercase()
}

fn parse_timestamp_ms(raw: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp_millis());
    }
    // Dates without an offset are read as UTC
    if let Ok(dt) = raw.parse::<chrono::NaiveDateTime>() {
        return Some(dt.and_utc().timestamp_millis());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
}

/// Splits a pasted block into invite rows: one `email[,first_name]` per
/// line, emails lower-cased, duplicates dropped, malformed lines collected.
pub fn parse_bulk_lines(raw: &str) -> ParsedBulk {
    let mut parsed = ParsedBulk::default();
    let mut seen = HashSet::new();

    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.split(',').map(str::trim);
        let email = normalize_email(parts.next().unwrap_or_default());
        let first_name = parts.next().filter(|n| !n.is_empty()).map(str::to_string);

        if email.is_empty() || !email.contains('@') {
            parsed.invalid.push(trimmed.to_string());
            continue;
        }
        if !seen.insert(email.clone()) {
            continue;
        }
        parsed.items.push(BulkInvite { email, first_name });
    }
    parsed
}

/// Case-insensitive substring match across email, status, email status,
/// note and first name. A blank query keeps everything.
pub fn filter_invites<'a>(invites: &'a [InviteRecord], query: &str) -> Vec<&'a InviteRecord> {
    let q = query.trim().to_lowercase();
    invites
        .iter()
        .filter(|invite| {
            if q.is_empty() {
                return true;
            }
            [
                Some(invite.email.as_str()),
                invite.effective_status(),
                invite.email_status.as_deref(),
                invite.note.as_deref(),
                invite.first_name(),
            ]
            .into_iter()
            .flatten()
            .any(|field| field.to_lowercase().contains(&q))
        })
        .collect()
}

fn role_rank(role: Option<&str>) -> u8 {
    match role {
        Some("user") => 0,
        Some("assistant") => 1,
        _ => 2,
    }
}

fn compare_turns(a: &TurnRecord, b: &TurnRecord) -> Ordering {
    let ta = a.timestamp.as_deref().filter(|t| !t.is_empty());
    let tb = b.timestamp.as_deref().filter(|t| !t.is_empty());
    // Undated turns go last so the ordering stays total
    let by_time = match (ta, tb) {
        (Some(x), Some(y)) => x.cmp(y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_time
        .then_with(|| role_rank(a.role.as_deref()).cmp(&role_rank(b.role.as_deref())))
        .then_with(|| {
            a.sort_key
                .as_deref()
                .unwrap_or_default()
                .cmp(b.sort_key.as_deref().unwrap_or_default())
        })
}

/// Transcript order: timestamp (undated last), then user before assistant,
/// then sort key
pub fn sort_turns(turns: &mut [TurnRecord]) {
    turns.sort_by(compare_turns);
}

/// Keeps feedback newer than `days` and, when `user_filter` is non-blank,
/// from that user only. Records whose date cannot be parsed are kept.
///
/// Only `0` falls back to the 7-day default. A negative window puts the
/// cutoff in the future, so only undated records survive it.
pub fn filter_feedback<'a>(
    items: &'a [FeedbackRecord],
    days: i64,
    user_filter: Option<&str>,
    now: DateTime<Utc>,
) -> Vec<&'a FeedbackRecord> {
    let days = match days {
        0 => DEFAULT_FEEDBACK_DAYS,
        d => d.clamp(-MAX_FEEDBACK_DAYS, MAX_FEEDBACK_DAYS),
    };
    let cutoff = (now - ChronoDuration::days(days)).timestamp_millis();
    let user = non_blank(user_filter);

    items
        .iter()
        .filter(|item| item.created_at_ms().is_none_or(|ms| ms >= cutoff))
        .filter(|item| user.is_none_or(|u| item.user_id.as_deref() == Some(u)))
        .collect()
}

/// Default metrics window: the 30 UTC days ending `today`, inclusive
pub fn default_metrics_range(today: NaiveDate) -> (String, String) {
    let start = today - ChronoDuration::days(DEFAULT_METRICS_DAYS - 1);
    (
        start.format("%Y-%m-%d").to_string(),
        today.format("%Y-%m-%d").to_string(),
    )
}
