use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Accepts any JSON value and keeps it only when it is a real boolean.
///
/// The status endpoint is the authority on `processing`; anything other than
/// a literal `true`/`false` is treated as absent.
fn deserialize_strict_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| v.as_bool()))
}

/// Accepts a string or a number and renders it as a string.
fn deserialize_flexible_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

/// Reads `null` like a missing key: the field falls back to its default.
pub(crate) fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn lenient_f64(value: Option<Value>) -> Option<f64> {
    match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|f: &f64| f.is_finite())
}

/// Integer, float, numeric string or `null`; anything unreadable is `None`.
pub(crate) fn deserialize_lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_f64(Option::<Value>::deserialize(deserializer)?))
}

/// Like [`deserialize_lenient_f64`], reading unusable values as zero.
pub(crate) fn deserialize_lenient_number<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(deserialize_lenient_f64(deserializer)?.unwrap_or(0.0))
}

/// Step counters: `2`, `2.0` and `"2"` all read as 2; negatives and junk as 0.
fn deserialize_lenient_count<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(deserialize_lenient_f64(deserializer)?
        .filter(|f| *f >= 0.0)
        .map(|f| f.round() as u64)
        .unwrap_or(0))
}

pub(crate) fn deserialize_lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(deserialize_strict_bool(deserializer)?.unwrap_or(false))
}

/// Keeps the string entries of an array; `null` or a non-array is empty.
fn deserialize_string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    })
}

/// A label group is only present when the server sent an actual array.
fn deserialize_label_array<'de, D>(deserializer: D) -> Result<Option<Vec<Value>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Array(items)) => Some(items),
        _ => None,
    })
}

/// Decodes an optional nested value, dropping it when its shape is wrong.
fn deserialize_lossy<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: serde::de::DeserializeOwned,
{
    Ok(Option::<Value>::deserialize(deserializer)?
        .filter(|v| !v.is_null())
        .and_then(|v| serde_json::from_value(v).ok()))
}

/// Request body for `POST /turn`; the populated discriminator decides the action.
#[derive(Debug, Serialize, Clone, Default, PartialEq)]
pub struct TurnRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_session: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_request_id: Option<String>,
}

impl TurnRequest {
    pub fn start(session_id: Option<String>) -> Self {
        Self {
            session_id,
            start: Some(true),
            ..Default::default()
        }
    }

    pub fn message(session_id: Option<String>, message: String, client_request_id: String) -> Self {
        Self {
            session_id,
            message: Some(message),
            client_request_id: Some(client_request_id),
            ..Default::default()
        }
    }

    pub fn end(session_id: Option<String>) -> Self {
        Self {
            session_id,
            end_session: Some(true),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InterviewMode {
    Guided,
    Freeform,
    Deepdive,
    #[serde(other)]
    Unknown,
}

impl InterviewMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterviewMode::Guided => "guided",
            InterviewMode::Freeform => "freeform",
            InterviewMode::Deepdive => "deepdive",
            InterviewMode::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Progress {
    #[serde(default, deserialize_with = "deserialize_lenient_f64")]
    pub percent: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_lenient_count")]
    pub complete_steps: u64,
    #[serde(default, deserialize_with = "deserialize_lenient_count")]
    pub closed_steps: u64,
    #[serde(default, deserialize_with = "deserialize_lenient_count")]
    pub total_steps: u64,
}

impl Progress {
    pub fn zero() -> Self {
        Self {
            percent: Some(0.0),
            ..Default::default()
        }
    }
}

/// Server-computed interview progress, replaced wholesale on every refresh.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct UiState {
    #[serde(default, deserialize_with = "deserialize_lossy")]
    pub progress: Option<Progress>,
    #[serde(default, deserialize_with = "deserialize_lossy")]
    pub mode: Option<InterviewMode>,
    #[serde(default, deserialize_with = "deserialize_string_list")]
    pub covered_fields: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_string_list")]
    pub uncovered_fields: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_strict_bool")]
    pub processing: Option<bool>,
    #[serde(default, deserialize_with = "deserialize_flexible_string")]
    pub journey_version: Option<String>,
    #[serde(default, deserialize_with = "deserialize_flexible_string")]
    pub journey_version_display: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UiState {
    pub fn display_journey_version(&self) -> Option<String> {
        self.journey_version_display
            .clone()
            .or_else(|| self.journey_version.clone())
    }
}

/// Label arrays the server may push alongside any turn or status response.
///
/// `None` means the response did not carry that group, which leaves the
/// local copy untouched.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct LabelPayload {
    #[serde(default, deserialize_with = "deserialize_label_array")]
    pub user_focus_labels: Option<Vec<Value>>,
    #[serde(default, deserialize_with = "deserialize_label_array")]
    pub user_interest_labels: Option<Vec<Value>>,
    #[serde(default, deserialize_with = "deserialize_label_array")]
    pub must_avoid_topics: Option<Vec<Value>>,
    #[serde(default, deserialize_with = "deserialize_label_array")]
    pub handle_lightly_topics: Option<Vec<Value>>,
}

impl LabelPayload {
    pub fn groups(&self) -> [(LabelGroup, Option<&Vec<Value>>); 4] {
        [
            (LabelGroup::UserFocus, self.user_focus_labels.as_ref()),
            (LabelGroup::UserInterest, self.user_interest_labels.as_ref()),
            (LabelGroup::MustAvoid, self.must_avoid_topics.as_ref()),
            (LabelGroup::HandleLightly, self.handle_lightly_topics.as_ref()),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LabelGroup {
    UserFocus,
    UserInterest,
    MustAvoid,
    HandleLightly,
}

impl LabelGroup {
    pub const ALL: [LabelGroup; 4] = [
        LabelGroup::UserFocus,
        LabelGroup::UserInterest,
        LabelGroup::MustAvoid,
        LabelGroup::HandleLightly,
    ];

    /// Key used both on the wire and in the durable store
    pub fn key(&self) -> &'static str {
        match self {
            LabelGroup::UserFocus => "user_focus_labels",
            LabelGroup::UserInterest => "user_interest_labels",
            LabelGroup::MustAvoid => "must_avoid_topics",
            LabelGroup::HandleLightly => "handle_lightly_topics",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            LabelGroup::UserFocus => "User focus",
            LabelGroup::UserInterest => "User interests",
            LabelGroup::MustAvoid => "Must avoid topics",
            LabelGroup::HandleLightly => "Handle lightly topics",
        }
    }
}

/// Keeps only non-empty trimmed strings.
pub fn normalize_labels(values: &[Value]) -> Vec<String> {
    values
        .iter()
        .filter_map(|v| v.as_str())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Serialize, Clone, Default, PartialEq)]
pub struct LabelGroups {
    pub user_focus_labels: Vec<String>,
    pub user_interest_labels: Vec<String>,
    pub must_avoid_topics: Vec<String>,
    pub handle_lightly_topics: Vec<String>,
}

impl LabelGroups {
    pub fn get(&self, group: LabelGroup) -> &[String] {
        match group {
            LabelGroup::UserFocus => &self.user_focus_labels,
            LabelGroup::UserInterest => &self.user_interest_labels,
            LabelGroup::MustAvoid => &self.must_avoid_topics,
            LabelGroup::HandleLightly => &self.handle_lightly_topics,
        }
    }

    pub fn set(&mut self, group: LabelGroup, labels: Vec<String>) {
        match group {
            LabelGroup::UserFocus => self.user_focus_labels = labels,
            LabelGroup::UserInterest => self.user_interest_labels = labels,
            LabelGroup::MustAvoid => self.must_avoid_topics = labels,
            LabelGroup::HandleLightly => self.handle_lightly_topics = labels,
        }
    }
}

/// Decoded body of `POST /turn` and `GET /turn/status`.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct TurnPayload {
    #[serde(default, deserialize_with = "deserialize_flexible_string")]
    pub session_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_flexible_string")]
    pub assistant: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lossy")]
    pub ui_state: Option<UiState>,
    #[serde(default, deserialize_with = "deserialize_flexible_string")]
    pub journey_version: Option<String>,
    #[serde(default, deserialize_with = "deserialize_flexible_string")]
    pub journey_version_display: Option<String>,
    #[serde(default, deserialize_with = "deserialize_strict_bool")]
    pub processing: Option<bool>,
    #[serde(flatten)]
    pub labels: LabelPayload,
}

impl TurnPayload {
    pub fn display_journey_version(&self) -> Option<String> {
        self.journey_version_display
            .clone()
            .or_else(|| self.journey_version.clone())
    }

    /// True only when the server reports `processing: false`.
    pub fn processing_finished(&self) -> bool {
        let flag = self
            .ui_state
            .as_ref()
            .and_then(|s| s.processing)
            .or(self.processing);
        flag == Some(false)
    }
}

/// Details of a distinguished 403 access-blocked response
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AccessBlocked {
    pub reason: String,
    pub access_state: String,
    pub plan_state: String,
}

impl Default for AccessBlocked {
    fn default() -> Self {
        Self {
            reason: "blocked".to_string(),
            access_state: "blocked".to_string(),
            plan_state: "none".to_string(),
        }
    }
}

impl AccessBlocked {
    /// Builds the blocked state from a decoded error payload, applying defaults
    /// for missing or empty fields.
    pub fn from_payload(payload: &Value) -> Self {
        let field = |name: &str, default: &str| {
            payload
                .get(name)
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .unwrap_or(default)
                .to_string()
        };
        Self {
            reason: field("reason", "blocked"),
            access_state: field("access_state", "blocked"),
            plan_state: field("plan_state", "none"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatEntry {
    pub role: Role,
    pub content: String,
}

impl ChatEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

// Profile
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct BiographyProfile {
    #[serde(default)]
    pub preferred_name: Option<String>,
    #[serde(default)]
    pub age: Option<u32>,
}

#[derive(Debug, Serialize, Clone)]
pub struct FeedbackRequest {
    pub message: String,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Serialize, Clone)]
pub struct CloseAccountRequest {
    pub confirmation: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct EmailPrefsRequest {
    pub email: String,
    pub exp: String,
    pub token: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn turn_request_omits_absent_fields() {
        let req = TurnRequest::start(None);
        assert_eq!(serde_json::to_value(&req).unwrap(), json!({"start": true}));

        let req = TurnRequest::message(Some("s1".into()), "hi".into(), "req-1".into());
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"session_id": "s1", "message": "hi", "client_request_id": "req-1"})
        );
    }

    #[test]
    fn ui_state_tolerates_loose_fields() {
        let state: UiState = serde_json::from_value(json!({
            "progress": {"percent": 40, "complete_steps": 2, "total_steps": 5},
            "mode": "deepdive",
            "processing": "false",
            "journey_version": 3,
            "hint": "keep"
        }))
        .unwrap();
        assert_eq!(state.mode, Some(InterviewMode::Deepdive));
        assert_eq!(state.processing, None);
        assert_eq!(state.journey_version.as_deref(), Some("3"));
        assert_eq!(state.progress.unwrap().percent, Some(40.0));
        assert_eq!(state.extra.get("hint"), Some(&json!("keep")));
    }

    #[test]
    fn status_payload_with_nulls_and_floats_still_decodes() {
        let payload: TurnPayload = serde_json::from_value(json!({
            "session_id": "s1",
            "ui_state": {
                "processing": false,
                "covered_fields": null,
                "uncovered_fields": ["childhood", 7, null],
                "mode": 3,
                "progress": {"percent": "62.5", "complete_steps": 2.0, "closed_steps": null, "total_steps": -1}
            },
            "user_focus_labels": null,
            "must_avoid_topics": "not a list",
            "user_interest_labels": ["music"]
        }))
        .unwrap();

        assert!(payload.processing_finished());
        let ui = payload.ui_state.clone().unwrap();
        assert!(ui.covered_fields.is_empty());
        assert_eq!(ui.uncovered_fields, vec!["childhood"]);
        assert_eq!(ui.mode, None);
        let progress = ui.progress.unwrap();
        assert_eq!(progress.percent, Some(62.5));
        assert_eq!(progress.complete_steps, 2);
        assert_eq!(progress.closed_steps, 0);
        assert_eq!(progress.total_steps, 0);
        assert_eq!(payload.labels.user_focus_labels, None);
        assert_eq!(payload.labels.must_avoid_topics, None);
        assert_eq!(payload.labels.user_interest_labels, Some(vec![json!("music")]));
    }

    #[test]
    fn malformed_ui_state_is_dropped_not_fatal() {
        let payload: TurnPayload = serde_json::from_value(json!({
            "session_id": 42,
            "ui_state": "pending",
            "processing": false
        }))
        .unwrap();
        assert_eq!(payload.session_id.as_deref(), Some("42"));
        assert_eq!(payload.ui_state, None);
        assert!(payload.processing_finished());
    }

    #[test]
    fn unknown_mode_does_not_fail_decode() {
        let state: UiState = serde_json::from_value(json!({"mode": "wander"})).unwrap();
        assert_eq!(state.mode, Some(InterviewMode::Unknown));
    }

    #[test]
    fn processing_finished_prefers_ui_state_flag() {
        let payload: TurnPayload = serde_json::from_value(json!({
            "processing": true,
            "ui_state": {"processing": false}
        }))
        .unwrap();
        assert!(payload.processing_finished());

        let payload: TurnPayload =
            serde_json::from_value(json!({"ui_state": {"percent": 1}})).unwrap();
        assert!(!payload.processing_finished());
    }

    #[test]
    fn labels_are_normalized() {
        let raw = vec![json!("  rust "), json!(""), json!(5), json!("tea")];
        assert_eq!(normalize_labels(&raw), vec!["rust", "tea"]);
    }

    #[test]
    fn access_blocked_defaults_fill_missing_fields() {
        let blocked = AccessBlocked::from_payload(&json!({"error": "access_blocked", "reason": "expired"}));
        assert_eq!(blocked.reason, "expired");
        assert_eq!(blocked.access_state, "blocked");
        assert_eq!(blocked.plan_state, "none");
    }
}
