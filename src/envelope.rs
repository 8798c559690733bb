//! Decoding of proxy-style response envelopes.
//!
//! The API sits behind a gateway that sometimes wraps the real JSON payload
//! as a string under a `body` key. Every response goes through
//! [`decode_envelope`] before it reaches typed code.

use serde_json::Value;
use thiserror::Error;

use crate::error::{KininError, Result};
use crate::models::AccessBlocked;

const ACCESS_BLOCKED: &str = "access_blocked";

/// A body that failed to decode at some level; keeps the raw text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed response body: {raw}")]
pub struct DecodeError {
    pub raw: String,
}

/// Parses `text` as JSON and unwraps a string-typed `body` field if present.
pub fn decode_envelope(text: &str) -> std::result::Result<Value, DecodeError> {
    let fail = || DecodeError {
        raw: text.to_string(),
    };
    let outer: Value = serde_json::from_str(text).map_err(|_| fail())?;
    match outer.get("body") {
        Some(Value::String(inner)) => serde_json::from_str(inner).map_err(|_| fail()),
        _ => Ok(outer),
    }
}

/// Turns a status code and body text into a decoded payload or a typed failure.
///
/// 403 responses whose payload says `access_blocked` are classified before any
/// generic error handling.
pub fn classify_response(status: u16, text: &str) -> Result<Value> {
    let decoded = decode_envelope(text);

    if (200..300).contains(&status) {
        return decoded.map_err(|e| KininError::Decode(e.raw));
    }

    if status == 403 {
        if let Ok(payload) = &decoded {
            if payload.get("error").and_then(|v| v.as_str()) == Some(ACCESS_BLOCKED) {
                return Err(KininError::AccessBlocked(AccessBlocked::from_payload(
                    payload,
                )));
            }
        }
    }

    let detail = match decoded {
        Ok(payload) => payload.to_string(),
        Err(_) => text.to_string(),
    };
    Err(KininError::Api { status, detail })
}
