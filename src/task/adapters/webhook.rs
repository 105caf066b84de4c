//! Parser for status webhook payloads.
//!
//! A payload carries `messages` (a list), a single `message`, or a single
//! `status`. Only the account's own status posts with photo or video media
//! become events; everything else is dropped.

use crate::task::domain::{MediaKind, NormalizedEvent};
use serde_json::{Map, Value};
use thiserror::Error;

/// Source name recorded on events parsed here.
pub const WEBHOOK_SOURCE: &str = "webhook";

/// Errors raised while decoding a webhook body.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// The body is not valid JSON.
    #[error("webhook body is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    /// The body is JSON but not an object.
    #[error("webhook body must be a JSON object")]
    NotAnObject,
}

/// Decodes a raw webhook body and extracts its events.
///
/// # Errors
///
/// Returns [`WebhookError`] when the body is not a JSON object.
pub fn parse_payload(body: &[u8]) -> Result<Vec<NormalizedEvent>, WebhookError> {
    let payload: Value = serde_json::from_slice(body)?;
    let object = payload.as_object().ok_or(WebhookError::NotAnObject)?;
    Ok(extract_events(object))
}

/// Extracts relayable status events from a decoded payload.
#[must_use]
pub fn extract_events(payload: &Map<String, Value>) -> Vec<NormalizedEvent> {
    messages(payload)
        .into_iter()
        .filter(|message| is_from_me(message) && is_status(message))
        .filter_map(to_event)
        .collect()
}

fn messages(payload: &Map<String, Value>) -> Vec<&Map<String, Value>> {
    if let Some(list) = payload.get("messages").and_then(Value::as_array) {
        return list.iter().filter_map(Value::as_object).collect();
    }
    ["message", "status"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_object))
        .into_iter()
        .collect()
}

fn is_from_me(message: &Map<String, Value>) -> bool {
    if let Some(flag) = ["from_me", "fromMe"]
        .iter()
        .find_map(|key| message.get(*key))
    {
        return truthy(flag);
    }
    ["from", "author"]
        .iter()
        .find_map(|key| message.get(*key).and_then(Value::as_str))
        .is_some_and(|sender| matches!(sender.to_ascii_lowercase().as_str(), "me" | "self"))
}

fn is_status(message: &Map<String, Value>) -> bool {
    let status_label = |key: &str| {
        message
            .get(key)
            .and_then(Value::as_str)
            .is_some_and(|label| matches!(label, "status" | "story"))
    };
    status_label("type")
        || status_label("chat_type")
        || ["is_status", "isStatus"]
            .iter()
            .any(|key| message.get(*key).is_some_and(truthy))
}

fn to_event(message: &Map<String, Value>) -> Option<NormalizedEvent> {
    let (remote_id, url) = media_reference(message);
    if remote_id.is_none() && url.is_none() {
        return None;
    }
    Some(NormalizedEvent::Media {
        source: WEBHOOK_SOURCE.to_owned(),
        source_id: first_string(message, &["id", "status_id"]),
        kind: media_kind(message)?,
        remote_id,
        url,
        caption: first_string(message, &["caption", "text"]),
    })
}

fn media_reference(message: &Map<String, Value>) -> (Option<String>, Option<String>) {
    ["media", "file", "data", "image", "video"]
        .iter()
        .find_map(|key| message.get(*key).and_then(Value::as_object))
        .map_or((None, None), |media| {
            (
                first_string(media, &["id", "media_id"]),
                first_string(media, &["url", "link"]),
            )
        })
}

fn media_kind(message: &Map<String, Value>) -> Option<MediaKind> {
    if message.get("video").is_some_and(Value::is_object) {
        return Some(MediaKind::Video);
    }
    if message.get("image").is_some_and(Value::is_object) {
        return Some(MediaKind::Photo);
    }
    ["type", "media_type"]
        .iter()
        .find_map(|key| message.get(*key).and_then(Value::as_str))
        .and_then(MediaKind::from_label)
}

fn first_string(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match object.get(*key)? {
        Value::String(text) if !text.trim().is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    })
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(number) => !matches!(number.to_string().as_str(), "0" | "0.0" | "-0.0"),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
        Value::Null => false,
    }
}
