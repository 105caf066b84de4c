//! Source-agnostic inbound events and their mapping onto new tasks.

use super::{CorrelationKey, NewTask, PayloadRef, TaskDomainError, TaskKind};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Kind of media carried by a media event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    /// Still image.
    Photo,
    /// Video clip.
    Video,
}

impl MediaKind {
    /// Normalises a source media type label.
    ///
    /// Returns `None` for labels that do not describe publishable media.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "image" | "photo" => Some(Self::Photo),
            "video" | "video/mp4" => Some(Self::Video),
            _ => None,
        }
    }
}

impl From<MediaKind> for TaskKind {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Photo => Self::Photo,
            MediaKind::Video => Self::Video,
        }
    }
}

/// Event produced by an ingestion source after parsing its raw payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NormalizedEvent {
    /// A photo or video to relay.
    Media {
        /// Ingestion source name, such as `webhook` or `bot`.
        source: String,
        /// Identifier assigned by the source, when it has one.
        source_id: Option<String>,
        /// Media kind.
        kind: MediaKind,
        /// Remote media identifier.
        remote_id: Option<String>,
        /// Direct media URL.
        url: Option<String>,
        /// Optional caption.
        caption: Option<String>,
    },
    /// A plain text post.
    Text {
        /// Ingestion source name.
        source: String,
        /// Identifier assigned by the source, when it has one.
        source_id: Option<String>,
        /// Post body.
        text: String,
    },
}

impl NormalizedEvent {
    /// Derives the deduplication key for this event.
    ///
    /// Uses `<source>:<source_id>` when the source supplied an identifier,
    /// otherwise the SHA-256 of the event's canonical JSON form.
    ///
    /// # Errors
    ///
    /// Returns [`TaskDomainError::Canonicalisation`] if the event cannot be
    /// serialised.
    pub fn correlation_key(&self) -> Result<CorrelationKey, TaskDomainError> {
        let (source, source_id) = match self {
            Self::Media {
                source, source_id, ..
            }
            | Self::Text {
                source, source_id, ..
            } => (source, source_id.as_deref()),
        };
        if let Some(id) = source_id.filter(|id| !id.trim().is_empty()) {
            return CorrelationKey::from_source_id(source, id);
        }

        let value = serde_json::to_value(self)
            .map_err(|err| TaskDomainError::Canonicalisation(err.to_string()))?;
        let canonical = canonical_json(&value).to_string();
        let digest = Sha256::digest(canonical.as_bytes());
        Ok(CorrelationKey::from_content_digest(&format!("{digest:x}")))
    }

    /// Validates the event and converts it into a task insert request.
    ///
    /// # Errors
    ///
    /// Returns [`TaskDomainError`] when the payload is empty or the
    /// correlation key cannot be derived.
    pub fn into_new_task(self) -> Result<NewTask, TaskDomainError> {
        let correlation_key = self.correlation_key()?;
        match self {
            Self::Media {
                kind,
                remote_id,
                url,
                caption,
                ..
            } => {
                let payload = PayloadRef::remote(remote_id, url)?;
                Ok(NewTask::new(correlation_key, kind.into(), payload)
                    .with_caption(sanitize_caption(caption)))
            }
            Self::Text { text, .. } => {
                let payload = PayloadRef::inline(text)?;
                Ok(NewTask::new(correlation_key, TaskKind::Text, payload))
            }
        }
    }
}

fn sanitize_caption(caption: Option<String>) -> Option<String> {
    caption
        .map(|text| text.trim().to_owned())
        .filter(|text| !text.is_empty())
}

/// Rebuilds a JSON value with object keys in sorted order.
fn canonical_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                if let Some(inner) = map.get(key) {
                    sorted.insert(key.clone(), canonical_json(inner));
                }
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_json).collect()),
        other => other.clone(),
    }
}
