//! Outbound message envelopes and their metadata.

use crate::error::PublishResult;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// String-keyed metadata carried as wire headers.
///
/// Keys are unique; values are strings or JSON scalars.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(HashMap<String, Value>);

impl Metadata {
    /// Create empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build metadata from string headers.
    pub fn from_headers<I, K, V>(headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            headers
                .into_iter()
                .map(|(k, v)| (k.into(), Value::String(v.into())))
                .collect(),
        )
    }

    /// Set `key` to `value`. Values that serialize to null are skipped.
    pub fn with<T: Serialize>(mut self, key: impl Into<String>, value: T) -> Self {
        match serde_json::to_value(value) {
            Ok(Value::Null) | Err(_) => {}
            Ok(value) => {
                self.0.insert(key.into(), value);
            }
        }
        self
    }

    /// Set `key` to a string value. Empty strings are skipped.
    pub fn add(mut self, key: impl Into<String>, value: &str) -> Self {
        if !value.is_empty() {
            self.0.insert(key.into(), Value::String(value.to_string()));
        }
        self
    }

    /// Typed lookup; `None` if missing or of a different type.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.0
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Lookup rendered as a string.
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.0.get(key).map(render)
    }

    /// Stringified view used as wire headers.
    pub fn to_headers(&self) -> BTreeMap<String, String> {
        self.0.iter().map(|(k, v)| (k.clone(), render(v))).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One outbound unit: an opaque payload, its identifier and metadata.
///
/// Immutable once built. Cloning is how the outbox and the retry queue
/// hold on to an envelope while it is in flight.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    message_id: Uuid,
    message_type: String,
    payload: Vec<u8>,
    metadata: Metadata,
    created_at: DateTime<Utc>,
}

impl Envelope {
    /// Create an envelope from a raw payload with a fresh message id.
    pub fn new(message_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self::with_id(Uuid::new_v4(), message_type, payload)
    }

    /// Create an envelope with a caller-supplied message id.
    pub fn with_id(
        message_id: Uuid,
        message_type: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            message_id,
            message_type: message_type.into(),
            payload: payload.into(),
            metadata: Metadata::new(),
            created_at: Utc::now(),
        }
    }

    /// Serialize a typed message to JSON.
    ///
    /// The type tag is the short Rust type name (`PersonMessage`).
    pub fn for_message<T: Serialize>(message: &T) -> PublishResult<Self> {
        let payload = serde_json::to_vec(message)?;
        Ok(Self::new(short_type_name::<T>(), payload))
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Queue the envelope is routed to: snake_case of the type tag.
    pub fn destination(&self) -> String {
        underscore(&self.message_type)
    }
}

/// Last path segment of a Rust type name, without generic arguments.
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Convert `PascalCase`/`camelCase` to `snake_case`.
pub fn underscore(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c == '-' || c == ' ' {
            out.push('_');
            continue;
        }
        if c.is_uppercase() {
            let prev = i.checked_sub(1).map(|p| chars[p]);
            let next = chars.get(i + 1).copied();
            let boundary = match prev {
                Some(p) if p.is_lowercase() || p.is_ascii_digit() => true,
                Some(p) if p.is_uppercase() => next.is_some_and(|n| n.is_lowercase()),
                _ => false,
            };
            if boundary && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }

    out
}
