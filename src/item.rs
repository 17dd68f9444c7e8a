//! Work item envelope for the intake pipeline
//!
//! A `WorkItem` is the universal unit of work: an opaque payload plus a
//! stable identity key. The key is derived from content once at creation
//! and never mutated, which is what makes idempotent intake enforceable.
//!
//! # Zero-Copy Design
//!
//! Payloads use `Bytes`, so cloning an item for fan-out to multiple
//! handlers only bumps a refcount.

use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// A unit of externally-sourced work flowing through the pipeline
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use intake_core::item::WorkItem;
///
/// let item = WorkItem::new("upwork", "opportunity.discovered", Bytes::from(r#"{"id": 1}"#));
/// assert_eq!(item.source, "upwork");
/// assert!(!item.key.is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct WorkItem {
    /// Stable identity key, derived from content at creation
    pub key: String,

    /// Origin identifier (e.g., scraper name, connector ID)
    pub source: String,

    /// User-defined kind (e.g., "opportunity.discovered")
    pub kind: String,

    /// Headers and context (propagated through the pipeline)
    pub metadata: HashMap<String, String>,

    /// Opaque payload - the pipeline never interprets it
    pub payload: Bytes,

    /// Unix timestamp in nanoseconds, set at creation
    pub submitted_at: i64,
}

impl WorkItem {
    /// Create a new item with a content-derived identity key
    ///
    /// The key is a SHA-256 over source, kind, and payload, so the same
    /// logical item always hashes to the same key regardless of when or
    /// how often it is discovered.
    pub fn new(source: impl Into<String>, kind: impl Into<String>, payload: Bytes) -> Self {
        let source = source.into();
        let kind = kind.into();
        let key = derive_key(&source, &kind, &payload);
        Self {
            key,
            source,
            kind,
            metadata: HashMap::new(),
            payload,
            submitted_at: chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0),
        }
    }

    /// Create an item with an explicit identity key
    ///
    /// Use this when the producer already has a canonical reference
    /// (a listing URL, an upstream event ID) that identifies the item
    /// better than a payload hash would.
    pub fn with_key(
        key: impl Into<String>,
        source: impl Into<String>,
        kind: impl Into<String>,
        payload: Bytes,
    ) -> Self {
        Self {
            key: key.into(),
            source: source.into(),
            kind: kind.into(),
            metadata: HashMap::new(),
            payload,
            submitted_at: chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0),
        }
    }

    /// Add metadata to the item
    ///
    /// # Example
    /// ```
    /// use bytes::Bytes;
    /// use intake_core::item::WorkItem;
    ///
    /// let item = WorkItem::new("src", "evt", Bytes::new())
    ///     .with_metadata("tenant", "acme");
    /// ```
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Get payload as a string slice (if valid UTF-8)
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Get payload length in bytes
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

/// Derive a stable identity key from item content
///
/// Truncated to 16 hex chars: collisions within a 72-hour seen-window
/// are negligible at that width and the shorter keys keep the
/// idempotency set compact.
pub fn derive_key(source: &str, kind: &str, payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update(b":");
    hasher.update(kind.as_bytes());
    hasher.update(b":");
    hasher.update(payload);
    hex::encode(&hasher.finalize()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_creation() {
        let payload = Bytes::from(r#"{"listing": 123}"#);
        let item = WorkItem::new("upwork", "opportunity.discovered", payload.clone());

        assert!(!item.key.is_empty());
        assert!(item.submitted_at > 0);
        assert_eq!(item.source, "upwork");
        assert_eq!(item.kind, "opportunity.discovered");
        assert_eq!(item.payload, payload);
    }

    #[test]
    fn test_key_is_stable_for_same_content() {
        let a = WorkItem::new("src", "evt", Bytes::from("body"));
        let b = WorkItem::new("src", "evt", Bytes::from("body"));
        assert_eq!(a.key, b.key);
    }

    #[test]
    fn test_key_differs_across_content() {
        let a = WorkItem::new("src", "evt", Bytes::from("body-1"));
        let b = WorkItem::new("src", "evt", Bytes::from("body-2"));
        let c = WorkItem::new("other", "evt", Bytes::from("body-1"));
        assert_ne!(a.key, b.key);
        assert_ne!(a.key, c.key);
    }

    #[test]
    fn test_explicit_key() {
        let item = WorkItem::with_key("listing-42", "upwork", "evt", Bytes::new());
        assert_eq!(item.key, "listing-42");
    }

    #[test]
    fn test_item_with_metadata() {
        let item = WorkItem::new("src", "evt", Bytes::new())
            .with_metadata("trace_id", "abc-123")
            .with_metadata("tenant", "acme");

        assert_eq!(item.metadata.get("trace_id"), Some(&"abc-123".to_string()));
        assert_eq!(item.metadata.get("tenant"), Some(&"acme".to_string()));
    }

    #[test]
    fn test_zero_copy_clone() {
        let original = Bytes::from(vec![0u8; 10000]);
        let item = WorkItem::new("src", "evt", original.clone());
        let cloned = item.clone();

        // Bytes uses Arc internally, so both share the same allocation
        assert_eq!(item.payload.as_ptr(), cloned.payload.as_ptr());
    }

    #[test]
    fn test_payload_str() {
        let json = WorkItem::new("src", "evt", Bytes::from(r#"{"valid": "json"}"#));
        assert_eq!(json.payload_str(), Some(r#"{"valid": "json"}"#));

        let binary = WorkItem::new("src", "evt", Bytes::from(vec![0xFF, 0xFE]));
        assert!(binary.payload_str().is_none());
    }
}
