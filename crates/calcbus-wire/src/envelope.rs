//! The transport unit carried across the message bus.

use crate::{Error, Result};
use bytes::Bytes;
use std::collections::HashMap;

/// Attribute keys reserved for propagated trace context.
///
/// Domain metadata must stay out of this namespace so that injecting a trace
/// context into an envelope can never clobber application keys, and vice
/// versa.
pub const RESERVED_ATTRIBUTE_KEYS: [&str; 3] = ["traceparent", "tracestate", "baggage"];

/// One message on the bus: opaque payload bytes plus a string attribute map.
///
/// The attribute map carries two namespaces side by side: the reserved
/// trace-context keys written by the propagation codec, and free-form domain
/// metadata added via [`Envelope::insert_attribute`]. Delivery metadata (the
/// bus-assigned message id, the delivery attempt, the ack handle) is not
/// part of the envelope; it only exists on the consuming side.
///
/// Correlation between the request and result legs is via the calculation id
/// embedded in the payload, never via bus-level identifiers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    payload: Bytes,
    attributes: HashMap<String, String>,
}

impl Envelope {
    /// Wraps `payload` with an empty attribute map.
    pub fn new(payload: Bytes) -> Self {
        Self {
            payload,
            attributes: HashMap::new(),
        }
    }

    /// The opaque payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// The full attribute map, trace keys included.
    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }

    /// Mutable access to the attribute map.
    ///
    /// This is the entry point for the trace-context codec, which must write
    /// the reserved keys. Domain code should prefer
    /// [`Envelope::insert_attribute`], which enforces the namespace split.
    pub fn attributes_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.attributes
    }

    /// Attaches a domain attribute, rejecting keys reserved for trace
    /// context.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReservedAttribute`] if `key` is one of
    /// [`RESERVED_ATTRIBUTE_KEYS`].
    pub fn insert_attribute(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<()> {
        let key = key.into();
        if Self::is_reserved_key(&key) {
            return Err(Error::ReservedAttribute { key });
        }
        self.attributes.insert(key, value.into());
        Ok(())
    }

    /// Looks up a single attribute by key.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Whether `key` belongs to the trace-context namespace.
    pub fn is_reserved_key(key: &str) -> bool {
        RESERVED_ATTRIBUTE_KEYS.contains(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_attributes_round_trip() {
        let mut envelope = Envelope::new(Bytes::from_static(b"{}"));
        envelope
            .insert_attribute("content-type", "application/json")
            .unwrap();

        assert_eq!(envelope.attribute("content-type"), Some("application/json"));
        assert_eq!(envelope.attribute("missing"), None);
    }

    #[test]
    fn reserved_keys_are_rejected() {
        let mut envelope = Envelope::new(Bytes::new());
        for key in RESERVED_ATTRIBUTE_KEYS {
            let err = envelope.insert_attribute(key, "x").unwrap_err();
            assert!(matches!(err, Error::ReservedAttribute { .. }));
        }
        assert!(envelope.attributes().is_empty());
    }

    #[test]
    fn codec_path_can_write_reserved_keys() {
        let mut envelope = Envelope::new(Bytes::new());
        envelope
            .attributes_mut()
            .insert("traceparent".to_owned(), "00-abc-def-01".to_owned());
        assert_eq!(envelope.attribute("traceparent"), Some("00-abc-def-01"));
    }
}
