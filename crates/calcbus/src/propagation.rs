//! Carrier adapters for trace-context propagation over envelope attributes.
//!
//! The bus envelope's string attribute map is the carrier: the propagator
//! writes its keys (`traceparent`, `tracestate`, `baggage`) next to whatever
//! domain metadata the message already carries, and reads them back on the
//! consuming side. Unrelated keys are never touched, and extraction
//! tolerates both missing trace keys (a fresh trace starts downstream) and
//! unknown extra keys.

use opentelemetry::propagation::{Extractor, Injector};
use std::collections::HashMap;

/// Writes propagated trace keys into an envelope attribute map.
pub struct AttributeInjector<'a>(pub &'a mut HashMap<String, String>);

impl Injector for AttributeInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_owned(), value);
    }
}

/// Reads propagated trace keys back out of an envelope attribute map.
pub struct AttributeExtractor<'a>(pub &'a HashMap<String, String>);

impl Extractor for AttributeExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}
