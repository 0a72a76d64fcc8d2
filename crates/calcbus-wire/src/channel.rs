//! Well-known channel names.

/// Channel carrying request-leg messages to the computation stage.
pub const REQUEST_CHANNEL: &str = "calc.requests";

/// Channel carrying result-leg messages back to the record owner.
pub const RESULT_CHANNEL: &str = "calc.results";

/// The holding channel for messages that can never be processed.
///
/// Permanently failing envelopes (unparseable payloads, invalid
/// expressions, unknown record ids, exhausted delivery budgets) are
/// acknowledged on their source channel and re-published here for
/// inspection instead of redelivering forever.
pub fn dead_letter_channel(channel: &str) -> String {
    format!("{channel}.dead-letter")
}
