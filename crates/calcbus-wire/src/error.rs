//! Error types for the calculation pipeline.
//!
//! This module defines the central `Error` enum shared by every component on
//! both sides of the bus, plus the [`HandlerError`] classification that
//! drives the acknowledgement policy in message handlers.
//!
//! ## Error Cases
//! - `MalformedPayload`: A message payload could not be decoded (or a job
//!   could not be encoded).
//! - `PublishRejected`: The bus refused or failed to durably accept a
//!   published message.
//! - `Channel`: An internal communication failure between tasks.
//! - `ServiceShutdown`: Work arrived while a component was shutting down.
//! - `NotFound`: No calculation record exists for the given id.
//! - `StorageUnavailable`: The record store could not be reached.
//! - `Evaluation`: The evaluator rejected an expression.
//! - `ReservedAttribute`: A domain attribute collided with a trace-context
//!   key.
//! - `Telemetry`: Telemetry pipeline construction or flush failed.

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the calculation pipeline.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// The message payload could not be decoded, or a job could not be
    /// encoded for the wire.
    #[error("Malformed payload: {context}")]
    MalformedPayload { context: String },

    /// The bus did not durably accept the message.
    #[error("Publish to `{channel}` rejected: {context}")]
    PublishRejected { channel: String, context: String },

    /// Internal channel send/receive failure (e.g., closed channel).
    #[error("Channel error: {context}")]
    Channel { context: String },

    /// The component is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,

    /// No calculation record exists for this id.
    #[error("Calculation {id} not found")]
    NotFound { id: u64 },

    /// The record store could not be reached or rejected the operation.
    #[error("Storage unavailable: {context}")]
    StorageUnavailable { context: String },

    /// The evaluator rejected the expression as malformed or unsupported.
    #[error("Cannot evaluate `{expression}`: {reason}")]
    Evaluation { expression: String, reason: String },

    /// A domain attribute used a key reserved for trace propagation.
    #[error("Attribute key `{key}` is reserved for trace context")]
    ReservedAttribute { key: String },

    /// Telemetry pipeline construction or flush failure.
    #[error("Telemetry error: {context}")]
    Telemetry { context: String },
}

/// Failure classification returned by message handlers.
///
/// The variant decides what happens to the delivered envelope:
///
/// - [`Transient`](HandlerError::Transient): redelivery can plausibly
///   succeed (a store outage, a bus hiccup). The message is *not*
///   acknowledged and the bus redelivers it with backoff.
/// - [`Permanent`](HandlerError::Permanent): redelivery can never succeed
///   (an unparseable payload, an invalid expression, an unknown record id).
///   The message is acknowledged and routed to the dead-letter channel.
#[derive(Clone, thiserror::Error, Debug)]
pub enum HandlerError {
    /// A retry may succeed once the underlying condition clears.
    #[error("transient: {0}")]
    Transient(#[source] Error),

    /// No number of retries will make this message processable.
    #[error("permanent: {0}")]
    Permanent(#[source] Error),
}

impl HandlerError {
    /// The underlying pipeline error, regardless of classification.
    pub fn inner(&self) -> &Error {
        match self {
            Self::Transient(err) | Self::Permanent(err) => err,
        }
    }
}
