//! Message-bus capability boundary.
//!
//! The bus is an unordered, at-least-once transport: [`MessageBus::publish`]
//! resolves only once the bus has durably accepted the message, and a
//! delivered envelope stays in the redelivery set until its [`AckToken`] is
//! consumed with an acknowledgement. Any conforming implementation (the
//! in-memory [`MemoryBus`] for tests and demos, a broker client in
//! production) is substitutable.

mod memory;

pub use memory::*;

use async_trait::async_trait;
use calcbus_wire::{Envelope, Result};
use tokio::sync::{mpsc, oneshot};

/// An at-least-once message transport with named channels.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Sends `envelope` on `channel`, resolving with the bus-assigned
    /// message id only after durable acceptance. No fire-and-forget.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus refuses or fails to accept the message.
    /// No retry is attempted here; retry policy belongs to the caller.
    async fn publish(&self, channel: &str, envelope: Envelope) -> Result<String>;

    /// Attaches the consumer for `channel` and returns its delivery stream.
    ///
    /// Messages published before the consumer attached are delivered once
    /// it does. The stream ends (yields `None`) only when the bus itself
    /// goes away.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel cannot be subscribed to, e.g.
    /// because it already has a consumer.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Delivery>>;
}

/// One handed-over envelope plus its delivery metadata.
#[derive(Debug)]
pub struct Delivery {
    pub envelope: Envelope,
    /// Bus-assigned id, for telemetry only. Correlation between request and
    /// result legs is via the calculation id inside the payload.
    pub message_id: String,
    /// 1-based delivery attempt counter.
    pub attempt: u32,
    /// Single-use acknowledgement handle for exactly this delivery.
    pub ack: AckToken,
}

/// What the consumer decided about a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckOutcome {
    Ack,
    Nack,
}

/// Single-use handle acknowledging one delivery.
///
/// Consuming the token with [`AckToken::ack`] removes the message from the
/// bus's redelivery set; [`AckToken::nack`] (or dropping the token without
/// acknowledging, e.g. on a panic mid-handler) leaves it there, and the bus
/// redelivers per its backoff policy.
#[derive(Debug)]
pub struct AckToken {
    outcome: Option<oneshot::Sender<AckOutcome>>,
}

impl AckToken {
    pub(crate) fn new(outcome: oneshot::Sender<AckOutcome>) -> Self {
        Self {
            outcome: Some(outcome),
        }
    }

    /// Marks the delivery as successfully processed.
    pub fn ack(mut self) {
        if let Some(outcome) = self.outcome.take() {
            let _ = outcome.send(AckOutcome::Ack);
        }
    }

    /// Explicitly requests redelivery.
    pub fn nack(mut self) {
        if let Some(outcome) = self.outcome.take() {
            let _ = outcome.send(AckOutcome::Nack);
        }
    }
}
