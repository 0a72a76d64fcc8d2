//! In-memory bus with at-least-once redelivery semantics.
//!
//! Deliberately faithful to a real broker where it matters to the pipeline:
//! publish resolves only once the bus owns the message, unacknowledged
//! deliveries come back after a backoff, and a message whose delivery budget
//! is exhausted is routed to the channel's dead-letter channel instead of
//! redelivering forever.

use super::{AckOutcome, AckToken, Delivery, MessageBus};
use async_trait::async_trait;
use calcbus_wire::{Envelope, Error, Result, dead_letter_channel};
use core::time::Duration;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use uuid::Uuid;

/// Redelivery tuning for the in-memory bus.
#[derive(Debug, Clone)]
pub struct MemoryBusConfig {
    /// Delivery attempts (including the first) before dead-lettering.
    pub max_attempts: u32,
    /// Pause before a redelivery.
    pub redelivery_backoff: Duration,
    /// Capacity of each per-channel delivery queue.
    pub channel_capacity: usize,
}

impl Default for MemoryBusConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            redelivery_backoff: Duration::from_millis(25),
            channel_capacity: 64,
        }
    }
}

#[derive(Default)]
struct ChannelState {
    consumer: Option<mpsc::Sender<Delivery>>,
    /// Messages accepted before (or between) consumers, delivered on
    /// subscribe.
    backlog: Vec<(String, Envelope)>,
}

/// At-least-once, unordered in-memory transport.
///
/// Cloning is cheap; clones share the same channels.
#[derive(Clone)]
pub struct MemoryBus {
    channels: Arc<Mutex<HashMap<String, ChannelState>>>,
    config: MemoryBusConfig,
}

impl MemoryBus {
    pub fn new(config: MemoryBusConfig) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    fn push_backlog(&self, channel: &str, message_id: String, envelope: Envelope) {
        let mut channels = self.channels.lock();
        channels
            .entry(channel.to_owned())
            .or_default()
            .backlog
            .push((message_id, envelope));
    }

    /// Hands one message to the channel's consumer and watches for the
    /// acknowledgement. Nack, a dropped token, and a vanished consumer all
    /// count as "not processed".
    fn deliver(&self, channel: String, message_id: String, envelope: Envelope, attempt: u32) {
        let consumer = {
            let channels = self.channels.lock();
            channels.get(&channel).and_then(|state| state.consumer.clone())
        };
        let Some(consumer) = consumer else {
            self.push_backlog(&channel, message_id, envelope);
            return;
        };

        let bus = self.clone();
        tokio::spawn(async move {
            let (outcome_tx, outcome_rx) = oneshot::channel();
            let delivery = Delivery {
                envelope: envelope.clone(),
                message_id: message_id.clone(),
                attempt,
                ack: AckToken::new(outcome_tx),
            };

            if consumer.send(delivery).await.is_err() {
                // Consumer went away mid-handover; park the message for the
                // next subscriber at its current attempt count.
                bus.push_backlog(&channel, message_id, envelope);
                return;
            }

            match outcome_rx.await {
                Ok(AckOutcome::Ack) => {}
                Ok(AckOutcome::Nack) | Err(_) => {
                    bus.redeliver(channel, message_id, envelope, attempt).await;
                }
            }
        });
    }

    async fn redeliver(&self, channel: String, message_id: String, envelope: Envelope, attempt: u32) {
        if attempt >= self.config.max_attempts {
            tracing::warn!(
                %channel,
                %message_id,
                attempt,
                "delivery budget exhausted, dead-lettering"
            );
            let mut envelope = envelope;
            envelope.attributes_mut().insert(
                "dead-letter.reason".to_owned(),
                format!("delivery budget exhausted after {attempt} attempts"),
            );
            envelope
                .attributes_mut()
                .insert("dead-letter.source-channel".to_owned(), channel.clone());
            self.deliver(dead_letter_channel(&channel), message_id, envelope, 1);
            return;
        }

        sleep(self.config.redelivery_backoff).await;
        self.deliver(channel, message_id, envelope, attempt + 1);
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, channel: &str, envelope: Envelope) -> Result<String> {
        let message_id = Uuid::new_v4().to_string();
        // The bus owns the message from here on: either a consumer exists
        // and delivery starts now, or it waits in the backlog.
        self.deliver(channel.to_owned(), message_id.clone(), envelope, 1);
        Ok(message_id)
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Delivery>> {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let backlog = {
            let mut channels = self.channels.lock();
            let state = channels.entry(channel.to_owned()).or_default();
            if state.consumer.is_some() {
                return Err(Error::Channel {
                    context: format!("channel `{channel}` already has a consumer"),
                });
            }
            state.consumer = Some(tx);
            std::mem::take(&mut state.backlog)
        };

        for (message_id, envelope) in backlog {
            self.deliver(channel.to_owned(), message_id, envelope, 1);
        }

        Ok(rx)
    }
}
