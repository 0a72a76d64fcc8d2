//! Consumer side of a bus channel.
//!
//! A [`Subscriber`] owns the long-lived consumption loop for one channel:
//! Listening → Handling → Listening, with a terminal Stopped state on
//! explicit shutdown or when the bus goes away. Each delivered envelope is
//! handled on its own task (bounded by `max_inflight`), so one slow or
//! failing message never blocks the rest of the channel.
//!
//! Per delivery the loop extracts the propagated trace context, starts a
//! consumer span continuing the producer's trace, decodes the payload, and
//! invokes the registered [`JobHandler`]. The outcome decides the fate of
//! the envelope:
//!
//! | outcome                    | envelope                                  |
//! |----------------------------|-------------------------------------------|
//! | `Ok`                       | acked, `processed` span event             |
//! | `Err(Transient)`           | left unacked; the bus redelivers          |
//! | `Err(Permanent)` / decode  | acked and routed to the dead-letter channel |
//!
//! The consumer span ends on every exit path.

use crate::bus::{Delivery, MessageBus};
use crate::publisher::MESSAGING_SYSTEM_NAME;
use crate::telemetry::Telemetry;
use async_trait::async_trait;
use calcbus_wire::{CalculationJob, Envelope, Error, HandlerError, Result, dead_letter_channel};
use core::time::Duration;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use opentelemetry_semantic_conventions::attribute as semconv;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Semaphore, mpsc};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

/// The business step invoked for each decoded job.
///
/// Handlers must be safe under concurrent invocation for different
/// calculation ids; deliveries on one channel are processed concurrently.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Processes one decoded job within the delivery's trace context.
    ///
    /// # Errors
    ///
    /// The [`HandlerError`] classification decides whether the envelope is
    /// redelivered or dead-lettered; see the module docs.
    async fn handle(&self, cx: &Context, job: CalculationJob)
    -> core::result::Result<(), HandlerError>;
}

/// Tuning knobs for one subscriber loop.
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Maximum deliveries handled concurrently on this channel.
    pub max_inflight: usize,
    /// Upper bound on the in-flight drain wait during graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            max_inflight: 16,
            shutdown_timeout: Duration::from_secs(3),
        }
    }
}

/// Handle to a running per-channel consumption loop.
pub struct Subscriber {
    channel: String,
    shutdown: CancellationToken,
    inflight: Arc<AtomicUsize>,
    shutdown_timeout: Duration,
}

impl Subscriber {
    /// Subscribes to `channel` and spawns the consumption loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus refuses the subscription.
    pub async fn spawn<H: JobHandler>(
        bus: Arc<dyn MessageBus>,
        channel: impl Into<String>,
        handler: H,
        telemetry: Arc<Telemetry>,
        config: SubscriberConfig,
    ) -> Result<Self> {
        let channel = channel.into();
        let rx = bus.subscribe(&channel).await?;
        let shutdown = CancellationToken::new();
        let inflight = Arc::new(AtomicUsize::new(0));

        tokio::spawn(run_loop(
            bus,
            channel.clone(),
            Arc::new(handler),
            telemetry,
            rx,
            shutdown.clone(),
            Arc::clone(&inflight),
            config.max_inflight,
        ));

        Ok(Self {
            channel,
            shutdown,
            inflight,
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    /// The channel this subscriber consumes.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Deliveries currently being handled.
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    /// Gracefully stops the loop: no new deliveries are accepted, then
    /// in-flight handler invocations are drained up to the configured
    /// timeout. An interrupted handler would leave its envelope neither
    /// acknowledged nor failed, so in-flight work is never cancelled.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let drained = timeout(self.shutdown_timeout, async {
            while self.inflight.load(Ordering::Acquire) > 0 {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await;

        match drained {
            Ok(()) => {
                tracing::debug!(channel = %self.channel, "subscriber drained");
            }
            Err(_) => {
                tracing::warn!(
                    channel = %self.channel,
                    inflight = self.inflight(),
                    "subscriber drain timed out"
                );
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop<H: JobHandler>(
    bus: Arc<dyn MessageBus>,
    channel: String,
    handler: Arc<H>,
    telemetry: Arc<Telemetry>,
    mut rx: mpsc::Receiver<Delivery>,
    shutdown: CancellationToken,
    inflight: Arc<AtomicUsize>,
    max_inflight: usize,
) {
    let limiter = Arc::new(Semaphore::new(max_inflight));
    tracing::debug!(%channel, "subscriber listening");

    loop {
        let permit = tokio::select! {
            () = shutdown.cancelled() => break,
            permit = Arc::clone(&limiter).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let delivery = tokio::select! {
            () = shutdown.cancelled() => break,
            delivery = rx.recv() => match delivery {
                Some(delivery) => delivery,
                None => {
                    tracing::warn!(%channel, "bus closed the channel, stopping subscriber");
                    break;
                }
            },
        };

        inflight.fetch_add(1, Ordering::AcqRel);
        let bus = Arc::clone(&bus);
        let channel = channel.clone();
        let handler = Arc::clone(&handler);
        let telemetry = Arc::clone(&telemetry);
        let inflight = Arc::clone(&inflight);
        tokio::spawn(async move {
            handle_delivery(bus, &channel, handler, telemetry, delivery).await;
            inflight.fetch_sub(1, Ordering::AcqRel);
            drop(permit);
        });
    }

    tracing::debug!(%channel, "subscriber stopped");
}

async fn handle_delivery<H: JobHandler>(
    bus: Arc<dyn MessageBus>,
    channel: &str,
    handler: Arc<H>,
    telemetry: Arc<Telemetry>,
    delivery: Delivery,
) {
    let Delivery {
        envelope,
        message_id,
        attempt,
        ack,
    } = delivery;

    let parent = telemetry.extract_context(envelope.attributes());
    let tracer = telemetry.tracer();
    let span = tracer
        .span_builder(format!("{channel} process"))
        .with_kind(SpanKind::Consumer)
        .with_attributes([
            KeyValue::new(semconv::MESSAGING_SYSTEM, MESSAGING_SYSTEM_NAME),
            KeyValue::new(semconv::MESSAGING_DESTINATION_NAME, channel.to_owned()),
            KeyValue::new(semconv::MESSAGING_OPERATION_TYPE, "process"),
            KeyValue::new(semconv::MESSAGING_MESSAGE_ID, message_id.clone()),
        ])
        .start_with_context(tracer, &parent);
    let cx = parent.with_span(span);

    let outcome = match CalculationJob::decode(envelope.payload()) {
        Ok(job) => handler.handle(&cx, job).await,
        Err(err) => Err(HandlerError::Permanent(err)),
    };

    match outcome {
        Ok(()) => {
            cx.span().add_event("processed", vec![]);
            ack.ack();
        }
        Err(HandlerError::Permanent(err)) => {
            tracing::error!(
                %channel,
                %message_id,
                attempt,
                error = %err,
                "message is unprocessable, dead-lettering"
            );
            let span = cx.span();
            span.record_error(&err);
            span.set_status(Status::error(err.to_string()));
            if let Err(dlq_err) = dead_letter(&*bus, channel, envelope, &err).await {
                tracing::error!(%channel, %message_id, error = %dlq_err, "dead-letter publish failed");
            }
            ack.ack();
        }
        Err(HandlerError::Transient(err)) => {
            tracing::warn!(
                %channel,
                %message_id,
                attempt,
                error = %err,
                "handler failed, leaving message for redelivery"
            );
            let span = cx.span();
            span.record_error(&err);
            span.set_status(Status::error(err.to_string()));
            ack.nack();
        }
    }

    cx.span().end();
}

/// Re-publishes a permanently failing envelope on the channel's dead-letter
/// channel, original attributes (trace context included) riding along so the
/// held message stays correlatable.
async fn dead_letter(
    bus: &dyn MessageBus,
    channel: &str,
    mut envelope: Envelope,
    err: &Error,
) -> Result<()> {
    envelope
        .attributes_mut()
        .insert("dead-letter.reason".to_owned(), err.to_string());
    envelope
        .attributes_mut()
        .insert("dead-letter.source-channel".to_owned(), channel.to_owned());
    bus.publish(&dead_letter_channel(channel), envelope)
        .await
        .map(|_| ())
}
