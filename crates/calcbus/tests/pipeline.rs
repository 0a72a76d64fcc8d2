//! End-to-end pipeline tests over the in-memory bus, store, and evaluator.

use async_trait::async_trait;
use bytes::Bytes;
use calcbus::bus::{MemoryBus, MemoryBusConfig, MessageBus};
use calcbus::telemetry::Telemetry;
use calcbus::wire::{
    Calculation, CalculationJob, Envelope, Error, HandlerError, REQUEST_CHANNEL, RESULT_CHANNEL,
    Result, dead_letter_channel,
};
use calcbus::{
    ArithmeticEvaluator, Dispatcher, EvalHandler, Evaluator, JobHandler, MemoryStorage, Publisher,
    ResultHandler, Storage, Subscriber, SubscriberConfig,
};
use core::time::Duration;
use opentelemetry::Context;
use opentelemetry::trace::{TraceContextExt, Tracer};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use tokio::sync::{Notify, mpsc};
use tokio::time::{sleep, timeout};

fn bus_config() -> MemoryBusConfig {
    MemoryBusConfig {
        max_attempts: 5,
        redelivery_backoff: Duration::from_millis(10),
        channel_capacity: 16,
    }
}

fn telemetry() -> Arc<Telemetry> {
    Arc::new(Telemetry::new("calcbus-test").unwrap())
}

/// Wires both legs over `bus`, leaving the dispatcher to the caller.
async fn spawn_legs<E: Evaluator>(
    bus: Arc<MemoryBus>,
    telemetry: Arc<Telemetry>,
    storage: Arc<MemoryStorage>,
    evaluator: Arc<E>,
) -> (Subscriber, Subscriber) {
    let eval_leg = Subscriber::spawn(
        Arc::clone(&bus) as Arc<dyn MessageBus>,
        REQUEST_CHANNEL,
        EvalHandler::new(
            evaluator,
            Publisher::new(
                Arc::clone(&bus) as Arc<dyn MessageBus>,
                Arc::clone(&telemetry),
                RESULT_CHANNEL,
            ),
        ),
        Arc::clone(&telemetry),
        SubscriberConfig::default(),
    )
    .await
    .unwrap();

    let result_leg = Subscriber::spawn(
        bus as Arc<dyn MessageBus>,
        RESULT_CHANNEL,
        ResultHandler::new(storage),
        telemetry,
        SubscriberConfig::default(),
    )
    .await
    .unwrap();

    (eval_leg, result_leg)
}

async fn wait_completed<S: Storage>(storage: &S, id: u64) -> Calculation {
    timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(record) = storage.get(id).await {
                if record.is_completed() {
                    return record;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("calculation did not complete in time")
}

#[tokio::test(flavor = "multi_thread")]
async fn dispatch_returns_a_pending_record() {
    let telemetry = telemetry();
    let bus = Arc::new(MemoryBus::new(bus_config()));
    let storage = Arc::new(MemoryStorage::new());
    // No subscribers: the record must be Pending immediately after dispatch.
    let dispatcher = Dispatcher::new(
        Arc::clone(&storage),
        Publisher::new(bus, telemetry, REQUEST_CHANNEL),
    );

    let id = dispatcher
        .dispatch(&Context::new(), "alice", "2+2")
        .await
        .unwrap();

    let record = storage.get(id).await.unwrap();
    assert_eq!(record.owner, "alice");
    assert_eq!(record.expression, "2+2");
    assert_eq!(record.result, None);
    assert!(!record.is_completed());
}

#[tokio::test(flavor = "multi_thread")]
async fn full_round_trip_completes_the_record() {
    let telemetry = telemetry();
    let bus = Arc::new(MemoryBus::new(bus_config()));
    let storage = Arc::new(MemoryStorage::new());
    let (eval_leg, result_leg) = spawn_legs(
        Arc::clone(&bus),
        Arc::clone(&telemetry),
        Arc::clone(&storage),
        Arc::new(ArithmeticEvaluator),
    )
    .await;

    let dispatcher = Dispatcher::new(
        Arc::clone(&storage),
        Publisher::new(bus, Arc::clone(&telemetry), REQUEST_CHANNEL),
    );
    let id = dispatcher
        .dispatch(&Context::new(), "alice", "2+2")
        .await
        .unwrap();
    assert_eq!(id, 1);

    let record = wait_completed(&*storage, id).await;
    assert_eq!(record.id, 1);
    assert_eq!(record.owner, "alice");
    assert_eq!(record.expression, "2+2");
    assert_eq!(record.result, Some(4.0));
    assert!(record.completed_at.is_some());

    eval_leg.shutdown().await;
    result_leg.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn result_leg_is_idempotent() {
    let storage = Arc::new(MemoryStorage::new());
    let record = storage.create("alice", "2+2").await.unwrap();
    let handler = ResultHandler::new(Arc::clone(&storage));

    let job = CalculationJob::request(record.id, "alice", "2+2").with_result(4.0);
    handler.handle(&Context::new(), job.clone()).await.unwrap();
    let first = storage.get(record.id).await.unwrap();

    handler.handle(&Context::new(), job).await.unwrap();
    let second = storage.get(record.id).await.unwrap();

    assert_eq!(first.result, Some(4.0));
    assert_eq!(second, first, "double delivery must not double-apply");
}

/// Fails the first `failures` result applications, then recovers.
struct FlakyStorage {
    inner: MemoryStorage,
    failures_left: AtomicU32,
    update_calls: AtomicU32,
}

impl FlakyStorage {
    fn new(failures: u32) -> Self {
        Self {
            inner: MemoryStorage::new(),
            failures_left: AtomicU32::new(failures),
            update_calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Storage for FlakyStorage {
    async fn create(&self, owner: &str, expression: &str) -> Result<Calculation> {
        self.inner.create(owner, expression).await
    }

    async fn get(&self, id: u64) -> Result<Calculation> {
        self.inner.get(id).await
    }

    async fn list(&self) -> Result<Vec<Calculation>> {
        self.inner.list().await
    }

    async fn update_result(&self, id: u64, result: f64) -> Result<()> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok()
        {
            return Err(Error::StorageUnavailable {
                context: "simulated outage".to_owned(),
            });
        }
        self.inner.update_result(id, result).await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn redelivery_completes_after_a_transient_store_outage() {
    let telemetry = telemetry();
    let bus = Arc::new(MemoryBus::new(bus_config()));
    let storage = Arc::new(FlakyStorage::new(2));

    let eval_leg = Subscriber::spawn(
        Arc::clone(&bus) as Arc<dyn MessageBus>,
        REQUEST_CHANNEL,
        EvalHandler::new(
            Arc::new(ArithmeticEvaluator),
            Publisher::new(
                Arc::clone(&bus) as Arc<dyn MessageBus>,
                Arc::clone(&telemetry),
                RESULT_CHANNEL,
            ),
        ),
        Arc::clone(&telemetry),
        SubscriberConfig::default(),
    )
    .await
    .unwrap();
    let result_leg = Subscriber::spawn(
        Arc::clone(&bus) as Arc<dyn MessageBus>,
        RESULT_CHANNEL,
        ResultHandler::new(Arc::clone(&storage)),
        Arc::clone(&telemetry),
        SubscriberConfig::default(),
    )
    .await
    .unwrap();

    let dispatcher = Dispatcher::new(
        Arc::clone(&storage),
        Publisher::new(bus, Arc::clone(&telemetry), REQUEST_CHANNEL),
    );
    let id = dispatcher
        .dispatch(&Context::new(), "alice", "6*7")
        .await
        .unwrap();

    let record = wait_completed(&*storage, id).await;
    assert_eq!(record.result, Some(42.0));
    assert_eq!(
        storage.update_calls.load(Ordering::SeqCst),
        3,
        "two failed attempts plus the one that succeeded"
    );

    eval_leg.shutdown().await;
    result_leg.shutdown().await;
}

/// Holds one marked expression until released; everything else evaluates
/// immediately.
struct GatedEvaluator {
    gated_expression: String,
    gate: Arc<Notify>,
}

#[async_trait]
impl Evaluator for GatedEvaluator {
    async fn evaluate(&self, expression: &str) -> Result<f64> {
        if expression == self.gated_expression {
            self.gate.notified().await;
        }
        ArithmeticEvaluator.evaluate(expression).await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn interleaved_calculations_resolve_independently() {
    let telemetry = telemetry();
    let bus = Arc::new(MemoryBus::new(bus_config()));
    let storage = Arc::new(MemoryStorage::new());
    let gate = Arc::new(Notify::new());
    let evaluator = Arc::new(GatedEvaluator {
        gated_expression: "1+0".to_owned(),
        gate: Arc::clone(&gate),
    });
    let (eval_leg, result_leg) = spawn_legs(
        Arc::clone(&bus),
        Arc::clone(&telemetry),
        Arc::clone(&storage),
        evaluator,
    )
    .await;

    let dispatcher = Dispatcher::new(
        Arc::clone(&storage),
        Publisher::new(bus, Arc::clone(&telemetry), REQUEST_CHANNEL),
    );
    let a = dispatcher
        .dispatch(&Context::new(), "alice", "1+0")
        .await
        .unwrap();
    let b = dispatcher
        .dispatch(&Context::new(), "bob", "2+2")
        .await
        .unwrap();

    // B's result lands while A's request handling is still blocked.
    let b_record = wait_completed(&*storage, b).await;
    assert_eq!(b_record.result, Some(4.0));
    assert!(
        !storage.get(a).await.unwrap().is_completed(),
        "A must still be Pending"
    );

    gate.notify_one();
    let a_record = wait_completed(&*storage, a).await;
    assert_eq!(a_record.result, Some(1.0));

    eval_leg.shutdown().await;
    result_leg.shutdown().await;
}

/// Reports the trace id each handled job arrived under.
struct TraceProbe {
    seen: mpsc::UnboundedSender<opentelemetry::trace::TraceId>,
}

#[async_trait]
impl JobHandler for TraceProbe {
    async fn handle(
        &self,
        cx: &Context,
        _job: CalculationJob,
    ) -> core::result::Result<(), HandlerError> {
        let _ = self.seen.send(cx.span().span_context().trace_id());
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn the_consumer_span_continues_the_producer_trace() {
    let telemetry = telemetry();
    let bus = Arc::new(MemoryBus::new(bus_config()));
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

    let subscriber = Subscriber::spawn(
        Arc::clone(&bus) as Arc<dyn MessageBus>,
        REQUEST_CHANNEL,
        TraceProbe { seen: seen_tx },
        Arc::clone(&telemetry),
        SubscriberConfig::default(),
    )
    .await
    .unwrap();

    let span = telemetry.tracer().start("dispatch");
    let cx = Context::new().with_span(span);
    let trace_id = cx.span().span_context().trace_id();

    let publisher = Publisher::new(bus, Arc::clone(&telemetry), REQUEST_CHANNEL);
    publisher
        .publish(&cx, &CalculationJob::request(1, "alice", "2+2"))
        .await
        .unwrap();
    cx.span().end();

    let seen = timeout(Duration::from_secs(2), seen_rx.recv())
        .await
        .expect("handler was never invoked")
        .unwrap();
    assert_eq!(seen, trace_id);

    subscriber.shutdown().await;
}

/// Counts how many jobs actually reach the business step.
struct InvocationCounter {
    invocations: Arc<AtomicUsize>,
}

#[async_trait]
impl JobHandler for InvocationCounter {
    async fn handle(
        &self,
        _cx: &Context,
        _job: CalculationJob,
    ) -> core::result::Result<(), HandlerError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_payloads_are_dead_lettered_without_reaching_the_handler() {
    let telemetry = telemetry();
    let bus = Arc::new(MemoryBus::new(bus_config()));
    let invocations = Arc::new(AtomicUsize::new(0));

    let mut dlq = bus
        .subscribe(&dead_letter_channel(REQUEST_CHANNEL))
        .await
        .unwrap();
    let subscriber = Subscriber::spawn(
        Arc::clone(&bus) as Arc<dyn MessageBus>,
        REQUEST_CHANNEL,
        InvocationCounter {
            invocations: Arc::clone(&invocations),
        },
        Arc::clone(&telemetry),
        SubscriberConfig::default(),
    )
    .await
    .unwrap();

    bus.publish(REQUEST_CHANNEL, Envelope::new(Bytes::from_static(b"not json")))
        .await
        .unwrap();

    let dead = timeout(Duration::from_secs(2), dlq.recv())
        .await
        .expect("dead-letter delivery timed out")
        .unwrap();
    assert_eq!(dead.envelope.payload().as_ref(), b"not json");
    assert!(
        dead.envelope
            .attribute("dead-letter.reason")
            .is_some_and(|reason| reason.contains("Malformed")),
        "reason attribute must explain the failure"
    );
    assert_eq!(
        dead.envelope.attribute("dead-letter.source-channel"),
        Some(REQUEST_CHANNEL)
    );
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
    dead.ack.ack();

    subscriber.shutdown().await;
}

/// A bus whose publishes always fail.
struct DownBus;

#[async_trait]
impl MessageBus for DownBus {
    async fn publish(&self, channel: &str, _envelope: Envelope) -> Result<String> {
        Err(Error::PublishRejected {
            channel: channel.to_owned(),
            context: "broker unavailable".to_owned(),
        })
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<calcbus::bus::Delivery>> {
        Err(Error::Channel {
            context: format!("channel `{channel}` unavailable"),
        })
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn a_failed_request_publish_leaves_the_record_stranded_pending() {
    let telemetry = telemetry();
    let storage = Arc::new(MemoryStorage::new());
    let dispatcher = Dispatcher::new(
        Arc::clone(&storage),
        Publisher::new(Arc::new(DownBus), telemetry, REQUEST_CHANNEL),
    );

    let err = dispatcher
        .dispatch(&Context::new(), "alice", "2+2")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PublishRejected { .. }));

    // The record exists and stays Pending: surfaced, not silently dropped.
    let record = storage.get(1).await.unwrap();
    assert!(!record.is_completed());
}

/// Signals when handling starts, then takes a while before acking.
struct SlowAck {
    started: Arc<Notify>,
    completed: Arc<AtomicUsize>,
}

#[async_trait]
impl JobHandler for SlowAck {
    async fn handle(
        &self,
        _cx: &Context,
        _job: CalculationJob,
    ) -> core::result::Result<(), HandlerError> {
        self.started.notify_one();
        sleep(Duration::from_millis(200)).await;
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_drains_in_flight_handlers() {
    let telemetry = telemetry();
    let bus = Arc::new(MemoryBus::new(bus_config()));
    let started = Arc::new(Notify::new());
    let completed = Arc::new(AtomicUsize::new(0));

    let subscriber = Subscriber::spawn(
        Arc::clone(&bus) as Arc<dyn MessageBus>,
        REQUEST_CHANNEL,
        SlowAck {
            started: Arc::clone(&started),
            completed: Arc::clone(&completed),
        },
        Arc::clone(&telemetry),
        SubscriberConfig {
            max_inflight: 4,
            shutdown_timeout: Duration::from_secs(2),
        },
    )
    .await
    .unwrap();

    let publisher = Publisher::new(
        Arc::clone(&bus) as Arc<dyn MessageBus>,
        Arc::clone(&telemetry),
        REQUEST_CHANNEL,
    );
    publisher
        .publish(&Context::new(), &CalculationJob::request(1, "alice", "2+2"))
        .await
        .unwrap();

    // Shut down while the handler is mid-flight; the drain must let it
    // finish rather than leaving the envelope neither acked nor failed.
    started.notified().await;
    subscriber.shutdown().await;

    assert_eq!(completed.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_result_ids_are_dead_lettered_not_retried() {
    let telemetry = telemetry();
    let bus = Arc::new(MemoryBus::new(bus_config()));
    let storage = Arc::new(MemoryStorage::new());

    let mut dlq = bus
        .subscribe(&dead_letter_channel(RESULT_CHANNEL))
        .await
        .unwrap();
    let result_leg = Subscriber::spawn(
        Arc::clone(&bus) as Arc<dyn MessageBus>,
        RESULT_CHANNEL,
        ResultHandler::new(Arc::clone(&storage)),
        Arc::clone(&telemetry),
        SubscriberConfig::default(),
    )
    .await
    .unwrap();

    // Nobody ever dispatched id 99.
    let publisher = Publisher::new(
        Arc::clone(&bus) as Arc<dyn MessageBus>,
        Arc::clone(&telemetry),
        RESULT_CHANNEL,
    );
    publisher
        .publish(
            &Context::new(),
            &CalculationJob::request(99, "nobody", "0+0").with_result(0.0),
        )
        .await
        .unwrap();

    let dead = timeout(Duration::from_secs(2), dlq.recv())
        .await
        .expect("dead-letter delivery timed out")
        .unwrap();
    assert!(
        dead.envelope
            .attribute("dead-letter.reason")
            .is_some_and(|reason| reason.contains("not found")),
    );
    dead.ack.ack();

    result_leg.shutdown().await;
}
