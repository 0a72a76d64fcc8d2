#![doc = include_str!("../README.md")]

mod config;

use anyhow::Context as _;
use calcbus::bus::{MemoryBus, MessageBus};
use calcbus::telemetry::Telemetry;
use calcbus::{
    ArithmeticEvaluator, Dispatcher, EvalHandler, MemoryStorage, Publisher, ResultHandler,
    Storage, Subscriber,
};
use calcbus_wire::{REQUEST_CHANNEL, RESULT_CHANNEL};
use clap::Parser;
use config::{CliArgs, WorkerConfig};
use core::time::Duration;
use opentelemetry::trace::{TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use std::sync::Arc;
use tokio::signal;
use tokio::time::{sleep, timeout};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = WorkerConfig::try_from(args)?;

    let telemetry =
        Arc::new(Telemetry::new("calcbus-worker").context("failed to initialize telemetry")?);
    init_tracing(&telemetry);

    tracing::info!(
        owner = %config.owner,
        expressions = config.expressions.len(),
        "starting in-process pipeline"
    );

    let bus = Arc::new(MemoryBus::new(config.bus.clone()));
    let storage = Arc::new(MemoryStorage::new());

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
        config.subscriber.clone(),
    )
    .await?;

    let result_leg = Subscriber::spawn(
        Arc::clone(&bus) as Arc<dyn MessageBus>,
        RESULT_CHANNEL,
        ResultHandler::new(Arc::clone(&storage)),
        Arc::clone(&telemetry),
        config.subscriber.clone(),
    )
    .await?;

    let dispatcher = Dispatcher::new(
        Arc::clone(&storage),
        Publisher::new(
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            Arc::clone(&telemetry),
            REQUEST_CHANNEL,
        ),
    );

    let mut ids = Vec::with_capacity(config.expressions.len());
    for expression in &config.expressions {
        let span = telemetry
            .tracer()
            .span_builder("dispatch")
            .with_attributes([KeyValue::new("owner", config.owner.clone())])
            .start(telemetry.tracer());
        let cx = Context::new().with_span(span);

        match dispatcher.dispatch(&cx, &config.owner, expression).await {
            Ok(id) => ids.push(id),
            Err(err) => tracing::error!(%expression, error = %err, "dispatch failed"),
        }
        cx.span().end();
    }

    tokio::select! {
        outcome = wait_for_completion(&*storage, &ids, config.completion_timeout) => match outcome {
            Ok(()) => tracing::info!("all calculations completed"),
            Err(pending) => tracing::warn!(pending, "gave up waiting for completion"),
        },
        () = shutdown_signal() => {
            tracing::info!("shutdown signal received, terminating gracefully...");
        }
    }

    for record in storage.list().await? {
        match record.result {
            Some(result) => tracing::info!(
                id = record.id,
                owner = %record.owner,
                expression = %record.expression,
                result,
                "completed"
            ),
            None => tracing::warn!(
                id = record.id,
                owner = %record.owner,
                expression = %record.expression,
                "still pending"
            ),
        }
    }

    futures::future::join(eval_leg.shutdown(), result_leg.shutdown()).await;
    telemetry
        .shutdown()
        .context("failed to flush telemetry on shutdown")?;

    tracing::info!("worker shut down successfully");
    Ok(())
}

fn init_tracing(telemetry: &Telemetry) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true)
                .pretty(),
        )
        .with(
            tracing_opentelemetry::layer()
                .with_tracer(telemetry.tracer().clone())
                .with_error_records_to_exceptions(true),
        )
        .init();
}

/// Resolves once every id is Completed, or returns the number of still
/// Pending records when `limit` elapses first.
async fn wait_for_completion<S: Storage>(
    storage: &S,
    ids: &[u64],
    limit: Duration,
) -> Result<(), usize> {
    let all_completed = async {
        loop {
            if count_pending(storage, ids).await == 0 {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    };

    if timeout(limit, all_completed).await.is_ok() {
        Ok(())
    } else {
        Err(count_pending(storage, ids).await)
    }
}

async fn count_pending<S: Storage>(storage: &S, ids: &[u64]) -> usize {
    let mut pending = 0;
    for id in ids {
        match storage.get(*id).await {
            Ok(record) if record.is_completed() => {}
            _ => pending += 1,
        }
    }
    pending
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
