//! The dispatch/result state machine over the two bus legs.
//!
//! A calculation's lifecycle spans two hops: the request leg carries
//! `{id, owner, expression}` from the dispatcher to the evaluation stage,
//! and the result leg carries the same job with `result` set back to the
//! record owner. [`Dispatcher`] opens the lifecycle; [`EvalHandler`] and
//! [`ResultHandler`] are the two legs' registered business steps, run under
//! a [`Subscriber`](crate::Subscriber) each.

use crate::evaluator::Evaluator;
use crate::publisher::Publisher;
use crate::storage::Storage;
use crate::subscriber::JobHandler;
use async_trait::async_trait;
use calcbus_wire::{CalculationJob, Error, HandlerError, Result};
use opentelemetry::Context;
use opentelemetry::trace::TraceContextExt;
use std::sync::Arc;

/// Front door of the pipeline.
///
/// Persists a new Pending record, then hands it to the computation stage
/// over the request channel.
pub struct Dispatcher<S> {
    storage: Arc<S>,
    requests: Publisher,
}

impl<S: Storage> Dispatcher<S> {
    /// `requests` must publish on the request channel.
    pub fn new(storage: Arc<S>, requests: Publisher) -> Self {
        Self { storage, requests }
    }

    /// Creates the record and publishes the request leg, returning the new
    /// record's id.
    ///
    /// # Errors
    ///
    /// Propagates store and publish failures. If the record was created but
    /// the publish failed, the record stays Pending with no automatic
    /// reconciliation; that state is logged at error level so operators can
    /// alert on it, and the error is returned rather than swallowed.
    pub async fn dispatch(&self, cx: &Context, owner: &str, expression: &str) -> Result<u64> {
        let record = self.storage.create(owner, expression).await?;
        cx.span()
            .add_event(format!("dispatching calculation {}", record.id), vec![]);

        let job = CalculationJob::request(record.id, &record.owner, &record.expression);
        if let Err(err) = self.requests.publish(cx, &job).await {
            tracing::error!(
                id = record.id,
                owner,
                error = %err,
                "request publish failed, record is stranded Pending"
            );
            return Err(err);
        }

        tracing::info!(id = record.id, owner, expression, "calculation dispatched");
        Ok(record.id)
    }
}

/// Request-leg handler: evaluates a dispatched expression and publishes the
/// result leg.
pub struct EvalHandler<E> {
    evaluator: Arc<E>,
    results: Publisher,
}

impl<E: Evaluator> EvalHandler<E> {
    /// `results` must publish on the result channel.
    pub fn new(evaluator: Arc<E>, results: Publisher) -> Self {
        Self { evaluator, results }
    }
}

#[async_trait]
impl<E: Evaluator> JobHandler for EvalHandler<E> {
    async fn handle(
        &self,
        cx: &Context,
        job: CalculationJob,
    ) -> core::result::Result<(), HandlerError> {
        // An expression the evaluator rejects today is rejected on every
        // redelivery too.
        let value = self
            .evaluator
            .evaluate(&job.expression)
            .await
            .map_err(HandlerError::Permanent)?;

        let resolved = job.with_result(value);
        tracing::debug!(id = resolved.id, value, "expression evaluated");

        // The bus may be reachable again by the time this redelivers.
        self.results
            .publish(cx, &resolved)
            .await
            .map_err(HandlerError::Transient)?;
        Ok(())
    }
}

/// Result-leg handler: the sole writer of `result` and `completed_at`.
pub struct ResultHandler<S> {
    storage: Arc<S>,
}

impl<S: Storage> ResultHandler<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl<S: Storage> JobHandler for ResultHandler<S> {
    async fn handle(
        &self,
        _cx: &Context,
        job: CalculationJob,
    ) -> core::result::Result<(), HandlerError> {
        let Some(result) = job.result else {
            return Err(HandlerError::Permanent(Error::MalformedPayload {
                context: format!("result leg for calculation {} carries no result", job.id),
            }));
        };

        match self.storage.update_result(job.id, result).await {
            Ok(()) => {
                tracing::info!(id = job.id, result, "calculation completed");
                Ok(())
            }
            // A result for an id nobody dispatched will never find a record.
            Err(err @ Error::NotFound { .. }) => Err(HandlerError::Permanent(err)),
            Err(err) => Err(HandlerError::Transient(err)),
        }
    }
}
