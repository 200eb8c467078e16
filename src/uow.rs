//! Unit of work: publishes the events of persisted aggregates.
//!
//! One [`UnitOfWork`] lives in each scope. Repositories register the aggregates they saved,
//! and [`UnitOfWork::commit`] later drains the events each aggregate has persisted and
//! publishes them through the [`Mediator`], aggregates in registration order and events in
//! the order they were recorded. Events recorded after the last save are left on the
//! aggregate for its next save.
//!
//! `commit` must only run once persistence succeeded. When persistence fails, call
//! [`UnitOfWork::rollback`] instead: the aggregates keep their uncommitted events so the
//! operation can be retried. [`UnitOfWorkBehavior`] wires both paths around every handler.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::Instrument;

use crate::{
    Aggregate, CqrsError, Dispose, FailurePolicy, Lifetime, Mediator, MessageContext, Next,
    PendingEvents, PipelineBehavior, PipelineResult, Result, ServiceCollection,
};

pub struct UnitOfWork {
    mediator: Arc<Mediator>,
    tracked: Mutex<Vec<Arc<dyn PendingEvents>>>,
}

impl UnitOfWork {
    pub fn new(mediator: Arc<Mediator>) -> Self {
        Self {
            mediator,
            tracked: Mutex::new(Vec::new()),
        }
    }

    /// Registers the unit of work as a disposable scoped service. The mediator must be
    /// installed in the same collection.
    pub fn install(services: &mut ServiceCollection) -> Result<()> {
        services.add_disposable::<UnitOfWork, _, _>(Lifetime::Scoped, |resolver| async move {
            let mediator = resolver.resolve::<Mediator>().await?;
            anyhow::Ok(Arc::new(UnitOfWork::new(mediator)))
        })?;
        Ok(())
    }

    /// Tracks `aggregate`. Registering the same aggregate again is a no-op.
    pub fn register<A>(&self, aggregate: &A)
    where
        A: Aggregate,
    {
        let root = aggregate.root();
        self.register_pending(root.ledger().clone());
    }

    pub fn register_pending(&self, pending: Arc<dyn PendingEvents>) {
        let mut tracked = self.tracked.lock();
        if tracked.iter().any(|known| same_ledger(known, &pending)) {
            return;
        }
        tracing::debug!(aggregate_id = %pending.aggregate_id(), "aggregate registered");
        tracked.push(pending);
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.lock().len()
    }

    /// Publishes every tracked aggregate's persisted events, then forgets the aggregates.
    ///
    /// With [`FailurePolicy::ContinueOnError`] every handler of every event is attempted
    /// and failures are reported together. With [`FailurePolicy::FailFast`] the first
    /// failing event stops the commit, and the events drained but not yet published are
    /// dropped.
    pub async fn commit(&self) -> Result<()> {
        let tracked = std::mem::take(&mut *self.tracked.lock());
        if tracked.is_empty() {
            return Ok(());
        }

        let fail_fast = self.mediator.config().failure_policy == FailurePolicy::FailFast;
        let span = tracing::info_span!(
            "uow.commit",
            aggregates = tracked.len(),
            aggregate_ids = ?tracked.iter().map(|a| a.aggregate_id()).collect::<Vec<_>>(),
        );

        async move {
            let mut failures = Vec::new();

            for aggregate in tracked {
                let events = aggregate.drain();
                tracing::debug!(
                    aggregate_id = %aggregate.aggregate_id(),
                    events = events.len(),
                    "publishing aggregate events"
                );

                for event in events {
                    match self.mediator.publish_any(event.as_ref()).await {
                        Ok(()) => {}
                        Err(CqrsError::HandlerFailures(mut failed)) => {
                            failures.append(&mut failed);
                            if fail_fast {
                                return Err(CqrsError::HandlerFailures(failures));
                            }
                        }
                        Err(error) => return Err(error),
                    }
                }
            }

            if failures.is_empty() {
                Ok(())
            } else {
                Err(CqrsError::HandlerFailures(failures))
            }
        }
        .instrument(span)
        .await
    }

    /// Forgets the tracked aggregates without publishing. Their events stay uncommitted.
    pub fn rollback(&self) {
        let dropped = std::mem::take(&mut *self.tracked.lock());
        if !dropped.is_empty() {
            tracing::debug!(aggregates = dropped.len(), "unit of work rolled back");
        }
    }
}

fn same_ledger(a: &Arc<dyn PendingEvents>, b: &Arc<dyn PendingEvents>) -> bool {
    // Compare data pointers only, vtables may differ across codegen units.
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[async_trait]
impl Dispose for UnitOfWork {
    async fn dispose(&self) -> anyhow::Result<()> {
        let pending = std::mem::take(&mut *self.tracked.lock());
        if !pending.is_empty() {
            tracing::warn!(
                aggregates = pending.len(),
                "unit of work disposed with uncommitted aggregates"
            );
        }
        Ok(())
    }
}

/// Commits the scope's unit of work after a successful handler, rolls it back otherwise.
/// A scope whose handler never resolved the unit of work is left alone.
///
/// Applies to requests and notifications alike, so notification handlers that save
/// aggregates publish their own events once they return.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnitOfWorkBehavior;

#[async_trait]
impl PipelineBehavior for UnitOfWorkBehavior {
    async fn handle(&self, context: &MessageContext<'_>, next: Next<'_>) -> PipelineResult {
        let outcome = next.run().await;
        let Some(unit_of_work) = context.scope().existing::<UnitOfWork>() else {
            return outcome;
        };

        match outcome {
            Ok(response) => {
                unit_of_work.commit().await?;
                Ok(response)
            }
            Err(error) => {
                unit_of_work.rollback();
                Err(error)
            }
        }
    }
}
