//! Request/notification dispatch through an explicit handler table.
//!
//! Handlers are registered on a [`MediatorBuilder`] at startup, together with the pipeline
//! behaviors that wrap them. Handler types are themselves services: the mediator resolves
//! them from a [`ServiceScope`] every time a message is dispatched.
//!
//! * [`Mediator::execute`] runs the single handler of a request inside the caller's scope.
//! * [`Mediator::publish`] runs every handler of a notification, each one in a fresh scope
//!   disposed right after that handler returns. Handlers run in registration order by
//!   default, see [`PublishStrategy`] and [`FailurePolicy`].
//!
//! Dropping a `publish` future cancels cooperatively: the in-flight handler stops at its
//! next suspension point, side effects it already performed stay, and its scope is released
//! by the scope's drop guard.

mod message;
mod pipeline;
mod registry;

pub use message::{AnyNotification, Notification, NotificationHandler, Request, RequestHandler};
pub use pipeline::{
    LoggingBehavior, MessageContext, MessageKind, Next, PipelineBehavior, PipelineResult,
};

use std::{
    any::{TypeId, type_name},
    sync::Arc,
};

use futures::future::{BoxFuture, join_all, try_join_all};
use tracing::Instrument;

use crate::{
    CqrsError, FailurePolicy, HandlerFailure, Lifetime, MediatorConfig, PublishStrategy, Result,
    ServiceCollection, ServiceContainer, ServiceDescriptor, ServiceScope,
};
use registry::{HandlerEntry, HandlerRegistry, ambiguous};

/// Collects handler registrations and pipeline behaviors.
#[derive(Default)]
pub struct MediatorBuilder {
    registry: HandlerRegistry,
    behaviors: Vec<Arc<dyn PipelineBehavior>>,
    config: MediatorConfig,
}

impl MediatorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: MediatorConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Routes `R` to `H`. A second, different handler for the same request is accepted here
    /// and reported as ambiguous when `R` is executed.
    pub fn request_handler<R, H>(&mut self) -> &mut Self
    where
        R: Request,
        H: RequestHandler<R>,
    {
        self.registry.add_request::<R, H>();
        self
    }

    /// Adds `H` to the observers of `N`. Handlers are invoked in the order they are added.
    pub fn notification_handler<N, H>(&mut self) -> &mut Self
    where
        N: Notification,
        H: NotificationHandler<N>,
    {
        self.registry.add_notification::<N, H>();
        self
    }

    /// Appends a behavior. The first one added is the outermost.
    pub fn behavior<B>(&mut self, behavior: B) -> &mut Self
    where
        B: PipelineBehavior,
    {
        self.behaviors.push(Arc::new(behavior));
        self
    }

    /// Registers the mediator as a transient service so handlers and the unit of work can
    /// depend on it. Every resolved copy shares the same handler table.
    pub fn install(self, services: &mut ServiceCollection) -> Result<()> {
        let core = Arc::new(self.into_core());
        services.register(ServiceDescriptor::new::<Mediator, _, _>(
            Lifetime::Transient,
            move |resolver| {
                let mediator = Mediator {
                    core: core.clone(),
                    container: resolver.container().clone(),
                };
                async move { anyhow::Ok(Arc::new(mediator)) }
            },
        ))?;
        Ok(())
    }

    /// Builds a mediator bound to an already built container.
    pub fn build(self, container: ServiceContainer) -> Mediator {
        Mediator {
            core: Arc::new(self.into_core()),
            container,
        }
    }

    fn into_core(self) -> MediatorCore {
        MediatorCore {
            registry: self.registry,
            behaviors: self.behaviors,
            config: self.config,
        }
    }
}

struct MediatorCore {
    registry: HandlerRegistry,
    behaviors: Vec<Arc<dyn PipelineBehavior>>,
    config: MediatorConfig,
}

/// Dispatches requests and notifications to their handlers.
#[derive(Clone)]
pub struct Mediator {
    core: Arc<MediatorCore>,
    container: ServiceContainer,
}

impl Mediator {
    pub fn config(&self) -> MediatorConfig {
        self.core.config
    }

    /// Runs the single handler registered for `R`, resolved from `scope`, through the
    /// pipeline.
    pub async fn execute<R>(&self, scope: &ServiceScope, request: R) -> Result<R::Response>
    where
        R: Request,
    {
        let message = type_name::<R>();
        let entry = self
            .core
            .registry
            .request_handler(TypeId::of::<R>(), message)?;

        let span = tracing::info_span!(
            "mediator.execute",
            message,
            handler = entry.handler.name(),
            scope_id = %scope.id(),
        );

        async {
            let context = MessageContext::new(
                MessageKind::Request,
                message,
                entry.handler.name(),
                &request,
                &request,
                scope,
            );

            let response = self.run_pipeline(context, entry).await?;
            response
                .downcast::<R::Response>()
                .map(|response| *response)
                .map_err(|_| CqrsError::ResponseTypeMismatch { message })
        }
        .instrument(span)
        .await
    }

    /// Delivers `notification` to every registered handler. No handlers is a no-op.
    ///
    /// With [`PublishStrategy::Parallel`] and [`FailurePolicy::FailFast`] the first failure
    /// cancels the handlers still running. Their scopes are released in the background.
    pub async fn publish<N>(&self, notification: &N) -> Result<()>
    where
        N: Notification,
    {
        self.publish_any(notification).await
    }

    /// [`Mediator::publish`] for a notification whose type is erased.
    pub async fn publish_any(&self, notification: &dyn AnyNotification) -> Result<()> {
        let message = notification.notification_name();
        let handlers = self
            .core
            .registry
            .notification_handlers(notification.notification_type());

        if handlers.is_empty() {
            tracing::debug!(message, "no handlers registered for notification");
            return Ok(());
        }

        let span = tracing::info_span!("mediator.publish", message, handlers = handlers.len());
        let config = self.core.config;

        async move {
            let failures = match config.publish_strategy {
                PublishStrategy::Sequential => {
                    let mut failures = Vec::new();
                    for entry in handlers {
                        if let Err(failure) = self.dispatch_isolated(entry, notification).await {
                            failures.push(failure);
                            if config.failure_policy == FailurePolicy::FailFast {
                                break;
                            }
                        }
                    }
                    failures
                }
                PublishStrategy::Parallel => {
                    let runs = handlers
                        .iter()
                        .map(|entry| self.dispatch_isolated(entry, notification));
                    match config.failure_policy {
                        FailurePolicy::ContinueOnError => join_all(runs)
                            .await
                            .into_iter()
                            .filter_map(|outcome| outcome.err())
                            .collect(),
                        FailurePolicy::FailFast => {
                            try_join_all(runs).await.err().into_iter().collect()
                        }
                    }
                }
            };

            if failures.is_empty() {
                Ok(())
            } else {
                Err(CqrsError::HandlerFailures(failures))
            }
        }
        .instrument(span)
        .await
    }

    /// Checks that every handler type is registered as a service and that no request has
    /// more than one handler.
    pub fn validate(&self) -> Result<()> {
        if let Some(entries) = self
            .core
            .registry
            .request_entries()
            .find(|entries| entries.len() > 1)
        {
            return Err(ambiguous(entries[0].message, entries));
        }

        for entry in self.core.registry.entries() {
            if !self.container.is_registered_key(entry.handler) {
                return Err(CqrsError::ServiceNotRegistered {
                    service: entry.handler.name(),
                });
            }
        }

        Ok(())
    }

    // One handler, one scope: the scope is disposed whatever the handler's outcome.
    async fn dispatch_isolated(
        &self,
        entry: &HandlerEntry,
        notification: &dyn AnyNotification,
    ) -> std::result::Result<(), HandlerFailure> {
        let scope = self.container.create_scope();
        let context = MessageContext::new(
            MessageKind::Notification,
            entry.message,
            entry.handler.name(),
            notification.as_any(),
            notification.as_debug(),
            &scope,
        );

        let outcome = self.run_pipeline(context, entry).await;
        scope.dispose().await;

        outcome.map(|_| ()).map_err(|error| {
            tracing::warn!(
                message = entry.message,
                handler = entry.handler.name(),
                %error,
                "notification handler failed"
            );
            HandlerFailure::new(entry.handler.name(), entry.message, error)
        })
    }

    fn run_pipeline<'a>(
        &'a self,
        context: MessageContext<'a>,
        entry: &'a HandlerEntry,
    ) -> BoxFuture<'a, PipelineResult> {
        let terminal = Box::new(move || (entry.invoke)(context.scope(), context.erased_message()));
        Next::new(&self.core.behaviors, context, terminal).run()
    }
}
