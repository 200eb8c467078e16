use std::{
    any::{Any, TypeId, type_name},
    fmt::Debug,
};

use async_trait::async_trait;

use crate::Result;

/// A command or a query: routed to exactly one [`RequestHandler`].
pub trait Request: Debug + Send + Sync + 'static {
    /// What the handler hands back to the caller.
    type Response: Send + 'static;
}

/// A broadcast message, usually a domain event. Zero or more handlers may observe it.
pub trait Notification: Debug + Send + Sync + 'static {}

/// Handles one request type.
///
/// Handlers are resolved from the caller's scope on every `execute`, so they can depend on
/// scoped services such as repositories or the unit of work.
#[async_trait]
pub trait RequestHandler<R>: Send + Sync + 'static
where
    R: Request,
{
    async fn handle(&self, request: &R) -> Result<R::Response>;
}

/// Observes one notification type.
///
/// Each invocation runs in its own scope, disposed as soon as the handler returns.
#[async_trait]
pub trait NotificationHandler<N>: Send + Sync + 'static
where
    N: Notification,
{
    async fn handle(&self, notification: &N) -> Result<()>;
}

/// A notification whose concrete type is only known at runtime.
///
/// Produced by aggregates when their recorded events are published by the unit of work.
pub trait AnyNotification: Send + Sync {
    fn notification_type(&self) -> TypeId;

    fn notification_name(&self) -> &'static str;

    fn as_any(&self) -> &(dyn Any + Send + Sync);

    fn as_debug(&self) -> &(dyn Debug + Send + Sync);
}

impl<N> AnyNotification for N
where
    N: Notification,
{
    fn notification_type(&self) -> TypeId {
        TypeId::of::<N>()
    }

    fn notification_name(&self) -> &'static str {
        type_name::<N>()
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn as_debug(&self) -> &(dyn Debug + Send + Sync) {
        self
    }
}

impl Debug for dyn AnyNotification + '_ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self.as_debug(), f)
    }
}
