use std::{
    any::{Any, TypeId, type_name},
    collections::HashMap,
    sync::Arc,
};

use anyhow::anyhow;
use futures::future::BoxFuture;

use super::{
    message::{Notification, NotificationHandler, Request, RequestHandler},
    pipeline::PipelineResult,
};
use crate::{CqrsError, Result, ServiceKey, ServiceScope};

/// Resolves the handler from a scope and runs it against an erased message.
pub(crate) type Invoker = Arc<
    dyn for<'a> Fn(&'a ServiceScope, &'a (dyn Any + Send + Sync)) -> BoxFuture<'a, PipelineResult>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub(crate) struct HandlerEntry {
    pub(crate) message: &'static str,
    pub(crate) handler: ServiceKey,
    pub(crate) invoke: Invoker,
}

/// Handler table keyed by message type, filled explicitly at startup.
#[derive(Clone, Default)]
pub(crate) struct HandlerRegistry {
    requests: HashMap<TypeId, Vec<HandlerEntry>>,
    notifications: HashMap<TypeId, Vec<HandlerEntry>>,
}

impl HandlerRegistry {
    pub(crate) fn add_request<R, H>(&mut self)
    where
        R: Request,
        H: RequestHandler<R>,
    {
        insert(
            self.requests.entry(TypeId::of::<R>()).or_default(),
            HandlerEntry {
                message: type_name::<R>(),
                handler: ServiceKey::of::<H>(),
                invoke: Arc::new(invoke_request::<R, H>),
            },
        );
    }

    pub(crate) fn add_notification<N, H>(&mut self)
    where
        N: Notification,
        H: NotificationHandler<N>,
    {
        insert(
            self.notifications.entry(TypeId::of::<N>()).or_default(),
            HandlerEntry {
                message: type_name::<N>(),
                handler: ServiceKey::of::<H>(),
                invoke: Arc::new(invoke_notification::<N, H>),
            },
        );
    }

    /// The single handler of a request type.
    pub(crate) fn request_handler(&self, id: TypeId, message: &'static str) -> Result<&HandlerEntry> {
        match self.requests.get(&id).map(Vec::as_slice).unwrap_or_default() {
            [] => Err(CqrsError::HandlerNotFound { message }),
            [entry] => Ok(entry),
            entries => Err(ambiguous(message, entries)),
        }
    }

    /// Handlers of a notification type, in registration order.
    pub(crate) fn notification_handlers(&self, id: TypeId) -> &[HandlerEntry] {
        self.notifications
            .get(&id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub(crate) fn request_entries(&self) -> impl Iterator<Item = &[HandlerEntry]> {
        self.requests.values().map(Vec::as_slice)
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &HandlerEntry> {
        self.requests
            .values()
            .chain(self.notifications.values())
            .flatten()
    }
}

pub(crate) fn ambiguous(message: &'static str, entries: &[HandlerEntry]) -> CqrsError {
    CqrsError::AmbiguousHandler {
        message,
        handlers: entries.iter().map(|entry| entry.handler.name()).collect(),
    }
}

// Registering the same handler twice for one message keeps the first position.
fn insert(entries: &mut Vec<HandlerEntry>, entry: HandlerEntry) {
    if entries.iter().any(|existing| existing.handler == entry.handler) {
        tracing::debug!(
            message = entry.message,
            handler = entry.handler.name(),
            "handler already registered"
        );
        return;
    }
    entries.push(entry);
}

fn invoke_request<'a, R, H>(
    scope: &'a ServiceScope,
    message: &'a (dyn Any + Send + Sync),
) -> BoxFuture<'a, PipelineResult>
where
    R: Request,
    H: RequestHandler<R>,
{
    Box::pin(async move {
        let request = message
            .downcast_ref::<R>()
            .ok_or_else(|| anyhow!("message is not a `{}`", type_name::<R>()))?;
        let handler = scope.resolve::<H>().await?;
        let response = handler.handle(request).await?;
        Ok(Box::new(response) as Box<dyn Any + Send>)
    })
}

fn invoke_notification<'a, N, H>(
    scope: &'a ServiceScope,
    message: &'a (dyn Any + Send + Sync),
) -> BoxFuture<'a, PipelineResult>
where
    N: Notification,
    H: NotificationHandler<N>,
{
    Box::pin(async move {
        let notification = message
            .downcast_ref::<N>()
            .ok_or_else(|| anyhow!("message is not a `{}`", type_name::<N>()))?;
        let handler = scope.resolve::<H>().await?;
        handler.handle(notification).await?;
        Ok(Box::new(()) as Box<dyn Any + Send>)
    })
}
