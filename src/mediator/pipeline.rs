//! Cross-cutting behaviors wrapped around every handler invocation.
//!
//! Behaviors run in registration order on the way in and in reverse order on the way out.
//! Each one receives the [`MessageContext`] and a [`Next`] continuation; it may work before
//! and after `next.run()`, skip the continuation entirely, or map the error it returns.

use std::{
    any::Any,
    fmt::{self, Debug, Formatter},
    sync::Arc,
    time::Instant,
};

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::{Result, ServiceScope};

/// Type-erased handler output travelling through the pipeline. Requests carry their
/// `Response`, notifications carry `()`.
pub type PipelineResult = Result<Box<dyn Any + Send>>;

/// Whether a message is a request (one handler) or a notification (any number).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Notification,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Request => f.write_str("request"),
            MessageKind::Notification => f.write_str("notification"),
        }
    }
}

/// What a behavior can see of the message being handled.
#[derive(Clone, Copy)]
pub struct MessageContext<'a> {
    kind: MessageKind,
    message_type: &'static str,
    handler: &'static str,
    message: &'a (dyn Any + Send + Sync),
    debug: &'a (dyn Debug + Send + Sync),
    scope: &'a ServiceScope,
}

impl<'a> MessageContext<'a> {
    pub(crate) fn new(
        kind: MessageKind,
        message_type: &'static str,
        handler: &'static str,
        message: &'a (dyn Any + Send + Sync),
        debug: &'a (dyn Debug + Send + Sync),
        scope: &'a ServiceScope,
    ) -> Self {
        Self {
            kind,
            message_type,
            handler,
            message,
            debug,
            scope,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn message_type(&self) -> &'static str {
        self.message_type
    }

    pub fn handler(&self) -> &'static str {
        self.handler
    }

    /// The message itself, when it is a `T`.
    pub fn message<T: Any>(&self) -> Option<&'a T> {
        self.message.downcast_ref::<T>()
    }

    pub(crate) fn erased_message(&self) -> &'a (dyn Any + Send + Sync) {
        self.message
    }

    /// The scope the handler is resolved from.
    pub fn scope(&self) -> &'a ServiceScope {
        self.scope
    }
}

impl Debug for MessageContext<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageContext")
            .field("kind", &self.kind)
            .field("message_type", &self.message_type)
            .field("handler", &self.handler)
            .field("message", &self.debug)
            .field("scope_id", &self.scope.id())
            .finish()
    }
}

pub(crate) type Terminal<'a> = Box<dyn FnOnce() -> BoxFuture<'a, PipelineResult> + Send + 'a>;

/// The rest of the pipeline: the remaining behaviors, then the handler.
pub struct Next<'a> {
    behaviors: &'a [Arc<dyn PipelineBehavior>],
    context: MessageContext<'a>,
    terminal: Terminal<'a>,
}

impl<'a> Next<'a> {
    pub(crate) fn new(
        behaviors: &'a [Arc<dyn PipelineBehavior>],
        context: MessageContext<'a>,
        terminal: Terminal<'a>,
    ) -> Self {
        Self {
            behaviors,
            context,
            terminal,
        }
    }

    pub fn run(self) -> BoxFuture<'a, PipelineResult> {
        let Next {
            behaviors,
            context,
            terminal,
        } = self;

        match behaviors.split_first() {
            Some((behavior, rest)) => Box::pin(async move {
                let next = Next::new(rest, context, terminal);
                behavior.handle(&context, next).await
            }),
            None => terminal(),
        }
    }
}

/// A wrapper around handler execution (logging, validation, transactions).
#[async_trait]
pub trait PipelineBehavior: Send + Sync + 'static {
    async fn handle(&self, context: &MessageContext<'_>, next: Next<'_>) -> PipelineResult;
}

/// Logs every message with its handler, outcome and duration.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingBehavior;

#[async_trait]
impl PipelineBehavior for LoggingBehavior {
    async fn handle(&self, context: &MessageContext<'_>, next: Next<'_>) -> PipelineResult {
        let started = Instant::now();
        tracing::info!(
            kind = %context.kind(),
            message_type = context.message_type(),
            handler = context.handler(),
            message = ?context.debug,
            "handling message"
        );

        let outcome = next.run().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &outcome {
            Ok(_) => tracing::info!(
                message_type = context.message_type(),
                handler = context.handler(),
                elapsed_ms,
                "message handled"
            ),
            Err(error) => tracing::warn!(
                message_type = context.message_type(),
                handler = context.handler(),
                elapsed_ms,
                %error,
                "message handling failed"
            ),
        }

        outcome
    }
}
