use std::{
    any::{Any, TypeId, type_name},
    fmt::{self, Debug, Display, Formatter},
    future::Future,
    hash::{Hash, Hasher},
    sync::Arc,
};

use anyhow::anyhow;
use async_trait::async_trait;
use futures::future::BoxFuture;

use super::{Lifetime, Resolver};
use crate::{CqrsError, Result};

/// A type-erased service instance. It always wraps an `Arc<T>` for the registered `T`.
pub(crate) type Instance = Arc<dyn Any + Send + Sync>;

pub(crate) type Factory =
    Arc<dyn Fn(Resolver) -> BoxFuture<'static, anyhow::Result<Instance>> + Send + Sync>;

pub(crate) type Disposer =
    Arc<dyn Fn(Instance) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Release hook for services owning resources (connections, open transactions, buffers).
///
/// Hooks run when the owning scope (or, for singletons, the container) is disposed, in
/// reverse construction order.
#[async_trait]
pub trait Dispose: Send + Sync {
    async fn dispose(&self) -> anyhow::Result<()>;
}

/// Identifies a registered service by the type it is requested as.
#[derive(Clone, Copy)]
pub struct ServiceKey {
    id: TypeId,
    name: &'static str,
}

impl ServiceKey {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for ServiceKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ServiceKey {}

impl Hash for ServiceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Debug for ServiceKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl Display for ServiceKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Registration record: what is requested, how long it lives and how it is built.
#[derive(Clone)]
pub struct ServiceDescriptor {
    key: ServiceKey,
    lifetime: Lifetime,
    factory: Factory,
    disposer: Option<Disposer>,
}

impl ServiceDescriptor {
    /// Describes a service built by an async `factory`.
    ///
    /// The factory receives a [`Resolver`] bound to the scope the service is being built
    /// for, so its own dependencies are shared with the rest of that object graph.
    pub fn new<T, F, Fut>(lifetime: Lifetime, factory: F) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(Resolver) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Arc<T>>> + Send + 'static,
    {
        let factory: Factory = Arc::new(
            move |resolver: Resolver| -> BoxFuture<'static, anyhow::Result<Instance>> {
                let service = factory(resolver);
                Box::pin(async move { Ok(Arc::new(service.await?) as Instance) })
            },
        );

        Self {
            key: ServiceKey::of::<T>(),
            lifetime,
            factory,
            disposer: None,
        }
    }

    /// Same as [`ServiceDescriptor::new`], with the service's [`Dispose`] hook attached.
    pub fn disposable<T, F, Fut>(lifetime: Lifetime, factory: F) -> Self
    where
        T: ?Sized + Dispose + 'static,
        F: Fn(Resolver) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Arc<T>>> + Send + 'static,
    {
        let disposer: Disposer = Arc::new(
            |instance: Instance| -> BoxFuture<'static, anyhow::Result<()>> {
                Box::pin(async move {
                    let service = instance
                        .downcast_ref::<Arc<T>>()
                        .cloned()
                        .ok_or_else(|| anyhow!("instance is not a `{}`", type_name::<T>()))?;
                    service.dispose().await
                })
            },
        );

        Self {
            disposer: Some(disposer),
            ..Self::new::<T, F, Fut>(lifetime, factory)
        }
    }

    /// Describes a singleton that already exists.
    pub fn instance<T>(service: Arc<T>) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        Self::new::<T, _, _>(Lifetime::Singleton, move |_| {
            let service = service.clone();
            async move { anyhow::Ok(service) }
        })
    }

    pub fn key(&self) -> ServiceKey {
        self.key
    }

    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    pub fn is_disposable(&self) -> bool {
        self.disposer.is_some()
    }

    pub(crate) fn build(&self, resolver: Resolver) -> BoxFuture<'static, anyhow::Result<Instance>> {
        (self.factory)(resolver)
    }

    pub(crate) fn disposer(&self) -> Option<&Disposer> {
        self.disposer.as_ref()
    }
}

impl Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("key", &self.key)
            .field("lifetime", &self.lifetime)
            .field("disposable", &self.is_disposable())
            .finish()
    }
}

/// A constructed instance whose release hook still has to run.
pub(crate) struct TrackedInstance {
    pub(crate) key: ServiceKey,
    instance: Instance,
    disposer: Disposer,
}

impl TrackedInstance {
    pub(crate) fn new(key: ServiceKey, instance: Instance, disposer: Disposer) -> Self {
        Self {
            key,
            instance,
            disposer,
        }
    }

    pub(crate) async fn release(self) -> anyhow::Result<()> {
        (self.disposer)(self.instance).await
    }
}

/// Releases tracked instances in reverse construction order. Failures are logged and
/// never stop the remaining hooks from running.
pub(crate) async fn release_all(owner: String, tracked: Vec<TrackedInstance>) {
    for entry in tracked.into_iter().rev() {
        let service = entry.key.name();
        match entry.release().await {
            Ok(()) => tracing::debug!(owner = %owner, service, "released service"),
            Err(error) => {
                tracing::warn!(owner = %owner, service, %error, "failed to release service")
            }
        }
    }
}

pub(crate) fn downcast<T>(key: ServiceKey, instance: &Instance) -> Result<Arc<T>>
where
    T: ?Sized + Send + Sync + 'static,
{
    instance
        .downcast_ref::<Arc<T>>()
        .cloned()
        .ok_or_else(|| {
            CqrsError::Generic(anyhow!(
                "registered instance for `{key}` has an unexpected type"
            ))
        })
}
