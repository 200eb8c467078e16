//! Lifetime-aware service container.
//!
//! Services are registered on a [`ServiceCollection`] at startup, then the collection is
//! frozen into a [`ServiceContainer`]. The container resolves singletons and transients;
//! scoped services are only reachable through a [`ServiceScope`].
//!
//! ```rust
//! use std::sync::Arc;
//! use mini_cqrs_di::{ServiceCollection, Lifetime};
//!
//! struct Database { url: String }
//! struct Repository { db: Arc<Database> }
//!
//! # async fn run() -> mini_cqrs_di::Result<()> {
//! let mut services = ServiceCollection::new();
//! services
//!     .add_singleton::<Database, _, _>(|_| async {
//!         anyhow::Ok(Arc::new(Database { url: "memory://".into() }))
//!     })?
//!     .add_scoped::<Repository, _, _>(|r| async move {
//!         anyhow::Ok(Arc::new(Repository { db: r.resolve::<Database>().await? }))
//!     })?;
//!
//! let container = services.build();
//! let scope = container.create_scope();
//! let repository = scope.resolve::<Repository>().await?;
//! assert_eq!(repository.db.url, "memory://");
//! scope.dispose().await;
//! # Ok(())
//! # }
//! ```

mod descriptor;
mod lifetime;
mod resolver;
mod scope;

pub use descriptor::{Dispose, ServiceDescriptor, ServiceKey};
pub use lifetime::Lifetime;
pub use resolver::{ResolutionChain, Resolver};
pub use scope::ServiceScope;

use std::{collections::HashMap, future::Future, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::{CqrsError, RegistrationPolicy, Result};
use descriptor::{Instance, TrackedInstance, release_all};

/// Registration table, built once during startup.
#[derive(Debug, Default)]
pub struct ServiceCollection {
    descriptors: HashMap<ServiceKey, ServiceDescriptor>,
    policy: RegistrationPolicy,
}

impl ServiceCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: RegistrationPolicy) -> Self {
        Self {
            descriptors: HashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> RegistrationPolicy {
        self.policy
    }

    /// Stores a descriptor. With [`RegistrationPolicy::Replace`] the last registration for a
    /// key wins; with [`RegistrationPolicy::Reject`] a second one is an error.
    pub fn register(&mut self, descriptor: ServiceDescriptor) -> Result<&mut Self> {
        let key = descriptor.key();
        if self.descriptors.contains_key(&key) {
            match self.policy {
                RegistrationPolicy::Reject => {
                    return Err(CqrsError::DuplicateRegistration {
                        service: key.name(),
                    });
                }
                RegistrationPolicy::Replace => {
                    tracing::debug!(service = key.name(), "replacing service registration");
                }
            }
        }

        self.descriptors.insert(key, descriptor);
        Ok(self)
    }

    pub fn add_singleton<T, F, Fut>(&mut self, factory: F) -> Result<&mut Self>
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(Resolver) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Arc<T>>> + Send + 'static,
    {
        self.register(ServiceDescriptor::new::<T, F, Fut>(
            Lifetime::Singleton,
            factory,
        ))
    }

    pub fn add_singleton_instance<T>(&mut self, service: Arc<T>) -> Result<&mut Self>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.register(ServiceDescriptor::instance(service))
    }

    pub fn add_scoped<T, F, Fut>(&mut self, factory: F) -> Result<&mut Self>
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(Resolver) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Arc<T>>> + Send + 'static,
    {
        self.register(ServiceDescriptor::new::<T, F, Fut>(Lifetime::Scoped, factory))
    }

    pub fn add_transient<T, F, Fut>(&mut self, factory: F) -> Result<&mut Self>
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(Resolver) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Arc<T>>> + Send + 'static,
    {
        self.register(ServiceDescriptor::new::<T, F, Fut>(
            Lifetime::Transient,
            factory,
        ))
    }

    /// Registers a service whose [`Dispose`] hook runs when its owner is disposed.
    pub fn add_disposable<T, F, Fut>(&mut self, lifetime: Lifetime, factory: F) -> Result<&mut Self>
    where
        T: ?Sized + Dispose + 'static,
        F: Fn(Resolver) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Arc<T>>> + Send + 'static,
    {
        self.register(ServiceDescriptor::disposable::<T, F, Fut>(lifetime, factory))
    }

    pub fn contains<T: ?Sized + 'static>(&self) -> bool {
        self.descriptors.contains_key(&ServiceKey::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn build(self) -> ServiceContainer {
        let singletons = self
            .descriptors
            .values()
            .filter(|descriptor| descriptor.lifetime() == Lifetime::Singleton)
            .map(|descriptor| (descriptor.key(), OnceCell::new()))
            .collect();

        tracing::debug!(services = self.descriptors.len(), "service container built");

        ServiceContainer {
            inner: Arc::new(ContainerInner {
                descriptors: self.descriptors,
                singletons,
                tracked: Mutex::new(Vec::new()),
            }),
        }
    }
}

/// Root resolver. Cheap to clone; clones share registrations and singletons.
#[derive(Clone)]
pub struct ServiceContainer {
    inner: Arc<ContainerInner>,
}

struct ContainerInner {
    descriptors: HashMap<ServiceKey, ServiceDescriptor>,
    // One cell per singleton: concurrent first requests wait on the same construction.
    singletons: HashMap<ServiceKey, OnceCell<Instance>>,
    tracked: Mutex<Vec<TrackedInstance>>,
}

impl ServiceContainer {
    pub fn create_scope(&self) -> ServiceScope {
        ServiceScope::new(self.clone())
    }

    /// Resolves a singleton or transient service. Scoped services fail here, they need a
    /// [`ServiceScope`].
    pub async fn resolve<T>(&self) -> Result<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let key = ServiceKey::of::<T>();
        let instance = self
            .resolve_key(key, None, &ResolutionChain::default())
            .await?;
        descriptor::downcast(key, &instance)
    }

    pub async fn try_resolve<T>(&self) -> Result<Option<Arc<T>>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        if !self.is_registered::<T>() {
            return Ok(None);
        }
        self.resolve::<T>().await.map(Some)
    }

    pub fn is_registered<T: ?Sized + 'static>(&self) -> bool {
        self.is_registered_key(ServiceKey::of::<T>())
    }

    pub fn is_registered_key(&self, key: ServiceKey) -> bool {
        self.inner.descriptors.contains_key(&key)
    }

    pub fn lifetime_of(&self, key: ServiceKey) -> Option<Lifetime> {
        self.inner.descriptors.get(&key).map(ServiceDescriptor::lifetime)
    }

    /// Runs `work` inside a fresh scope and disposes the scope on every exit path.
    pub async fn run_scoped<F, Fut, T, E>(&self, work: F) -> std::result::Result<T, E>
    where
        F: FnOnce(ServiceScope) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let scope = self.create_scope();
        let outcome = work(scope.clone()).await;
        scope.dispose().await;
        outcome
    }

    /// Releases the singletons built so far, newest first. Meant for application shutdown.
    pub async fn dispose(&self) {
        let tracked = std::mem::take(&mut *self.inner.tracked.lock());
        tracing::debug!(pending = tracked.len(), "disposing service container");
        release_all("container".to_string(), tracked).await;
    }

    pub(crate) async fn resolve_key(
        &self,
        key: ServiceKey,
        scope: Option<&ServiceScope>,
        chain: &ResolutionChain,
    ) -> Result<Instance> {
        if let Some(scope) = scope {
            scope.ensure_active(key)?;
        }
        if chain.contains(key) {
            return Err(CqrsError::CircularDependency {
                chain: chain.with(key),
            });
        }

        let descriptor =
            self.inner
                .descriptors
                .get(&key)
                .ok_or(CqrsError::ServiceNotRegistered {
                    service: key.name(),
                })?;
        let chain = chain.with(key);

        match descriptor.lifetime() {
            Lifetime::Singleton => self.singleton(descriptor, chain).await,
            Lifetime::Scoped => {
                let scope = scope.ok_or(CqrsError::ScopedServiceOutsideScope {
                    service: key.name(),
                })?;
                if let Some(instance) = scope.cached(key)? {
                    return Ok(instance);
                }
                let instance = self
                    .construct(descriptor, Some(scope.clone()), chain)
                    .await?;
                scope.adopt(key, instance, descriptor.disposer()).await
            }
            Lifetime::Transient => {
                let instance = self.construct(descriptor, scope.cloned(), chain).await?;
                if let Some(disposer) = descriptor.disposer() {
                    match scope {
                        Some(scope) => {
                            scope
                                .track(TrackedInstance::new(
                                    key,
                                    instance.clone(),
                                    disposer.clone(),
                                ))
                                .await?
                        }
                        None => tracing::debug!(
                            service = key.name(),
                            "disposable transient resolved outside a scope is not tracked"
                        ),
                    }
                }
                Ok(instance)
            }
        }
    }

    async fn singleton(
        &self,
        descriptor: &ServiceDescriptor,
        chain: ResolutionChain,
    ) -> Result<Instance> {
        let key = descriptor.key();
        let cell = self
            .inner
            .singletons
            .get(&key)
            .ok_or(CqrsError::ServiceNotRegistered {
                service: key.name(),
            })?;

        let instance = cell
            .get_or_try_init(|| async move {
                let instance = self.construct(descriptor, None, chain).await?;
                if let Some(disposer) = descriptor.disposer() {
                    self.inner.tracked.lock().push(TrackedInstance::new(
                        key,
                        instance.clone(),
                        disposer.clone(),
                    ));
                }
                Ok::<_, CqrsError>(instance)
            })
            .await?;

        Ok(instance.clone())
    }

    async fn construct(
        &self,
        descriptor: &ServiceDescriptor,
        scope: Option<ServiceScope>,
        chain: ResolutionChain,
    ) -> Result<Instance> {
        let key = descriptor.key();
        tracing::debug!(
            service = key.name(),
            lifetime = %descriptor.lifetime(),
            scope_id = ?scope.as_ref().map(ServiceScope::id),
            "constructing service"
        );

        let resolver = Resolver::new(self.clone(), scope, chain.clone());
        descriptor
            .build(resolver)
            .await
            .map_err(|source| construction_error(key, chain, source))
    }
}

/// Wraps a factory failure with the chain that led to it. Errors that already carry a
/// deeper chain pass through untouched.
fn construction_error(key: ServiceKey, chain: ResolutionChain, source: anyhow::Error) -> CqrsError {
    match source.downcast::<CqrsError>() {
        Ok(
            error @ (CqrsError::ServiceConstruction { .. }
            | CqrsError::CircularDependency { .. }
            | CqrsError::ScopeDisposed { .. }),
        ) => error,
        Ok(error) => CqrsError::ServiceConstruction {
            service: key.name(),
            chain,
            source: error.into(),
        },
        Err(source) => CqrsError::ServiceConstruction {
            service: key.name(),
            chain,
            source,
        },
    }
}
