use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::anyhow;
use parking_lot::Mutex;

use mini_cqrs_di::{
    CqrsError, Dispose, FailurePolicy, Lifetime, MediatorBuilder, MediatorConfig, MessageContext, MessageKind, Next,
    Notification, NotificationHandler, PipelineBehavior, PipelineResult, PublishStrategy, Request,
    RequestHandler, Result, ServiceCollection, ServiceContainer, async_trait,
};

type Log = Arc<Mutex<Vec<String>>>;

#[derive(Debug)]
struct Greet(String);

impl Request for Greet {
    type Response = String;
}

struct Greeter {
    log: Log,
}

#[async_trait]
impl RequestHandler<Greet> for Greeter {
    async fn handle(&self, request: &Greet) -> Result<String> {
        self.log.lock().push("handler".to_string());
        Ok(format!("hello {}", request.0))
    }
}

struct Impostor;

#[async_trait]
impl RequestHandler<Greet> for Impostor {
    async fn handle(&self, _: &Greet) -> Result<String> {
        Ok("who?".to_string())
    }
}

#[derive(Debug)]
struct Ping(u32);

impl Notification for Ping {}

struct First(Log);
struct Second(Log);
struct Third(Log);

#[async_trait]
impl NotificationHandler<Ping> for First {
    async fn handle(&self, ping: &Ping) -> Result<()> {
        self.0.lock().push(format!("first:{}", ping.0));
        Ok(())
    }
}

#[async_trait]
impl NotificationHandler<Ping> for Second {
    async fn handle(&self, ping: &Ping) -> Result<()> {
        self.0.lock().push(format!("second:{}", ping.0));
        Err(anyhow!("second refuses ping {}", ping.0).into())
    }
}

#[async_trait]
impl NotificationHandler<Ping> for Third {
    async fn handle(&self, ping: &Ping) -> Result<()> {
        self.0.lock().push(format!("third:{}", ping.0));
        Ok(())
    }
}

struct Tracer {
    name: &'static str,
    log: Log,
}

#[async_trait]
impl PipelineBehavior for Tracer {
    async fn handle(&self, context: &MessageContext<'_>, next: Next<'_>) -> PipelineResult {
        if context.kind() == MessageKind::Request {
            self.log.lock().push(format!("{}:in", self.name));
        }
        let outcome = next.run().await;
        if context.kind() == MessageKind::Request {
            self.log.lock().push(format!("{}:out", self.name));
        }
        outcome
    }
}

struct Rename;

#[async_trait]
impl PipelineBehavior for Rename {
    async fn handle(&self, _: &MessageContext<'_>, next: Next<'_>) -> PipelineResult {
        next.run().await.map_err(|error| {
            CqrsError::Generic(anyhow!("greeting failed: {error}"))
        })
    }
}

fn container(log: &Log) -> ServiceContainer {
    let mut services = ServiceCollection::new();
    let (greeter, first, second, third) = (log.clone(), log.clone(), log.clone(), log.clone());
    services
        .add_transient::<Greeter, _, _>(move |_| {
            let log = greeter.clone();
            async move { anyhow::Ok(Arc::new(Greeter { log })) }
        })
        .unwrap()
        .add_transient::<Impostor, _, _>(|_| async { anyhow::Ok(Arc::new(Impostor)) })
        .unwrap()
        .add_transient::<First, _, _>(move |_| {
            let log = first.clone();
            async move { anyhow::Ok(Arc::new(First(log))) }
        })
        .unwrap()
        .add_transient::<Second, _, _>(move |_| {
            let log = second.clone();
            async move { anyhow::Ok(Arc::new(Second(log))) }
        })
        .unwrap()
        .add_transient::<Third, _, _>(move |_| {
            let log = third.clone();
            async move { anyhow::Ok(Arc::new(Third(log))) }
        })
        .unwrap();
    services.build()
}

fn ping_mediator(config: MediatorConfig) -> MediatorBuilder {
    let mut builder = MediatorBuilder::with_config(config);
    builder
        .notification_handler::<Ping, First>()
        .notification_handler::<Ping, Second>()
        .notification_handler::<Ping, Third>();
    builder
}

#[tokio::test]
async fn execute_without_handler_fails() {
    let log = Log::default();
    let container = container(&log);
    let mediator = MediatorBuilder::new().build(container.clone());

    let err = mediator
        .execute(&container.create_scope(), Greet("ada".into()))
        .await
        .unwrap_err();

    assert!(matches!(err, CqrsError::HandlerNotFound { .. }));
}

#[tokio::test]
async fn execute_with_two_handlers_is_ambiguous() {
    let log = Log::default();
    let container = container(&log);
    let mut builder = MediatorBuilder::new();
    builder
        .request_handler::<Greet, Greeter>()
        .request_handler::<Greet, Impostor>();
    let mediator = builder.build(container.clone());

    let err = mediator
        .execute(&container.create_scope(), Greet("ada".into()))
        .await
        .unwrap_err();

    assert!(matches!(err, CqrsError::AmbiguousHandler { .. }));
    assert!(matches!(
        mediator.validate(),
        Err(CqrsError::AmbiguousHandler { .. })
    ));
    assert!(log.lock().is_empty());
}

#[tokio::test]
async fn behaviors_wrap_the_handler_like_middleware() {
    let log = Log::default();
    let container = container(&log);
    let mut builder = MediatorBuilder::new();
    builder
        .request_handler::<Greet, Greeter>()
        .behavior(Tracer {
            name: "outer",
            log: log.clone(),
        })
        .behavior(Tracer {
            name: "inner",
            log: log.clone(),
        });
    let mediator = builder.build(container.clone());

    let reply = mediator
        .execute(&container.create_scope(), Greet("ada".into()))
        .await
        .unwrap();

    assert_eq!(reply, "hello ada");
    assert_eq!(
        *log.lock(),
        ["outer:in", "inner:in", "handler", "inner:out", "outer:out"]
    );
    mediator.validate().unwrap();
}

#[tokio::test]
async fn behaviors_can_transform_errors() {
    let log = Log::default();
    let mut services = ServiceCollection::new();
    services
        .add_transient::<Greeter, _, _>(|_| async {
            Err::<Arc<Greeter>, _>(anyhow!("greeter unavailable"))
        })
        .unwrap();
    let container = services.build();

    let mut builder = MediatorBuilder::new();
    builder.request_handler::<Greet, Greeter>().behavior(Rename);
    let mediator = builder.build(container.clone());

    let err = mediator
        .execute(&container.create_scope(), Greet("ada".into()))
        .await
        .unwrap_err();

    let rendered = err.to_string();
    assert!(rendered.contains("greeting failed"));
    assert!(rendered.contains("greeter unavailable"));
    assert!(log.lock().is_empty());
}

#[tokio::test]
async fn publish_without_handlers_is_a_no_op() {
    let log = Log::default();
    let container = container(&log);
    let mediator = MediatorBuilder::new().build(container);

    mediator.publish(&Ping(1)).await.unwrap();
    assert!(log.lock().is_empty());
}

#[tokio::test]
async fn publish_runs_every_handler_in_order_and_reports_failures() {
    let log = Log::default();
    let container = container(&log);
    let mediator = ping_mediator(MediatorConfig::default()).build(container);

    let err = mediator.publish(&Ping(7)).await.unwrap_err();

    assert_eq!(*log.lock(), ["first:7", "second:7", "third:7"]);
    let failures = err.handler_failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].handler.ends_with("Second"));
    assert!(failures[0].notification.ends_with("Ping"));
    assert!(failures[0].error.to_string().contains("refuses ping 7"));
}

#[tokio::test]
async fn fail_fast_stops_at_the_first_failure() {
    let log = Log::default();
    let container = container(&log);
    let mediator = ping_mediator(MediatorConfig {
        failure_policy: FailurePolicy::FailFast,
        ..MediatorConfig::default()
    })
    .build(container);

    let err = mediator.publish(&Ping(3)).await.unwrap_err();

    assert_eq!(*log.lock(), ["first:3", "second:3"]);
    assert_eq!(err.handler_failures().len(), 1);
}

#[tokio::test]
async fn parallel_publish_still_attempts_every_handler() {
    let log = Log::default();
    let container = container(&log);
    let mediator = ping_mediator(MediatorConfig {
        publish_strategy: PublishStrategy::Parallel,
        failure_policy: FailurePolicy::ContinueOnError,
    })
    .build(container);

    let err = mediator.publish(&Ping(5)).await.unwrap_err();

    let mut seen = log.lock().clone();
    seen.sort();
    assert_eq!(seen, ["first:5", "second:5", "third:5"]);
    assert_eq!(err.handler_failures().len(), 1);
}

#[derive(Debug)]
struct Audit;

impl Notification for Audit {}

/// Scoped resource counting how many handler scopes took one and released it.
#[derive(Default)]
struct Leases {
    acquired: AtomicUsize,
    released: AtomicUsize,
}

struct Lease(Arc<Leases>);

#[async_trait]
impl Dispose for Lease {
    async fn dispose(&self) -> anyhow::Result<()> {
        self.0.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Steady(#[allow(dead_code)] Arc<Lease>);
struct Broken(#[allow(dead_code)] Arc<Lease>);

#[async_trait]
impl NotificationHandler<Audit> for Steady {
    async fn handle(&self, _: &Audit) -> Result<()> {
        tokio::task::yield_now().await;
        Ok(())
    }
}

#[async_trait]
impl NotificationHandler<Audit> for Broken {
    async fn handle(&self, _: &Audit) -> Result<()> {
        Err(anyhow!("audit trail unavailable").into())
    }
}

#[tokio::test]
async fn parallel_fail_fast_reports_once_and_releases_every_scope() {
    let leases = Arc::new(Leases::default());
    let mut services = ServiceCollection::new();
    let counts = leases.clone();
    services
        .add_disposable::<Lease, _, _>(Lifetime::Scoped, move |_| {
            let counts = counts.clone();
            async move {
                counts.acquired.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(Arc::new(Lease(counts)))
            }
        })
        .unwrap()
        .add_transient::<Steady, _, _>(|r| async move {
            anyhow::Ok(Arc::new(Steady(r.resolve::<Lease>().await?)))
        })
        .unwrap()
        .add_transient::<Broken, _, _>(|r| async move {
            anyhow::Ok(Arc::new(Broken(r.resolve::<Lease>().await?)))
        })
        .unwrap();

    let mut builder = MediatorBuilder::with_config(MediatorConfig {
        publish_strategy: PublishStrategy::Parallel,
        failure_policy: FailurePolicy::FailFast,
    });
    builder
        .notification_handler::<Audit, Steady>()
        .notification_handler::<Audit, Broken>();
    let mediator = builder.build(services.build());

    let err = mediator.publish(&Audit).await.unwrap_err();

    let failures = err.handler_failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].handler.ends_with("Broken"));

    // Handlers cut short by the failure release their scope in the background.
    for _ in 0..50 {
        if leases.released.load(Ordering::SeqCst) == leases.acquired.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let acquired = leases.acquired.load(Ordering::SeqCst);
    assert!(acquired >= 1);
    assert_eq!(leases.released.load(Ordering::SeqCst), acquired);
}

#[tokio::test]
async fn installed_mediator_is_resolvable_from_scopes() {
    let log = Log::default();
    let mut services = ServiceCollection::new();
    let greeter = log.clone();
    services
        .add_transient::<Greeter, _, _>(move |_| {
            let log = greeter.clone();
            async move { anyhow::Ok(Arc::new(Greeter { log })) }
        })
        .unwrap();

    let mut builder = MediatorBuilder::new();
    builder.request_handler::<Greet, Greeter>();
    builder.install(&mut services).unwrap();
    let container = services.build();

    let scope = container.create_scope();
    let mediator = scope.resolve::<mini_cqrs_di::Mediator>().await.unwrap();
    let reply = mediator.execute(&scope, Greet("bob".into())).await.unwrap();

    assert_eq!(reply, "hello bob");
    scope.dispose().await;
}
