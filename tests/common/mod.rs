#![allow(dead_code)]

// Order domain shared by the integration tests.

use std::{collections::BTreeMap, sync::Arc};

use anyhow::{anyhow, bail};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use mini_cqrs_di::{
    Aggregate, AggregateRoot, AggregateState, Dispose, EventSourcedRepository, EventStore,
    InMemoryEventStore, Lifetime, MediatorBuilder, NotificationHandler, Repository, Request,
    RequestHandler, Result, ServiceCollection, UnitOfWork, UnitOfWorkBehavior, Uuid,
    async_trait, domain_event,
};

// Events

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub order_id: Uuid,
    pub customer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemAdded {
    pub order_id: Uuid,
    pub sku: String,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRemoved {
    pub order_id: Uuid,
    pub sku: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderConfirmed {
    pub order_id: Uuid,
}

domain_event! {
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub enum OrderEvent {
        Created(OrderCreated),
        ItemAdded(ItemAdded),
        ItemRemoved(ItemRemoved),
        Confirmed(OrderConfirmed),
    }
}

// State

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderState {
    pub id: Uuid,
    pub version: u64,
    pub customer: String,
    pub items: BTreeMap<String, u32>,
    pub confirmed: bool,
}

impl AggregateState for OrderState {
    type Event = OrderEvent;

    fn aggregate_id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn apply(&mut self, event: &OrderEvent) {
        match event {
            OrderEvent::Created(e) => {
                self.id = e.order_id;
                self.customer = e.customer.clone();
            }
            OrderEvent::ItemAdded(e) => {
                *self.items.entry(e.sku.clone()).or_default() += e.quantity;
            }
            OrderEvent::ItemRemoved(e) => {
                self.items.remove(&e.sku);
            }
            OrderEvent::Confirmed(_) => self.confirmed = true,
        }
        self.version += 1;
    }
}

// Aggregate

#[derive(Debug)]
pub struct Order {
    root: AggregateRoot<OrderState>,
}

impl Order {
    pub fn create(order_id: Uuid, customer: &str) -> Result<Self> {
        let mut root = AggregateRoot::new();
        root.record(
            OrderCreated {
                order_id,
                customer: customer.to_string(),
            }
            .into(),
        )?;
        Ok(Self { root })
    }

    pub fn add_item(&mut self, sku: &str, quantity: u32) -> Result<()> {
        if self.root.state().confirmed {
            return Err(anyhow!("order {} is already confirmed", self.id()).into());
        }
        if quantity == 0 {
            return Err(anyhow!("quantity must be positive").into());
        }
        self.root.record(
            ItemAdded {
                order_id: self.id(),
                sku: sku.to_string(),
                quantity,
            }
            .into(),
        )
    }

    pub fn remove_item(&mut self, sku: &str) -> Result<()> {
        if !self.root.state().items.contains_key(sku) {
            return Err(anyhow!("order {} has no item `{sku}`", self.id()).into());
        }
        self.root.record(
            ItemRemoved {
                order_id: self.id(),
                sku: sku.to_string(),
            }
            .into(),
        )
    }

    pub fn confirm(&mut self) -> Result<()> {
        if self.root.state().items.is_empty() {
            return Err(anyhow!("order {} is empty", self.id()).into());
        }
        self.root.record(OrderConfirmed { order_id: self.id() }.into())
    }

    pub fn id(&self) -> Uuid {
        self.root.id()
    }

    pub fn state(&self) -> &OrderState {
        self.root.state()
    }
}

impl Aggregate for Order {
    type State = OrderState;

    fn from_root(root: AggregateRoot<OrderState>) -> Self {
        Self { root }
    }

    fn root(&self) -> &AggregateRoot<OrderState> {
        &self.root
    }
}

pub type OrderRepository = EventSourcedRepository<Order>;

// Commands

#[derive(Debug, Clone)]
pub struct CreateOrder {
    pub order_id: Uuid,
    pub customer: String,
}

impl Request for CreateOrder {
    type Response = Uuid;
}

#[derive(Debug, Clone)]
pub struct AddItem {
    pub order_id: Uuid,
    pub sku: String,
    pub quantity: u32,
}

impl Request for AddItem {
    type Response = u64;
}

pub struct CreateOrderHandler {
    repository: Arc<OrderRepository>,
}

#[async_trait]
impl RequestHandler<CreateOrder> for CreateOrderHandler {
    async fn handle(&self, command: &CreateOrder) -> Result<Uuid> {
        let order = Order::create(command.order_id, &command.customer)?;
        self.repository.save(&order).await?;
        Ok(order.id())
    }
}

pub struct AddItemHandler {
    repository: Arc<OrderRepository>,
}

#[async_trait]
impl RequestHandler<AddItem> for AddItemHandler {
    async fn handle(&self, command: &AddItem) -> Result<u64> {
        let mut order: Order = self.repository.get_by_id(command.order_id).await?;
        order.add_item(&command.sku, command.quantity)?;
        self.repository.save(&order).await?;
        Ok(order.state().version)
    }
}

// Observers

/// Append-only log shared by handlers and assertions.
#[derive(Debug, Default)]
pub struct Journal(Mutex<Vec<String>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.0
            .lock()
            .iter()
            .filter(|entry| entry.starts_with(prefix))
            .count()
    }
}

pub struct Mailer {
    journal: Arc<Journal>,
}

#[async_trait]
impl NotificationHandler<OrderCreated> for Mailer {
    async fn handle(&self, event: &OrderCreated) -> Result<()> {
        self.journal.record(format!("mailer:{}", event.order_id));
        Ok(())
    }
}

pub struct Auditor {
    journal: Arc<Journal>,
}

#[async_trait]
impl NotificationHandler<OrderCreated> for Auditor {
    async fn handle(&self, event: &OrderCreated) -> Result<()> {
        self.journal.record(format!("auditor:{}", event.order_id));
        Ok(())
    }
}

pub struct Sequencer {
    journal: Arc<Journal>,
}

#[async_trait]
impl NotificationHandler<OrderCreated> for Sequencer {
    async fn handle(&self, _: &OrderCreated) -> Result<()> {
        self.journal.record("event:Created");
        Ok(())
    }
}

#[async_trait]
impl NotificationHandler<ItemAdded> for Sequencer {
    async fn handle(&self, event: &ItemAdded) -> Result<()> {
        self.journal.record(format!("event:ItemAdded:{}", event.sku));
        Ok(())
    }
}

#[async_trait]
impl NotificationHandler<OrderConfirmed> for Sequencer {
    async fn handle(&self, _: &OrderConfirmed) -> Result<()> {
        self.journal.record("event:Confirmed");
        Ok(())
    }
}

/// Scoped service tagged with the scope that built it; logs its release.
pub struct ScopeTag {
    pub scope_id: Uuid,
    journal: Arc<Journal>,
}

#[async_trait]
impl Dispose for ScopeTag {
    async fn dispose(&self) -> anyhow::Result<()> {
        self.journal.record(format!("released:{}", self.scope_id));
        Ok(())
    }
}

// Wiring

/// Registers the order domain: event store, journal, repository, unit of work, command
/// handlers and the notification handlers used across tests.
pub fn order_services(store: &Arc<InMemoryEventStore>, journal: &Arc<Journal>) -> ServiceCollection {
    let mut services = ServiceCollection::new();
    register_order_services(&mut services, store, journal).expect("order services");
    services
}

fn register_order_services(
    services: &mut ServiceCollection,
    store: &Arc<InMemoryEventStore>,
    journal: &Arc<Journal>,
) -> Result<()> {
    let events: Arc<dyn EventStore> = store.clone();

    services
        .add_singleton_instance::<dyn EventStore>(events)?
        .add_singleton_instance::<Journal>(journal.clone())?
        .add_scoped::<OrderRepository, _, _>(|r| async move {
            let events = r.resolve::<dyn EventStore>().await?;
            let unit_of_work = r.resolve::<UnitOfWork>().await?;
            anyhow::Ok(Arc::new(
                OrderRepository::new(events).with_unit_of_work(unit_of_work),
            ))
        })?
        .add_transient::<CreateOrderHandler, _, _>(|r| async move {
            let repository = r.resolve::<OrderRepository>().await?;
            anyhow::Ok(Arc::new(CreateOrderHandler { repository }))
        })?
        .add_transient::<AddItemHandler, _, _>(|r| async move {
            let repository = r.resolve::<OrderRepository>().await?;
            anyhow::Ok(Arc::new(AddItemHandler { repository }))
        })?
        .add_transient::<Mailer, _, _>(|r| async move {
            let journal = r.resolve::<Journal>().await?;
            anyhow::Ok(Arc::new(Mailer { journal }))
        })?
        .add_transient::<Auditor, _, _>(|r| async move {
            let journal = r.resolve::<Journal>().await?;
            anyhow::Ok(Arc::new(Auditor { journal }))
        })?
        .add_transient::<Sequencer, _, _>(|r| async move {
            let journal = r.resolve::<Journal>().await?;
            anyhow::Ok(Arc::new(Sequencer { journal }))
        })?
        .add_disposable::<ScopeTag, _, _>(Lifetime::Scoped, |r| async move {
            let journal = r.resolve::<Journal>().await?;
            let scope_id = r
                .scope()
                .map(|scope| scope.id())
                .ok_or_else(|| anyhow!("ScopeTag needs a scope"))?;
            if journal.count(&format!("released:{scope_id}")) > 0 {
                bail!("scope {scope_id} reused after release");
            }
            anyhow::Ok(Arc::new(ScopeTag { scope_id, journal }))
        })?;

    UnitOfWork::install(services)
}

/// Mediator with both command handlers and the unit-of-work behavior.
pub fn order_mediator() -> MediatorBuilder {
    let mut builder = MediatorBuilder::new();
    builder
        .request_handler::<CreateOrder, CreateOrderHandler>()
        .request_handler::<AddItem, AddItemHandler>()
        .behavior(UnitOfWorkBehavior);
    builder
}
