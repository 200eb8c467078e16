/// # MiniCQRS/DI Example: Orders
///
/// An order is created and filled through commands; its events are published after each
/// save, every notification handler running in its own scope.
///
/// ## Usage
///
/// ```sh
/// RUST_LOG=debug cargo run --example orders
/// ```
///
use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize};

use mini_cqrs_di::{
    Aggregate, AggregateRoot, AggregateState, CqrsConfig, CqrsError, EventSourcedRepository,
    EventStore, InMemoryEventStore, LoggingBehavior, Mediator, MediatorBuilder,
    NotificationHandler, Repository, Request, RequestHandler, Result, ServiceCollection,
    UnitOfWork, UnitOfWorkBehavior, Uuid, async_trait, domain_event, telemetry,
};

// Events

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: Uuid,
    pub customer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineAdded {
    pub order_id: Uuid,
    pub sku: String,
    pub quantity: u32,
}

domain_event! {
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub enum OrderEvent {
        Placed(OrderPlaced),
        LineAdded(LineAdded),
    }
}

// Aggregate

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct OrderState {
    id: Uuid,
    version: u64,
    customer: String,
    lines: BTreeMap<String, u32>,
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
            OrderEvent::Placed(e) => {
                self.id = e.order_id;
                self.customer = e.customer.clone();
            }
            OrderEvent::LineAdded(e) => *self.lines.entry(e.sku.clone()).or_default() += e.quantity,
        }
        self.version += 1;
    }
}

pub struct Order {
    root: AggregateRoot<OrderState>,
}

impl Order {
    fn place(order_id: Uuid, customer: &str) -> Result<Self> {
        let mut root = AggregateRoot::new();
        root.record(
            OrderPlaced {
                order_id,
                customer: customer.to_string(),
            }
            .into(),
        )?;
        Ok(Self { root })
    }

    fn add_line(&mut self, sku: &str, quantity: u32) -> Result<()> {
        if quantity == 0 {
            return Err(CqrsError::Generic(anyhow::anyhow!("quantity must be positive")));
        }
        self.root.record(
            LineAdded {
                order_id: self.root.id(),
                sku: sku.to_string(),
                quantity,
            }
            .into(),
        )
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

type Orders = EventSourcedRepository<Order>;

// Commands

#[derive(Debug)]
struct PlaceOrder {
    customer: String,
}

impl Request for PlaceOrder {
    type Response = Uuid;
}

#[derive(Debug)]
struct AddLine {
    order_id: Uuid,
    sku: String,
    quantity: u32,
}

impl Request for AddLine {
    type Response = u64;
}

struct PlaceOrderHandler {
    orders: Arc<Orders>,
}

#[async_trait]
impl RequestHandler<PlaceOrder> for PlaceOrderHandler {
    async fn handle(&self, command: &PlaceOrder) -> Result<Uuid> {
        let order = Order::place(Uuid::new_v4(), &command.customer)?;
        self.orders.save(&order).await?;
        Ok(order.root.id())
    }
}

struct AddLineHandler {
    orders: Arc<Orders>,
}

#[async_trait]
impl RequestHandler<AddLine> for AddLineHandler {
    async fn handle(&self, command: &AddLine) -> Result<u64> {
        let mut order: Order = self.orders.get_by_id(command.order_id).await?;
        order.add_line(&command.sku, command.quantity)?;
        self.orders.save(&order).await?;
        Ok(order.root.version())
    }
}

// Notification handlers

struct Confirmation;

#[async_trait]
impl NotificationHandler<OrderPlaced> for Confirmation {
    async fn handle(&self, event: &OrderPlaced) -> Result<()> {
        println!("confirmation sent to {} for order {}", event.customer, event.order_id);
        Ok(())
    }
}

struct Picking;

#[async_trait]
impl NotificationHandler<LineAdded> for Picking {
    async fn handle(&self, event: &LineAdded) -> Result<()> {
        println!("pick {} x {} for order {}", event.quantity, event.sku, event.order_id);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    telemetry::init();
    let config = CqrsConfig::from_env()?;

    let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
    let mut services = ServiceCollection::with_policy(config.registration_policy);
    services
        .add_singleton_instance::<dyn EventStore>(store)?
        .add_scoped::<Orders, _, _>(|r| async move {
            let store = r.resolve::<dyn EventStore>().await?;
            let unit_of_work = r.resolve::<UnitOfWork>().await?;
            anyhow::Ok(Arc::new(Orders::new(store).with_unit_of_work(unit_of_work)))
        })?
        .add_transient::<PlaceOrderHandler, _, _>(|r| async move {
            let orders = r.resolve::<Orders>().await?;
            anyhow::Ok(Arc::new(PlaceOrderHandler { orders }))
        })?
        .add_transient::<AddLineHandler, _, _>(|r| async move {
            let orders = r.resolve::<Orders>().await?;
            anyhow::Ok(Arc::new(AddLineHandler { orders }))
        })?
        .add_transient::<Confirmation, _, _>(|_| async { anyhow::Ok(Arc::new(Confirmation)) })?
        .add_transient::<Picking, _, _>(|_| async { anyhow::Ok(Arc::new(Picking)) })?;
    UnitOfWork::install(&mut services)?;

    let mut mediator = MediatorBuilder::with_config(config.mediator);
    mediator
        .request_handler::<PlaceOrder, PlaceOrderHandler>()
        .request_handler::<AddLine, AddLineHandler>()
        .notification_handler::<OrderPlaced, Confirmation>()
        .notification_handler::<LineAdded, Picking>()
        .behavior(LoggingBehavior)
        .behavior(UnitOfWorkBehavior);
    mediator.install(&mut services)?;

    let container = services.build();
    container.resolve::<Mediator>().await?.validate()?;

    let order_id = container
        .run_scoped(|scope| async move {
            let mediator = scope.resolve::<Mediator>().await?;
            mediator
                .execute(
                    &scope,
                    PlaceOrder {
                        customer: "ada".to_string(),
                    },
                )
                .await
        })
        .await?;

    for (sku, quantity) in [("apple", 3), ("pear", 1)] {
        let version = container
            .run_scoped(|scope| async move {
                let mediator = scope.resolve::<Mediator>().await?;
                mediator
                    .execute(
                        &scope,
                        AddLine {
                            order_id,
                            sku: sku.to_string(),
                            quantity,
                        },
                    )
                    .await
            })
            .await?;
        println!("order {order_id} now at version {version}");
    }

    container.dispose().await;
    Ok(())
}
