// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Order Pipeline Example - Demonstrates a multi-step durable routine.
//!
//! This example shows:
//! - Registering services and routine methods
//! - A suspendable `Checkout` routine awaiting two sub-routines in turn
//! - A stateful `Inventory` service whose stock survives between routines
//! - Draining the transition queue with a worker
//!
//! Persistence is in-memory unless `DURASTEP_DATABASE_URL` is set, e.g.
//! `DURASTEP_DATABASE_URL=sqlite:orders.db?mode=rwc`.
//!
//! Run with: cargo run -p durastep-example --bin order_pipeline

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use serde_json::json;
use tracing::{error, info};

use durastep_core::{
    Config, ExecuteRoutineIntent, Frame, IntentId, MemoryPersistence, NamedValues, Persistence,
    Position, ResultShape, RoutineMethod, ServiceDefinition, ServiceHandle, ServiceId,
    ServiceObject, ServiceRegistry, SharedValues, SlotSchema, SqlitePersistence, StepContext,
    StepOutcome, SuspendableComputation, TransitionWorker, Waiter, WaiterCapture, WorkerConfig,
};

const INITIAL_STOCK: i64 = 5;

struct OrdersService;

impl ServiceObject for OrdersService {
    fn concrete_type(&self) -> &str {
        "OrdersService"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct PricingService;

impl ServiceObject for PricingService {
    fn concrete_type(&self) -> &str {
        "PricingService"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Warehouse stock, persisted as a sku → units map.
struct InventoryService {
    state: SharedValues,
}

impl ServiceObject for InventoryService {
    fn concrete_type(&self) -> &str {
        "InventoryService"
    }

    fn persisted_state(&self) -> Option<SharedValues> {
        Some(self.state.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Reserve stock, then quote, then complete with the order total.
#[derive(Default)]
struct Checkout {
    pending: Option<Waiter>,
}

impl Checkout {
    fn await_call(&mut self, frame: &mut Frame, waiter: Waiter, next: u16) -> Result<StepOutcome> {
        let call = waiter.intent_id();
        frame.store("pending_call", &call)?;
        frame.set_position(Position::at(next));
        self.pending = Some(waiter);
        Ok(StepOutcome::Await(vec![call]))
    }
}

impl SuspendableComputation for Checkout {
    fn restore(&mut self, frame: &Frame, capture: &mut WaiterCapture) -> Result<()> {
        if let Some(call) = frame.decode::<IntentId>("pending_call")? {
            self.pending = Some(capture.waiter(call));
        }
        Ok(())
    }

    fn advance(&mut self, frame: &mut Frame, ctx: &mut StepContext<'_>) -> Result<StepOutcome> {
        let sku: String = frame
            .decode("sku")?
            .ok_or_else(|| anyhow!("sku is required"))?;
        let quantity: i64 = frame.decode("quantity")?.unwrap_or(1);

        let Some(point) = frame.position().point() else {
            let reserve = ctx.call(
                ServiceId::keyed("Inventory", "main"),
                "Reserve",
                NamedValues::new()
                    .with("sku", sku.as_str())
                    .with("quantity", quantity),
            );
            return self.await_call(frame, reserve, 1);
        };

        let Some(result) = self.pending.as_ref().and_then(Waiter::result) else {
            let call = frame
                .decode::<IntentId>("pending_call")?
                .ok_or_else(|| anyhow!("no call in flight"))?;
            return Ok(StepOutcome::Await(vec![call]));
        };
        let value = result.into_result()?;

        match point {
            1 => {
                if value != json!(true) {
                    return Ok(StepOutcome::Complete(json!({
                        "status": "rejected",
                        "sku": sku,
                    })));
                }
                let quote = ctx.call(
                    ServiceId::new("Pricing"),
                    "Quote",
                    NamedValues::new().with("sku", sku.as_str()),
                );
                self.await_call(frame, quote, 2)
            }
            2 => {
                let price: i64 = serde_json::from_value(value)?;
                Ok(StepOutcome::Complete(json!({
                    "status": "placed",
                    "sku": sku,
                    "total": price * quantity,
                })))
            }
            other => Err(anyhow!("unexpected position {}", other)),
        }
    }
}

fn registry() -> ServiceRegistry {
    ServiceRegistry::new()
        .with(
            ServiceDefinition::new("Orders", "OrdersService", |_| {
                Ok(ServiceHandle::new(OrdersService))
            })
            .method(
                RoutineMethod::suspendable("Checkout", |_| -> Box<dyn SuspendableComputation> {
                    Box::new(Checkout::default())
                })
                    .parameters(["sku", "quantity"])
                    .locals(["pending_call"])
                    .returns(ResultShape::Value),
            ),
        )
        .with(
            ServiceDefinition::new("Pricing", "PricingService", |_| {
                Ok(ServiceHandle::new(PricingService))
            })
            .method(
                RoutineMethod::plain("Quote", |_owner, parameters, _ctx| {
                    let sku: String = parameters
                        .decode("sku")?
                        .ok_or_else(|| anyhow!("sku is required"))?;
                    let price = match sku.as_str() {
                        "KB-01" => 80,
                        "MS-02" => 35,
                        other => return Err(anyhow!("no price for '{}'", other)),
                    };
                    Ok(Some(json!(price)))
                })
                .parameters(["sku"])
                .returns(ResultShape::Value),
            ),
        )
        .with(
            ServiceDefinition::new("Inventory", "InventoryService", |_| {
                Ok(ServiceHandle::new(InventoryService {
                    state: SharedValues::new(SlotSchema::new(["stock"])),
                }))
            })
            .method(
                RoutineMethod::plain("Reserve", |owner, parameters, _ctx| {
                    let inventory = owner
                        .downcast_ref::<InventoryService>()
                        .ok_or_else(|| anyhow!("owner is not an inventory"))?;
                    let sku: String = parameters
                        .decode("sku")?
                        .ok_or_else(|| anyhow!("sku is required"))?;
                    let quantity: i64 = parameters.decode("quantity")?.unwrap_or(1);

                    let mut stock: BTreeMap<String, i64> =
                        inventory.state.decode("stock")?.unwrap_or_default();
                    let available = stock.entry(sku).or_insert(INITIAL_STOCK);
                    let reserved = *available >= quantity;
                    if reserved {
                        *available -= quantity;
                    }
                    inventory.state.store("stock", &stock)?;
                    Ok(Some(json!(reserved)))
                })
                .parameters(["sku", "quantity"])
                .returns(ResultShape::Value),
            ),
        )
}

async fn open_persistence(config: &Config) -> Result<Arc<dyn Persistence>> {
    Ok(match &config.database_url {
        Some(url) => {
            info!(url = %url, "Using SQLite persistence");
            Arc::new(SqlitePersistence::connect(url).await?)
        }
        None => {
            info!("Using in-memory persistence");
            Arc::new(MemoryPersistence::new())
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
                .add_directive("durastep_core=debug".parse()?),
        )
        .init();

    info!("=== Order Pipeline Example ===");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    let persistence = open_persistence(&config).await?;

    let orders = [("KB-01", 2), ("MS-02", 4), ("KB-01", 4), ("GPU-9", 1)];
    let mut scheduled = Vec::new();
    for (sku, quantity) in orders {
        let intent = ExecuteRoutineIntent::new(
            ServiceId::new("Orders"),
            "Checkout",
            NamedValues::new().with("sku", sku).with("quantity", quantity),
        );
        persistence.schedule(&intent).await?;
        info!(routine = %intent.intent_id, sku, quantity, "Scheduled checkout");
        scheduled.push(intent.intent_id);
    }

    let worker = TransitionWorker::with_registry(
        persistence.clone(),
        Arc::new(registry()),
        WorkerConfig::from(&config),
    );
    let delivered = worker.run_until_idle().await?;
    info!(delivered, "Queue drained");

    for intent_id in scheduled {
        match persistence.get_routine(intent_id).await? {
            Some(record) => info!(
                routine = %intent_id,
                status = record.status.as_str(),
                result = ?record.result,
                "Checkout finished"
            ),
            None => error!(routine = %intent_id, "Checkout record missing"),
        }
    }

    let stock = persistence
        .get_service_state(&ServiceId::keyed("Inventory", "main"))
        .await?;
    info!(stock = ?stock, "Remaining inventory");

    Ok(())
}
