// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for durastep-core integration tests.
//!
//! Provides a scripted [`TransitionData`], a recording committer and a small
//! set of sample services (orders, pricing, a stateful counter).

#![allow(dead_code)]

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use durastep_core::{
    ContinuationDescriptor, EngineError, Frame, IntentId, NamedValues, Position, ResultShape,
    RoutineDescriptor, RoutineMethod, RoutineResultDescriptor, ScheduledActions,
    ServiceDefinition, ServiceHandle, ServiceId, ServiceObject, ServiceRegistry, SharedValues,
    SlotSchema, StepContext, StepOutcome, SuspendableComputation, TransitionCarrier,
    TransitionCommitter, TransitionData, TransitionDescriptor, TransitionKind, TransitionRunner,
    ValueContainer, ValueContainerExt, Waiter, WaiterCapture, intrinsic,
};

/// Delivery identity used by scripted transitions.
pub struct TestDelivery(pub String);

impl TestDelivery {
    pub fn new() -> Self {
        Self(format!("delivery-{}", IntentId::generate()))
    }
}

impl TransitionCarrier for TestDelivery {
    fn delivery_id(&self) -> &str {
        &self.0
    }
}

/// Transition data served from memory. Records the order of state reads.
pub struct ScriptedData {
    pub kind: TransitionKind,
    pub service_id: ServiceId,
    pub routine: RoutineDescriptor,
    pub parameters: NamedValues,
    pub service_state: Option<NamedValues>,
    pub routine_state: Option<NamedValues>,
    pub awaited: Option<RoutineResultDescriptor>,
    pub continuations: Vec<ContinuationDescriptor>,
    pub unavailable: bool,
    pub finished: bool,
    reads: Mutex<Vec<&'static str>>,
}

impl ScriptedData {
    /// First transition of `method` on `service`.
    pub fn invoke(service: &str, method: &str, parameters: NamedValues) -> Self {
        Self {
            kind: TransitionKind::InvokeRoutine,
            service_id: ServiceId::new(service),
            routine: RoutineDescriptor::new(method),
            parameters,
            service_state: None,
            routine_state: None,
            awaited: None,
            continuations: Vec::new(),
            unavailable: false,
            finished: false,
            reads: Mutex::new(Vec::new()),
        }
    }

    /// Resumption of `routine` from `state` with an optional delivered result.
    pub fn continuation(
        service: &str,
        routine: RoutineDescriptor,
        state: NamedValues,
        awaited: Option<RoutineResultDescriptor>,
    ) -> Self {
        Self {
            kind: TransitionKind::ContinueRoutine,
            service_id: ServiceId::new(service),
            routine,
            parameters: NamedValues::new(),
            service_state: None,
            routine_state: Some(state),
            awaited,
            continuations: Vec::new(),
            unavailable: false,
            finished: false,
            reads: Mutex::new(Vec::new()),
        }
    }

    pub fn with_service_state(mut self, state: NamedValues) -> Self {
        self.service_state = Some(state);
        self
    }

    pub fn with_continuation(mut self, service: &str, routine: RoutineDescriptor) -> Self {
        self.continuations.push(ContinuationDescriptor {
            service_id: ServiceId::new(service),
            routine,
        });
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    /// The routine already holds its final result.
    pub fn finished(mut self) -> Self {
        self.finished = true;
        self
    }

    /// State reads in the order the runner made them.
    pub fn reads(&self) -> Vec<&'static str> {
        self.reads.lock().unwrap().clone()
    }

    fn record(&self, what: &'static str) -> durastep_core::Result<()> {
        if self.unavailable {
            return Err(EngineError::DataUnavailable(format!("{} is offline", what)));
        }
        self.reads.lock().unwrap().push(what);
        Ok(())
    }
}

#[async_trait]
impl TransitionData for ScriptedData {
    async fn transition_descriptor(
        &self,
        _cancel: &CancellationToken,
    ) -> durastep_core::Result<TransitionDescriptor> {
        Ok(TransitionDescriptor::new(self.kind))
    }

    async fn service_id(&self, _cancel: &CancellationToken) -> durastep_core::Result<ServiceId> {
        Ok(self.service_id.clone())
    }

    async fn routine_descriptor(
        &self,
        _cancel: &CancellationToken,
    ) -> durastep_core::Result<RoutineDescriptor> {
        Ok(self.routine.clone())
    }

    async fn read_service_state(
        &self,
        target: &mut dyn ValueContainer,
        _cancel: &CancellationToken,
    ) -> durastep_core::Result<()> {
        self.record("service_state")?;
        if let Some(state) = &self.service_state {
            target.load_from(state)?;
        }
        Ok(())
    }

    async fn read_routine_parameters(
        &self,
        target: &mut dyn ValueContainer,
        _cancel: &CancellationToken,
    ) -> durastep_core::Result<()> {
        self.record("parameters")?;
        target.load_from(&self.parameters)?;
        Ok(())
    }

    async fn read_routine_state(
        &self,
        target: &mut dyn ValueContainer,
        _cancel: &CancellationToken,
    ) -> durastep_core::Result<()> {
        self.record("routine_state")?;
        let state = self
            .routine_state
            .as_ref()
            .ok_or_else(|| EngineError::DataUnavailable("no routine state".to_string()))?;
        target.load_from(state)?;
        Ok(())
    }

    async fn awaited_result(
        &self,
        _cancel: &CancellationToken,
    ) -> durastep_core::Result<Option<RoutineResultDescriptor>> {
        Ok(self.awaited.clone())
    }

    async fn continuations(
        &self,
        _cancel: &CancellationToken,
    ) -> durastep_core::Result<Vec<ContinuationDescriptor>> {
        Ok(self.continuations.clone())
    }

    async fn routine_finished(&self, _cancel: &CancellationToken) -> durastep_core::Result<bool> {
        Ok(self.finished)
    }
}

/// Committer that keeps every committed action set.
///
/// Tracks how many commits were in progress at once. Slow commits yield to
/// the scheduler before recording, so overlapping transitions interleave.
#[derive(Default)]
pub struct RecordingCommitter {
    committed: Mutex<Vec<(String, ScheduledActions)>>,
    failing: AtomicBool,
    slow: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingCommitter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_commits(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn slow_commits(&self, slow: bool) {
        self.slow.store(slow, Ordering::SeqCst);
    }

    pub fn committed(&self) -> Vec<(String, ScheduledActions)> {
        self.committed.lock().unwrap().clone()
    }

    /// Most commits ever in progress at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransitionCommitter for RecordingCommitter {
    async fn commit(
        &self,
        carrier: &dyn TransitionCarrier,
        actions: &ScheduledActions,
        _cancel: &CancellationToken,
    ) -> durastep_core::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EngineError::Commit("store rejected the write".to_string()));
        }
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        if self.slow.load(Ordering::SeqCst) {
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }
        }
        self.committed
            .lock()
            .unwrap()
            .push((carrier.delivery_id().to_string(), actions.clone()));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Runner over the sample registry, committing into `committer`.
pub fn runner(committer: Arc<RecordingCommitter>) -> TransitionRunner {
    let registry = sample_registry();
    TransitionRunner::new(committer, registry.clone(), registry)
}

// ============================================================================
// Sample services
// ============================================================================

pub struct OrdersService;

impl ServiceObject for OrdersService {
    fn concrete_type(&self) -> &str {
        "OrdersService"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct PricingService;

impl ServiceObject for PricingService {
    fn concrete_type(&self) -> &str {
        "PricingService"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Stateful service with one persisted field, `count`.
pub struct CounterService {
    state: SharedValues,
}

impl CounterService {
    pub fn new() -> Self {
        Self {
            state: SharedValues::new(SlotSchema::new(["count"])),
        }
    }
}

impl ServiceObject for CounterService {
    fn concrete_type(&self) -> &str {
        "CounterService"
    }

    fn persisted_state(&self) -> Option<SharedValues> {
        Some(self.state.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Quotes a price, awaits it, then completes with `price * quantity`.
#[derive(Default)]
pub struct PlaceOrder {
    quote: Option<Waiter>,
}

impl SuspendableComputation for PlaceOrder {
    fn restore(&mut self, frame: &Frame, capture: &mut WaiterCapture) -> anyhow::Result<()> {
        if let Some(call) = frame.decode::<IntentId>("quote_call")? {
            self.quote = Some(capture.waiter(call));
        }
        Ok(())
    }

    fn advance(
        &mut self,
        frame: &mut Frame,
        ctx: &mut StepContext<'_>,
    ) -> anyhow::Result<StepOutcome> {
        match frame.position().point() {
            None => {
                let sku: String = frame
                    .decode("sku")?
                    .ok_or_else(|| anyhow!("sku is required"))?;
                let waiter = ctx.call(
                    ServiceId::new("Pricing"),
                    "Quote",
                    NamedValues::new().with("sku", sku),
                );
                let call = waiter.intent_id();
                frame.store("quote_call", &call)?;
                frame.set_position(Position::at(1));
                self.quote = Some(waiter);
                Ok(StepOutcome::Await(vec![call]))
            }
            Some(1) => {
                let waiter = self
                    .quote
                    .as_ref()
                    .ok_or_else(|| anyhow!("quote call was not restored"))?;
                let Some(result) = waiter.result() else {
                    return Ok(StepOutcome::Await(vec![waiter.intent_id()]));
                };
                let price: i64 = serde_json::from_value(result.into_result()?)?;
                let quantity: i64 = frame.decode("quantity")?.unwrap_or(1);
                let total = price * quantity;
                frame.store("total", &total)?;
                Ok(StepOutcome::Complete(json!(total)))
            }
            Some(other) => Err(anyhow!("unexpected position {}", other)),
        }
    }
}

/// Yields once, then awaits `FromResult(20)` and completes with the value
/// doubled. Exercises both intrinsic routines across three transitions.
#[derive(Default)]
pub struct Tally {
    pending: Option<Waiter>,
}

impl SuspendableComputation for Tally {
    fn restore(&mut self, frame: &Frame, capture: &mut WaiterCapture) -> anyhow::Result<()> {
        if let Some(call) = frame.decode::<IntentId>("pending_call")? {
            self.pending = Some(capture.waiter(call));
        }
        Ok(())
    }

    fn advance(
        &mut self,
        frame: &mut Frame,
        ctx: &mut StepContext<'_>,
    ) -> anyhow::Result<StepOutcome> {
        let resumed = match frame.position().point() {
            None => None,
            Some(_) => match self.pending.as_ref().and_then(Waiter::result) {
                Some(result) => Some(result.into_result()?),
                None => {
                    let call = frame
                        .decode::<IntentId>("pending_call")?
                        .ok_or_else(|| anyhow!("no call in flight"))?;
                    return Ok(StepOutcome::Await(vec![call]));
                }
            },
        };

        let waiter = match (frame.position().point(), resumed) {
            (None, _) => intrinsic::yield_now(ctx),
            (Some(1), _) => intrinsic::from_result(ctx, 20),
            (Some(2), Some(value)) => {
                let value: i64 = serde_json::from_value(value)?;
                frame.store("pending_call", &serde_json::Value::Null)?;
                return Ok(StepOutcome::Complete(json!(value * 2)));
            }
            (position, _) => return Err(anyhow!("unexpected position {:?}", position)),
        };

        let next = frame.position().point().map_or(1, |p| p + 1);
        frame.store("pending_call", &waiter.intent_id())?;
        frame.set_position(Position::at(next));
        self.pending = Some(waiter.clone());
        Ok(StepOutcome::Await(vec![waiter.intent_id()]))
    }
}

/// Quotes two skus and completes with whichever price arrives first. The
/// other result reaches an already finished routine.
#[derive(Default)]
pub struct FirstOf {
    calls: Vec<Waiter>,
}

impl SuspendableComputation for FirstOf {
    fn restore(&mut self, frame: &Frame, capture: &mut WaiterCapture) -> anyhow::Result<()> {
        for slot in ["first_call", "second_call"] {
            if let Some(call) = frame.decode::<IntentId>(slot)? {
                self.calls.push(capture.waiter(call));
            }
        }
        Ok(())
    }

    fn advance(
        &mut self,
        frame: &mut Frame,
        ctx: &mut StepContext<'_>,
    ) -> anyhow::Result<StepOutcome> {
        if frame.position().point().is_none() {
            let first = ctx.call(
                ServiceId::new("Pricing"),
                "Quote",
                NamedValues::new().with("sku", "A-1"),
            );
            let second = ctx.call(
                ServiceId::new("Pricing"),
                "Quote",
                NamedValues::new().with("sku", "B-2"),
            );
            frame.store("first_call", &first.intent_id())?;
            frame.store("second_call", &second.intent_id())?;
            frame.set_position(Position::at(1));
            self.calls = vec![first, second];
        }

        match self.calls.iter().find_map(Waiter::result) {
            Some(result) => Ok(StepOutcome::Complete(result.into_result()?)),
            None => Ok(StepOutcome::Await(
                self.calls.iter().map(Waiter::intent_id).collect(),
            )),
        }
    }
}

/// Bumps the counter, awaits a quote, then adds the quoted price to it.
/// Touches service state on both sides of the suspension.
pub struct AddQuote {
    counter: ServiceHandle,
    quote: Option<Waiter>,
}

impl AddQuote {
    pub fn new(counter: ServiceHandle) -> Self {
        Self {
            counter,
            quote: None,
        }
    }
}

impl SuspendableComputation for AddQuote {
    fn restore(&mut self, frame: &Frame, capture: &mut WaiterCapture) -> anyhow::Result<()> {
        if let Some(call) = frame.decode::<IntentId>("quote_call")? {
            self.quote = Some(capture.waiter(call));
        }
        Ok(())
    }

    fn advance(
        &mut self,
        frame: &mut Frame,
        ctx: &mut StepContext<'_>,
    ) -> anyhow::Result<StepOutcome> {
        let counter = self
            .counter
            .downcast_ref::<CounterService>()
            .ok_or_else(|| anyhow!("owner is not a counter"))?;
        let count = counter.state.decode::<i64>("count")?.unwrap_or(0);

        let Some(waiter) = self.quote.as_ref() else {
            counter.state.store("count", &(count + 1))?;
            let waiter = ctx.call(
                ServiceId::new("Pricing"),
                "Quote",
                NamedValues::new().with("sku", "A-1"),
            );
            let call = waiter.intent_id();
            frame.store("quote_call", &call)?;
            frame.set_position(Position::at(1));
            self.quote = Some(waiter);
            return Ok(StepOutcome::Await(vec![call]));
        };

        let Some(result) = waiter.result() else {
            return Ok(StepOutcome::Await(vec![waiter.intent_id()]));
        };
        let price: i64 = serde_json::from_value(result.into_result()?)?;
        counter.state.store("count", &(count + price))?;
        Ok(StepOutcome::Complete(json!(count + price)))
    }
}

/// Suspendable computation from a closure, for single-step routines.
pub struct StepFn<F>(pub F);

impl<F> SuspendableComputation for StepFn<F>
where
    F: FnMut(&mut Frame, &mut StepContext<'_>) -> anyhow::Result<StepOutcome> + Send,
{
    fn advance(
        &mut self,
        frame: &mut Frame,
        ctx: &mut StepContext<'_>,
    ) -> anyhow::Result<StepOutcome> {
        (self.0)(frame, ctx)
    }
}

pub fn boxed<C: SuspendableComputation + 'static>(
    computation: C,
) -> Box<dyn SuspendableComputation> {
    Box::new(computation)
}

/// Box a single-step closure as a computation.
pub fn step<F>(body: F) -> Box<dyn SuspendableComputation>
where
    F: FnMut(&mut Frame, &mut StepContext<'_>) -> anyhow::Result<StepOutcome> + Send + 'static,
{
    Box::new(StepFn(body))
}

fn orders() -> ServiceDefinition {
    ServiceDefinition::new("Orders", "OrdersService", |_| {
        Ok(ServiceHandle::new(OrdersService))
    })
    .method(
        RoutineMethod::suspendable("PlaceOrder", |_| boxed(PlaceOrder::default()))
            .parameters(["sku", "quantity"])
            .locals(["quote_call", "total"])
            .returns(ResultShape::Value),
    )
    .method(
        RoutineMethod::suspendable("QuoteBoth", |_| {
            step(|_frame, ctx| {
                let first = ctx.call(
                    ServiceId::new("Pricing"),
                    "Quote",
                    NamedValues::new().with("sku", "A-1"),
                );
                let second = ctx.call(
                    ServiceId::new("Pricing"),
                    "Quote",
                    NamedValues::new().with("sku", "B-2"),
                );
                Ok(StepOutcome::Await(vec![
                    first.intent_id(),
                    second.intent_id(),
                ]))
            })
        })
        .returns(ResultShape::Value),
    )
    .method(
        RoutineMethod::suspendable("Notify", |_| {
            step(|_frame, ctx| {
                ctx.call(
                    ServiceId::new("Pricing"),
                    "Quote",
                    NamedValues::new().with("sku", "A-1"),
                );
                Ok(StepOutcome::Complete(json!("sent")))
            })
        })
        .returns(ResultShape::Value),
    )
    .method(
        RoutineMethod::suspendable("Ghost", |_| {
            step(|_frame, ctx| {
                ctx.call(
                    ServiceId::new("Pricing"),
                    "Quote",
                    NamedValues::new().with("sku", "A-1"),
                );
                Ok(StepOutcome::Await(vec![IntentId::generate()]))
            })
        })
        .returns(ResultShape::Value),
    )
    .method(
        RoutineMethod::suspendable("FirstOf", |_| boxed(FirstOf::default()))
            .locals(["first_call", "second_call"])
            .returns(ResultShape::Value),
    )
    .method(
        RoutineMethod::suspendable("Tally", |_| boxed(Tally::default()))
            .locals(["pending_call"])
            .returns(ResultShape::Value),
    )
    .method(
        RoutineMethod::suspendable("Reject", |_| {
            step(|_frame, _ctx| {
                Err(anyhow!("inventory unavailable"))
            })
        })
        .returns(ResultShape::Value),
    )
    .method(
        RoutineMethod::suspendable("Explode", |_| {
            step(|_frame, _ctx| panic!("order book corrupted"))
        })
        .returns(ResultShape::Value),
    )
}

fn pricing() -> ServiceDefinition {
    ServiceDefinition::new("Pricing", "PricingService", |_| {
        Ok(ServiceHandle::new(PricingService))
    })
    .method(
        RoutineMethod::plain("Quote", |_owner, parameters, _ctx| {
            let sku: String = parameters
                .decode("sku")?
                .ok_or_else(|| anyhow!("sku is required"))?;
            if sku == "discontinued" {
                return Err(anyhow!("sku '{}' is discontinued", sku));
            }
            Ok(Some(json!(25)))
        })
        .parameters(["sku"])
        .returns(ResultShape::Value),
    )
}

fn counter() -> ServiceDefinition {
    ServiceDefinition::new("Counter", "CounterService", |_| {
        Ok(ServiceHandle::new(CounterService::new()))
    })
    .method(
        RoutineMethod::plain("Increment", |owner, parameters, _ctx| {
            let counter = owner
                .downcast_ref::<CounterService>()
                .ok_or_else(|| anyhow!("owner is not a counter"))?;
            let by: i64 = parameters.decode("by")?.unwrap_or(1);
            let count = counter.state.decode::<i64>("count")?.unwrap_or(0) + by;
            counter.state.store("count", &count)?;
            Ok(Some(json!(count)))
        })
        .parameters(["by"])
        .returns(ResultShape::Value),
    )
    .method(
        RoutineMethod::plain("Reset", |owner, _parameters, _ctx| {
            let counter = owner
                .downcast_ref::<CounterService>()
                .ok_or_else(|| anyhow!("owner is not a counter"))?;
            counter.state.store("count", &0)?;
            Ok(None)
        })
        .completes_without_signal(),
    )
    .method(
        RoutineMethod::suspendable("AddQuote", |counter| boxed(AddQuote::new(counter)))
            .locals(["quote_call"])
            .returns(ResultShape::Value),
    )
    .method(RoutineMethod::plain("Forget", |_owner, _parameters, _ctx| Ok(None)))
}

/// Registry with the Orders, Pricing and Counter services.
pub fn sample_registry() -> Arc<ServiceRegistry> {
    Arc::new(
        ServiceRegistry::new()
            .with(orders())
            .with(pricing())
            .with(counter()),
    )
}
