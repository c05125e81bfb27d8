// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Suspended computation model.
//!
//! A suspendable routine is an explicit state machine: an opaque
//! [`Position`], a [`Frame`] of named local slots whose layout is registered
//! with the method, and an [`advance`](SuspendableComputation::advance)
//! operation that runs until the routine finishes or reaches its next await
//! point. The engine drives it through [`advance_step`], which guarantees
//! that no error or panic escapes a step.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capture::{Waiter, WaiterCapture};
use crate::completion::{Completion, guard};
use crate::descriptors::{IntentId, MethodId, RoutineDescriptor, ServiceId};
use crate::monitor::TransitionMonitor;
use crate::service::ServiceHandle;
use crate::values::{NamedValues, SlotError, SlotSchema, ValueContainer};

/// Name of the frame slot holding the position marker.
pub const POSITION_SLOT: &str = "$position";

/// Opaque program-counter of a suspendable routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(i32);

impl Position {
    /// Before the first step.
    pub const NOT_STARTED: Position = Position(-1);
    /// After the routine completed or faulted.
    pub const FINISHED: Position = Position(-2);

    /// Await point number `point`.
    pub const fn at(point: u16) -> Self {
        Position(point as i32)
    }

    /// Whether the routine has taken at least one step.
    pub fn is_started(&self) -> bool {
        self.0 != Self::NOT_STARTED.0
    }

    /// Whether the routine is done.
    pub fn is_finished(&self) -> bool {
        self.0 == Self::FINISHED.0
    }

    /// The await point number while in progress.
    pub fn point(&self) -> Option<u16> {
        u16::try_from(self.0).ok()
    }

    fn from_value(value: &Value) -> Option<Self> {
        value
            .as_i64()
            .and_then(|n| i32::try_from(n).ok())
            .filter(|&n| n >= Self::FINISHED.0)
            .map(Position)
    }
}

/// Position plus named locals of one routine invocation.
///
/// As a [`ValueContainer`] the frame exposes the position as its first slot
/// ([`POSITION_SLOT`]) followed by the registered parameter and local slots,
/// so parameters, saved state and restored state all move through the same
/// contract.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    position: Position,
    locals: NamedValues,
}

impl Frame {
    /// A not-started frame with null slots for `schema`.
    pub fn new(schema: &SlotSchema) -> Self {
        Self {
            position: Position::NOT_STARTED,
            locals: schema.create_container(),
        }
    }

    /// Current position.
    pub fn position(&self) -> Position {
        self.position
    }

    /// Move to `position`.
    pub fn set_position(&mut self, position: Position) {
        self.position = position;
    }

    /// Local slots, without the position.
    pub fn locals(&self) -> &NamedValues {
        &self.locals
    }

    /// Decode a local. A null local decodes to `None`.
    pub fn decode<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, SlotError> {
        if self.locals.index_of(name).is_none() {
            return Err(SlotError::UnknownSlot(name.to_string()));
        }
        self.locals.decode(name)
    }

    /// Encode and store a local.
    pub fn store<T: Serialize>(&mut self, name: &str, value: &T) -> Result<(), SlotError> {
        let index = self
            .locals
            .index_of(name)
            .ok_or_else(|| SlotError::UnknownSlot(name.to_string()))?;
        let encoded = serde_json::to_value(value).map_err(|e| SlotError::InvalidValue {
            slot: name.to_string(),
            reason: e.to_string(),
        })?;
        self.locals.set(index, encoded)
    }
}

impl ValueContainer for Frame {
    fn count(&self) -> usize {
        self.locals.count() + 1
    }

    fn name(&self, index: usize) -> Option<&str> {
        match index {
            0 => Some(POSITION_SLOT),
            i => self.locals.name(i - 1),
        }
    }

    fn get(&self, index: usize) -> Option<Value> {
        match index {
            0 => Some(Value::from(self.position.0)),
            i => self.locals.get(i - 1),
        }
    }

    fn set(&mut self, index: usize, value: Value) -> Result<(), SlotError> {
        match index {
            0 => {
                self.position =
                    Position::from_value(&value).ok_or_else(|| SlotError::InvalidValue {
                        slot: POSITION_SLOT.to_string(),
                        reason: format!("not a position marker: {}", value),
                    })?;
                Ok(())
            }
            i => self.locals.set(i - 1, value).map_err(|e| match e {
                SlotError::OutOfRange { index, count } => SlotError::OutOfRange {
                    index: index + 1,
                    count: count + 1,
                },
                other => other,
            }),
        }
    }
}

/// What one step of a routine ended with.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The routine finished with a value.
    Complete(Value),
    /// The routine suspended, awaiting the listed calls.
    Await(Vec<IntentId>),
}

/// Runtime contract of a suspendable routine.
pub trait SuspendableComputation: Send {
    /// Rebuild in-memory waiters from a restored frame. Every awaited call
    /// must be recreated through `capture` so a delivered result can reach it.
    fn restore(&mut self, frame: &Frame, capture: &mut WaiterCapture) -> anyhow::Result<()> {
        let _ = (frame, capture);
        Ok(())
    }

    /// Run until the routine finishes or reaches its next await point.
    fn advance(&mut self, frame: &mut Frame, ctx: &mut StepContext<'_>) -> anyhow::Result<StepOutcome>;
}

/// Creates fresh computations for one routine method.
pub trait ComputationFactory: Send + Sync {
    /// A new computation bound to its owning service.
    fn create(&self, owner: ServiceHandle) -> Box<dyn SuspendableComputation>;
}

impl<F> ComputationFactory for F
where
    F: Fn(ServiceHandle) -> Box<dyn SuspendableComputation> + Send + Sync,
{
    fn create(&self, owner: ServiceHandle) -> Box<dyn SuspendableComputation> {
        self(owner)
    }
}

/// What routine code can do during a step.
pub struct StepContext<'a> {
    service_id: &'a ServiceId,
    routine: &'a RoutineDescriptor,
    monitor: &'a mut TransitionMonitor,
}

impl<'a> StepContext<'a> {
    /// Context for a step of `routine` on `service_id`, reporting to `monitor`.
    pub fn new(
        service_id: &'a ServiceId,
        routine: &'a RoutineDescriptor,
        monitor: &'a mut TransitionMonitor,
    ) -> Self {
        Self {
            service_id,
            routine,
            monitor,
        }
    }

    /// Service running the step.
    pub fn service_id(&self) -> &ServiceId {
        self.service_id
    }

    /// Routine running the step.
    pub fn routine(&self) -> &RoutineDescriptor {
        self.routine
    }

    /// Request a new routine invocation. The call is scheduled when the
    /// transition commits; the returned waiter receives its result in a later
    /// continuation if the step awaits it.
    pub fn call(
        &mut self,
        service_id: ServiceId,
        method_id: impl Into<MethodId>,
        parameters: NamedValues,
    ) -> Waiter {
        let intent_id = self
            .monitor
            .request_call(service_id, method_id.into(), parameters);
        Waiter::new(intent_id)
    }
}

/// Result of driving one step.
#[derive(Debug)]
pub struct StepReport {
    /// The routine's completion; replaced by a faulted one if the step failed.
    pub completion: Completion,
    /// Calls the routine is awaiting, when it suspended.
    pub awaited: Vec<IntentId>,
}

/// Advance `computation` exactly one step.
///
/// Never fails: a returned error or a panic becomes a faulted completion of
/// the routine's declared shape, and the frame is marked finished.
pub fn advance_step(
    computation: &mut dyn SuspendableComputation,
    frame: &mut Frame,
    ctx: &mut StepContext<'_>,
    completion: Completion,
) -> StepReport {
    match guard(completion.shape(), || computation.advance(frame, ctx)) {
        Ok(StepOutcome::Complete(value)) => {
            frame.set_position(Position::FINISHED);
            completion.resolve(value);
            StepReport {
                completion,
                awaited: Vec::new(),
            }
        }
        Ok(StepOutcome::Await(awaited)) => StepReport {
            completion,
            awaited,
        },
        Err(faulted) => {
            frame.set_position(Position::FINISHED);
            StepReport {
                completion: faulted,
                awaited: Vec::new(),
            }
        }
    }
}
