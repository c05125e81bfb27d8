// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Completion signals and the fault adapter shared by every invocation path.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tracing::warn;

use crate::descriptors::{Fault, ResultShape, RoutineResult};

/// Completion signal paired with one routine invocation.
///
/// Starts pending and is resolved at most once; later attempts are ignored.
/// Clones observe the same signal.
#[derive(Debug, Clone)]
pub struct Completion {
    shape: ResultShape,
    outcome: Arc<Mutex<Option<RoutineResult>>>,
}

impl Completion {
    /// A pending completion for a routine declaring `shape`.
    pub fn pending(shape: ResultShape) -> Self {
        Self {
            shape,
            outcome: Arc::new(Mutex::new(None)),
        }
    }

    /// A completion already resolved with `value`.
    pub fn completed(shape: ResultShape, value: Value) -> Self {
        let completion = Self::pending(shape);
        completion.resolve(value);
        completion
    }

    /// A completed unit completion.
    pub fn completed_unit() -> Self {
        Self::completed(ResultShape::Unit, Value::Null)
    }

    /// A completion already faulted with `fault`.
    pub fn faulted(shape: ResultShape, fault: Fault) -> Self {
        let completion = Self::pending(shape);
        completion.fault(fault);
        completion
    }

    /// Declared result shape.
    pub fn shape(&self) -> ResultShape {
        self.shape
    }

    /// Whether the completion has an outcome.
    pub fn is_resolved(&self) -> bool {
        self.lock().is_some()
    }

    /// The outcome, if resolved.
    pub fn result(&self) -> Option<RoutineResult> {
        self.lock().clone()
    }

    /// Resolve with a success value. Unit routines always succeed with `null`.
    pub fn resolve(&self, value: Value) -> bool {
        let value = match self.shape {
            ResultShape::Unit => Value::Null,
            ResultShape::Value => value,
        };
        self.settle(RoutineResult::Succeeded(value))
    }

    /// Resolve with an application fault.
    pub fn fault(&self, fault: Fault) -> bool {
        self.settle(RoutineResult::Faulted(fault))
    }

    /// Resolve as cancelled.
    pub fn cancel(&self) -> bool {
        self.settle(RoutineResult::Cancelled)
    }

    fn settle(&self, result: RoutineResult) -> bool {
        let mut outcome = self.lock();
        if outcome.is_some() {
            return false;
        }
        *outcome = Some(result);
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<RoutineResult>> {
        self.outcome.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Run one piece of application code, converting a returned error or a panic
/// into a faulted completion of the declared `shape`.
///
/// This is the only place application failures are turned into completions;
/// both the suspendable and the plain invocation paths go through it.
pub fn guard<T>(shape: ResultShape, body: impl FnOnce() -> anyhow::Result<T>) -> Result<T, Completion> {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(Completion::faulted(shape, Fault::from_error(&err))),
        Err(payload) => {
            let fault = Fault::from_panic(&*payload);
            warn!(message = %fault.message, "Routine panicked during step");
            Err(Completion::faulted(shape, fault))
        }
    }
}
