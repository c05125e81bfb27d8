// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Awaited-result delivery into restored computations.
//!
//! When a suspended routine is restored for a continuation, it recreates a
//! [`Waiter`] for every call it was still awaiting. The runner passes an
//! active [`WaiterCapture`] into the restore so those waiters are collected,
//! then resolves the one tagged with the delivered result's intent id before
//! the routine is advanced.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use crate::descriptors::{IntentId, RoutineResult, RoutineResultDescriptor};

/// Pending result of an awaited routine call, tagged with the call's intent id.
#[derive(Debug, Clone)]
pub struct Waiter {
    intent_id: IntentId,
    result: Arc<Mutex<Option<RoutineResult>>>,
}

impl Waiter {
    /// An unresolved waiter for the call `intent_id`.
    pub fn new(intent_id: IntentId) -> Self {
        Self {
            intent_id,
            result: Arc::new(Mutex::new(None)),
        }
    }

    /// Correlation tag.
    pub fn intent_id(&self) -> IntentId {
        self.intent_id
    }

    /// Whether a result has been delivered.
    pub fn is_ready(&self) -> bool {
        self.lock().is_some()
    }

    /// The delivered result, if any.
    pub fn result(&self) -> Option<RoutineResult> {
        self.lock().clone()
    }

    /// Deliver `result`. Returns false if a result was already delivered.
    pub fn try_resolve(&self, result: RoutineResult) -> bool {
        let mut slot = self.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(result);
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<RoutineResult>> {
        self.result.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Explicit capture context scoped to one restore call.
#[derive(Debug, Default)]
pub struct WaiterCapture {
    active: bool,
    captured: Vec<Waiter>,
}

impl WaiterCapture {
    /// A capture that records every waiter created through it.
    pub fn active() -> Self {
        Self {
            active: true,
            captured: Vec::new(),
        }
    }

    /// A capture that records nothing (no result is being delivered).
    pub fn inactive() -> Self {
        Self::default()
    }

    /// Whether waiters are being recorded.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Recreate the waiter for the in-flight call `intent_id`.
    pub fn waiter(&mut self, intent_id: IntentId) -> Waiter {
        let waiter = Waiter::new(intent_id);
        if self.active {
            self.captured.push(waiter.clone());
        }
        waiter
    }

    /// Waiters recorded so far.
    pub fn captured(&self) -> &[Waiter] {
        &self.captured
    }

    /// Resolve every captured waiter tagged with the delivered intent id and
    /// close the capture. Returns how many waiters matched; zero means the
    /// routine no longer needs this result.
    pub fn deliver(self, awaited: &RoutineResultDescriptor) -> usize {
        let mut matched = 0;
        for waiter in self
            .captured
            .iter()
            .filter(|w| w.intent_id == awaited.intent_id)
        {
            if waiter.try_resolve(awaited.result.clone()) {
                matched += 1;
            }
        }

        match matched {
            0 => debug!(
                intent_id = %awaited.intent_id,
                captured = self.captured.len(),
                "Delivered result has no waiter in restored routine"
            ),
            1 => debug!(intent_id = %awaited.intent_id, "Delivered awaited result"),
            n => warn!(
                intent_id = %awaited.intent_id,
                matched = n,
                "Delivered result matched more than one waiter"
            ),
        }
        matched
    }
}
