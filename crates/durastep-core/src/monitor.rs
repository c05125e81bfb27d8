// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transition monitor and per-routine transition scope.
//!
//! The [`TransitionScope`] guarantees at most one active transition per
//! routine instance, keyed by the routine's intent id. Entering it yields a
//! [`ScopeGuard`] that owns the [`TransitionMonitor`] for the step; dropping
//! the guard releases the routine on every exit path. Transitions of stateful
//! services additionally hold their service instance through
//! [`ScopeGuard::lock_service`] from state load to commit.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::completion::Completion;
use crate::descriptors::{
    ContinuationDescriptor, IntentId, MethodId, RoutineDescriptor, ServiceId,
};
use crate::error::{EngineError, Result};
use crate::intents::{ExecuteRoutineIntent, ScheduledActions};
use crate::values::NamedValues;

/// Lifecycle of a monitored step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// The step is running or about to run.
    Entered,
    /// The routine finished and its outcome was reported.
    Completed,
    /// The routine suspended and its outcome was reported.
    Suspended,
}

impl MonitorState {
    /// Returns the string representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entered => "entered",
            Self::Completed => "completed",
            Self::Suspended => "suspended",
        }
    }
}

/// Observes one step of one routine.
///
/// Collects the sub-invocations the routine requests, in request order, and
/// reports exactly once whether the routine suspended or finished.
#[derive(Debug)]
pub struct TransitionMonitor {
    service_id: ServiceId,
    routine: RoutineDescriptor,
    state: MonitorState,
    requested: Vec<ExecuteRoutineIntent>,
}

impl TransitionMonitor {
    /// Monitor a step of `routine` running on `service_id`.
    pub fn new(service_id: ServiceId, routine: RoutineDescriptor) -> Self {
        Self {
            service_id,
            routine,
            state: MonitorState::Entered,
            requested: Vec::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> MonitorState {
        self.state
    }

    /// Monitored routine.
    pub fn routine(&self) -> &RoutineDescriptor {
        &self.routine
    }

    /// Sub-invocations requested so far.
    pub fn requested(&self) -> &[ExecuteRoutineIntent] {
        &self.requested
    }

    /// Record a sub-invocation request. Returns the new call's intent id.
    pub fn request_call(
        &mut self,
        service_id: ServiceId,
        method_id: MethodId,
        parameters: NamedValues,
    ) -> IntentId {
        let intent = ExecuteRoutineIntent::new(service_id, method_id, parameters);
        let intent_id = intent.intent_id;
        debug!(
            routine = %self.routine.intent_id,
            callee = %intent.service_id,
            method = %intent.method_id,
            intent_id = %intent_id,
            "Routine requested call"
        );
        self.requested.push(intent);
        intent_id
    }

    /// Mark requested calls as awaited by this routine, so their completion
    /// continues it. Ids of calls issued in an earlier step are already
    /// registered durably and are skipped.
    ///
    /// Returns the awaited ids that match no request of this step.
    pub fn register_awaits(&mut self, awaited: &[IntentId]) -> Vec<IntentId> {
        let continuation = ContinuationDescriptor {
            service_id: self.service_id.clone(),
            routine: self.routine.clone(),
        };
        for intent in self
            .requested
            .iter_mut()
            .filter(|i| awaited.contains(&i.intent_id))
        {
            intent.continuation = Some(continuation.clone());
        }
        awaited
            .iter()
            .filter(|id| !self.requested.iter().any(|i| i.intent_id == **id))
            .copied()
            .collect()
    }

    /// Report the step's outcome.
    ///
    /// A pending completion means the routine suspended and its frame must be
    /// saved. Fails if the outcome was already reported.
    pub fn track_completion(&mut self, completion: &Completion) -> Result<ScheduledActions> {
        if self.state != MonitorState::Entered {
            return Err(EngineError::MonitorState {
                state: self.state.as_str(),
            });
        }

        let suspended = !completion.is_resolved();
        self.state = if suspended {
            MonitorState::Suspended
        } else {
            MonitorState::Completed
        };

        Ok(ScheduledActions {
            save_routine_state: suspended,
            save_state: None,
            execute_routine_intents: std::mem::take(&mut self.requested),
            continuation_intents: Vec::new(),
        })
    }
}

/// What a scope lock serializes on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ScopeKey {
    Routine(IntentId),
    Service(ServiceId),
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Routine(id) => write!(f, "routine {}", id),
            Self::Service(id) => write!(f, "service {}", id),
        }
    }
}

type ScopeLocks = HashMap<ScopeKey, Arc<tokio::sync::Mutex<()>>>;

/// Serializes transitions per routine instance, and per service instance
/// for stateful services.
#[derive(Debug, Clone, Default)]
pub struct TransitionScope {
    locks: Arc<Mutex<ScopeLocks>>,
}

impl TransitionScope {
    /// Create an empty scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the scope for `routine`, waiting while another transition of the
    /// same routine is active. Waiting is abandoned on cancellation.
    pub async fn enter(
        &self,
        service_id: ServiceId,
        routine: RoutineDescriptor,
        cancel: &CancellationToken,
    ) -> Result<ScopeGuard> {
        let key = ScopeKey::Routine(routine.intent_id);
        let permit = self.acquire(&key, cancel).await?;
        Ok(ScopeGuard {
            scope: self.clone(),
            key,
            permit: Some(permit),
            service: None,
            monitor: TransitionMonitor::new(service_id, routine),
        })
    }

    /// Number of routines and services with an active or waiting transition.
    pub fn active_count(&self) -> usize {
        self.locks().len()
    }

    async fn acquire(
        &self,
        key: &ScopeKey,
        cancel: &CancellationToken,
    ) -> Result<OwnedMutexGuard<()>> {
        let lock = self.lock_for(key);

        let acquired = match lock.clone().try_lock_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                debug!(scope = %key, "Waiting for active transition");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = lock.clone().lock_owned() => Some(permit),
                }
            }
        };
        drop(lock);

        acquired.ok_or_else(|| {
            self.release(key);
            EngineError::Cancelled
        })
    }

    fn lock_for(&self, key: &ScopeKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks().entry(key.clone()).or_default().clone()
    }

    fn release(&self, key: &ScopeKey) {
        let mut locks = self.locks();
        if let Some(lock) = locks.get(key)
            && Arc::strong_count(lock) == 1
        {
            locks.remove(key);
        }
    }

    fn locks(&self) -> std::sync::MutexGuard<'_, ScopeLocks> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Active transition of one routine. Releases the routine, and the service
/// when locked, on drop.
#[derive(Debug)]
pub struct ScopeGuard {
    scope: TransitionScope,
    key: ScopeKey,
    permit: Option<OwnedMutexGuard<()>>,
    service: Option<(ScopeKey, OwnedMutexGuard<()>)>,
    monitor: TransitionMonitor,
}

impl ScopeGuard {
    /// The step's monitor.
    pub fn monitor(&mut self) -> &mut TransitionMonitor {
        &mut self.monitor
    }

    /// Hold the routine's service instance until the guard drops, waiting
    /// while a transition of another routine on the same instance holds it.
    ///
    /// Stateful services take this before their state is loaded, so each
    /// load sees the state saved by the previous transition.
    pub async fn lock_service(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.service.is_some() {
            return Ok(());
        }
        let key = ScopeKey::Service(self.monitor.service_id.clone());
        let permit = self.scope.acquire(&key, cancel).await?;
        self.service = Some((key, permit));
        Ok(())
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if let Some((key, permit)) = self.service.take() {
            drop(permit);
            self.scope.release(&key);
        }
        self.permit.take();
        self.scope.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::ResultShape;
    use serde_json::json;
    use std::time::Duration;

    fn monitor() -> TransitionMonitor {
        TransitionMonitor::new(ServiceId::new("Orders"), RoutineDescriptor::new("Place"))
    }

    #[test]
    fn test_suspended_step_saves_routine_state() {
        let mut monitor = monitor();
        let actions = monitor
            .track_completion(&Completion::pending(ResultShape::Value))
            .unwrap();

        assert!(actions.save_routine_state);
        assert_eq!(monitor.state(), MonitorState::Suspended);
    }

    #[test]
    fn test_completed_step_does_not_save_routine_state() {
        let mut monitor = monitor();
        let actions = monitor
            .track_completion(&Completion::completed(ResultShape::Value, json!(1)))
            .unwrap();

        assert!(!actions.save_routine_state);
        assert_eq!(monitor.state(), MonitorState::Completed);
    }

    #[test]
    fn test_second_report_is_rejected() {
        let mut monitor = monitor();
        let completion = Completion::completed_unit();
        monitor.track_completion(&completion).unwrap();

        let err = monitor.track_completion(&completion).unwrap_err();
        assert!(matches!(err, EngineError::MonitorState { state: "completed" }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_requests_keep_order_and_awaits_set_continuation() {
        let mut monitor = monitor();
        let first = monitor.request_call(ServiceId::new("A"), "One".into(), NamedValues::new());
        let second = monitor.request_call(ServiceId::new("B"), "Two".into(), NamedValues::new());

        let stray = IntentId::generate();
        assert_eq!(monitor.register_awaits(&[second, stray]), vec![stray]);

        let actions = monitor
            .track_completion(&Completion::pending(ResultShape::Unit))
            .unwrap();
        let ids: Vec<IntentId> = actions
            .execute_routine_intents
            .iter()
            .map(|i| i.intent_id)
            .collect();
        assert_eq!(ids, vec![first, second]);
        assert!(actions.execute_routine_intents[0].continuation.is_none());

        let continuation = actions.execute_routine_intents[1]
            .continuation
            .as_ref()
            .unwrap();
        assert_eq!(continuation.service_id, ServiceId::new("Orders"));
        assert_eq!(continuation.routine.method_id.as_str(), "Place");
    }

    #[tokio::test]
    async fn test_scope_releases_entry_on_drop() {
        let scope = TransitionScope::new();
        let routine = RoutineDescriptor::new("Place");
        let cancel = CancellationToken::new();

        let guard = scope
            .enter(ServiceId::new("Orders"), routine, &cancel)
            .await
            .unwrap();
        assert_eq!(scope.active_count(), 1);

        drop(guard);
        assert_eq!(scope.active_count(), 0);
    }

    #[tokio::test]
    async fn test_scope_serializes_same_routine() {
        let scope = TransitionScope::new();
        let routine = RoutineDescriptor::new("Place");
        let cancel = CancellationToken::new();

        let first = scope
            .enter(ServiceId::new("Orders"), routine.clone(), &cancel)
            .await
            .unwrap();

        let waiting = {
            let scope = scope.clone();
            let routine = routine.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                scope
                    .enter(ServiceId::new("Orders"), routine, &cancel)
                    .await
                    .map(|_| ())
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        drop(first);
        waiting.await.unwrap().unwrap();
        assert_eq!(scope.active_count(), 0);
    }

    #[tokio::test]
    async fn test_scope_allows_distinct_routines_concurrently() {
        let scope = TransitionScope::new();
        let cancel = CancellationToken::new();

        let _a = scope
            .enter(ServiceId::new("Orders"), RoutineDescriptor::new("A"), &cancel)
            .await
            .unwrap();
        let _b = scope
            .enter(ServiceId::new("Orders"), RoutineDescriptor::new("B"), &cancel)
            .await
            .unwrap();

        assert_eq!(scope.active_count(), 2);
    }

    #[tokio::test]
    async fn test_scope_wait_is_cancellable() {
        let scope = TransitionScope::new();
        let routine = RoutineDescriptor::new("Place");
        let cancel = CancellationToken::new();

        let _held = scope
            .enter(ServiceId::new("Orders"), routine.clone(), &cancel)
            .await
            .unwrap();

        let waiter_cancel = CancellationToken::new();
        waiter_cancel.cancel();
        let err = scope
            .enter(ServiceId::new("Orders"), routine, &waiter_cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Cancelled));
        assert_eq!(scope.active_count(), 1);
    }

    #[tokio::test]
    async fn test_service_lock_serializes_routines_of_one_service() {
        let scope = TransitionScope::new();
        let cancel = CancellationToken::new();

        let mut first = scope
            .enter(ServiceId::new("Counter"), RoutineDescriptor::new("Increment"), &cancel)
            .await
            .unwrap();
        first.lock_service(&cancel).await.unwrap();
        assert_eq!(scope.active_count(), 2);

        let waiting = {
            let scope = scope.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut second = scope
                    .enter(ServiceId::new("Counter"), RoutineDescriptor::new("Increment"), &cancel)
                    .await
                    .unwrap();
                second.lock_service(&cancel).await.unwrap();
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        let mut other = scope
            .enter(ServiceId::keyed("Counter", "eu"), RoutineDescriptor::new("Increment"), &cancel)
            .await
            .unwrap();
        other.lock_service(&cancel).await.unwrap();
        drop(other);

        drop(first);
        waiting.await.unwrap();
        assert_eq!(scope.active_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_service_wait_keeps_routine_until_drop() {
        let scope = TransitionScope::new();
        let cancel = CancellationToken::new();

        let mut holder = scope
            .enter(ServiceId::new("Counter"), RoutineDescriptor::new("Increment"), &cancel)
            .await
            .unwrap();
        holder.lock_service(&cancel).await.unwrap();

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let mut waiter = scope
            .enter(ServiceId::new("Counter"), RoutineDescriptor::new("Reset"), &cancelled)
            .await
            .unwrap();
        let err = waiter.lock_service(&cancelled).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert_eq!(scope.active_count(), 3);

        drop(waiter);
        drop(holder);
        assert_eq!(scope.active_count(), 0);
    }
}
