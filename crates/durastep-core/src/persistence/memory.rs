// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory persistence for tests and single-process demos.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::descriptors::{IntentId, ServiceId};
use crate::error::{EngineError, Result};
use crate::intents::{ExecuteRoutineIntent, ScheduledActions};
use crate::values::NamedValues;

use super::{Persistence, QueuedTransition, RoutineRecord, RoutineStatus, STALE_CLAIM};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueStatus {
    Pending,
    Claimed,
    Failed,
}

#[derive(Debug)]
struct QueueEntry {
    transition: QueuedTransition,
    status: QueueStatus,
    claimed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Store {
    routines: HashMap<IntentId, RoutineRecord>,
    service_states: HashMap<ServiceId, NamedValues>,
    queue: VecDeque<QueueEntry>,
}

impl Store {
    fn enqueue(&mut self, transition: QueuedTransition) {
        self.queue.push_back(QueueEntry {
            transition,
            status: QueueStatus::Pending,
            claimed_at: None,
        });
    }

    fn claimed_mut(&mut self, delivery_id: &str) -> Result<&mut QueueEntry> {
        self.queue
            .iter_mut()
            .find(|e| e.transition.id == delivery_id && e.status == QueueStatus::Claimed)
            .ok_or_else(|| EngineError::Commit(format!("transition '{}' is not claimed", delivery_id)))
    }
}

/// Persistence backed by process memory. All operations take one lock, so
/// every operation is atomic.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    store: Mutex<Store>,
    failing_applies: AtomicUsize,
}

impl MemoryPersistence {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls to `apply` fail without applying anything.
    pub fn fail_next_applies(&self, count: usize) {
        self.failing_applies.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_applies
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl Persistence for MemoryPersistence {
    async fn schedule(&self, intent: &ExecuteRoutineIntent) -> Result<()> {
        let now = Utc::now();
        let mut store = self.lock();
        store
            .routines
            .insert(intent.intent_id, RoutineRecord::scheduled(intent, now));
        store.enqueue(QueuedTransition::invoke(intent, now));
        Ok(())
    }

    async fn apply(&self, delivery_id: &str, actions: &ScheduledActions) -> Result<()> {
        if self.take_injected_failure() {
            return Err(EngineError::Commit("injected commit failure".to_string()));
        }

        let now = Utc::now();
        let mut store = self.lock();

        let routine_id = store.claimed_mut(delivery_id)?.transition.routine.intent_id;
        store.queue.retain(|e| e.transition.id != delivery_id);

        if let Some(save) = &actions.save_state {
            if let Some(state) = &save.service_state {
                store
                    .service_states
                    .insert(save.service_id.clone(), state.clone());
            }
            if let Some(record) = store.routines.get_mut(&routine_id) {
                if let Some(result) = &save.routine_result {
                    record.status = RoutineStatus::Completed;
                    record.result = Some(result.clone());
                    record.state = None;
                } else if let Some(state) = &save.routine_state {
                    record.status = RoutineStatus::Suspended;
                    record.state = Some(state.clone());
                }
                record.updated_at = now;
            }
        }

        for intent in &actions.execute_routine_intents {
            store
                .routines
                .insert(intent.intent_id, RoutineRecord::scheduled(intent, now));
            store.enqueue(QueuedTransition::invoke(intent, now));
        }
        for intent in &actions.continuation_intents {
            store.enqueue(QueuedTransition::continuation(intent, now));
        }

        Ok(())
    }

    async fn get_routine(&self, intent_id: IntentId) -> Result<Option<RoutineRecord>> {
        Ok(self.lock().routines.get(&intent_id).cloned())
    }

    async fn get_service_state(&self, service_id: &ServiceId) -> Result<Option<NamedValues>> {
        Ok(self.lock().service_states.get(service_id).cloned())
    }

    async fn claim_transitions(&self, limit: usize) -> Result<Vec<QueuedTransition>> {
        let now = Utc::now();
        let mut store = self.lock();
        let claimed = store
            .queue
            .iter_mut()
            .filter(|e| e.status == QueueStatus::Pending)
            .take(limit)
            .map(|e| {
                e.status = QueueStatus::Claimed;
                e.claimed_at = Some(now);
                e.transition.clone()
            })
            .collect();
        Ok(claimed)
    }

    async fn abandon_transition(&self, delivery_id: &str, error: &str) -> Result<()> {
        let mut store = self.lock();
        let entry = store.claimed_mut(delivery_id)?;
        entry.status = QueueStatus::Pending;
        entry.claimed_at = None;
        entry.transition.attempt += 1;
        entry.transition.last_error = Some(error.to_string());
        Ok(())
    }

    async fn fail_transition(&self, delivery_id: &str, error: &str) -> Result<()> {
        let mut store = self.lock();
        let entry = store.claimed_mut(delivery_id)?;
        entry.status = QueueStatus::Failed;
        entry.transition.last_error = Some(error.to_string());
        Ok(())
    }

    async fn reclaim_stale_transitions(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut store = self.lock();
        let mut reclaimed = 0;
        for entry in store.queue.iter_mut().filter(|e| {
            e.status == QueueStatus::Claimed && e.claimed_at.is_some_and(|at| at < cutoff)
        }) {
            entry.status = QueueStatus::Pending;
            entry.claimed_at = None;
            entry.transition.attempt += 1;
            entry.transition.last_error = Some(STALE_CLAIM.to_string());
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    async fn pending_transitions(&self) -> Result<usize> {
        Ok(self
            .lock()
            .queue
            .iter()
            .filter(|e| e.status != QueueStatus::Failed)
            .count())
    }

    async fn failed_transitions(&self) -> Result<Vec<QueuedTransition>> {
        Ok(self
            .lock()
            .queue
            .iter()
            .filter(|e| e.status == QueueStatus::Failed)
            .map(|e| e.transition.clone())
            .collect())
    }
}
