// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for durastep-core.
//!
//! A backend stores routine records, service state and the queue of
//! transitions waiting for delivery. Applying the actions of a transition is
//! atomic: either every save, insert and enqueue happens and the delivered
//! transition leaves the queue, or nothing changes.

pub mod memory;
pub mod sqlite;
mod stored;

pub use self::memory::MemoryPersistence;
pub use self::sqlite::SqlitePersistence;
pub use self::stored::{PersistenceCommitter, StoredTransitionData};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::descriptors::{
    CallerDescriptor, ContinuationDescriptor, IntentId, RoutineDescriptor, RoutineResult,
    RoutineResultDescriptor, ServiceId, TransitionKind,
};
use crate::error::Result;
use crate::intents::{ContinueRoutineIntent, ExecuteRoutineIntent, ScheduledActions};
use crate::transition::TransitionCarrier;
use crate::values::NamedValues;

/// Error recorded on a transition whose claim expired unacknowledged.
pub(crate) const STALE_CLAIM: &str = "claim expired before the transition was acknowledged";

/// Lifecycle status of a stored routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutineStatus {
    /// Requested, first transition not yet committed.
    Scheduled,
    /// Waiting for a continuation.
    Suspended,
    /// Finished with a result.
    Completed,
}

impl RoutineStatus {
    /// Returns the string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
        }
    }

    /// Parse a status from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(Self::Scheduled),
            "suspended" => Some(Self::Suspended),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Stored routine instance.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutineRecord {
    /// Owning service.
    pub service_id: ServiceId,
    /// Method and intent id.
    pub routine: RoutineDescriptor,
    /// Invocation arguments.
    pub parameters: NamedValues,
    /// Current status.
    pub status: RoutineStatus,
    /// Saved frame, while suspended.
    pub state: Option<NamedValues>,
    /// Final result, once completed.
    pub result: Option<RoutineResult>,
    /// Routines waiting for this routine's result.
    pub continuations: Vec<ContinuationDescriptor>,
    /// Routine that requested this one.
    pub caller: Option<CallerDescriptor>,
    /// When the routine was requested.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

impl RoutineRecord {
    /// A freshly scheduled routine for `intent`.
    pub fn scheduled(intent: &ExecuteRoutineIntent, now: DateTime<Utc>) -> Self {
        Self {
            service_id: intent.service_id.clone(),
            routine: intent.routine(),
            parameters: intent.parameters.clone(),
            status: RoutineStatus::Scheduled,
            state: None,
            result: None,
            continuations: intent.continuation.iter().cloned().collect(),
            caller: intent.caller.clone(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A transition waiting in the delivery queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedTransition {
    /// Delivery id.
    pub id: String,
    /// What the transition does.
    pub kind: TransitionKind,
    /// Service owning the routine.
    pub service_id: ServiceId,
    /// Routine to run.
    pub routine: RoutineDescriptor,
    /// Delivered result, for continuations.
    pub awaited_result: Option<RoutineResultDescriptor>,
    /// Deliveries abandoned so far.
    pub attempt: u32,
    /// Error of the last abandoned or failed delivery.
    pub last_error: Option<String>,
    /// When the transition was enqueued.
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedTransition {
    /// First transition of a requested routine.
    pub fn invoke(intent: &ExecuteRoutineIntent, now: DateTime<Utc>) -> Self {
        Self::new(
            TransitionKind::InvokeRoutine,
            intent.service_id.clone(),
            intent.routine(),
            None,
            now,
        )
    }

    /// Continuation of a waiting routine with an awaited result.
    pub fn continuation(intent: &ContinueRoutineIntent, now: DateTime<Utc>) -> Self {
        Self::new(
            TransitionKind::ContinueRoutine,
            intent.continuation.service_id.clone(),
            intent.continuation.routine.clone(),
            Some(intent.result.clone()),
            now,
        )
    }

    fn new(
        kind: TransitionKind,
        service_id: ServiceId,
        routine: RoutineDescriptor,
        awaited_result: Option<RoutineResultDescriptor>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            service_id,
            routine,
            awaited_result,
            attempt: 0,
            last_error: None,
            enqueued_at: now,
        }
    }
}

impl TransitionCarrier for QueuedTransition {
    fn delivery_id(&self) -> &str {
        &self.id
    }
}

/// Durable storage for routines, service state and the transition queue.
#[async_trait::async_trait]
pub trait Persistence: Send + Sync {
    /// Store a top-level routine request and enqueue its first transition.
    async fn schedule(&self, intent: &ExecuteRoutineIntent) -> Result<()>;

    /// Atomically apply the actions of the delivered transition `delivery_id`
    /// and remove it from the queue. Fails with nothing applied if the
    /// transition is no longer claimed.
    async fn apply(&self, delivery_id: &str, actions: &ScheduledActions) -> Result<()>;

    /// Load a routine by intent id.
    async fn get_routine(&self, intent_id: IntentId) -> Result<Option<RoutineRecord>>;

    /// Load persisted service fields.
    async fn get_service_state(&self, service_id: &ServiceId) -> Result<Option<NamedValues>>;

    /// Claim up to `limit` pending transitions in enqueue order.
    async fn claim_transitions(&self, limit: usize) -> Result<Vec<QueuedTransition>>;

    /// Return a claimed transition to the queue for redelivery.
    async fn abandon_transition(&self, delivery_id: &str, error: &str) -> Result<()>;

    /// Take a claimed transition out of delivery for good.
    async fn fail_transition(&self, delivery_id: &str, error: &str) -> Result<()>;

    /// Return transitions claimed before `cutoff` to the queue. The lost
    /// delivery counts as an attempt. Returns how many were reclaimed.
    async fn reclaim_stale_transitions(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Number of transitions pending or claimed.
    async fn pending_transitions(&self) -> Result<usize>;

    /// Transitions taken out of delivery.
    async fn failed_transitions(&self) -> Result<Vec<QueuedTransition>>;
}
