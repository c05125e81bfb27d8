// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Adapters running transitions against a [`Persistence`] backend.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::descriptors::{
    ContinuationDescriptor, RoutineDescriptor, RoutineResultDescriptor, ServiceId,
    TransitionDescriptor,
};
use crate::error::{EngineError, Result};
use crate::intents::ScheduledActions;
use crate::transition::{TransitionCarrier, TransitionCommitter, TransitionData};
use crate::values::{NamedValues, ValueContainer, ValueContainerExt};

use super::{Persistence, QueuedTransition, RoutineRecord, RoutineStatus};

/// Commits transition actions through a persistence backend.
#[derive(Clone)]
pub struct PersistenceCommitter {
    persistence: Arc<dyn Persistence>,
}

impl PersistenceCommitter {
    /// Commit through `persistence`.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }
}

#[async_trait]
impl TransitionCommitter for PersistenceCommitter {
    async fn commit(
        &self,
        carrier: &dyn TransitionCarrier,
        actions: &ScheduledActions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        // Once started, the apply runs to completion so its outcome is known.
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        self.persistence
            .apply(carrier.delivery_id(), actions)
            .await
    }
}

/// Transition data of a queued transition, read from a persistence backend.
///
/// The routine record is loaded on first use and cached for the rest of the
/// transition.
pub struct StoredTransitionData {
    transition: QueuedTransition,
    persistence: Arc<dyn Persistence>,
    record: OnceCell<RoutineRecord>,
}

impl StoredTransitionData {
    /// Data for `transition`.
    pub fn new(transition: QueuedTransition, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            transition,
            persistence,
            record: OnceCell::new(),
        }
    }

    /// The queued transition.
    pub fn transition(&self) -> &QueuedTransition {
        &self.transition
    }

    async fn record(&self, cancel: &CancellationToken) -> Result<&RoutineRecord> {
        self.record
            .get_or_try_init(|| async {
                let intent_id = self.transition.routine.intent_id;
                cancellable(cancel, self.persistence.get_routine(intent_id))
                    .await?
                    .ok_or_else(|| {
                        EngineError::DataUnavailable(format!("routine '{}' is not stored", intent_id))
                    })
            })
            .await
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    load: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
        loaded = load => loaded.map_err(|e| match e {
            EngineError::Storage { operation, details } => {
                EngineError::DataUnavailable(format!("{} failed: {}", operation, details))
            }
            other => other,
        }),
    }
}

fn load_into(
    target: &mut dyn ValueContainer,
    source: &NamedValues,
    what: &'static str,
) -> Result<()> {
    target
        .load_from(source)
        .map(|_| ())
        .map_err(|e| EngineError::StateLoad {
            target: what,
            reason: e.to_string(),
        })
}

#[async_trait]
impl TransitionData for StoredTransitionData {
    async fn transition_descriptor(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<TransitionDescriptor> {
        Ok(TransitionDescriptor::new(self.transition.kind))
    }

    async fn service_id(&self, _cancel: &CancellationToken) -> Result<ServiceId> {
        Ok(self.transition.service_id.clone())
    }

    async fn routine_descriptor(&self, _cancel: &CancellationToken) -> Result<RoutineDescriptor> {
        Ok(self.transition.routine.clone())
    }

    async fn read_service_state(
        &self,
        target: &mut dyn ValueContainer,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let stored = cancellable(
            cancel,
            self.persistence.get_service_state(&self.transition.service_id),
        )
        .await?;
        match stored {
            Some(state) => load_into(target, &state, "service"),
            None => Ok(()),
        }
    }

    async fn read_routine_parameters(
        &self,
        target: &mut dyn ValueContainer,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let record = self.record(cancel).await?;
        load_into(target, &record.parameters, "parameters")
    }

    async fn read_routine_state(
        &self,
        target: &mut dyn ValueContainer,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let record = self.record(cancel).await?;
        let state = record.state.as_ref().ok_or_else(|| {
            EngineError::DataUnavailable(format!(
                "routine '{}' has no saved state",
                record.routine.intent_id
            ))
        })?;
        load_into(target, state, "routine")
    }

    async fn awaited_result(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<Option<RoutineResultDescriptor>> {
        Ok(self.transition.awaited_result.clone())
    }

    async fn continuations(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<ContinuationDescriptor>> {
        Ok(self.record(cancel).await?.continuations.clone())
    }

    async fn routine_finished(&self, cancel: &CancellationToken) -> Result<bool> {
        Ok(self.record(cancel).await?.status == RoutineStatus::Completed)
    }
}
