// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Contracts between the runner and the delivery and storage layers.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::descriptors::{
    ContinuationDescriptor, RoutineDescriptor, RoutineResultDescriptor, ServiceId,
    TransitionDescriptor,
};
use crate::error::Result;
use crate::intents::ScheduledActions;
use crate::values::ValueContainer;

/// Opaque handle to a delivered transition, used to acknowledge it on commit.
pub trait TransitionCarrier: Send + Sync {
    /// Identifier of this delivery.
    fn delivery_id(&self) -> &str;
}

/// Read access to everything a transition needs.
///
/// Read failures are reported as `EngineError::DataUnavailable`.
#[async_trait]
pub trait TransitionData: Send + Sync {
    /// What kind of transition this is.
    async fn transition_descriptor(&self, cancel: &CancellationToken)
    -> Result<TransitionDescriptor>;

    /// Service owning the routine.
    async fn service_id(&self, cancel: &CancellationToken) -> Result<ServiceId>;

    /// Routine to run.
    async fn routine_descriptor(&self, cancel: &CancellationToken) -> Result<RoutineDescriptor>;

    /// Load persisted service fields into `target`.
    async fn read_service_state(
        &self,
        target: &mut dyn ValueContainer,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Load the routine's invocation arguments into `target`.
    async fn read_routine_parameters(
        &self,
        target: &mut dyn ValueContainer,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Load the routine's saved frame into `target`.
    async fn read_routine_state(
        &self,
        target: &mut dyn ValueContainer,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Result of the awaited routine, for continuations.
    async fn awaited_result(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<RoutineResultDescriptor>>;

    /// Routines waiting for this routine's result.
    async fn continuations(&self, cancel: &CancellationToken)
    -> Result<Vec<ContinuationDescriptor>>;

    /// Whether the routine already holds its final result.
    ///
    /// A continuation delivered to a finished routine carries a result nobody
    /// waits for any more; the runner acknowledges it without running a step.
    async fn routine_finished(&self, _cancel: &CancellationToken) -> Result<bool> {
        Ok(false)
    }
}

/// Durably applies the actions of one transition, or fails with nothing
/// applied.
#[async_trait]
pub trait TransitionCommitter: Send + Sync {
    /// Commit `actions` and acknowledge `carrier`.
    async fn commit(
        &self,
        carrier: &dyn TransitionCarrier,
        actions: &ScheduledActions,
        cancel: &CancellationToken,
    ) -> Result<()>;
}
