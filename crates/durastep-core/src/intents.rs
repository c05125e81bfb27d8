// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Follow-up work produced by a transition and handed to the committer.

use serde::{Deserialize, Serialize};

use crate::descriptors::{
    CallerDescriptor, ContinuationDescriptor, IntentId, MethodId, RoutineDescriptor,
    RoutineResult, RoutineResultDescriptor, ServiceId,
};
use crate::values::NamedValues;

/// Request to start a new routine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRoutineIntent {
    /// Intent id the new routine will run under.
    pub intent_id: IntentId,
    /// Target service.
    pub service_id: ServiceId,
    /// Target method.
    pub method_id: MethodId,
    /// Arguments, by parameter name.
    pub parameters: NamedValues,
    /// Routine to continue once the new routine completes, if it is awaited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation: Option<ContinuationDescriptor>,
    /// Routine that requested the invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<CallerDescriptor>,
}

impl ExecuteRoutineIntent {
    /// A top-level invocation with no caller and nobody waiting on it.
    pub fn new(
        service_id: ServiceId,
        method_id: impl Into<MethodId>,
        parameters: NamedValues,
    ) -> Self {
        Self {
            intent_id: IntentId::generate(),
            service_id,
            method_id: method_id.into(),
            parameters,
            continuation: None,
            caller: None,
        }
    }

    /// Descriptor of the routine this intent starts.
    pub fn routine(&self) -> RoutineDescriptor {
        RoutineDescriptor {
            method_id: self.method_id.clone(),
            intent_id: self.intent_id,
        }
    }
}

/// Notification that a routine some other routine awaits has completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinueRoutineIntent {
    /// The waiting routine to resume.
    pub continuation: ContinuationDescriptor,
    /// The awaited routine's result, tagged with its intent id.
    pub result: RoutineResultDescriptor,
    /// The routine that produced the result.
    pub callee: CallerDescriptor,
}

/// State to persist for the routine and its service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveStateIntent {
    /// Owning service.
    pub service_id: ServiceId,
    /// Persisted service fields, for stateful services.
    pub service_state: Option<NamedValues>,
    /// The routine whose state is saved, when it suspended.
    pub routine: Option<RoutineDescriptor>,
    /// Routine frame to resume from, when it suspended.
    pub routine_state: Option<NamedValues>,
    /// The newly requested invocation this routine is now waiting on.
    pub awaiting_routine: Option<ExecuteRoutineIntent>,
    /// Final result, when the routine completed.
    pub routine_result: Option<RoutineResult>,
}

impl SaveStateIntent {
    /// An intent saving nothing yet for `service_id`.
    pub fn new(service_id: ServiceId) -> Self {
        Self {
            service_id,
            service_state: None,
            routine: None,
            routine_state: None,
            awaiting_routine: None,
            routine_result: None,
        }
    }
}

/// Everything one transition asks the committer to do, atomically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduledActions {
    /// Whether the routine suspended and its frame must be saved.
    pub save_routine_state: bool,
    /// State to persist.
    pub save_state: Option<SaveStateIntent>,
    /// New routines to start, in request order.
    pub execute_routine_intents: Vec<ExecuteRoutineIntent>,
    /// Waiters to resume with this routine's result.
    pub continuation_intents: Vec<ContinueRoutineIntent>,
}

impl ScheduledActions {
    /// Whether the routine finished during this transition.
    pub fn routine_completed(&self) -> bool {
        self.save_state
            .as_ref()
            .is_some_and(|s| s.routine_result.is_some())
    }

    /// The routine's final result, if it finished.
    pub fn routine_result(&self) -> Option<&RoutineResult> {
        self.save_state
            .as_ref()
            .and_then(|s| s.routine_result.as_ref())
    }
}
