// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine-owned control routines.
//!
//! `IntrinsicRoutines` is a stateless singleton service that is never looked
//! up through the service registry. Routines call it like any other service.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::capture::Waiter;
use crate::computation::StepContext;
use crate::descriptors::{MethodId, ResultShape, ServiceId};
use crate::error::{EngineError, Result};
use crate::service::{RoutineMethod, ServiceHandle, ServiceObject};
use crate::values::NamedValues;

/// Reserved service name of the intrinsic routines.
pub const INTRINSIC_SERVICE_NAME: &str = "IntrinsicRoutines";

const FROM_RESULT: &str = "FromResult";
const YIELD: &str = "Yield";

struct IntrinsicService;

impl ServiceObject for IntrinsicService {
    fn concrete_type(&self) -> &str {
        INTRINSIC_SERVICE_NAME
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The intrinsic routines singleton.
#[derive(Clone)]
pub struct IntrinsicRoutines {
    handle: ServiceHandle,
    methods: Arc<HashMap<MethodId, Arc<RoutineMethod>>>,
}

impl Default for IntrinsicRoutines {
    fn default() -> Self {
        Self::new()
    }
}

impl IntrinsicRoutines {
    /// Create the singleton with its built-in methods.
    pub fn new() -> Self {
        let methods = [
            RoutineMethod::plain(FROM_RESULT, |_owner, params, _ctx| {
                Ok(Some(params.value("value").cloned().unwrap_or(Value::Null)))
            })
            .parameters(["value"])
            .returns(ResultShape::Value),
            RoutineMethod::plain(YIELD, |_owner, _params, _ctx| Ok(Some(Value::Null))),
        ]
        .into_iter()
        .map(|m| (m.id().clone(), Arc::new(m)))
        .collect();

        Self {
            handle: ServiceHandle::new(IntrinsicService),
            methods: Arc::new(methods),
        }
    }

    /// Service id routines use to call the intrinsic routines.
    pub fn service_id() -> ServiceId {
        ServiceId::new(INTRINSIC_SERVICE_NAME)
    }

    /// Whether `service_id` names the intrinsic routines.
    pub fn is_intrinsic(service_id: &ServiceId) -> bool {
        service_id.service_name == INTRINSIC_SERVICE_NAME
    }

    /// Handle of the singleton instance.
    pub fn handle(&self) -> ServiceHandle {
        self.handle.clone()
    }

    /// Resolve a built-in method.
    pub fn resolve(&self, method_id: &MethodId) -> Result<Arc<RoutineMethod>> {
        self.methods
            .get(method_id)
            .cloned()
            .ok_or_else(|| EngineError::MethodResolution {
                service_type: INTRINSIC_SERVICE_NAME.to_string(),
                method_id: method_id.clone(),
            })
    }
}

/// Call `FromResult`: a routine that completes with `value`.
pub fn from_result(ctx: &mut StepContext<'_>, value: impl Into<Value>) -> Waiter {
    ctx.call(
        IntrinsicRoutines::service_id(),
        FROM_RESULT,
        NamedValues::new().with("value", value),
    )
}

/// Call `Yield`: a routine that completes immediately, so awaiting it ends
/// the current step and resumes the caller in a new transition.
pub fn yield_now(ctx: &mut StepContext<'_>) -> Waiter {
    ctx.call(IntrinsicRoutines::service_id(), YIELD, NamedValues::new())
}
