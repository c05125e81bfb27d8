// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transition runner.
//!
//! Executes exactly one step of one routine and hands the resulting
//! [`ScheduledActions`] to the committer. Protocol violations, resolution
//! failures and data failures abort the transition before anything is
//! committed. Faults raised by routine code never abort: they complete the
//! routine with a faulted result, which is saved and propagated to waiting
//! routines like any other result.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::capture::WaiterCapture;
use crate::completion::{Completion, guard};
use crate::computation::{ComputationFactory, Frame, StepContext, advance_step};
use crate::descriptors::{
    CallerDescriptor, MethodId, RoutineDescriptor, RoutineResultDescriptor, ServiceId,
    TransitionKind,
};
use crate::error::{EngineError, Result};
use crate::intents::{ContinueRoutineIntent, SaveStateIntent, ScheduledActions};
use crate::intrinsic::IntrinsicRoutines;
use crate::monitor::{TransitionMonitor, TransitionScope};
use crate::service::{
    MethodBody, MethodInvoker, RoutineMethod, RoutineMethodResolver, ServiceHandle,
    ServiceProxyBuilder,
};
use crate::transition::{TransitionCarrier, TransitionCommitter, TransitionData};
use crate::values::{ValueContainer, ValueContainerExt};

/// Executes transitions.
#[derive(Clone)]
pub struct TransitionRunner {
    committer: Arc<dyn TransitionCommitter>,
    proxy_builder: Arc<dyn ServiceProxyBuilder>,
    method_resolver: Arc<dyn RoutineMethodResolver>,
    intrinsic: IntrinsicRoutines,
    scope: TransitionScope,
}

/// Identity of the routine a transition runs.
struct StepTarget<'a> {
    service_id: &'a ServiceId,
    routine: &'a RoutineDescriptor,
    method: &'a RoutineMethod,
    service: &'a ServiceHandle,
}

impl TransitionRunner {
    /// Create a runner.
    pub fn new(
        committer: Arc<dyn TransitionCommitter>,
        proxy_builder: Arc<dyn ServiceProxyBuilder>,
        method_resolver: Arc<dyn RoutineMethodResolver>,
    ) -> Self {
        Self {
            committer,
            proxy_builder,
            method_resolver,
            intrinsic: IntrinsicRoutines::new(),
            scope: TransitionScope::new(),
        }
    }

    /// Share a transition scope with other runners.
    pub fn with_scope(mut self, scope: TransitionScope) -> Self {
        self.scope = scope;
        self
    }

    /// The per-routine scope this runner enters.
    pub fn scope(&self) -> &TransitionScope {
        &self.scope
    }

    /// Run one transition and commit its actions.
    ///
    /// Returns the committed actions. On error nothing was committed and the
    /// delivery layer decides whether to redeliver.
    #[instrument(skip_all, fields(delivery_id = %carrier.delivery_id()))]
    pub async fn run(
        &self,
        carrier: &dyn TransitionCarrier,
        data: &dyn TransitionData,
        cancel: &CancellationToken,
    ) -> Result<ScheduledActions> {
        let is_continuation = match data.transition_descriptor(cancel).await?.kind {
            TransitionKind::InvokeRoutine => false,
            TransitionKind::ContinueRoutine => true,
            other => return Err(EngineError::UnsupportedTransition(other)),
        };

        let service_id = data.service_id(cancel).await?;
        let routine = data.routine_descriptor(cancel).await?;

        let mut scope = self
            .scope
            .enter(service_id.clone(), routine.clone(), cancel)
            .await?;

        if is_continuation && data.routine_finished(cancel).await? {
            debug!(
                service = %service_id,
                routine = %routine.intent_id,
                "Dropping result delivered to a finished routine"
            );
            let actions = ScheduledActions::default();
            self.committer.commit(carrier, &actions, cancel).await?;
            return Ok(actions);
        }

        let service = self.build_service(&service_id)?;
        let method = self.resolve_method(&service_id, &service, &routine.method_id)?;

        debug!(
            service = %service_id,
            method = %routine.method_id,
            routine = %routine.intent_id,
            continuation = is_continuation,
            "Running transition"
        );

        let mut service_state = service.state_container();
        let stateful = service_state.count() > 0;
        if stateful {
            scope.lock_service(cancel).await?;
            data.read_service_state(&mut service_state, cancel).await?;
        }

        let target = StepTarget {
            service_id: &service_id,
            routine: &routine,
            method: &method,
            service: &service,
        };
        let monitor = scope.monitor();

        let (completion, frame) = match method.body() {
            MethodBody::Suspendable(factory) => {
                let (completion, frame) = self
                    .step_suspendable(&target, factory.as_ref(), is_continuation, monitor, data, cancel)
                    .await?;
                (completion, Some(frame))
            }
            MethodBody::Plain(invoker) => {
                if is_continuation {
                    return Err(EngineError::NotSuspendable {
                        method_id: routine.method_id.clone(),
                    });
                }
                let completion = self
                    .step_plain(&target, invoker.as_ref(), monitor, data, cancel)
                    .await?;
                (completion, None)
            }
        };

        let mut actions = monitor.track_completion(&completion)?;

        let this_routine = CallerDescriptor {
            service_id: service_id.clone(),
            routine: routine.clone(),
        };
        for intent in &mut actions.execute_routine_intents {
            intent.caller = Some(this_routine.clone());
        }

        let result = completion.result();
        if actions.save_routine_state || stateful || result.is_some() {
            let mut save = SaveStateIntent::new(service_id.clone());
            if stateful {
                save.service_state = Some(service_state.snapshot());
            }
            if actions.save_routine_state {
                save.routine = Some(routine.clone());
                save.routine_state = frame.as_ref().map(|f| f.snapshot());
                let mut awaiting = actions.execute_routine_intents.iter().filter(|i| {
                    i.continuation
                        .as_ref()
                        .is_some_and(|c| c.routine.intent_id == routine.intent_id)
                });
                save.awaiting_routine = match (awaiting.next(), awaiting.next()) {
                    (Some(single), None) => Some(single.clone()),
                    _ => None,
                };
            }
            save.routine_result = result.clone();
            actions.save_state = Some(save);
        }

        if let Some(result) = result {
            for continuation in data.continuations(cancel).await? {
                actions.continuation_intents.push(ContinueRoutineIntent {
                    continuation,
                    result: RoutineResultDescriptor {
                        result: result.clone(),
                        intent_id: routine.intent_id,
                    },
                    callee: this_routine.clone(),
                });
            }
        }

        self.committer.commit(carrier, &actions, cancel).await?;

        info!(
            service = %service_id,
            method = %routine.method_id,
            routine = %routine.intent_id,
            outcome = outcome_label(&completion),
            requested = actions.execute_routine_intents.len(),
            continuations = actions.continuation_intents.len(),
            "Transition committed"
        );

        Ok(actions)
    }

    async fn step_suspendable(
        &self,
        target: &StepTarget<'_>,
        factory: &dyn ComputationFactory,
        is_continuation: bool,
        monitor: &mut TransitionMonitor,
        data: &dyn TransitionData,
        cancel: &CancellationToken,
    ) -> Result<(Completion, Frame)> {
        let shape = target.method.result_shape();
        let mut computation = factory.create(target.service.clone());
        let mut frame = Frame::new(&target.method.frame_schema());

        if is_continuation {
            let awaited = data.awaited_result(cancel).await?;
            let mut capture = if awaited.is_some() {
                WaiterCapture::active()
            } else {
                WaiterCapture::inactive()
            };
            data.read_routine_state(&mut frame, cancel).await?;

            if let Err(faulted) = guard(shape, || computation.restore(&frame, &mut capture)) {
                return Ok((faulted, frame));
            }
            if let Some(awaited) = awaited {
                capture.deliver(&awaited);
            }
        } else {
            data.read_routine_parameters(&mut frame, cancel).await?;
        }

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let report = {
            let mut ctx = StepContext::new(target.service_id, target.routine, monitor);
            advance_step(
                computation.as_mut(),
                &mut frame,
                &mut ctx,
                Completion::pending(shape),
            )
        };
        let unmatched = monitor.register_awaits(&report.awaited);
        if !unmatched.is_empty() {
            if is_continuation {
                debug!(
                    routine = %target.routine.intent_id,
                    awaited = ?unmatched,
                    "Routine awaits calls issued in earlier steps"
                );
            } else {
                warn!(
                    routine = %target.routine.intent_id,
                    awaited = ?unmatched,
                    "Routine awaits calls it never requested; no result will continue it"
                );
            }
        }

        Ok((report.completion, frame))
    }

    async fn step_plain(
        &self,
        target: &StepTarget<'_>,
        invoker: &dyn MethodInvoker,
        monitor: &mut TransitionMonitor,
        data: &dyn TransitionData,
        cancel: &CancellationToken,
    ) -> Result<Completion> {
        let shape = target.method.result_shape();
        let mut parameters = target.method.parameter_schema().create_container();
        data.read_routine_parameters(&mut parameters, cancel).await?;

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let outcome = {
            let mut ctx = StepContext::new(target.service_id, target.routine, monitor);
            guard(shape, || invoker.invoke(target.service, &parameters, &mut ctx))
        };

        match outcome {
            Ok(Some(value)) => Ok(Completion::completed(shape, value)),
            Ok(None) if target.method.allows_missing_completion() => Ok(Completion::completed_unit()),
            Ok(None) => Err(EngineError::MissingCompletion {
                method_id: target.routine.method_id.clone(),
            }),
            Err(faulted) => Ok(faulted),
        }
    }

    fn build_service(&self, service_id: &ServiceId) -> Result<ServiceHandle> {
        if IntrinsicRoutines::is_intrinsic(service_id) {
            return Ok(self.intrinsic.handle());
        }
        self.proxy_builder.build(service_id)
    }

    fn resolve_method(
        &self,
        service_id: &ServiceId,
        service: &ServiceHandle,
        method_id: &MethodId,
    ) -> Result<Arc<RoutineMethod>> {
        if IntrinsicRoutines::is_intrinsic(service_id) {
            return self.intrinsic.resolve(method_id);
        }
        self.method_resolver
            .resolve(service.concrete_type(), method_id)
    }
}

fn outcome_label(completion: &Completion) -> &'static str {
    use crate::descriptors::RoutineResult;

    match completion.result() {
        None => "suspended",
        Some(RoutineResult::Succeeded(_)) => "succeeded",
        Some(RoutineResult::Faulted(_)) => "faulted",
        Some(RoutineResult::Cancelled) => "cancelled",
    }
}
