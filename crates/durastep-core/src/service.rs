// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Services, routine methods and their registry.
//!
//! Every routine method is registered explicitly with its parameter and local
//! slot layouts and either a computation factory (suspendable methods) or an
//! invoker (plain methods). The [`ServiceRegistry`] resolves service instances
//! by service name and methods by the instance's concrete type.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::computation::{ComputationFactory, StepContext, SuspendableComputation};
use crate::descriptors::{MethodId, ResultShape, ServiceId};
use crate::error::{EngineError, Result};
use crate::values::{NamedValues, SharedValues, SlotSchema};

/// A service instance the engine can run routines on.
pub trait ServiceObject: Send + Sync + 'static {
    /// Name of the concrete implementation type. Methods are resolved
    /// against it.
    fn concrete_type(&self) -> &str;

    /// Persisted fields, for stateful services.
    fn persisted_state(&self) -> Option<SharedValues> {
        None
    }

    /// Access for downcasting to the implementation type.
    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a resolved service instance.
#[derive(Clone)]
pub struct ServiceHandle(Arc<dyn ServiceObject>);

impl ServiceHandle {
    /// Wrap a service instance.
    pub fn new<S: ServiceObject>(service: S) -> Self {
        Self(Arc::new(service))
    }

    /// Wrap an already shared instance.
    pub fn from_arc(service: Arc<dyn ServiceObject>) -> Self {
        Self(service)
    }

    /// Concrete implementation type name.
    pub fn concrete_type(&self) -> &str {
        self.0.concrete_type()
    }

    /// Borrow the instance as its implementation type.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }

    /// State container of the service. Empty for stateless services.
    pub fn state_container(&self) -> SharedValues {
        self.0.persisted_state().unwrap_or_default()
    }
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ServiceHandle")
            .field(&self.concrete_type())
            .finish()
    }
}

/// Body of a plain (non-suspendable) routine method.
///
/// Returns the routine's value, or `None` when the method produces no
/// completion signal.
pub trait MethodInvoker: Send + Sync {
    /// Run the method to completion.
    fn invoke(
        &self,
        owner: &ServiceHandle,
        parameters: &NamedValues,
        ctx: &mut StepContext<'_>,
    ) -> anyhow::Result<Option<Value>>;
}

impl<F> MethodInvoker for F
where
    F: Fn(&ServiceHandle, &NamedValues, &mut StepContext<'_>) -> anyhow::Result<Option<Value>>
        + Send
        + Sync,
{
    fn invoke(
        &self,
        owner: &ServiceHandle,
        parameters: &NamedValues,
        ctx: &mut StepContext<'_>,
    ) -> anyhow::Result<Option<Value>> {
        self(owner, parameters, ctx)
    }
}

/// How a routine method runs.
#[derive(Clone)]
pub enum MethodBody {
    /// A state machine that may suspend between steps.
    Suspendable(Arc<dyn ComputationFactory>),
    /// A plain call that runs to completion in one step.
    Plain(Arc<dyn MethodInvoker>),
}

/// Registration of one routine method.
#[derive(Clone)]
pub struct RoutineMethod {
    id: MethodId,
    parameters: SlotSchema,
    locals: SlotSchema,
    result_shape: ResultShape,
    completes_without_signal: bool,
    body: MethodBody,
}

impl RoutineMethod {
    /// A suspendable method built by `factory`.
    pub fn suspendable<F>(id: impl Into<MethodId>, factory: F) -> Self
    where
        F: Fn(ServiceHandle) -> Box<dyn SuspendableComputation> + Send + Sync + 'static,
    {
        Self::with_body(id, MethodBody::Suspendable(Arc::new(factory)))
    }

    /// A plain method run by `invoker`.
    pub fn plain<F>(id: impl Into<MethodId>, invoker: F) -> Self
    where
        F: Fn(&ServiceHandle, &NamedValues, &mut StepContext<'_>) -> anyhow::Result<Option<Value>>
            + Send
            + Sync
            + 'static,
    {
        Self::with_body(id, MethodBody::Plain(Arc::new(invoker)))
    }

    /// A method with an explicit body.
    pub fn with_body(id: impl Into<MethodId>, body: MethodBody) -> Self {
        Self {
            id: id.into(),
            parameters: SlotSchema::empty(),
            locals: SlotSchema::empty(),
            result_shape: ResultShape::Unit,
            completes_without_signal: false,
            body,
        }
    }

    /// Declare parameter slots, in order.
    pub fn parameters<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameters = SlotSchema::new(names);
        self
    }

    /// Declare local slots kept across suspensions.
    pub fn locals<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.locals = SlotSchema::new(names);
        self
    }

    /// Declare the result shape.
    pub fn returns(mut self, shape: ResultShape) -> Self {
        self.result_shape = shape;
        self
    }

    /// Allow the method to finish without a completion signal; the engine
    /// then treats it as completed with unit.
    pub fn completes_without_signal(mut self) -> Self {
        self.completes_without_signal = true;
        self
    }

    /// Method id.
    pub fn id(&self) -> &MethodId {
        &self.id
    }

    /// Parameter slot layout.
    pub fn parameter_schema(&self) -> &SlotSchema {
        &self.parameters
    }

    /// Frame layout: parameters followed by locals.
    pub fn frame_schema(&self) -> SlotSchema {
        self.parameters.extend(&self.locals)
    }

    /// Declared result shape.
    pub fn result_shape(&self) -> ResultShape {
        self.result_shape
    }

    /// Whether a missing completion is legal.
    pub fn allows_missing_completion(&self) -> bool {
        self.completes_without_signal
    }

    /// Whether the method can suspend.
    pub fn is_suspendable(&self) -> bool {
        matches!(self.body, MethodBody::Suspendable(_))
    }

    /// How the method runs.
    pub fn body(&self) -> &MethodBody {
        &self.body
    }
}

impl fmt::Debug for RoutineMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutineMethod")
            .field("id", &self.id)
            .field("parameters", &self.parameters)
            .field("locals", &self.locals)
            .field("result_shape", &self.result_shape)
            .field("suspendable", &self.is_suspendable())
            .finish()
    }
}

/// Produces service instances from service ids.
pub trait ServiceProxyBuilder: Send + Sync {
    /// Obtain the instance for `service_id`.
    fn build(&self, service_id: &ServiceId) -> Result<ServiceHandle>;
}

/// Looks up routine methods by concrete service type.
pub trait RoutineMethodResolver: Send + Sync {
    /// Resolve `method_id` on `concrete_type`.
    fn resolve(&self, concrete_type: &str, method_id: &MethodId) -> Result<Arc<RoutineMethod>>;
}

type InstanceFactory = Arc<dyn Fn(&ServiceId) -> anyhow::Result<ServiceHandle> + Send + Sync>;

/// One service type and its routine methods.
pub struct ServiceDefinition {
    service_name: String,
    concrete_type: String,
    factory: InstanceFactory,
    methods: Vec<RoutineMethod>,
}

impl ServiceDefinition {
    /// Define `service_name`, implemented by `concrete_type` instances
    /// produced by `factory`.
    pub fn new<F>(
        service_name: impl Into<String>,
        concrete_type: impl Into<String>,
        factory: F,
    ) -> Self
    where
        F: Fn(&ServiceId) -> anyhow::Result<ServiceHandle> + Send + Sync + 'static,
    {
        Self {
            service_name: service_name.into(),
            concrete_type: concrete_type.into(),
            factory: Arc::new(factory),
            methods: Vec::new(),
        }
    }

    /// Add a routine method.
    pub fn method(mut self, method: RoutineMethod) -> Self {
        self.methods.push(method);
        self
    }
}

/// In-process registry of service definitions.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, InstanceFactory>,
    methods: HashMap<String, HashMap<MethodId, Arc<RoutineMethod>>>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service definition. Replaces an earlier definition with the
    /// same service name.
    pub fn register(&mut self, definition: ServiceDefinition) -> &mut Self {
        let methods = self.methods.entry(definition.concrete_type).or_default();
        for method in definition.methods {
            methods.insert(method.id().clone(), Arc::new(method));
        }
        self.services
            .insert(definition.service_name, definition.factory);
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, definition: ServiceDefinition) -> Self {
        self.register(definition);
        self
    }

    /// Registered service names.
    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }
}

impl ServiceProxyBuilder for ServiceRegistry {
    fn build(&self, service_id: &ServiceId) -> Result<ServiceHandle> {
        let factory = self.services.get(&service_id.service_name).ok_or_else(|| {
            EngineError::ServiceResolution {
                service_id: service_id.to_string(),
                reason: "service is not registered".to_string(),
            }
        })?;
        factory(service_id).map_err(|e| EngineError::ServiceResolution {
            service_id: service_id.to_string(),
            reason: format!("{:#}", e),
        })
    }
}

impl RoutineMethodResolver for ServiceRegistry {
    fn resolve(&self, concrete_type: &str, method_id: &MethodId) -> Result<Arc<RoutineMethod>> {
        self.methods
            .get(concrete_type)
            .and_then(|methods| methods.get(method_id))
            .cloned()
            .ok_or_else(|| EngineError::MethodResolution {
                service_type: concrete_type.to_string(),
                method_id: method_id.clone(),
            })
    }
}
