// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Identity and result descriptors carried by every transition.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Correlation id of one routine invocation.
///
/// Generated once when the invocation is requested and never reused; results
/// and continuations are matched back to their origin through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntentId(Uuid);

impl IntentId {
    /// Generate a fresh, globally unique intent id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for IntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for IntentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identity of a service instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceId {
    /// Registered service name.
    pub service_name: String,
    /// Key of a specific instance, for services with more than one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_key: Option<String>,
}

impl ServiceId {
    /// Identity of the default instance of `service_name`.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            instance_key: None,
        }
    }

    /// Identity of a keyed instance.
    pub fn keyed(service_name: impl Into<String>, instance_key: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            instance_key: Some(instance_key.into()),
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.instance_key {
            Some(key) => write!(f, "{}/{}", self.service_name, key),
            None => f.write_str(&self.service_name),
        }
    }
}

/// Identifier of a routine method within a service type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MethodId(String);

impl MethodId {
    /// Create a method id.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The method name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MethodId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MethodId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identity of one routine instantiation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutineDescriptor {
    /// Method being run.
    pub method_id: MethodId,
    /// Correlation id of this invocation.
    pub intent_id: IntentId,
}

impl RoutineDescriptor {
    /// Describe a new invocation of `method_id` with a fresh intent id.
    pub fn new(method_id: impl Into<MethodId>) -> Self {
        Self {
            method_id: method_id.into(),
            intent_id: IntentId::generate(),
        }
    }
}

/// Kind of transition delivered to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// No kind set. Never valid for execution.
    #[default]
    Unspecified,
    /// First step of a routine.
    InvokeRoutine,
    /// Resumption of a suspended routine.
    ContinueRoutine,
}

impl TransitionKind {
    /// Returns the string representation of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::InvokeRoutine => "invoke_routine",
            Self::ContinueRoutine => "continue_routine",
        }
    }

    /// Parse a kind from a string. Unknown strings map to `Unspecified`.
    pub fn parse(s: &str) -> Self {
        match s {
            "invoke_routine" => Self::InvokeRoutine,
            "continue_routine" => Self::ContinueRoutine,
            _ => Self::Unspecified,
        }
    }
}

/// Classification of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransitionDescriptor {
    /// What the transition does.
    pub kind: TransitionKind,
}

impl TransitionDescriptor {
    /// Descriptor of the given kind.
    pub fn new(kind: TransitionKind) -> Self {
        Self { kind }
    }
}

/// Causal origin of a scheduled invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerDescriptor {
    /// Calling service.
    pub service_id: ServiceId,
    /// Calling routine.
    pub routine: RoutineDescriptor,
}

/// A routine waiting for another routine's result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationDescriptor {
    /// Service owning the waiting routine.
    pub service_id: ServiceId,
    /// The waiting routine.
    pub routine: RoutineDescriptor,
}

/// Shape of the value a routine method declares it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultShape {
    /// No value; success always carries `null`.
    #[default]
    Unit,
    /// A JSON value.
    Value,
}

/// Application fault captured from a routine step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    /// Fault class (`error` for returned errors, `panic` for panics).
    pub kind: String,
    /// Rendered error chain.
    pub message: String,
}

impl Fault {
    /// Fault from a returned error, keeping the full context chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self {
            kind: "error".to_string(),
            message: format!("{:#}", err),
        }
    }

    /// Fault from a caught panic payload.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "routine panicked".to_string()
        };
        Self {
            kind: "panic".to_string(),
            message,
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Final outcome of a routine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "data", rename_all = "snake_case")]
pub enum RoutineResult {
    /// Completed with a value (`null` for unit routines).
    Succeeded(Value),
    /// Completed with an application fault.
    Faulted(Fault),
    /// Completed by cancellation.
    Cancelled,
}

impl RoutineResult {
    /// Whether the routine faulted.
    pub fn is_faulted(&self) -> bool {
        matches!(self, Self::Faulted(_))
    }

    /// The success value, if any.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Succeeded(v) => Some(v),
            _ => None,
        }
    }

    /// Convert into a plain `Result`, turning faults into errors so routine
    /// code can use `?` on awaited results.
    pub fn into_result(self) -> anyhow::Result<Value> {
        match self {
            Self::Succeeded(v) => Ok(v),
            Self::Faulted(fault) => Err(anyhow::anyhow!(fault.message)),
            Self::Cancelled => Err(anyhow::anyhow!("awaited routine was cancelled")),
        }
    }
}

/// A computed result ready for delivery to waiters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutineResultDescriptor {
    /// The result.
    pub result: RoutineResult,
    /// Intent id of the routine that produced it.
    pub intent_id: IntentId,
}
