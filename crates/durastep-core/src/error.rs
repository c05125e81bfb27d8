// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for durastep-core.
//!
//! Application faults raised by routine code are never engine errors; they
//! become faulted routine results. `EngineError` covers protocol violations,
//! resolution and data failures, storage failures and cancellation.

use thiserror::Error;

use crate::descriptors::{MethodId, TransitionKind};
use crate::values::SlotError;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that abort a transition without committing anything.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The transition kind cannot be executed.
    #[error("Unsupported transition kind '{}'", .0.as_str())]
    UnsupportedTransition(TransitionKind),

    /// A continuation was delivered to a method that cannot suspend.
    #[error("Method '{method_id}' is not suspendable and cannot be continued")]
    NotSuspendable {
        /// The method that was continued.
        method_id: MethodId,
    },

    /// The method produced no completion signal and is not allowed to.
    #[error("Method '{method_id}' did not produce a completion")]
    MissingCompletion {
        /// The offending method.
        method_id: MethodId,
    },

    /// The service instance could not be obtained.
    #[error("Failed to resolve service '{service_id}': {reason}")]
    ServiceResolution {
        /// Rendered service identity.
        service_id: String,
        /// Why resolution failed.
        reason: String,
    },

    /// No routine method is registered for the concrete service type.
    #[error("No routine method '{method_id}' on service type '{service_type}'")]
    MethodResolution {
        /// Concrete implementation type of the service.
        service_type: String,
        /// The requested method.
        method_id: MethodId,
    },

    /// Transition data could not be read.
    #[error("Transition data unavailable: {0}")]
    DataUnavailable(String),

    /// Persisted state could not be loaded into its container.
    #[error("Failed to load {target} state: {reason}")]
    StateLoad {
        /// Which state was loaded (service, parameters, routine).
        target: &'static str,
        /// Why loading failed.
        reason: String,
    },

    /// Slot access failed.
    #[error(transparent)]
    Slot(#[from] SlotError),

    /// The transition monitor was used out of order.
    #[error("Transition monitor already in state '{state}'")]
    MonitorState {
        /// State the monitor was in.
        state: &'static str,
    },

    /// The committer rejected the scheduled actions.
    #[error("Commit failed: {0}")]
    Commit(String),

    /// The transition was cancelled before the routine advanced.
    #[error("Transition cancelled")]
    Cancelled,

    /// Durable storage operation failed.
    #[error("Storage error during '{operation}': {details}")]
    Storage {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl EngineError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::UnsupportedTransition(_) => "UNSUPPORTED_TRANSITION",
            Self::NotSuspendable { .. } => "NOT_SUSPENDABLE",
            Self::MissingCompletion { .. } => "MISSING_COMPLETION",
            Self::ServiceResolution { .. } => "SERVICE_RESOLUTION",
            Self::MethodResolution { .. } => "METHOD_RESOLUTION",
            Self::DataUnavailable(_) => "DATA_UNAVAILABLE",
            Self::StateLoad { .. } => "STATE_LOAD",
            Self::Slot(_) => "SLOT_ERROR",
            Self::MonitorState { .. } => "MONITOR_STATE",
            Self::Commit(_) => "COMMIT_FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Storage { .. } => "STORAGE_ERROR",
        }
    }

    /// Protocol violations. Redelivering the same transition fails again.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedTransition(_)
                | Self::NotSuspendable { .. }
                | Self::MissingCompletion { .. }
                | Self::MonitorState { .. }
        )
    }

    /// Whether the delivery layer may redeliver the transition.
    pub fn is_retryable(&self) -> bool {
        !self.is_fatal()
    }

    pub(crate) fn storage(operation: &str, details: impl ToString) -> Self {
        Self::Storage {
            operation: operation.to_string(),
            details: details.to_string(),
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::storage("query", err)
    }
}

impl From<sqlx::migrate::MigrateError> for EngineError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        EngineError::storage("migrate", err)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::storage("json", err)
    }
}
