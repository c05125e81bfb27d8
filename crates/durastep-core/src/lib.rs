// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durastep Core - Durable Transition Execution
//!
//! This crate runs long-lived, suspendable routines one durable step at a
//! time. Each step ("transition") restores the routine from persisted state,
//! advances it to its next await point or to completion, and commits the
//! follow-up work it produced as one atomic unit: state to save, new routines
//! to start, and waiting routines to continue.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         TransitionWorker                             │
//! │          claims queued transitions, runs them concurrently           │
//! └──────────────────────────────────────────────────────────────────────┘
//!                │ QueuedTransition + StoredTransitionData
//!                ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         TransitionRunner                             │
//! │  scope ─► resolve service/method ─► load state ─► advance one step   │
//! │        ─► TransitionMonitor report ─► assemble ScheduledActions      │
//! └──────────────────────────────────────────────────────────────────────┘
//!         │                          │                         │
//!         ▼                          ▼                         ▼
//! ┌────────────────┐   ┌──────────────────────────┐   ┌─────────────────┐
//! │ServiceRegistry │   │ SuspendableComputation   │   │TransitionCommit.│
//! │IntrinsicRoutine│   │ Frame / Completion /     │   │ (Persistence)   │
//! │                │   │ WaiterCapture            │   │ memory | sqlite │
//! └────────────────┘   └──────────────────────────┘   └─────────────────┘
//! ```
//!
//! # Transition Kinds
//!
//! | Kind | Description |
//! |------|-------------|
//! | `InvokeRoutine` | First step: parameters are loaded into a fresh frame |
//! | `ContinueRoutine` | Resume: the saved frame is restored and the awaited result delivered |
//!
//! # Routine Status
//!
//! ```text
//!   schedule / requested by caller
//!              │
//!              ▼
//!        ┌───────────┐  step awaits  ┌───────────┐
//!        │ SCHEDULED │──────────────►│ SUSPENDED │◄──┐
//!        └─────┬─────┘               └─────┬─────┘   │ awaits again
//!              │ step completes            │ continue│
//!              │ or faults                 ├─────────┘
//!              ▼                           │ completes or faults
//!        ┌───────────┐                     │
//!        │ COMPLETED │◄────────────────────┘
//!        └───────────┘
//! ```
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `DURASTEP_DATABASE_URL` | No | in-memory | SQLite connection string |
//! | `DURASTEP_MAX_CONCURRENT_TRANSITIONS` | No | `16` | Transitions a worker runs at once |
//! | `DURASTEP_POLL_INTERVAL_MS` | No | `100` | Idle queue poll interval |
//! | `DURASTEP_BATCH_SIZE` | No | `32` | Transitions claimed per poll |
//! | `DURASTEP_MAX_ATTEMPTS` | No | `5` | Deliveries before a transition fails |
//! | `DURASTEP_CLAIM_TIMEOUT_SECS` | No | `300` | Age at which an unacknowledged claim is requeued |

#![deny(missing_docs)]

/// Awaited-result delivery into restored computations.
pub mod capture;

/// Completion signals and the fault adapter.
pub mod completion;

/// Suspendable computation model: positions, frames and steps.
pub mod computation;

/// Engine configuration loaded from environment variables.
pub mod config;

/// Identity and result descriptors.
pub mod descriptors;

/// Error types with stable error codes.
pub mod error;

/// Follow-up work produced by transitions.
pub mod intents;

/// Engine-owned intrinsic routines.
pub mod intrinsic;

/// Embedded database migrations.
pub mod migrations;

/// Transition monitor and per-routine scope.
pub mod monitor;

/// Storage backends for routines, service state and the transition queue.
pub mod persistence;

/// The transition runner.
pub mod runner;

/// Services, routine methods and the service registry.
pub mod service;

/// Contracts with the delivery and storage layers.
pub mod transition;

/// Type identity records.
pub mod type_identity;

/// Named-slot value containers.
pub mod values;

/// Queue-draining transition worker.
pub mod worker;

pub use capture::{Waiter, WaiterCapture};
pub use completion::Completion;
pub use computation::{
    ComputationFactory, Frame, Position, StepContext, StepOutcome, SuspendableComputation,
};
pub use config::{Config, ConfigError};
pub use descriptors::{
    CallerDescriptor, ContinuationDescriptor, Fault, IntentId, MethodId, ResultShape,
    RoutineDescriptor, RoutineResult, RoutineResultDescriptor, ServiceId, TransitionDescriptor,
    TransitionKind,
};
pub use error::{EngineError, Result};
pub use intents::{ContinueRoutineIntent, ExecuteRoutineIntent, SaveStateIntent, ScheduledActions};
pub use intrinsic::{INTRINSIC_SERVICE_NAME, IntrinsicRoutines};
pub use monitor::{MonitorState, ScopeGuard, TransitionMonitor, TransitionScope};
pub use persistence::{
    MemoryPersistence, Persistence, PersistenceCommitter, SqlitePersistence,
    StoredTransitionData,
};
pub use runner::TransitionRunner;
pub use service::{
    MethodBody, MethodInvoker, RoutineMethod, RoutineMethodResolver, ServiceDefinition,
    ServiceHandle, ServiceObject, ServiceProxyBuilder, ServiceRegistry,
};
pub use transition::{TransitionCarrier, TransitionCommitter, TransitionData};
pub use type_identity::{TypeIdentity, Version};
pub use values::{NamedValues, SharedValues, SlotError, SlotSchema, ValueContainer, ValueContainerExt};
pub use worker::{TransitionWorker, WorkerConfig};
