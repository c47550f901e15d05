//! # Missile
//!
//! An action dispatcher and saga scheduler: arbitrary code dispatches typed
//! actions, and long-running routines ("sagas") react to them by running a
//! small set of composable effects.
//!
//! ## Core Concepts
//!
//! - [`Action`] = a typed message (`type`, optional payload and status)
//! - [`Effect`] = inert data describing an operation (call, put, take, ...)
//! - [`Task`] = a handle over one running saga, linked into an ownership tree
//! - [`Channel`] = a buffered producer/consumer queue, independent of actions
//!
//! ## Architecture
//!
//! ```text
//! caller ── dispatch(action) ──► Scheduler
//!                                   │
//!                                   ├─► subscribers (sync, failures logged)
//!                                   └─► pending takes (broadcast, removed on match)
//!                                          │
//!                                          ▼ resume
//! run_saga(f) ──► Task ──► saga body ── ctx.run(effect) ──► interpreter
//!                   │                                          │
//!                   └── children (fork) ◄──────────────────────┘
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Status is monotonic** - `running → completed | cancelled | aborted`, once
//! 2. **Cancellation flows down** - cancelling a task cancels its forked subtree
//!    first, then runs its cancel hooks, then stops the saga
//! 3. **Spawn is detached** - spawned tasks are never cancelled or aborted by
//!    their spawner
//! 4. **Dispatch is broadcast** - every pending take matching an action is
//!    resolved; unmatched actions are dropped, never buffered
//! 5. **Failures stay local** - an uncaught saga error aborts its task (and
//!    the forked ancestors), is reported once, and never reaches `dispatch`
//!
//! ## Example
//!
//! ```ignore
//! use missile::{Action, Scheduler, SagaContext};
//! use serde_json::Value;
//!
//! async fn fetch_user(ctx: SagaContext, action: Action) -> anyhow::Result<Value> {
//!     let user = ctx.call(move || api::fetch_user(action.payload_or_null())).await?;
//!     ctx.put(Action::new("user/LOADED").with_payload(user)).await?;
//!     Ok(Value::Null)
//! }
//!
//! let scheduler = Scheduler::new();
//! scheduler.run_saga(|ctx| async move {
//!     ctx.take_latest("user/FETCH", fetch_user).await?;
//!     Ok(Value::Null)
//! })?;
//!
//! scheduler.dispatch(Action::new("user/FETCH").with_payload(42))?;
//! ```

// Core modules
mod action;
mod channel;
mod config;
mod context;
mod effect;
mod error;
mod interpreter;
mod outcome;
mod pattern;
mod registry;
mod scheduler;
mod sync;
mod task;
mod watchers;

// Storage collaborator boundary
pub mod store;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export action and pattern types
pub use action::Action;
pub use pattern::{Pattern, PredicateFn};

// Re-export effect types and creators
pub use effect::{
    all, all_keyed, call, call_sync, call_with, cancel, cancel_tasks, debounce, delay, delay_ms,
    fork, fork_saga, put, race, spawn, spawn_saga, take, take_channel, take_every, take_latest,
    throttle, Effect, EffectKind, Group, Saga, SagaFuture, Worker,
};
pub use outcome::Outcome;

// Re-export channel types
pub use channel::{channel, BufferPolicy, Channel, ChannelConfig, DEFAULT_BUFFER_SIZE};

// Re-export task types
pub use task::{Task, TaskId, TaskInfo, TaskStatus};

// Re-export scheduler types (primary entry point)
pub use config::{ErrorContext, ErrorHook, SchedulerConfig};
pub use context::SagaContext;
pub use scheduler::{Scheduler, Subscription};

// Re-export error types
pub use error::{MissileError, TaskError};

// Re-export store types
pub use store::{KeyValueStore, MemoryStore, ValueChange};

// Re-export commonly used external types
pub use async_trait::async_trait;
