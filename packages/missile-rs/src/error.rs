//! Structured error types for missile.
//!
//! `MissileError` provides pattern-matchable framework failures instead of
//! generic `anyhow::Error`. `TaskError` is what [`Task::join`] rejects with.
//!
//! # The Error Boundary Rule
//!
//! > **Saga bodies speak `anyhow`; the scheduler speaks `MissileError`.**
//!
//! - `anyhow` is the transport inside sagas (ergonomic `?` on anything)
//! - `MissileError` values are wrapped into `anyhow::Error` when they are
//!   delivered into a saga, and can be recovered with `downcast_ref`
//! - An uncaught saga error is stored on the task as `Arc<anyhow::Error>`
//!   so every observer of the task sees the same failure
//!
//! # Example
//!
//! ```ignore
//! use missile::{MissileError, SagaContext};
//!
//! async fn login(ctx: SagaContext) -> anyhow::Result<serde_json::Value> {
//!     match ctx.fork(worker).await {
//!         Ok(task) => Ok(serde_json::json!(task.id().as_u64())),
//!         Err(e) => match e.downcast_ref::<MissileError>() {
//!             Some(MissileError::TaskLimitExceeded { limit }) => {
//!                 tracing::warn!(limit, "too many sagas, skipping");
//!                 Ok(serde_json::Value::Null)
//!             }
//!             _ => Err(e),
//!         },
//!     }
//! }
//! ```
//!
//! [`Task::join`]: crate::Task::join

use std::any::Any;
use std::sync::Arc;

use thiserror::Error;

use crate::effect::EffectKind;
use crate::task::TaskId;

// =============================================================================
// Missile Error
// =============================================================================

/// Structured error type for scheduler operations.
#[derive(Debug, Clone, Error)]
pub enum MissileError {
    /// An action failed validation at the dispatch boundary.
    #[error("invalid action: {reason}")]
    InvalidAction {
        /// Why the action was rejected.
        reason: &'static str,
    },

    /// Starting another task would exceed `max_concurrent_tasks`.
    #[error("concurrent task limit of {limit} reached")]
    TaskLimitExceeded {
        /// The configured limit.
        limit: usize,
    },

    /// Sagas can only be driven from inside a tokio runtime.
    #[error("no tokio runtime available to drive sagas")]
    NoRuntime,

    /// A pending take was released before any action resolved it.
    ///
    /// Happens when `cancel_all_tasks` clears the pending-take table while a
    /// saga that outlives the teardown is still waiting.
    #[error("pending take of task {task_id} was released before an action arrived")]
    TakeReleased {
        /// The task that was waiting.
        task_id: TaskId,
    },

    /// An effect resolved to a different shape than the caller asked for.
    #[error("{effect} resolved to {found}, expected {expected}")]
    UnexpectedOutcome {
        /// The effect that produced the outcome.
        effect: EffectKind,
        /// The shape the caller expected.
        expected: &'static str,
        /// The shape that was produced.
        found: &'static str,
    },
}

// =============================================================================
// Task Error
// =============================================================================

/// Why a task did not complete.
///
/// Cancellation is not a failure, but it still rejects [`Task::join`]; check
/// [`TaskError::is_cancelled`] to tell the two apart.
///
/// [`Task::join`]: crate::Task::join
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The task (or one of its ancestors) was cancelled.
    #[error("task {0} was cancelled")]
    Cancelled(TaskId),

    /// The saga raised an error it did not handle.
    #[error("task {id} aborted: {error}")]
    Aborted {
        /// The aborted task.
        id: TaskId,
        /// The uncaught error, shared with [`Task::error`](crate::Task::error).
        error: Arc<anyhow::Error>,
    },
}

impl TaskError {
    /// Returns true if the task was cancelled rather than failed.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled(_))
    }

    /// Returns true if the task aborted with an uncaught error.
    pub fn is_aborted(&self) -> bool {
        matches!(self, TaskError::Aborted { .. })
    }

    /// The task this error belongs to.
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskError::Cancelled(id) => *id,
            TaskError::Aborted { id, .. } => *id,
        }
    }
}

/// Extract a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
