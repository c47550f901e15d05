//! Task handles and the ownership tree.
//!
//! A [`Task`] is a handle over one running saga instance. Handles are cheap
//! to clone and never expose the task's internals for mutation: callers can
//! inspect status, await completion and cancel.
//!
//! # Lifecycle
//!
//! ```text
//!            ┌──────────► completed   (body returned, attached children settled)
//! running ───┼──────────► cancelled   (cancel() on it or an ancestor)
//!            └──────────► aborted     (uncaught error, own or from a forked child)
//! ```
//!
//! Transitions happen exactly once. Settling a task as cancelled or aborted
//! runs, in order:
//!
//! 1. cancel every attached child (ascending id, depth-first); the task
//!    still reports `Running` to its children's hooks
//! 2. publish the terminal status
//! 3. run cancel hooks in registration order (panics logged, not propagated)
//! 4. abort the tokio task driving the saga, dropping its future
//! 5. detach from the parent and the scheduler's task table
//! 6. wake everyone awaiting [`Task::join`]

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::{panic_message, TaskError};
use crate::scheduler::Shared;
use crate::sync::lock;

// =============================================================================
// Identity & Status
// =============================================================================

/// Unique, monotonic task identifier. The first task of a scheduler is `1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(u64);

impl TaskId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for TaskId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a task is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Cancelled,
    Aborted,
}

impl TaskStatus {
    /// Returns true for every status except `Running`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

/// How a task ended.
#[derive(Debug, Clone)]
pub(crate) enum Settlement {
    Completed(Value),
    Cancelled,
    Aborted(Arc<anyhow::Error>),
}

impl Settlement {
    fn status(&self) -> TaskStatus {
        match self {
            Settlement::Completed(_) => TaskStatus::Completed,
            Settlement::Cancelled => TaskStatus::Cancelled,
            Settlement::Aborted(_) => TaskStatus::Aborted,
        }
    }
}

/// Serialisable snapshot of a task, for logs and inspection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: Option<String>,
    pub status: TaskStatus,
    pub parent_id: Option<TaskId>,
    pub spawned_by: Option<TaskId>,
    pub children: Vec<TaskId>,
    pub started_at: DateTime<Utc>,
    pub error: Option<String>,
}

// =============================================================================
// Task Core
// =============================================================================

type CancelHook = Box<dyn FnOnce() + Send>;

struct TaskState {
    status: TaskStatus,
    settlement: Option<Settlement>,
    children: BTreeMap<TaskId, Task>,
    hooks: BTreeMap<u64, CancelHook>,
    abort: Option<AbortHandle>,
    /// Claimed by the one `settle` call that wins; status follows once the
    /// children are done.
    settling: bool,
}

pub(crate) struct TaskCore {
    id: TaskId,
    name: Option<String>,
    parent: Option<Weak<TaskCore>>,
    parent_id: Option<TaskId>,
    spawned_by: Option<TaskId>,
    started_at: DateTime<Utc>,
    next_hook: AtomicU64,
    state: Mutex<TaskState>,
    settled: watch::Sender<TaskStatus>,
    scheduler: Weak<Shared>,
}

/// Handle over one running saga instance.
#[derive(Clone)]
pub struct Task(Arc<TaskCore>);

impl Task {
    pub(crate) fn new(
        id: TaskId,
        name: Option<String>,
        parent: Option<&Task>,
        spawned_by: Option<TaskId>,
        scheduler: Weak<Shared>,
    ) -> Self {
        let (settled, _) = watch::channel(TaskStatus::Running);
        Self(Arc::new(TaskCore {
            id,
            name,
            parent: parent.map(|p| Arc::downgrade(&p.0)),
            parent_id: parent.map(Task::id),
            spawned_by,
            started_at: Utc::now(),
            next_hook: AtomicU64::new(0),
            state: Mutex::new(TaskState {
                status: TaskStatus::Running,
                settlement: None,
                children: BTreeMap::new(),
                hooks: BTreeMap::new(),
                abort: None,
                settling: false,
            }),
            settled,
            scheduler,
        }))
    }

    pub fn id(&self) -> TaskId {
        self.0.id
    }

    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    /// The task this one was forked from. `None` for roots and spawned tasks.
    pub fn parent_id(&self) -> Option<TaskId> {
        self.0.parent_id
    }

    /// The task that spawned this one, kept for attribution only.
    pub fn spawned_by(&self) -> Option<TaskId> {
        self.0.spawned_by
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.0.started_at
    }

    pub fn status(&self) -> TaskStatus {
        lock(&self.0.state).status
    }

    pub fn is_running(&self) -> bool {
        self.status() == TaskStatus::Running
    }

    pub fn is_completed(&self) -> bool {
        self.status() == TaskStatus::Completed
    }

    pub fn is_cancelled(&self) -> bool {
        self.status() == TaskStatus::Cancelled
    }

    pub fn is_aborted(&self) -> bool {
        self.status() == TaskStatus::Aborted
    }

    /// The saga's return value, once completed.
    pub fn result(&self) -> Option<Value> {
        match &lock(&self.0.state).settlement {
            Some(Settlement::Completed(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// The uncaught error, once aborted.
    pub fn error(&self) -> Option<Arc<anyhow::Error>> {
        match &lock(&self.0.state).settlement {
            Some(Settlement::Aborted(error)) => Some(error.clone()),
            _ => None,
        }
    }

    /// Ids of the attached children that are still running.
    pub fn children(&self) -> Vec<TaskId> {
        lock(&self.0.state).children.keys().copied().collect()
    }

    pub fn info(&self) -> TaskInfo {
        let state = lock(&self.0.state);
        TaskInfo {
            id: self.0.id,
            name: self.0.name.clone(),
            status: state.status,
            parent_id: self.0.parent_id,
            spawned_by: self.0.spawned_by,
            children: state.children.keys().copied().collect(),
            started_at: self.0.started_at,
            error: match &state.settlement {
                Some(Settlement::Aborted(error)) => Some(error.to_string()),
                _ => None,
            },
        }
    }

    /// Wait for the task to settle.
    ///
    /// Resolves with the saga's return value, or rejects with
    /// [`TaskError::Cancelled`] / [`TaskError::Aborted`].
    pub async fn join(&self) -> Result<Value, TaskError> {
        let mut settled = self.0.settled.subscribe();
        // The sender lives as long as `self`, so this only returns once terminal
        let _ = settled.wait_for(TaskStatus::is_terminal).await;
        self.outcome()
    }

    /// Cancel this task and its attached subtree. No-op once terminal.
    pub fn cancel(&self) {
        self.settle(Settlement::Cancelled);
    }

    fn outcome(&self) -> Result<Value, TaskError> {
        match &lock(&self.0.state).settlement {
            Some(Settlement::Completed(value)) => Ok(value.clone()),
            Some(Settlement::Aborted(error)) => Err(TaskError::Aborted {
                id: self.0.id,
                error: error.clone(),
            }),
            Some(Settlement::Cancelled) | None => Err(TaskError::Cancelled(self.0.id)),
        }
    }

    // =========================================================================
    // Scheduler-internal operations
    // =========================================================================

    /// Move the task to a terminal status. Returns false if it already was.
    pub(crate) fn settle(&self, settlement: Settlement) -> bool {
        let status = settlement.status();
        let propagate = match &settlement {
            Settlement::Aborted(error) => Some(error.clone()),
            _ => None,
        };

        let children = {
            let mut state = lock(&self.0.state);
            if state.settling || state.status.is_terminal() {
                return false;
            }
            state.settling = true;
            std::mem::take(&mut state.children)
        };

        // Children settle while this task still reads as running
        if status != TaskStatus::Completed {
            for child in children.into_values() {
                child.cancel();
            }
        }

        let (hooks, abort) = {
            let mut state = lock(&self.0.state);
            state.status = status;
            state.settlement = Some(settlement);
            (std::mem::take(&mut state.hooks), state.abort.take())
        };

        if status != TaskStatus::Completed {
            for (_, hook) in hooks {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(hook)) {
                    warn!(
                        task_id = %self.0.id,
                        panic = %panic_message(panic.as_ref()),
                        "cancel hook panicked"
                    );
                }
            }
            if let Some(abort) = abort {
                abort.abort();
            }
        }

        let parent = self.parent();
        if let Some(parent) = &parent {
            parent.forget_child(self.0.id);
        }
        if let Some(shared) = self.0.scheduler.upgrade() {
            shared.forget_task(self.0.id);
        }
        self.0.settled.send_replace(status);

        debug!(task_id = %self.0.id, name = ?self.0.name, ?status, "task settled");

        // An uncaught error in an attached child aborts its parent
        if let (Some(error), Some(parent)) = (propagate, parent) {
            parent.settle(Settlement::Aborted(error));
        }
        true
    }

    /// Link a freshly started child. Returns false if this task is no longer
    /// running, in which case the child must be cancelled by the caller.
    pub(crate) fn adopt(&self, child: &Task) -> bool {
        let mut state = lock(&self.0.state);
        if state.settling || state.status.is_terminal() {
            return false;
        }
        state.children.insert(child.id(), child.clone());
        true
    }

    fn forget_child(&self, id: TaskId) {
        lock(&self.0.state).children.remove(&id);
    }

    /// Clones of the attached children still running.
    pub(crate) fn running_children(&self) -> Vec<Task> {
        lock(&self.0.state).children.values().cloned().collect()
    }

    pub(crate) fn parent(&self) -> Option<Task> {
        self.0.parent.as_ref().and_then(Weak::upgrade).map(Task)
    }

    /// Register a hook that runs if the task is cancelled or aborted.
    ///
    /// Runs the hook immediately when the task is already terminal. The hook
    /// is removed again when the returned guard drops.
    pub(crate) fn register_cancel_hook<F>(&self, hook: F) -> CancelHookGuard
    where
        F: FnOnce() + Send + 'static,
    {
        let key = self.add_cancel_hook(hook);
        CancelHookGuard {
            task: Arc::downgrade(&self.0),
            key,
        }
    }

    /// Register a hook that stays until the task settles.
    pub(crate) fn add_cancel_hook<F>(&self, hook: F) -> Option<u64>
    where
        F: FnOnce() + Send + 'static,
    {
        let key = self.0.next_hook.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = lock(&self.0.state);
            if !state.status.is_terminal() {
                state.hooks.insert(key, Box::new(hook));
                return Some(key);
            }
        }
        if self.status() != TaskStatus::Completed {
            hook();
        }
        None
    }

    /// Record how to stop the tokio task. Aborts at once if already settled.
    pub(crate) fn set_abort_handle(&self, handle: AbortHandle) {
        let mut state = lock(&self.0.state);
        if state.status.is_terminal() {
            drop(state);
            handle.abort();
            return;
        }
        state.abort = Some(handle);
    }
}

/// Removes a cancel hook when the operation it guarded finishes normally.
pub(crate) struct CancelHookGuard {
    task: Weak<TaskCore>,
    key: Option<u64>,
}

impl Drop for CancelHookGuard {
    fn drop(&mut self) {
        if let (Some(core), Some(key)) = (self.task.upgrade(), self.key) {
            lock(&core.state).hooks.remove(&key);
        }
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Task {}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .field("status", &self.status())
            .finish()
    }
}
