//! The scheduler: dispatcher, task table and saga driver.
//!
//! A [`Scheduler`] owns every piece of process-scoped state the saga runtime
//! needs. Nothing is global: tests create one scheduler per case and tear it
//! down with [`Scheduler::cancel_all_tasks`].
//!
//! # State
//!
//! | Table            | Contents                                           |
//! |------------------|----------------------------------------------------|
//! | tasks            | every live (running) task, by id                   |
//! | pending takes    | sagas suspended on `take(pattern)` plus watchers   |
//! | subscribers      | plain callbacks notified on every dispatch         |
//! | registry         | named sagas, at most one running task per name     |
//!
//! # Dispatch
//!
//! ```text
//! dispatch(action)
//!     │ validate (blank type → MissileError::InvalidAction)
//!     ├─► subscribers, in subscription order (failures logged, not returned)
//!     └─► pending takes: every match is resolved and removed (broadcast)
//! ```
//!
//! `dispatch` never awaits. Sagas whose takes were resolved resume on their
//! own tokio tasks afterwards.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use dashmap::DashMap;
use futures::FutureExt;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::action::Action;
use crate::channel::Channel;
use crate::config::{ErrorContext, SchedulerConfig};
use crate::context::SagaContext;
use crate::effect::Saga;
use crate::error::{panic_message, MissileError};
use crate::pattern::Pattern;
use crate::sync::{lock, read, write};
use crate::task::{Settlement, Task, TaskId};

type Subscriber = Arc<dyn Fn(&Action) -> anyhow::Result<()> + Send + Sync>;

// =============================================================================
// Pending Takes
// =============================================================================

/// Where a matched action goes.
enum TakeSink {
    /// A single `take`: resolved once, then removed.
    Once(oneshot::Sender<Action>),
    /// A watcher: every match is queued, the entry stays until released.
    Stream(Channel<Action>),
}

struct PendingTake {
    id: u64,
    task_id: TaskId,
    pattern: Pattern,
    sink: TakeSink,
}

// =============================================================================
// Shared State
// =============================================================================

pub(crate) struct Shared {
    config: RwLock<SchedulerConfig>,
    next_task_id: AtomicU64,
    next_take_id: AtomicU64,
    next_subscriber_id: AtomicU64,
    tasks: DashMap<TaskId, Task>,
    /// Slots held by live tasks; reserved before a task enters `tasks`.
    live: AtomicUsize,
    takes: Mutex<Vec<PendingTake>>,
    subscribers: Mutex<Vec<(u64, Subscriber)>>,
    pub(crate) registry: Mutex<HashMap<String, Task>>,
}

impl Shared {
    pub(crate) fn forget_task(&self, id: TaskId) {
        if self.tasks.remove(&id).is_some() {
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Claim a task slot, failing once `limit` tasks are live.
    fn reserve_slot(&self, limit: Option<usize>) -> bool {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| match limit {
                Some(limit) if live >= limit => None,
                _ => Some(live + 1),
            })
            .is_ok()
    }

    /// Register a one-shot take for `task_id`.
    pub(crate) fn register_take(
        &self,
        task_id: TaskId,
        pattern: Pattern,
    ) -> (u64, oneshot::Receiver<Action>) {
        let (sender, receiver) = oneshot::channel();
        let id = self.push_take(task_id, pattern, TakeSink::Once(sender));
        (id, receiver)
    }

    /// Register a standing take that queues every match into a channel.
    pub(crate) fn register_stream(&self, task_id: TaskId, pattern: Pattern) -> (u64, Channel<Action>) {
        let stream = Channel::new();
        let id = self.push_take(task_id, pattern, TakeSink::Stream(stream.clone()));
        (id, stream)
    }

    fn push_take(&self, task_id: TaskId, pattern: Pattern, sink: TakeSink) -> u64 {
        let id = self.next_take_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.takes).push(PendingTake {
            id,
            task_id,
            pattern,
            sink,
        });
        id
    }

    /// Remove a pending take. Returns false if it was already resolved or
    /// released.
    pub(crate) fn release_take(&self, id: u64) -> bool {
        let released = {
            let mut takes = lock(&self.takes);
            takes
                .iter()
                .position(|take| take.id == id)
                .map(|index| takes.remove(index))
        };
        match released {
            Some(take) => {
                if let TakeSink::Stream(stream) = take.sink {
                    stream.close();
                }
                true
            }
            None => false,
        }
    }
}

/// Releases a pending take when the awaiting future is dropped.
pub(crate) struct TakeRegistration {
    shared: Weak<Shared>,
    id: u64,
}

impl TakeRegistration {
    pub(crate) fn new(shared: Weak<Shared>, id: u64) -> Self {
        Self { shared, id }
    }
}

impl Drop for TakeRegistration {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.release_take(self.id);
        }
    }
}

/// Where a new task hangs in the ownership tree.
pub(crate) enum Placement {
    /// Started by `run_saga` or the registry.
    Root,
    /// Forked: linked into the parent's children.
    Attached(Task),
    /// Spawned: no parent link, attribution only.
    Detached { spawned_by: TaskId },
}

// =============================================================================
// Scheduler
// =============================================================================

/// Dispatches actions and drives sagas.
///
/// Cheap to clone; clones share all state.
///
/// ```ignore
/// let scheduler = Scheduler::new();
///
/// let task = scheduler.run_saga(|ctx| async move {
///     let action = ctx.take("auth/LOGIN").await?;
///     ctx.put(Action::new("auth/LOGGED_IN").with_payload(action.payload_or_null())).await?;
///     Ok(Value::Null)
/// })?;
///
/// scheduler.dispatch(Action::new("auth/LOGIN").with_payload("ada"))?;
/// task.join().await?;
/// ```
#[derive(Clone)]
pub struct Scheduler {
    pub(crate) shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config: RwLock::new(config),
                next_task_id: AtomicU64::new(1),
                next_take_id: AtomicU64::new(0),
                next_subscriber_id: AtomicU64::new(0),
                tasks: DashMap::new(),
                live: AtomicUsize::new(0),
                takes: Mutex::new(Vec::new()),
                subscribers: Mutex::new(Vec::new()),
                registry: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Replace the active configuration.
    pub fn configure(&self, config: SchedulerConfig) {
        *write(&self.shared.config) = config;
    }

    pub fn config(&self) -> SchedulerConfig {
        read(&self.shared.config).clone()
    }

    pub(crate) fn is_debug(&self) -> bool {
        read(&self.shared.config).debug
    }

    // =========================================================================
    // Running sagas
    // =========================================================================

    /// Start a saga as a root task.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn run_saga<F, Fut>(&self, f: F) -> Result<Task, MissileError>
    where
        F: FnOnce(SagaContext) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.run(Saga::new(f))
    }

    /// Start an existing [`Saga`] as a root task.
    pub fn run(&self, saga: Saga) -> Result<Task, MissileError> {
        let task = self.start(saga, Placement::Root)?;
        info!(task_id = %task.id(), name = ?task.name(), "saga started");
        Ok(task)
    }

    /// Cancel a task and its subtree.
    pub fn cancel_saga(&self, task: &Task) {
        task.cancel();
    }

    pub(crate) fn start(&self, saga: Saga, placement: Placement) -> Result<Task, MissileError> {
        let runtime = Handle::try_current().map_err(|_| MissileError::NoRuntime)?;

        let limit = read(&self.shared.config).max_concurrent_tasks;
        if !self.shared.reserve_slot(limit) {
            let limit = limit.unwrap_or_default();
            warn!(limit, "refusing to start saga, task limit reached");
            return Err(MissileError::TaskLimitExceeded { limit });
        }

        let id = TaskId::from(self.shared.next_task_id.fetch_add(1, Ordering::Relaxed));
        let name = saga.name().map(str::to_string);
        let weak = Arc::downgrade(&self.shared);
        let task = match &placement {
            Placement::Root => Task::new(id, name, None, None, weak),
            Placement::Attached(parent) => Task::new(id, name, Some(parent), None, weak),
            Placement::Detached { spawned_by } => Task::new(id, name, None, Some(*spawned_by), weak),
        };
        self.shared.tasks.insert(id, task.clone());

        if let Placement::Attached(parent) = &placement {
            if !parent.adopt(&task) {
                // Forked from a parent that settled in the meantime
                task.cancel();
                return Ok(task);
            }
        }

        let handle = runtime.spawn(drive(self.clone(), task.clone(), saga));
        task.set_abort_handle(handle.abort_handle());

        debug!(task_id = %id, parent_id = ?task.parent_id(), spawned_by = ?task.spawned_by(), "task started");
        Ok(task)
    }

    fn report_uncaught(&self, task: &Task, error: &anyhow::Error) {
        let config = self.config();
        match &config.on_error {
            Some(hook) => {
                let context = ErrorContext {
                    task_id: task.id(),
                    name: task.name().map(str::to_string),
                };
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| hook(error, &context))) {
                    warn!(
                        task_id = %task.id(),
                        panic = %panic_message(panic.as_ref()),
                        "error hook panicked"
                    );
                }
            }
            None if config.debug => {
                error!(task_id = %task.id(), name = ?task.name(), error = %error, "uncaught saga error");
            }
            None => {
                debug!(task_id = %task.id(), error = %error, "saga aborted");
            }
        }
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Dispatch an action to subscribers and pending takes.
    ///
    /// Fails only when the action is invalid.
    pub fn dispatch(&self, action: impl Into<Action>) -> Result<(), MissileError> {
        let action = action.into();
        action.validate()?;

        if self.is_debug() {
            debug!(action_type = %action.action_type, payload = ?action.payload, "dispatch");
        }

        self.notify_subscribers(&action);
        self.resolve_takes(&action);
        Ok(())
    }

    fn notify_subscribers(&self, action: &Action) {
        let subscribers: Vec<(u64, Subscriber)> = lock(&self.shared.subscribers).clone();

        for (id, subscriber) in subscribers {
            match catch_unwind(AssertUnwindSafe(|| subscriber(action))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        subscriber_id = id,
                        action_type = %action.action_type,
                        error = %e,
                        "subscriber failed"
                    );
                }
                Err(panic) => {
                    warn!(
                        subscriber_id = id,
                        action_type = %action.action_type,
                        panic = %panic_message(panic.as_ref()),
                        "subscriber panicked"
                    );
                }
            }
        }
    }

    fn resolve_takes(&self, action: &Action) {
        // Match outside the lock: predicates are user code
        let candidates: Vec<(u64, Pattern)> = lock(&self.shared.takes)
            .iter()
            .map(|take| (take.id, take.pattern.clone()))
            .collect();

        let matched: HashSet<u64> = candidates
            .into_iter()
            .filter(|(id, pattern)| {
                match catch_unwind(AssertUnwindSafe(|| pattern.matches(action))) {
                    Ok(matched) => matched,
                    Err(panic) => {
                        warn!(
                            take_id = *id,
                            action_type = %action.action_type,
                            panic = %panic_message(panic.as_ref()),
                            "take predicate panicked, treating as no match"
                        );
                        false
                    }
                }
            })
            .map(|(id, _)| id)
            .collect();
        if matched.is_empty() {
            return;
        }

        let mut resolved = Vec::new();
        let mut streams = Vec::new();
        {
            let mut takes = lock(&self.shared.takes);
            let mut kept = Vec::with_capacity(takes.len());
            for take in takes.drain(..) {
                if !matched.contains(&take.id) {
                    kept.push(take);
                    continue;
                }
                match &take.sink {
                    TakeSink::Stream(stream) => {
                        streams.push(stream.clone());
                        kept.push(take);
                    }
                    TakeSink::Once(_) => resolved.push(take),
                }
            }
            *takes = kept;
        }

        for take in resolved {
            if let TakeSink::Once(sender) = take.sink {
                if sender.send(action.clone()).is_err() {
                    debug!(task_id = %take.task_id, "take resolved after its saga went away");
                }
            }
        }
        for stream in streams {
            stream.put(action.clone());
        }
    }

    /// Register a plain callback invoked synchronously on every dispatch.
    ///
    /// Errors and panics inside the callback are logged and never reach the
    /// caller of `dispatch`.
    pub fn subscribe<F>(&self, f: F) -> Subscription
    where
        F: Fn(&Action) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.shared.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.subscribers).push((id, Arc::new(f)));
        Subscription {
            shared: Arc::downgrade(&self.shared),
            id,
        }
    }

    // =========================================================================
    // Inspection & teardown
    // =========================================================================

    /// Every live task, ordered by id.
    pub fn running_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .shared
            .tasks
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        tasks.sort_by_key(Task::id);
        tasks
    }

    /// Look up a live task.
    pub fn task(&self, id: TaskId) -> Option<Task> {
        self.shared.tasks.get(&id).map(|entry| entry.value().clone())
    }

    /// Number of pending takes, watcher streams included.
    pub fn pending_take_count(&self) -> usize {
        lock(&self.shared.takes).len()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.shared.subscribers).len()
    }

    /// Cancel every live task and clear the registry and pending takes.
    pub fn cancel_all_tasks(&self) {
        let tasks = self.running_tasks();
        let count = tasks.len();
        for task in tasks {
            task.cancel();
        }

        lock(&self.shared.registry).clear();

        let takes = std::mem::take(&mut *lock(&self.shared.takes));
        for take in takes {
            if let TakeSink::Stream(stream) = take.sink {
                stream.close();
            }
        }

        info!(cancelled = count, "all tasks cancelled");
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("tasks", &self.shared.tasks.len())
            .field("pending_takes", &self.pending_take_count())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Handle returned by [`Scheduler::subscribe`].
///
/// Dropping it keeps the subscription; call [`Subscription::unsubscribe`] to
/// remove the callback.
#[derive(Debug)]
pub struct Subscription {
    shared: Weak<Shared>,
    id: u64,
}

impl Subscription {
    /// Remove the callback. Returns false if the scheduler is gone.
    pub fn unsubscribe(self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let mut subscribers = lock(&shared.subscribers);
        let before = subscribers.len();
        subscribers.retain(|(id, _)| *id != self.id);
        subscribers.len() != before
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Run a saga body to completion on its own tokio task.
async fn drive(scheduler: Scheduler, task: Task, saga: Saga) {
    if !task.is_running() {
        return;
    }

    let ctx = SagaContext::new(scheduler.clone(), task.clone());
    let result = match AssertUnwindSafe(saga.start(ctx)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!(
            "saga panicked: {}",
            panic_message(panic.as_ref())
        )),
    };

    match result {
        Ok(value) => {
            // A returned body stays running until its attached forks settle
            loop {
                let children = task.running_children();
                if children.is_empty() {
                    break;
                }
                for child in children {
                    let _ = child.join().await;
                }
            }
            task.settle(Settlement::Completed(value));
        }
        Err(error) => {
            let error = Arc::new(error);
            if task.settle(Settlement::Aborted(error.clone())) {
                scheduler.report_uncaught(&task, &error);
            }
        }
    }
}
