//! Effect descriptors and the sagas/workers they start.
//!
//! Effects are inert data. Building one does nothing; it acquires meaning
//! only when a saga hands it to [`SagaContext::run`], which interprets it.
//!
//! ```text
//! saga body ── ctx.run(effect) ──► interpreter ── Outcome ──► saga body
//!                                      │
//!                                      ├─ CALL    invoke function
//!                                      ├─ PUT     dispatch action
//!                                      ├─ TAKE    wait for action / channel
//!                                      ├─ DELAY   sleep
//!                                      ├─ FORK    attached child task
//!                                      ├─ SPAWN   detached task
//!                                      ├─ CANCEL  cancel subtrees
//!                                      ├─ RACE    first arm to settle
//!                                      ├─ ALL     every arm
//!                                      └─ TAKE_EVERY / TAKE_LATEST /
//!                                         DEBOUNCE / THROTTLE  watcher tasks
//! ```
//!
//! `Effect` is a closed enum: adding a kind is a compile-time-checked change
//! to the interpreter's exhaustive `match`.
//!
//! [`SagaContext::run`]: crate::SagaContext::run

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;

use crate::action::Action;
use crate::channel::Channel;
use crate::context::SagaContext;
use crate::pattern::Pattern;
use crate::task::Task;

/// Future produced by a running saga body.
pub type SagaFuture = BoxFuture<'static, Result<Value>>;

// =============================================================================
// Saga & Worker
// =============================================================================

/// A resumable routine: an async body driven by the scheduler.
///
/// Extra arguments are captured by the closure:
///
/// ```ignore
/// let user = "ada".to_string();
/// let saga = Saga::new(move |ctx| async move {
///     ctx.put(Action::new("auth/LOGIN").with_payload(user)).await?;
///     Ok(Value::Null)
/// });
/// ```
pub struct Saga {
    name: Option<String>,
    body: Box<dyn FnOnce(SagaContext) -> SagaFuture + Send>,
}

impl Saga {
    /// Wrap an async closure as a saga.
    pub fn new<F, Fut>(body: F) -> Self
    where
        F: FnOnce(SagaContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: None,
            body: Box::new(move |ctx| body(ctx).boxed()),
        }
    }

    /// Give the saga a name, reported on its task and in error hooks.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The saga's name, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn start(self, ctx: SagaContext) -> SagaFuture {
        (self.body)(ctx)
    }
}

impl fmt::Debug for Saga {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Saga")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A reusable saga that receives the action a watcher matched.
///
/// Watchers invoke the worker once per match, passing the action as the last
/// argument.
#[derive(Clone)]
pub struct Worker {
    name: Option<String>,
    body: Arc<dyn Fn(SagaContext, Action) -> SagaFuture + Send + Sync>,
}

impl Worker {
    /// Wrap an async closure as a worker.
    pub fn new<F, Fut>(body: F) -> Self
    where
        F: Fn(SagaContext, Action) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: None,
            body: Arc::new(move |ctx, action| body(ctx, action).boxed()),
        }
    }

    /// Give the worker a name, reported on every task it runs in.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Bind a matched action, producing a one-shot saga.
    pub(crate) fn bind(&self, action: Action) -> Saga {
        let body = self.body.clone();
        Saga {
            name: self.name.clone(),
            body: Box::new(move |ctx| body(ctx, action)),
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A deferred function invocation for the CALL effect.
pub struct Call {
    body: Box<dyn FnOnce() -> BoxFuture<'static, Result<Value>> + Send>,
}

impl Call {
    pub(crate) fn invoke(self) -> BoxFuture<'static, Result<Value>> {
        (self.body)()
    }
}

// =============================================================================
// Effect
// =============================================================================

/// The kind tag of an [`Effect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EffectKind {
    Call,
    Put,
    Take,
    Delay,
    Fork,
    Spawn,
    Cancel,
    Race,
    All,
    TakeEvery,
    TakeLatest,
    Debounce,
    Throttle,
}

impl fmt::Display for EffectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            EffectKind::Call => "CALL",
            EffectKind::Put => "PUT",
            EffectKind::Take => "TAKE",
            EffectKind::Delay => "DELAY",
            EffectKind::Fork => "FORK",
            EffectKind::Spawn => "SPAWN",
            EffectKind::Cancel => "CANCEL",
            EffectKind::Race => "RACE",
            EffectKind::All => "ALL",
            EffectKind::TakeEvery => "TAKE_EVERY",
            EffectKind::TakeLatest => "TAKE_LATEST",
            EffectKind::Debounce => "DEBOUNCE",
            EffectKind::Throttle => "THROTTLE",
        };
        f.write_str(tag)
    }
}

/// Arms of an ALL effect: positional or keyed.
#[derive(Debug)]
pub enum Group {
    List(Vec<Effect>),
    Keyed(Vec<(String, Effect)>),
}

/// A data descriptor of an operation for the scheduler to interpret.
pub enum Effect {
    /// Invoke a function; its result or error flows back into the saga.
    Call(Call),
    /// Dispatch an action; resolves with the action.
    Put(Action),
    /// Wait for the next dispatched action matching the pattern.
    Take(Pattern),
    /// Wait for the next value of a channel (`Closed` once it is closed).
    TakeChannel(Channel<Value>),
    /// Sleep.
    Delay(Duration),
    /// Start an attached child task.
    Fork(Saga),
    /// Start a detached task.
    Spawn(Saga),
    /// Cancel tasks and their subtrees.
    Cancel(Vec<Task>),
    /// First arm to settle wins; the rest are cancelled.
    Race(Vec<(String, Effect)>),
    /// Every arm must succeed; the first failure cancels the rest.
    All(Group),
    /// Fork a worker for every matching action.
    TakeEvery { pattern: Pattern, worker: Worker },
    /// Fork a worker per match, cancelling the previous one.
    TakeLatest { pattern: Pattern, worker: Worker },
    /// Fork a worker once matches stop arriving for `wait`.
    Debounce {
        wait: Duration,
        pattern: Pattern,
        worker: Worker,
    },
    /// Fork a worker on the first match, then ignore matches for `window`.
    Throttle {
        window: Duration,
        pattern: Pattern,
        worker: Worker,
    },
}

impl Effect {
    /// The kind tag of this effect.
    pub fn kind(&self) -> EffectKind {
        match self {
            Effect::Call(_) => EffectKind::Call,
            Effect::Put(_) => EffectKind::Put,
            Effect::Take(_) | Effect::TakeChannel(_) => EffectKind::Take,
            Effect::Delay(_) => EffectKind::Delay,
            Effect::Fork(_) => EffectKind::Fork,
            Effect::Spawn(_) => EffectKind::Spawn,
            Effect::Cancel(_) => EffectKind::Cancel,
            Effect::Race(_) => EffectKind::Race,
            Effect::All(_) => EffectKind::All,
            Effect::TakeEvery { .. } => EffectKind::TakeEvery,
            Effect::TakeLatest { .. } => EffectKind::TakeLatest,
            Effect::Debounce { .. } => EffectKind::Debounce,
            Effect::Throttle { .. } => EffectKind::Throttle,
        }
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::Call(_) => f.write_str("Call(..)"),
            Effect::Put(action) => f.debug_tuple("Put").field(action).finish(),
            Effect::Take(pattern) => f.debug_tuple("Take").field(pattern).finish(),
            Effect::TakeChannel(channel) => f.debug_tuple("TakeChannel").field(channel).finish(),
            Effect::Delay(duration) => f.debug_tuple("Delay").field(duration).finish(),
            Effect::Fork(saga) => f.debug_tuple("Fork").field(saga).finish(),
            Effect::Spawn(saga) => f.debug_tuple("Spawn").field(saga).finish(),
            Effect::Cancel(tasks) => f
                .debug_tuple("Cancel")
                .field(&tasks.iter().map(Task::id).collect::<Vec<_>>())
                .finish(),
            Effect::Race(arms) => f.debug_tuple("Race").field(arms).finish(),
            Effect::All(group) => f.debug_tuple("All").field(group).finish(),
            Effect::TakeEvery { pattern, .. } => {
                f.debug_struct("TakeEvery").field("pattern", pattern).finish_non_exhaustive()
            }
            Effect::TakeLatest { pattern, .. } => {
                f.debug_struct("TakeLatest").field("pattern", pattern).finish_non_exhaustive()
            }
            Effect::Debounce { wait, pattern, .. } => f
                .debug_struct("Debounce")
                .field("wait", wait)
                .field("pattern", pattern)
                .finish_non_exhaustive(),
            Effect::Throttle { window, pattern, .. } => f
                .debug_struct("Throttle")
                .field("window", window)
                .field("pattern", pattern)
                .finish_non_exhaustive(),
        }
    }
}

// =============================================================================
// Effect Creators
// =============================================================================

/// Invoke an async function.
pub fn call<F, Fut>(f: F) -> Effect
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Effect::Call(Call {
        body: Box::new(move || f().boxed()),
    })
}

/// Invoke an async function with an explicit receiver bound as its first
/// argument (the `call([context, fn])` form).
pub fn call_with<C, F, Fut>(context: C, f: F) -> Effect
where
    C: Send + 'static,
    F: FnOnce(C) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    call(move || f(context))
}

/// Invoke a synchronous function.
pub fn call_sync<F>(f: F) -> Effect
where
    F: FnOnce() -> Result<Value> + Send + 'static,
{
    Effect::Call(Call {
        body: Box::new(move || async move { f() }.boxed()),
    })
}

/// Dispatch an action.
pub fn put(action: impl Into<Action>) -> Effect {
    Effect::Put(action.into())
}

/// Wait for a matching action.
pub fn take(pattern: impl Into<Pattern>) -> Effect {
    Effect::Take(pattern.into())
}

/// Wait for the next value of a channel.
pub fn take_channel(channel: &Channel<Value>) -> Effect {
    Effect::TakeChannel(channel.clone())
}

/// Sleep for `duration`.
pub fn delay(duration: Duration) -> Effect {
    Effect::Delay(duration)
}

/// Sleep for `ms` milliseconds.
pub fn delay_ms(ms: u64) -> Effect {
    Effect::Delay(Duration::from_millis(ms))
}

/// Start an attached child task running `f`.
pub fn fork<F, Fut>(f: F) -> Effect
where
    F: FnOnce(SagaContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Effect::Fork(Saga::new(f))
}

/// Start an attached child task running an existing saga.
pub fn fork_saga(saga: Saga) -> Effect {
    Effect::Fork(saga)
}

/// Start a detached task running `f`.
pub fn spawn<F, Fut>(f: F) -> Effect
where
    F: FnOnce(SagaContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Effect::Spawn(Saga::new(f))
}

/// Start a detached task running an existing saga.
pub fn spawn_saga(saga: Saga) -> Effect {
    Effect::Spawn(saga)
}

/// Cancel a task and its subtree.
pub fn cancel(task: &Task) -> Effect {
    Effect::Cancel(vec![task.clone()])
}

/// Cancel several tasks and their subtrees.
pub fn cancel_tasks(tasks: impl IntoIterator<Item = Task>) -> Effect {
    Effect::Cancel(tasks.into_iter().collect())
}

/// Race keyed effects against each other.
pub fn race<K, I>(arms: I) -> Effect
where
    K: Into<String>,
    I: IntoIterator<Item = (K, Effect)>,
{
    Effect::Race(arms.into_iter().map(|(k, e)| (k.into(), e)).collect())
}

/// Run effects concurrently, resolving to their outcomes in order.
pub fn all(effects: impl IntoIterator<Item = Effect>) -> Effect {
    Effect::All(Group::List(effects.into_iter().collect()))
}

/// Run keyed effects concurrently, resolving to a keyed map of outcomes.
pub fn all_keyed<K, I>(arms: I) -> Effect
where
    K: Into<String>,
    I: IntoIterator<Item = (K, Effect)>,
{
    Effect::All(Group::Keyed(
        arms.into_iter().map(|(k, e)| (k.into(), e)).collect(),
    ))
}

/// Fork `worker` for every action matching `pattern`.
pub fn take_every<F, Fut>(pattern: impl Into<Pattern>, worker: F) -> Effect
where
    F: Fn(SagaContext, Action) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Effect::TakeEvery {
        pattern: pattern.into(),
        worker: Worker::new(worker),
    }
}

/// Fork `worker` for each match, cancelling the previous worker if running.
pub fn take_latest<F, Fut>(pattern: impl Into<Pattern>, worker: F) -> Effect
where
    F: Fn(SagaContext, Action) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Effect::TakeLatest {
        pattern: pattern.into(),
        worker: Worker::new(worker),
    }
}

/// Fork `worker` with the last action of a burst once `wait` passes quietly.
pub fn debounce<F, Fut>(wait: Duration, pattern: impl Into<Pattern>, worker: F) -> Effect
where
    F: Fn(SagaContext, Action) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Effect::Debounce {
        wait,
        pattern: pattern.into(),
        worker: Worker::new(worker),
    }
}

/// Fork `worker` on the first match, ignoring matches for `window`.
pub fn throttle<F, Fut>(window: Duration, pattern: impl Into<Pattern>, worker: F) -> Effect
where
    F: Fn(SagaContext, Action) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Effect::Throttle {
        window,
        pattern: pattern.into(),
        worker: Worker::new(worker),
    }
}
