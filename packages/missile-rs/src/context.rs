//! The handle a saga body uses to run effects.
//!
//! Every suspension point of a saga is `ctx.run(effect).await`. Errors come
//! back as `Err` and can be handled with ordinary `match` / `?`; an error the
//! saga returns aborts its task.
//!
//! The typed helpers (`take`, `fork`, `race`, ...) build the effect, run it
//! and unwrap the outcome to the shape that effect always produces.
//!
//! ```ignore
//! async fn login_flow(ctx: SagaContext) -> anyhow::Result<Value> {
//!     loop {
//!         let login = ctx.take("auth/LOGIN").await?;
//!         let session = ctx.fork(move |ctx| authorize(ctx, login)).await?;
//!
//!         let next = ctx.take(["auth/LOGOUT", "auth/LOGIN_FAILED"]).await?;
//!         if next.action_type == "auth/LOGOUT" {
//!             ctx.cancel(&session).await?;
//!         }
//!     }
//! }
//! ```

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use indexmap::IndexMap;
use serde_json::Value;

use crate::action::Action;
use crate::channel::Channel;
use crate::effect::{self, Effect, EffectKind, Saga};
use crate::interpreter::interpret;
use crate::outcome::{mismatch, Outcome};
use crate::pattern::Pattern;
use crate::scheduler::Scheduler;
use crate::task::{Task, TaskId};

/// Execution context of one running saga.
#[derive(Clone)]
pub struct SagaContext {
    scheduler: Scheduler,
    task: Task,
}

impl SagaContext {
    pub(crate) fn new(scheduler: Scheduler, task: Task) -> Self {
        Self { scheduler, task }
    }

    /// The task this saga runs in.
    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn task_id(&self) -> TaskId {
        self.task.id()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Interpret an effect and resume with its outcome.
    pub async fn run(&self, effect: Effect) -> Result<Outcome> {
        interpret(self.clone(), effect).await
    }

    /// Register a callback that runs if this task is cancelled or aborted.
    ///
    /// Callbacks run in registration order, after the task's children have
    /// been cancelled.
    pub fn on_cancel<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.task.add_cancel_hook(f);
    }

    // =========================================================================
    // Typed helpers
    // =========================================================================

    pub async fn call<F, Fut>(&self, f: F) -> Result<Value>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        value(self.run(effect::call(f)).await?)
    }

    pub async fn call_sync<F>(&self, f: F) -> Result<Value>
    where
        F: FnOnce() -> Result<Value> + Send + 'static,
    {
        value(self.run(effect::call_sync(f)).await?)
    }

    /// Dispatch an action, resolving with the dispatched action.
    pub async fn put(&self, action: impl Into<Action>) -> Result<Action> {
        match self.run(effect::put(action)).await? {
            Outcome::Action(action) => Ok(action),
            other => Err(mismatch(EffectKind::Put, "action", &other)),
        }
    }

    /// Wait for the next dispatched action matching `pattern`.
    pub async fn take(&self, pattern: impl Into<Pattern>) -> Result<Action> {
        match self.run(effect::take(pattern)).await? {
            Outcome::Action(action) => Ok(action),
            other => Err(mismatch(EffectKind::Take, "action", &other)),
        }
    }

    /// Wait for the next channel message; `None` once the channel is closed.
    pub async fn take_channel(&self, channel: &Channel<Value>) -> Result<Option<Value>> {
        match self.run(effect::take_channel(channel)).await? {
            Outcome::Message(message) => Ok(Some(message)),
            Outcome::Closed => Ok(None),
            other => Err(mismatch(EffectKind::Take, "message", &other)),
        }
    }

    pub async fn delay(&self, duration: Duration) -> Result<()> {
        self.run(effect::delay(duration)).await.map(|_| ())
    }

    pub async fn fork<F, Fut>(&self, f: F) -> Result<Task>
    where
        F: FnOnce(SagaContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.fork_saga(Saga::new(f)).await
    }

    pub async fn fork_saga(&self, saga: Saga) -> Result<Task> {
        task(EffectKind::Fork, self.run(effect::fork_saga(saga)).await?)
    }

    pub async fn spawn<F, Fut>(&self, f: F) -> Result<Task>
    where
        F: FnOnce(SagaContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.spawn_saga(Saga::new(f)).await
    }

    pub async fn spawn_saga(&self, saga: Saga) -> Result<Task> {
        task(EffectKind::Spawn, self.run(effect::spawn_saga(saga)).await?)
    }

    pub async fn cancel(&self, task: &Task) -> Result<()> {
        self.run(effect::cancel(task)).await.map(|_| ())
    }

    pub async fn cancel_tasks(&self, tasks: impl IntoIterator<Item = Task>) -> Result<()> {
        self.run(effect::cancel_tasks(tasks)).await.map(|_| ())
    }

    /// Race keyed effects; the map holds the winning key only.
    pub async fn race<K, I>(&self, arms: I) -> Result<IndexMap<String, Outcome>>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Effect)>,
    {
        match self.run(effect::race(arms)).await? {
            Outcome::Map(map) => Ok(map),
            other => Err(mismatch(EffectKind::Race, "map", &other)),
        }
    }

    /// Run effects concurrently, outcomes in input order.
    pub async fn all(&self, effects: impl IntoIterator<Item = Effect>) -> Result<Vec<Outcome>> {
        match self.run(effect::all(effects)).await? {
            Outcome::List(list) => Ok(list),
            other => Err(mismatch(EffectKind::All, "list", &other)),
        }
    }

    pub async fn all_keyed<K, I>(&self, arms: I) -> Result<IndexMap<String, Outcome>>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Effect)>,
    {
        match self.run(effect::all_keyed(arms)).await? {
            Outcome::Map(map) => Ok(map),
            other => Err(mismatch(EffectKind::All, "map", &other)),
        }
    }

    pub async fn take_every<F, Fut>(&self, pattern: impl Into<Pattern>, worker: F) -> Result<Task>
    where
        F: Fn(SagaContext, Action) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        task(
            EffectKind::TakeEvery,
            self.run(effect::take_every(pattern, worker)).await?,
        )
    }

    pub async fn take_latest<F, Fut>(&self, pattern: impl Into<Pattern>, worker: F) -> Result<Task>
    where
        F: Fn(SagaContext, Action) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        task(
            EffectKind::TakeLatest,
            self.run(effect::take_latest(pattern, worker)).await?,
        )
    }

    pub async fn debounce<F, Fut>(
        &self,
        wait: Duration,
        pattern: impl Into<Pattern>,
        worker: F,
    ) -> Result<Task>
    where
        F: Fn(SagaContext, Action) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        task(
            EffectKind::Debounce,
            self.run(effect::debounce(wait, pattern, worker)).await?,
        )
    }

    pub async fn throttle<F, Fut>(
        &self,
        window: Duration,
        pattern: impl Into<Pattern>,
        worker: F,
    ) -> Result<Task>
    where
        F: Fn(SagaContext, Action) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        task(
            EffectKind::Throttle,
            self.run(effect::throttle(window, pattern, worker)).await?,
        )
    }
}

fn value(outcome: Outcome) -> Result<Value> {
    match outcome {
        Outcome::Value(value) => Ok(value),
        other => Err(mismatch(EffectKind::Call, "value", &other)),
    }
}

fn task(kind: EffectKind, outcome: Outcome) -> Result<Task> {
    match outcome {
        Outcome::Task(task) => Ok(task),
        other => Err(mismatch(kind, "task", &other)),
    }
}

impl std::fmt::Debug for SagaContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaContext")
            .field("task_id", &self.task.id())
            .finish_non_exhaustive()
    }
}
