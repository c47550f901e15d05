//! Watcher loops behind `take_every`, `take_latest`, `debounce` and
//! `throttle`.
//!
//! Each watcher runs as its own task, forked from the saga that started it.
//! Instead of re-registering a one-shot take after every match, a watcher
//! holds a standing take whose matches queue up in a channel, so actions
//! dispatched back-to-back are never lost between iterations. Workers are
//! forked as children of the watcher task: cancelling the watcher (or any
//! ancestor) cancels every running worker.
//!
//! | Watcher      | On match                                                 |
//! |--------------|----------------------------------------------------------|
//! | take_every   | fork a worker                                            |
//! | take_latest  | cancel the previous worker if still running, then fork   |
//! | debounce     | restart the quiet timer; fork with the last action once  |
//! |              | the timer fires without an intervening match             |
//! | throttle     | fork, then drop every match until the window has passed  |

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tracing::{trace, warn};

use crate::action::Action;
use crate::context::SagaContext;
use crate::effect::{Saga, Worker};
use crate::outcome::Outcome;
use crate::pattern::Pattern;
use crate::scheduler::{Placement, TakeRegistration};
use crate::task::Task;

pub(crate) enum Watcher {
    Every {
        pattern: Pattern,
        worker: Worker,
    },
    Latest {
        pattern: Pattern,
        worker: Worker,
    },
    Debounce {
        wait: Duration,
        pattern: Pattern,
        worker: Worker,
    },
    Throttle {
        window: Duration,
        pattern: Pattern,
        worker: Worker,
    },
}

impl Watcher {
    fn label(&self) -> &'static str {
        match self {
            Watcher::Every { .. } => "take_every",
            Watcher::Latest { .. } => "take_latest",
            Watcher::Debounce { .. } => "debounce",
            Watcher::Throttle { .. } => "throttle",
        }
    }

    fn pattern(&self) -> &Pattern {
        match self {
            Watcher::Every { pattern, .. }
            | Watcher::Latest { pattern, .. }
            | Watcher::Debounce { pattern, .. }
            | Watcher::Throttle { pattern, .. } => pattern,
        }
    }
}

/// Fork the watcher task, resolving with its handle.
pub(crate) fn start(ctx: SagaContext, watcher: Watcher) -> BoxFuture<'static, Result<Outcome>> {
    async move {
        let name = format!("{}({})", watcher.label(), watcher.pattern());
        let saga = Saga::new(move |ctx| watch(ctx, watcher)).named(name);
        let parent = ctx.task().clone();
        let task = ctx.scheduler().start(saga, Placement::Attached(parent))?;
        Ok(Outcome::Task(task))
    }
    .boxed()
}

async fn watch(ctx: SagaContext, watcher: Watcher) -> Result<Value> {
    let shared = ctx.scheduler().shared.clone();
    let (id, stream) = shared.register_stream(ctx.task_id(), watcher.pattern().clone());
    let _registration = TakeRegistration::new(Arc::downgrade(&shared), id);
    {
        let shared = Arc::downgrade(&shared);
        ctx.on_cancel(move || {
            if let Some(shared) = shared.upgrade() {
                shared.release_take(id);
            }
        });
    }

    match watcher {
        Watcher::Every { worker, .. } => {
            while let Some(action) = stream.take().await {
                fork_worker(&ctx, &worker, action);
            }
        }

        Watcher::Latest { worker, .. } => {
            let mut latest: Option<Task> = None;
            while let Some(action) = stream.take().await {
                if let Some(previous) = latest.take() {
                    previous.cancel();
                }
                latest = fork_worker(&ctx, &worker, action);
            }
        }

        Watcher::Debounce { wait, worker, .. } => {
            'burst: while let Some(mut action) = stream.take().await {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {
                            fork_worker(&ctx, &worker, action);
                            continue 'burst;
                        }
                        next = stream.take() => match next {
                            Some(next) => action = next,
                            None => break 'burst,
                        },
                    }
                }
            }
        }

        Watcher::Throttle { window, worker, .. } => {
            while let Some(action) = stream.take().await {
                fork_worker(&ctx, &worker, action);
                tokio::time::sleep(window).await;
                let ignored = stream.flush();
                if !ignored.is_empty() {
                    trace!(task_id = %ctx.task_id(), ignored = ignored.len(), "throttled actions dropped");
                }
            }
        }
    }

    Ok(Value::Null)
}

/// Fork one worker run. A worker that cannot be started is skipped.
fn fork_worker(ctx: &SagaContext, worker: &Worker, action: Action) -> Option<Task> {
    let action_type = action.action_type.clone();
    match ctx
        .scheduler()
        .start(worker.bind(action), Placement::Attached(ctx.task().clone()))
    {
        Ok(task) => Some(task),
        Err(e) => {
            warn!(
                task_id = %ctx.task_id(),
                action_type = %action_type,
                error = %e,
                "could not start worker, skipping action"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::context::SagaContext;
    use crate::scheduler::Scheduler;
    use crate::task::Task;
    use crate::Action;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<Value>>>;

    async fn wait_for_takes(scheduler: &Scheduler, count: usize) {
        while scheduler.pending_take_count() < count {
            tokio::task::yield_now().await;
        }
    }

    fn search(n: u64) -> Action {
        Action::new("search/QUERY").with_payload(n)
    }

    /// Worker that records its payload after a short delay.
    fn slow_recorder(
        log: &Log,
    ) -> impl Fn(SagaContext, Action) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync + 'static
    {
        let log = log.clone();
        move |ctx: SagaContext, action: Action| {
            let log = log.clone();
            async move {
                ctx.delay(Duration::from_millis(100)).await?;
                log.lock().unwrap().push(action.payload_or_null());
                Ok::<_, anyhow::Error>(Value::Null)
            }
            .boxed()
        }
    }

    fn sorted(log: &Log) -> Vec<Value> {
        let mut values = log.lock().unwrap().clone();
        values.sort_by_key(|v| v.as_u64());
        values
    }

    async fn settle_time() {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_every_runs_all_workers() {
        let scheduler = Scheduler::new();
        let log: Log = Arc::default();
        let worker = slow_recorder(&log);

        let root = scheduler
            .run_saga(|ctx| async move {
                ctx.take_every("search/*", worker).await?;
                Ok(Value::Null)
            })
            .unwrap();

        wait_for_takes(&scheduler, 1).await;
        for n in 1..=3 {
            scheduler.dispatch(search(n)).unwrap();
        }
        settle_time().await;

        assert_eq!(sorted(&log), vec![json!(1), json!(2), json!(3)]);
        assert!(root.is_running(), "watcher keeps its parent alive");
        scheduler.cancel_all_tasks();
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_latest_keeps_one_worker() {
        let scheduler = Scheduler::new();
        let log: Log = Arc::default();
        let worker = slow_recorder(&log);

        scheduler
            .run_saga(|ctx| async move {
                ctx.take_latest("search/QUERY", worker).await?;
                Ok(Value::Null)
            })
            .unwrap();

        wait_for_takes(&scheduler, 1).await;
        for n in 1..=3 {
            scheduler.dispatch(search(n)).unwrap();
        }
        settle_time().await;

        assert_eq!(*log.lock().unwrap(), vec![json!(3)]);
        scheduler.cancel_all_tasks();
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_fires_once_with_last_action() {
        let scheduler = Scheduler::new();
        let log: Log = Arc::default();
        let worker = slow_recorder(&log);

        scheduler
            .run_saga(|ctx| async move {
                ctx.debounce(Duration::from_millis(50), "search/QUERY", worker)
                    .await?;
                Ok(Value::Null)
            })
            .unwrap();

        wait_for_takes(&scheduler, 1).await;
        scheduler.dispatch(search(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.dispatch(search(2)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.dispatch(search(3)).unwrap();
        settle_time().await;

        assert_eq!(*log.lock().unwrap(), vec![json!(3)]);

        // A quiet gap starts a new burst
        scheduler.dispatch(search(4)).unwrap();
        settle_time().await;
        assert_eq!(*log.lock().unwrap(), vec![json!(3), json!(4)]);
        scheduler.cancel_all_tasks();
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_fires_on_leading_edge() {
        let scheduler = Scheduler::new();
        let log: Log = Arc::default();
        let worker = slow_recorder(&log);

        scheduler
            .run_saga(|ctx| async move {
                ctx.throttle(Duration::from_millis(200), "search/QUERY", worker)
                    .await?;
                Ok(Value::Null)
            })
            .unwrap();

        wait_for_takes(&scheduler, 1).await;
        scheduler.dispatch(search(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.dispatch(search(2)).unwrap();
        scheduler.dispatch(search(3)).unwrap();
        settle_time().await;

        assert_eq!(*log.lock().unwrap(), vec![json!(1)]);

        scheduler.dispatch(search(4)).unwrap();
        settle_time().await;
        assert_eq!(*log.lock().unwrap(), vec![json!(1), json!(4)]);
        scheduler.cancel_all_tasks();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelling_root_cancels_watcher_and_workers() {
        let scheduler = Scheduler::new();
        let log: Log = Arc::default();
        let worker = slow_recorder(&log);

        let root = scheduler
            .run_saga(|ctx| async move {
                ctx.take_every("search/*", worker).await?;
                Ok(Value::Null)
            })
            .unwrap();

        wait_for_takes(&scheduler, 1).await;
        scheduler.dispatch(search(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let watcher: Vec<Task> = scheduler
            .running_tasks()
            .into_iter()
            .filter(|t| t.name().is_some_and(|n| n.starts_with("take_every")))
            .collect();
        assert_eq!(watcher.len(), 1);
        assert_eq!(watcher[0].children().len(), 1);

        root.cancel();
        settle_time().await;

        assert!(watcher[0].is_cancelled());
        assert!(scheduler.running_tasks().is_empty());
        assert_eq!(scheduler.pending_take_count(), 0);
        assert!(log.lock().unwrap().is_empty());
    }
}
