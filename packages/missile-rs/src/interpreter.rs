//! Effect interpretation.
//!
//! [`interpret`] is the single place effects acquire meaning. Each arm
//! produces a `'static` future so `race` and `all` can run their arms
//! concurrently inside the calling task. Dropping an arm's future releases
//! whatever it was waiting on (pending take, channel taker, timer).

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures::future::{select_all, try_join_all, BoxFuture};
use futures::FutureExt;
use indexmap::IndexMap;
use tracing::debug;

use crate::channel::TakeRequest;
use crate::context::SagaContext;
use crate::effect::{Effect, Group};
use crate::error::{panic_message, MissileError, TaskError};
use crate::outcome::Outcome;
use crate::scheduler::{Placement, TakeRegistration};
use crate::task::TaskStatus;
use crate::watchers;

pub(crate) fn interpret(ctx: SagaContext, effect: Effect) -> BoxFuture<'static, Result<Outcome>> {
    // A settled task may still be polled until its abort lands
    if let Some(stopped) = stopped(&ctx) {
        debug!(task_id = %ctx.task_id(), kind = %effect.kind(), "task settled, effect skipped");
        let error = anyhow::Error::from(stopped);
        return async move { Err::<Outcome, _>(error) }.boxed();
    }

    if ctx.scheduler().is_debug() {
        debug!(task_id = %ctx.task_id(), kind = %effect.kind(), "interpreting effect");
    }

    match effect {
        Effect::Call(call) => async move {
            match AssertUnwindSafe(call.invoke()).catch_unwind().await {
                Ok(result) => result.map(Outcome::Value),
                Err(panic) => Err(anyhow!(
                    "called function panicked: {}",
                    panic_message(panic.as_ref())
                )),
            }
        }
        .boxed(),

        Effect::Put(action) => async move {
            ctx.scheduler().dispatch(action.clone())?;
            Ok(Outcome::Action(action))
        }
        .boxed(),

        Effect::Take(pattern) => async move {
            let task_id = ctx.task_id();
            let shared = &ctx.scheduler().shared;
            let (id, receiver) = shared.register_take(task_id, pattern);

            let _registration = TakeRegistration::new(Arc::downgrade(shared), id);
            let weak = Arc::downgrade(shared);
            let _hook = ctx.task().register_cancel_hook(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.release_take(id);
                }
            });

            match receiver.await {
                Ok(action) => Ok(Outcome::Action(action)),
                Err(_) => Err(MissileError::TakeReleased { task_id }.into()),
            }
        }
        .boxed(),

        Effect::TakeChannel(channel) => async move {
            match channel.request() {
                TakeRequest::Ready(Some(message)) => Ok(Outcome::Message(message)),
                TakeRequest::Ready(None) => Ok(Outcome::Closed),
                TakeRequest::Pending(taker) => {
                    let id = taker.id();
                    let _hook = ctx
                        .task()
                        .register_cancel_hook(move || channel.release_taker(id));

                    match taker.await {
                        Some(message) => Ok(Outcome::Message(message)),
                        None => Ok(Outcome::Closed),
                    }
                }
            }
        }
        .boxed(),

        Effect::Delay(duration) => async move {
            tokio::time::sleep(duration).await;
            Ok(Outcome::Unit)
        }
        .boxed(),

        Effect::Fork(saga) => async move {
            let parent = ctx.task().clone();
            let task = ctx.scheduler().start(saga, Placement::Attached(parent))?;
            Ok(Outcome::Task(task))
        }
        .boxed(),

        Effect::Spawn(saga) => async move {
            let spawned_by = ctx.task_id();
            let task = ctx
                .scheduler()
                .start(saga, Placement::Detached { spawned_by })?;
            Ok(Outcome::Task(task))
        }
        .boxed(),

        Effect::Cancel(tasks) => async move {
            for task in tasks {
                task.cancel();
            }
            Ok(Outcome::Unit)
        }
        .boxed(),

        Effect::Race(arms) => race(ctx, arms),

        Effect::All(Group::List(effects)) => async move {
            let arms = effects.into_iter().map(|effect| interpret(ctx.clone(), effect));
            Ok(Outcome::List(try_join_all(arms).await?))
        }
        .boxed(),

        Effect::All(Group::Keyed(arms)) => async move {
            let (keys, effects): (Vec<String>, Vec<Effect>) = arms.into_iter().unzip();
            let outcomes =
                try_join_all(effects.into_iter().map(|effect| interpret(ctx.clone(), effect)))
                    .await?;
            Ok(Outcome::Map(keys.into_iter().zip(outcomes).collect()))
        }
        .boxed(),

        Effect::TakeEvery { pattern, worker } => {
            watchers::start(ctx, watchers::Watcher::Every { pattern, worker })
        }
        Effect::TakeLatest { pattern, worker } => {
            watchers::start(ctx, watchers::Watcher::Latest { pattern, worker })
        }
        Effect::Debounce {
            wait,
            pattern,
            worker,
        } => watchers::start(
            ctx,
            watchers::Watcher::Debounce {
                wait,
                pattern,
                worker,
            },
        ),
        Effect::Throttle {
            window,
            pattern,
            worker,
        } => watchers::start(
            ctx,
            watchers::Watcher::Throttle {
                window,
                pattern,
                worker,
            },
        ),
    }
}

fn stopped(ctx: &SagaContext) -> Option<TaskError> {
    let task = ctx.task();
    match task.status() {
        TaskStatus::Running => None,
        TaskStatus::Aborted => Some(match task.error() {
            Some(error) => TaskError::Aborted {
                id: task.id(),
                error,
            },
            None => TaskError::Cancelled(task.id()),
        }),
        TaskStatus::Completed | TaskStatus::Cancelled => Some(TaskError::Cancelled(task.id())),
    }
}

/// First arm to settle wins; the losers are dropped.
fn race(ctx: SagaContext, arms: Vec<(String, Effect)>) -> BoxFuture<'static, Result<Outcome>> {
    async move {
        if arms.is_empty() {
            return Ok(Outcome::Map(IndexMap::new()));
        }

        let (keys, effects): (Vec<String>, Vec<Effect>) = arms.into_iter().unzip();
        let futures: Vec<_> = effects
            .into_iter()
            .map(|effect| interpret(ctx.clone(), effect))
            .collect();

        let (result, index, losers) = select_all(futures).await;
        drop(losers);

        let outcome = result?;
        let mut winner = IndexMap::with_capacity(1);
        if let Some(key) = keys.into_iter().nth(index) {
            winner.insert(key, outcome);
        }
        Ok(Outcome::Map(winner))
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use crate::channel::{channel, ChannelConfig};
    use crate::effect::*;
    use crate::outcome::Outcome;
    use crate::scheduler::Scheduler;
    use crate::Action;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    async fn wait_for_takes(scheduler: &Scheduler, count: usize) {
        while scheduler.pending_take_count() < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_call_returns_value() {
        let scheduler = Scheduler::new();
        let task = scheduler
            .run_saga(|ctx| async move {
                let a = ctx.call(|| async { Ok(json!(2)) }).await?;
                let b = ctx.call_sync(|| Ok(json!(3))).await?;
                Ok(json!(a.as_i64().unwrap_or(0) * b.as_i64().unwrap_or(0)))
            })
            .unwrap();

        assert_eq!(task.join().await.unwrap(), json!(6));
    }

    #[tokio::test]
    async fn test_call_with_binds_receiver() {
        struct Api {
            base: i64,
        }

        let scheduler = Scheduler::new();
        let task = scheduler
            .run_saga(|ctx| async move {
                let outcome = ctx
                    .run(call_with(Api { base: 40 }, |api| async move {
                        Ok(json!(api.base + 2))
                    }))
                    .await?;
                Ok(outcome.into_value().unwrap_or(Value::Null))
            })
            .unwrap();

        assert_eq!(task.join().await.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn test_call_error_is_recoverable() {
        let scheduler = Scheduler::new();
        let task = scheduler
            .run_saga(|ctx| async move {
                match ctx.call(|| async { Err(anyhow::anyhow!("network down")) }).await {
                    Ok(_) => Ok(json!("unexpected")),
                    Err(e) => Ok(json!(format!("recovered: {}", e))),
                }
            })
            .unwrap();

        assert_eq!(task.join().await.unwrap(), json!("recovered: network down"));
    }

    #[tokio::test]
    async fn test_call_panic_becomes_error() {
        let scheduler = Scheduler::new();
        let task = scheduler
            .run_saga(|ctx| async move {
                let caught = ctx
                    .call_sync(|| {
                        let empty: Vec<Value> = Vec::new();
                        Ok(empty[1].clone())
                    })
                    .await
                    .is_err();
                Ok(json!(caught))
            })
            .unwrap();

        assert_eq!(task.join().await.unwrap(), json!(true));
    }

    #[tokio::test]
    async fn test_put_resolves_with_action_and_reaches_takers() {
        let scheduler = Scheduler::new();
        let listener = scheduler
            .run_saga(|ctx| async move {
                let action = ctx.take("user/SAVED").await?;
                Ok(action.payload_or_null())
            })
            .unwrap();
        wait_for_takes(&scheduler, 1).await;

        let producer = scheduler
            .run_saga(|ctx| async move {
                let action = ctx.put(Action::new("user/SAVED").with_payload(7)).await?;
                Ok(json!(action.action_type))
            })
            .unwrap();

        assert_eq!(producer.join().await.unwrap(), json!("user/SAVED"));
        assert_eq!(listener.join().await.unwrap(), json!(7));
    }

    #[tokio::test]
    async fn test_put_invalid_action_is_catchable() {
        let scheduler = Scheduler::new();
        let task = scheduler
            .run_saga(|ctx| async move { Ok(json!(ctx.put("").await.is_err())) })
            .unwrap();

        assert_eq!(task.join().await.unwrap(), json!(true));
    }

    #[tokio::test]
    async fn test_take_channel_and_closed_sentinel() {
        let scheduler = Scheduler::new();
        let ch = channel::<Value>(ChannelConfig::fixed(4));
        ch.put(json!("first"));

        let task = {
            let ch = ch.clone();
            scheduler
                .run_saga(|ctx| async move {
                    let mut seen = Vec::new();
                    while let Some(message) = ctx.take_channel(&ch).await? {
                        seen.push(message);
                    }
                    Ok(Value::Array(seen))
                })
                .unwrap()
        };

        while ch.waiting_takers() == 0 {
            tokio::task::yield_now().await;
        }
        ch.put(json!("second"));
        while ch.waiting_takers() == 0 {
            tokio::task::yield_now().await;
        }
        ch.close();

        assert_eq!(task.join().await.unwrap(), json!(["first", "second"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_keeps_only_winner() {
        let scheduler = Scheduler::new();
        let task = scheduler
            .run_saga(|ctx| async move {
                let winner = ctx
                    .race([("a", delay_ms(10)), ("b", delay_ms(1000))])
                    .await?;
                Ok(json!(winner.keys().cloned().collect::<Vec<_>>()))
            })
            .unwrap();

        assert_eq!(task.join().await.unwrap(), json!(["a"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_releases_losing_take() {
        let scheduler = Scheduler::new();
        let task = scheduler
            .run_saga(|ctx| async move {
                let winner = ctx
                    .race([("timeout", delay_ms(50)), ("reply", take("api/REPLY"))])
                    .await?;
                Ok(json!(winner.contains_key("timeout")))
            })
            .unwrap();

        assert_eq!(task.join().await.unwrap(), json!(true));
        assert_eq!(scheduler.pending_take_count(), 0);
    }

    #[tokio::test]
    async fn test_race_error_rejects() {
        let scheduler = Scheduler::new();
        let task = scheduler
            .run_saga(|ctx| async move {
                let result = ctx
                    .race([
                        ("fail", call(|| async { Err(anyhow::anyhow!("arm failed")) })),
                        ("wait", take("never")),
                    ])
                    .await;
                Ok(json!(result.is_err()))
            })
            .unwrap();

        assert_eq!(task.join().await.unwrap(), json!(true));
        assert_eq!(scheduler.pending_take_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_race_and_all() {
        let scheduler = Scheduler::new();
        let task = scheduler
            .run_saga(|ctx| async move {
                let race = ctx.race(Vec::<(String, Effect)>::new()).await?;
                let list = ctx.all(Vec::new()).await?;
                let keyed = ctx.all_keyed(Vec::<(String, Effect)>::new()).await?;
                Ok(json!([race.len(), list.len(), keyed.len()]))
            })
            .unwrap();

        assert_eq!(task.join().await.unwrap(), json!([0, 0, 0]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_preserves_order_and_keys() {
        let scheduler = Scheduler::new();
        let task = scheduler
            .run_saga(|ctx| async move {
                let list = ctx
                    .all([
                        call(|| async {
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(json!("slow"))
                        }),
                        call_sync(|| Ok(json!("fast"))),
                    ])
                    .await?;
                let keyed = ctx
                    .all_keyed([("user", call_sync(|| Ok(json!("ada")))), ("wait", delay_ms(5))])
                    .await?;

                Ok(json!({
                    "list": Outcome::List(list).to_json(),
                    "keys": keyed.keys().cloned().collect::<Vec<_>>(),
                }))
            })
            .unwrap();

        assert_eq!(
            task.join().await.unwrap(),
            json!({ "list": ["slow", "fast"], "keys": ["user", "wait"] })
        );
    }

    #[tokio::test]
    async fn test_all_failure_cancels_siblings() {
        let scheduler = Scheduler::new();
        let task = scheduler
            .run_saga(|ctx| async move {
                let result = ctx
                    .all([
                        take("never"),
                        call(|| async { Err(anyhow::anyhow!("second arm failed")) }),
                    ])
                    .await;
                Ok(json!(result.map_err(|e| e.to_string()).err()))
            })
            .unwrap();

        assert_eq!(task.join().await.unwrap(), json!("second arm failed"));
        assert_eq!(scheduler.pending_take_count(), 0);
    }

    #[tokio::test]
    async fn test_fork_links_child_and_spawn_does_not() {
        let scheduler = Scheduler::new();
        let parent = scheduler
            .run_saga(|ctx| async move {
                let child = ctx.fork(|ctx| async move {
                    ctx.take("never").await?;
                    Ok(Value::Null)
                })
                .await?;
                let detached = ctx.spawn(|ctx| async move {
                    ctx.take("never").await?;
                    Ok(Value::Null)
                })
                .await?;

                assert_eq!(child.parent_id(), Some(ctx.task_id()));
                assert_eq!(detached.parent_id(), None);
                assert_eq!(detached.spawned_by(), Some(ctx.task_id()));
                assert_eq!(ctx.task().children(), vec![child.id()]);

                ctx.take("stop").await?;
                Ok(json!([child.id().as_u64(), detached.id().as_u64()]))
            })
            .unwrap();

        wait_for_takes(&scheduler, 3).await;
        parent.cancel();

        let running: Vec<u64> = scheduler
            .running_tasks()
            .iter()
            .map(|t| t.id().as_u64())
            .collect();
        // Only the spawned task survives the parent
        assert_eq!(running, vec![3]);
        assert_eq!(scheduler.pending_take_count(), 1);
        scheduler.cancel_all_tasks();
    }

    #[tokio::test]
    async fn test_forked_error_aborts_parent_but_spawned_does_not() {
        let scheduler = Scheduler::new();

        let spawner = scheduler
            .run_saga(|ctx| async move {
                ctx.spawn(|_ctx| async { Err(anyhow::anyhow!("spawned failure")) })
                    .await?;
                ctx.delay(Duration::from_millis(5)).await?;
                Ok(json!("spawner survived"))
            })
            .unwrap();
        assert_eq!(spawner.join().await.unwrap(), json!("spawner survived"));

        let forker = scheduler
            .run_saga(|ctx| async move {
                ctx.fork(|_ctx| async { Err(anyhow::anyhow!("forked failure")) })
                    .await?;
                ctx.take("never").await?;
                Ok(Value::Null)
            })
            .unwrap();
        let err = forker.join().await.unwrap_err();
        assert!(err.is_aborted());
        assert!(err.to_string().contains("forked failure"));
    }

    #[tokio::test]
    async fn test_parent_waits_for_forked_children() {
        let scheduler = Scheduler::new();
        let parent = scheduler
            .run_saga(|ctx| async move {
                ctx.fork(|ctx| async move {
                    ctx.take("child/DONE").await?;
                    Ok(Value::Null)
                })
                .await?;
                Ok(json!("body finished"))
            })
            .unwrap();

        wait_for_takes(&scheduler, 1).await;
        tokio::task::yield_now().await;
        assert!(parent.is_running());

        scheduler.dispatch("child/DONE").unwrap();
        assert_eq!(parent.join().await.unwrap(), json!("body finished"));
    }

    #[tokio::test]
    async fn test_cancel_effect_runs_on_cancel_hooks() {
        let scheduler = Scheduler::new();
        let cleaned = Arc::new(AtomicBool::new(false));

        let task = {
            let cleaned = cleaned.clone();
            scheduler
                .run_saga(|ctx| async move {
                    let child = ctx
                        .fork(move |ctx| async move {
                            ctx.on_cancel(move || cleaned.store(true, Ordering::SeqCst));
                            ctx.take("never").await?;
                            Ok(Value::Null)
                        })
                        .await?;
                    while scheduler_idle(&ctx) {
                        tokio::task::yield_now().await;
                    }
                    ctx.cancel(&child).await?;
                    Ok(json!(child.is_cancelled()))
                })
                .unwrap()
        };

        assert_eq!(task.join().await.unwrap(), json!(true));
        assert!(cleaned.load(Ordering::SeqCst));
        assert_eq!(scheduler.pending_take_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_task_runs_no_further_effects() {
        let scheduler = Scheduler::new();
        let dispatched = Arc::new(std::sync::Mutex::new(Vec::new()));
        let called = Arc::new(AtomicBool::new(false));
        let rejected = Arc::new(AtomicBool::new(false));
        {
            let dispatched = dispatched.clone();
            scheduler.subscribe(move |action| {
                dispatched.lock().unwrap().push(action.action_type.clone());
                Ok(())
            });
        }

        let task = {
            let called = called.clone();
            let rejected = rejected.clone();
            scheduler
                .run_saga(|ctx| async move {
                    let me = ctx.task().clone();
                    ctx.put("before/CANCEL").await?;
                    ctx.cancel(&me).await?;

                    let put = ctx.put("after/CANCEL").await;
                    let call = ctx
                        .call_sync(move || {
                            called.store(true, Ordering::SeqCst);
                            Ok(Value::Null)
                        })
                        .await;
                    let fork = ctx.fork(|_ctx| async { Ok(Value::Null) }).await;
                    rejected.store(
                        put.is_err() && call.is_err() && fork.is_err(),
                        Ordering::SeqCst,
                    );
                    Ok(Value::Null)
                })
                .unwrap()
        };

        assert!(task.join().await.unwrap_err().is_cancelled());
        assert_eq!(*dispatched.lock().unwrap(), vec!["before/CANCEL".to_string()]);
        assert!(!called.load(Ordering::SeqCst));
        assert!(rejected.load(Ordering::SeqCst));
        assert!(scheduler.running_tasks().is_empty());
    }

    fn scheduler_idle(ctx: &crate::SagaContext) -> bool {
        ctx.scheduler().pending_take_count() == 0
    }
}
