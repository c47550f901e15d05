//! Testing utilities for code built on missile.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! missile = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Recording dispatched actions
//!
//! ```ignore
//! use missile::testing::ActionRecorder;
//!
//! let recorder = ActionRecorder::attach(&scheduler);
//! scheduler.dispatch(Action::new("auth/LOGIN"))?;
//!
//! recorder.assert_dispatched("auth/LOGIN");
//! assert_eq!(recorder.types(), vec!["auth/LOGIN"]);
//! ```
//!
//! # Waiting for workers without sleeping
//!
//! ```ignore
//! use missile::testing::shared_latch;
//!
//! let latch = shared_latch(3);
//! ctx.take_every("job/*", {
//!     let latch = latch.clone();
//!     move |_ctx, _action| {
//!         let latch = latch.clone();
//!         async move {
//!             latch.count_down();
//!             Ok(Value::Null)
//!         }
//!     }
//! }).await?;
//!
//! latch.wait().await;
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::action::Action;
use crate::pattern::Pattern;
use crate::scheduler::{Scheduler, Subscription};
use crate::sync::lock;

// =============================================================================
// Action Recorder
// =============================================================================

/// Records every action dispatched through a scheduler.
#[derive(Debug)]
pub struct ActionRecorder {
    actions: Arc<Mutex<Vec<Action>>>,
    subscription: Subscription,
}

impl ActionRecorder {
    /// Subscribe a new recorder to `scheduler`.
    pub fn attach(scheduler: &Scheduler) -> Self {
        let actions: Arc<Mutex<Vec<Action>>> = Arc::default();
        let subscription = {
            let actions = actions.clone();
            scheduler.subscribe(move |action| {
                lock(&actions).push(action.clone());
                Ok(())
            })
        };
        Self {
            actions,
            subscription,
        }
    }

    /// Everything recorded so far, in dispatch order.
    pub fn actions(&self) -> Vec<Action> {
        lock(&self.actions).clone()
    }

    /// Types of everything recorded so far, in dispatch order.
    pub fn types(&self) -> Vec<String> {
        lock(&self.actions)
            .iter()
            .map(|a| a.action_type.clone())
            .collect()
    }

    /// Recorded actions matching `pattern`.
    pub fn matching(&self, pattern: impl Into<Pattern>) -> Vec<Action> {
        let pattern = pattern.into();
        lock(&self.actions)
            .iter()
            .filter(|a| pattern.matches(a))
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        lock(&self.actions).len()
    }

    pub fn clear(&self) {
        lock(&self.actions).clear();
    }

    /// Assert at least one recorded action matches `pattern`.
    ///
    /// # Panics
    ///
    /// Panics with the recorded types if nothing matches.
    pub fn assert_dispatched(&self, pattern: impl Into<Pattern>) {
        let pattern = pattern.into();
        assert!(
            !self.matching(pattern.clone()).is_empty(),
            "expected an action matching {}, recorded: {:?}",
            pattern,
            self.types()
        );
    }

    /// Assert no recorded action matches `pattern`.
    pub fn assert_not_dispatched(&self, pattern: impl Into<Pattern>) {
        let pattern = pattern.into();
        let found = self.matching(pattern.clone());
        assert!(
            found.is_empty(),
            "expected no action matching {}, found: {:?}",
            pattern,
            found
        );
    }

    /// Stop recording. Returns what was recorded.
    pub fn detach(self) -> Vec<Action> {
        self.subscription.unsubscribe();
        lock(&self.actions).clone()
    }
}

// =============================================================================
// Count Latch
// =============================================================================

/// A countdown latch for waiting on a known number of events.
///
/// # Timeout Safety
///
/// ```ignore
/// timeout(Duration::from_secs(5), latch.wait())
///     .await
///     .expect("latch timed out");
/// ```
#[derive(Debug)]
pub struct CountLatch {
    remaining: AtomicUsize,
    notify: Notify,
}

impl CountLatch {
    /// Create a new latch expecting `expected` events.
    pub fn new(expected: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(expected),
            notify: Notify::new(),
        }
    }

    /// Record one event. Waiters are woken when the count reaches zero.
    ///
    /// # Panics
    ///
    /// Panics if called more times than expected.
    pub fn count_down(&self) {
        let prev = self.remaining.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            panic!("CountLatch counted down below zero - more events than expected");
        }
        if prev == 1 {
            self.notify.notify_waiters();
        }
    }

    /// Wait for the count to reach zero.
    pub async fn wait(&self) {
        loop {
            // Register before checking so a concurrent count_down is not missed
            let notified = self.notify.notified();

            if self.remaining.load(Ordering::Acquire) == 0 {
                return;
            }

            notified.await;
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }
}

/// Arc-wrapped [`CountLatch`] for sharing across workers.
pub type SharedLatch = Arc<CountLatch>;

/// Convenience for `Arc::new(CountLatch::new(expected))`.
pub fn shared_latch(expected: usize) -> SharedLatch {
    Arc::new(CountLatch::new(expected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::time::Duration;

    #[tokio::test]
    async fn test_recorder_captures_dispatch_order() {
        let scheduler = Scheduler::new();
        let recorder = ActionRecorder::attach(&scheduler);

        scheduler.dispatch("auth/LOGIN").unwrap();
        scheduler.dispatch("cart/ADD").unwrap();
        scheduler.dispatch("auth/LOGOUT").unwrap();

        assert_eq!(recorder.types(), vec!["auth/LOGIN", "cart/ADD", "auth/LOGOUT"]);
        assert_eq!(recorder.matching("auth/*").len(), 2);
        recorder.assert_dispatched("cart/ADD");
        recorder.assert_not_dispatched("cart/REMOVE");

        let recorded = recorder.detach();
        scheduler.dispatch("late").unwrap();
        assert_eq!(recorded.len(), 3);
        assert_eq!(scheduler.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_recorder_sees_saga_puts() {
        let scheduler = Scheduler::new();
        let recorder = ActionRecorder::attach(&scheduler);

        let task = scheduler
            .run_saga(|ctx| async move {
                ctx.put("saga/STARTED").await?;
                Ok(Value::Null)
            })
            .unwrap();
        task.join().await.unwrap();

        recorder.assert_dispatched("saga/STARTED");
    }

    #[tokio::test]
    async fn test_latch_wakes_waiter() {
        let latch = shared_latch(2);

        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.wait().await })
        };

        latch.count_down();
        assert_eq!(latch.remaining(), 1);
        latch.count_down();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("latch timed out")
            .unwrap();
        assert!(latch.is_complete());
    }

    #[tokio::test]
    async fn test_latch_with_workers() {
        let scheduler = Scheduler::new();
        let latch = shared_latch(3);

        {
            let latch = latch.clone();
            scheduler
                .run_saga(|ctx| async move {
                    ctx.take_every("job/RUN", move |_ctx, _action| {
                        let latch = latch.clone();
                        async move {
                            latch.count_down();
                            Ok(Value::Null)
                        }
                    })
                    .await?;
                    Ok(Value::Null)
                })
                .unwrap();
        }

        while scheduler.pending_take_count() == 0 {
            tokio::task::yield_now().await;
        }
        for _ in 0..3 {
            scheduler.dispatch("job/RUN").unwrap();
        }

        tokio::time::timeout(Duration::from_secs(1), latch.wait())
            .await
            .expect("workers did not run");
        scheduler.cancel_all_tasks();
    }

    #[test]
    #[should_panic(expected = "below zero")]
    fn test_latch_underflow_panics() {
        let latch = CountLatch::new(0);
        latch.count_down();
    }
}
