//! Named saga registry: at most one running task per name.
//!
//! ```ignore
//! scheduler.register("session", session_saga)?;
//! // Replaces (and cancels) the running "session" task
//! scheduler.register("session", session_saga)?;
//! ```
//!
//! Entries whose task has settled are pruned lazily on lookup.

use std::future::Future;

use serde_json::Value;
use tracing::{debug, info};

use crate::context::SagaContext;
use crate::effect::Saga;
use crate::error::MissileError;
use crate::scheduler::Scheduler;
use crate::sync::lock;
use crate::task::Task;

impl Scheduler {
    /// Run `f` under `name`, cancelling any task already registered there.
    pub fn register<F, Fut>(&self, name: impl Into<String>, f: F) -> Result<Task, MissileError>
    where
        F: FnOnce(SagaContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register_saga(name, Saga::new(f))
    }

    /// Run an existing saga under `name`, cancelling any previous holder.
    pub fn register_saga(&self, name: impl Into<String>, saga: Saga) -> Result<Task, MissileError> {
        let name = name.into();

        let previous = lock(&self.shared.registry).remove(&name);
        if let Some(previous) = previous {
            debug!(name = %name, task_id = %previous.id(), "replacing registered saga");
            previous.cancel();
        }

        let task = self.run(saga.named(name.clone()))?;
        // A concurrent register may have filled the slot since the removal
        let stale = lock(&self.shared.registry).insert(name.clone(), task.clone());
        if let Some(stale) = stale {
            debug!(name = %name, task_id = %stale.id(), "replacing concurrently registered saga");
            stale.cancel();
        }

        info!(name = %name, task_id = %task.id(), "saga registered");
        Ok(task)
    }

    /// Cancel and forget the task registered under `name`.
    ///
    /// Returns false if nothing was registered.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = lock(&self.shared.registry).remove(name);
        match removed {
            Some(task) => {
                task.cancel();
                true
            }
            None => false,
        }
    }

    /// Returns true if `name` has a running task.
    pub fn is_registered(&self, name: &str) -> bool {
        self.registered(name).is_some()
    }

    /// The running task registered under `name`.
    pub fn registered(&self, name: &str) -> Option<Task> {
        let mut registry = lock(&self.shared.registry);
        match registry.get(name) {
            Some(task) if task.is_running() => Some(task.clone()),
            Some(_) => {
                registry.remove(name);
                None
            }
            None => None,
        }
    }

    /// Names with a running task, sorted.
    pub fn registered_names(&self) -> Vec<String> {
        let mut registry = lock(&self.shared.registry);
        registry.retain(|_, task| task.is_running());
        let mut names: Vec<String> = registry.keys().cloned().collect();
        names.sort();
        names
    }

    /// Cancel every registered task and clear the registry.
    pub fn unregister_all(&self) {
        let tasks: Vec<Task> = lock(&self.shared.registry)
            .drain()
            .map(|(_, task)| task)
            .collect();
        for task in tasks {
            task.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_saga() -> Saga {
        Saga::new(|ctx: SagaContext| async move {
            ctx.take("never").await?;
            Ok(Value::Null)
        })
    }

    #[tokio::test]
    async fn test_register_replaces_previous_task() {
        let scheduler = Scheduler::new();

        let a = scheduler.register_saga("x", idle_saga()).unwrap();
        let b = scheduler.register_saga("x", idle_saga()).unwrap();

        assert!(a.is_cancelled());
        assert!(b.is_running());
        assert_eq!(b.name(), Some("x"));
        assert_eq!(scheduler.registered_names(), vec!["x".to_string()]);
        assert_eq!(scheduler.registered("x"), Some(b));
        scheduler.cancel_all_tasks();
    }

    #[tokio::test]
    async fn test_unregister() {
        let scheduler = Scheduler::new();
        let task = scheduler.register_saga("session", idle_saga()).unwrap();

        assert!(scheduler.is_registered("session"));
        assert!(scheduler.unregister("session"));
        assert!(!scheduler.unregister("session"));
        assert!(task.is_cancelled());
        assert!(!scheduler.is_registered("session"));
    }

    #[tokio::test]
    async fn test_settled_entries_are_pruned() {
        let scheduler = Scheduler::new();
        let task = scheduler
            .register("once", |_ctx| async { Ok(Value::from(1)) })
            .unwrap();
        task.join().await.unwrap();

        assert!(!scheduler.is_registered("once"));
        assert!(scheduler.registered_names().is_empty());
    }

    #[tokio::test]
    async fn test_names_sorted_and_unregister_all() {
        let scheduler = Scheduler::new();
        let tasks: Vec<Task> = ["b", "c", "a"]
            .into_iter()
            .map(|name| scheduler.register_saga(name, idle_saga()).unwrap())
            .collect();

        assert_eq!(scheduler.registered_names(), vec!["a", "b", "c"]);

        scheduler.unregister_all();
        assert!(scheduler.registered_names().is_empty());
        assert!(tasks.iter().all(Task::is_cancelled));
    }
}
