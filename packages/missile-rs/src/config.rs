use std::env;
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Serialize;

use crate::task::TaskId;

/// Called once for every uncaught saga error.
pub type ErrorHook = Arc<dyn Fn(&anyhow::Error, &ErrorContext) + Send + Sync>;

/// Which saga an uncaught error came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorContext {
    pub task_id: TaskId,
    pub name: Option<String>,
}

/// Scheduler configuration
#[derive(Clone, Default)]
pub struct SchedulerConfig {
    /// Log dispatched actions and interpreted effects, and log uncaught saga
    /// errors at error level when no hook is set.
    pub debug: bool,
    /// Upper bound on live tasks. `None` means unbounded.
    pub max_concurrent_tasks: Option<usize>,
    /// Receives uncaught saga errors.
    pub on_error: Option<ErrorHook>,
}

impl SchedulerConfig {
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_max_concurrent_tasks(mut self, limit: usize) -> Self {
        self.max_concurrent_tasks = Some(limit);
        self
    }

    pub fn with_error_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&anyhow::Error, &ErrorContext) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Load configuration from environment variables
    ///
    /// | Variable                       | Default   |
    /// |--------------------------------|-----------|
    /// | `MISSILE_DEBUG`                | `false`   |
    /// | `MISSILE_MAX_CONCURRENT_TASKS` | unbounded |
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let debug = match lookup("MISSILE_DEBUG") {
            Some(value) => parse_flag(&value).context("MISSILE_DEBUG must be true/false or 1/0")?,
            None => false,
        };

        let max_concurrent_tasks = lookup("MISSILE_MAX_CONCURRENT_TASKS")
            .map(|value| value.trim().parse::<usize>())
            .transpose()
            .context("MISSILE_MAX_CONCURRENT_TASKS must be a valid number")?;

        Ok(Self {
            debug,
            max_concurrent_tasks,
            on_error: None,
        })
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("unrecognised flag value {:?}", other),
    }
}

impl fmt::Debug for SchedulerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerConfig")
            .field("debug", &self.debug)
            .field("max_concurrent_tasks", &self.max_concurrent_tasks)
            .field("on_error", &self.on_error.as_ref().map(|_| "<hook>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = SchedulerConfig::from_lookup(lookup(&[])).unwrap();
        assert!(!config.debug);
        assert_eq!(config.max_concurrent_tasks, None);
        assert!(config.on_error.is_none());
    }

    #[test]
    fn test_reads_variables() {
        let config = SchedulerConfig::from_lookup(lookup(&[
            ("MISSILE_DEBUG", "TRUE"),
            ("MISSILE_MAX_CONCURRENT_TASKS", " 64 "),
        ]))
        .unwrap();
        assert!(config.debug);
        assert_eq!(config.max_concurrent_tasks, Some(64));
    }

    #[test]
    fn test_rejects_garbage() {
        let err = SchedulerConfig::from_lookup(lookup(&[("MISSILE_MAX_CONCURRENT_TASKS", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("MISSILE_MAX_CONCURRENT_TASKS"));

        let err = SchedulerConfig::from_lookup(lookup(&[("MISSILE_DEBUG", "maybe")])).unwrap_err();
        assert!(err.to_string().contains("MISSILE_DEBUG"));
    }

    #[test]
    fn test_debug_hides_hook() {
        let config = SchedulerConfig::default().with_error_hook(|_, _| {});
        assert!(format!("{:?}", config).contains("<hook>"));
    }
}
