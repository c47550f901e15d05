//! Login flow wired onto a missile scheduler.
//!
//! ```text
//! auth/LOGIN  ──take_latest──► authorize ──► store "session" ──► auth/LOGIN_SUCCESS
//! auth/LOGOUT ──take_every───► clear "session"               ──► auth/LOGGED_OUT
//! store watch ──channel──────► store/CHANGED
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use missile::{
    Action, KeyValueStore, MemoryStore, SagaContext, Scheduler, SchedulerConfig, ValueChange,
};
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

async fn authorize(ctx: SagaContext, store: Arc<MemoryStore>, action: Action) -> Result<Value> {
    let user = match action
        .payload
        .as_ref()
        .and_then(|p| p.get("user"))
        .and_then(Value::as_str)
    {
        Some(user) => user.to_string(),
        None => {
            ctx.put(Action::new("auth/LOGIN_FAILURE").with_status("missing_user"))
                .await?;
            return Ok(Value::Null);
        }
    };

    // Simulated round-trip to an identity provider
    ctx.delay(Duration::from_millis(50)).await?;

    let token = format!("token-{}", user);
    {
        let store = store.clone();
        let session = json!({ "user": user, "token": token });
        ctx.call(move || async move {
            store.set("session", session).await?;
            Ok(Value::Null)
        })
        .await?;
    }

    ctx.put(Action::new("auth/LOGIN_SUCCESS").with_payload(json!({ "user": user })))
        .await?;
    Ok(json!(token))
}

async fn logout(ctx: SagaContext, store: Arc<MemoryStore>) -> Result<Value> {
    ctx.call(move || async move {
        store.remove("session").await?;
        Ok(Value::Null)
    })
    .await?;
    ctx.put("auth/LOGGED_OUT").await?;
    Ok(Value::Null)
}

async fn root(ctx: SagaContext, store: Arc<MemoryStore>) -> Result<Value> {
    {
        let store = store.clone();
        ctx.take_latest("auth/LOGIN", move |ctx, action| {
            authorize(ctx, store.clone(), action)
        })
        .await?;
    }
    {
        let store = store.clone();
        ctx.take_every("auth/LOGOUT", move |ctx, _action| logout(ctx, store.clone()))
            .await?;
    }

    let changes = store.watch(&["session"]).await?;
    ctx.fork(move |ctx| async move {
        while let Some(change) = ctx.take_channel(&changes).await? {
            let change = ValueChange::try_from(change)?;
            ctx.put(Action::new("store/CHANGED").with_payload(change.to_value()))
                .await?;
        }
        Ok(Value::Null)
    })
    .await?;

    Ok(Value::Null)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,missile=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let config = SchedulerConfig::from_env()
        .context("Failed to load scheduler configuration")?
        .with_error_hook(|error, context| {
            warn!(task_id = %context.task_id, name = ?context.name, error = %error, "saga failed");
        });
    info!(?config, "Starting missile demo");

    let scheduler = Scheduler::with_config(config);
    let store = Arc::new(MemoryStore::new());

    let _log = scheduler.subscribe(|action| {
        info!(action_type = %action.action_type, payload = ?action.payload, "dispatched");
        Ok(())
    });

    {
        let store = store.clone();
        scheduler.register("auth", move |ctx| root(ctx, store))?;
    }

    // Let the watchers register before the first dispatch
    while scheduler.pending_take_count() < 2 {
        tokio::task::yield_now().await;
    }

    // The second login supersedes the first before it completes
    scheduler.dispatch(Action::new("auth/LOGIN").with_payload(json!({ "user": "ada" })))?;
    scheduler.dispatch(Action::new("auth/LOGIN").with_payload(json!({ "user": "grace" })))?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    scheduler.dispatch(Action::new("auth/LOGIN").with_payload(json!({})))?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Detached failure: reported through the error hook, the auth tree keeps running
    scheduler.run_saga(|ctx| async move {
        ctx.take("audit/FLUSH").await?;
        anyhow::bail!("audit sink unavailable")
    })?;
    while scheduler.pending_take_count() < 3 {
        tokio::task::yield_now().await;
    }
    scheduler.dispatch("audit/FLUSH")?;

    scheduler.dispatch("auth/LOGOUT")?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    for task in scheduler.running_tasks() {
        info!(task = %serde_json::to_string(&task.info())?, "still running");
    }

    scheduler.cancel_all_tasks();
    info!("Shutdown complete");
    Ok(())
}
