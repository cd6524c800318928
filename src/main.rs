use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;

mod accounts;
mod app;
mod config;
mod context;
mod db;
mod error;
mod reporting;
mod state;
mod tasks;

use crate::config::AppConfig;
use crate::db::postgres::PgDatabase;
use crate::reporting::TracingReporter;
use crate::state::AppState;
use crate::tasks::email::{sender_from_config, EmailTask, EmailTemplates, TYPE_EMAIL_SEND};
use crate::tasks::redis_queue::RedisQueue;
use crate::tasks::worker::Worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "authcore=debug,axum=info,tower_http=info".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let config = Arc::new(AppConfig::from_env()?);
    tracing::debug!(?config, "configuration loaded");

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;

    // Run migrations if present
    if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
        tracing::warn!(error = %e, "migrations folder not found or migration failed; continuing");
    }

    let queue = RedisQueue::connect(&config.redis_url).await?;
    let reporter = Arc::new(TracingReporter);
    let state = AppState::from_parts(
        config.clone(),
        Arc::new(PgDatabase::new(pool)),
        Arc::new(queue.clone()),
        reporter,
    )?;

    let email_task = EmailTask::new(EmailTemplates::new()?, sender_from_config(&config.email)?);
    let worker = Arc::new(Worker::new().register(TYPE_EMAIL_SEND, Arc::new(email_task)));
    for _ in 0..config.worker.concurrency {
        tokio::spawn(worker.clone().run(queue.clone()));
    }
    tokio::spawn(state.cleanup.clone().run_every(config.worker.cleanup_interval));

    app::serve(app::build_app(state), &config.host, config.port).await
}
