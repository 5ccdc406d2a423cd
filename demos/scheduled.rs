use std::{env, sync::Arc};

use jiff::ToSpan;
use sqlx::PgPool;
use tickwork::{
    checkpoint::PgCheckpointStore, executor::try_limit_concurrency, job::Context,
    lock::PgLockManager, CheckpointStore, Job, JobOptions, JobRegistry, Scheduler,
    SchedulerConfig,
};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const TARGETS: [&str; 3] = ["posts", "users", "tags"];

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("Ctrl+C handler should install");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler should install")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

// Counts queue entries enqueued since the last successful run, one target at
// a time, two at once.
async fn queue_rollup(cx: Context<PgPool>) -> tickwork::job::Result {
    let checkpoints = PgCheckpointStore::new(cx.state.clone());
    let checkpoint = checkpoints.checkpoint("queue-rollup").await?;
    let since_ms = checkpoint.value().as_millisecond();

    let counts = try_limit_concurrency(
        TARGETS.map(|target| {
            let pool = cx.state.clone();
            move || async move {
                sqlx::query_scalar::<_, i64>(
                    r#"
                    select count(*)
                    from tickwork.sync_queue
                    where target = $1
                      and enqueued_at > to_timestamp($2::double precision / 1000)
                    "#,
                )
                .bind(target)
                .bind(since_ms)
                .fetch_one(&pool)
                .await
                .map(|count| (target, count))
            }
        }),
        2,
    )
    .await?;

    for (target, count) in counts {
        cx.check_if_cancelled()?;
        tracing::info!(sync.target = target, count, "Queue entries since last rollup");
    }

    checkpoint.advance().await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize the tracing subscriber.
    tracing_subscriber::registry()
        .with(EnvFilter::new(
            env::var("RUST_LOG").unwrap_or_else(|_| "info,tickwork=debug,sqlx=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    // Set up the database connection pool.
    let database_url = &env::var("DATABASE_URL").expect("DATABASE_URL should be set");
    let pool = PgPool::connect(database_url).await?;

    // Run migrations.
    tickwork::MIGRATOR.run(&pool).await?;

    let rollup = Job::builder()
        .name("queue-rollup")
        .trigger("*/10 * * * * *".parse()?)
        .body(queue_rollup)
        .lock_ttl(1.minute())
        .build();

    // Only ever runs when triggered by hand.
    let vacuum = Job::new(
        "queue-vacuum",
        "@never".parse()?,
        JobOptions::new().dedicated(true),
        |cx: Context<PgPool>| async move {
            sqlx::query("vacuum analyze tickwork.sync_queue")
                .execute(&cx.state)
                .await?;
            Ok(())
        },
    );

    let registry = JobRegistry::new([rollup, vacuum])?;

    let node_id = env::var("NODE_ID").unwrap_or_else(|_| "demo-1".into());
    let mut config = SchedulerConfig::for_node(node_id.clone());
    config.designated_node = Some(node_id);

    let scheduler = Scheduler::new(
        Arc::new(registry),
        PgLockManager::new(pool.clone()),
        pool,
        config,
    );

    scheduler.trigger("queue-vacuum").await?;

    let handle = scheduler.start();
    shutdown_signal().await;
    handle.shutdown().await?;

    Ok(())
}
