use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use sentiment_engine::analytics::{self, RECENT_FEEDBACK_LIMIT};
use sentiment_engine::clock::SystemClock;
use sentiment_engine::config::{ConfigUpdate, EngineConfig, ScoringConfig, SharedConfig};
use sentiment_engine::pipeline::{
    AlertThrottler, EntityLocks, FeedbackIngestor, FeedbackSubmission, InMemoryQueue, JobQueue,
    KeywordClassifier, ScoreAggregator,
};
use sentiment_engine::store::{FeedbackStore, LibSqlBackend};
use sentiment_engine::worker::{Worker, WorkerDeps};

const SCORE_BOARD_SIZE: usize = 10;

/// One line of stdin input.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InputLine {
    /// `{"config": {"ema_alpha": 0.2}}`
    Config { config: ConfigUpdate },
    /// `{"analytics": "D1"}`
    Analytics { analytics: String },
    /// `{"user_id": "u1", "entity_type": "DRIVER", "entity_id": "D1", "text": "..."}`
    Feedback(FeedbackSubmission),
}

fn init_tracing(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "sentiment-engine.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_writer(std::io::stderr),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let engine = EngineConfig::from_env().context("Invalid engine configuration")?;
    let _log_guard = init_tracing(engine.log_dir.as_deref());
    let scoring = ScoringConfig::from_env().context("Invalid scoring configuration")?;

    eprintln!("📊 Sentiment Engine v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", engine.db_path.display());
    eprintln!(
        "   Alert threshold: {} | EMA alpha: {} | Throttle: {} min",
        scoring.alert_threshold, scoring.ema_alpha, scoring.alert_throttle_minutes
    );
    eprintln!("   Reading JSON lines from stdin. Ctrl-D to drain and exit.\n");

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn FeedbackStore> = Arc::new(
        LibSqlBackend::new_local(&engine.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", engine.db_path.display()))?,
    );

    // ── Pipeline ─────────────────────────────────────────────────────────
    let config = SharedConfig::new(scoring);
    let queue = Arc::new(InMemoryQueue::new());
    let aggregator = Arc::new(ScoreAggregator::new(
        config.clone(),
        Arc::new(EntityLocks::new()),
        engine.lock_timeout,
    ));

    let worker = Worker::new(WorkerDeps {
        queue: queue.clone(),
        store: Arc::clone(&store),
        classifier: Arc::new(KeywordClassifier::default()),
        aggregator,
        throttler: Arc::new(AlertThrottler::new(config.clone())),
        clock: Arc::new(SystemClock),
    });
    let handle = worker.spawn();
    let ingestor = FeedbackIngestor::new(queue.clone(), config.clone());

    // ── Input ────────────────────────────────────────────────────────────
    let drain = tokio::select! {
        result = read_input(BufReader::new(tokio::io::stdin()), &ingestor, &config, store.as_ref()) => {
            result?;
            true
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, stopping without draining");
            false
        }
    };

    // ── Shutdown ─────────────────────────────────────────────────────────
    queue.close();
    if drain {
        queue.wait_drained().await;
    }
    match handle.stop(engine.shutdown_grace).await {
        Ok(stats) => tracing::info!(
            processed = stats.processed,
            committed = stats.committed,
            failed = stats.failed,
            alerts_fired = stats.alerts_fired,
            alerts_throttled = stats.alerts_throttled,
            "Worker stopped"
        ),
        Err(e) => tracing::warn!(error = %e, "Worker shutdown incomplete"),
    }
    if queue.pending() > 0 {
        tracing::warn!(lost = queue.pending(), "Queued jobs dropped at shutdown");
    }

    let board = analytics::score_board(store.as_ref(), SCORE_BOARD_SIZE)
        .await
        .context("Failed to load score board")?;
    eprintln!("\nLowest scores:");
    for score in board {
        eprintln!(
            "   {:<12} {:.2} ({} observations)",
            score.entity_id, score.average_score, score.observation_count
        );
    }

    Ok(())
}

async fn read_input<R: AsyncBufRead + Unpin>(
    input: R,
    ingestor: &FeedbackIngestor,
    config: &SharedConfig,
    store: &dyn FeedbackStore,
) -> anyhow::Result<()> {
    let mut lines = input.lines();

    while let Some(line) = lines.next_line().await.context("Error reading input")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<InputLine>(line) {
            Ok(InputLine::Feedback(submission)) => {
                let submitter = submission
                    .user_id
                    .clone()
                    .unwrap_or_else(|| "cli".to_string());
                if let Err(e) = ingestor.submit(&submitter, submission) {
                    eprintln!("rejected: {e}");
                }
            }
            Ok(InputLine::Config { config: update }) => match config.apply(update) {
                Ok(current) => println!("{}", serde_json::to_string(&current)?),
                Err(e) => eprintln!("config rejected: {e}"),
            },
            Ok(InputLine::Analytics { analytics: entity_id }) => {
                match analytics::entity_analytics(store, &entity_id, RECENT_FEEDBACK_LIMIT).await {
                    Ok(Some(view)) => println!("{}", serde_json::to_string(&view)?),
                    Ok(None) => eprintln!("unknown entity: {entity_id}"),
                    Err(e) => {
                        tracing::error!(entity_id = %entity_id, error = %e, "Analytics query failed");
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring malformed input line"),
        }
    }

    Ok(())
}
