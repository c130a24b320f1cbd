use auction_notify::config::AppConfig;
use auction_notify::domain::ListingChangeEvent;
use auction_notify::notification::events::log_ops_events;
use auction_notify::services::ServiceContainer;
use auction_notify::{database, logging};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Loads .env before reading the environment
    let config = AppConfig::from_env()?;

    let (logging_config, _log_guard) = logging::init_logging(&config.log_dir)?;
    info!(
        database_url = %config.database_url,
        telegram = config.telegram.is_configured(),
        keyword_field = ?config.keyword_field,
        "Starting auction-notify"
    );

    let pool = database::init_pool_with_size(&config.database_url, config.database_pool_size)
        .await?;
    database::run_migrations(&pool).await?;

    let container = ServiceContainer::new(pool, config)?;
    logging_config.start_retention_cleanup(container.cancellation_token());
    container.start_maintenance_tasks();

    let ops_logger = tokio::spawn(log_ops_events(container.subscribe_ops()));

    let ingest = container.ingest_loop();
    let (tx, rx) = ingest.channel();
    let ingest_task = tokio::spawn(ingest.run(rx));

    // One ListingChangeEvent per line on stdin.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no: u64 = 0;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Ctrl-C received, draining queued events");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    line_no += 1;
                    if line.trim().is_empty() {
                        continue;
                    }
                    match ListingChangeEvent::from_json(&line) {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                warn!("Ingest loop stopped, no longer reading input");
                                break;
                            }
                        }
                        Err(e) => warn!(line = line_no, error = %e, "Skipping invalid event"),
                    }
                }
                Ok(None) => {
                    info!(lines = line_no, "Input closed, draining queued events");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read input");
                    break;
                }
            }
        }
    }

    // Closing the sender lets the loop finish what is queued and return.
    drop(tx);
    let stats = ingest_task.await?;
    info!(
        received = stats.received,
        completed = stats.completed,
        replays = stats.replays,
        dropped = stats.dropped,
        "Ingest finished"
    );

    container.shutdown().await;
    ops_logger.abort();
    Ok(())
}
