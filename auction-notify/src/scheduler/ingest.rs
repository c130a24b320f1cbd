//! Event intake.
//!
//! Consumes listing change events from an mpsc channel and runs them through
//! the [`MatchPipeline`], several events at a time. An event that failed at
//! event level or whose report asks for a replay is tried again after a
//! backoff, up to a fixed number of attempts. Replays are safe: the ledger
//! turns dispatched matches into duplicates and resumes pending ones.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::pipeline::MatchPipeline;
use crate::domain::ListingChangeEvent;
use crate::notification::{OpsEvent, OpsPublisher, RetryPolicy};

/// Configuration for the ingest loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Events processed concurrently.
    pub max_concurrent_events: usize,
    /// Attempts per event, including the first.
    pub max_event_attempts: u32,
    /// Backoff between attempts of one event.
    #[serde(default)]
    pub replay_backoff: RetryPolicy,
    /// Capacity of the intake channel.
    pub queue_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_concurrent_events: 8,
            max_event_attempts: 3,
            replay_backoff: RetryPolicy::default(),
            queue_capacity: 1024,
        }
    }
}

/// Counters for one run of the loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStats {
    pub received: u64,
    pub completed: u64,
    /// Extra attempts made beyond the first.
    pub replays: u64,
    pub dropped: u64,
    pub cancelled: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventOutcome {
    Completed { attempts: u32 },
    Dropped { attempts: u32 },
    Cancelled { attempts: u32 },
}

/// Runs events through the pipeline with bounded parallelism.
pub struct IngestLoop {
    pipeline: MatchPipeline,
    config: IngestConfig,
    ops: OpsPublisher,
    cancellation_token: CancellationToken,
}

impl IngestLoop {
    pub fn new(
        pipeline: MatchPipeline,
        config: IngestConfig,
        ops: OpsPublisher,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            pipeline,
            config,
            ops,
            cancellation_token,
        }
    }

    /// Intake channel sized from the config.
    pub fn channel(
        &self,
    ) -> (
        mpsc::Sender<ListingChangeEvent>,
        mpsc::Receiver<ListingChangeEvent>,
    ) {
        mpsc::channel(self.config.queue_capacity.max(1))
    }

    /// Process events until the sender side closes or the token is
    /// cancelled, then wait for in-flight events.
    pub async fn run(self, mut rx: mpsc::Receiver<ListingChangeEvent>) -> IngestStats {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_events.max(1)));
        let mut tasks: JoinSet<EventOutcome> = JoinSet::new();
        let mut stats = IngestStats::default();

        info!(
            max_concurrent_events = self.config.max_concurrent_events,
            max_event_attempts = self.config.max_event_attempts,
            "ingest loop started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.cancellation_token.cancelled() => {
                    info!("ingest loop cancelled");
                    break;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    absorb(&mut stats, joined);
                }
                received = rx.recv() => {
                    let Some(event) = received else {
                        debug!("intake channel closed");
                        break;
                    };
                    stats.received += 1;

                    let permit = tokio::select! {
                        _ = self.cancellation_token.cancelled() => break,
                        permit = semaphore.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };

                    tasks.spawn(handle_event(
                        self.pipeline.clone(),
                        event,
                        permit,
                        semaphore.clone(),
                        self.config.clone(),
                        self.ops.clone(),
                        self.cancellation_token.clone(),
                    ));
                }
            }
        }

        // Drain: in-flight attempts finish, pending replays see the token.
        while let Some(joined) = tasks.join_next().await {
            absorb(&mut stats, joined);
        }

        info!(
            received = stats.received,
            completed = stats.completed,
            replays = stats.replays,
            dropped = stats.dropped,
            "ingest loop stopped"
        );
        stats
    }
}

fn absorb(stats: &mut IngestStats, joined: Result<EventOutcome, tokio::task::JoinError>) {
    let attempts = match joined {
        Ok(EventOutcome::Completed { attempts }) => {
            stats.completed += 1;
            attempts
        }
        Ok(EventOutcome::Dropped { attempts }) => {
            stats.dropped += 1;
            attempts
        }
        Ok(EventOutcome::Cancelled { attempts }) => {
            stats.cancelled += 1;
            attempts
        }
        Err(e) => {
            error!(error = %e, "event task failed");
            stats.dropped += 1;
            1
        }
    };
    stats.replays += u64::from(attempts.saturating_sub(1));
}

async fn handle_event(
    pipeline: MatchPipeline,
    event: ListingChangeEvent,
    first_permit: OwnedSemaphorePermit,
    semaphore: Arc<Semaphore>,
    config: IngestConfig,
    ops: OpsPublisher,
    cancellation_token: CancellationToken,
) -> EventOutcome {
    let max_attempts = config.max_event_attempts.max(1);
    let mut permit = Some(first_permit);
    let mut attempt = 1u32;

    loop {
        let held = match permit.take() {
            Some(held) => held,
            None => tokio::select! {
                _ = cancellation_token.cancelled() => {
                    return EventOutcome::Cancelled { attempts: attempt - 1 };
                }
                acquired = semaphore.clone().acquire_owned() => match acquired {
                    Ok(held) => held,
                    Err(_) => return EventOutcome::Cancelled { attempts: attempt - 1 },
                },
            },
        };

        let result = pipeline.process_event(&event).await;
        drop(held);

        let reason = match result {
            Ok(report) if !report.needs_replay() => {
                return EventOutcome::Completed { attempts: attempt };
            }
            Ok(report) => format!(
                "{} store error(s), {} failed task(s), {} aborted send(s), timed out: {}",
                report.store_errors.len(),
                report.task_failures,
                report.aborted,
                report.timed_out
            ),
            Err(e) => e.to_string(),
        };

        if attempt >= max_attempts {
            error!(
                listing_id = %event.listing_id,
                attempts = attempt,
                %reason,
                "giving up on event"
            );
            ops.publish(OpsEvent::EventDropped {
                listing_id: event.listing_id.clone(),
                attempts: attempt,
                reason,
                timestamp: Utc::now(),
            });
            return EventOutcome::Dropped { attempts: attempt };
        }

        let delay = config.replay_backoff.delay_for(attempt, None);
        warn!(
            listing_id = %event.listing_id,
            attempt,
            max_attempts,
            ?delay,
            %reason,
            "event needs replay"
        );

        tokio::select! {
            _ = cancellation_token.cancelled() => {
                return EventOutcome::Cancelled { attempts: attempt };
            }
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
