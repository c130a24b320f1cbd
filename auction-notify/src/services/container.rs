//! Service container for dependency injection.
//!
//! Builds repositories, transports, the notifier, the match pipeline and the
//! management services from an [`AppConfig`], and owns the shutdown token.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ChannelService, LogService, RuleService};
use crate::Result;
use crate::config::AppConfig;
use crate::database::repositories::{
    ChannelRepository, DispatchLogRepository, RuleRepository, SqlxChannelRepository,
    SqlxDispatchLogRepository, SqlxRuleRepository,
};
use crate::domain::RuleMatcher;
use crate::notification::channels::TransportRegistry;
use crate::notification::{Notifier, OpsEvent, OpsPublisher};
use crate::scheduler::{IngestLoop, MatchPipeline};
use crate::utils::http_client::build_client;

/// Ops event channel capacity.
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// How often expired link tokens and old failure rows are purged.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Service container holding all application services.
pub struct ServiceContainer {
    /// Database connection pool.
    pub pool: SqlitePool,
    pub config: AppConfig,
    pub rule_service: Arc<RuleService>,
    pub channel_service: Arc<ChannelService>,
    pub log_service: Arc<LogService>,
    pub notifier: Arc<Notifier>,
    pub pipeline: MatchPipeline,
    /// Operational event publisher (shared between services).
    pub ops: OpsPublisher,
    /// Cancellation token for graceful shutdown.
    cancellation_token: CancellationToken,
}

/// Point-in-time view of the running services.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    /// Channel types whose circuit breaker is open.
    pub open_circuits: Vec<String>,
    pub ops_subscriber_count: usize,
}

impl ServiceContainer {
    /// Wire every service with the production transports.
    pub fn new(pool: SqlitePool, config: AppConfig) -> Result<Self> {
        let client = build_client(Duration::from_secs(config.http_timeout_secs))?;
        let transports = TransportRegistry::with_defaults(
            config.telegram.clone(),
            config.discord.clone(),
            client,
        );
        Self::with_transports(pool, config, transports)
    }

    /// Wire every service around the given transports.
    pub fn with_transports(
        pool: SqlitePool,
        config: AppConfig,
        transports: TransportRegistry,
    ) -> Result<Self> {
        info!("Initializing service container");
        config.validate()?;

        let rules: Arc<dyn RuleRepository> = Arc::new(SqlxRuleRepository::new(pool.clone()));
        let channels: Arc<dyn ChannelRepository> =
            Arc::new(SqlxChannelRepository::new(pool.clone()));
        // A claim must outlive the deadline of the event that holds it.
        let claim_lease = Duration::from_secs(config.pipeline.event_timeout_secs.saturating_add(5));
        let ledger: Arc<dyn DispatchLogRepository> = Arc::new(
            SqlxDispatchLogRepository::with_claim_lease(pool.clone(), claim_lease),
        );

        let ops = OpsPublisher::new(DEFAULT_EVENT_CAPACITY);

        let notifier = Arc::new(Notifier::new(
            transports,
            channels.clone(),
            config.notifier.clone(),
            ops.clone(),
        ));

        let pipeline = MatchPipeline::new(
            rules.clone(),
            channels.clone(),
            ledger.clone(),
            notifier.clone(),
            RuleMatcher::new(config.keyword_field),
            config.pipeline.clone(),
            ops.clone(),
        );

        let rule_service = Arc::new(RuleService::new(rules, ledger.clone()));
        let channel_service = Arc::new(ChannelService::new(
            channels,
            config.telegram.clone(),
            Duration::from_secs(config.link_token_ttl_secs),
        ));
        let log_service = Arc::new(LogService::new(ledger, config.stats_tz()?));

        info!("Service container initialized");

        Ok(Self {
            pool,
            config,
            rule_service,
            channel_service,
            log_service,
            notifier,
            pipeline,
            ops,
            cancellation_token: CancellationToken::new(),
        })
    }

    /// An ingest loop over this container's pipeline, stopped by
    /// [`ServiceContainer::shutdown`].
    pub fn ingest_loop(&self) -> IngestLoop {
        IngestLoop::new(
            self.pipeline.clone(),
            self.config.ingest.clone(),
            self.ops.clone(),
            self.cancellation_token.child_token(),
        )
    }

    pub fn subscribe_ops(&self) -> broadcast::Receiver<OpsEvent> {
        self.ops.subscribe()
    }

    /// Start the hourly purge of expired link tokens and old delivery
    /// failure rows.
    pub fn start_maintenance_tasks(&self) {
        let channel_service = self.channel_service.clone();
        let log_service = self.log_service.clone();
        let retention_days = self.config.delivery_failure_retention_days;
        let cancel_token = self.cancellation_token.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Maintenance task shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        match channel_service.purge_expired_link_tokens().await {
                            Ok(0) => {}
                            Ok(purged) => debug!(purged, "Purged expired link tokens"),
                            Err(e) => warn!(error = %e, "Failed to purge expired link tokens"),
                        }
                        if let Err(e) = log_service.cleanup_delivery_failures(retention_days).await {
                            warn!(error = %e, "Failed to clean up delivery failures");
                        }
                    }
                }
            }
        });
    }

    /// Signal background tasks to stop and close the pool.
    ///
    /// Wait for the ingest loop to drain before calling this.
    pub async fn shutdown(&self) {
        info!("Shutting down services");
        self.cancellation_token.cancel();
        self.pool.close().await;
        info!("Services shut down");
    }

    /// Get a clone of the cancellation token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    pub fn stats(&self) -> ServiceStats {
        let mut open_circuits: Vec<String> = self
            .notifier
            .circuit_states()
            .into_iter()
            .filter_map(|(channel_type, open)| open.then_some(channel_type))
            .collect();
        open_circuits.sort();

        ServiceStats {
            open_circuits,
            ops_subscriber_count: self.ops.subscriber_count(),
        }
    }
}
