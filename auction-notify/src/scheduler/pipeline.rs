//! Per-event matching and dispatch.
//!
//! For one listing change: fetch the enabled rules of the listing's region,
//! evaluate each in its own task, claim `(rule, listing)` in the ledger and
//! fan the message out to the owner's enabled channels. The ledger claim is
//! the only thing that decides whether a notification goes out.
//!
//! An entry whose fan-out was cut short (deadline, store error) stays
//! pending in the ledger. Replaying the event reclaims it and delivers to
//! the channels that have no outcome yet.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::database::models::{
    DeliveryErrorKind, DeliveryFailureDbModel, DeliveryOutcome, DispatchLogDbModel,
    NotificationChannelDbModel, NotificationRuleDbModel,
};
use crate::database::repositories::{ChannelRepository, DispatchLogRepository, RuleRepository};
use crate::domain::{Listing, ListingChangeEvent, RuleMatcher};
use crate::notification::{ChannelError, NotificationMessage, Notifier, OpsEvent, OpsPublisher};
use crate::{Error, Result};

/// Configuration for the match pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Rules of one event evaluated concurrently.
    pub max_concurrent_rules: usize,
    /// Channel sends of one match in flight concurrently.
    pub max_concurrent_sends: usize,
    /// Deadline for processing one event, in seconds.
    pub event_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_rules: 16,
            max_concurrent_sends: 4,
            event_timeout_secs: 60,
        }
    }
}

/// A store operation that failed while processing an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreFailure {
    pub operation: String,
    pub rule_id: Option<String>,
    pub message: String,
}

/// What happened to one event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventReport {
    pub listing_id: String,
    /// Enabled rules in the listing's region.
    pub candidates: usize,
    /// Rules whose predicate held.
    pub matched: usize,
    /// New ledger entries created by this run.
    pub recorded: usize,
    /// Matches already in the ledger and dispatched, or being dispatched
    /// by someone else.
    pub duplicates: usize,
    /// Pending ledger entries picked up again and delivered.
    pub resumed: usize,
    /// Matched rules deleted or disabled before the claim.
    pub skipped: usize,
    pub delivered: usize,
    pub failed_deliveries: usize,
    /// Channel sends cut off by the deadline; each has an `aborted` failure row.
    pub aborted: usize,
    pub store_errors: Vec<StoreFailure>,
    /// Rule or send tasks that panicked or were cancelled.
    pub task_failures: usize,
    pub timed_out: bool,
}

impl EventReport {
    fn new(listing_id: &str) -> Self {
        Self {
            listing_id: listing_id.to_string(),
            ..Default::default()
        }
    }

    /// Whether replaying the event could make progress.
    pub fn needs_replay(&self) -> bool {
        self.timed_out || self.task_failures > 0 || !self.store_errors.is_empty()
    }

    fn absorb(&mut self, outcome: RuleOutcome) {
        match outcome {
            RuleOutcome::NoMatch => {}
            RuleOutcome::Skipped => {
                self.matched += 1;
                self.skipped += 1;
            }
            RuleOutcome::Duplicate => {
                self.matched += 1;
                self.duplicates += 1;
            }
            RuleOutcome::Recorded(delivery) => {
                self.matched += 1;
                self.recorded += 1;
                self.absorb_delivery(delivery);
            }
            RuleOutcome::Resumed(delivery) => {
                self.matched += 1;
                self.resumed += 1;
                self.absorb_delivery(delivery);
            }
            RuleOutcome::StoreError(failure) => self.store_errors.push(failure),
        }
    }

    fn absorb_delivery(&mut self, delivery: DeliverySummary) {
        self.delivered += delivery.delivered;
        self.failed_deliveries += delivery.failed;
        self.task_failures += delivery.task_failures;
        self.store_errors.extend(delivery.store_errors);
    }
}

#[derive(Debug, Default)]
struct DeliverySummary {
    delivered: usize,
    failed: usize,
    task_failures: usize,
    store_errors: Vec<StoreFailure>,
}

#[derive(Debug)]
enum RuleOutcome {
    NoMatch,
    Skipped,
    Duplicate,
    Recorded(DeliverySummary),
    Resumed(DeliverySummary),
    StoreError(StoreFailure),
}

/// Ledger entries an event currently holds a delivery claim on, by id.
type Claims = Arc<DashMap<i64, DispatchLogDbModel>>;

/// Matches listing changes against rules and dispatches notifications.
#[derive(Clone)]
pub struct MatchPipeline {
    rules: Arc<dyn RuleRepository>,
    channels: Arc<dyn ChannelRepository>,
    ledger: Arc<dyn DispatchLogRepository>,
    notifier: Arc<Notifier>,
    matcher: RuleMatcher,
    config: PipelineConfig,
    ops: OpsPublisher,
}

impl MatchPipeline {
    pub fn new(
        rules: Arc<dyn RuleRepository>,
        channels: Arc<dyn ChannelRepository>,
        ledger: Arc<dyn DispatchLogRepository>,
        notifier: Arc<Notifier>,
        matcher: RuleMatcher,
        config: PipelineConfig,
        ops: OpsPublisher,
    ) -> Self {
        Self {
            rules,
            channels,
            ledger,
            notifier,
            matcher,
            config,
            ops,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Process one listing change.
    ///
    /// Errors only when the candidate rules cannot be fetched. Per-rule store
    /// errors and the deadline are reported in the returned [`EventReport`].
    pub async fn process_event(&self, event: &ListingChangeEvent) -> Result<EventReport> {
        let mut report = EventReport::new(&event.listing_id);
        let claims: Claims = Arc::new(DashMap::new());
        let timeout = Duration::from_secs(self.config.event_timeout_secs);

        match tokio::time::timeout(timeout, self.run_event(event, &claims, &mut report)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                // Dropping the run future drops its JoinSet, aborting
                // in-flight rule tasks. Ledger entries already written stay.
                report.timed_out = true;
                warn!(
                    listing_id = %event.listing_id,
                    timeout_secs = self.config.event_timeout_secs,
                    "event processing timed out"
                );
                self.ops.publish(OpsEvent::EventTimedOut {
                    listing_id: event.listing_id.clone(),
                    timeout_secs: self.config.event_timeout_secs,
                    timestamp: Utc::now(),
                });
                self.abandon_claims(&claims, &mut report).await;
            }
        }

        debug!(
            listing_id = %report.listing_id,
            candidates = report.candidates,
            matched = report.matched,
            recorded = report.recorded,
            resumed = report.resumed,
            duplicates = report.duplicates,
            delivered = report.delivered,
            failed = report.failed_deliveries,
            store_errors = report.store_errors.len(),
            "event processed"
        );
        Ok(report)
    }

    async fn run_event(
        &self,
        event: &ListingChangeEvent,
        claims: &Claims,
        report: &mut EventReport,
    ) -> Result<()> {
        let listing = Arc::new(event.listing.clone());

        let candidates = self
            .rules
            .list_enabled_for_region(&listing.sido_code, &listing.sigu_code)
            .await
            .inspect_err(|e| {
                error!(listing_id = %listing.id, error = %e, "failed to fetch candidate rules");
                self.ops.publish(OpsEvent::StoreError {
                    operation: "list_enabled_for_region".to_string(),
                    listing_id: listing.id.clone(),
                    rule_id: None,
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
            })?;
        report.candidates = candidates.len();

        if candidates.is_empty() {
            return Ok(());
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_rules.max(1)));
        let mut tasks = JoinSet::new();

        for rule in candidates {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| Error::Other(format!("rule semaphore closed: {e}")))?;
            let this = self.clone();
            let listing = listing.clone();
            let claims = claims.clone();
            tasks.spawn(async move {
                let _permit = permit;
                this.process_rule(rule, &listing, &claims).await
            });

            // Keep the report current so a timeout still reports finished rules.
            while let Some(joined) = tasks.try_join_next() {
                absorb_joined(report, joined);
            }
        }

        while let Some(joined) = tasks.join_next().await {
            absorb_joined(report, joined);
        }
        Ok(())
    }

    async fn process_rule(
        &self,
        rule: NotificationRuleDbModel,
        listing: &Listing,
        claims: &Claims,
    ) -> RuleOutcome {
        if let Some(mismatch) = self.matcher.explain(&rule, listing) {
            debug!(rule_id = %rule.id, listing_id = %listing.id, %mismatch, "rule did not match");
            return RuleOutcome::NoMatch;
        }

        // The rule may have been edited, disabled or deleted since the
        // candidate fetch; act on its current state.
        let rule = match self.rules.get(&rule.id).await {
            Ok(current) if !current.enabled => {
                debug!(rule_id = %current.id, "rule disabled mid-cycle, skipping");
                return RuleOutcome::Skipped;
            }
            Ok(current) => current,
            Err(Error::NotFound { .. }) => {
                debug!(rule_id = %rule.id, "rule deleted mid-cycle, skipping");
                return RuleOutcome::Skipped;
            }
            Err(e) => {
                return RuleOutcome::StoreError(self.store_failure(
                    "get_rule",
                    Some(&rule.id),
                    &listing.id,
                    &e,
                ));
            }
        };
        if !self.matcher.matches(&rule, listing) {
            return RuleOutcome::NoMatch;
        }

        let message = NotificationMessage::for_match(&rule, listing);
        let (is_new, entry) = match self
            .ledger
            .insert_if_absent(&rule.id, &listing.id, &rule.user_id, &message.to_plain_text())
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                return RuleOutcome::StoreError(self.store_failure(
                    "insert_if_absent",
                    Some(&rule.id),
                    &listing.id,
                    &e,
                ));
            }
        };

        let entry = if is_new {
            info!(
                rule_id = %rule.id,
                listing_id = %listing.id,
                user_id = %rule.user_id,
                dispatch_log_id = entry.id,
                "new match recorded"
            );
            entry
        } else if entry.is_dispatched() {
            debug!(rule_id = %rule.id, listing_id = %listing.id, "already notified");
            return RuleOutcome::Duplicate;
        } else {
            match self.ledger.reclaim(entry.id).await {
                Ok(Some(entry)) => {
                    info!(
                        rule_id = %rule.id,
                        listing_id = %listing.id,
                        dispatch_log_id = entry.id,
                        "resuming undelivered match"
                    );
                    entry
                }
                Ok(None) => {
                    debug!(
                        rule_id = %rule.id,
                        listing_id = %listing.id,
                        "match is being delivered by another task"
                    );
                    return RuleOutcome::Duplicate;
                }
                Err(e) => {
                    return RuleOutcome::StoreError(self.store_failure(
                        "reclaim",
                        Some(&rule.id),
                        &listing.id,
                        &e,
                    ));
                }
            }
        };

        claims.insert(entry.id, entry.clone());
        let summary = self.dispatch(entry.clone(), message).await;
        claims.remove(&entry.id);

        if is_new {
            RuleOutcome::Recorded(summary)
        } else {
            RuleOutcome::Resumed(summary)
        }
    }

    /// Deliver a claimed entry to the owner's channels that have no outcome
    /// yet, then settle the claim.
    async fn dispatch(
        &self,
        entry: DispatchLogDbModel,
        message: NotificationMessage,
    ) -> DeliverySummary {
        let entry = Arc::new(entry);
        let mut summary = match self.pending_channels(&entry).await {
            Ok(channels) if channels.is_empty() => DeliverySummary::default(),
            Ok(channels) => self.deliver(entry.clone(), Arc::new(message), channels).await,
            Err(failure) => DeliverySummary {
                store_errors: vec![failure],
                ..Default::default()
            },
        };
        self.settle(&entry, &mut summary).await;
        summary
    }

    async fn pending_channels(
        &self,
        entry: &DispatchLogDbModel,
    ) -> std::result::Result<Vec<NotificationChannelDbModel>, StoreFailure> {
        let channels = self
            .channels
            .list_enabled_for_user(&entry.user_id)
            .await
            .map_err(|e| {
                self.store_failure(
                    "list_enabled_channels",
                    Some(&entry.rule_id),
                    &entry.listing_id,
                    &e,
                )
            })?;
        if channels.is_empty() {
            info!(user_id = %entry.user_id, "no enabled channels; match recorded only");
            return Ok(channels);
        }

        let done = self
            .ledger
            .completed_channels(entry.id)
            .await
            .map_err(|e| {
                self.store_failure(
                    "completed_channels",
                    Some(&entry.rule_id),
                    &entry.listing_id,
                    &e,
                )
            })?;
        Ok(channels
            .into_iter()
            .filter(|channel| !done.contains(&channel.id))
            .collect())
    }

    /// Mark the entry dispatched when every channel has an outcome,
    /// otherwise release it for a replay.
    async fn settle(&self, entry: &DispatchLogDbModel, summary: &mut DeliverySummary) {
        if summary.store_errors.is_empty() && summary.task_failures == 0 {
            match self.ledger.mark_dispatched(entry.id).await {
                Ok(()) => return,
                Err(e) => summary.store_errors.push(self.store_failure(
                    "mark_dispatched",
                    Some(&entry.rule_id),
                    &entry.listing_id,
                    &e,
                )),
            }
        }

        warn!(
            dispatch_log_id = entry.id,
            rule_id = %entry.rule_id,
            listing_id = %entry.listing_id,
            "delivery incomplete, entry left pending"
        );
        if let Err(e) = self.ledger.release_claim(entry.id).await {
            summary.store_errors.push(self.store_failure(
                "release_claim",
                Some(&entry.rule_id),
                &entry.listing_id,
                &e,
            ));
        }
    }

    /// Release claims cut short by the deadline and record an `aborted`
    /// failure for every channel still waiting on them.
    async fn abandon_claims(&self, claims: &Claims, report: &mut EventReport) {
        let pending: Vec<DispatchLogDbModel> =
            claims.iter().map(|claim| claim.value().clone()).collect();
        claims.clear();

        let reason = format!(
            "event processing timed out after {}s",
            self.config.event_timeout_secs
        );
        for entry in pending {
            if let Err(e) = self.ledger.release_claim(entry.id).await {
                report.store_errors.push(self.store_failure(
                    "release_claim",
                    Some(&entry.rule_id),
                    &entry.listing_id,
                    &e,
                ));
            }

            let channels = match self.pending_channels(&entry).await {
                Ok(channels) => channels,
                Err(failure) => {
                    report.store_errors.push(failure);
                    continue;
                }
            };
            for channel in &channels {
                report.aborted += 1;
                let failure = self
                    .record_delivery_failure(&entry, channel, DeliveryErrorKind::Aborted, &reason, 0)
                    .await;
                if let Some(failure) = failure {
                    report.store_errors.push(failure);
                }
            }
        }
    }

    /// Send to every channel; one channel's failure never affects another.
    async fn deliver(
        &self,
        entry: Arc<DispatchLogDbModel>,
        message: Arc<NotificationMessage>,
        channels: Vec<NotificationChannelDbModel>,
    ) -> DeliverySummary {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_sends.max(1)));
        let mut sends = JoinSet::new();

        for channel in channels {
            let semaphore = semaphore.clone();
            let notifier = self.notifier.clone();
            let message = message.clone();
            sends.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => notifier.send(&channel, &message).await,
                    Err(_) => Err(ChannelError::Transient {
                        attempts: 0,
                        message: "send semaphore closed".to_string(),
                    }),
                };
                (channel, result)
            });
        }

        let mut summary = DeliverySummary::default();
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((channel, Ok(receipt))) => {
                    debug!(
                        channel_id = %receipt.channel_id,
                        channel_type = %receipt.channel_type,
                        attempts = receipt.attempts,
                        "notification delivered"
                    );
                    summary.delivered += 1;
                    summary.store_errors.extend(
                        self.record_outcome(
                            &entry,
                            &channel,
                            DeliveryOutcome::Delivered,
                            receipt.attempts,
                        )
                        .await,
                    );
                }
                Ok((channel, Err(err))) => {
                    summary.failed += 1;
                    let failure = self
                        .record_delivery_failure(
                            &entry,
                            &channel,
                            err.kind(),
                            &err.to_string(),
                            err.attempts(),
                        )
                        .await;
                    // Without its failure row the channel stays pending.
                    let failure = match failure {
                        Some(failure) => Some(failure),
                        None => {
                            self.record_outcome(
                                &entry,
                                &channel,
                                DeliveryOutcome::Failed,
                                err.attempts(),
                            )
                            .await
                        }
                    };
                    summary.store_errors.extend(failure);
                }
                Err(join_err) => {
                    error!(error = %join_err, "send task failed");
                    summary.failed += 1;
                    summary.task_failures += 1;
                }
            }
        }
        summary
    }

    async fn record_outcome(
        &self,
        entry: &DispatchLogDbModel,
        channel: &NotificationChannelDbModel,
        outcome: DeliveryOutcome,
        attempts: u32,
    ) -> Option<StoreFailure> {
        self.ledger
            .record_channel_outcome(entry.id, &channel.id, &channel.channel_type, outcome, attempts)
            .await
            .err()
            .map(|e| {
                self.store_failure(
                    "record_channel_outcome",
                    Some(&entry.rule_id),
                    &entry.listing_id,
                    &e,
                )
            })
    }

    /// Log, publish and persist a failed delivery. Returns a store failure
    /// when the failure row itself could not be written.
    async fn record_delivery_failure(
        &self,
        entry: &DispatchLogDbModel,
        channel: &NotificationChannelDbModel,
        kind: DeliveryErrorKind,
        error: &str,
        attempts: u32,
    ) -> Option<StoreFailure> {
        warn!(
            rule_id = %entry.rule_id,
            listing_id = %entry.listing_id,
            channel_id = %channel.id,
            channel_type = %channel.channel_type,
            %kind,
            attempts,
            error,
            "delivery failed"
        );
        self.ops.publish(OpsEvent::DeliveryFailed {
            rule_id: entry.rule_id.clone(),
            listing_id: entry.listing_id.clone(),
            user_id: entry.user_id.clone(),
            channel_id: channel.id.clone(),
            channel_type: channel.channel_type.clone(),
            kind,
            attempts,
            error: error.to_string(),
            timestamp: Utc::now(),
        });

        let failure = DeliveryFailureDbModel::new(
            entry,
            &channel.id,
            &channel.channel_type,
            kind,
            error,
            attempts,
        );
        match self.ledger.record_delivery_failure(&failure).await {
            Ok(_) => None,
            Err(e) => Some(self.store_failure(
                "record_delivery_failure",
                Some(&entry.rule_id),
                &entry.listing_id,
                &e,
            )),
        }
    }

    fn store_failure(
        &self,
        operation: &str,
        rule_id: Option<&str>,
        listing_id: &str,
        err: &Error,
    ) -> StoreFailure {
        error!(operation, rule_id, listing_id, error = %err, "store error");
        self.ops.publish(OpsEvent::StoreError {
            operation: operation.to_string(),
            listing_id: listing_id.to_string(),
            rule_id: rule_id.map(str::to_string),
            error: err.to_string(),
            timestamp: Utc::now(),
        });
        StoreFailure {
            operation: operation.to_string(),
            rule_id: rule_id.map(str::to_string),
            message: err.to_string(),
        }
    }
}

fn absorb_joined(
    report: &mut EventReport,
    joined: std::result::Result<RuleOutcome, tokio::task::JoinError>,
) {
    match joined {
        Ok(outcome) => report.absorb(outcome),
        Err(e) => {
            error!(listing_id = %report.listing_id, error = %e, "rule task failed");
            report.task_failures += 1;
        }
    }
}
