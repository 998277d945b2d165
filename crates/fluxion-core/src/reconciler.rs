// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Reconciliation between the live event stream and the hub's statistics
//!
//! Three jobs keep the stores consistent with the hub:
//! - the heartbeat detects a silent feed and reconnects,
//! - the hourly backfill fills statistic gaps per tracked entity,
//! - cold-start seeding discovers entities and pulls a long window at once.
//!
//! Every job catches its own failures. Outcomes land in the sync log and the
//! error counter; nothing is thrown to the scheduler.

use chrono::{DateTime, TimeDelta, Utc};
use fluxion_types::{
    EnergyStatistic, EntityFilter, EntityRecord, StatPeriod, SyncKind, SyncLogEntry, SyncWindow,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::{RecorderConfig, lookback_start, to_time_delta};
use crate::errors::RecorderError;
use crate::live::LiveFeed;
use crate::stats::{RecorderStats, TrackedEntities};
use crate::traits::Services;
use crate::transform::is_energy_state;

/// Result of one heartbeat tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatOutcome {
    /// Time since the last sign of life, if there was any
    pub idle: Option<TimeDelta>,
    pub reconnect_attempted: bool,
    pub resubscribed: bool,
    pub state_persisted: bool,
}

/// Result of one backfill run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub entities_checked: usize,
    /// Entities that returned at least one statistics row
    pub entities_updated: Vec<String>,
    pub failed_entities: Vec<String>,
    pub records_written: usize,
    pub sync_logged: bool,
}

/// Result of a cold-start seed or a reseed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub discovered: usize,
    pub tracked: usize,
    pub records_written: usize,
    pub success: bool,
}

/// Result of entity rediscovery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Energy entities the hub reported
    pub discovered: usize,
    /// Tracked entities after the registry was refreshed
    pub tracked: usize,
}

#[derive(Debug)]
pub struct Reconciler {
    services: Services,
    config: RecorderConfig,
    stats: Arc<RecorderStats>,
    tracked: Arc<TrackedEntities>,
    live: Arc<LiveFeed>,
}

impl Reconciler {
    pub fn new(
        services: Services,
        config: RecorderConfig,
        stats: Arc<RecorderStats>,
        tracked: Arc<TrackedEntities>,
        live: Arc<LiveFeed>,
    ) -> Self {
        Self {
            services,
            config,
            stats,
            tracked,
            live,
        }
    }

    // ============= Heartbeat =============

    /// Check the live feed for silence and persist the liveness marker
    ///
    /// A feed idle for longer than the threshold gets exactly one reconnect
    /// followed by a fresh subscription. A feed whose subscription died
    /// without going idle (the session reconnected on its own) is only
    /// resubscribed.
    pub async fn execute_heartbeat(&self) -> HeartbeatOutcome {
        let now = self.services.clock.now();
        let idle = self.stats.last_activity().map(|at| now - at);
        let idle_threshold = to_time_delta(self.config.idle_threshold);

        let mut outcome = HeartbeatOutcome {
            idle,
            ..HeartbeatOutcome::default()
        };

        if idle.is_some_and(|idle| idle > idle_threshold) {
            warn!(
                idle_secs = idle.map_or(0, |i| i.num_seconds()),
                "💔 Live feed idle beyond threshold, reconnecting"
            );
            outcome.reconnect_attempted = true;

            match self.services.hub.reconnect().await {
                Ok(()) => outcome.resubscribed = self.resubscribe(now).await,
                Err(e) => {
                    self.stats.record_error();
                    error!(error = %e, "Heartbeat reconnect failed");
                }
            }
        } else if !self.live.is_active().await {
            debug!("Subscription inactive, resubscribing");
            outcome.resubscribed = self.resubscribe(now).await;
        }

        let state = self
            .stats
            .subscription_state(self.live.is_active().await, now);
        match self.services.registry.save_subscription_state(&state).await {
            Ok(()) => outcome.state_persisted = true,
            Err(e) => warn!(error = %e, "Failed to persist subscription state"),
        }

        outcome
    }

    pub(crate) async fn resubscribe(&self, now: DateTime<Utc>) -> bool {
        match self.live.ensure_subscribed().await {
            Ok(new_subscription) => {
                if new_subscription {
                    self.stats.set_subscribed_at(now);
                }
                new_subscription
            }
            Err(e) => {
                self.stats.record_error();
                error!(error = %e, "Resubscribe failed");
                false
            }
        }
    }

    // ============= Backfill =============

    /// Pull hourly statistics for every tracked entity since its latest
    /// stored bucket and write whatever came back in one batch
    pub async fn run_backfill(&self) -> BackfillReport {
        let started_at = self.services.clock.now();
        let entity_ids = self.tracked.snapshot();
        let mut report = BackfillReport {
            entities_checked: entity_ids.len(),
            ..BackfillReport::default()
        };

        if entity_ids.is_empty() {
            debug!("No tracked entities, skipping backfill");
            return report;
        }

        info!(entities = entity_ids.len(), "🔄 Starting statistics backfill");

        let default_start = lookback_start(started_at, self.config.backfill_lookback);
        let mut window_start = started_at;
        let mut rows: Vec<EnergyStatistic> = Vec::new();

        for entity_id in &entity_ids {
            let start = match self
                .services
                .sink
                .get_latest_stats_time(entity_id, StatPeriod::Hour)
                .await
            {
                Ok(latest) => latest.unwrap_or(default_start),
                Err(e) => {
                    let err = RecorderError::reconciliation(entity_id, &e);
                    warn!(error = %err, "Latest statistics lookup failed");
                    report.failed_entities.push(entity_id.clone());
                    continue;
                }
            };
            window_start = window_start.min(start);

            match self
                .services
                .hub
                .statistics_during_period(
                    std::slice::from_ref(entity_id),
                    start,
                    started_at,
                    StatPeriod::Hour,
                )
                .await
            {
                Ok(mut stats) => {
                    let entity_rows = stats.remove(entity_id).unwrap_or_default();
                    if entity_rows.is_empty() {
                        continue;
                    }
                    debug!(entity_id = %entity_id, rows = entity_rows.len(), "Statistics received");
                    rows.extend(
                        entity_rows
                            .iter()
                            .map(|row| EnergyStatistic::from_row(entity_id, StatPeriod::Hour, row)),
                    );
                    report.entities_updated.push(entity_id.clone());
                }
                Err(e) => {
                    let err = RecorderError::reconciliation(entity_id, &e);
                    warn!(error = %err, "Statistics query failed");
                    report.failed_entities.push(entity_id.clone());
                }
            }
        }

        let window = SyncWindow {
            kind: SyncKind::Backfill,
            period: StatPeriod::Hour,
            start_time: window_start,
            end_time: started_at,
            started_at,
        };

        if rows.is_empty() {
            if report.failed_entities.is_empty() {
                debug!("Backfill found nothing new");
            } else {
                let entry = window.failure(
                    report.failed_entities.clone(),
                    format!(
                        "statistics unavailable for {} entities",
                        report.failed_entities.len()
                    ),
                    self.services.clock.now(),
                );
                report.sync_logged = self.log_sync_best_effort(&entry).await;
            }
            return report;
        }

        if !report.failed_entities.is_empty() {
            warn!(
                failed = ?report.failed_entities,
                "Backfill continued past failed entities"
            );
        }

        let written = match self.services.sink.write_stats(&rows).await {
            Ok(written) => written,
            Err(e) => {
                self.stats.record_error();
                error!(error = %e, "Backfill statistics write failed");
                let entry = window.failure(
                    report.entities_updated.clone(),
                    RecorderError::sink_write(&e).to_string(),
                    self.services.clock.now(),
                );
                report.sync_logged = self.log_sync_best_effort(&entry).await;
                return report;
            }
        };
        report.records_written = written;

        let entry = window.success(
            report.entities_updated.clone(),
            written as u64,
            self.services.clock.now(),
        );
        match self.services.registry.log_sync(&entry).await {
            Ok(()) => report.sync_logged = true,
            Err(e) => {
                self.stats.record_error();
                error!(error = %e, "Failed to record backfill in sync log");
                let entry = window.failure(
                    report.entities_updated.clone(),
                    RecorderError::registry(&e).to_string(),
                    self.services.clock.now(),
                );
                report.sync_logged = self.log_sync_best_effort(&entry).await;
            }
        }

        info!(
            entities = report.entities_updated.len(),
            records = written,
            "✅ Backfill complete"
        );
        report
    }

    // ============= Seeding =============

    /// Discover energy entities and pull a long statistics window for all of
    /// them in one request
    pub async fn seed(&self) -> SeedReport {
        let started_at = self.services.clock.now();
        let window = SyncWindow {
            kind: SyncKind::Seed,
            period: StatPeriod::Hour,
            start_time: lookback_start(started_at, self.config.seed_lookback),
            end_time: started_at,
            started_at,
        };
        let mut report = SeedReport::default();

        info!("🌱 Seeding statistics from the hub");

        let (discovered, entity_ids) = match self.discover(started_at).await {
            Ok(found) => found,
            Err(e) => {
                self.stats.record_error();
                error!(error = %e, "Entity discovery failed");
                let entry = window.failure(
                    Vec::new(),
                    format!("entity discovery failed: {e:#}"),
                    self.services.clock.now(),
                );
                self.log_sync_best_effort(&entry).await;
                return report;
            }
        };
        report.discovered = discovered;
        report.tracked = entity_ids.len();

        if entity_ids.is_empty() {
            info!("No tracked energy entities to seed");
            let entry = window.success(Vec::new(), 0, self.services.clock.now());
            report.success = self.log_sync_best_effort(&entry).await;
            return report;
        }

        let stats = match self
            .services
            .hub
            .statistics_during_period(
                &entity_ids,
                window.start_time,
                window.end_time,
                StatPeriod::Hour,
            )
            .await
        {
            Ok(stats) => stats,
            Err(e) => {
                self.stats.record_error();
                error!(error = %e, "Seed statistics query failed");
                let entry = window.failure(
                    entity_ids,
                    RecorderError::hub(&e).to_string(),
                    self.services.clock.now(),
                );
                self.log_sync_best_effort(&entry).await;
                return report;
            }
        };

        let rows = collect_rows(&entity_ids, &stats);
        if !rows.is_empty() {
            match self.services.sink.write_stats(&rows).await {
                Ok(written) => report.records_written = written,
                Err(e) => {
                    self.stats.record_error();
                    error!(error = %e, "Seed statistics write failed");
                    let entry = window.failure(
                        entity_ids,
                        RecorderError::sink_write(&e).to_string(),
                        self.services.clock.now(),
                    );
                    self.log_sync_best_effort(&entry).await;
                    return report;
                }
            }
        }

        let entry = window.success(
            entity_ids,
            report.records_written as u64,
            self.services.clock.now(),
        );
        match self.services.registry.log_sync(&entry).await {
            Ok(()) => report.success = true,
            Err(e) => {
                self.stats.record_error();
                error!(error = %e, "Failed to record seed in sync log");
            }
        }

        info!(
            entities = report.tracked,
            records = report.records_written,
            "✅ Seeding complete"
        );
        report
    }

    /// Refresh entity metadata from the hub without pulling statistics
    pub async fn rediscover(&self) -> Result<DiscoveryReport, RecorderError> {
        let now = self.services.clock.now();
        let (discovered, tracked) = self.discover(now).await.map_err(|e| {
            self.stats.record_error();
            RecorderError::hub(&e)
        })?;

        info!(discovered, tracked = tracked.len(), "🔍 Entity rediscovery complete");
        Ok(DiscoveryReport {
            discovered,
            tracked: tracked.len(),
        })
    }

    /// Upsert every energy entity the hub reports (new ones tracked) and
    /// refresh the tracked set from the registry.
    /// Returns the number discovered and the tracked ids among them.
    async fn discover(&self, now: DateTime<Utc>) -> anyhow::Result<(usize, Vec<String>)> {
        let states = self.services.hub.get_states().await?;
        let energy: Vec<_> = states.iter().filter(|s| is_energy_state(s)).collect();
        debug!(
            total = states.len(),
            energy = energy.len(),
            "Discovered hub entities"
        );

        let mut upserted = Vec::with_capacity(energy.len());
        for state in &energy {
            let record = EntityRecord::from_hub_state(state, true, now);
            match self.services.registry.upsert_entity(&record).await {
                Ok(()) => upserted.push(record.entity_id),
                Err(e) => {
                    self.stats.record_error();
                    warn!(entity_id = %record.entity_id, error = %e, "Failed to upsert entity");
                }
            }
        }

        // Entities the user untracked stay untracked
        let tracked_ids = match self
            .services
            .registry
            .get_entities(&EntityFilter::tracked())
            .await
        {
            Ok(records) => {
                let ids: Vec<String> = records.into_iter().map(|r| r.entity_id).collect();
                self.tracked.replace(ids.iter().cloned());
                ids
            }
            Err(e) => {
                warn!(error = %e, "Failed to reload tracked entities, using discovered set");
                for id in &upserted {
                    self.tracked.insert(id);
                }
                upserted.clone()
            }
        };

        let mut tracked: Vec<String> = upserted
            .into_iter()
            .filter(|id| tracked_ids.contains(id))
            .collect();
        tracked.sort();
        Ok((energy.len(), tracked))
    }

    /// Record a sync log entry, logging instead of failing
    async fn log_sync_best_effort(&self, entry: &SyncLogEntry) -> bool {
        match self.services.registry.log_sync(entry).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, success = entry.success, "Failed to write sync log entry");
                false
            }
        }
    }
}

/// Flatten per-entity statistics in entity order
fn collect_rows(
    entity_ids: &[String],
    stats: &HashMap<String, Vec<fluxion_types::StatisticsRow>>,
) -> Vec<EnergyStatistic> {
    entity_ids
        .iter()
        .filter_map(|id| stats.get(id).map(|rows| (id, rows)))
        .flat_map(|(id, rows)| {
            rows.iter()
                .map(move |row| EnergyStatistic::from_row(id, StatPeriod::Hour, row))
        })
        .collect()
}
