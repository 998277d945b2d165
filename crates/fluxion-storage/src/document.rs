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

//! Document store: entity metadata, the sync log and subscription liveness

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use fluxion_core::EntityRegistry;
use fluxion_types::{
    EntityFilter, EntityRecord, StatPeriod, SubscriptionState, SyncKind, SyncLogEntry,
};
use rusqlite::types::Type;
use rusqlite::{OptionalExtension, Row, params};
use std::path::Path;
use tracing::{debug, info};

use crate::database::Database;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS entities (
    entity_id            TEXT PRIMARY KEY,
    friendly_name        TEXT,
    device_class         TEXT,
    unit_of_measurement  TEXT,
    last_state           TEXT,
    tracked              INTEGER NOT NULL DEFAULT 1,
    event_count          INTEGER NOT NULL DEFAULT 0,
    first_seen           TEXT NOT NULL,
    last_seen            TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entities_tracked ON entities(tracked);

CREATE TABLE IF NOT EXISTS sync_log (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    kind            TEXT NOT NULL,
    entity_ids      TEXT NOT NULL,
    records_synced  INTEGER NOT NULL,
    start_time      TEXT NOT NULL,
    end_time        TEXT NOT NULL,
    period          TEXT NOT NULL,
    duration_ms     INTEGER NOT NULL,
    success         INTEGER NOT NULL,
    error           TEXT,
    created_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_log_created ON sync_log(created_at);

CREATE TABLE IF NOT EXISTS subscription_state (
    id          INTEGER PRIMARY KEY CHECK (id = 1),
    state_json  TEXT NOT NULL,
    updated_at  TEXT
);";

const ENTITY_COLUMNS: &str = "entity_id, friendly_name, device_class, unit_of_measurement, \
     last_state, tracked, event_count, first_seen, last_seen";

const SYNC_COLUMNS: &str = "kind, entity_ids, records_synced, start_time, end_time, period, \
     duration_ms, success, error, created_at";

/// SQLite-backed `EntityRegistry`
#[derive(Debug)]
pub struct DocumentStore {
    db: Database,
}

impl DocumentStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            db: Database::open(path, SCHEMA)?,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            db: Database::open_in_memory(SCHEMA)?,
        })
    }

    pub fn path(&self) -> &str {
        self.db.path()
    }

    /// Delete sync log entries older than `retention_days`
    pub fn cleanup_sync_logs(&self, retention_days: u32) -> Result<u64> {
        let cutoff = Utc::now() - TimeDelta::days(i64::from(retention_days));
        let deleted = self
            .db
            .lock()
            .execute("DELETE FROM sync_log WHERE created_at < ?1", params![cutoff])
            .context("Failed to clean up sync log")?;

        if deleted > 0 {
            info!(deleted, retention_days, "🧹 Sync log cleaned up");
        }
        Ok(deleted as u64)
    }

    pub fn entity_count(&self) -> Result<u64> {
        self.db
            .lock()
            .query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))
            .context("Failed to count entities")
    }
}

fn entity_from_row(row: &Row<'_>) -> rusqlite::Result<EntityRecord> {
    Ok(EntityRecord {
        entity_id: row.get(0)?,
        friendly_name: row.get(1)?,
        device_class: row.get(2)?,
        unit_of_measurement: row.get(3)?,
        last_state: row.get(4)?,
        tracked: row.get(5)?,
        event_count: row.get(6)?,
        first_seen: row.get(7)?,
        last_seen: row.get(8)?,
    })
}

fn sync_from_row(row: &Row<'_>) -> rusqlite::Result<SyncLogEntry> {
    let kind: String = row.get(0)?;
    let kind = match kind.as_str() {
        "seed" => SyncKind::Seed,
        _ => SyncKind::Backfill,
    };
    let entity_ids: String = row.get(1)?;
    let entity_ids = serde_json::from_str(&entity_ids)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;
    let period: String = row.get(5)?;
    let period = period
        .parse::<StatPeriod>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, e.into()))?;

    Ok(SyncLogEntry {
        entity_ids,
        records_synced: row.get(2)?,
        start_time: row.get(3)?,
        end_time: row.get(4)?,
        period,
        duration_ms: row.get(6)?,
        success: row.get(7)?,
        error: row.get(8)?,
        created_at: row.get(9)?,
        kind,
    })
}

#[async_trait]
impl EntityRegistry for DocumentStore {
    async fn upsert_entity(&self, record: &EntityRecord) -> Result<()> {
        // `tracked` only applies on insert; concurrent first sightings add up
        self.db
            .lock()
            .execute(
                "INSERT INTO entities (entity_id, friendly_name, device_class, unit_of_measurement,
                                       last_state, tracked, event_count, first_seen, last_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(entity_id) DO UPDATE SET
                    friendly_name = COALESCE(excluded.friendly_name, friendly_name),
                    device_class = COALESCE(excluded.device_class, device_class),
                    unit_of_measurement = COALESCE(excluded.unit_of_measurement, unit_of_measurement),
                    last_state = COALESCE(excluded.last_state, last_state),
                    event_count = event_count + excluded.event_count,
                    last_seen = excluded.last_seen",
                params![
                    record.entity_id,
                    record.friendly_name,
                    record.device_class,
                    record.unit_of_measurement,
                    record.last_state,
                    record.tracked,
                    record.event_count,
                    record.first_seen,
                    record.last_seen,
                ],
            )
            .with_context(|| format!("Failed to upsert entity {}", record.entity_id))?;
        Ok(())
    }

    async fn get_entities(&self, filter: &EntityFilter) -> Result<Vec<EntityRecord>> {
        let conn = self.db.lock();
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {ENTITY_COLUMNS} FROM entities
                 WHERE (?1 IS NULL OR tracked = ?1)
                   AND (?2 IS NULL OR entity_id = ?2
                        OR substr(entity_id, 1, length(?2) + 1) = ?2 || '.')
                 ORDER BY entity_id"
            ))
            .context("Failed to prepare entity query")?;

        let records = stmt
            .query_map(params![filter.tracked, filter.domain], entity_from_row)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read entities")?;
        Ok(records)
    }

    async fn get_entity(&self, entity_id: &str) -> Result<Option<EntityRecord>> {
        self.db
            .lock()
            .query_row(
                &format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE entity_id = ?1"),
                params![entity_id],
                entity_from_row,
            )
            .optional()
            .with_context(|| format!("Failed to read entity {entity_id}"))
    }

    async fn set_entity_tracked(&self, entity_id: &str, tracked: bool) -> Result<bool> {
        let changed = self
            .db
            .lock()
            .execute(
                "UPDATE entities SET tracked = ?2 WHERE entity_id = ?1",
                params![entity_id, tracked],
            )
            .with_context(|| format!("Failed to update tracking of {entity_id}"))?;
        Ok(changed > 0)
    }

    async fn increment_event_count(
        &self,
        entity_id: &str,
        raw_state: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .db
            .lock()
            .execute(
                "UPDATE entities
                 SET event_count = event_count + 1, last_state = ?2, last_seen = ?3
                 WHERE entity_id = ?1",
                params![entity_id, raw_state, seen_at],
            )
            .with_context(|| format!("Failed to count event of {entity_id}"))?;
        Ok(changed > 0)
    }

    async fn log_sync(&self, entry: &SyncLogEntry) -> Result<()> {
        let entity_ids = serde_json::to_string(&entry.entity_ids)?;
        self.db
            .lock()
            .execute(
                &format!(
                    "INSERT INTO sync_log ({SYNC_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    entry.kind.as_str(),
                    entity_ids,
                    entry.records_synced,
                    entry.start_time,
                    entry.end_time,
                    entry.period.as_str(),
                    entry.duration_ms,
                    entry.success,
                    entry.error,
                    entry.created_at,
                ],
            )
            .context("Failed to write sync log entry")?;
        debug!(kind = %entry.kind, success = entry.success, records = entry.records_synced, "Sync logged");
        Ok(())
    }

    async fn get_recent_syncs(&self, limit: usize) -> Result<Vec<SyncLogEntry>> {
        let conn = self.db.lock();
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {SYNC_COLUMNS} FROM sync_log ORDER BY id DESC LIMIT ?1"
            ))
            .context("Failed to prepare sync log query")?;

        let entries = stmt
            .query_map(params![limit], sync_from_row)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read sync log")?;
        Ok(entries)
    }

    async fn save_subscription_state(&self, state: &SubscriptionState) -> Result<()> {
        let json = serde_json::to_string(state)?;
        self.db
            .lock()
            .execute(
                "INSERT INTO subscription_state (id, state_json, updated_at) VALUES (1, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET
                    state_json = excluded.state_json,
                    updated_at = excluded.updated_at",
                params![json, state.updated_at],
            )
            .context("Failed to save subscription state")?;
        Ok(())
    }

    async fn load_subscription_state(&self) -> Result<Option<SubscriptionState>> {
        let json: Option<String> = self
            .db
            .lock()
            .query_row(
                "SELECT state_json FROM subscription_state WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to load subscription state")?;

        json.map(|json| serde_json::from_str(&json).context("Corrupt subscription state"))
            .transpose()
    }

    fn name(&self) -> &str {
        "SQLite document store"
    }
}
