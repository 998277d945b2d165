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

//! Time-series store: raw readings and hub statistics
//!
//! Reading timestamps are kept as integer nanoseconds, statistic bucket
//! starts as integer seconds. Statistics are keyed on
//! `(entity_id, period, start)` and the last write wins.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fluxion_core::TimeSeriesSink;
use fluxion_types::{EnergyReading, EnergyStatistic, ReadingAggregate, StatPeriod};
use rusqlite::types::Type;
use rusqlite::{Row, params};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

use crate::database::Database;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS readings (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id       TEXT NOT NULL,
    state           REAL NOT NULL,
    previous_state  REAL,
    attributes      TEXT,
    ts_nanos        INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_readings_entity_ts ON readings(entity_id, ts_nanos);

CREATE TABLE IF NOT EXISTS statistics (
    entity_id  TEXT NOT NULL,
    period     TEXT NOT NULL,
    start_ts   INTEGER NOT NULL,
    state      REAL,
    sum        REAL,
    mean       REAL,
    min        REAL,
    max        REAL,
    PRIMARY KEY (entity_id, period, start_ts)
);";

/// SQLite-backed `TimeSeriesSink`
#[derive(Debug)]
pub struct TimeSeriesStore {
    db: Database,
}

impl TimeSeriesStore {
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
}

fn nanos(ts: DateTime<Utc>) -> Result<i64> {
    ts.timestamp_nanos_opt()
        .with_context(|| format!("Timestamp outside the storable range: {ts}"))
}

fn from_seconds(column: usize, secs: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or(rusqlite::Error::IntegralValueOutOfRange(
        column, secs,
    ))
}

fn reading_from_row(row: &Row<'_>) -> rusqlite::Result<EnergyReading> {
    let attributes: Option<String> = row.get(3)?;
    let attributes = attributes
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;

    Ok(EnergyReading {
        entity_id: row.get(0)?,
        state: row.get(1)?,
        previous_state: row.get(2)?,
        attributes,
        timestamp: DateTime::from_timestamp_nanos(row.get(4)?),
    })
}

fn statistic_from_row(row: &Row<'_>) -> rusqlite::Result<EnergyStatistic> {
    let period: String = row.get(1)?;
    let period = period
        .parse::<StatPeriod>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, e.into()))?;

    Ok(EnergyStatistic {
        entity_id: row.get(0)?,
        period,
        start: from_seconds(2, row.get(2)?)?,
        state: row.get(3)?,
        sum: row.get(4)?,
        mean: row.get(5)?,
        min: row.get(6)?,
        max: row.get(7)?,
    })
}

/// Running fold of the readings inside one bucket
#[derive(Debug)]
struct Bucket {
    count: u64,
    total: f64,
    min: f64,
    max: f64,
    last: f64,
}

impl Bucket {
    fn new(value: f64) -> Self {
        Self {
            count: 1,
            total: value,
            min: value,
            max: value,
            last: value,
        }
    }

    fn add(&mut self, value: f64) {
        self.count += 1;
        self.total += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.last = value;
    }

    #[expect(
        clippy::cast_precision_loss,
        reason = "bucket sizes stay far below 2^52"
    )]
    fn mean(&self) -> f64 {
        self.total / self.count as f64
    }
}

#[async_trait]
impl TimeSeriesSink for TimeSeriesStore {
    async fn write_readings(&self, readings: &[EnergyReading]) -> Result<usize> {
        if readings.is_empty() {
            return Ok(0);
        }

        let mut conn = self.db.lock();
        let tx = conn.transaction().context("Failed to begin reading batch")?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO readings (entity_id, state, previous_state, attributes, ts_nanos)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for reading in readings {
                let attributes = reading
                    .attributes
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                stmt.execute(params![
                    reading.entity_id,
                    reading.state,
                    reading.previous_state,
                    attributes,
                    nanos(reading.timestamp)?,
                ])
                .with_context(|| format!("Failed to write reading of {}", reading.entity_id))?;
            }
        }
        tx.commit().context("Failed to commit reading batch")?;

        Ok(readings.len())
    }

    async fn write_stats(&self, stats: &[EnergyStatistic]) -> Result<usize> {
        if stats.is_empty() {
            return Ok(0);
        }

        let mut conn = self.db.lock();
        let tx = conn
            .transaction()
            .context("Failed to begin statistics batch")?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO statistics (entity_id, period, start_ts, state, sum, mean, min, max)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(entity_id, period, start_ts) DO UPDATE SET
                    state = excluded.state,
                    sum = excluded.sum,
                    mean = excluded.mean,
                    min = excluded.min,
                    max = excluded.max",
            )?;
            for stat in stats {
                stmt.execute(params![
                    stat.entity_id,
                    stat.period.as_str(),
                    stat.start.timestamp(),
                    stat.state,
                    stat.sum,
                    stat.mean,
                    stat.min,
                    stat.max,
                ])
                .with_context(|| format!("Failed to write statistic of {}", stat.entity_id))?;
            }
        }
        tx.commit().context("Failed to commit statistics batch")?;

        debug!(rows = stats.len(), "Statistics batch written");
        Ok(stats.len())
    }

    async fn get_latest_stats_time(
        &self,
        entity_id: &str,
        period: StatPeriod,
    ) -> Result<Option<DateTime<Utc>>> {
        let latest: Option<i64> = self
            .db
            .lock()
            .query_row(
                "SELECT MAX(start_ts) FROM statistics WHERE entity_id = ?1 AND period = ?2",
                params![entity_id, period.as_str()],
                |row| row.get(0),
            )
            .with_context(|| format!("Failed to look up latest statistic of {entity_id}"))?;

        latest
            .map(|secs| {
                DateTime::from_timestamp(secs, 0)
                    .with_context(|| format!("Corrupt statistic start for {entity_id}: {secs}"))
            })
            .transpose()
    }

    async fn count_rows(&self) -> Result<u64> {
        self.db
            .lock()
            .query_row(
                "SELECT (SELECT COUNT(*) FROM readings) + (SELECT COUNT(*) FROM statistics)",
                [],
                |row| row.get(0),
            )
            .context("Failed to count stored rows")
    }

    async fn query_readings(
        &self,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EnergyReading>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT entity_id, state, previous_state, attributes, ts_nanos FROM readings
             WHERE entity_id = ?1 AND ts_nanos >= ?2 AND ts_nanos < ?3
             ORDER BY ts_nanos, id",
        )?;

        let readings = stmt
            .query_map(
                params![entity_id, nanos(start)?, nanos(end)?],
                reading_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Failed to read readings of {entity_id}"))?;
        Ok(readings)
    }

    async fn query_stats(
        &self,
        entity_id: &str,
        period: StatPeriod,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EnergyStatistic>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT entity_id, period, start_ts, state, sum, mean, min, max FROM statistics
             WHERE entity_id = ?1 AND period = ?2 AND start_ts >= ?3 AND start_ts < ?4
             ORDER BY start_ts",
        )?;

        let stats = stmt
            .query_map(
                params![
                    entity_id,
                    period.as_str(),
                    start.timestamp(),
                    end.timestamp()
                ],
                statistic_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Failed to read statistics of {entity_id}"))?;
        Ok(stats)
    }

    async fn aggregate_readings(
        &self,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        bucket: StatPeriod,
    ) -> Result<Vec<ReadingAggregate>> {
        let readings = self.query_readings(entity_id, start, end).await?;

        let mut buckets: BTreeMap<DateTime<Utc>, Bucket> = BTreeMap::new();
        for reading in &readings {
            buckets
                .entry(bucket.bucket_start(reading.timestamp))
                .and_modify(|b| b.add(reading.state))
                .or_insert_with(|| Bucket::new(reading.state));
        }

        Ok(buckets
            .into_iter()
            .map(|(bucket_start, b)| ReadingAggregate {
                entity_id: entity_id.to_owned(),
                bucket,
                bucket_start,
                count: b.count,
                mean: b.mean(),
                min: b.min,
                max: b.max,
                last: b.last,
            })
            .collect())
    }

    fn name(&self) -> &str {
        "SQLite time-series store"
    }
}
