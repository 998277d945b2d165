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

use anyhow::Result;
use chrono::{DateTime, Datelike, DurationRound, NaiveTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::hub::StatisticsRow;

// ============= Statistic Periods =============

/// Aggregation bucket of a statistic, named the way the hub names them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StatPeriod {
    #[serde(rename = "5minute")]
    FiveMinute,
    #[default]
    #[serde(rename = "hour")]
    Hour,
    #[serde(rename = "day")]
    Day,
    #[serde(rename = "week")]
    Week,
    #[serde(rename = "month")]
    Month,
}

impl StatPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FiveMinute => "5minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
        }
    }

    pub fn all() -> &'static [StatPeriod] {
        &[
            Self::FiveMinute,
            Self::Hour,
            Self::Day,
            Self::Week,
            Self::Month,
        ]
    }

    /// Start of the bucket containing `ts` (UTC calendar; weeks start on Monday)
    pub fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let midnight = ts.date_naive().and_time(NaiveTime::MIN);
        match self {
            Self::FiveMinute => ts.duration_trunc(TimeDelta::minutes(5)).unwrap_or(ts),
            Self::Hour => ts.duration_trunc(TimeDelta::hours(1)).unwrap_or(ts),
            Self::Day => midnight.and_utc(),
            Self::Week => {
                let back = i64::from(ts.weekday().num_days_from_monday());
                (midnight - TimeDelta::days(back)).and_utc()
            }
            Self::Month => ts
                .date_naive()
                .with_day(1)
                .map_or(midnight, |first| first.and_time(NaiveTime::MIN))
                .and_utc(),
        }
    }
}

impl fmt::Display for StatPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatPeriod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Unknown statistic period: '{}'. Supported periods: {}",
                    s,
                    Self::all()
                        .iter()
                        .map(StatPeriod::as_str)
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            })
    }
}

// ============= Rows =============

/// One reading per push event. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyReading {
    pub entity_id: String,
    pub state: f64,
    pub previous_state: Option<f64>,
    pub attributes: Option<serde_json::Value>,
    /// Nanosecond precision is preserved by the time-series store
    pub timestamp: DateTime<Utc>,
}

/// One aggregation bucket of authoritative statistics
///
/// Stores key these rows on `(entity_id, period, start)` and overwrite on
/// conflict, so writing the same bucket twice converges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyStatistic {
    pub entity_id: String,
    pub period: StatPeriod,
    pub state: Option<f64>,
    pub sum: Option<f64>,
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub start: DateTime<Utc>,
}

impl EnergyStatistic {
    pub fn from_row(entity_id: &str, period: StatPeriod, row: &StatisticsRow) -> Self {
        Self {
            entity_id: entity_id.to_owned(),
            period,
            state: row.state,
            sum: row.sum,
            mean: row.mean,
            min: row.min,
            max: row.max,
            start: row.start,
        }
    }
}

/// Readings folded into one bucket by a range aggregation query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingAggregate {
    pub entity_id: String,
    pub bucket: StatPeriod,
    pub bucket_start: DateTime<Utc>,
    pub count: u64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    /// Value of the latest reading inside the bucket
    pub last: f64,
}
