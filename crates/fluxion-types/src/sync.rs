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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::energy::StatPeriod;

/// Which reconciliation operation produced a sync log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncKind {
    Seed,
    #[default]
    Backfill,
}

impl SyncKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Seed => "seed",
            Self::Backfill => "backfill",
        }
    }
}

impl fmt::Display for SyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit record of one reconciliation attempt
///
/// The serialized field names are a compatibility contract with existing
/// readers of the sync log and must not change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    #[serde(rename = "entityIds")]
    pub entity_ids: Vec<String>,
    #[serde(rename = "recordsSynced")]
    pub records_synced: u64,
    /// Start of the requested statistics window
    #[serde(rename = "startTime")]
    pub start_time: DateTime<Utc>,
    /// End of the requested statistics window
    #[serde(rename = "endTime")]
    pub end_time: DateTime<Utc>,
    pub period: StatPeriod,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(skip, default)]
    pub kind: SyncKind,
}

/// Window and timing shared by the success and failure constructors
#[derive(Debug, Clone, Copy)]
pub struct SyncWindow {
    pub kind: SyncKind,
    pub period: StatPeriod,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

impl SyncWindow {
    fn entry(
        &self,
        entity_ids: Vec<String>,
        records_synced: u64,
        finished_at: DateTime<Utc>,
        error: Option<String>,
    ) -> SyncLogEntry {
        let duration_ms = finished_at
            .signed_duration_since(self.started_at)
            .num_milliseconds()
            .try_into()
            .unwrap_or(0);

        SyncLogEntry {
            entity_ids,
            records_synced,
            start_time: self.start_time,
            end_time: self.end_time,
            period: self.period,
            duration_ms,
            success: error.is_none(),
            error,
            created_at: finished_at,
            kind: self.kind,
        }
    }

    pub fn success(
        &self,
        entity_ids: Vec<String>,
        records_synced: u64,
        finished_at: DateTime<Utc>,
    ) -> SyncLogEntry {
        self.entry(entity_ids, records_synced, finished_at, None)
    }

    pub fn failure(
        &self,
        entity_ids: Vec<String>,
        error: impl Into<String>,
        finished_at: DateTime<Utc>,
    ) -> SyncLogEntry {
        self.entry(entity_ids, 0, finished_at, Some(error.into()))
    }
}

/// Process-wide subscription liveness record
///
/// Derived state for external observers; never read back for recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SubscriptionState {
    pub active: bool,
    pub subscribed_at: Option<DateTime<Utc>>,
    pub event_count: u64,
    pub error_count: u64,
    pub last_event_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of the recorder's operational state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecorderSnapshot {
    pub is_running: bool,
    pub connected: bool,
    pub subscribed_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub entity_count: usize,
    pub event_count: u64,
    pub error_count: u64,
    pub detached_failures: u64,
}
