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

//! Wire types of the Home Assistant WebSocket API

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaEntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Value,
    pub last_changed: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// Push event as delivered inside an `event` message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaEvent {
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub time_fired: Option<DateTime<Utc>>,
    #[serde(default)]
    pub origin: Option<String>,
}

/// `data` of a `state_changed` event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaStateChangedData {
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub old_state: Option<HaEntityState>,
    #[serde(default)]
    pub new_state: Option<HaEntityState>,
}

/// One row of `recorder/statistics_during_period`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaStatisticsRow {
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub state: Option<f64>,
    #[serde(default)]
    pub sum: Option<f64>,
    #[serde(default)]
    pub mean: Option<f64>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaErrorPayload {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// Every message the server may send, keyed on its `type` field
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    AuthRequired {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthOk {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
    Result {
        id: u64,
        success: bool,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<HaErrorPayload>,
    },
    Event {
        id: u64,
        event: HaEvent,
    },
    Pong {
        id: u64,
    },
    #[serde(other)]
    Unknown,
}

/// Statistics timestamps arrive as epoch milliseconds on current cores and as
/// ISO strings on older ones
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTimestamp {
        Millis(f64),
        Text(String),
    }

    match RawTimestamp::deserialize(deserializer)? {
        #[expect(
            clippy::cast_possible_truncation,
            reason = "epoch milliseconds fit in i64"
        )]
        RawTimestamp::Millis(ms) => Utc
            .timestamp_millis_opt(ms as i64)
            .single()
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {ms}"))),
        RawTimestamp::Text(text) => DateTime::parse_from_rfc3339(&text)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom),
    }
}
