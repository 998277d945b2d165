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

//! Hub-side data as seen by the recorder, independent of the wire protocol

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of one entity's state on the hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubEntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: serde_json::Value,
    pub last_changed: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl HubEntityState {
    fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }

    pub fn friendly_name(&self) -> Option<&str> {
        self.attribute_str("friendly_name")
    }

    pub fn device_class(&self) -> Option<&str> {
        self.attribute_str("device_class")
    }

    pub fn unit_of_measurement(&self) -> Option<&str> {
        self.attribute_str("unit_of_measurement")
    }
}

/// Payload of a `state_changed` push event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChangedEvent {
    pub entity_id: Option<String>,
    pub old_state: Option<HubEntityState>,
    pub new_state: Option<HubEntityState>,
    /// When the hub fired the event, if it said so
    pub time_fired: Option<DateTime<Utc>>,
}

/// One row of authoritative long-term statistics from the hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsRow {
    pub start: DateTime<Utc>,
    pub state: Option<f64>,
    pub sum: Option<f64>,
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}
