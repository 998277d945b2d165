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

use crate::hub::HubEntityState;

/// Metadata record of one hub entity as kept in the document store
///
/// The entity id (`domain.object_id`) is the identity. Upserting the same id
/// twice merges into one record; `tracked` is only set when the record is
/// first created and is afterwards changed through the registry's
/// `set_entity_tracked`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_id: String,
    pub friendly_name: Option<String>,
    pub device_class: Option<String>,
    pub unit_of_measurement: Option<String>,
    /// Raw state string as last observed (may be "unavailable")
    pub last_state: Option<String>,
    pub tracked: bool,
    #[serde(default)]
    pub event_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl EntityRecord {
    /// Build a fresh record from a hub state snapshot
    pub fn from_hub_state(state: &HubEntityState, tracked: bool, seen_at: DateTime<Utc>) -> Self {
        Self {
            entity_id: state.entity_id.clone(),
            friendly_name: state.friendly_name().map(str::to_owned),
            device_class: state.device_class().map(str::to_owned),
            unit_of_measurement: state.unit_of_measurement().map(str::to_owned),
            last_state: Some(state.state.clone()),
            tracked,
            event_count: 0,
            first_seen: seen_at,
            last_seen: seen_at,
        }
    }

    /// Domain part of the entity id (`sensor` for `sensor.power_1`)
    pub fn domain(&self) -> &str {
        entity_domain(&self.entity_id)
    }
}

/// Domain part of an entity id; the whole id when it carries no dot
pub fn entity_domain(entity_id: &str) -> &str {
    entity_id
        .split_once('.')
        .map_or(entity_id, |(domain, _)| domain)
}

/// Selection criteria for registry queries. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityFilter {
    pub tracked: Option<bool>,
    pub domain: Option<String>,
}

impl EntityFilter {
    pub fn tracked() -> Self {
        Self {
            tracked: Some(true),
            domain: None,
        }
    }

    pub fn matches(&self, record: &EntityRecord) -> bool {
        self.tracked.is_none_or(|t| record.tracked == t)
            && self.domain.as_deref().is_none_or(|d| record.domain() == d)
    }
}
