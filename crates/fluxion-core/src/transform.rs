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

//! Turning raw `state_changed` events into energy readings

use fluxion_types::{EnergyReading, HubEntityState, StateChangedEvent};
use std::fmt;

/// Device classes that mark an entity as energy related
pub const ENERGY_DEVICE_CLASSES: [&str; 2] = ["energy", "power"];

/// Units that mark an entity as energy related
pub const ENERGY_UNITS: [&str; 4] = ["kWh", "Wh", "W", "kW"];

/// Why an event did not produce a reading
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformSkip {
    MissingEntityId,
    MissingNewState,
    NotEnergy { entity_id: String },
    NonNumeric { entity_id: String, state: String },
}

impl fmt::Display for TransformSkip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingEntityId => f.write_str("event has no entity id"),
            Self::MissingNewState => f.write_str("event has no new state"),
            Self::NotEnergy { entity_id } => write!(f, "{entity_id} is not an energy entity"),
            Self::NonNumeric { entity_id, state } => {
                write!(f, "{entity_id} has non-numeric state '{state}'")
            }
        }
    }
}

pub fn is_energy_state(state: &HubEntityState) -> bool {
    state
        .device_class()
        .is_some_and(|class| ENERGY_DEVICE_CLASSES.contains(&class))
        || state
            .unit_of_measurement()
            .is_some_and(|unit| ENERGY_UNITS.contains(&unit))
}

/// Parse a raw hub state. `unavailable`, `unknown` and non-finite values
/// yield `None`.
pub fn parse_numeric(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn reading_from_event(event: &StateChangedEvent) -> Result<EnergyReading, TransformSkip> {
    let entity_id = event
        .entity_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or(TransformSkip::MissingEntityId)?;
    let new_state = event
        .new_state
        .as_ref()
        .ok_or(TransformSkip::MissingNewState)?;

    if !is_energy_state(new_state) {
        return Err(TransformSkip::NotEnergy {
            entity_id: entity_id.to_owned(),
        });
    }

    let state = parse_numeric(&new_state.state).ok_or_else(|| TransformSkip::NonNumeric {
        entity_id: entity_id.to_owned(),
        state: new_state.state.clone(),
    })?;

    let previous_state = event
        .old_state
        .as_ref()
        .and_then(|old| parse_numeric(&old.state));

    let attributes = (!new_state.attributes.is_null()).then(|| new_state.attributes.clone());

    Ok(EnergyReading {
        entity_id: entity_id.to_owned(),
        state,
        previous_state,
        attributes,
        timestamp: event.time_fired.unwrap_or(new_state.last_updated),
    })
}
