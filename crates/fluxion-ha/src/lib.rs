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

//! Home Assistant WebSocket session for the energy recorder

pub mod adapters;
mod backoff;
pub mod client;
pub mod errors;
mod pending;
pub mod subscriptions;
pub mod types;

#[cfg(test)]
mod fake_hub;

pub use adapters::{HomeAssistantSession, state_changed_event};
pub use backoff::{Backoff, DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_BACKOFF};
pub use client::{
    ClientConfig, DEFAULT_CALL_TIMEOUT, HomeAssistantClient, SUPERVISOR_WS_URL, SessionStatus,
    websocket_url,
};
pub use errors::{HaError, HaResult};
pub use subscriptions::{EventHandler, SubscriptionId};
pub use types::{HaEntityState, HaEvent, HaStateChangedData, HaStatisticsRow};
