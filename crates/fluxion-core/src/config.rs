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

use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

/// Runtime settings of the recorder and its reconciliation loops
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// How often the heartbeat checks the live feed
    pub heartbeat_interval: Duration,
    /// Silence longer than this forces a reconnect
    pub idle_threshold: Duration,
    pub backfill_interval: Duration,
    /// Backfill window for entities without any stored statistics
    pub backfill_lookback: Duration,
    /// Statistics window pulled by cold-start seeding
    pub seed_lookback: Duration,
    pub rate_limit_window: Duration,
    /// Track entities first seen through live events
    pub auto_track_new_entities: bool,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(3 * 60),
            idle_threshold: Duration::from_secs(5 * 60),
            backfill_interval: Duration::from_secs(60 * 60),
            backfill_lookback: Duration::from_secs(24 * 60 * 60),
            seed_lookback: Duration::from_secs(30 * 24 * 60 * 60),
            rate_limit_window: Duration::from_secs(30),
            auto_track_new_entities: true,
        }
    }
}

/// Convert for chrono arithmetic, saturating on overflow
pub(crate) fn to_time_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// Start of a window reaching `lookback` back from `end`, clamped to the
/// earliest representable time
pub(crate) fn lookback_start(end: DateTime<Utc>, lookback: Duration) -> DateTime<Utc> {
    end.checked_sub_signed(to_time_delta(lookback))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
