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

pub mod clock;
pub mod config;
pub mod errors;
pub mod live;
pub mod rate_limit;
pub mod reconciler;
pub mod recorder;
pub mod stats;
pub mod tasks;
pub mod traits;
pub mod transform;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RecorderConfig;
pub use errors::{RecorderError, RecorderResult};
pub use live::LiveFeed;
pub use rate_limit::{RateLimitDecision, RateLimiter};
pub use reconciler::{BackfillReport, DiscoveryReport, HeartbeatOutcome, Reconciler, SeedReport};
pub use recorder::{BACKFILL_KEY, DISCOVERY_KEY, EventOutcome, EventRecorder, RESEED_KEY};
pub use stats::{RecorderStats, TrackedEntities};
pub use tasks::{DetachedTasks, ScheduledTask};
pub use traits::{EntityRegistry, EventSink, HubSession, Services, TimeSeriesSink};
pub use transform::{TransformSkip, is_energy_state, parse_numeric, reading_from_event};
