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
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::to_time_delta;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Zero when allowed
    pub retry_after_ms: u64,
}

/// Fixed-window limiter for manually triggered operations
///
/// The first check for a key opens a window; every other check inside it is
/// denied. The first check after the window closes opens a new one. A clock
/// stepping back before the window's opening also opens a new one, so a
/// denial never asks for more than one window of waiting.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl RateLimiter {
    pub fn new(window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            window,
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, key: &str) -> RateLimitDecision {
        let now = self.clock.now();
        let window = to_time_delta(self.window);
        let mut windows = self.windows.lock();

        if let Some(&opened) = windows.get(key)
            && now >= opened
        {
            let elapsed = now - opened;
            if elapsed < window {
                let remaining = (window - elapsed).num_milliseconds().max(1);
                return RateLimitDecision {
                    allowed: false,
                    retry_after_ms: u64::try_from(remaining).unwrap_or(u64::MAX),
                };
            }
        }

        windows.insert(key.to_owned(), now);
        RateLimitDecision {
            allowed: true,
            retry_after_ms: 0,
        }
    }
}
