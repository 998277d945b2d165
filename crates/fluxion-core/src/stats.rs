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
use fluxion_types::SubscriptionState;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// Operational counters of the recorder
#[derive(Debug, Default)]
pub struct RecorderStats {
    event_count: AtomicU64,
    error_count: AtomicU64,
    last_event_at: Mutex<Option<DateTime<Utc>>>,
    subscribed_at: Mutex<Option<DateTime<Utc>>>,
}

impl RecorderStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&self, at: DateTime<Utc>) {
        self.event_count.fetch_add(1, Ordering::Relaxed);
        *self.last_event_at.lock() = Some(at);
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_subscribed_at(&self, at: DateTime<Utc>) {
        *self.subscribed_at.lock() = Some(at);
    }

    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn last_event_at(&self) -> Option<DateTime<Utc>> {
        *self.last_event_at.lock()
    }

    pub fn subscribed_at(&self) -> Option<DateTime<Utc>> {
        *self.subscribed_at.lock()
    }

    /// Most recent sign of life: the last event, or the subscription itself
    /// when it is newer
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.last_event_at().max(self.subscribed_at())
    }

    pub fn subscription_state(&self, active: bool, now: DateTime<Utc>) -> SubscriptionState {
        SubscriptionState {
            active,
            subscribed_at: self.subscribed_at(),
            event_count: self.event_count(),
            error_count: self.error_count(),
            last_event_at: self.last_event_at(),
            updated_at: Some(now),
        }
    }
}

/// In-memory mirror of the registry's tracked entity ids
#[derive(Debug, Default)]
pub struct TrackedEntities {
    ids: RwLock<BTreeSet<String>>,
}

impl TrackedEntities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace<I>(&self, ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        *self.ids.write() = ids.into_iter().collect();
    }

    pub fn insert(&self, entity_id: &str) -> bool {
        self.ids.write().insert(entity_id.to_owned())
    }

    pub fn remove(&self, entity_id: &str) -> bool {
        self.ids.write().remove(entity_id)
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.ids.read().contains(entity_id)
    }

    pub fn len(&self) -> usize {
        self.ids.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.read().is_empty()
    }

    /// Sorted copy of the ids
    pub fn snapshot(&self) -> Vec<String> {
        self.ids.read().iter().cloned().collect()
    }
}
