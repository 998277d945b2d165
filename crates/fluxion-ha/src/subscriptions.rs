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

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::types::HaEvent;

/// Callback invoked from the reader task for every matching push event.
/// Must not block; forward into a channel for anything slow.
pub type EventHandler = Arc<dyn Fn(HaEvent) + Send + Sync>;

pub type SubscriptionId = u64;

struct Subscription {
    event_type: Option<String>,
    handler: EventHandler,
    active: bool,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("event_type", &self.event_type)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

/// Event subscriptions keyed by the id of their `subscribe_events` request
///
/// A lost connection marks subscriptions inactive instead of removing them so
/// owners can see that they must subscribe again.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subscriptions: HashMap<SubscriptionId, Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: SubscriptionId, event_type: Option<String>, handler: EventHandler) {
        self.subscriptions.insert(
            id,
            Subscription {
                event_type,
                handler,
                active: true,
            },
        );
    }

    pub fn remove(&mut self, id: SubscriptionId) -> bool {
        self.subscriptions.remove(&id).is_some()
    }

    /// Handler that should receive `event`, if the subscription is live and
    /// its filter matches. Callers invoke it after releasing the registry lock.
    pub fn handler_for(&self, id: SubscriptionId, event: &HaEvent) -> Option<EventHandler> {
        let sub = self.subscriptions.get(&id)?;
        let matches = sub
            .event_type
            .as_deref()
            .is_none_or(|t| t == event.event_type);
        (sub.active && matches).then(|| Arc::clone(&sub.handler))
    }

    pub fn mark_all_inactive(&mut self) -> usize {
        let mut count = 0;
        for sub in self.subscriptions.values_mut().filter(|s| s.active) {
            sub.active = false;
            count += 1;
        }
        count
    }

    pub fn is_active(&self, id: SubscriptionId) -> bool {
        self.subscriptions.get(&id).is_some_and(|s| s.active)
    }

    pub fn active_count(&self) -> usize {
        self.subscriptions.values().filter(|s| s.active).count()
    }

    pub fn inactive_ids(&self) -> Vec<SubscriptionId> {
        let mut ids: Vec<_> = self
            .subscriptions
            .iter()
            .filter(|(_, s)| !s.active)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
