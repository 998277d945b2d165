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

use anyhow::Result;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::traits::{EventSink, HubSession};

/// The recorder's `state_changed` subscription
///
/// Keeps at most one live subscription feeding the event channel. A
/// subscription that died with its connection is forgotten and replaced.
pub struct LiveFeed {
    hub: Arc<dyn HubSession>,
    sink: EventSink,
    subscription: Mutex<Option<u64>>,
}

impl fmt::Debug for LiveFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveFeed")
            .field("hub", &self.hub.name())
            .finish_non_exhaustive()
    }
}

impl LiveFeed {
    pub fn new(hub: Arc<dyn HubSession>, sink: EventSink) -> Self {
        Self {
            hub,
            sink,
            subscription: Mutex::new(None),
        }
    }

    /// Subscribe unless an active subscription exists.
    /// Returns true when a new subscription was made.
    pub async fn ensure_subscribed(&self) -> Result<bool> {
        let mut current = self.subscription.lock().await;

        if let Some(id) = *current {
            if self.hub.is_subscription_active(id) {
                return Ok(false);
            }
            debug!(subscription_id = id, "Dropping dead subscription");
            self.hub.forget_subscription(id);
            *current = None;
        }

        let id = self.hub.subscribe_state_changes(self.sink.clone()).await?;
        info!(subscription_id = id, "📡 Subscribed to state_changed events");
        *current = Some(id);
        Ok(true)
    }

    pub async fn is_active(&self) -> bool {
        self.subscription
            .lock()
            .await
            .is_some_and(|id| self.hub.is_subscription_active(id))
    }

    pub async fn subscription_id(&self) -> Option<u64> {
        *self.subscription.lock().await
    }

    /// Forget the subscription; events still in flight for it are ignored
    pub async fn release(&self) {
        if let Some(id) = self.subscription.lock().await.take() {
            self.hub.forget_subscription(id);
            debug!(subscription_id = id, "Released subscription");
        }
    }
}
