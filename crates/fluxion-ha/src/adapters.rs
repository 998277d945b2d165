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

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fluxion_core::{EventSink, HubSession};
use fluxion_types::{HubEntityState, StatPeriod, StateChangedEvent, StatisticsRow};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::client::{HomeAssistantClient, SessionStatus};
use crate::types::{HaEntityState, HaEvent, HaStateChangedData, HaStatisticsRow};

const STATE_CHANGED: &str = "state_changed";

/// Home Assistant adapter implementing `HubSession`
///
/// Translates the WebSocket client's wire types into the recorder's domain
/// types. The client is shared; cloning the adapter is cheap.
#[derive(Debug, Clone)]
pub struct HomeAssistantSession {
    client: HomeAssistantClient,
}

impl HomeAssistantSession {
    pub fn new(client: HomeAssistantClient) -> Self {
        Self { client }
    }

    /// Get reference to the underlying client (for status watching, close, etc.)
    pub fn client(&self) -> &HomeAssistantClient {
        &self.client
    }
}

impl From<HaEntityState> for HubEntityState {
    fn from(state: HaEntityState) -> Self {
        Self {
            entity_id: state.entity_id,
            state: state.state,
            attributes: state.attributes,
            last_changed: state.last_changed,
            last_updated: state.last_updated,
        }
    }
}

impl From<HaStatisticsRow> for StatisticsRow {
    fn from(row: HaStatisticsRow) -> Self {
        Self {
            start: row.start,
            state: row.state,
            sum: row.sum,
            mean: row.mean,
            min: row.min,
            max: row.max,
        }
    }
}

/// Decode the payload of a `state_changed` push event
pub fn state_changed_event(event: HaEvent) -> Result<StateChangedEvent> {
    let data: HaStateChangedData = serde_json::from_value(event.data)
        .context("Malformed state_changed payload")?;

    Ok(StateChangedEvent {
        entity_id: data.entity_id,
        old_state: data.old_state.map(HubEntityState::from),
        new_state: data.new_state.map(HubEntityState::from),
        time_fired: event.time_fired,
    })
}

#[async_trait]
impl HubSession for HomeAssistantSession {
    async fn get_states(&self) -> Result<Vec<HubEntityState>> {
        let states = self
            .client
            .get_states()
            .await
            .context("Failed to fetch entity states")?;
        Ok(states.into_iter().map(HubEntityState::from).collect())
    }

    async fn statistics_during_period(
        &self,
        entity_ids: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        period: StatPeriod,
    ) -> Result<HashMap<String, Vec<StatisticsRow>>> {
        let stats = self
            .client
            .statistics_during_period(entity_ids, start, end, period)
            .await
            .with_context(|| {
                format!(
                    "Failed to fetch {period} statistics for {} entities",
                    entity_ids.len()
                )
            })?;

        Ok(stats
            .into_iter()
            .map(|(id, rows)| (id, rows.into_iter().map(StatisticsRow::from).collect()))
            .collect())
    }

    async fn subscribe_state_changes(&self, sink: EventSink) -> Result<u64> {
        let handler = Arc::new(move |event: HaEvent| match state_changed_event(event) {
            Ok(event) => {
                if sink.send(event).is_err() {
                    trace!("Event receiver gone, dropping state_changed");
                }
            }
            Err(e) => debug!("⚠️  [HA WS] {:#}", e),
        });

        let id = self
            .client
            .subscribe(Some(STATE_CHANGED), handler)
            .await
            .context("Failed to subscribe to state_changed")?;
        Ok(id)
    }

    fn is_subscription_active(&self, subscription_id: u64) -> bool {
        self.client.is_subscription_active(subscription_id)
    }

    fn forget_subscription(&self, subscription_id: u64) {
        self.client.forget_subscription(subscription_id);
    }

    async fn reconnect(&self) -> Result<()> {
        self.client
            .reconnect()
            .await
            .context("Failed to reconnect to Home Assistant")
    }

    fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    fn connection_generation(&self) -> u64 {
        match self.client.current_status() {
            SessionStatus::Connected { generation } => generation,
            SessionStatus::Disconnected | SessionStatus::Connecting => 0,
        }
    }

    async fn wait_for_connection(&self, after: u64) -> Option<u64> {
        let mut status = self.client.status();
        loop {
            let current = *status.borrow_and_update();
            if let SessionStatus::Connected { generation } = current
                && generation > after
            {
                return Some(generation);
            }
            status.changed().await.ok()?;
        }
    }

    fn name(&self) -> &str {
        "Home Assistant"
    }
}
