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

//! Scripted Home Assistant WebSocket server for end-to-end recorder tests.
//!
//! Unlike the unit-test fake in `fluxion-ha`, this hub keeps state between
//! requests: entity states and statistics can be changed while a test runs,
//! `state_changed` events are pushed on demand to every live subscription,
//! and connections can be dropped to exercise reconnection.

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

pub const TOKEN: &str = "integration-token";

enum Outgoing {
    Frame(Value),
    Close,
}

#[derive(Default)]
struct HubState {
    states: Vec<Value>,
    statistics: Map<String, Value>,
    statistics_requests: Vec<Value>,
    connections: HashMap<u64, mpsc::UnboundedSender<Outgoing>>,
    /// `(connection, subscription id)`
    subscriptions: Vec<(u64, Value)>,
}

impl std::fmt::Debug for HubState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubState")
            .field("states", &self.states.len())
            .field("connections", &self.connections.len())
            .field("subscriptions", &self.subscriptions.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct ScriptedHub {
    addr: SocketAddr,
    state: Arc<Mutex<HubState>>,
    accepted: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl ScriptedHub {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(HubState::default()));
        let accepted = Arc::new(AtomicUsize::new(0));

        let shared = Arc::clone(&state);
        let counter = Arc::clone(&accepted);
        let task = tokio::spawn(async move {
            let next_connection = AtomicU64::new(1);
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let conn_id = next_connection.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, conn_id, Arc::clone(&shared)));
            }
        });

        Self {
            addr,
            state,
            accepted,
            task,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/api/websocket", self.addr)
    }

    pub fn set_states(&self, states: Vec<Value>) {
        self.state.lock().states = states;
    }

    pub fn set_statistics(&self, entity_id: &str, rows: Vec<Value>) {
        self.state
            .lock()
            .statistics
            .insert(entity_id.to_owned(), Value::Array(rows));
    }

    pub fn statistics_requests(&self) -> Vec<Value> {
        self.state.lock().statistics_requests.clone()
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    /// Number of TCP connections accepted so far
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Push a `state_changed` event to every live subscription, returning
    /// how many subscriptions it was sent to
    pub fn push_state_changed(&self, entity_id: &str, old: Option<Value>, new: Value) -> usize {
        let event = json!({
            "event_type": "state_changed",
            "data": {"entity_id": entity_id, "old_state": old, "new_state": new},
            "time_fired": Utc::now().to_rfc3339(),
            "origin": "LOCAL"
        });

        let state = self.state.lock();
        let mut delivered = 0;
        for (conn_id, sub_id) in &state.subscriptions {
            if let Some(tx) = state.connections.get(conn_id) {
                let frame = json!({"id": sub_id, "type": "event", "event": event});
                if tx.send(Outgoing::Frame(frame)).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Close every open connection from the server side
    pub fn drop_connections(&self) {
        let state = self.state.lock();
        for tx in state.connections.values() {
            let _ = tx.send(Outgoing::Close);
        }
    }
}

impl Drop for ScriptedHub {
    fn drop(&mut self) {
        self.task.abort();
        self.drop_connections();
    }
}

async fn serve(stream: TcpStream, conn_id: u64, state: Arc<Mutex<HubState>>) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };

    let hello = json!({"type": "auth_required", "ha_version": "2025.10.0"});
    if ws.send(Message::text(hello.to_string())).await.is_err() {
        return;
    }
    let Some(Ok(Message::Text(auth))) = ws.next().await else {
        return;
    };
    let auth: Value = serde_json::from_str(auth.as_str()).unwrap_or_default();
    if auth["access_token"] != TOKEN {
        let invalid = json!({"type": "auth_invalid", "message": "Invalid access token"});
        let _ = ws.send(Message::text(invalid.to_string())).await;
        let _ = ws.close(None).await;
        return;
    }
    let ok = json!({"type": "auth_ok", "ha_version": "2025.10.0"});
    if ws.send(Message::text(ok.to_string())).await.is_err() {
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    state.lock().connections.insert(conn_id, tx);

    loop {
        tokio::select! {
            frame = ws.next() => {
                let Some(Ok(frame)) = frame else { break };
                let Message::Text(text) = frame else { continue };
                let Ok(request) = serde_json::from_str::<Value>(text.as_str()) else {
                    continue;
                };
                let reply = respond(conn_id, &request, &state);
                if ws.send(Message::text(reply.to_string())).await.is_err() {
                    break;
                }
            }
            outgoing = rx.recv() => match outgoing {
                Some(Outgoing::Frame(frame)) => {
                    if ws.send(Message::text(frame.to_string())).await.is_err() {
                        break;
                    }
                }
                Some(Outgoing::Close) | None => {
                    let _ = ws.close(None).await;
                    break;
                }
            },
        }
    }

    let mut state = state.lock();
    state.connections.remove(&conn_id);
    state.subscriptions.retain(|(conn, _)| *conn != conn_id);
}

fn respond(conn_id: u64, request: &Value, state: &Mutex<HubState>) -> Value {
    let id = request["id"].clone();
    let mut state = state.lock();

    let result = match request["type"].as_str() {
        Some("get_states") => Value::Array(state.states.clone()),
        Some("recorder/statistics_during_period") => {
            state.statistics_requests.push(request.clone());
            let mut result = Map::new();
            for entity_id in request["statistic_ids"].as_array().into_iter().flatten() {
                if let Some(entity_id) = entity_id.as_str()
                    && let Some(rows) = state.statistics.get(entity_id)
                {
                    result.insert(entity_id.to_owned(), rows.clone());
                }
            }
            Value::Object(result)
        }
        Some("subscribe_events") => {
            state.subscriptions.push((conn_id, id.clone()));
            Value::Null
        }
        Some("unsubscribe_events") => {
            let target = request["subscription"].clone();
            state
                .subscriptions
                .retain(|(conn, sub)| !(*conn == conn_id && *sub == target));
            Value::Null
        }
        Some("ping") => return json!({"id": id, "type": "pong"}),
        other => {
            return json!({
                "id": id,
                "type": "result",
                "success": false,
                "error": {"code": "unknown_command", "message": format!("Unknown command {other:?}")}
            });
        }
    };

    json!({"id": id, "type": "result", "success": true, "result": result})
}

// ============= Fixtures =============

pub fn entity_state(entity_id: &str, state: &str, device_class: &str, unit: &str) -> Value {
    json!({
        "entity_id": entity_id,
        "state": state,
        "attributes": {
            "device_class": device_class,
            "unit_of_measurement": unit,
            "friendly_name": entity_id
        },
        "last_changed": Utc::now().to_rfc3339(),
        "last_updated": Utc::now().to_rfc3339()
    })
}

/// Statistics row in the hub's wire shape (start in epoch milliseconds)
pub fn stat_row(start: DateTime<Utc>, sum: f64) -> Value {
    json!({"start": start.timestamp_millis(), "state": sum, "sum": sum})
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds, panicking after five seconds
pub async fn wait_until<F, Fut>(what: &str, condition: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Synchronous counterpart of [`wait_until`]
pub async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    wait_until(what, || std::future::ready(condition())).await;
}
