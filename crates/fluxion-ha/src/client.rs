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

use crate::backoff::Backoff;
use crate::errors::{HaError, HaResult};
use crate::pending::{CallResult, PendingCalls};
use crate::subscriptions::{EventHandler, SubscriptionId, SubscriptionRegistry};
use crate::types::{HaEntityState, HaStatisticsRow, InboundMessage};
use chrono::{DateTime, Utc};
use fluxion_types::StatPeriod;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_BASE_URL: &str = "http://localhost:8123";
/// WebSocket endpoint of the core as seen from inside an add-on container
pub const SUPERVISOR_WS_URL: &str = "ws://supervisor/core/websocket";
const STATISTIC_TYPES: [&str; 5] = ["state", "sum", "mean", "min", "max"];

/// Connection lifecycle as published on [`HomeAssistantClient::status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    /// `generation` grows by one with every authenticated connection
    Connected { generation: u64 },
}

#[derive(Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `ws://homeassistant.local:8123/api/websocket`
    pub url: String,
    pub token: String,
    pub call_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Reconnect in the background when the transport drops
    pub auto_reconnect: bool,
}

impl ClientConfig {
    /// Accepts either a WebSocket URL or the HTTP base URL of the instance
    pub fn new(url: impl AsRef<str>, token: impl Into<String>) -> Self {
        Self {
            url: websocket_url(url.as_ref()),
            token: token.into(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            initial_backoff: crate::backoff::DEFAULT_INITIAL_BACKOFF,
            max_backoff: crate::backoff::DEFAULT_MAX_BACKOFF,
            auto_reconnect: true,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("url", &self.url)
            .field("token", &"<redacted>")
            .field("call_timeout", &self.call_timeout)
            .field("initial_backoff", &self.initial_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("auto_reconnect", &self.auto_reconnect)
            .finish()
    }
}

/// Map an HTTP base URL (`http://host:8123`) to its WebSocket API endpoint.
/// WebSocket URLs pass through unchanged.
pub fn websocket_url(base: &str) -> String {
    let base = base.trim().trim_end_matches('/');
    if base.starts_with("ws://") || base.starts_with("wss://") {
        return base.to_owned();
    }

    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{base}")
    };

    if ws_base.ends_with("/websocket") {
        ws_base
    } else {
        format!("{ws_base}/api/websocket")
    }
}

struct Connection {
    generation: u64,
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
}

struct Inner {
    config: ClientConfig,
    pending: Mutex<PendingCalls>,
    subscriptions: Mutex<SubscriptionRegistry>,
    connection: Mutex<Option<Connection>>,
    connected: AtomicBool,
    closed: AtomicBool,
    generation: AtomicU64,
    reconnect_lock: tokio::sync::Mutex<()>,
    backoff: Mutex<Backoff>,
    status_tx: watch::Sender<SessionStatus>,
}

/// Home Assistant WebSocket API client
///
/// Holds one long-lived authenticated connection. Requests are correlated by
/// id, push events are dispatched to registered subscriptions, and a dropped
/// transport is re-established with exponential backoff. Cloning is cheap and
/// every clone drives the same connection.
#[derive(Clone)]
pub struct HomeAssistantClient {
    inner: Arc<Inner>,
}

impl fmt::Debug for HomeAssistantClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HomeAssistantClient")
            .field("url", &self.inner.config.url)
            .field("connected", &self.is_connected())
            .field("generation", &self.inner.generation.load(Ordering::SeqCst))
            .field("pending_calls", &self.inner.pending.lock().len())
            .field("subscriptions", &self.inner.subscriptions.lock().len())
            .finish()
    }
}

impl HomeAssistantClient {
    /// Create a client; no connection is made until [`connect`](Self::connect)
    pub fn new(config: ClientConfig) -> Self {
        let backoff = Backoff::new(config.initial_backoff, config.max_backoff);
        let (status_tx, _) = watch::channel(SessionStatus::Disconnected);

        Self {
            inner: Arc::new(Inner {
                config,
                pending: Mutex::new(PendingCalls::new()),
                subscriptions: Mutex::new(SubscriptionRegistry::new()),
                connection: Mutex::new(None),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                reconnect_lock: tokio::sync::Mutex::new(()),
                backoff: Mutex::new(backoff),
                status_tx,
            }),
        }
    }

    /// Create HA client using Supervisor API environment variables
    /// This is the standard method for HA addons
    pub fn from_supervisor() -> HaResult<Self> {
        let token = std::env::var("SUPERVISOR_TOKEN").map_err(|_| {
            HaError::Config(
                "SUPERVISOR_TOKEN environment variable not set. Are you running as an HA addon?"
                    .to_owned(),
            )
        })?;

        info!("Initializing HA WebSocket client using Supervisor API");
        Ok(Self::new(ClientConfig::new(SUPERVISOR_WS_URL, token)))
    }

    /// Create HA client for development/testing from `HA_BASE_URL` / `HA_TOKEN`
    pub fn from_env() -> HaResult<Self> {
        Self::from_config(None, None)
    }

    /// Create HA client from configuration values
    /// Falls back to environment variables if config values are not set
    pub fn from_config(ha_base_url: Option<String>, ha_token: Option<String>) -> HaResult<Self> {
        let base_url = ha_base_url
            .or_else(|| std::env::var("HA_BASE_URL").ok())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_owned());

        let token = ha_token
            .or_else(|| std::env::var("HA_TOKEN").ok())
            .ok_or_else(|| {
                HaError::Config(
                    "HA token not found in config or HA_TOKEN environment variable".to_owned(),
                )
            })?;

        let config = ClientConfig::new(&base_url, token);
        info!("Initializing HA WebSocket client: {}", config.url);
        Ok(Self::new(config))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Open the transport and authenticate. A single attempt; use
    /// [`reconnect`](Self::reconnect) for retries with backoff.
    pub async fn connect(&self) -> HaResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(HaError::ConnectionLost);
        }
        let _guard = self.inner.reconnect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        let result = self.inner.establish().await;
        if result.is_err() {
            self.inner.status_tx.send_replace(SessionStatus::Disconnected);
        }
        result
    }

    /// Drop the current connection (if any) and connect again, retrying with
    /// exponential backoff until authenticated.
    ///
    /// Concurrent callers collapse onto one attempt: whoever waited behind a
    /// running attempt returns once it sees the newer connection. Rejected
    /// credentials end the loop immediately.
    pub async fn reconnect(&self) -> HaResult<()> {
        self.inner.reconnect().await
    }

    /// Non-blocking connectivity check
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn current_status(&self) -> SessionStatus {
        *self.inner.status_tx.borrow()
    }

    /// Send a request and wait for its `result`
    pub async fn call(&self, request_type: &str, payload: Value) -> HaResult<Value> {
        let (id, rx) = self.inner.pending.lock().register(request_type);
        if let Err(e) = self.inner.send_request(id, request_type, payload) {
            self.inner.pending.lock().remove(id);
            return Err(e);
        }
        self.inner.await_response(id, request_type, rx).await
    }

    /// Subscribe to push events, optionally filtered by event type.
    ///
    /// The handler runs on the connection's reader task and must not block.
    pub async fn subscribe(
        &self,
        event_type: Option<&str>,
        handler: EventHandler,
    ) -> HaResult<SubscriptionId> {
        let (id, rx) = self.inner.pending.lock().register("subscribe_events");
        // Registered before the request goes out so no event can outrun it
        self.inner
            .subscriptions
            .lock()
            .insert(id, event_type.map(str::to_owned), handler);

        let payload = event_type.map_or_else(|| json!({}), |t| json!({ "event_type": t }));
        let outcome = match self.inner.send_request(id, "subscribe_events", payload) {
            Ok(()) => self.inner.await_response(id, "subscribe_events", rx).await,
            Err(e) => {
                self.inner.pending.lock().remove(id);
                Err(e)
            }
        };

        match outcome {
            Ok(_) => {
                info!(
                    "📡 [HA WS] Subscribed to {} (subscription {})",
                    event_type.unwrap_or("all events"),
                    id
                );
                Ok(id)
            }
            Err(e) => {
                self.inner.subscriptions.lock().remove(id);
                Err(e)
            }
        }
    }

    /// Cancel a subscription on the server and forget it locally
    pub async fn unsubscribe(&self, id: SubscriptionId) -> HaResult<()> {
        let was_active = self.inner.subscriptions.lock().is_active(id);
        self.inner.subscriptions.lock().remove(id);
        if was_active && self.is_connected() {
            self.call("unsubscribe_events", json!({ "subscription": id }))
                .await?;
        }
        Ok(())
    }

    /// Forget a subscription locally without talking to the server. Used for
    /// subscriptions that died with a previous connection.
    pub fn forget_subscription(&self, id: SubscriptionId) -> bool {
        self.inner.subscriptions.lock().remove(id)
    }

    pub fn is_subscription_active(&self, id: SubscriptionId) -> bool {
        self.inner.subscriptions.lock().is_active(id)
    }

    /// Get states of all entities
    pub async fn get_states(&self) -> HaResult<Vec<HaEntityState>> {
        debug!("🔍 [HA QUERY] Getting all entity states");
        let result = self.call("get_states", Value::Null).await?;

        let Value::Array(raw_states) = result else {
            return Err(HaError::Protocol(
                "get_states did not return an array".to_owned(),
            ));
        };

        let total = raw_states.len();
        let states: Vec<HaEntityState> = raw_states
            .into_iter()
            .filter_map(|raw| match serde_json::from_value(raw) {
                Ok(state) => Some(state),
                Err(e) => {
                    debug!("   Skipping malformed state: {}", e);
                    None
                }
            })
            .collect();

        debug!("✅ [HA RESULT] {}/{} entity states parsed", states.len(), total);
        Ok(states)
    }

    /// Long-term statistics for `statistic_ids` between `start` and `end`
    pub async fn statistics_during_period(
        &self,
        statistic_ids: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        period: StatPeriod,
    ) -> HaResult<HashMap<String, Vec<HaStatisticsRow>>> {
        debug!(
            "📊 [HA STATS] {} statistics, period {}, {} -> {}",
            statistic_ids.len(),
            period,
            start,
            end
        );

        let result = self
            .call(
                "recorder/statistics_during_period",
                json!({
                    "start_time": start.to_rfc3339(),
                    "end_time": end.to_rfc3339(),
                    "statistic_ids": statistic_ids,
                    "period": period.as_str(),
                    "types": STATISTIC_TYPES,
                }),
            )
            .await?;

        let stats: HashMap<String, Vec<HaStatisticsRow>> = serde_json::from_value(result)?;
        trace!(
            "   Rows: {}",
            stats.values().map(Vec::len).sum::<usize>()
        );
        Ok(stats)
    }

    /// Round trip a `ping`, returning the latency
    pub async fn ping(&self) -> HaResult<Duration> {
        let started = Instant::now();
        self.call("ping", Value::Null).await?;
        Ok(started.elapsed())
    }

    /// Close the connection for good. Pending calls fail with
    /// `ConnectionLost` and later reconnect attempts are refused.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.teardown();
        info!("👋 [HA WS] Client closed");
    }
}

impl Inner {
    async fn reconnect(self: &Arc<Self>) -> HaResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HaError::ConnectionLost);
        }

        let observed = self.generation.load(Ordering::SeqCst);
        let _guard = self.reconnect_lock.lock().await;

        if self.closed.load(Ordering::SeqCst) {
            return Err(HaError::ConnectionLost);
        }
        if self.generation.load(Ordering::SeqCst) != observed
            && self.connected.load(Ordering::SeqCst)
        {
            debug!("🔁 [HA WS] Reconnect already completed by another caller");
            return Ok(());
        }

        self.teardown();

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(HaError::ConnectionLost);
            }

            match self.establish().await {
                Ok(()) => return Ok(()),
                Err(e @ HaError::Auth(_)) => {
                    error!("❌ [HA WS] Authentication rejected, giving up: {}", e);
                    self.status_tx.send_replace(SessionStatus::Disconnected);
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.backoff.lock().next_delay();
                    warn!(
                        "⚠️ [HA WS] Connection attempt failed: {}. Retrying in {:?}",
                        e, delay
                    );
                    self.status_tx.send_replace(SessionStatus::Disconnected);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Open, authenticate and install a fresh connection
    async fn establish(self: &Arc<Self>) -> HaResult<()> {
        self.status_tx.send_replace(SessionStatus::Connecting);
        info!("🔌 [HA WS] Connecting to {}", self.config.url);

        let (mut ws, _) = connect_async(self.config.url.as_str())
            .await
            .map_err(|e| HaError::Connect(e.to_string()))?;

        let ha_version = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            handshake(&mut ws, &self.config.token),
        )
        .await
        .map_err(|_| HaError::Connect("authentication handshake timed out".to_owned()))??;

        let (sink, stream) = ws.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(sink, outbound_rx));

        // The reader needs the connection slot to tear it down, so it is
        // spawned under the slot lock and cannot race the install below.
        let generation = {
            let mut slot = self.connection.lock();
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let reader = tokio::spawn(read_loop(Arc::downgrade(self), stream, generation));
            if let Some(stale) = slot.replace(Connection {
                generation,
                outbound: outbound_tx,
                reader,
            }) {
                stale.reader.abort();
            }
            self.connected.store(true, Ordering::SeqCst);
            generation
        };

        self.backoff.lock().reset();
        self.status_tx
            .send_replace(SessionStatus::Connected { generation });
        info!(
            "✅ [HA WS] Authenticated (Home Assistant {}, connection #{})",
            ha_version.as_deref().unwrap_or("unknown"),
            generation
        );
        Ok(())
    }

    /// Drop the current connection, failing calls and deactivating
    /// subscriptions that belonged to it
    fn teardown(&self) {
        let Some(conn) = self.connection.lock().take() else {
            return;
        };
        self.connected.store(false, Ordering::SeqCst);
        conn.reader.abort();
        let _ = conn.outbound.send(Message::Close(None));

        let failed = self.pending.lock().fail_all();
        let deactivated = self.subscriptions.lock().mark_all_inactive();
        self.status_tx.send_replace(SessionStatus::Disconnected);
        debug!(
            "🔌 [HA WS] Connection #{} dropped ({} pending calls failed, {} subscriptions inactive)",
            conn.generation, failed, deactivated
        );
    }

    /// Reader observed the end of the transport for `generation`
    fn on_connection_closed(self: &Arc<Self>, generation: u64) {
        {
            let mut slot = self.connection.lock();
            if slot.as_ref().is_none_or(|c| c.generation != generation) {
                return;
            }
            slot.take();
            self.connected.store(false, Ordering::SeqCst);
        }

        let failed = self.pending.lock().fail_all();
        let deactivated = self.subscriptions.lock().mark_all_inactive();
        self.status_tx.send_replace(SessionStatus::Disconnected);
        warn!(
            "🔌 [HA WS] Connection #{} lost ({} pending calls failed, {} subscriptions inactive)",
            generation, failed, deactivated
        );

        if self.config.auto_reconnect && !self.closed.load(Ordering::SeqCst) {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = inner.reconnect().await {
                    error!("❌ [HA WS] Automatic reconnect stopped: {}", e);
                }
            });
        }
    }

    fn send_request(&self, id: u64, request_type: &str, payload: Value) -> HaResult<()> {
        let mut message = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(HaError::Protocol(format!(
                    "request payload must be a JSON object, got {other}"
                )));
            }
        };
        message.insert("id".to_owned(), Value::from(id));
        message.insert("type".to_owned(), Value::from(request_type));

        let slot = self.connection.lock();
        let conn = slot
            .as_ref()
            .filter(|_| self.connected.load(Ordering::SeqCst))
            .ok_or(HaError::ConnectionLost)?;

        trace!("➡️ [HA WS] {} (id {})", request_type, id);
        conn.outbound
            .send(Message::text(Value::Object(message).to_string()))
            .map_err(|_| HaError::ConnectionLost)
    }

    async fn await_response(
        &self,
        id: u64,
        request_type: &str,
        rx: oneshot::Receiver<CallResult>,
    ) -> HaResult<Value> {
        match tokio::time::timeout(self.config.call_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HaError::ConnectionLost),
            Err(_) => {
                self.pending.lock().remove(id);
                let timeout_ms =
                    u64::try_from(self.config.call_timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(
                    "⏱️ [HA WS] {} (id {}) timed out after {}ms",
                    request_type, id, timeout_ms
                );
                Err(HaError::Timeout {
                    request_type: request_type.to_owned(),
                    timeout_ms,
                })
            }
        }
    }

    fn handle_message(&self, text: &str) {
        let message: InboundMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("⚠️ [HA WS] Unparseable message: {}", e);
                return;
            }
        };

        match message {
            InboundMessage::Result {
                id,
                success,
                result,
                error,
            } => {
                let outcome = if success {
                    Ok(result)
                } else {
                    let (code, message) = error.map_or_else(
                        || ("unknown_error".to_owned(), "request failed".to_owned()),
                        |e| (e.code, e.message),
                    );
                    Err(HaError::Api { code, message })
                };
                if !self.pending.lock().resolve(id, outcome) {
                    trace!("Result for unknown or expired id {}", id);
                }
            }
            InboundMessage::Pong { id } => {
                self.pending.lock().resolve(id, Ok(Value::Null));
            }
            InboundMessage::Event { id, event } => {
                let handler = self.subscriptions.lock().handler_for(id, &event);
                match handler {
                    Some(handler) => handler(event),
                    None => trace!("Event for inactive subscription {}", id),
                }
            }
            InboundMessage::AuthRequired { .. }
            | InboundMessage::AuthOk { .. }
            | InboundMessage::AuthInvalid { .. } => {
                debug!("Ignoring auth message on an authenticated connection");
            }
            InboundMessage::Unknown => trace!("Ignoring message of unknown type"),
        }
    }
}

async fn handshake(ws: &mut WsStream, token: &str) -> HaResult<Option<String>> {
    match next_inbound(ws).await? {
        InboundMessage::AuthRequired { .. } => {}
        other => {
            return Err(HaError::Protocol(format!(
                "expected auth_required, got {other:?}"
            )));
        }
    }

    let auth = json!({ "type": "auth", "access_token": token });
    ws.send(Message::text(auth.to_string()))
        .await
        .map_err(|e| HaError::Connect(e.to_string()))?;

    match next_inbound(ws).await? {
        InboundMessage::AuthOk { ha_version } => Ok(ha_version),
        InboundMessage::AuthInvalid { message } => Err(HaError::Auth(
            message.unwrap_or_else(|| "invalid access token".to_owned()),
        )),
        other => Err(HaError::Protocol(format!(
            "expected auth_ok, got {other:?}"
        ))),
    }
}

async fn next_inbound(ws: &mut WsStream) -> HaResult<InboundMessage> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Ok(serde_json::from_str(text.as_str())?),
            Some(Ok(Message::Close(_))) | None => {
                return Err(HaError::Connect(
                    "connection closed during handshake".to_owned(),
                ));
            }
            Some(Ok(Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
            Some(Err(e)) => return Err(HaError::Connect(e.to_string())),
        }
    }
}

async fn read_loop(inner: Weak<Inner>, mut stream: SplitStream<WsStream>, generation: u64) {
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(frame)) => {
                debug!("🔌 [HA WS] Server closed connection: {:?}", frame);
                break;
            }
            Ok(Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {
                continue;
            }
            Err(e) => {
                warn!("⚠️ [HA WS] Read error: {}", e);
                break;
            }
        };

        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.handle_message(text.as_str());
    }

    if let Some(inner) = inner.upgrade() {
        inner.on_connection_closed(generation);
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            debug!("WebSocket write failed: {}", e);
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}
