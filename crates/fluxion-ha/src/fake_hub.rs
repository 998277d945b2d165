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

//! In-process WebSocket server speaking enough of the Home Assistant
//! protocol for client tests

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

/// What the hub does with one request
#[derive(Debug, Clone)]
pub enum Reply {
    Result(Value),
    Error { code: String, message: String },
    Pong,
    /// Never answer
    Silent,
    /// Drop the connection instead of answering
    Close,
    /// Acknowledge, then push each value as the `event` of this request id
    Events(Vec<Value>),
}

type Responder = Arc<dyn Fn(&Value) -> Reply + Send + Sync>;

#[derive(Debug)]
pub struct FakeHub {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl FakeHub {
    pub const TOKEN: &'static str = "test-token";

    pub async fn start<F>(responder: F) -> Self
    where
        F: Fn(&Value) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let responder: Responder = Arc::new(responder);

        let counter = Arc::clone(&accepted);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, Arc::clone(&responder)));
            }
        });

        Self {
            addr,
            accepted,
            task,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/api/websocket", self.addr)
    }

    /// Number of TCP connections accepted so far
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for FakeHub {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(stream: TcpStream, responder: Responder) {
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
    if auth["access_token"] != FakeHub::TOKEN {
        let invalid = json!({"type": "auth_invalid", "message": "Invalid access token"});
        let _ = ws.send(Message::text(invalid.to_string())).await;
        let _ = ws.close(None).await;
        return;
    }
    let ok = json!({"type": "auth_ok", "ha_version": "2025.10.0"});
    if ws.send(Message::text(ok.to_string())).await.is_err() {
        return;
    }

    while let Some(Ok(frame)) = ws.next().await {
        let Message::Text(text) = frame else {
            continue;
        };
        let Ok(request) = serde_json::from_str::<Value>(text.as_str()) else {
            continue;
        };
        let id = request["id"].clone();

        let outgoing = match responder(&request) {
            Reply::Result(result) => {
                vec![json!({"id": id, "type": "result", "success": true, "result": result})]
            }
            Reply::Error { code, message } => vec![json!({
                "id": id,
                "type": "result",
                "success": false,
                "error": {"code": code, "message": message}
            })],
            Reply::Pong => vec![json!({"id": id, "type": "pong"})],
            Reply::Silent => Vec::new(),
            Reply::Close => {
                let _ = ws.close(None).await;
                return;
            }
            Reply::Events(events) => {
                let mut messages =
                    vec![json!({"id": id, "type": "result", "success": true, "result": null})];
                messages.extend(
                    events
                        .into_iter()
                        .map(|event| json!({"id": id, "type": "event", "event": event})),
                );
                messages
            }
        };

        for message in outgoing {
            if ws.send(Message::text(message.to_string())).await.is_err() {
                return;
            }
        }
    }
}
