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

//! Correlation table for requests awaiting a `result` message

use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::oneshot;

use crate::errors::HaError;

pub type CallResult = Result<Value, HaError>;

#[derive(Debug)]
struct PendingCall {
    request_type: String,
    sent_at: Instant,
    tx: oneshot::Sender<CallResult>,
}

/// Outstanding requests keyed by message id
///
/// Ids start at 1 and only ever grow, across reconnects too, so a late
/// response from a previous connection can never resolve a newer call.
#[derive(Debug)]
pub struct PendingCalls {
    next_id: u64,
    calls: HashMap<u64, PendingCall>,
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            calls: HashMap::new(),
        }
    }

    /// Allocate the next id and park a receiver for its response
    pub fn register(&mut self, request_type: &str) -> (u64, oneshot::Receiver<CallResult>) {
        let id = self.next_id;
        self.next_id += 1;

        let (tx, rx) = oneshot::channel();
        self.calls.insert(
            id,
            PendingCall {
                request_type: request_type.to_owned(),
                sent_at: Instant::now(),
                tx,
            },
        );
        (id, rx)
    }

    /// Hand `result` to the caller waiting on `id` and forget the slot.
    /// Returns false for ids that are unknown (already timed out or failed).
    pub fn resolve(&mut self, id: u64, result: CallResult) -> bool {
        let Some(call) = self.calls.remove(&id) else {
            return false;
        };
        tracing::trace!(
            id,
            request_type = %call.request_type,
            elapsed_ms = call.sent_at.elapsed().as_millis(),
            "Resolved pending call"
        );
        // The caller may have given up already; nothing to do then.
        let _ = call.tx.send(result);
        true
    }

    pub fn remove(&mut self, id: u64) -> bool {
        self.calls.remove(&id).is_some()
    }

    /// Fail every outstanding call with `ConnectionLost`, returning how many
    pub fn fail_all(&mut self) -> usize {
        let count = self.calls.len();
        for (_, call) in self.calls.drain() {
            let _ = call.tx.send(Err(HaError::ConnectionLost));
        }
        count
    }

    pub fn contains(&self, id: u64) -> bool {
        self.calls.contains_key(&id)
    }

    pub fn request_type(&self, id: u64) -> Option<&str> {
        self.calls.get(&id).map(|c| c.request_type.as_str())
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}
