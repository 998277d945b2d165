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

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HaError {
    /// Credentials were rejected; retrying with the same token is pointless
    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("failed to connect to Home Assistant: {0}")]
    Connect(String),

    #[error("connection to Home Assistant lost")]
    ConnectionLost,

    #[error("request '{request_type}' timed out after {timeout_ms}ms")]
    Timeout {
        request_type: String,
        timeout_ms: u64,
    },

    #[error("Home Assistant returned error {code}: {message}")]
    Api { code: String, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl HaError {
    /// Transport-level failures that a reconnect with backoff can cure
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::ConnectionLost)
    }
}

pub type HaResult<T> = Result<T, HaError>;
