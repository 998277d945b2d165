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

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecorderError {
    #[error("hub session error: {0}")]
    Hub(String),

    #[error("time-series write failed: {0}")]
    SinkWrite(String),

    #[error("entity registry error: {0}")]
    Registry(String),

    #[error("reconciliation failed for {entity_id}: {reason}")]
    Reconciliation { entity_id: String, reason: String },

    #[error("rate limited, retry in {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("recorder is shutting down")]
    ShuttingDown,
}

impl RecorderError {
    /// Wrap a collaborator error, keeping its whole context chain
    pub fn hub(err: &anyhow::Error) -> Self {
        Self::Hub(format!("{err:#}"))
    }

    pub fn sink_write(err: &anyhow::Error) -> Self {
        Self::SinkWrite(format!("{err:#}"))
    }

    pub fn registry(err: &anyhow::Error) -> Self {
        Self::Registry(format!("{err:#}"))
    }

    pub fn reconciliation(entity_id: &str, err: &anyhow::Error) -> Self {
        Self::Reconciliation {
            entity_id: entity_id.to_owned(),
            reason: format!("{err:#}"),
        }
    }
}

pub type RecorderResult<T> = Result<T, RecorderError>;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_context_chain_is_kept() {
        let err = Err::<(), _>(anyhow::anyhow!("connection refused"))
            .context("statistics_during_period")
            .unwrap_err();

        let wrapped = RecorderError::reconciliation("sensor.pv_energy", &err);
        assert_eq!(
            wrapped.to_string(),
            "reconciliation failed for sensor.pv_energy: statistics_during_period: connection refused"
        );
    }
}
