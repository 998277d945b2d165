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
use fluxion_core::RecorderConfig;
use fluxion_ha::{ClientConfig, SUPERVISOR_WS_URL};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ADDON_OPTIONS_PATH: &str = "/data/options.json";
const DEFAULT_CONFIG_PATH: &str = "config.toml";
const DEFAULT_BASE_URL: &str = "http://localhost:8123";

const DOCUMENT_DB_FILE: &str = "entities.db";
const TIMESERIES_DB_FILE: &str = "timeseries.db";

const MAX_BACKFILL_LOOKBACK_HOURS: u64 = 24 * 365;
const MAX_SEED_LOOKBACK_DAYS: u64 = 10 * 365;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: String,
    pub hub: HubConfig,
    pub storage: StorageConfig,
    pub recorder: RecorderSettings,
}

/// Home Assistant connection settings
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// HTTP or WebSocket URL of the instance. Ignored when running as an add-on.
    pub ha_base_url: Option<String>,
    pub ha_token: Option<String>,
    pub call_timeout_secs: u64,
    pub auto_reconnect: bool,

    /// Injected by the Supervisor, never read from files
    #[serde(skip)]
    pub supervisor_token: Option<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            ha_base_url: None,
            ha_token: None,
            call_timeout_secs: 30,
            auto_reconnect: true,
            supervisor_token: None,
        }
    }
}

impl fmt::Debug for HubConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubConfig")
            .field("ha_base_url", &self.ha_base_url)
            .field("ha_token", &self.ha_token.as_ref().map(|_| "<redacted>"))
            .field("call_timeout_secs", &self.call_timeout_secs)
            .field("auto_reconnect", &self.auto_reconnect)
            .field(
                "supervisor_token",
                &self.supervisor_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Overrides `<data_dir>/entities.db`
    pub document_db: Option<PathBuf>,
    /// Overrides `<data_dir>/timeseries.db`
    pub timeseries_db: Option<PathBuf>,
    pub sync_log_retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            document_db: None,
            timeseries_db: None,
            sync_log_retention_days: 30,
        }
    }
}

impl StorageConfig {
    pub fn document_path(&self) -> PathBuf {
        self.document_db
            .clone()
            .unwrap_or_else(|| self.data_dir.join(DOCUMENT_DB_FILE))
    }

    pub fn timeseries_path(&self) -> PathBuf {
        self.timeseries_db
            .clone()
            .unwrap_or_else(|| self.data_dir.join(TIMESERIES_DB_FILE))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderSettings {
    pub heartbeat_interval_secs: u64,
    pub idle_threshold_secs: u64,
    pub backfill_interval_secs: u64,
    pub backfill_lookback_hours: u64,
    pub seed_lookback_days: u64,
    pub rate_limit_window_secs: u64,
    pub auto_track_new_entities: bool,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 180,
            idle_threshold_secs: 300,
            backfill_interval_secs: 3600,
            backfill_lookback_hours: 24,
            seed_lookback_days: 30,
            rate_limit_window_secs: 30,
            auto_track_new_entities: true,
        }
    }
}

/// Where the configuration came from, for the startup banner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    AddonOptions,
    File(PathBuf),
    Defaults,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddonOptions => write!(f, "HA addon options"),
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Defaults => write!(f, "defaults"),
        }
    }
}

impl AppConfig {
    /// Load configuration in order of preference:
    /// HA addon options, the explicit path (or `config.toml`), then defaults.
    /// Environment overrides are applied on top of whichever source won.
    pub fn load(explicit_path: Option<&Path>) -> Result<(Self, ConfigSource)> {
        Self::load_from(Path::new(ADDON_OPTIONS_PATH), explicit_path, |key| {
            std::env::var(key).ok()
        })
    }

    fn load_from<F>(
        options_path: &Path,
        explicit_path: Option<&Path>,
        env: F,
    ) -> Result<(Self, ConfigSource)>
    where
        F: Fn(&str) -> Option<String>,
    {
        let (mut config, source) = if options_path.exists() {
            let options_str = std::fs::read_to_string(options_path)
                .context("Failed to read HA addon options")?;
            let config: Self =
                serde_json::from_str(&options_str).context("Failed to parse HA addon options")?;
            (config, ConfigSource::AddonOptions)
        } else if let Some(path) = explicit_path {
            (Self::from_file(path)?, ConfigSource::File(path.to_path_buf()))
        } else if Path::new(DEFAULT_CONFIG_PATH).exists() {
            let path = Path::new(DEFAULT_CONFIG_PATH);
            (Self::from_file(path)?, ConfigSource::File(path.to_path_buf()))
        } else {
            (Self::default(), ConfigSource::Defaults)
        };

        config.apply_env(env);
        config.validate()?;
        Ok((config, source))
    }

    /// Parse a TOML file, or JSON when the extension says so
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))
        } else {
            toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
        }
    }

    fn apply_env<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = env("HA_BASE_URL") {
            self.hub.ha_base_url = Some(url);
        }
        if let Some(token) = env("HA_TOKEN") {
            self.hub.ha_token = Some(token);
        }
        if let Some(token) = env("SUPERVISOR_TOKEN")
            && !token.is_empty()
        {
            self.hub.supervisor_token = Some(token);
        }
        if let Some(dir) = env("FLUXION_RECORDER_DB_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Some(level) = env("LOG_LEVEL") {
            self.log_level = level;
        }
        if self.log_level.is_empty() {
            "info".clone_into(&mut self.log_level);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let recorder = &self.recorder;
        let intervals = [
            ("recorder.heartbeat_interval_secs", recorder.heartbeat_interval_secs),
            ("recorder.idle_threshold_secs", recorder.idle_threshold_secs),
            ("recorder.backfill_interval_secs", recorder.backfill_interval_secs),
            ("recorder.backfill_lookback_hours", recorder.backfill_lookback_hours),
            ("recorder.seed_lookback_days", recorder.seed_lookback_days),
            ("recorder.rate_limit_window_secs", recorder.rate_limit_window_secs),
            ("hub.call_timeout_secs", self.hub.call_timeout_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                anyhow::bail!("{name} must be greater than zero");
            }
        }

        let lookbacks = [
            (
                "recorder.backfill_lookback_hours",
                recorder.backfill_lookback_hours,
                MAX_BACKFILL_LOOKBACK_HOURS,
            ),
            (
                "recorder.seed_lookback_days",
                recorder.seed_lookback_days,
                MAX_SEED_LOOKBACK_DAYS,
            ),
        ];
        for (name, value, max) in lookbacks {
            if value > max {
                anyhow::bail!("{name} must be at most {max}");
            }
        }

        if self.storage.sync_log_retention_days == 0 {
            anyhow::bail!("storage.sync_log_retention_days must be greater than zero");
        }

        if self.storage.document_path() == self.storage.timeseries_path() {
            anyhow::bail!("Document and time-series databases must use different files");
        }

        Ok(())
    }

    /// Client settings. The Supervisor endpoint wins when its token is present.
    pub fn client_config(&self) -> Result<ClientConfig> {
        let mut config = if let Some(token) = &self.hub.supervisor_token {
            ClientConfig::new(SUPERVISOR_WS_URL, token.clone())
        } else {
            let token = self
                .hub
                .ha_token
                .clone()
                .context("HA token not found in config or HA_TOKEN environment variable")?;
            let base_url = self.hub.ha_base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
            ClientConfig::new(base_url, token)
        };

        config.call_timeout = Duration::from_secs(self.hub.call_timeout_secs);
        config.auto_reconnect = self.hub.auto_reconnect;
        Ok(config)
    }
}

impl From<&AppConfig> for RecorderConfig {
    fn from(config: &AppConfig) -> Self {
        let settings = &config.recorder;
        Self {
            heartbeat_interval: Duration::from_secs(settings.heartbeat_interval_secs),
            idle_threshold: Duration::from_secs(settings.idle_threshold_secs),
            backfill_interval: Duration::from_secs(settings.backfill_interval_secs),
            backfill_lookback: Duration::from_secs(
                settings.backfill_lookback_hours.saturating_mul(3600),
            ),
            seed_lookback: Duration::from_secs(settings.seed_lookback_days.saturating_mul(86_400)),
            rate_limit_window: Duration::from_secs(settings.rate_limit_window_secs),
            auto_track_new_entities: settings.auto_track_new_entities,
        }
    }
}
