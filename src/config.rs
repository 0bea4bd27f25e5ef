use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

const SETTINGS_FILE_NAME: &str = "fleet_settings.json";

/// Process-level configuration, fixed for the lifetime of the service.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub broker_url: String,
    pub client_id: String,
    pub database_path: PathBuf,
    pub beacon_group: String,
    pub beacon_port: u16,
    pub ping_timeout_ms: u64,
    pub ping_interval_secs: u64,
    pub settings_path: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let broker_url =
            env::var("FLEET_BROKER_URL").unwrap_or_else(|_| "mqtt://localhost:1883".to_string());
        let client_id = env::var("FLEET_CLIENT_ID")
            .unwrap_or_else(|_| format!("camera-fleet-{}", Uuid::new_v4()));
        let database_path = env::var("FLEET_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./camera_fleet.db"));
        let beacon_group =
            env::var("FLEET_BEACON_GROUP").unwrap_or_else(|_| "239.255.0.1".to_string());
        let beacon_port = u16::try_from(get_env_var_u64("FLEET_BEACON_PORT", 5005))
            .context("FLEET_BEACON_PORT out of range")?;

        let ping_timeout_ms = get_env_var_u64("FLEET_PING_TIMEOUT_MS", 2000);
        let ping_interval_secs = get_env_var_u64("FLEET_PING_INTERVAL_SECS", 30);

        Ok(Config {
            broker_url,
            client_id,
            database_path,
            beacon_group,
            beacon_port,
            ping_timeout_ms,
            ping_interval_secs,
            settings_path: settings_file_path(),
        })
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

fn settings_file_path() -> PathBuf {
    let config_dir = env::var("CONFIG_DIR").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(config_dir).join(SETTINGS_FILE_NAME)
}

fn get_env_var_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}

/// Operator-tunable values, re-read at the start of every dispatch.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub max_concurrent_time_sync: usize,
    pub max_concurrent_update: usize,
    pub max_concurrent_send: usize,
    pub capture_lead_time_ms: u64,
    pub picture_destination: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent_time_sync: 10,
            max_concurrent_update: 8,
            max_concurrent_send: 4,
            capture_lead_time_ms: 1500,
            picture_destination: "smb://archive/pictures".to_string(),
        }
    }
}

impl Settings {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        let settings: Settings = serde_json::from_str(&contents)
            .with_context(|| format!("parsing settings in {}", path.display()))?;
        Ok(settings)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        let mut file = fs::File::create(path)?;
        file.write_all(contents.as_bytes())?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct LiveSettings {
    inner: Arc<RwLock<Settings>>,
}

impl LiveSettings {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn current(&self) -> Settings {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, settings: Settings) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    /// A missing file means defaults. A file that cannot be parsed leaves the
    /// previous values in place.
    pub fn reload_from_file(&self, path: &Path) {
        match fs::read_to_string(path) {
            Ok(_) => match Settings::load_from_file(path) {
                Ok(settings) => {
                    if settings != self.current() {
                        info!(?settings, "Settings reloaded");
                        self.replace(settings);
                    }
                }
                Err(e) => warn!(error = %e, "Keeping previous settings"),
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let defaults = Settings::default();
                if defaults != self.current() {
                    info!("Settings file removed, using defaults");
                    self.replace(defaults);
                }
            }
            Err(e) => warn!(error = %e, path = %path.display(), "Keeping previous settings"),
        }
    }
}
