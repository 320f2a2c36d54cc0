use crate::model::calibration::PARK_STEP_DEG;
use crate::model::tracking_manager::TrackingConfig;
use crate::model::{RotatorError, RotatorResult};
use pass_planner::{GroundStation, PropagationModel, VisibilitySettings};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

const APP_NAME: &str = "rotator_control";
const CONFIG_FILE_NAME: &str = "config.json";

pub fn default_config_path() -> PathBuf {
    let mut dir = dirs_next::config_dir().unwrap_or_else(|| {
        dirs_next::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
    });
    dir.push(APP_NAME);
    dir.push(CONFIG_FILE_NAME);
    dir
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SerialConfig {
    /// Ports tried in order; the last one that opened is tried first on reopen
    pub candidates: Vec<String>,
    pub baud_rate: u32,
    pub timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            candidates: vec![
                "/dev/ttyUSB0".to_string(),
                "/dev/ttyUSB1".to_string(),
                "COM3".to_string(),
                "COM4".to_string(),
            ],
            baud_rate: 9600,
            timeout_ms: 1500,
        }
    }
}

impl SerialConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TrackingSettings {
    pub az_deadband_deg: f64,
    pub el_deadband_deg: f64,
    pub min_interval_ms: u64,
    pub zenith_freeze_deg: f64,
    pub retries: u32,
    pub unwrap_azimuth: bool,
    pub az_slew_deg_per_s: f64,
    pub el_slew_deg_per_s: f64,
    pub tick_ms: u64,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        let defaults = TrackingConfig::default();
        Self {
            az_deadband_deg: defaults.az_deadband_deg,
            el_deadband_deg: defaults.el_deadband_deg,
            min_interval_ms: defaults.min_interval.num_milliseconds().max(0) as u64,
            zenith_freeze_deg: defaults.zenith_freeze_deg,
            retries: defaults.retries,
            unwrap_azimuth: defaults.unwrap_azimuth,
            az_slew_deg_per_s: defaults.az_slew_deg_per_s,
            el_slew_deg_per_s: defaults.el_slew_deg_per_s,
            tick_ms: 500,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct VisibilityConfig {
    pub prefetch_hours: i64,
    pub cadence_s: i64,
    pub min_elevation_deg: f64,
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self {
            prefetch_hours: 24,
            cadence_s: 30,
            min_elevation_deg: 0.0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SimulationConfig {
    pub az_rate_deg_s: f64,
    pub el_rate_deg_s: f64,
    pub settle_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            az_rate_deg_s: 6.0,
            el_rate_deg_s: 6.0,
            settle_ms: 500,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Park azimuth staged by the last completed calibration
    pub park_azimuth_deg: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
    pub location: Location,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub tracking: TrackingSettings,
    #[serde(default)]
    pub visibility: VisibilityConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            location: Location {
                latitude: 45.503575,
                longitude: -73.587090,
                altitude: 100.0,
            },
            serial: SerialConfig::default(),
            tracking: TrackingSettings::default(),
            visibility: VisibilityConfig::default(),
            simulation: SimulationConfig::default(),
            calibration: CalibrationConfig::default(),
        }
    }
}

impl Config {
    /// Load from the default location, or return default if missing
    pub fn load_or_default() -> Result<Self, ConfigError> {
        Self::load_from_or_default(default_config_path())
    }

    pub fn load_from_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            let raw = fs::read_to_string(path)?;
            let cfg = serde_json::from_str(&raw)?;
            Ok(cfg)
        } else {
            log::info!("no config at {}, using defaults", path.display());
            Ok(Config::default())
        }
    }

    /// Save current config to the default location
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(default_config_path())
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized)?;
        Ok(())
    }

    /// Rejects values the core cannot run with. Called once at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        GroundStation::new(
            self.location.latitude,
            self.location.longitude,
            self.location.altitude,
        )
        .map_err(|e| ConfigError::Invalid(format!("ground station: {e}")))?;

        if self.serial.baud_rate == 0 || self.serial.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "serial baud rate and timeout must be positive".to_string(),
            ));
        }
        let t = &self.tracking;
        // Written as negated comparisons so NaN is rejected too
        if !(t.az_deadband_deg >= 0.0 && t.el_deadband_deg >= 0.0) {
            return Err(ConfigError::Invalid("deadbands must not be negative".to_string()));
        }
        if !(t.az_slew_deg_per_s > 0.0 && t.el_slew_deg_per_s > 0.0) {
            return Err(ConfigError::Invalid("tracking slew rates must be positive".to_string()));
        }
        if !(0.0..=90.0).contains(&t.zenith_freeze_deg) {
            return Err(ConfigError::Invalid(format!(
                "zenith freeze {} outside [0, 90]",
                t.zenith_freeze_deg
            )));
        }
        if t.tick_ms == 0 {
            return Err(ConfigError::Invalid("tick interval must be positive".to_string()));
        }
        if self.visibility.prefetch_hours <= 0 || self.visibility.cadence_s <= 0 {
            return Err(ConfigError::Invalid(
                "visibility prefetch and cadence must be positive".to_string(),
            ));
        }
        let s = &self.simulation;
        if !(s.az_rate_deg_s > 0.0 && s.el_rate_deg_s > 0.0) {
            return Err(ConfigError::Invalid("simulated slew rates must be positive".to_string()));
        }
        let park = self.calibration.park_azimuth_deg;
        if !(0..360).contains(&park) || park % PARK_STEP_DEG != 0 {
            return Err(ConfigError::Invalid(format!("park azimuth {park} is not a 15° step")));
        }
        Ok(())
    }

    pub fn ground_station(&self) -> RotatorResult<GroundStation> {
        GroundStation::new(
            self.location.latitude,
            self.location.longitude,
            self.location.altitude,
        )
        .map_err(RotatorError::from)
    }

    pub fn tracking_config(&self) -> TrackingConfig {
        TrackingConfig {
            az_deadband_deg: self.tracking.az_deadband_deg,
            el_deadband_deg: self.tracking.el_deadband_deg,
            min_interval: chrono::Duration::milliseconds(self.tracking.min_interval_ms as i64),
            zenith_freeze_deg: self.tracking.zenith_freeze_deg,
            retries: self.tracking.retries,
            unwrap_azimuth: self.tracking.unwrap_azimuth,
            az_slew_deg_per_s: self.tracking.az_slew_deg_per_s,
            el_slew_deg_per_s: self.tracking.el_slew_deg_per_s,
        }
    }

    pub fn visibility_settings(&self, model: PropagationModel) -> VisibilitySettings {
        VisibilitySettings {
            prefetch: chrono::Duration::hours(self.visibility.prefetch_hours),
            cadence: chrono::Duration::seconds(self.visibility.cadence_s),
            min_elevation_deg: self.visibility.min_elevation_deg,
            model,
            ..VisibilitySettings::default()
        }
    }
}
