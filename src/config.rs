//! # Controller Configuration
//!
//! Session configuration for the wave controller, loaded from TOML. Every field has a
//! default so a partial (or empty) file is valid.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [controller]
//! address = "192.168.1.1"
//! slot = 1
//! program = "Wave_Control"
//!
//! [timing]
//! homing_poll_ms = 5000
//!
//! [telemetry]
//! enabled = true
//! interval = 0.5
//! duration = 20.0
//! ```
//!
//! ## Example: Rust Usage
//!
//! ```rust
//! use wave_control::config::Config;
//! let config: Config = toml::from_str("[controller]\nslot = 2\n").unwrap();
//! assert_eq!(config.controller.slot, 2);
//! assert_eq!(config.controller.program, "Wave_Control");
//! assert_eq!(config.telemetry.interval, 0.25);
//! ```

// src/config.rs - Single configuration file
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::hardware::TagValue;
use crate::telemetry::TelemetryConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration struct: controller link, timing, telemetry and storage.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Programmable controller address and tag layout.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_slot")]
    pub slot: u8,
    /// TCP port of the tag gateway fronting the controller.
    #[serde(default = "default_gateway_port")]
    pub gateway_port: u16,
    /// Controller program that owns every tag, e.g. `Program:Wave_Control.Run_1`.
    #[serde(default = "default_program")]
    pub program: String,
    /// Bit of the per-axis status word that reports "homed".
    #[serde(default = "default_home_bit")]
    pub home_bit: u8,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            slot: default_slot(),
            gateway_port: default_gateway_port(),
            program: default_program(),
            home_bit: default_home_bit(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl ControllerConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if u32::from(self.home_bit) >= TagValue::BITS {
            return Err(ConfigError::Invalid(format!(
                "controller.home_bit must be below {}, got {}",
                TagValue::BITS,
                self.home_bit
            )));
        }
        Ok(())
    }
}

/// Settle and poll durations. The same values drive the connected and simulated paths.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimingConfig {
    /// How long a boot / clear-fault pulse is held high.
    #[serde(default = "default_hold_ms")]
    pub pulse_hold_ms: u64,
    /// How long a single stroke runs before its run tag is dropped.
    #[serde(default = "default_hold_ms")]
    pub stroke_hold_ms: u64,
    #[serde(default = "default_hold_ms")]
    pub curve_hold_ms: u64,
    /// Wait between resetting and re-arming the home trigger.
    #[serde(default = "default_hold_ms")]
    pub homing_settle_ms: u64,
    #[serde(default = "default_hold_ms")]
    pub homing_poll_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            pulse_hold_ms: default_hold_ms(),
            stroke_hold_ms: default_hold_ms(),
            curve_hold_ms: default_hold_ms(),
            homing_settle_ms: default_hold_ms(),
            homing_poll_ms: default_hold_ms(),
        }
    }
}

impl TimingConfig {
    /// Every duration set to `ms`; handy for simulation runs and tests.
    pub fn uniform(ms: u64) -> Self {
        Self {
            pulse_hold_ms: ms,
            stroke_hold_ms: ms,
            curve_hold_ms: ms,
            homing_settle_ms: ms,
            homing_poll_ms: ms,
        }
    }

    pub fn pulse_hold(&self) -> Duration {
        Duration::from_millis(self.pulse_hold_ms)
    }

    pub fn stroke_hold(&self) -> Duration {
        Duration::from_millis(self.stroke_hold_ms)
    }

    pub fn curve_hold(&self) -> Duration {
        Duration::from_millis(self.curve_hold_ms)
    }

    pub fn homing_settle(&self) -> Duration {
        Duration::from_millis(self.homing_settle_ms)
    }

    pub fn homing_poll(&self) -> Duration {
        Duration::from_millis(self.homing_poll_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_dir")]
    pub directory: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            directory: default_storage_dir(),
        }
    }
}

fn default_address() -> String {
    "192.168.1.1".to_string()
}
fn default_slot() -> u8 {
    1
}
fn default_gateway_port() -> u16 {
    44818
}
fn default_program() -> String {
    "Wave_Control".to_string()
}
fn default_home_bit() -> u8 {
    11
}
fn default_command_timeout_ms() -> u64 {
    2000
}
fn default_hold_ms() -> u64 {
    5000
}
fn default_storage_dir() -> PathBuf {
    PathBuf::from("analytics")
}

pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str::<Config>(&contents) {
            Ok(config) => {
                if let Err(e) = config.controller.validate() {
                    tracing::error!("{}", e);
                    return Err(e);
                }
                Ok(config)
            }
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                Err(ConfigError::Toml(e))
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            Err(ConfigError::Io(e))
        }
    }
}
