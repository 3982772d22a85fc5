// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Configuration file handling.
//!
//! Loads the daemon settings and per-fan curves from TOML and validates them
//! into [`FanSettings`] before any control component is built.
//! Default path: `/etc/openfand/openfand.toml`

use crate::openfan::{FAN_COUNT, FanId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/openfand/openfand.toml";

/// Default daemon socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/run/openfand/openfand.sock";

/// Default temperature poll interval in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{section}: {reason}")]
    Invalid { section: String, reason: String },
}

// ---------------------------------------------------------------------------
// File types
// ---------------------------------------------------------------------------

/// Top-level configuration, as written on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Enables debug logging, including serial diagnostics.
    #[serde(default)]
    pub debug: bool,

    /// Path for the Unix domain socket serving `/monitor`.
    #[serde(default = "default_socket_path")]
    pub socket: String,

    /// Poll interval for the temperature collector, in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Per-fan settings keyed by fan name (`fan1` .. `fan10`).
    #[serde(default)]
    pub fan_settings: BTreeMap<String, FanConfig>,
}

/// One fan section of the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanConfig {
    #[serde(default)]
    pub label: String,

    /// How long a higher PWM must persist before it is applied.
    #[serde(default)]
    pub fan_step_up_ms: u64,

    /// How long a lower PWM must persist before it is applied.
    #[serde(default)]
    pub fan_step_down_ms: u64,

    #[serde(default)]
    pub curve_points: Vec<CurvePointConfig>,
}

/// A curve point as written in the file: `pwm = "40%"` plus sensor thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurvePointConfig {
    pub pwm: String,
    #[serde(default)]
    pub thresholds: BTreeMap<String, i32>,
}

// ---------------------------------------------------------------------------
// Validated types
// ---------------------------------------------------------------------------

/// A validated curve point: a PWM percentage reached at each sensor threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct CurvePoint {
    pub pwm: u8,
    pub thresholds: BTreeMap<String, i32>,
}

/// Validated settings for one fan.
#[derive(Debug, Clone)]
pub struct FanSettings {
    pub id: FanId,
    pub label: String,
    pub step_up: Duration,
    pub step_down: Duration,
    /// Ordered, non-empty, with non-decreasing PWM.
    pub curve_points: Vec<CurvePoint>,
}

impl FanSettings {
    /// Names of every sensor referenced by this fan's curve.
    pub fn sensor_names(&self) -> impl Iterator<Item = &str> {
        self.curve_points
            .iter()
            .flat_map(|p| p.thresholds.keys().map(String::as_str))
    }
}

impl Config {
    /// Validate every fan section, returning them ordered by fan id.
    pub fn fans(&self) -> Result<Vec<FanSettings>, ConfigError> {
        let mut fans = Vec::with_capacity(self.fan_settings.len());
        for (name, fan) in &self.fan_settings {
            fans.push(validate_fan(name, fan)?);
        }
        fans.sort_by_key(|f| f.id);
        Ok(fans)
    }

    /// Check the daemon settings and every fan section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                section: "poll_interval_ms".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        self.fans()?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn validate_fan(name: &str, fan: &FanConfig) -> Result<FanSettings, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        section: name.to_string(),
        reason,
    };

    let id = parse_fan_name(name).ok_or_else(|| invalid("invalid name".to_string()))?;

    if fan.curve_points.is_empty() {
        return Err(invalid("no curve_points provided".to_string()));
    }

    let mut points = Vec::with_capacity(fan.curve_points.len());
    let mut prev_pwm = 0;
    for point in &fan.curve_points {
        let pwm = parse_pwm(&point.pwm)
            .ok_or_else(|| invalid(format!("invalid pwm format {}", point.pwm)))?;
        if pwm > 100 {
            return Err(invalid(format!("{}: pwm must be in range [0,100]", point.pwm)));
        }
        if pwm < prev_pwm {
            return Err(invalid(format!(
                "{}: pwm lower than the previous one",
                point.pwm
            )));
        }
        prev_pwm = pwm;

        if point.thresholds.is_empty() {
            return Err(invalid(format!(
                "{}: no temperature thresholds specified",
                point.pwm
            )));
        }

        points.push(CurvePoint {
            pwm: pwm as u8,
            thresholds: point.thresholds.clone(),
        });
    }

    Ok(FanSettings {
        id,
        label: fan.label.clone(),
        step_up: Duration::from_millis(fan.fan_step_up_ms),
        step_down: Duration::from_millis(fan.fan_step_down_ms),
        curve_points: points,
    })
}

/// `fan1` => 0, `fan10` => 9.
fn parse_fan_name(name: &str) -> Option<FanId> {
    let digits = name.strip_prefix("fan")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let n: u8 = digits.parse().ok()?;
    if n < 1 || n > FAN_COUNT {
        return None;
    }
    FanId::new(n - 1)
}

/// `"40%"` => 40. Values above 100 are returned and rejected by the caller.
fn parse_pwm(s: &str) -> Option<u32> {
    let digits = s.trim().strip_suffix('%')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Load, parse and validate the config file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&contents)
}

/// Parse and validate config contents.
pub fn parse_config(contents: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(contents)?;
    config.validate()?;
    Ok(config)
}

/// Resolve the config file path from CLI arg or default.
pub fn resolve_config_path(cli_path: Option<&str>) -> PathBuf {
    cli_path
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_socket_path() -> String {
    DEFAULT_SOCKET_PATH.to_string()
}
