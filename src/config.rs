/*
 * This file is part of Smartamp.
 *
 * Copyright (C) 2025 Smartamp contributors
 *
 * Smartamp is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Smartamp is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Smartamp. If not, see <https://www.gnu.org/licenses/>.
 */

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

fn default_calib_path() -> PathBuf {
    PathBuf::from("/etc/smartamp/re25_calib.txt")
}

fn default_monitor_period_ms() -> u64 {
    crate::monitor::MONITOR_PERIOD.as_millis() as u64
}

fn default_bus_attempts() -> u8 {
    crate::bus::BUS_ATTEMPTS
}

fn default_bus_retry_delay_ms() -> u64 {
    crate::bus::BUS_RETRY_DELAY.as_millis() as u64
}

fn default_rail_settle_ms() -> u64 {
    crate::power::RAIL_SETTLE.as_millis() as u64
}

/// Driver tunables. Defaults match the shipped firmware timing; a config
/// file only needs to name the fields it overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriverConfig {
    #[serde(default = "default_calib_path")]
    pub calib_path: PathBuf,
    /// Period of the polled recovery probe, per device.
    #[serde(default = "default_monitor_period_ms")]
    pub monitor_period_ms: u64,
    /// Total bus transfer attempts before an operation fails.
    #[serde(default = "default_bus_attempts")]
    pub bus_attempts: u8,
    #[serde(default = "default_bus_retry_delay_ms")]
    pub bus_retry_delay_ms: u64,
    /// Wait after enabling the supply rail before the first bus access.
    #[serde(default = "default_rail_settle_ms")]
    pub rail_settle_ms: u64,
    /// Suppress all recovery passes (bring-up aid).
    #[serde(default)]
    pub skip_monitor: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            calib_path: default_calib_path(),
            monitor_period_ms: default_monitor_period_ms(),
            bus_attempts: default_bus_attempts(),
            bus_retry_delay_ms: default_bus_retry_delay_ms(),
            rail_settle_ms: default_rail_settle_ms(),
            skip_monitor: false,
        }
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        return Path::new(&xdg).join("smartamp").join("config.json");
    }
    if let Ok(home) = env::var("HOME") {
        return Path::new(&home)
            .join(".config")
            .join("smartamp")
            .join("config.json");
    }
    PathBuf::from("/etc/smartamp/config.json")
}

pub fn load_saved_config() -> Option<DriverConfig> {
    let path = config_path();
    let data = fs::read_to_string(&path).ok()?;
    let cfg: DriverConfig = serde_json::from_str(&data).ok()?;
    validate_driver_config(&cfg).ok()?;
    Some(cfg)
}

pub fn validate_driver_config(cfg: &DriverConfig) -> Result<(), String> {
    if cfg.bus_attempts == 0 || cfg.bus_attempts > 10 {
        return Err("bus_attempts out of range (1..=10)".to_string());
    }
    if cfg.bus_retry_delay_ms > 1000 {
        return Err("bus_retry_delay_ms out of range (0..=1000)".to_string());
    }
    if cfg.monitor_period_ms < 10 || cfg.monitor_period_ms > 60_000 {
        return Err("monitor_period_ms out of range (10..=60000)".to_string());
    }
    if cfg.rail_settle_ms > 1000 {
        return Err("rail_settle_ms out of range (0..=1000)".to_string());
    }
    if cfg.calib_path.as_os_str().is_empty() {
        return Err("calib_path must not be empty".to_string());
    }
    Ok(())
}

pub fn try_load_config() -> anyhow::Result<DriverConfig> {
    let path = config_path();
    let data = fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let cfg: DriverConfig = serde_json::from_str(&data).context("parsing driver config")?;
    validate_driver_config(&cfg).map_err(anyhow::Error::msg)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_firmware_timing() {
        let cfg = DriverConfig::default();
        assert_eq!(cfg.monitor_period_ms, 2000);
        assert_eq!(cfg.bus_attempts, 3);
        assert_eq!(cfg.bus_retry_delay_ms, 5);
        assert_eq!(cfg.rail_settle_ms, 10);
        assert!(!cfg.skip_monitor);
        assert!(validate_driver_config(&cfg).is_ok());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let cfg: DriverConfig = serde_json::from_str(r#"{"monitor_period_ms": 500}"#).unwrap();
        assert_eq!(cfg.monitor_period_ms, 500);
        assert_eq!(cfg.bus_attempts, 3);
        assert_eq!(cfg.calib_path, default_calib_path());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let parsed: Result<DriverConfig, _> =
            serde_json::from_str(r#"{"monitor_period": 500}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_validate_bounds() {
        let mut cfg = DriverConfig::default();
        cfg.bus_attempts = 0;
        assert!(validate_driver_config(&cfg).is_err());

        cfg = DriverConfig::default();
        cfg.bus_attempts = 11;
        assert!(validate_driver_config(&cfg).is_err());

        cfg = DriverConfig::default();
        cfg.monitor_period_ms = 5;
        assert!(validate_driver_config(&cfg).is_err());

        cfg = DriverConfig::default();
        cfg.calib_path = PathBuf::new();
        assert!(validate_driver_config(&cfg).is_err());
    }

    #[test]
    fn test_config_roundtrip() {
        let cfg = DriverConfig {
            calib_path: PathBuf::from("/tmp/re25.txt"),
            monitor_period_ms: 1000,
            bus_attempts: 5,
            bus_retry_delay_ms: 2,
            rail_settle_ms: 20,
            skip_monitor: true,
        };
        let json = serde_json::to_string_pretty(&cfg).unwrap();
        let back: DriverConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.calib_path, cfg.calib_path);
        assert_eq!(back.monitor_period_ms, 1000);
        assert_eq!(back.bus_attempts, 5);
        assert!(back.skip_monitor);
    }

    #[test]
    #[serial]
    fn test_config_path_honors_xdg() {
        let dir = TempDir::new().unwrap();
        let old = env::var("XDG_CONFIG_HOME").ok();
        env::set_var("XDG_CONFIG_HOME", dir.path());

        let path = config_path();
        assert!(path.starts_with(dir.path()));
        assert!(path.ends_with("smartamp/config.json"));

        match old {
            Some(v) => env::set_var("XDG_CONFIG_HOME", v),
            None => env::remove_var("XDG_CONFIG_HOME"),
        }
    }

    #[test]
    #[serial]
    fn test_load_saved_config_from_file() {
        let dir = TempDir::new().unwrap();
        let cfg_dir = dir.path().join("smartamp");
        fs::create_dir_all(&cfg_dir).unwrap();
        let mut f = fs::File::create(cfg_dir.join("config.json")).unwrap();
        write!(f, r#"{{"monitor_period_ms": 250, "skip_monitor": true}}"#).unwrap();

        let old = env::var("XDG_CONFIG_HOME").ok();
        env::set_var("XDG_CONFIG_HOME", dir.path());

        let cfg = load_saved_config().expect("config should load");
        assert_eq!(cfg.monitor_period_ms, 250);
        assert!(cfg.skip_monitor);

        match old {
            Some(v) => env::set_var("XDG_CONFIG_HOME", v),
            None => env::remove_var("XDG_CONFIG_HOME"),
        }
    }
}
