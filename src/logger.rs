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

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use lazy_static::lazy_static;
use serde_json::{json, Value};

const DEFAULT_LOG_PATH: &str = "/etc/smartamp/logs.json";
const FALLBACK_LOG_PATH: &str = "/tmp/smartamp_logs.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

lazy_static! {
    static ref LOG_FILE: Mutex<Option<File>> = Mutex::new(None);
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

fn open_append(path: &str) -> Option<File> {
    if let Some(parent) = Path::new(path).parent() {
        let _ = fs::create_dir_all(parent);
    }
    OpenOptions::new().create(true).append(true).open(path).ok()
}

pub fn init_logging() {
    // Prefer /etc, fall back to /tmp when unavailable (silent)
    let file = open_append(DEFAULT_LOG_PATH).or_else(|| open_append(FALLBACK_LOG_PATH));
    if let Ok(mut guard) = LOG_FILE.lock() {
        *guard = file;
    }
}

/// Emit one JSON event line; no-op-ish when the logger was never
/// initialized (events then land in the /tmp fallback).
pub fn log_event(level: Level, event: &str, data: Value) {
    let line = json!({
        "ts_ms": now_millis(),
        "level": level.as_str(),
        "event": event,
        "data": data,
    })
    .to_string();

    if let Ok(mut guard) = LOG_FILE.lock() {
        if let Some(f) = guard.as_mut() {
            let _ = writeln!(f, "{}", line);
            return;
        }
    }
    if let Some(mut f) = open_append(FALLBACK_LOG_PATH) {
        let _ = writeln!(f, "{}", line);
    }
}

/// Event tagged with the bus address of the device it concerns.
pub fn log_dev_event(level: Level, addr: u16, event: &str, data: Value) {
    log_event(
        level,
        event,
        json!({
            "addr": format!("{:#04x}", addr),
            "detail": data,
        }),
    );
}
