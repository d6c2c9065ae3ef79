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

use std::fs;
use std::io;
use std::path::PathBuf;

use serde_json::json;

#[cfg(test)]
use mockall::automock;

use crate::error::{AmpError, Result};
use crate::logger;

/// Resistance fixed point: magnified units per ohm.
pub const RE25_MAGNIF: i32 = 4096;
/// Acceptance allowance for speakers, percent around nominal.
pub const SPKR_ALLOWANCE_PCT: i32 = 20;
/// Acceptance allowance for receivers, percent around nominal.
pub const RCVR_ALLOWANCE_PCT: i32 = 10;
/// Nominal impedance at or below this is a speaker, above it a receiver.
pub const SPKR_IMPEDANCE_MAX_OHM: u32 = 10;
/// Persisted record buffer cap, bytes.
pub const RECORD_LEN_MAX: usize = 256;
/// Ambient temperature assumed when the platform has no sensor, Celsius.
pub const DFT_AMB_TEMPR: i32 = 25;

/// Ambient temperature source used to stamp calibration samples.
#[cfg_attr(test, automock)]
pub trait AmbientSensor: Send + Sync {
    fn ambient_tempr(&self) -> i32;
}

/// Fallback sensor for boards without a battery/board thermistor.
pub struct DefaultAmbient;

impl AmbientSensor for DefaultAmbient {
    fn ambient_tempr(&self) -> i32 {
        DFT_AMB_TEMPR
    }
}

/// One calibration measurement for one device. Resistances are in
/// magnified units (`RE25_MAGNIF` per ohm).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibSample {
    /// Logical position mask of the measured channel.
    pub channel: i32,
    /// Measured resistance at 25 C.
    pub re: i32,
    /// Ambient temperature at measurement time, Celsius.
    pub tempr: i32,
    pub pass: bool,
    pub re_min: i32,
    pub re_max: i32,
}

impl CalibSample {
    /// Sample reconstructed from the persisted record; carries no band.
    pub fn from_triple(channel: i32, re: i32, tempr: i32) -> Self {
        CalibSample {
            channel,
            re,
            tempr,
            pass: false,
            re_min: 0,
            re_max: 0,
        }
    }
}

/// Ordered calibration run, one sample per attached device. Overwritten
/// wholesale on every successful run, never partially updated.
#[derive(Debug, Default)]
pub struct CalibSet {
    pub samples: Vec<CalibSample>,
}

impl CalibSet {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Acceptance band for a device of the given nominal impedance, in
/// magnified units. Low-impedance speakers tolerate a wider band than
/// high-impedance receivers.
pub fn acceptance_band(spkr_ohms: u32) -> (i32, i32) {
    let mid = spkr_ohms as i32 * RE25_MAGNIF;
    let allowance = if spkr_ohms <= SPKR_IMPEDANCE_MAX_OHM {
        SPKR_ALLOWANCE_PCT
    } else {
        RCVR_ALLOWANCE_PCT
    };
    (mid * (100 - allowance) / 100, mid * (100 + allowance) / 100)
}

/// Band-test every sample and serialize the passing ones as concatenated
/// `[channel,re,tempr]` triples. Out-of-band samples are marked failed,
/// logged and omitted. Serialization stops once the buffer cap would be
/// crossed; the shorter record still succeeds. No sample passing at all
/// is an error.
pub fn format_records(set: &mut CalibSet) -> Result<String> {
    let mut buf = String::new();
    for sample in set.samples.iter_mut() {
        if sample.re >= sample.re_min && sample.re <= sample.re_max {
            sample.pass = true;
            logger::log_event(
                logger::Level::Info,
                "calib_sample_pass",
                json!({ "channel": sample.channel, "re": sample.re, "tempr": sample.tempr }),
            );
            let record = format!("[{},{},{}]", sample.channel, sample.re, sample.tempr);
            if buf.len() + record.len() > RECORD_LEN_MAX {
                logger::log_event(
                    logger::Level::Info,
                    "calib_record_truncated",
                    json!({ "cap": RECORD_LEN_MAX }),
                );
                break;
            }
            buf.push_str(&record);
        } else {
            sample.pass = false;
            logger::log_event(
                logger::Level::Error,
                "calib_sample_out_of_range",
                json!({
                    "channel": sample.channel,
                    "re": sample.re,
                    "re_min": sample.re_min,
                    "re_max": sample.re_max,
                }),
            );
        }
    }
    if buf.is_empty() {
        return Err(AmpError::CalibrationInvalid);
    }
    Ok(buf)
}

/// Parse concatenated `[channel,re,tempr]` triples, stopping at the first
/// malformed record.
pub fn parse_records(input: &str) -> Vec<(i32, i32, i32)> {
    let mut out = Vec::new();
    let mut rest = input;
    loop {
        let Some(body_start) = rest.strip_prefix('[') else {
            break;
        };
        let Some(end) = body_start.find(']') else {
            break;
        };
        let body = &body_start[..end];
        let mut fields = body.splitn(3, ',');
        let triple = (
            fields.next().and_then(|s| s.trim().parse::<i32>().ok()),
            fields.next().and_then(|s| s.trim().parse::<i32>().ok()),
            fields.next().and_then(|s| s.trim().parse::<i32>().ok()),
        );
        match triple {
            (Some(channel), Some(re), Some(tempr)) => out.push((channel, re, tempr)),
            _ => break,
        }
        rest = &body_start[end + 1..];
    }
    out
}

/// Whole-file persistence of a calibration run.
pub struct CalibStore {
    path: PathBuf,
}

impl CalibStore {
    pub fn new(path: PathBuf) -> Self {
        CalibStore { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Populate an empty set from the persisted record. A set that
    /// already holds samples is left alone; a missing file is an error,
    /// an empty one is not.
    pub fn load(&self, set: &mut CalibSet) -> Result<()> {
        if !set.is_empty() {
            return Ok(());
        }
        let raw = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(AmpError::NotFound(format!("{}", self.path.display())));
            }
            Err(e) => return Err(AmpError::Io(e.to_string())),
        };
        if raw.is_empty() {
            return Ok(());
        }
        let capped = &raw[..raw.len().min(RECORD_LEN_MAX - 1)];
        let text = String::from_utf8_lossy(capped);
        for (channel, re, tempr) in parse_records(&text) {
            logger::log_event(
                logger::Level::Info,
                "calib_record_loaded",
                json!({ "channel": channel, "re": re, "tempr": tempr }),
            );
            set.samples.push(CalibSample::from_triple(channel, re, tempr));
        }
        Ok(())
    }

    /// Validate and persist a calibration run as one whole-file
    /// overwrite. An empty set is a no-op; a set with no in-band sample
    /// fails without touching the file.
    pub fn save(&self, set: &mut CalibSet) -> Result<()> {
        if set.is_empty() {
            return Ok(());
        }
        let buf = format_records(set)?;
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        fs::write(&self.path, buf.as_bytes()).map_err(|e| AmpError::Io(e.to_string()))?;
        logger::log_event(
            logger::Level::Info,
            "calib_saved",
            json!({ "path": format!("{}", self.path.display()), "bytes": buf.len() }),
        );
        Ok(())
    }
}
