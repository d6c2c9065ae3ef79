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

use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use serde_json::json;

#[cfg(test)]
use mockall::automock;

use crate::error::{AmpError, Result};
use crate::logger;

/// All attached devices share one fixed-voltage supply.
pub const RAIL_VOLTAGE_UV: u32 = 1_800_000;
/// Wait after enabling the regulator before the rail is considered usable.
pub const RAIL_SETTLE: Duration = Duration::from_millis(10);

/// The named voltage-regulator resource, supplied by the platform.
#[cfg_attr(test, automock)]
pub trait RailRegulator: Send {
    fn set_voltage(&mut self, min_uv: u32, max_uv: u32) -> std::result::Result<(), String>;
    fn enable(&mut self) -> std::result::Result<(), String>;
    fn disable(&mut self);
}

struct RailState {
    on: bool,
    refs: u32,
}

/// Reference-counted control of the shared supply rail. The rail is
/// powered iff at least one attached device holds a reference; the state
/// lock also serializes the settle delay against concurrent attaches.
pub struct RailControl {
    regulator: Mutex<Box<dyn RailRegulator>>,
    state: Mutex<RailState>,
    settle: Duration,
}

impl RailControl {
    pub fn new(regulator: Box<dyn RailRegulator>) -> Self {
        Self::with_settle(regulator, RAIL_SETTLE)
    }

    pub fn with_settle(regulator: Box<dyn RailRegulator>, settle: Duration) -> Self {
        RailControl {
            regulator: Mutex::new(regulator),
            state: Mutex::new(RailState { on: false, refs: 0 }),
            settle,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RailState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_regulator(&self) -> MutexGuard<'_, Box<dyn RailRegulator>> {
        match self.regulator.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Take one reference on the rail, physically enabling it on the first
    /// use. If the regulator refuses, no reference is taken and the error
    /// propagates to the caller.
    pub fn rail_on(&self) -> Result<()> {
        let mut st = self.lock_state();
        if !st.on {
            {
                let mut reg = self.lock_regulator();
                reg.set_voltage(RAIL_VOLTAGE_UV, RAIL_VOLTAGE_UV)
                    .map_err(AmpError::Resource)?;
                reg.enable().map_err(AmpError::Resource)?;
            }
            st.on = true;
            logger::log_event(
                logger::Level::Info,
                "rail_enable",
                json!({ "voltage_uv": RAIL_VOLTAGE_UV }),
            );
            thread::sleep(self.settle);
        }
        st.refs += 1;
        Ok(())
    }

    /// Drop one reference. Does not power the rail down by itself; pair
    /// with `rail_off`.
    pub fn rail_release(&self) {
        let mut st = self.lock_state();
        st.refs = st.refs.saturating_sub(1);
    }

    /// Power the rail down if, and only if, nothing references it anymore.
    /// Safe to call repeatedly.
    pub fn rail_off(&self) {
        let mut st = self.lock_state();
        if !st.on || st.refs > 0 {
            return;
        }
        self.lock_regulator().disable();
        st.on = false;
        logger::log_event(logger::Level::Info, "rail_disable", json!({}));
    }

    pub fn refs(&self) -> u32 {
        self.lock_state().refs
    }

    pub fn is_on(&self) -> bool {
        self.lock_state().on
    }
}
