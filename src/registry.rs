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

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use serde_json::json;

#[cfg(test)]
use mockall::automock;

use crate::bus::{BusPort, RegisterBus};
use crate::calib::{self, AmbientSensor, CalibSample, CalibSet, CalibStore};
use crate::config::DriverConfig;
use crate::error::{AmpError, Result};
use crate::logger;
use crate::monitor::{ChipOps, FaultLine, FaultSignal, HealthMonitor, HealthState};
use crate::power::{RailControl, RailRegulator};

/// Reset pulse: drive low this long, release, then let the chip settle.
pub const RESET_PULSE_LOW: Duration = Duration::from_millis(10);
pub const RESET_SETTLE: Duration = Duration::from_millis(1);

/// Per-device reset GPIO, supplied by the platform.
#[cfg_attr(test, automock)]
pub trait ResetLine: Send {
    fn set_value(&mut self, high: bool) -> std::result::Result<(), String>;
}

/// Channel placement derived from board wiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPosition {
    Mono,
    LeftTop,
    RightBottom,
    LeftBottom,
    RightTop,
}

impl ChannelPosition {
    /// Absent or unrecognized wiring labels fall back to mono.
    pub fn from_wiring(wiring: Option<&str>) -> Self {
        match wiring {
            Some("LTOP") => ChannelPosition::LeftTop,
            Some("RBTM") => ChannelPosition::RightBottom,
            Some("LBTM") => ChannelPosition::LeftBottom,
            Some("RTOP") => ChannelPosition::RightTop,
            _ => ChannelPosition::Mono,
        }
    }

    /// Bit mask persisted as the calibration channel identifier.
    pub fn mask(self) -> i32 {
        match self {
            ChannelPosition::Mono => 0,
            ChannelPosition::LeftTop => 1,
            ChannelPosition::RightBottom => 2,
            ChannelPosition::LeftBottom => 4,
            ChannelPosition::RightTop => 8,
        }
    }
}

/// One attached chip. Owned by the registry; every other component gets
/// at most an `Arc` through an index lookup, so teardown can never leave
/// a dangling reference behind.
pub struct DeviceHandle {
    addr: u16,
    index: usize,
    position: ChannelPosition,
    spkr_ohms: u32,
    use_irq: bool,
    re25: AtomicI32,
    rec_count: AtomicU32,
    state: Mutex<HealthState>,
    bus: RegisterBus,
}

impl DeviceHandle {
    pub(crate) fn new(
        addr: u16,
        index: usize,
        position: ChannelPosition,
        spkr_ohms: u32,
        use_irq: bool,
        bus: RegisterBus,
    ) -> Self {
        DeviceHandle {
            addr,
            index,
            position,
            spkr_ohms,
            use_irq,
            re25: AtomicI32::new(0),
            rec_count: AtomicU32::new(0),
            state: Mutex::new(HealthState::Idle),
            bus,
        }
    }

    pub fn addr(&self) -> u16 {
        self.addr
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn position(&self) -> ChannelPosition {
        self.position
    }

    pub fn spkr_ohms(&self) -> u32 {
        self.spkr_ohms
    }

    pub fn use_irq(&self) -> bool {
        self.use_irq
    }

    pub fn bus(&self) -> &RegisterBus {
        &self.bus
    }

    /// Measured resistance at 25 C in magnified units; written by the
    /// chip-specific calibration/recovery routine.
    pub fn re25(&self) -> i32 {
        self.re25.load(Ordering::SeqCst)
    }

    pub fn set_re25(&self, re: i32) {
        self.re25.store(re, Ordering::SeqCst);
    }

    pub fn recovery_count(&self) -> u32 {
        self.rec_count.load(Ordering::SeqCst)
    }

    pub(crate) fn bump_recovery(&self) -> u32 {
        self.rec_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn state(&self) -> HealthState {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub(crate) fn set_state(&self, state: HealthState) {
        match self.state.lock() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }
}

/// Process-wide driver state: the ops lock serializing recovery and
/// calibration across devices, the shared rail, the primary-device slot
/// for diagnostic surfaces, and the one-shot session reset flag. Created
/// before the first attach and passed by reference, never reached as
/// ambient global state.
pub struct DriverContext {
    config: DriverConfig,
    ops_lock: Mutex<()>,
    rail: RailControl,
    primary: Mutex<Option<usize>>,
    reset_done: AtomicBool,
    skip_monitor: AtomicBool,
    ambient: Box<dyn AmbientSensor>,
}

impl DriverContext {
    pub fn new(
        config: DriverConfig,
        regulator: Box<dyn RailRegulator>,
        ambient: Box<dyn AmbientSensor>,
    ) -> Arc<Self> {
        let settle = Duration::from_millis(config.rail_settle_ms);
        let skip_monitor = config.skip_monitor;
        Arc::new(DriverContext {
            rail: RailControl::with_settle(regulator, settle),
            ops_lock: Mutex::new(()),
            primary: Mutex::new(None),
            reset_done: AtomicBool::new(false),
            skip_monitor: AtomicBool::new(skip_monitor),
            ambient,
            config,
        })
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn rail(&self) -> &RailControl {
        &self.rail
    }

    /// The single lock serializing register-access and recovery logic
    /// across all devices, and calibration save/load against both.
    pub fn lock_ops(&self) -> MutexGuard<'_, ()> {
        match self.ops_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn skip_monitor(&self) -> bool {
        self.skip_monitor.load(Ordering::SeqCst)
    }

    pub fn set_skip_monitor(&self, skip: bool) {
        self.skip_monitor.store(skip, Ordering::SeqCst);
    }

    pub fn ambient_tempr(&self) -> i32 {
        self.ambient.ambient_tempr()
    }

    /// Index of the device diagnostic surfaces talk to, if any.
    pub fn primary_device(&self) -> Option<usize> {
        match self.primary.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn claim_primary(&self, index: usize) {
        let mut guard = match self.primary.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_none() {
            *guard = Some(index);
        }
    }

    fn clear_primary(&self, index: usize) {
        let mut guard = match self.primary.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *guard == Some(index) {
            *guard = None;
        }
    }

    fn reset_done(&self) -> bool {
        self.reset_done.load(Ordering::SeqCst)
    }

    fn mark_reset_done(&self) {
        self.reset_done.store(true, Ordering::SeqCst);
    }
}

/// Everything the platform knows about one chip at attach time.
pub struct DeviceDesc {
    pub addr: u16,
    pub wiring: Option<String>,
    pub spkr_ohms: u32,
    pub port: Box<dyn BusPort>,
    pub reset: Option<Box<dyn ResetLine>>,
    pub fault_irq: Option<Box<dyn FaultLine>>,
    pub chip: Arc<dyn ChipOps>,
}

struct AttachedDevice {
    dev: Arc<DeviceHandle>,
    monitor: HealthMonitor,
}

/// Composition root: owns every attached device and its monitor, assigns
/// logical indices in attach order (monotonic, never reused), and fronts
/// the calibration entry points for diagnostic surfaces.
pub struct AmpRegistry {
    ctx: Arc<DriverContext>,
    store: CalibStore,
    slots: Vec<Option<AttachedDevice>>,
}

impl AmpRegistry {
    pub fn new(ctx: Arc<DriverContext>) -> Self {
        let store = CalibStore::new(ctx.config().calib_path.clone());
        AmpRegistry {
            ctx,
            store,
            slots: Vec::new(),
        }
    }

    pub fn context(&self) -> &Arc<DriverContext> {
        &self.ctx
    }

    /// Power the rail, pulse reset once per session, probe the chip and
    /// bring up its monitor worker. A failed probe rolls the rail
    /// reference back before returning.
    pub fn attach(&mut self, desc: DeviceDesc) -> Result<usize> {
        let DeviceDesc {
            addr,
            wiring,
            spkr_ohms,
            port,
            mut reset,
            fault_irq,
            chip,
        } = desc;

        self.ctx.rail().rail_on()?;
        if let Some(line) = reset.as_mut() {
            self.session_reset(line.as_mut());
        }

        let index = self.slots.len();
        let position = ChannelPosition::from_wiring(wiring.as_deref());
        let cfg = self.ctx.config();
        let bus = RegisterBus::with_timing(
            addr,
            port,
            cfg.bus_attempts,
            Duration::from_millis(cfg.bus_retry_delay_ms),
        );
        let use_irq = fault_irq.is_some();
        let dev = Arc::new(DeviceHandle::new(addr, index, position, spkr_ohms, use_irq, bus));

        if let Err(e) = chip.probe(&dev) {
            self.ctx.rail().rail_release();
            self.ctx.rail().rail_off();
            logger::log_dev_event(
                logger::Level::Error,
                addr,
                "probe_failed",
                json!({ "error": e.to_string() }),
            );
            return Err(e);
        }

        let monitor = HealthMonitor::spawn(self.ctx.clone(), dev.clone(), chip, fault_irq);
        if index == 0 {
            // Diagnostic surfaces hang off the first attached device.
            self.ctx.claim_primary(index);
        }
        logger::log_dev_event(
            logger::Level::Info,
            addr,
            "device_attached",
            json!({ "index": index, "position": format!("{:?}", position), "use_irq": use_irq }),
        );
        self.slots.push(Some(AttachedDevice { dev, monitor }));
        Ok(index)
    }

    // The reset pulse is shared by all chips on the board, so it runs once
    // per session. A failing line is logged and retried on the next
    // attach; register access proceeds regardless.
    fn session_reset(&self, line: &mut dyn ResetLine) {
        if self.ctx.reset_done() {
            return;
        }
        let pulse = (|| -> std::result::Result<(), String> {
            line.set_value(false)?;
            thread::sleep(RESET_PULSE_LOW);
            line.set_value(true)?;
            thread::sleep(RESET_SETTLE);
            Ok(())
        })();
        match pulse {
            Ok(()) => self.ctx.mark_reset_done(),
            Err(e) => logger::log_event(
                logger::Level::Error,
                "reset_pulse_failed",
                json!({ "error": e }),
            ),
        }
    }

    /// Tear down monitoring (draining any in-flight pass), invalidate the
    /// handle and drop the rail reference, powering the rail off when
    /// this was the last device.
    pub fn detach(&mut self, index: usize) -> Result<()> {
        let slot = self
            .slots
            .get_mut(index)
            .ok_or_else(|| AmpError::NotFound(format!("device {}", index)))?;
        let mut attached = slot
            .take()
            .ok_or_else(|| AmpError::NotFound(format!("device {}", index)))?;

        let _ = attached.monitor.set_monitor(false);
        attached.monitor.shutdown();
        self.ctx.clear_primary(index);
        let addr = attached.dev.addr();
        drop(attached);

        self.ctx.rail().rail_release();
        self.ctx.rail().rail_off();
        logger::log_dev_event(logger::Level::Info, addr, "device_detached", json!({ "index": index }));
        Ok(())
    }

    pub fn device(&self, index: usize) -> Result<Arc<DeviceHandle>> {
        self.slots
            .get(index)
            .and_then(|slot| slot.as_ref())
            .map(|attached| attached.dev.clone())
            .ok_or_else(|| AmpError::NotFound(format!("device {}", index)))
    }

    pub fn device_by_position(&self, position: ChannelPosition) -> Option<Arc<DeviceHandle>> {
        self.slots
            .iter()
            .flatten()
            .find(|attached| attached.dev.position() == position)
            .map(|attached| attached.dev.clone())
    }

    pub fn attached_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn set_monitor(&self, index: usize, enable: bool) -> Result<()> {
        self.attached(index)?.monitor.set_monitor(enable)
    }

    pub fn monitor_state(&self, index: usize) -> Result<HealthState> {
        Ok(self.attached(index)?.monitor.state())
    }

    /// Handle for the platform's interrupt handler; safe to call from a
    /// context that must never block.
    pub fn fault_signal(&self, index: usize) -> Result<FaultSignal> {
        Ok(self.attached(index)?.monitor.fault_signal())
    }

    /// The device diagnostic surfaces should talk to, if one is attached.
    pub fn primary_device(&self) -> Option<Arc<DeviceHandle>> {
        let index = self.ctx.primary_device()?;
        self.slots
            .get(index)
            .and_then(|slot| slot.as_ref())
            .map(|attached| attached.dev.clone())
    }

    fn attached(&self, index: usize) -> Result<&AttachedDevice> {
        self.slots
            .get(index)
            .and_then(|slot| slot.as_ref())
            .ok_or_else(|| AmpError::NotFound(format!("device {}", index)))
    }

    /// Calibration entry point for diagnostic surfaces: snapshot every
    /// attached device into a fresh set, band-test and persist it.
    /// Serialized against recovery passes by the ops lock.
    pub fn save_calibration(&self) -> Result<()> {
        let _ops = self.ctx.lock_ops();
        let mut set = CalibSet::default();
        let tempr = self.ctx.ambient_tempr();
        for attached in self.slots.iter().flatten() {
            let dev = &attached.dev;
            let (re_min, re_max) = calib::acceptance_band(dev.spkr_ohms());
            logger::log_dev_event(
                logger::Level::Info,
                dev.addr(),
                "calib_band",
                json!({ "spkr_ohms": dev.spkr_ohms(), "re_min": re_min, "re_max": re_max }),
            );
            set.samples.push(CalibSample {
                channel: dev.position().mask(),
                re: dev.re25(),
                tempr,
                pass: false,
                re_min,
                re_max,
            });
        }
        self.store.save(&mut set)
    }

    /// Counterpart of `save_calibration` for startup restore.
    pub fn load_calibration(&self, set: &mut CalibSet) -> Result<()> {
        let _ops = self.ctx.lock_ops();
        self.store.load(set)
    }
}

impl Drop for AmpRegistry {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Some(attached) = slot.as_mut() {
                attached.monitor.shutdown();
                self.ctx.rail().rail_release();
            }
        }
        self.slots.clear();
        self.ctx.rail().rail_off();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        fast_config, test_context, test_registry, FakeChip, GoodPort, NoopReset,
    };
    use tempfile::TempDir;

    fn desc(addr: u16, wiring: Option<&str>, chip: Arc<FakeChip>) -> DeviceDesc {
        DeviceDesc {
            addr,
            wiring: wiring.map(str::to_string),
            spkr_ohms: 8,
            port: Box::new(GoodPort),
            reset: Some(Box::new(NoopReset)),
            fault_irq: None,
            chip,
        }
    }

    #[test]
    fn test_wiring_resolution() {
        assert_eq!(ChannelPosition::from_wiring(Some("LTOP")), ChannelPosition::LeftTop);
        assert_eq!(ChannelPosition::from_wiring(Some("RBTM")), ChannelPosition::RightBottom);
        assert_eq!(ChannelPosition::from_wiring(Some("LBTM")), ChannelPosition::LeftBottom);
        assert_eq!(ChannelPosition::from_wiring(Some("RTOP")), ChannelPosition::RightTop);
        assert_eq!(ChannelPosition::from_wiring(Some("SIDE")), ChannelPosition::Mono);
        assert_eq!(ChannelPosition::from_wiring(None), ChannelPosition::Mono);
    }

    #[test]
    fn test_position_masks() {
        assert_eq!(ChannelPosition::Mono.mask(), 0);
        assert_eq!(ChannelPosition::LeftTop.mask(), 1);
        assert_eq!(ChannelPosition::RightBottom.mask(), 2);
        assert_eq!(ChannelPosition::LeftBottom.mask(), 4);
        assert_eq!(ChannelPosition::RightTop.mask(), 8);
    }

    #[test]
    fn test_attach_assigns_index_and_position() {
        let dir = TempDir::new().unwrap();
        let mut registry = test_registry(dir.path());
        let chip = Arc::new(FakeChip::healthy());

        let index = registry.attach(desc(0x34, Some("LTOP"), chip)).unwrap();
        assert_eq!(index, 0);

        let dev = registry.device(0).unwrap();
        assert_eq!(dev.addr(), 0x34);
        assert_eq!(dev.position(), ChannelPosition::LeftTop);
        assert_eq!(registry.context().rail().refs(), 1);
        assert!(registry.context().rail().is_on());
        assert_eq!(registry.context().primary_device(), Some(0));
    }

    #[test]
    fn test_indices_are_monotonic() {
        let dir = TempDir::new().unwrap();
        let mut registry = test_registry(dir.path());
        let chip = Arc::new(FakeChip::healthy());

        assert_eq!(registry.attach(desc(0x34, Some("LTOP"), chip.clone())).unwrap(), 0);
        assert_eq!(registry.attach(desc(0x35, Some("RBTM"), chip.clone())).unwrap(), 1);
        registry.detach(0).unwrap();
        // A freed index is never handed out again.
        assert_eq!(registry.attach(desc(0x36, None, chip)).unwrap(), 2);
        assert_eq!(registry.attached_count(), 2);
    }

    #[test]
    fn test_probe_failure_rolls_back_rail() {
        let dir = TempDir::new().unwrap();
        let mut registry = test_registry(dir.path());
        let chip = Arc::new(FakeChip::failing_probe());

        assert!(registry.attach(desc(0x34, None, chip)).is_err());
        assert_eq!(registry.context().rail().refs(), 0);
        assert!(!registry.context().rail().is_on());
        assert_eq!(registry.attached_count(), 0);
    }

    #[test]
    fn test_detach_last_device_powers_rail_off() {
        let dir = TempDir::new().unwrap();
        let mut registry = test_registry(dir.path());
        let chip = Arc::new(FakeChip::healthy());

        let index = registry.attach(desc(0x34, Some("LTOP"), chip)).unwrap();
        registry.detach(index).unwrap();

        assert_eq!(registry.context().rail().refs(), 0);
        assert!(!registry.context().rail().is_on());
        assert!(matches!(registry.device(index), Err(AmpError::NotFound(_))));
        assert_eq!(registry.context().primary_device(), None);
    }

    #[test]
    fn test_detach_twice_fails_cleanly() {
        let dir = TempDir::new().unwrap();
        let mut registry = test_registry(dir.path());
        let chip = Arc::new(FakeChip::healthy());

        let index = registry.attach(desc(0x34, None, chip)).unwrap();
        registry.detach(index).unwrap();
        assert!(matches!(registry.detach(index), Err(AmpError::NotFound(_))));
    }

    #[test]
    fn test_detach_of_secondary_keeps_primary() {
        let dir = TempDir::new().unwrap();
        let mut registry = test_registry(dir.path());
        let chip = Arc::new(FakeChip::healthy());

        registry.attach(desc(0x34, Some("LTOP"), chip.clone())).unwrap();
        registry.attach(desc(0x35, Some("RBTM"), chip)).unwrap();
        registry.detach(1).unwrap();

        assert_eq!(registry.context().primary_device(), Some(0));
        assert!(registry.primary_device().is_some());
        assert_eq!(registry.context().rail().refs(), 1);
        assert!(registry.context().rail().is_on());
    }

    #[test]
    fn test_lookup_by_position() {
        let dir = TempDir::new().unwrap();
        let mut registry = test_registry(dir.path());
        let chip = Arc::new(FakeChip::healthy());

        registry.attach(desc(0x34, Some("LTOP"), chip.clone())).unwrap();
        registry.attach(desc(0x35, Some("RBTM"), chip)).unwrap();

        let right = registry.device_by_position(ChannelPosition::RightBottom).unwrap();
        assert_eq!(right.addr(), 0x35);
        assert!(registry.device_by_position(ChannelPosition::RightTop).is_none());
    }

    #[test]
    fn test_save_calibration_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut registry = test_registry(dir.path());
        let chip = Arc::new(FakeChip::healthy());

        registry.attach(desc(0x34, Some("LTOP"), chip.clone())).unwrap();
        registry.attach(desc(0x35, Some("RBTM"), chip)).unwrap();

        // In-band measurements for 8 ohm speakers.
        registry.device(0).unwrap().set_re25(8 * calib::RE25_MAGNIF + 50);
        registry.device(1).unwrap().set_re25(8 * calib::RE25_MAGNIF - 50);

        registry.save_calibration().unwrap();

        let mut set = CalibSet::default();
        registry.load_calibration(&mut set).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.samples[0].channel, ChannelPosition::LeftTop.mask());
        assert_eq!(set.samples[0].re, 8 * calib::RE25_MAGNIF + 50);
        assert_eq!(set.samples[0].tempr, calib::DFT_AMB_TEMPR);
        assert_eq!(set.samples[1].channel, ChannelPosition::RightBottom.mask());
    }

    #[test]
    fn test_save_calibration_unmeasured_devices_rejected() {
        let dir = TempDir::new().unwrap();
        let mut registry = test_registry(dir.path());
        let chip = Arc::new(FakeChip::healthy());

        registry.attach(desc(0x34, Some("LTOP"), chip)).unwrap();
        // re25 still zero: out of every band.
        assert!(matches!(
            registry.save_calibration(),
            Err(AmpError::CalibrationInvalid)
        ));
    }

    #[test]
    fn test_save_calibration_no_devices_is_noop() {
        let dir = TempDir::new().unwrap();
        let registry = test_registry(dir.path());
        registry.save_calibration().unwrap();
        assert!(!registry.context().config().calib_path.exists());
    }

    #[test]
    fn test_session_reset_runs_once() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(fast_config(dir.path()));
        let mut registry = AmpRegistry::new(ctx);
        let chip = Arc::new(FakeChip::healthy());

        let transitions = Arc::new(Mutex::new(Vec::new()));
        let first = crate::test_utils::RecordingReset::boxed(transitions.clone());
        let second = crate::test_utils::RecordingReset::boxed(transitions.clone());

        let mut d0 = desc(0x34, None, chip.clone());
        d0.reset = Some(first);
        let mut d1 = desc(0x35, None, chip);
        d1.reset = Some(second);

        registry.attach(d0).unwrap();
        registry.attach(d1).unwrap();

        // Low then high from the first attach only.
        let seen = transitions.lock().unwrap().clone();
        assert_eq!(seen, vec![false, true]);
    }
}
