/*
 * Test utilities and fake hardware for Smartamp
 *
 * Hand-rolled fakes live here rather than mockall mocks because most of
 * them cross thread boundaries and get inspected through shared counters.
 */

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::bus::{BusFault, BusPort};
use crate::calib::DefaultAmbient;
use crate::config::DriverConfig;
use crate::error::{AmpError, Result};
use crate::monitor::{ChipOps, FaultLine};
use crate::power::RailRegulator;
use crate::registry::{
    AmpRegistry, ChannelPosition, DeviceHandle, DriverContext, ResetLine,
};

/// Bus endpoint that always completes; reads come back zeroed.
pub struct GoodPort;

impl BusPort for GoodPort {
    fn write(&mut self, _bytes: &[u8]) -> std::result::Result<(), BusFault> {
        Ok(())
    }

    fn write_read(&mut self, _out: &[u8], input: &mut [u8]) -> std::result::Result<(), BusFault> {
        input.fill(0);
        Ok(())
    }
}

/// Bus endpoint that never completes, counting every attempt.
pub struct FailingPort {
    pub calls: Arc<AtomicU32>,
}

impl FailingPort {
    pub fn new() -> (Self, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (FailingPort { calls: calls.clone() }, calls)
    }
}

impl BusPort for FailingPort {
    fn write(&mut self, _bytes: &[u8]) -> std::result::Result<(), BusFault> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(BusFault("stuck bus".to_string()))
    }

    fn write_read(&mut self, _out: &[u8], _input: &mut [u8]) -> std::result::Result<(), BusFault> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(BusFault("stuck bus".to_string()))
    }
}

/// Regulator that accepts everything.
#[derive(Default)]
pub struct NullRegulator;

impl RailRegulator for NullRegulator {
    fn set_voltage(&mut self, _min_uv: u32, _max_uv: u32) -> std::result::Result<(), String> {
        Ok(())
    }

    fn enable(&mut self) -> std::result::Result<(), String> {
        Ok(())
    }

    fn disable(&mut self) {}
}

/// Reset line that accepts everything.
pub struct NoopReset;

impl ResetLine for NoopReset {
    fn set_value(&mut self, _high: bool) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// Reset line recording every level transition into a shared log.
pub struct RecordingReset {
    log: Arc<Mutex<Vec<bool>>>,
}

impl RecordingReset {
    pub fn boxed(log: Arc<Mutex<Vec<bool>>>) -> Box<dyn ResetLine> {
        Box::new(RecordingReset { log })
    }
}

impl ResetLine for RecordingReset {
    fn set_value(&mut self, high: bool) -> std::result::Result<(), String> {
        self.log.lock().unwrap().push(high);
        Ok(())
    }
}

/// Fault line counting how often it was enabled.
pub struct CountingFaultLine {
    enables: Arc<AtomicU32>,
}

impl CountingFaultLine {
    pub fn boxed(enables: Arc<AtomicU32>) -> Box<dyn FaultLine> {
        Box::new(CountingFaultLine { enables })
    }
}

impl FaultLine for CountingFaultLine {
    fn enable(&mut self) {
        self.enables.fetch_add(1, Ordering::SeqCst);
    }

    fn disable(&mut self) {}
}

/// Scriptable chip-ops: probe outcome, recovery verdict and an optional
/// delay inside the recovery pass, with shared call counters.
pub struct FakeChip {
    pub probe_ok: bool,
    pub faulting: bool,
    pub recover_delay: Duration,
    pub recover_calls: Arc<AtomicU32>,
    pub probe_calls: Arc<AtomicU32>,
}

impl FakeChip {
    fn base() -> Self {
        FakeChip {
            probe_ok: true,
            faulting: false,
            recover_delay: Duration::from_millis(0),
            recover_calls: Arc::new(AtomicU32::new(0)),
            probe_calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn healthy() -> Self {
        Self::base()
    }

    pub fn always_faulting() -> Self {
        FakeChip {
            faulting: true,
            ..Self::base()
        }
    }

    pub fn healthy_with_delay(delay: Duration) -> Self {
        FakeChip {
            recover_delay: delay,
            ..Self::base()
        }
    }

    pub fn failing_probe() -> Self {
        FakeChip {
            probe_ok: false,
            ..Self::base()
        }
    }
}

impl ChipOps for FakeChip {
    fn probe(&self, _dev: &DeviceHandle) -> Result<()> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        if self.probe_ok {
            Ok(())
        } else {
            Err(AmpError::Io("device detect failed".to_string()))
        }
    }

    fn recover(&self, _dev: &DeviceHandle) -> Result<bool> {
        self.recover_calls.fetch_add(1, Ordering::SeqCst);
        if !self.recover_delay.is_zero() {
            thread::sleep(self.recover_delay);
        }
        Ok(self.faulting)
    }

    fn speaker_temp(&self, _dev: &DeviceHandle) -> Result<i32> {
        Ok(30)
    }
}

/// Config tuned for fast tests: 10 ms probe period, no retry or settle
/// delays, calibration file inside the given directory.
pub fn fast_config(dir: &Path) -> DriverConfig {
    DriverConfig {
        calib_path: dir.join("re25_calib.txt"),
        monitor_period_ms: 10,
        bus_attempts: 3,
        bus_retry_delay_ms: 0,
        rail_settle_ms: 0,
        skip_monitor: false,
    }
}

pub fn test_context(config: DriverConfig) -> Arc<DriverContext> {
    DriverContext::new(config, Box::new(NullRegulator), Box::new(DefaultAmbient))
}

pub fn test_registry(dir: &Path) -> AmpRegistry {
    AmpRegistry::new(test_context(fast_config(dir)))
}

/// Bare device handle for monitor-level tests that skip the registry.
pub fn test_device(addr: u16, use_irq: bool) -> Arc<DeviceHandle> {
    let bus = crate::bus::RegisterBus::new(addr, Box::new(GoodPort));
    Arc::new(DeviceHandle::new(
        addr,
        0,
        ChannelPosition::Mono,
        8,
        use_irq,
        bus,
    ))
}
