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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::json;

#[cfg(test)]
use mockall::automock;

use crate::error::{AmpError, Result};
use crate::logger;
use crate::registry::{DeviceHandle, DriverContext};

/// Recovery attempts tolerated per device before monitoring stops for good.
pub const RECOVERY_CEILING: u32 = 5;
/// Default period of the polled recovery probe.
pub const MONITOR_PERIOD: Duration = Duration::from_secs(2);

/// Per-device health lifecycle. `Stopped` is terminal: the device stays
/// attached but no further probes are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Idle,
    Monitoring,
    Recovering,
    Stopped,
}

/// Chip-specific firmware logic, supplied by the platform. `recover`
/// returns whether a fault was found and a repair attempted.
#[cfg_attr(test, automock)]
pub trait ChipOps: Send + Sync {
    fn probe(&self, dev: &DeviceHandle) -> Result<()>;
    fn recover(&self, dev: &DeviceHandle) -> Result<bool>;
    fn speaker_temp(&self, dev: &DeviceHandle) -> Result<i32>;
}

/// Per-device hardware interrupt line.
#[cfg_attr(test, automock)]
pub trait FaultLine: Send {
    fn enable(&mut self);
    fn disable(&mut self);
}

enum Task {
    Probe,
    Fault,
    Rearm,
    Sync(Sender<()>),
    Shutdown,
}

/// Handle the platform's interrupt handler calls into. `raise` never
/// blocks and never takes a lock: it enqueues at most one deferred
/// recovery task, coalescing bursts while one is still pending.
#[derive(Clone)]
pub struct FaultSignal {
    tx: Sender<Task>,
    pending: Arc<AtomicBool>,
}

impl FaultSignal {
    pub fn raise(&self) {
        if !self.pending.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(Task::Fault);
        }
    }
}

/// Owns one worker thread per device; all recovery work runs there, under
/// the process-wide ops lock, never in the signaling context.
pub struct HealthMonitor {
    dev: Arc<DeviceHandle>,
    tx: Sender<Task>,
    pending: Arc<AtomicBool>,
    active: Arc<AtomicBool>,
    irq: Option<Mutex<Box<dyn FaultLine>>>,
    worker: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    pub fn spawn(
        ctx: Arc<DriverContext>,
        dev: Arc<DeviceHandle>,
        chip: Arc<dyn ChipOps>,
        irq: Option<Box<dyn FaultLine>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        let active = Arc::new(AtomicBool::new(false));
        let pending = Arc::new(AtomicBool::new(false));
        // The line stays masked until monitoring is enabled.
        let irq = irq.map(|mut line| {
            line.disable();
            Mutex::new(line)
        });
        let period = Duration::from_millis(ctx.config().monitor_period_ms);
        let worker = {
            let ctx = ctx.clone();
            let dev = dev.clone();
            let active = active.clone();
            let pending = pending.clone();
            thread::spawn(move || monitor_loop(ctx, dev, chip, rx, active, pending, period))
        };
        HealthMonitor {
            dev,
            tx,
            pending,
            active,
            irq,
            worker: Some(worker),
        }
    }

    pub fn fault_signal(&self) -> FaultSignal {
        FaultSignal {
            tx: self.tx.clone(),
            pending: self.pending.clone(),
        }
    }

    pub fn state(&self) -> HealthState {
        self.dev.state()
    }

    /// Enable or disable monitoring. Disabling waits for any in-flight
    /// recovery pass to finish before returning, so the caller never
    /// observes an overlapping probe afterwards.
    pub fn set_monitor(&self, enable: bool) -> Result<()> {
        if enable && self.dev.state() == HealthState::Stopped {
            logger::log_dev_event(
                logger::Level::Info,
                self.dev.addr(),
                "monitor_enable_after_stop",
                json!({}),
            );
            return Ok(());
        }
        if enable {
            if self.dev.use_irq() {
                let line = self
                    .irq
                    .as_ref()
                    .ok_or(AmpError::InvalidArg("device has no fault line"))?;
                lock_line(line).enable();
            }
            self.active.store(true, Ordering::SeqCst);
            if self.dev.state() == HealthState::Idle {
                self.dev.set_state(HealthState::Monitoring);
            }
            // Wake the worker so timer-mode devices arm the probe period.
            let _ = self.tx.send(Task::Rearm);
        } else {
            if self.dev.use_irq() {
                if let Some(line) = self.irq.as_ref() {
                    lock_line(line).disable();
                }
            }
            self.active.store(false, Ordering::SeqCst);
            if self.dev.state() == HealthState::Monitoring {
                self.dev.set_state(HealthState::Idle);
            }
            self.drain();
        }
        Ok(())
    }

    // A sentinel round-trips through the worker; when it comes back, every
    // task queued before it (including an in-flight pass) has finished.
    fn drain(&self) {
        let (ack_tx, ack_rx) = mpsc::channel();
        if self.tx.send(Task::Sync(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    /// Stop the worker and wait for it. Called on detach.
    pub fn shutdown(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        let _ = self.tx.send(Task::Shutdown);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock_line(line: &Mutex<Box<dyn FaultLine>>) -> std::sync::MutexGuard<'_, Box<dyn FaultLine>> {
    match line.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn monitor_loop(
    ctx: Arc<DriverContext>,
    dev: Arc<DeviceHandle>,
    chip: Arc<dyn ChipOps>,
    rx: Receiver<Task>,
    active: Arc<AtomicBool>,
    pending: Arc<AtomicBool>,
    period: Duration,
) {
    loop {
        let armed = active.load(Ordering::SeqCst) && !dev.use_irq();
        let task = if armed {
            match rx.recv_timeout(period) {
                Ok(task) => task,
                Err(RecvTimeoutError::Timeout) => Task::Probe,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        } else {
            match rx.recv() {
                Ok(task) => task,
                Err(_) => break,
            }
        };
        match task {
            Task::Probe => recovery_pass(&ctx, &dev, chip.as_ref(), &active),
            Task::Fault => {
                pending.store(false, Ordering::SeqCst);
                recovery_pass(&ctx, &dev, chip.as_ref(), &active);
            }
            Task::Rearm => {}
            Task::Sync(ack) => {
                let _ = ack.send(());
            }
            Task::Shutdown => break,
        }
    }
}

// One diagnostic-and-repair pass. Failures never propagate; they feed the
// recovery counter, and only the ceiling halts monitoring.
fn recovery_pass(ctx: &DriverContext, dev: &DeviceHandle, chip: &dyn ChipOps, active: &AtomicBool) {
    if ctx.skip_monitor() || !active.load(Ordering::SeqCst) {
        return;
    }
    if dev.state() == HealthState::Stopped {
        return;
    }
    dev.set_state(HealthState::Recovering);
    {
        let _ops = ctx.lock_ops();
        match chip.recover(dev) {
            Ok(true) => {
                let count = dev.bump_recovery();
                logger::log_dev_event(
                    logger::Level::Info,
                    dev.addr(),
                    "fault_recovered",
                    json!({ "recoveries": count }),
                );
            }
            Ok(false) => {}
            Err(e) => {
                let count = dev.bump_recovery();
                logger::log_dev_event(
                    logger::Level::Error,
                    dev.addr(),
                    "recover_error",
                    json!({ "error": e.to_string(), "recoveries": count }),
                );
            }
        }
        if let Err(e) = chip.speaker_temp(dev) {
            logger::log_dev_event(
                logger::Level::Debug,
                dev.addr(),
                "speaker_temp_error",
                json!({ "error": e.to_string() }),
            );
        }
    }
    if dev.recovery_count() >= RECOVERY_CEILING {
        logger::log_dev_event(
            logger::Level::Warn,
            dev.addr(),
            "recovery_ceiling",
            json!({ "ceiling": RECOVERY_CEILING }),
        );
        dev.set_state(HealthState::Stopped);
        active.store(false, Ordering::SeqCst);
        return;
    }
    // Timer-mode devices re-arm through the worker's receive timeout.
    dev.set_state(if active.load(Ordering::SeqCst) {
        HealthState::Monitoring
    } else {
        HealthState::Idle
    });
}
