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

use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use serde_json::json;

#[cfg(test)]
use mockall::automock;

use crate::error::{AmpError, Result};
use crate::logger;

/// Total transfer attempts before an operation gives up.
pub const BUS_ATTEMPTS: u8 = 3;
/// Pause after a failed attempt, letting transient bus contention clear.
pub const BUS_RETRY_DELAY: Duration = Duration::from_millis(5);
/// Largest bulk payload accepted in one transaction.
pub const BULK_XFER_MAX: usize = 4096;

/// Raw fault reported by the platform transport.
#[derive(Debug, Clone)]
pub struct BusFault(pub String);

impl fmt::Display for BusFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One addressed endpoint on the control bus, supplied by the platform.
/// A transfer either completes in full or reports a fault; partial
/// completion is a fault.
#[cfg_attr(test, automock)]
pub trait BusPort: Send {
    fn write(&mut self, bytes: &[u8]) -> std::result::Result<(), BusFault>;
    /// Register-address write followed by a repeated-start read.
    fn write_read(&mut self, out: &[u8], input: &mut [u8]) -> std::result::Result<(), BusFault>;
}

/// Register-oriented view of one device's bus endpoint. All operations
/// serialize on the per-device lock for the whole retry loop, so a
/// transaction observed by a concurrent caller is always complete.
pub struct RegisterBus {
    addr: u16,
    attempts: u8,
    retry_delay: Duration,
    port: Mutex<Box<dyn BusPort>>,
}

impl RegisterBus {
    pub fn new(addr: u16, port: Box<dyn BusPort>) -> Self {
        Self::with_timing(addr, port, BUS_ATTEMPTS, BUS_RETRY_DELAY)
    }

    pub fn with_timing(addr: u16, port: Box<dyn BusPort>, attempts: u8, retry_delay: Duration) -> Self {
        RegisterBus {
            addr,
            attempts: attempts.max(1),
            retry_delay,
            port: Mutex::new(port),
        }
    }

    pub fn addr(&self) -> u16 {
        self.addr
    }

    fn lock_port(&self) -> MutexGuard<'_, Box<dyn BusPort>> {
        match self.port.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Read a 16-bit register. The value travels big-endian, high byte first.
    pub fn read(&self, reg: u8) -> Result<u16> {
        let mut port = self.lock_port();
        let mut buf = [0u8; 2];
        let mut last: Option<BusFault> = None;
        for _ in 0..self.attempts {
            match port.write_read(&[reg], &mut buf) {
                Ok(()) => return Ok(u16::from_be_bytes(buf)),
                Err(e) => {
                    last = Some(e);
                    thread::sleep(self.retry_delay);
                }
            }
        }
        let fault = last.map(|e| e.to_string()).unwrap_or_default();
        logger::log_dev_event(
            logger::Level::Error,
            self.addr,
            "bus_read_error",
            json!({ "reg": reg, "fault": fault }),
        );
        Err(AmpError::Io(format!(
            "read {:02x} failed after {} attempts: {}",
            reg, self.attempts, fault
        )))
    }

    /// Write a 16-bit register, high byte first.
    pub fn write(&self, reg: u8, val: u16) -> Result<()> {
        let be = val.to_be_bytes();
        let frame = [reg, be[0], be[1]];
        self.write_frame(reg, &frame)
    }

    /// Write a register address followed by a raw payload in one
    /// transaction. Rejects empty payloads before touching the bus.
    pub fn bulk_write(&self, reg: u8, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(AmpError::InvalidArg("zero-length bulk write"));
        }
        if data.len() > BULK_XFER_MAX {
            return Err(AmpError::NoMem("bulk payload exceeds transfer cap"));
        }
        let mut frame = Vec::with_capacity(1 + data.len());
        frame.push(reg);
        frame.extend_from_slice(data);
        self.write_frame(reg, &frame)
    }

    fn write_frame(&self, reg: u8, frame: &[u8]) -> Result<()> {
        let mut port = self.lock_port();
        let mut last: Option<BusFault> = None;
        for _ in 0..self.attempts {
            match port.write(frame) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last = Some(e);
                    thread::sleep(self.retry_delay);
                }
            }
        }
        let fault = last.map(|e| e.to_string()).unwrap_or_default();
        logger::log_dev_event(
            logger::Level::Error,
            self.addr,
            "bus_write_error",
            json!({ "reg": reg, "fault": fault }),
        );
        Err(AmpError::Io(format!(
            "write {:02x} failed after {} attempts: {}",
            reg, self.attempts, fault
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_bus(port: MockBusPort) -> RegisterBus {
        // Zero retry delay keeps the failure tests quick.
        RegisterBus::with_timing(0x34, Box::new(port), 3, Duration::from_millis(0))
    }

    #[test]
    fn test_read_big_endian() {
        let mut port = MockBusPort::new();
        port.expect_write_read()
            .times(1)
            .returning(|out, input| {
                assert_eq!(out, &[0x0a]);
                input[0] = 0x12;
                input[1] = 0x34;
                Ok(())
            });
        let bus = fast_bus(port);
        assert_eq!(bus.read(0x0a).unwrap(), 0x1234);
    }

    #[test]
    fn test_write_frame_layout() {
        let mut port = MockBusPort::new();
        port.expect_write()
            .times(1)
            .returning(|bytes| {
                // register address, then the value high byte first
                assert_eq!(bytes, &[0x0b, 0xab, 0xcd]);
                Ok(())
            });
        let bus = fast_bus(port);
        bus.write(0x0b, 0xabcd).unwrap();
    }

    #[test]
    fn test_read_retries_exactly_bounded() {
        let mut port = MockBusPort::new();
        port.expect_write_read()
            .times(3)
            .returning(|_, _| Err(BusFault("arbitration lost".to_string())));
        let bus = fast_bus(port);
        match bus.read(0x01) {
            Err(AmpError::Io(msg)) => assert!(msg.contains("3 attempts")),
            other => panic!("expected Io error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_read_recovers_on_second_attempt() {
        let mut port = MockBusPort::new();
        let mut calls = 0u8;
        port.expect_write_read()
            .times(2)
            .returning(move |_, input| {
                calls += 1;
                if calls == 1 {
                    Err(BusFault("nak".to_string()))
                } else {
                    input[0] = 0x00;
                    input[1] = 0x42;
                    Ok(())
                }
            });
        let bus = fast_bus(port);
        assert_eq!(bus.read(0x02).unwrap(), 0x0042);
    }

    #[test]
    fn test_bulk_write_prefixes_register() {
        let mut port = MockBusPort::new();
        port.expect_write()
            .times(1)
            .returning(|bytes| {
                assert_eq!(bytes, &[0x20, 1, 2, 3, 4]);
                Ok(())
            });
        let bus = fast_bus(port);
        bus.bulk_write(0x20, &[1, 2, 3, 4]).unwrap();
    }

    #[test]
    fn test_bulk_write_empty_rejected_before_bus() {
        let mut port = MockBusPort::new();
        port.expect_write().times(0);
        let bus = fast_bus(port);
        assert!(matches!(
            bus.bulk_write(0x20, &[]),
            Err(AmpError::InvalidArg(_))
        ));
    }

    #[test]
    fn test_bulk_write_oversized_rejected() {
        let mut port = MockBusPort::new();
        port.expect_write().times(0);
        let bus = fast_bus(port);
        let big = vec![0u8; BULK_XFER_MAX + 1];
        assert!(matches!(bus.bulk_write(0x20, &big), Err(AmpError::NoMem(_))));
    }

    #[test]
    fn test_write_retry_exhaustion_yields_io() {
        let mut port = MockBusPort::new();
        port.expect_write()
            .times(3)
            .returning(|_| Err(BusFault("bus busy".to_string())));
        let bus = fast_bus(port);
        assert!(matches!(bus.write(0x03, 1), Err(AmpError::Io(_))));
    }
}
