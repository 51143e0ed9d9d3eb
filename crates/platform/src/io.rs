//! The I/O-port bus.
//!
//! Devices register port ranges; IN/OUT from the CPU dispatches here.
//! Unclaimed ports are open-bus: reads return all-ones for the access
//! width, and each (port, width) pair is logged once so a probing guest
//! cannot flood the log.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

/// One device model's port-mapped register window.
///
/// `port` is the absolute port number; devices registered across a range
/// see every port in it and subtract their own base.
pub trait IoPortDevice {
    fn io_read(&mut self, port: u16, size: u8) -> u32;
    fn io_write(&mut self, port: u16, size: u8, value: u32);
}

#[derive(Clone)]
struct Registration {
    start: u16,
    end: u16, // inclusive
    device: Rc<RefCell<dyn IoPortDevice>>,
}

#[derive(Default)]
pub struct IoPortBus {
    registrations: Vec<Registration>,
    unclaimed_logged: HashSet<(u16, u8)>,
}

impl IoPortBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `device` for the inclusive port range `start..=end`.
    /// Later registrations win, which is how PCI BAR moves remap a device
    /// without unregistering the old window.
    pub fn register(&mut self, start: u16, end: u16, device: Rc<RefCell<dyn IoPortDevice>>) {
        debug_assert!(start <= end);
        self.registrations.push(Registration { start, end, device });
    }

    pub fn register_one(&mut self, port: u16, device: Rc<RefCell<dyn IoPortDevice>>) {
        self.register(port, port, device);
    }

    fn lookup(&self, port: u16) -> Option<Rc<RefCell<dyn IoPortDevice>>> {
        self.registrations
            .iter()
            .rev()
            .find(|r| (r.start..=r.end).contains(&port))
            .map(|r| r.device.clone())
    }

    pub fn read(&mut self, port: u16, size: u8) -> u32 {
        match self.lookup(port) {
            Some(device) => device.borrow_mut().io_read(port, size),
            None => {
                if self.unclaimed_logged.insert((port, size)) {
                    tracing::warn!(port = format_args!("{port:#06x}"), size, "read from unclaimed I/O port");
                }
                open_bus(size)
            }
        }
    }

    pub fn write(&mut self, port: u16, size: u8, value: u32) {
        match self.lookup(port) {
            Some(device) => device.borrow_mut().io_write(port, size, value),
            None => {
                if self.unclaimed_logged.insert((port, size)) {
                    tracing::warn!(
                        port = format_args!("{port:#06x}"),
                        size,
                        value,
                        "write to unclaimed I/O port"
                    );
                }
            }
        }
    }

    pub fn read_u8(&mut self, port: u16) -> u8 {
        self.read(port, 1) as u8
    }

    pub fn read_u16(&mut self, port: u16) -> u16 {
        self.read(port, 2) as u16
    }

    pub fn read_u32(&mut self, port: u16) -> u32 {
        self.read(port, 4)
    }

    pub fn write_u8(&mut self, port: u16, value: u8) {
        self.write(port, 1, value as u32);
    }

    pub fn write_u16(&mut self, port: u16, value: u16) {
        self.write(port, 2, value as u32);
    }

    pub fn write_u32(&mut self, port: u16, value: u32) {
        self.write(port, 4, value);
    }
}

fn open_bus(size: u8) -> u32 {
    match size {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Latch {
        last: Option<(u16, u8, u32)>,
    }

    impl IoPortDevice for Latch {
        fn io_read(&mut self, port: u16, _size: u8) -> u32 {
            port as u32
        }
        fn io_write(&mut self, port: u16, size: u8, value: u32) {
            self.last = Some((port, size, value));
        }
    }

    #[test]
    fn dispatch_and_open_bus() {
        let latch = Rc::new(RefCell::new(Latch::default()));
        let mut bus = IoPortBus::new();
        bus.register(0x1F0, 0x1F7, latch.clone());

        assert_eq!(bus.read(0x1F3, 1), 0x1F3);
        bus.write(0x1F0, 2, 0xABCD);
        assert_eq!(latch.borrow().last, Some((0x1F0, 2, 0xABCD)));

        assert_eq!(bus.read(0x9999, 1), 0xFF);
        assert_eq!(bus.read(0x5555, 2), 0xFFFF);
        assert_eq!(bus.read(0x5555, 4), 0xFFFF_FFFF);
    }

    #[test]
    fn later_registration_wins() {
        let a = Rc::new(RefCell::new(Latch::default()));
        let b = Rc::new(RefCell::new(Latch::default()));
        let mut bus = IoPortBus::new();
        bus.register(0x100, 0x10F, a.clone());
        bus.register(0x100, 0x10F, b.clone());
        bus.write(0x100, 1, 1);
        assert!(a.borrow().last.is_none());
        assert!(b.borrow().last.is_some());
    }
}
