//! 8259A programmable interrupt controller, as a cascaded master/slave
//! pair on the classic PC wiring (slave on master IR2).

use crate::InterruptSource;

/// Initialisation sequence position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum InitState {
    Ready,
    ExpectIcw2,
    ExpectIcw3,
    ExpectIcw4,
}

pub struct Pic {
    irr: u8,
    isr: u8,
    imr: u8,
    vector_base: u8,
    init: InitState,
    needs_icw4: bool,
    auto_eoi: bool,
    /// OCW3 read-back selector: ISR when true, IRR otherwise.
    read_isr: bool,
    /// Lowest-priority IR line; priority rotates from here.
    priority_base: u8,
    /// Special mask mode (OCW3).
    special_mask: bool,
}

impl Default for Pic {
    fn default() -> Self {
        Self::new(0x08)
    }
}

impl Pic {
    pub fn new(vector_base: u8) -> Self {
        Self {
            irr: 0,
            isr: 0,
            imr: 0,
            vector_base,
            init: InitState::Ready,
            needs_icw4: false,
            auto_eoi: false,
            read_isr: false,
            priority_base: 7,
            special_mask: false,
        }
    }

    pub fn vector_base(&self) -> u8 {
        self.vector_base
    }

    pub fn imr(&self) -> u8 {
        self.imr
    }

    pub fn irr(&self) -> u8 {
        self.irr
    }

    pub fn isr(&self) -> u8 {
        self.isr
    }

    pub fn raise(&mut self, irq: u8) {
        self.irr |= 1 << (irq & 7);
    }

    pub fn clear(&mut self, irq: u8) {
        self.irr &= !(1 << (irq & 7));
    }

    /// IR lines in priority order starting after `priority_base`.
    fn priority_order(&self) -> impl Iterator<Item = u8> {
        let base = self.priority_base;
        (1..=8).map(move |i| (base.wrapping_add(i)) & 7)
    }

    /// Highest-priority unmasked requested line that is not already in
    /// service (nor shadowed by a higher-priority in-service line).
    pub fn pending_irq(&self) -> Option<u8> {
        for irq in self.priority_order() {
            let bit = 1u8 << irq;
            if self.isr & bit != 0 && !self.special_mask {
                // A higher-or-equal priority interrupt is in service.
                return None;
            }
            if self.irr & bit != 0 && self.imr & bit == 0 {
                return Some(irq);
            }
        }
        None
    }

    /// INTA: move the line from request to in-service.
    pub fn acknowledge_irq(&mut self, irq: u8) {
        let bit = 1u8 << (irq & 7);
        self.irr &= !bit;
        if !self.auto_eoi {
            self.isr |= bit;
        }
    }

    fn highest_in_service(&self) -> Option<u8> {
        self.priority_order().find(|irq| self.isr & (1 << irq) != 0)
    }

    pub fn write_command(&mut self, value: u8) {
        if value & 0x10 != 0 {
            // ICW1.
            self.init = InitState::ExpectIcw2;
            self.needs_icw4 = value & 0x01 != 0;
            self.imr = 0;
            self.isr = 0;
            self.irr = 0;
            self.priority_base = 7;
            self.special_mask = false;
            self.read_isr = false;
        } else if value & 0x08 != 0 {
            // OCW3.
            match value & 0x03 {
                0x02 => self.read_isr = false,
                0x03 => self.read_isr = true,
                _ => {}
            }
            match value & 0x60 {
                0x60 => self.special_mask = true,
                0x40 => self.special_mask = false,
                _ => {}
            }
        } else {
            // OCW2.
            let irq = value & 0x07;
            match value & 0xE0 {
                0x20 => {
                    // Non-specific EOI.
                    if let Some(top) = self.highest_in_service() {
                        self.isr &= !(1 << top);
                    }
                }
                0x60 => {
                    // Specific EOI.
                    self.isr &= !(1 << irq);
                }
                0xA0 => {
                    // Rotate on non-specific EOI.
                    if let Some(top) = self.highest_in_service() {
                        self.isr &= !(1 << top);
                        self.priority_base = top;
                    }
                }
                0xE0 => {
                    // Rotate on specific EOI.
                    self.isr &= !(1 << irq);
                    self.priority_base = irq;
                }
                0xC0 => {
                    // Set priority.
                    self.priority_base = irq;
                }
                _ => {}
            }
        }
    }

    pub fn write_data(&mut self, value: u8) {
        match self.init {
            InitState::ExpectIcw2 => {
                self.vector_base = value & 0xF8;
                self.init = InitState::ExpectIcw3;
            }
            InitState::ExpectIcw3 => {
                self.init = if self.needs_icw4 {
                    InitState::ExpectIcw4
                } else {
                    InitState::Ready
                };
            }
            InitState::ExpectIcw4 => {
                self.auto_eoi = value & 0x02 != 0;
                self.init = InitState::Ready;
            }
            InitState::Ready => {
                // OCW1.
                self.imr = value;
            }
        }
    }

    pub fn read_command(&self) -> u8 {
        if self.read_isr {
            self.isr
        } else {
            self.irr
        }
    }

    pub fn read_data(&self) -> u8 {
        self.imr
    }
}

/// Master + slave pair with the slave cascaded on master IR2. IRQ numbers
/// are 0..15 platform-wide.
pub struct PicPair {
    pub master: Pic,
    pub slave: Pic,
}

impl Default for PicPair {
    fn default() -> Self {
        Self::new()
    }
}

impl PicPair {
    pub fn new() -> Self {
        Self {
            master: Pic::new(0x08),
            slave: Pic::new(0x70),
        }
    }

    pub fn raise(&mut self, irq: u8) {
        if irq < 8 {
            self.master.raise(irq);
        } else {
            self.slave.raise(irq - 8);
            self.master.raise(2);
        }
    }

    pub fn clear(&mut self, irq: u8) {
        if irq < 8 {
            self.master.clear(irq);
        } else {
            self.slave.clear(irq - 8);
            if self.slave.irr() == 0 {
                self.master.clear(2);
            }
        }
    }

    /// The vector the CPU would receive on INTA, without acknowledging.
    pub fn pending(&self) -> Option<u8> {
        let irq = self.master.pending_irq()?;
        if irq == 2 {
            let slave_irq = self.slave.pending_irq()?;
            Some(self.slave.vector_base() + slave_irq)
        } else {
            Some(self.master.vector_base() + irq)
        }
    }

    /// INTA cycle: acknowledge the winning line on both chips. A raise
    /// that vanished before the ack yields the spurious IRQ7/IRQ15 vector.
    pub fn acknowledge(&mut self) -> Option<u8> {
        match self.master.pending_irq() {
            Some(2) => match self.slave.pending_irq() {
                Some(slave_irq) => {
                    self.master.acknowledge_irq(2);
                    self.slave.acknowledge_irq(slave_irq);
                    Some(self.slave.vector_base() + slave_irq)
                }
                None => Some(self.slave.vector_base() + 7),
            },
            Some(irq) => {
                self.master.acknowledge_irq(irq);
                Some(self.master.vector_base() + irq)
            }
            None => None,
        }
    }

    pub fn eoi_master(&mut self) {
        self.master.write_command(0x20);
    }

    pub fn eoi_slave(&mut self) {
        self.slave.write_command(0x20);
    }
}

impl InterruptSource for PicPair {
    fn pending_vector(&mut self) -> Option<u8> {
        self.pending()
    }

    fn acknowledge(&mut self, _vector: u8) {
        let _ = PicPair::acknowledge(self);
    }
}
