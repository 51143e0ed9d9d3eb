//! The IDE controller's PCI personality: a PIIX3-style function with the
//! legacy port BARs and the live bus-master BAR4.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use ember_devices::pci::{profile, PciBarDefinition, PciConfig, PciFunction};
use ember_pc_constants::BM_IDE_DEFAULT_BASE;
use ember_platform::IoPortBus;

use crate::bmdma::BmPorts;
use crate::ide::{
    IdeController, PRIMARY_CMD_BASE, PRIMARY_CTRL_PORT, SECONDARY_CMD_BASE, SECONDARY_CTRL_PORT,
};

pub struct PciIdeFunction {
    config: PciConfig,
    pub controller: Rc<RefCell<IdeController>>,
    /// Current bus-master window base, shared with the port adapter.
    bm_base: Rc<Cell<u16>>,
}

impl PciIdeFunction {
    pub fn new(controller: Rc<RefCell<IdeController>>) -> Self {
        let mut config = PciConfig::new(&profile::IDE_PIIX3);
        config.define_bar(0, PciBarDefinition::Io { size: 8 }, PRIMARY_CMD_BASE as u32 | 1);
        config.define_bar(1, PciBarDefinition::Io { size: 4 }, 0x3F4 | 1);
        config.define_bar(2, PciBarDefinition::Io { size: 8 }, SECONDARY_CMD_BASE as u32 | 1);
        config.define_bar(3, PciBarDefinition::Io { size: 4 }, 0x374 | 1);
        config.define_bar(4, PciBarDefinition::Io { size: 16 }, BM_IDE_DEFAULT_BASE as u32 | 1);
        // I/O decode + bus mastering, as the BIOS POST leaves it.
        config.set_command(0x0005);

        Self {
            config,
            controller,
            bm_base: Rc::new(Cell::new(BM_IDE_DEFAULT_BASE)),
        }
    }

    pub fn bm_base(&self) -> Rc<Cell<u16>> {
        self.bm_base.clone()
    }

    /// Refresh the cached bus-master base after a BAR4 rewrite.
    pub fn sync_bm_base(&self) {
        if let Some(base) = self.config.bar_io_base(4) {
            self.bm_base.set(base);
        }
    }
}

impl PciFunction for PciIdeFunction {
    fn config(&self) -> &PciConfig {
        &self.config
    }

    fn config_mut(&mut self) -> &mut PciConfig {
        &mut self.config
    }
}

/// Wire the controller's legacy ports and the bus-master window onto the
/// port bus. The bus-master adapter tracks BAR4 through the shared base
/// cell, so remaps need no re-registration.
pub fn register_ide_ports(
    io: &mut IoPortBus,
    ide: Rc<RefCell<IdeController>>,
    bm_base: Rc<Cell<u16>>,
) {
    io.register(PRIMARY_CMD_BASE, PRIMARY_CMD_BASE + 7, ide.clone());
    io.register_one(PRIMARY_CTRL_PORT, ide.clone());
    io.register(SECONDARY_CMD_BASE, SECONDARY_CMD_BASE + 7, ide.clone());
    io.register_one(SECONDARY_CTRL_PORT, ide.clone());

    let bm = Rc::new(RefCell::new(BmPorts::new(ide, bm_base.clone())));
    // Registered at the default window; a BAR move re-registers the same
    // adapter at the new base.
    let base = bm_base.get();
    io.register(base, base + 15, bm);
}
