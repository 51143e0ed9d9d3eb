//! IDE storage models: ATA disks, ATAPI CD-ROMs, the two legacy channels
//! with PIO and bus-master DMA, and the PCI IDE function.

pub mod ata;
pub mod atapi;
pub mod bmdma;
pub mod ide;
pub mod pci_ide;

pub use ata::AtaDrive;
pub use atapi::{AtapiCdrom, PacketResult};
pub use bmdma::BmPorts;
pub use ide::{IdeController, ATA_IRQ_PRIMARY, ATA_IRQ_SECONDARY};
pub use pci_ide::{register_ide_ports, PciIdeFunction};
