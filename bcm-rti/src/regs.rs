//! Register table for the Bluetooth function.
//!
//! MMIO registers are named by BAR and purpose. The table is generated at build time from
//! `data/<chip>/registers.yaml`; registers whose function is not understood keep a
//! `VENDOR_xxxx` name.
//!
//! ```no_run
//! use bcm_rti::regs::{self, bar0, bar1};
//!
//! assert_eq!(bar0::RTI_CONTROL.offset, 0x144);
//! assert_eq!(regs::doorbell_value(3, 1), 0x0003_0120);
//! # let _ = bar1::BOOTSTAGE;
//! ```

/// PCI memory BAR holding a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Bar {
    /// Doorbells, MSI and host window programming.
    Bar0,
    /// Firmware mailbox: boot stage, image and context registration.
    Bar1,
}

/// A 32-bit MMIO register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Reg {
    pub bar: Bar,
    pub offset: u32,
}

impl Reg {
    pub const fn new(bar: Bar, offset: u32) -> Self {
        Self { bar, offset }
    }
}

/// A fixed value written into PCI configuration space during bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfigWrite {
    pub name: &'static str,
    pub offset: u16,
    pub value: u32,
}

mod generated {
    #![allow(dead_code)]
    #![allow(non_snake_case)]
    #![allow(clippy::all)]

    use super::{Bar, ConfigWrite, Reg};

    include!(concat!(env!("OUT_DIR"), "/_generated.rs"));
}

pub use generated::{bar0, bar1, config, ALL, CHIP};

/// Low byte of every ring doorbell write.
pub const DOORBELL_TRIGGER: u32 = 0x20;

/// Value for [`bar0::RING_DOORBELL`] announcing `index` as the new head (transfer ring) or
/// tail (completion ring) of `ring`.
#[inline]
pub const fn doorbell_value(index: u16, ring: u8) -> u32 {
    ((index as u32) << 16) | ((ring as u32) << 8) | DOORBELL_TRIGGER
}

/// Standard PCI configuration header offsets used during bring-up.
pub mod pci {
    /// Command register.
    pub const COMMAND: u16 = 0x04;
    /// Command register: bus master enable.
    pub const COMMAND_BUS_MASTER: u16 = 1 << 2;

    /// Vendor reset-control register.
    pub const RESET_CONTROL: u16 = 0x88;
    const RESET_CONTROL_BIT16: u32 = 1 << 16;
    const RESET_CONTROL_BIT19: u32 = 1 << 19;

    /// Update applied to [`RESET_CONTROL`]: when bit 19 is clear, bits 16 and 19 are cleared,
    /// then bit 16 is set unconditionally.
    pub const fn reset_control_update(value: u32) -> u32 {
        let mut v = value;
        if v & RESET_CONTROL_BIT19 == 0 {
            v &= !(RESET_CONTROL_BIT16 | RESET_CONTROL_BIT19);
        }
        v | RESET_CONTROL_BIT16
    }
}

/// Look a register up by its `barN/NAME` label.
pub fn by_name(label: &str) -> Option<Reg> {
    ALL.iter().find(|(name, _)| *name == label).map(|(_, reg)| *reg)
}
