//! Capabilities the transport needs from its environment.
//!
//! Device enumeration, IOMMU setup, BAR mapping and interrupt routing are owned by the
//! embedding code (a VFIO container on Linux, a simulated chip in tests). The transport only
//! sees the two traits below.

use core::sync::atomic::{fence, Ordering};

use crate::error::Error;
use crate::regs::Reg;
use crate::window::SharedWindow;

/// Register, configuration space and DMA access to the Bluetooth function.
///
/// Methods take `&self`: the dispatcher and request callers use the device concurrently.
pub trait Device: Sync {
    fn read32(&self, reg: Reg) -> u32;
    fn write32(&self, reg: Reg, value: u32);

    fn config_read16(&self, offset: u16) -> u16;
    fn config_write16(&self, offset: u16, value: u16);
    fn config_read32(&self, offset: u16) -> u32;
    fn config_write32(&self, offset: u16, value: u32);

    /// Full memory barrier between host writes to the window and the next MMIO write.
    fn barrier(&self) {
        fence(Ordering::SeqCst);
    }

    /// Function-level reset.
    fn reset(&self) -> Result<(), Error>;

    /// Make `window` visible to the device at `window.iova()`.
    fn map_dma(&self, window: &SharedWindow) -> Result<(), Error>;

    fn unmap_dma(&self, window: &SharedWindow) -> Result<(), Error>;
}

/// Interrupt notifications from the device.
#[allow(async_fn_in_trait)]
pub trait InterruptSource {
    /// Wait for the next interrupt. Returns the number of interrupts delivered since the last
    /// call (an eventfd counter, for example).
    async fn wait(&mut self) -> Result<u64, Error>;
}

impl<T: Device + ?Sized> Device for &T {
    fn read32(&self, reg: Reg) -> u32 {
        (**self).read32(reg)
    }

    fn write32(&self, reg: Reg, value: u32) {
        (**self).write32(reg, value)
    }

    fn config_read16(&self, offset: u16) -> u16 {
        (**self).config_read16(offset)
    }

    fn config_write16(&self, offset: u16, value: u16) {
        (**self).config_write16(offset, value)
    }

    fn config_read32(&self, offset: u16) -> u32 {
        (**self).config_read32(offset)
    }

    fn config_write32(&self, offset: u16, value: u32) {
        (**self).config_write32(offset, value)
    }

    fn barrier(&self) {
        (**self).barrier()
    }

    fn reset(&self) -> Result<(), Error> {
        (**self).reset()
    }

    fn map_dma(&self, window: &SharedWindow) -> Result<(), Error> {
        (**self).map_dma(window)
    }

    fn unmap_dma(&self, window: &SharedWindow) -> Result<(), Error> {
        (**self).unmap_dma(window)
    }
}
