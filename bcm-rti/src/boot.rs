//! Boot sequencer: brings the Bluetooth function from reset to operational rings.
//!
//! The sequence needs the [`Dispatcher`](crate::dispatcher::Dispatcher) running at the same
//! time: every wait below is woken by the boot-progress event it raises on interrupts.
//!
//! ```no_run
//! use bcm_rti::{BootConfig, BootSequencer};
//!
//! # async fn example<D: bcm_rti::Device>(transport: &bcm_rti::Transport<D>, fw: &[u8]) -> Result<(), bcm_rti::BootError> {
//! let report = BootSequencer::new(transport, BootConfig::new(fw)).run().await?;
//! # let _ = report;
//! # Ok(()) }
//! ```

use core::fmt;

use embassy_time::{with_timeout, Duration};

use crate::device::Device;
use crate::error::Error;
use crate::firmware::{self, StagedImage, IMAGE_GRANULARITY};
use crate::regs::{bar0, bar1, config, pci, Reg};
use crate::transport::{CompletionRingParams, PipeParams, Transport};

//=============================================================================
// Configuration
//=============================================================================

/// Completion rings opened on BCM4387 after the context block is registered.
pub const BCM4387_COMPLETION_RINGS: [CompletionRingParams; 5] = [
    CompletionRingParams::new(1, 256, 0).with_intmod_delay(1000),
    CompletionRingParams::new(2, 256, 66).with_intmod_delay(1000),
    CompletionRingParams::new(3, 128, 0),
    CompletionRingParams::new(4, 128, 66),
    CompletionRingParams::new(5, 128, 66),
];

/// Pipes opened on BCM4387 once the completion rings exist.
pub const BCM4387_PIPES: [PipeParams; 2] = [
    PipeParams::new(1, 128, 66, 1, 1),
    PipeParams::device_resident(2, 128, 2, 2),
];

/// MSI target address programmed for both the image loader and the RTI.
pub const DEFAULT_MSI_ADDRESS: u64 = 0xffff_f000;

#[derive(Debug, Clone, Copy)]
pub struct BootConfig<'a> {
    /// Firmware image bytes.
    pub firmware: &'a [u8],
    /// Image transfer granularity; the advertised window size is padded to it.
    pub image_granularity: usize,
    /// Boot stage that marks the image as running.
    ///
    /// `None` accepts the first interrupt after the image doorbell.
    pub image_ready_stage: Option<u32>,
    /// Bound on every wait for the chip.
    pub stage_timeout: Duration,
    pub msi_address: u64,
    pub completion_rings: &'a [CompletionRingParams],
    pub pipes: &'a [PipeParams],
}

impl<'a> BootConfig<'a> {
    /// BCM4387 defaults for `firmware`.
    pub const fn new(firmware: &'a [u8]) -> Self {
        Self {
            firmware,
            image_granularity: IMAGE_GRANULARITY,
            image_ready_stage: None,
            stage_timeout: Duration::from_secs(5),
            msi_address: DEFAULT_MSI_ADDRESS,
            completion_rings: &BCM4387_COMPLETION_RINGS,
            pipes: &BCM4387_PIPES,
        }
    }
}

//=============================================================================
// Error types
//=============================================================================

/// Boot stages, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BootStage {
    DmaSetup,
    Reset,
    PciConfig,
    ImageStaging,
    ImageHandoff,
    ContextRegistration,
    RingSetup,
    Operational,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum BootCause {
    Transport(Error),
    Firmware(firmware::Error),
    /// A status register did not reach the expected value in time.
    StageTimeout { expected: u32, observed: u32 },
    /// No interrupt arrived in time.
    NoInterrupt,
}

/// Boot failure: the stage that failed and why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BootError {
    pub stage: BootStage,
    pub cause: BootCause,
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "boot failed at {:?}: ", self.stage)?;
        match &self.cause {
            BootCause::Transport(e) => write!(f, "{}", e),
            BootCause::Firmware(e) => write!(f, "firmware: {:?}", e),
            BootCause::StageTimeout { expected, observed } => {
                write!(f, "expected {:#x}, still {:#x}", expected, observed)
            }
            BootCause::NoInterrupt => f.write_str("no interrupt"),
        }
    }
}

impl core::error::Error for BootError {}

fn at<E: Into<BootCause>>(stage: BootStage) -> impl FnOnce(E) -> BootError {
    move |e| BootError { stage, cause: e.into() }
}

impl From<Error> for BootCause {
    fn from(e: Error) -> Self {
        BootCause::Transport(e)
    }
}

impl From<firmware::Error> for BootCause {
    fn from(e: firmware::Error) -> Self {
        BootCause::Firmware(e)
    }
}

/// What the chip reported during a successful boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BootReport {
    pub image: StagedImage,
    pub boot_stage: u32,
    pub capabilities: u32,
}

//=============================================================================
// Sequencer
//=============================================================================

/// RTI control stages.
const CONTROL_CONTEXT_REGISTERED: u32 = 1;
const CONTROL_RINGS_OPERATIONAL: u32 = 2;

/// Values for `VENDOR_0610` around window reprogramming.
const WINDOW_UPDATE_BEGIN: u32 = 0x100;
const WINDOW_UPDATE_END: u32 = 0x200;

pub struct BootSequencer<'a, D: Device> {
    transport: &'a Transport<D>,
    config: BootConfig<'a>,
}

impl<'a, D: Device> BootSequencer<'a, D> {
    pub fn new(transport: &'a Transport<D>, config: BootConfig<'a>) -> Self {
        Self { transport, config }
    }

    /// Run every stage in order. Any failure is fatal and leaves the chip needing a reset.
    pub async fn run(&self) -> Result<BootReport, BootError> {
        let t = self.transport;
        let dev = t.device();
        let window = t.window();

        debug!("Step 1: register DMA window ({:#x} bytes at {:#x})", window.len(), window.iova());
        dev.map_dma(window).map_err(at(BootStage::DmaSetup))?;

        debug!("Step 2: reset");
        dev.reset().map_err(at(BootStage::Reset))?;

        debug!("Step 3: PCI config");
        self.configure_pci();

        debug!("Step 4: stage firmware");
        let image = firmware::stage(window, self.config.firmware, self.config.image_granularity)
            .map_err(at(BootStage::ImageStaging))?;

        debug!("Step 5: image handoff");
        let (boot_stage, capabilities) = self.hand_off_image(&image).await?;

        debug!("Step 6: register context block");
        self.register_context().await?;

        debug!("Step 7: open rings");
        for params in self.config.completion_rings {
            t.open_completion_ring(params).await.map_err(at(BootStage::RingSetup))?;
        }
        for params in self.config.pipes {
            t.open_pipe(params).await.map_err(at(BootStage::RingSetup))?;
        }

        debug!("Step 8: rings operational");
        dev.write32(bar0::RTI_CONTROL, CONTROL_RINGS_OPERATIONAL);
        self.wait_for(BootStage::Operational, bar1::RTI_GET_STATUS, CONTROL_RINGS_OPERATIONAL)
            .await?;

        info!("boot complete: stage {:#x}, capabilities {:#x}", boot_stage, capabilities);
        Ok(BootReport {
            image,
            boot_stage,
            capabilities,
        })
    }

    fn configure_pci(&self) {
        let dev = self.transport.device();

        let cmd = dev.config_read16(pci::COMMAND);
        dev.config_write16(pci::COMMAND, cmd | pci::COMMAND_BUS_MASTER);

        for write in config::ADDRESS_WINDOWS {
            trace!("cfg {:#x} ({}) = {:#010x}", write.offset, write.name, write.value);
            dev.config_write32(write.offset, write.value);
        }

        let reset_control = dev.config_read32(pci::RESET_CONTROL);
        dev.config_write32(pci::RESET_CONTROL, pci::reset_control_update(reset_control));
    }

    async fn hand_off_image(&self, image: &StagedImage) -> Result<(u32, u32), BootError> {
        let t = self.transport;
        let dev = t.device();
        let image_iova = t.window().iova_of(image.offset);

        trace!("boot stage before handoff: {:#x}", dev.read32(bar1::BOOTSTAGE));

        // The loader wants the MSI block programmed twice.
        for _ in 0..2 {
            dev.write32(bar0::VENDOR_0154, 1);
            write64(dev, bar0::BTI_MSI_LO, bar0::BTI_MSI_HI, self.config.msi_address);
            dev.write32(bar0::VENDOR_0588, 0x200);
            dev.write32(bar0::VENDOR_0610, WINDOW_UPDATE_BEGIN);
        }

        write64(dev, bar0::HOST_WINDOW_LO, bar0::HOST_WINDOW_HI, image_iova);
        write64(dev, bar1::IMG_ADDR_LO, bar1::IMG_ADDR_HI, image_iova);
        dev.write32(bar0::HOST_WINDOW_SZ, image.padded_len as u32);
        dev.write32(bar0::VENDOR_0610, WINDOW_UPDATE_END);
        dev.write32(bar1::IMG_SZ, image.len as u32);
        dev.barrier();

        t.progress.reset();
        dev.write32(bar0::IMG_DOORBELL, 0);

        match self.config.image_ready_stage {
            Some(stage) => self.wait_for(BootStage::ImageHandoff, bar1::BOOTSTAGE, stage).await?,
            None => self.wait_for_interrupt(BootStage::ImageHandoff).await?,
        }

        let boot_stage = dev.read32(bar1::BOOTSTAGE);
        let capabilities = dev.read32(bar1::RTI_GET_CAPABILITY);
        info!("image running: boot stage {:#x}, capabilities {:#x}", boot_stage, capabilities);
        Ok((boot_stage, capabilities))
    }

    async fn register_context(&self) -> Result<(), BootError> {
        let t = self.transport;
        let dev = t.device();
        let window = t.window();

        window.clear();

        dev.write32(bar0::VENDOR_0610, WINDOW_UPDATE_BEGIN);
        write64(dev, bar1::RTI_MSI_LO, bar1::RTI_MSI_HI, self.config.msi_address);
        dev.write32(bar1::RTI_MSI_DATA, 0);
        write64(dev, bar0::HOST_WINDOW_LO, bar0::HOST_WINDOW_HI, window.iova());
        dev.write32(bar0::HOST_WINDOW_SZ, window.len() as u32);
        dev.write32(bar0::VENDOR_0610, WINDOW_UPDATE_END);

        let ctx = t.write_context_block();
        let ctx_iova = t.with_layout(|l| window.iova_of(l.context()));
        trace!("context block at {:#x}: {:?}", ctx_iova, ctx);

        write64(dev, bar1::RTI_WINDOW_LO, bar1::RTI_WINDOW_HI, window.iova());
        dev.write32(bar1::RTI_WINDOW_SZ, window.len() as u32);
        write64(dev, bar1::RTI_CONTEXT_LO, bar1::RTI_CONTEXT_HI, ctx_iova);

        t.arm();
        dev.write32(bar0::RTI_CONTROL, CONTROL_CONTEXT_REGISTERED);
        self.wait_for(
            BootStage::ContextRegistration,
            bar1::RTI_GET_STATUS,
            CONTROL_CONTEXT_REGISTERED,
        )
        .await
    }

    /// Wait until `reg` reads `expected`, re-checking on every boot-progress event.
    async fn wait_for(&self, stage: BootStage, reg: Reg, expected: u32) -> Result<(), BootError> {
        let t = self.transport;
        let dev = t.device();
        let reached = with_timeout(self.config.stage_timeout, async {
            loop {
                if dev.read32(reg) == expected {
                    return;
                }
                t.progress.wait().await;
            }
        })
        .await;

        match reached {
            Ok(()) => {
                debug!("{:?}: register reached {:#x}", stage, expected);
                Ok(())
            }
            Err(_) => {
                let observed = dev.read32(reg);
                error!("{:?}: timed out, expected {:#x}, read {:#x}", stage, expected, observed);
                Err(BootError {
                    stage,
                    cause: BootCause::StageTimeout { expected, observed },
                })
            }
        }
    }

    async fn wait_for_interrupt(&self, stage: BootStage) -> Result<(), BootError> {
        match with_timeout(self.config.stage_timeout, self.transport.progress.wait()).await {
            Ok(count) => {
                debug!("{:?}: {} interrupts", stage, count);
                Ok(())
            }
            Err(_) => {
                error!("{:?}: no interrupt", stage);
                Err(BootError {
                    stage,
                    cause: BootCause::NoInterrupt,
                })
            }
        }
    }
}

fn write64<D: Device>(dev: &D, lo: Reg, hi: Reg, value: u64) {
    dev.write32(lo, value as u32);
    dev.write32(hi, (value >> 32) as u32);
}
