#![cfg_attr(not(test), no_std)]
#![doc = include_str!("../README.md")]
#![allow(unsafe_op_in_unsafe_fn)]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod regs;
pub mod device;
pub mod window;
pub mod layout;
pub mod ring;
pub mod codec;
pub mod pending;
pub mod transport;
pub mod dispatcher;
pub mod firmware;
pub mod boot;
mod error;

#[cfg(test)]
pub(crate) mod sim;

// Reexports
pub use boot::{BootConfig, BootError, BootReport, BootSequencer, BootStage};
pub use device::{Device, InterruptSource};
pub use dispatcher::{Dispatcher, Event};
pub use error::{Error, Violation};
pub use fmt::Hexdump;
pub use layout::{Layout, LayoutConfig};
pub use pending::Completion;
pub use transport::{Transport, TransportConfig};
pub use window::SharedWindow;

/// Crate configuration bundle.
pub mod config {
    use crate::boot::BootConfig;
    use crate::layout::LayoutConfig;
    use crate::transport::TransportConfig;

    /// Everything needed to bring up one session.
    #[derive(Debug, Clone, Copy)]
    #[non_exhaustive]
    pub struct Config<'a> {
        pub layout: LayoutConfig,
        pub transport: TransportConfig,
        pub boot: BootConfig<'a>,
    }

    impl<'a> Config<'a> {
        /// BCM4387 defaults for `firmware`.
        pub const fn new(firmware: &'a [u8]) -> Self {
            Self {
                layout: LayoutConfig::new(),
                transport: TransportConfig::new(),
                boot: BootConfig::new(firmware),
            }
        }
    }
}
pub use config::Config;
