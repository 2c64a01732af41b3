//! Firmware image staging.
//!
//! The image is copied to the start of the shared window, which the chip fetches it from
//! during the image handoff. The size the host window advertises is the image length
//! rounded up to the device's transfer granularity.

use crate::window::SharedWindow;

/// Default image transfer granularity.
pub const IMAGE_GRANULARITY: usize = 0x200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// Image is empty
    EmptyImage,
    /// Image (after padding) does not fit in the window
    ImageTooLarge { size_bytes: usize, max_bytes: usize },
    /// Granularity is zero or not a power of two
    InvalidGranularity { granularity: usize },
}

/// An image copied into the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StagedImage {
    /// Window offset of the first byte.
    pub offset: usize,
    /// Image length in bytes.
    pub len: usize,
    /// Length rounded up to the granularity.
    pub padded_len: usize,
}

/// Round `len` up to `granularity` (a power of two).
#[inline]
pub const fn padded_len(len: usize, granularity: usize) -> usize {
    (len + granularity - 1) & !(granularity - 1)
}

/// Copy `image` to the start of `window`, zero-filling the padding.
pub fn stage(window: &SharedWindow, image: &[u8], granularity: usize) -> Result<StagedImage, Error> {
    if image.is_empty() {
        return Err(Error::EmptyImage);
    }
    if granularity == 0 || !granularity.is_power_of_two() {
        return Err(Error::InvalidGranularity { granularity });
    }

    let padded = padded_len(image.len(), granularity);
    if padded > window.len() {
        return Err(Error::ImageTooLarge {
            size_bytes: padded,
            max_bytes: window.len(),
        });
    }

    window.write(0, image);
    window.fill(image.len(), padded - image.len(), 0);

    debug!("firmware staged: {} bytes ({:#x} padded)", image.len(), padded);
    Ok(StagedImage {
        offset: 0,
        len: image.len(),
        padded_len: padded,
    })
}
