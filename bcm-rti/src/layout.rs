//! Shared-memory layout of the RTI window.
//!
//! Everything the host and the device share lives in one DMA window. The static part is
//! fixed at construction:
//!
//! ```text
//! 0x0000  context block (0x68)
//! 0x0070  per-info block (0x10)
//!         transfer ring head indices   (u16 per transfer ring)
//!         transfer ring tail indices   (u16 per transfer ring)
//!         completion ring head indices (u16 per completion ring)
//!         completion ring tail indices (u16 per completion ring)
//!         transfer ring 0 entries
//!         completion ring 0 entries
//!         pipe 0 out-of-line control buffer
//!         ... rings opened during boot, placed one after another
//! ```
//!
//! Every region starts on a 16-byte boundary. Before the context block is registered the
//! start of the same window doubles as the firmware staging area.

use crate::codec::{CompletionHeader, ContextBlock, TransferHeader};
use crate::ring::MAX_RINGS;

/// Alignment of every region in the window.
pub const ALIGN: usize = 16;

/// Size of the per-info block the device fills in after boot.
pub const PER_INFO_SIZE: usize = 0x10;

/// Regions placed by [`Layout::new`].
const STATIC_REGIONS: usize = 9;

/// Upper bound on regions tracked by a [`Layout`]: the static ones plus every ring beyond
/// ring 0 in both directions.
pub const MAX_REGIONS: usize = STATIC_REGIONS + 2 * (MAX_RINGS - 1);

#[inline]
pub const fn align_up(value: usize) -> usize {
    (value + ALIGN - 1) & !(ALIGN - 1)
}

//=============================================================================
// Configuration
//=============================================================================

/// Window geometry and the ring-0 parameters the context block advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LayoutConfig {
    /// Window size in bytes.
    pub window_size: usize,
    /// Device-visible base address of the window.
    pub window_iova: u64,
    /// Number of transfer rings (entries in each transfer index array).
    pub transfer_rings: u8,
    /// Number of completion rings (entries in each completion index array).
    pub completion_rings: u8,
    pub ring0_transfer_entries: u16,
    pub ring0_transfer_entry_size: usize,
    pub ring0_completion_entries: u16,
    pub ring0_completion_entry_size: usize,
    /// Out-of-line buffer for pipe 0 control messages.
    pub control_buffer_size: usize,
}

impl LayoutConfig {
    /// BCM4387 bring-up geometry.
    pub const fn new() -> Self {
        Self {
            window_size: 0x0200_0000,
            window_iova: 0x0200_0000,
            transfer_rings: 9,
            completion_rings: 6,
            ring0_transfer_entries: 128,
            ring0_transfer_entry_size: TransferHeader::SIZE,
            ring0_completion_entries: 128,
            ring0_completion_entry_size: CompletionHeader::SIZE,
            control_buffer_size: 0x34,
        }
    }
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self::new()
    }
}

//=============================================================================
// Error types
//=============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The layout does not fit in the window.
    WindowTooSmall { required: usize, available: usize },
    /// A new region would overlap an existing one.
    Overlap { offset: usize, len: usize },
    /// More than [`MAX_REGIONS`] regions.
    TooManyRegions,
    /// A ring with zero entries or zero-sized entries.
    EmptyRing,
    /// A ring index beyond the configured ring count.
    NoSuchRing,
    /// More transfer or completion rings than the transport can track.
    TooManyRings { count: u8, max: usize },
}

//=============================================================================
// Regions
//=============================================================================

/// What a region of the window is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegionKind {
    Context,
    PerInfo,
    TransferHeads,
    TransferTails,
    CompletionHeads,
    CompletionTails,
    TransferRing(u8),
    CompletionRing(u8),
    ControlBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Region {
    pub kind: RegionKind,
    pub offset: usize,
    pub len: usize,
}

impl Region {
    #[inline]
    pub const fn end(&self) -> usize {
        self.offset + self.len
    }

    #[inline]
    const fn overlaps(&self, offset: usize, len: usize) -> bool {
        offset < self.end() && self.offset < offset + len
    }
}

/// Byte offsets of every structure in the window.
///
/// Static regions are placed by [`Layout::new`]; rings opened later are appended with
/// [`Layout::allocate_ring`].
#[derive(Debug, Clone)]
pub struct Layout {
    config: LayoutConfig,
    regions: [Option<Region>; MAX_REGIONS],
    count: usize,
    next_free: usize,
}

impl Layout {
    pub fn new(config: &LayoutConfig) -> Result<Self, Error> {
        if config.ring0_transfer_entries == 0
            || config.ring0_completion_entries == 0
            || config.ring0_transfer_entry_size == 0
            || config.ring0_completion_entry_size == 0
            || config.transfer_rings == 0
            || config.completion_rings == 0
        {
            return Err(Error::EmptyRing);
        }
        for count in [config.transfer_rings, config.completion_rings] {
            if count as usize > MAX_RINGS {
                return Err(Error::TooManyRings { count, max: MAX_RINGS });
            }
        }

        let mut layout = Self {
            config: *config,
            regions: [None; MAX_REGIONS],
            count: 0,
            next_free: 0,
        };

        let tr_index_len = config.transfer_rings as usize * 2;
        let cr_index_len = config.completion_rings as usize * 2;

        layout.push(RegionKind::Context, ContextBlock::SIZE)?;
        layout.push(RegionKind::PerInfo, PER_INFO_SIZE)?;
        layout.push(RegionKind::TransferHeads, tr_index_len)?;
        layout.push(RegionKind::TransferTails, tr_index_len)?;
        layout.push(RegionKind::CompletionHeads, cr_index_len)?;
        layout.push(RegionKind::CompletionTails, cr_index_len)?;
        layout.push(
            RegionKind::TransferRing(0),
            config.ring0_transfer_entries as usize * config.ring0_transfer_entry_size,
        )?;
        layout.push(
            RegionKind::CompletionRing(0),
            config.ring0_completion_entries as usize * config.ring0_completion_entry_size,
        )?;
        layout.push(RegionKind::ControlBuffer, config.control_buffer_size)?;
        debug_assert_eq!(layout.count, STATIC_REGIONS);

        Ok(layout)
    }

    /// Place a new ring right after the last allocated region.
    pub fn allocate_ring(&mut self, kind: RegionKind, entries: u16, entry_size: usize) -> Result<Region, Error> {
        if entries == 0 || entry_size == 0 {
            return Err(Error::EmptyRing);
        }
        match kind {
            RegionKind::TransferRing(idx) if idx < self.config.transfer_rings => {}
            RegionKind::CompletionRing(idx) if idx < self.config.completion_rings => {}
            _ => return Err(Error::NoSuchRing),
        }
        self.push(kind, entries as usize * entry_size)
    }

    fn push(&mut self, kind: RegionKind, len: usize) -> Result<Region, Error> {
        let offset = align_up(self.next_free);
        let end = offset.checked_add(len).ok_or(Error::WindowTooSmall {
            required: usize::MAX,
            available: self.config.window_size,
        })?;
        if end > self.config.window_size {
            return Err(Error::WindowTooSmall {
                required: end,
                available: self.config.window_size,
            });
        }
        if self.regions().any(|r| r.overlaps(offset, len) || r.kind == kind) {
            return Err(Error::Overlap { offset, len });
        }
        let slot = self.regions.get_mut(self.count).ok_or(Error::TooManyRegions)?;

        let region = Region { kind, offset, len };
        *slot = Some(region);
        self.count += 1;
        self.next_free = end;
        trace!("layout: {:?} at {:#x}+{:#x}", kind, offset, len);
        Ok(region)
    }

    pub fn config(&self) -> &LayoutConfig {
        &self.config
    }

    /// Regions in placement order.
    pub fn regions(&self) -> impl Iterator<Item = &Region> + '_ {
        self.regions[..self.count].iter().flatten()
    }

    pub fn region(&self, kind: RegionKind) -> Option<Region> {
        self.regions().find(|r| r.kind == kind).copied()
    }

    /// First byte past the last region.
    pub fn end(&self) -> usize {
        self.next_free
    }

    fn offset_of(&self, kind: RegionKind) -> usize {
        // Static regions always exist once `new` has returned.
        self.region(kind).map(|r| r.offset).unwrap_or(0)
    }

    pub fn context(&self) -> usize {
        self.offset_of(RegionKind::Context)
    }

    pub fn per_info(&self) -> usize {
        self.offset_of(RegionKind::PerInfo)
    }

    pub fn transfer_heads(&self) -> usize {
        self.offset_of(RegionKind::TransferHeads)
    }

    pub fn transfer_tails(&self) -> usize {
        self.offset_of(RegionKind::TransferTails)
    }

    pub fn completion_heads(&self) -> usize {
        self.offset_of(RegionKind::CompletionHeads)
    }

    pub fn completion_tails(&self) -> usize {
        self.offset_of(RegionKind::CompletionTails)
    }

    pub fn transfer_ring0(&self) -> usize {
        self.offset_of(RegionKind::TransferRing(0))
    }

    pub fn completion_ring0(&self) -> usize {
        self.offset_of(RegionKind::CompletionRing(0))
    }

    pub fn control_buffer(&self) -> usize {
        self.offset_of(RegionKind::ControlBuffer)
    }
}
