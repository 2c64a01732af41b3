//! Ring descriptors, the index store and the host-side ring registry.
//!
//! Ownership of the shared index arrays:
//!
//! | ring       | head written by | tail written by |
//! |------------|-----------------|-----------------|
//! | transfer   | host            | device          |
//! | completion | device          | host            |
//!
//! The index store itself does not enforce this; the transport and the dispatcher do.

use crate::layout::Layout;
use crate::window::SharedWindow;

/// Upper bound on transfer rings (pipes) and completion rings tracked by the registry.
pub const MAX_RINGS: usize = 16;

/// Identifies one ring in the index arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RingId {
    Transfer(u8),
    Completion(u8),
}

/// Host-side description of a ring's entry area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RingDescriptor {
    /// Window offset of entry 0.
    pub offset: usize,
    pub entries: u16,
    pub entry_size: usize,
}

impl RingDescriptor {
    pub const fn new(offset: usize, entries: u16, entry_size: usize) -> Self {
        Self {
            offset,
            entries,
            entry_size,
        }
    }

    /// Window offset of slot `index`.
    #[inline]
    pub fn slot_offset(&self, index: u16) -> usize {
        self.offset + index as usize * self.entry_size
    }

    #[inline]
    pub fn contains(&self, index: u16) -> bool {
        index < self.entries
    }

    #[inline]
    pub fn next(&self, index: u16) -> u16 {
        advance(index, self.entries)
    }

    /// Bytes of payload that fit in a slot after a header of `header_size` bytes.
    #[inline]
    pub fn payload_capacity(&self, header_size: usize) -> usize {
        self.entry_size.saturating_sub(header_size)
    }
}

/// `(current + 1) % entries`, for `entries >= 1`.
#[inline]
pub const fn advance(current: u16, entries: u16) -> u16 {
    ((current as u32 + 1) % entries as u32) as u16
}

/// Indices `tail, tail+1, ..., head-1` in ring order, wrapping at `entries`.
pub fn pending(tail: u16, head: u16, entries: u16) -> impl Iterator<Item = u16> {
    let count = if head >= tail {
        head - tail
    } else {
        entries - tail + head
    };
    (0..count).map(move |i| ((tail as u32 + i as u32) % entries as u32) as u16)
}

//=============================================================================
// Index store
//=============================================================================

/// Typed access to the head/tail index arrays in the shared window.
#[derive(Debug, Clone, Copy)]
pub struct IndexStore {
    window: SharedWindow,
    transfer_heads: usize,
    transfer_tails: usize,
    completion_heads: usize,
    completion_tails: usize,
    transfer_rings: u8,
    completion_rings: u8,
}

impl IndexStore {
    pub fn new(window: SharedWindow, layout: &Layout) -> Self {
        Self {
            window,
            transfer_heads: layout.transfer_heads(),
            transfer_tails: layout.transfer_tails(),
            completion_heads: layout.completion_heads(),
            completion_tails: layout.completion_tails(),
            transfer_rings: layout.config().transfer_rings,
            completion_rings: layout.config().completion_rings,
        }
    }

    fn offsets(&self, ring: RingId) -> (usize, usize) {
        let (heads, tails, idx, count) = match ring {
            RingId::Transfer(idx) => (self.transfer_heads, self.transfer_tails, idx, self.transfer_rings),
            RingId::Completion(idx) => (self.completion_heads, self.completion_tails, idx, self.completion_rings),
        };
        assert!(idx < count, "ring index out of range");
        (heads + idx as usize * 2, tails + idx as usize * 2)
    }

    #[inline]
    pub fn read_head(&self, ring: RingId) -> u16 {
        self.window.read_u16(self.offsets(ring).0)
    }

    #[inline]
    pub fn read_tail(&self, ring: RingId) -> u16 {
        self.window.read_u16(self.offsets(ring).1)
    }

    #[inline]
    pub fn write_head(&self, ring: RingId, value: u16) {
        self.window.write_u16(self.offsets(ring).0, value)
    }

    #[inline]
    pub fn write_tail(&self, ring: RingId, value: u16) {
        self.window.write_u16(self.offsets(ring).1, value)
    }

    pub fn transfer_rings(&self) -> u8 {
        self.transfer_rings
    }

    pub fn completion_rings(&self) -> u8 {
        self.completion_rings
    }
}

//=============================================================================
// Registry
//=============================================================================

/// A pipe's transfer ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PipeRing {
    /// Entries live in the shared window.
    Host(RingDescriptor),
    /// Entries live in device memory; the host cannot submit on this pipe.
    DeviceResident { entries: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Pipe {
    pub ring: PipeRing,
    pub completion_ring: u8,
    pub doorbell: u16,
}

/// Descriptors of every opened ring, keyed by pipe / completion ring index.
#[derive(Debug, Clone)]
pub struct RingRegistry {
    pipes: [Option<Pipe>; MAX_RINGS],
    completions: [Option<RingDescriptor>; MAX_RINGS],
}

impl RingRegistry {
    /// Registry holding only ring 0 in both directions.
    pub fn new(ring0_transfer: RingDescriptor, ring0_completion: RingDescriptor) -> Self {
        let mut pipes = [None; MAX_RINGS];
        let mut completions = [None; MAX_RINGS];
        pipes[0] = Some(Pipe {
            ring: PipeRing::Host(ring0_transfer),
            completion_ring: 0,
            doorbell: 0,
        });
        completions[0] = Some(ring0_completion);
        Self { pipes, completions }
    }

    pub fn pipe(&self, idx: u8) -> Option<Pipe> {
        self.pipes.get(idx as usize).copied().flatten()
    }

    pub fn completion(&self, idx: u8) -> Option<RingDescriptor> {
        self.completions.get(idx as usize).copied().flatten()
    }

    pub fn insert_pipe(&mut self, idx: u8, pipe: Pipe) -> bool {
        match self.pipes.get_mut(idx as usize) {
            Some(slot @ None) => {
                *slot = Some(pipe);
                true
            }
            _ => false,
        }
    }

    pub fn insert_completion(&mut self, idx: u8, desc: RingDescriptor) -> bool {
        match self.completions.get_mut(idx as usize) {
            Some(slot @ None) => {
                *slot = Some(desc);
                true
            }
            _ => false,
        }
    }

    /// Opened completion rings in index order.
    pub fn completions(&self) -> impl Iterator<Item = (u8, RingDescriptor)> + '_ {
        self.completions
            .iter()
            .enumerate()
            .filter_map(|(idx, desc)| desc.map(|d| (idx as u8, d)))
    }

    pub fn pipes(&self) -> impl Iterator<Item = (u8, Pipe)> + '_ {
        self.pipes
            .iter()
            .enumerate()
            .filter_map(|(idx, pipe)| pipe.map(|p| (idx as u8, p)))
    }
}
