//! Fixed-layout structures shared with the firmware.
//!
//! All structures are little-endian with no implicit padding. Reserved bytes are written
//! as zero and ignored when decoding. Every type has a `SIZE`, an infallible `to_bytes`
//! and a `from_bytes` that fails with [`Error::Truncated`] on short input.

use crate::layout::{Layout, PER_INFO_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// Input shorter than the structure.
    Truncated { expected: usize, actual: usize },
    /// Control message with a different message type byte.
    UnexpectedMessageType { expected: u8, actual: u8 },
}

/// Entry size of a ring whose slots carry `head_words` and `foot_words` 32-bit words of
/// optional data around a header of `header_size` bytes.
#[inline]
pub const fn entry_size(header_size: usize, head_words: u8, foot_words: u8) -> usize {
    header_size + 4 * (head_words as usize + foot_words as usize)
}

/// Footer words needed to pad a `header_size` header up to `entry_size`.
#[inline]
const fn foot_words(entry_size: usize, header_size: usize) -> u8 {
    (entry_size.saturating_sub(header_size) / 4) as u8
}

//=============================================================================
// Cursor helpers
//=============================================================================

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn u8(&mut self, v: u8) {
        self.put(&[v]);
    }

    fn u16(&mut self, v: u16) {
        self.put(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.put(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.put(&v.to_le_bytes());
    }

    /// Reserved bytes; the buffer starts zeroed.
    fn skip(&mut self, n: usize) {
        self.pos += n;
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], size: usize) -> Result<Self, Error> {
        if buf.len() < size {
            return Err(Error::Truncated {
                expected: size,
                actual: buf.len(),
            });
        }
        Ok(Self { buf, pos: 0 })
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take())
    }

    fn skip(&mut self, n: usize) {
        self.pos += n;
    }
}

//=============================================================================
// Ring entry headers
//=============================================================================

/// Header of every transfer ring entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferHeader {
    pub flags: u8,
    pub len: u16,
    /// Device address of the payload; only meaningful with [`TransferHeader::OUT_OF_LINE`].
    pub buf_addr: u64,
    pub msg_id: u16,
}

impl TransferHeader {
    pub const SIZE: usize = 16;

    /// Payload lives at `buf_addr`.
    pub const OUT_OF_LINE: u8 = 1 << 0;
    /// Payload follows the header inside the slot.
    pub const INLINE: u8 = 1 << 1;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let mut w = Writer::new(&mut out);
        w.u8(self.flags);
        w.u16(self.len);
        w.skip(1);
        w.u64(self.buf_addr);
        w.u16(self.msg_id);
        w.skip(2);
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(buf, Self::SIZE)?;
        let flags = r.u8();
        let len = r.u16();
        r.skip(1);
        let buf_addr = r.u64();
        let msg_id = r.u16();
        Ok(Self {
            flags,
            len,
            buf_addr,
            msg_id,
        })
    }
}

/// Header of every completion ring entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CompletionHeader {
    pub flags: u8,
    pub pipe_idx: u16,
    pub msg_id: u16,
    pub len: u32,
}

impl CompletionHeader {
    pub const SIZE: usize = 16;

    /// Payload bytes follow the header inside the slot.
    pub const INLINE_PAYLOAD: u8 = 1 << 1;

    #[inline]
    pub fn has_inline_payload(&self) -> bool {
        self.flags & Self::INLINE_PAYLOAD != 0
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let mut w = Writer::new(&mut out);
        w.u8(self.flags);
        w.skip(1);
        w.u16(self.pipe_idx);
        w.u16(self.msg_id);
        w.u32(self.len);
        w.skip(6);
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(buf, Self::SIZE)?;
        let flags = r.u8();
        r.skip(1);
        let pipe_idx = r.u16();
        let msg_id = r.u16();
        let len = r.u32();
        Ok(Self {
            flags,
            pipe_idx,
            msg_id,
            len,
        })
    }
}

//=============================================================================
// Context block
//=============================================================================

/// Root structure the firmware reads to find every other structure in the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ContextBlock {
    pub version: u16,
    pub size: u16,
    pub capabilities: u32,
    pub per_info_addr: u64,
    pub completion_heads_addr: u64,
    pub transfer_tails_addr: u64,
    pub completion_tails_addr: u64,
    pub transfer_heads_addr: u64,
    pub completion_ring_count: u16,
    pub transfer_ring_count: u16,
    pub ring0_completion_addr: u64,
    pub ring0_transfer_addr: u64,
    pub ring0_transfer_entries: u16,
    pub ring0_completion_entries: u16,
    pub ring0_transfer_doorbell: u16,
    pub ring0_completion_doorbell: u16,
    pub ring0_transfer_msi: u16,
    pub ring0_completion_msi: u16,
    pub ring0_transfer_head_size: u8,
    pub ring0_transfer_foot_size: u8,
    pub ring0_completion_head_size: u8,
    pub ring0_completion_foot_size: u8,
    /// In-place / out-of-order completion mode bits.
    pub completion_mode: u16,
    pub per_info_msi: u16,
    pub scratch_addr: u64,
    pub scratch_size: u32,
}

impl ContextBlock {
    pub const SIZE: usize = 0x68;
    pub const VERSION: u16 = 1;
    pub const CAPABILITIES: u32 = 0xa;
    /// Ring 0 completions are not doorbelled.
    pub const NO_DOORBELL: u16 = 0xffff;

    /// Context block describing `layout`, with every address relative to the window IOVA.
    pub fn for_layout(layout: &Layout) -> Self {
        let config = layout.config();
        let iova = |offset: usize| config.window_iova + offset as u64;
        Self {
            version: Self::VERSION,
            size: Self::SIZE as u16,
            capabilities: Self::CAPABILITIES,
            per_info_addr: iova(layout.per_info()),
            completion_heads_addr: iova(layout.completion_heads()),
            transfer_tails_addr: iova(layout.transfer_tails()),
            completion_tails_addr: iova(layout.completion_tails()),
            transfer_heads_addr: iova(layout.transfer_heads()),
            completion_ring_count: config.completion_rings as u16,
            transfer_ring_count: config.transfer_rings as u16,
            ring0_completion_addr: iova(layout.completion_ring0()),
            ring0_transfer_addr: iova(layout.transfer_ring0()),
            ring0_transfer_entries: config.ring0_transfer_entries,
            ring0_completion_entries: config.ring0_completion_entries,
            ring0_transfer_doorbell: 0,
            ring0_completion_doorbell: Self::NO_DOORBELL,
            ring0_transfer_foot_size: foot_words(config.ring0_transfer_entry_size, TransferHeader::SIZE),
            ring0_completion_foot_size: foot_words(config.ring0_completion_entry_size, CompletionHeader::SIZE),
            ..Self::default()
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let mut w = Writer::new(&mut out);
        w.u16(self.version);
        w.u16(self.size);
        w.u32(self.capabilities);
        w.u64(self.per_info_addr);
        w.u64(self.completion_heads_addr);
        w.u64(self.transfer_tails_addr);
        w.u64(self.completion_tails_addr);
        w.u64(self.transfer_heads_addr);
        w.u16(self.completion_ring_count);
        w.u16(self.transfer_ring_count);
        w.u64(self.ring0_completion_addr);
        w.u64(self.ring0_transfer_addr);
        w.u16(self.ring0_transfer_entries);
        w.u16(self.ring0_completion_entries);
        w.u16(self.ring0_transfer_doorbell);
        w.u16(self.ring0_completion_doorbell);
        w.u16(self.ring0_transfer_msi);
        w.u16(self.ring0_completion_msi);
        w.u8(self.ring0_transfer_head_size);
        w.u8(self.ring0_transfer_foot_size);
        w.u8(self.ring0_completion_head_size);
        w.u8(self.ring0_completion_foot_size);
        w.u16(self.completion_mode);
        w.u16(self.per_info_msi);
        w.u64(self.scratch_addr);
        w.u32(self.scratch_size);
        w.skip(4);
        debug_assert_eq!(w.pos, Self::SIZE);
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(buf, Self::SIZE)?;
        Ok(Self {
            version: r.u16(),
            size: r.u16(),
            capabilities: r.u32(),
            per_info_addr: r.u64(),
            completion_heads_addr: r.u64(),
            transfer_tails_addr: r.u64(),
            completion_tails_addr: r.u64(),
            transfer_heads_addr: r.u64(),
            completion_ring_count: r.u16(),
            transfer_ring_count: r.u16(),
            ring0_completion_addr: r.u64(),
            ring0_transfer_addr: r.u64(),
            ring0_transfer_entries: r.u16(),
            ring0_completion_entries: r.u16(),
            ring0_transfer_doorbell: r.u16(),
            ring0_completion_doorbell: r.u16(),
            ring0_transfer_msi: r.u16(),
            ring0_completion_msi: r.u16(),
            ring0_transfer_head_size: r.u8(),
            ring0_transfer_foot_size: r.u8(),
            ring0_completion_head_size: r.u8(),
            ring0_completion_foot_size: r.u8(),
            completion_mode: r.u16(),
            per_info_msi: r.u16(),
            scratch_addr: r.u64(),
            scratch_size: r.u32(),
        })
    }
}

/// Device-written telemetry block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PerInfoBlock(pub [u8; PER_INFO_SIZE]);

impl PerInfoBlock {
    pub const SIZE: usize = PER_INFO_SIZE;

    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(buf, Self::SIZE)?;
        Ok(Self(r.take()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

//=============================================================================
// Control messages (pipe 0)
//=============================================================================

/// Size of every pipe 0 control message.
pub const CONTROL_MESSAGE_SIZE: usize = 0x34;

/// Asks the firmware to start producing into a host-allocated completion ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OpenCompletionRingMessage {
    pub head_size: u8,
    pub foot_size: u8,
    pub ring_idx: u16,
    pub ring_iova: u64,
    pub ring_count: u16,
    pub msi: u16,
    pub intmod_delay: u16,
    pub intmod_bytes: u32,
    pub accum_delay: u16,
    pub accum_bytes: u32,
}

impl OpenCompletionRingMessage {
    pub const SIZE: usize = CONTROL_MESSAGE_SIZE;
    pub const MSG_TYPE: u8 = 2;
    const UNKNOWN_0X12: u32 = 0xffff_ffff;
    /// No byte-count interrupt moderation.
    pub const INTMOD_BYTES_DISABLED: u32 = 0xffff_ffff;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let mut w = Writer::new(&mut out);
        w.u8(Self::MSG_TYPE);
        w.u8(self.head_size);
        w.u8(self.foot_size);
        w.skip(1);
        w.u16(self.ring_idx);
        w.u16(self.ring_idx);
        w.u64(self.ring_iova);
        w.u16(self.ring_count);
        w.u32(Self::UNKNOWN_0X12);
        w.skip(6);
        w.u16(self.msi);
        w.u16(self.intmod_delay);
        w.u32(self.intmod_bytes);
        w.u16(self.accum_delay);
        w.u32(self.accum_bytes);
        w.skip(10);
        debug_assert_eq!(w.pos, Self::SIZE);
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(buf, Self::SIZE)?;
        let msg_type = r.u8();
        if msg_type != Self::MSG_TYPE {
            return Err(Error::UnexpectedMessageType {
                expected: Self::MSG_TYPE,
                actual: msg_type,
            });
        }
        let head_size = r.u8();
        let foot_size = r.u8();
        r.skip(1);
        let ring_idx = r.u16();
        r.skip(2);
        let ring_iova = r.u64();
        let ring_count = r.u16();
        r.skip(4 + 6);
        Ok(Self {
            head_size,
            foot_size,
            ring_idx,
            ring_iova,
            ring_count,
            msi: r.u16(),
            intmod_delay: r.u16(),
            intmod_bytes: r.u32(),
            accum_delay: r.u16(),
            accum_bytes: r.u32(),
        })
    }

    pub fn entry_size(&self) -> usize {
        entry_size(CompletionHeader::SIZE, self.head_size, self.foot_size)
    }
}

/// Asks the firmware to start consuming a transfer ring (pipe).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OpenPipeMessage {
    pub head_size: u8,
    pub foot_size: u8,
    pub pipe_idx: u16,
    /// Zero for a device-resident ring.
    pub ring_iova: u64,
    pub ring_count: u16,
    pub completion_ring: u16,
    pub doorbell: u16,
    pub flags: u16,
}

impl OpenPipeMessage {
    pub const SIZE: usize = CONTROL_MESSAGE_SIZE;
    pub const MSG_TYPE: u8 = 1;
    /// The ring lives in device memory; the host never writes its entries.
    pub const FLAG_DEVICE_RESIDENT: u16 = 0x80;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let mut w = Writer::new(&mut out);
        w.u8(Self::MSG_TYPE);
        w.u8(self.head_size);
        w.u8(self.foot_size);
        w.skip(1);
        w.u16(self.pipe_idx);
        w.u16(self.pipe_idx);
        w.u64(self.ring_iova);
        w.skip(8);
        w.u16(self.ring_count);
        w.u16(self.completion_ring);
        w.u16(self.doorbell);
        w.u16(self.flags);
        w.skip(20);
        debug_assert_eq!(w.pos, Self::SIZE);
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(buf, Self::SIZE)?;
        let msg_type = r.u8();
        if msg_type != Self::MSG_TYPE {
            return Err(Error::UnexpectedMessageType {
                expected: Self::MSG_TYPE,
                actual: msg_type,
            });
        }
        let head_size = r.u8();
        let foot_size = r.u8();
        r.skip(1);
        let pipe_idx = r.u16();
        r.skip(2);
        let ring_iova = r.u64();
        r.skip(8);
        Ok(Self {
            head_size,
            foot_size,
            pipe_idx,
            ring_iova,
            ring_count: r.u16(),
            completion_ring: r.u16(),
            doorbell: r.u16(),
            flags: r.u16(),
        })
    }

    pub fn entry_size(&self) -> usize {
        entry_size(TransferHeader::SIZE, self.head_size, self.foot_size)
    }

    #[inline]
    pub fn is_device_resident(&self) -> bool {
        self.flags & Self::FLAG_DEVICE_RESIDENT != 0
    }
}
