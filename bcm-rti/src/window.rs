//! DMA-shared memory window.
//!
//! The window is written by both the host and the device at the same time, so nothing here
//! hands out `&`/`&mut` references into it. All access goes through raw pointers with
//! volatile reads and writes; ordering against the device is established with explicit
//! barriers by the caller before ringing a doorbell.

use core::ptr::{self, NonNull};

use crate::layout::ALIGN;

/// One contiguous, device-visible memory region.
///
/// Every address embedded in a structure the device reads is `iova + offset`.
#[derive(Debug, Clone, Copy)]
pub struct SharedWindow {
    base: NonNull<u8>,
    len: usize,
    iova: u64,
}

// SAFETY: the window is plain memory shared with a device; all access is volatile and
// bounds-checked, and cross-party ordering is handled with barriers by the users.
unsafe impl Send for SharedWindow {}
unsafe impl Sync for SharedWindow {}

impl SharedWindow {
    /// Wrap an already-mapped window.
    ///
    /// # Safety
    ///
    /// `base` must point to `len` bytes that stay mapped and writable for as long as any copy
    /// of the returned value exists, and must be aligned to 16 bytes. No Rust references
    /// into the region may be held while the window is in use.
    pub unsafe fn new(base: NonNull<u8>, len: usize, iova: u64) -> Self {
        assert!(base.as_ptr() as usize % ALIGN == 0, "shared window base must be 16-byte aligned");
        assert!(iova % ALIGN as u64 == 0, "shared window IOVA must be 16-byte aligned");
        Self { base, len, iova }
    }

    /// Wrap a leaked buffer, typically a simulated window in host tests.
    pub fn from_static(buf: &'static mut [u128], iova: u64) -> Self {
        let len = core::mem::size_of_val(buf);
        let base = NonNull::from(buf).cast::<u8>();
        // SAFETY: the buffer lives forever, is 16-byte aligned and the unique borrow is
        // consumed here.
        unsafe { Self::new(base, len, iova) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Device-visible address of the first byte.
    #[inline]
    pub fn iova(&self) -> u64 {
        self.iova
    }

    /// Device-visible address of `offset`.
    #[inline]
    pub fn iova_of(&self, offset: usize) -> u64 {
        self.iova + offset as u64
    }

    /// Host virtual address of the first byte, for handing to the IOMMU.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline]
    fn check(&self, offset: usize, len: usize) {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "shared window access out of bounds"
        );
    }

    /// Read a little-endian 16-bit counter.
    #[inline]
    pub fn read_u16(&self, offset: usize) -> u16 {
        self.check(offset, 2);
        debug_assert!(offset % 2 == 0);
        // SAFETY: in bounds and 2-byte aligned (base is 16-aligned, offset even).
        u16::from_le(unsafe { ptr::read_volatile(self.base.as_ptr().add(offset) as *const u16) })
    }

    /// Write a little-endian 16-bit counter.
    #[inline]
    pub fn write_u16(&self, offset: usize, value: u16) {
        self.check(offset, 2);
        debug_assert!(offset % 2 == 0);
        // SAFETY: see `read_u16`.
        unsafe { ptr::write_volatile(self.base.as_ptr().add(offset) as *mut u16, value.to_le()) }
    }

    /// Copy `data` into the window at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) {
        self.check(offset, data.len());
        let dst = unsafe { self.base.as_ptr().add(offset) };
        for (i, byte) in data.iter().enumerate() {
            // SAFETY: in bounds per `check`.
            unsafe { ptr::write_volatile(dst.add(i), *byte) };
        }
    }

    /// Copy `out.len()` bytes from the window at `offset`.
    pub fn read(&self, offset: usize, out: &mut [u8]) {
        self.check(offset, out.len());
        let src = unsafe { self.base.as_ptr().add(offset) };
        for (i, byte) in out.iter_mut().enumerate() {
            // SAFETY: in bounds per `check`.
            *byte = unsafe { ptr::read_volatile(src.add(i)) };
        }
    }

    /// Set `len` bytes at `offset` to `value`.
    pub fn fill(&self, offset: usize, len: usize, value: u8) {
        self.check(offset, len);
        // SAFETY: in bounds per `check`. Only used while the device is not touching the range.
        unsafe { ptr::write_bytes(self.base.as_ptr().add(offset), value, len) };
    }

    /// Zero the whole window.
    pub fn clear(&self) {
        self.fill(0, self.len, 0);
    }
}
