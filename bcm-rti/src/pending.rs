//! Pending-request table.
//!
//! Maps in-flight message ids to per-slot [`Signal`]s. The transport registers an id right
//! before ringing the doorbell; the dispatcher resolves it when the matching completion is
//! drained. Dropping the returned [`Pending`] handle (after delivery, on timeout or when the
//! request future is cancelled) frees the slot.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;

use crate::codec::CompletionHeader;
use crate::error::{Error, Violation};

/// Maximum number of requests waiting for a completion at once.
pub const MAX_IN_FLIGHT: usize = 16;

/// Largest inline payload a completion slot can carry (255 head and 255 foot words).
pub const MAX_PAYLOAD: usize = 4 * 2 * u8::MAX as usize;

/// Inline payload copied out of a completion slot.
#[derive(Clone, PartialEq, Eq)]
pub struct Payload {
    buf: [u8; MAX_PAYLOAD],
    len: usize,
}

impl Payload {
    pub const fn empty() -> Self {
        Self {
            buf: [0; MAX_PAYLOAD],
            len: 0,
        }
    }

    /// Copy of `data`, cut at [`MAX_PAYLOAD`].
    pub fn from_slice(data: &[u8]) -> Self {
        let mut p = Self::empty();
        p.len = data.len().min(MAX_PAYLOAD);
        p.buf[..p.len].copy_from_slice(&data[..p.len]);
        p
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub(crate) fn buf_mut(&mut self, len: usize) -> &mut [u8] {
        self.len = len.min(MAX_PAYLOAD);
        &mut self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl core::fmt::Debug for Payload {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Payload {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "{=[u8]:02x}", self.as_slice())
    }
}

/// A drained completion entry.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Completion {
    /// Completion ring the entry was drained from.
    pub ring: u8,
    pub header: CompletionHeader,
    /// Empty unless the header carries the inline-payload flag.
    pub payload: Payload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Free,
    Waiting(u16),
    Resolved(u16),
}

pub struct PendingTable {
    slots: Mutex<CriticalSectionRawMutex, RefCell<[Slot; MAX_IN_FLIGHT]>>,
    signals: [Signal<CriticalSectionRawMutex, Completion>; MAX_IN_FLIGHT],
}

impl PendingTable {
    pub const fn new() -> Self {
        Self {
            slots: Mutex::new(RefCell::new([Slot::Free; MAX_IN_FLIGHT])),
            signals: [const { Signal::new() }; MAX_IN_FLIGHT],
        }
    }

    /// Reserve a slot for `msg_id`.
    pub fn register(&self, msg_id: u16) -> Result<Pending<'_>, Error> {
        self.slots.lock(|slots| {
            let mut slots = slots.borrow_mut();
            if slots
                .iter()
                .any(|s| matches!(s, Slot::Waiting(id) | Slot::Resolved(id) if *id == msg_id))
            {
                return Err(Error::ProtocolViolation(Violation::DuplicateMessageId { msg_id }));
            }
            let slot = slots
                .iter()
                .position(|s| *s == Slot::Free)
                .ok_or(Error::TooManyInFlight)?;
            slots[slot] = Slot::Waiting(msg_id);
            self.signals[slot].reset();
            Ok(Pending {
                table: self,
                slot,
                msg_id,
            })
        })
    }

    /// Hand `completion` to the request waiting for its message id.
    ///
    /// Gives the completion back when nobody waits for it.
    pub fn resolve(&self, completion: Completion) -> Result<(), Completion> {
        let msg_id = completion.header.msg_id;
        self.slots.lock(|slots| {
            let mut slots = slots.borrow_mut();
            match slots.iter().position(|s| *s == Slot::Waiting(msg_id)) {
                Some(slot) => {
                    slots[slot] = Slot::Resolved(msg_id);
                    self.signals[slot].signal(completion);
                    Ok(())
                }
                None => Err(completion),
            }
        })
    }

    /// Number of occupied slots.
    pub fn in_flight(&self) -> usize {
        self.slots
            .lock(|slots| slots.borrow().iter().filter(|s| **s != Slot::Free).count())
    }

    fn release(&self, slot: usize, msg_id: u16) {
        self.slots.lock(|slots| {
            let mut slots = slots.borrow_mut();
            if matches!(slots[slot], Slot::Waiting(id) | Slot::Resolved(id) if id == msg_id) {
                slots[slot] = Slot::Free;
                // Drop a completion that raced with a timeout.
                self.signals[slot].reset();
            }
        })
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered request. Frees its slot when dropped.
pub struct Pending<'a> {
    table: &'a PendingTable,
    slot: usize,
    msg_id: u16,
}

impl Pending<'_> {
    pub fn msg_id(&self) -> u16 {
        self.msg_id
    }

    /// Wait until the dispatcher resolves this message id.
    pub async fn wait(&mut self) -> Completion {
        self.table.signals[self.slot].wait().await
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        self.table.release(self.slot, self.msg_id);
    }
}
