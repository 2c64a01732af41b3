//! Completion dispatcher.
//!
//! Runs for the lifetime of the session next to any number of request callers. On every
//! interrupt it drains each registered completion ring from tail to head, hands entries to
//! their waiting requests and reports the rest to an observer. It is the only writer of
//! completion ring tails.
//!
//! ```no_run
//! use embassy_futures::join::join;
//! # async fn example<D: bcm_rti::Device, I: bcm_rti::InterruptSource>(
//! #     transport: &bcm_rti::Transport<D>, irq: &mut I, fw: &[u8]) {
//! let boot = bcm_rti::BootSequencer::new(transport, bcm_rti::BootConfig::new(fw));
//! let dispatcher = transport.dispatcher();
//! let (dispatched, booted) = join(dispatcher.run(irq, |_event| {}), async {
//!     let res = boot.run().await;
//!     transport.teardown().ok();
//!     res
//! })
//! .await;
//! # let _ = (dispatched, booted);
//! # }
//! ```

use embassy_futures::select::{select, Either};

use crate::codec::CompletionHeader;
use crate::device::{Device, InterruptSource};
use crate::error::{Error, Violation};
use crate::pending::{Completion, Payload};
use crate::ring::{pending, RingDescriptor, RingId};
use crate::transport::Transport;

/// Something the dispatcher saw that no request was waiting for.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event<'a> {
    /// A completion whose message id is not pending.
    Unsolicited(&'a Completion),
    /// A ring or entry failed a sanity check.
    Violation(Violation),
}

impl Event<'_> {
    /// The error kind this event stands for.
    pub fn error(&self) -> Error {
        match self {
            Event::Unsolicited(c) => Error::UnexpectedCompletion { msg_id: c.header.msg_id },
            Event::Violation(v) => Error::ProtocolViolation(*v),
        }
    }
}

pub struct Dispatcher<'t, D: Device> {
    transport: &'t Transport<D>,
}

impl<D: Device> Transport<D> {
    pub fn dispatcher(&self) -> Dispatcher<'_, D> {
        Dispatcher { transport: self }
    }
}

impl<'t, D: Device> Dispatcher<'t, D> {
    /// Dispatch until [`Transport::teardown`] or an interrupt source error.
    ///
    /// `irq` is borrowed only for the duration of the call.
    pub async fn run<I, F>(&self, irq: &mut I, mut observer: F) -> Result<(), Error>
    where
        I: InterruptSource,
        F: FnMut(Event<'_>),
    {
        let t = self.transport;
        loop {
            match select(irq.wait(), t.shutdown.wait()).await {
                Either::First(Ok(count)) => {
                    trace!("got {} interrupts", count);
                    if t.is_armed() {
                        let drained = self.drain(&mut observer);
                        trace!("drained {} completions", drained);
                    }
                    t.progress.signal(count);
                }
                Either::First(Err(e)) => {
                    error!("interrupt source failed: {:?}", e);
                    return Err(e);
                }
                Either::Second(()) => {
                    debug!("dispatcher stopped");
                    return Ok(());
                }
            }
        }
    }

    /// Drain every registered completion ring once. Returns the number of entries handled.
    pub fn drain<F>(&self, observer: &mut F) -> usize
    where
        F: FnMut(Event<'_>),
    {
        let mut handled = 0;
        for (ring, desc) in self.transport.completion_rings().into_iter().enumerate() {
            if let Some(desc) = desc {
                handled += self.drain_ring(ring as u8, &desc, observer);
            }
        }
        handled
    }

    fn drain_ring<F>(&self, ring: u8, desc: &RingDescriptor, observer: &mut F) -> usize
    where
        F: FnMut(Event<'_>),
    {
        let t = self.transport;
        let id = RingId::Completion(ring);
        let head = t.indices().read_head(id);
        let tail = t.indices().read_tail(id);

        for index in [head, tail] {
            if !desc.contains(index) {
                let v = Violation::IndexOutOfRange {
                    ring,
                    index,
                    entries: desc.entries,
                };
                warn!("CR{}: {:?}, skipping ring", ring, v);
                observer(Event::Violation(v));
                return 0;
            }
        }

        let mut handled = 0;
        for index in pending(tail, head, desc.entries) {
            let slot = desc.slot_offset(index);
            let mut raw = [0u8; CompletionHeader::SIZE];
            t.window().read(slot, &mut raw);
            let Ok(header) = CompletionHeader::from_bytes(&raw) else {
                break;
            };

            let mut payload = Payload::empty();
            if header.has_inline_payload() {
                let capacity = desc.payload_capacity(CompletionHeader::SIZE);
                let mut len = header.len as usize;
                if len > capacity {
                    let v = Violation::LengthExceedsSlot {
                        ring,
                        len: header.len,
                        capacity,
                    };
                    warn!("CR{}: {:?}, truncating", ring, v);
                    observer(Event::Violation(v));
                    len = capacity;
                }
                t.window().read(slot + CompletionHeader::SIZE, payload.buf_mut(len));
            }

            trace!(
                "CR{}[{}]: msg {:#x} pipe {} flags {:#x} len {}",
                ring,
                index,
                header.msg_id,
                header.pipe_idx,
                header.flags,
                header.len
            );
            let pipe = match u8::try_from(header.pipe_idx) {
                Ok(pipe) if pipe < t.indices().transfer_rings() => Some(pipe),
                _ => {
                    let v = Violation::PipeOutOfRange {
                        ring,
                        pipe: header.pipe_idx,
                    };
                    warn!("CR{}: {:?}, no doorbell", ring, v);
                    observer(Event::Violation(v));
                    None
                }
            };

            let completion = Completion { ring, header, payload };
            if let Err(completion) = t.pending.resolve(completion) {
                let event = Event::Unsolicited(&completion);
                debug!("CR{}: {:?}", ring, event.error());
                observer(event);
            }

            let tail = desc.next(index);
            t.notify_consumed(ring, pipe, tail);
            handled += 1;
        }
        handled
    }
}
