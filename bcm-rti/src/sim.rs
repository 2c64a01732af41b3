//! Simulated BCM4387 Bluetooth function for host tests.
//!
//! Models just enough of the firmware to exercise the transport: it acknowledges the image
//! doorbell and control stages, parses the context block and pipe 0 control messages out of
//! the window, consumes transfer rings on doorbell writes and posts completions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::vec::Vec;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;

use crate::codec::{
    CompletionHeader, ContextBlock, OpenCompletionRingMessage, OpenPipeMessage, TransferHeader,
};
use crate::device::{Device, InterruptSource};
use crate::error::Error;
use crate::layout::LayoutConfig;
use crate::regs::{bar0, bar1, Reg};
use crate::ring::advance;
use crate::window::SharedWindow;

/// Boot stage the simulated loader reports once the image runs.
pub(crate) const IMAGE_RUNNING_STAGE: u32 = 6;

/// Reset-control value before bring-up.
pub(crate) const RESET_CONTROL_INITIAL: u32 = 0x0008_0001;

/// A 16-byte aligned window of `bytes` bytes, leaked for the duration of the test.
pub(crate) fn window(bytes: usize, iova: u64) -> SharedWindow {
    SharedWindow::from_static(Box::leak(vec![0u128; bytes / 16].into_boxed_slice()), iova)
}

/// BCM4387 layout shrunk to a 1 MiB window.
pub(crate) fn small_layout() -> LayoutConfig {
    LayoutConfig {
        window_size: 0x10_0000,
        ..LayoutConfig::new()
    }
}

#[derive(Debug, Clone, Copy)]
struct SimRing {
    offset: usize,
    entries: u16,
    entry_size: usize,
}

impl SimRing {
    fn slot(&self, index: u16) -> usize {
        self.offset + index as usize * self.entry_size
    }
}

#[derive(Debug, Clone, Copy)]
struct SimPipe {
    ring: SimRing,
    completion_ring: u16,
}

/// A transfer entry the simulated firmware consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Transfer {
    pub pipe: u8,
    pub header: TransferHeader,
    pub payload: Vec<u8>,
}

/// A completion the firmware will post.
#[derive(Debug, Clone)]
struct Reply {
    ring: u16,
    header: CompletionHeader,
    payload: Vec<u8>,
}

#[derive(Default)]
struct State {
    bar0: HashMap<u32, u32>,
    bar1: HashMap<u32, u32>,
    config: HashMap<u16, u32>,
    writes: Vec<(Reg, u32)>,
    config_writes: Vec<(u16, u32)>,
    mapped: bool,
    resets: u32,

    ctx: Option<ContextBlock>,
    pipes: HashMap<u16, SimPipe>,
    completion_rings: HashMap<u16, SimRing>,
    device_tails: HashMap<u16, u16>,
    device_heads: HashMap<u16, u16>,
    transfers: Vec<Transfer>,

    ack_image: bool,
    ack_control: [bool; 3],
    respond: bool,
    defer: bool,
    deferred: Vec<Reply>,
}

struct IrqLine {
    count: AtomicU64,
    signal: Signal<CriticalSectionRawMutex, ()>,
}

pub(crate) struct SimDevice {
    window: SharedWindow,
    state: Mutex<State>,
    irq: IrqLine,
}

impl SimDevice {
    pub(crate) fn new(window: SharedWindow) -> Self {
        let mut state = State {
            ack_image: true,
            ack_control: [true; 3],
            respond: true,
            ..State::default()
        };
        state.config.insert(crate::regs::pci::RESET_CONTROL, RESET_CONTROL_INITIAL);
        Self {
            window,
            state: Mutex::new(state),
            irq: IrqLine {
                count: AtomicU64::new(0),
                signal: Signal::new(),
            },
        }
    }

    pub(crate) fn irq(&self) -> SimIrq<'_> {
        SimIrq { line: &self.irq, seen: 0 }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    //=========================================================================
    // Knobs
    //=========================================================================

    /// Stop acknowledging control stage `stage`.
    pub(crate) fn drop_control_ack(&self, stage: u32) {
        self.lock().ack_control[stage as usize] = false;
    }

    pub(crate) fn drop_image_ack(&self) {
        self.lock().ack_image = false;
    }

    /// Consume transfers without ever completing them.
    pub(crate) fn set_respond(&self, respond: bool) {
        self.lock().respond = respond;
    }

    /// Queue completions instead of posting them until [`SimDevice::flush`].
    pub(crate) fn set_defer(&self, defer: bool) {
        self.lock().defer = defer;
    }

    /// Number of completions queued while deferring.
    pub(crate) fn deferred(&self) -> usize {
        self.lock().deferred.len()
    }

    /// Post every queued completion, newest first, and raise one interrupt.
    pub(crate) fn flush(&self) {
        let mut st = self.lock();
        let replies: Vec<Reply> = st.deferred.drain(..).rev().collect();
        for reply in replies {
            self.post(&mut st, reply);
        }
        drop(st);
        self.raise();
    }

    /// Post an arbitrary completion on `ring` and raise an interrupt.
    pub(crate) fn post_completion(&self, ring: u16, header: CompletionHeader, payload: &[u8]) {
        let mut st = self.lock();
        self.post(
            &mut st,
            Reply {
                ring,
                header,
                payload: payload.to_vec(),
            },
        );
        drop(st);
        self.raise();
    }

    /// Raise an interrupt without touching any state.
    pub(crate) fn raise(&self) {
        self.irq.count.fetch_add(1, Ordering::SeqCst);
        self.irq.signal.signal(());
    }

    //=========================================================================
    // Observations
    //=========================================================================

    pub(crate) fn writes(&self) -> Vec<(Reg, u32)> {
        self.lock().writes.clone()
    }

    pub(crate) fn config_writes(&self) -> Vec<(u16, u32)> {
        self.lock().config_writes.clone()
    }

    pub(crate) fn transfers(&self) -> Vec<Transfer> {
        self.lock().transfers.clone()
    }

    pub(crate) fn context(&self) -> Option<ContextBlock> {
        self.lock().ctx
    }

    pub(crate) fn is_mapped(&self) -> bool {
        self.lock().mapped
    }

    pub(crate) fn resets(&self) -> u32 {
        self.lock().resets
    }

    /// `(index, entries, entry_size)` of every completion ring the firmware knows about.
    pub(crate) fn completion_rings(&self) -> Vec<(u16, u16, usize)> {
        let st = self.lock();
        let mut out: Vec<_> = st
            .completion_rings
            .iter()
            .map(|(idx, r)| (*idx, r.entries, r.entry_size))
            .collect();
        out.sort();
        out
    }

    /// `(index, entries, entry_size, completion ring)` of every host-backed pipe.
    pub(crate) fn pipes(&self) -> Vec<(u16, u16, usize, u16)> {
        let st = self.lock();
        let mut out: Vec<_> = st
            .pipes
            .iter()
            .map(|(idx, p)| (*idx, p.ring.entries, p.ring.entry_size, p.completion_ring))
            .collect();
        out.sort();
        out
    }

    //=========================================================================
    // Firmware model
    //=========================================================================

    fn offset_of(&self, iova: u64) -> usize {
        (iova - self.window.iova()) as usize
    }

    fn register_context(&self, st: &mut State) {
        let ctx_offset = st.bar1.get(&bar1::RTI_CONTEXT_LO.offset).copied().unwrap_or(0) as u64
            | (st.bar1.get(&bar1::RTI_CONTEXT_HI.offset).copied().unwrap_or(0) as u64) << 32;
        let mut raw = [0u8; ContextBlock::SIZE];
        self.window.read(self.offset_of(ctx_offset), &mut raw);
        let ctx = ContextBlock::from_bytes(&raw).unwrap();

        st.pipes.insert(
            0,
            SimPipe {
                ring: SimRing {
                    offset: self.offset_of(ctx.ring0_transfer_addr),
                    entries: ctx.ring0_transfer_entries,
                    entry_size: TransferHeader::SIZE + 4 * ctx.ring0_transfer_foot_size as usize,
                },
                completion_ring: 0,
            },
        );
        st.completion_rings.insert(
            0,
            SimRing {
                offset: self.offset_of(ctx.ring0_completion_addr),
                entries: ctx.ring0_completion_entries,
                entry_size: CompletionHeader::SIZE + 4 * ctx.ring0_completion_foot_size as usize,
            },
        );
        st.ctx = Some(ctx);
    }

    fn index_offset(&self, base: u64, idx: u16) -> usize {
        self.offset_of(base) + idx as usize * 2
    }

    fn consume_transfers(&self, st: &mut State) {
        let Some(ctx) = st.ctx else {
            return;
        };
        let mut pipes: Vec<(u16, SimPipe)> = st.pipes.iter().map(|(i, p)| (*i, *p)).collect();
        pipes.sort_by_key(|(i, _)| *i);

        for (idx, pipe) in pipes {
            let head = self.window.read_u16(self.index_offset(ctx.transfer_heads_addr, idx));
            let mut tail = st.device_tails.get(&idx).copied().unwrap_or(0);
            while tail != head {
                let slot = pipe.ring.slot(tail);
                let mut raw = [0u8; TransferHeader::SIZE];
                self.window.read(slot, &mut raw);
                let header = TransferHeader::from_bytes(&raw).unwrap();
                let mut payload = vec![0u8; header.len as usize];
                if header.flags & TransferHeader::OUT_OF_LINE != 0 {
                    self.window.read(self.offset_of(header.buf_addr), &mut payload);
                } else {
                    self.window.read(slot + TransferHeader::SIZE, &mut payload);
                }

                tail = advance(tail, pipe.ring.entries);
                st.device_tails.insert(idx, tail);
                self.window
                    .write_u16(self.index_offset(ctx.transfer_tails_addr, idx), tail);

                let reply = self.handle(st, idx, &header, &payload);
                st.transfers.push(Transfer {
                    pipe: idx as u8,
                    header,
                    payload,
                });
                if let Some(reply) = reply {
                    if st.defer {
                        st.deferred.push(reply);
                    } else {
                        self.post(st, reply);
                    }
                }
            }
        }
    }

    /// Firmware reaction to one transfer entry.
    fn handle(&self, st: &mut State, pipe: u16, header: &TransferHeader, payload: &[u8]) -> Option<Reply> {
        let sim_pipe = st.pipes.get(&pipe).copied()?;
        if pipe == 0 {
            match payload.first() {
                Some(&OpenCompletionRingMessage::MSG_TYPE) => {
                    let msg = OpenCompletionRingMessage::from_bytes(payload).ok()?;
                    st.completion_rings.insert(
                        msg.ring_idx,
                        SimRing {
                            offset: self.offset_of(msg.ring_iova),
                            entries: msg.ring_count,
                            entry_size: msg.entry_size(),
                        },
                    );
                }
                Some(&OpenPipeMessage::MSG_TYPE) => {
                    let msg = OpenPipeMessage::from_bytes(payload).ok()?;
                    if !msg.is_device_resident() {
                        st.pipes.insert(
                            msg.pipe_idx,
                            SimPipe {
                                ring: SimRing {
                                    offset: self.offset_of(msg.ring_iova),
                                    entries: msg.ring_count,
                                    entry_size: msg.entry_size(),
                                },
                                completion_ring: msg.completion_ring,
                            },
                        );
                    }
                }
                _ => {}
            }
        }
        if !st.respond {
            return None;
        }

        // Control messages are acknowledged without payload; data is echoed back inline when
        // the completion slot has room for it.
        let room = st
            .completion_rings
            .get(&sim_pipe.completion_ring)
            .map_or(0, |r| r.entry_size - CompletionHeader::SIZE);
        let echo = if pipe == 0 || payload.len() > room {
            Vec::new()
        } else {
            payload.to_vec()
        };
        Some(Reply {
            ring: sim_pipe.completion_ring,
            header: CompletionHeader {
                flags: if echo.is_empty() { 0 } else { CompletionHeader::INLINE_PAYLOAD },
                pipe_idx: pipe,
                msg_id: header.msg_id,
                len: echo.len() as u32,
            },
            payload: echo,
        })
    }

    fn post(&self, st: &mut State, reply: Reply) {
        let (Some(ctx), Some(ring)) = (st.ctx, st.completion_rings.get(&reply.ring).copied()) else {
            return;
        };
        let head = st.device_heads.get(&reply.ring).copied().unwrap_or(0);
        let slot = ring.slot(head);
        self.window.write(slot, &reply.header.to_bytes());
        let room = ring.entry_size - CompletionHeader::SIZE;
        let n = reply.payload.len().min(room);
        self.window.write(slot + CompletionHeader::SIZE, &reply.payload[..n]);

        let next = advance(head, ring.entries);
        st.device_heads.insert(reply.ring, next);
        std::sync::atomic::fence(Ordering::SeqCst);
        self.window
            .write_u16(self.index_offset(ctx.completion_heads_addr, reply.ring), next);
    }
}

impl Device for SimDevice {
    fn read32(&self, reg: Reg) -> u32 {
        let st = self.lock();
        let map = match reg.bar {
            crate::regs::Bar::Bar0 => &st.bar0,
            crate::regs::Bar::Bar1 => &st.bar1,
        };
        map.get(&reg.offset).copied().unwrap_or(0)
    }

    fn write32(&self, reg: Reg, value: u32) {
        let mut st = self.lock();
        st.writes.push((reg, value));
        match reg.bar {
            crate::regs::Bar::Bar0 => st.bar0.insert(reg.offset, value),
            crate::regs::Bar::Bar1 => st.bar1.insert(reg.offset, value),
        };

        let mut interrupt = false;
        if reg == bar0::IMG_DOORBELL && st.ack_image {
            st.bar1.insert(bar1::BOOTSTAGE.offset, IMAGE_RUNNING_STAGE);
            st.bar1.insert(bar1::RTI_GET_CAPABILITY.offset, 0x1);
            interrupt = true;
        } else if reg == bar0::RTI_CONTROL {
            if value == 1 {
                self.register_context(&mut st);
            }
            if st.ack_control.get(value as usize).copied().unwrap_or(false) {
                st.bar1.insert(bar1::RTI_GET_STATUS.offset, value);
                interrupt = true;
            }
        } else if reg == bar0::RING_DOORBELL {
            let before = st.device_heads.clone();
            self.consume_transfers(&mut st);
            interrupt = st.device_heads != before;
        }
        drop(st);

        if interrupt {
            self.raise();
        }
    }

    fn config_read16(&self, offset: u16) -> u16 {
        self.lock().config.get(&offset).copied().unwrap_or(0) as u16
    }

    fn config_write16(&self, offset: u16, value: u16) {
        let mut st = self.lock();
        st.config_writes.push((offset, value as u32));
        st.config.insert(offset, value as u32);
    }

    fn config_read32(&self, offset: u16) -> u32 {
        self.lock().config.get(&offset).copied().unwrap_or(0)
    }

    fn config_write32(&self, offset: u16, value: u32) {
        let mut st = self.lock();
        st.config_writes.push((offset, value));
        st.config.insert(offset, value);
    }

    fn reset(&self) -> Result<(), Error> {
        let mut st = self.lock();
        st.resets += 1;
        st.bar1.clear();
        Ok(())
    }

    fn map_dma(&self, window: &SharedWindow) -> Result<(), Error> {
        if window.iova() != self.window.iova() {
            return Err(Error::ResourceUnavailable);
        }
        self.lock().mapped = true;
        Ok(())
    }

    fn unmap_dma(&self, _window: &SharedWindow) -> Result<(), Error> {
        self.lock().mapped = false;
        Ok(())
    }
}

/// Interrupt line of a [`SimDevice`].
pub(crate) struct SimIrq<'a> {
    line: &'a IrqLine,
    seen: u64,
}

impl InterruptSource for SimIrq<'_> {
    async fn wait(&mut self) -> Result<u64, Error> {
        loop {
            let now = self.line.count.load(Ordering::SeqCst);
            if now != self.seen {
                let delivered = now - self.seen;
                self.seen = now;
                return Ok(delivered);
            }
            self.line.signal.wait().await;
        }
    }
}
