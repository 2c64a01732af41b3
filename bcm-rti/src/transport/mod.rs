//! Ring transport engine.
//!
//! Requests are written into a pipe's transfer ring and announced with a doorbell; the
//! caller then waits until the [`Dispatcher`](crate::dispatcher::Dispatcher) drains the
//! matching completion.
//!
//! ```no_run
//! # async fn example<D: bcm_rti::Device>(transport: &bcm_rti::Transport<D>) -> Result<(), bcm_rti::Error> {
//! use bcm_rti::transport::PipeParams;
//!
//! transport.open_pipe(&PipeParams::new(1, 128, 66, 1, 1)).await?;
//! let reply = transport.send_request(1, &[0x01, 0x03, 0x0c, 0x00]).await?;
//! # let _ = reply;
//! # Ok(()) }
//! ```

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{with_timeout, Duration};

use crate::codec::{
    self, ContextBlock, OpenCompletionRingMessage, OpenPipeMessage, PerInfoBlock, TransferHeader,
};
use crate::device::Device;
use crate::error::{Error, Violation};
use crate::fmt::Hexdump;
use crate::layout::{Layout, LayoutConfig, RegionKind};
use crate::pending::{Completion, PendingTable};
use crate::regs::{bar0, doorbell_value};
use crate::ring::{IndexStore, Pipe, PipeRing, RingDescriptor, RingId, RingRegistry, MAX_RINGS};
use crate::window::SharedWindow;

//=============================================================================
// Configuration
//=============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransportConfig {
    /// How long a request waits for its completion.
    pub request_timeout: Duration,
    /// Message id of the first request; ids then increase by one, wrapping at 16 bits.
    pub first_message_id: u16,
}

impl TransportConfig {
    pub const fn new() -> Self {
        Self {
            request_timeout: Duration::from_secs(2),
            first_message_id: 123,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Parameters of a completion ring opened during boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CompletionRingParams {
    pub index: u8,
    pub entries: u16,
    /// Optional words before the payload, in 32-bit words.
    pub head_size: u8,
    /// Optional words after the header, in 32-bit words.
    pub foot_size: u8,
    pub msi: u16,
    pub intmod_delay: u16,
    pub intmod_bytes: u32,
    pub accum_delay: u16,
    pub accum_bytes: u32,
}

impl CompletionRingParams {
    pub const fn new(index: u8, entries: u16, foot_size: u8) -> Self {
        Self {
            index,
            entries,
            head_size: 0,
            foot_size,
            msi: 0,
            intmod_delay: 0,
            intmod_bytes: OpenCompletionRingMessage::INTMOD_BYTES_DISABLED,
            accum_delay: 0,
            accum_bytes: 0,
        }
    }

    pub const fn with_intmod_delay(mut self, delay: u16) -> Self {
        self.intmod_delay = delay;
        self
    }

    pub const fn entry_size(&self) -> usize {
        codec::entry_size(codec::CompletionHeader::SIZE, self.head_size, self.foot_size)
    }

    /// Control message opening this ring at `ring_iova`.
    pub fn message(&self, ring_iova: u64) -> OpenCompletionRingMessage {
        OpenCompletionRingMessage {
            head_size: self.head_size,
            foot_size: self.foot_size,
            ring_idx: self.index as u16,
            ring_iova,
            ring_count: self.entries,
            msi: self.msi,
            intmod_delay: self.intmod_delay,
            intmod_bytes: self.intmod_bytes,
            accum_delay: self.accum_delay,
            accum_bytes: self.accum_bytes,
        }
    }
}

/// Parameters of a pipe opened during boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PipeParams {
    pub index: u8,
    pub entries: u16,
    pub head_size: u8,
    pub foot_size: u8,
    pub completion_ring: u8,
    pub doorbell: u16,
    pub flags: u16,
}

impl PipeParams {
    /// Pipe with a host-allocated transfer ring.
    pub const fn new(index: u8, entries: u16, foot_size: u8, completion_ring: u8, doorbell: u16) -> Self {
        Self {
            index,
            entries,
            head_size: 0,
            foot_size,
            completion_ring,
            doorbell,
            flags: 0,
        }
    }

    /// Pipe whose transfer ring lives in device memory.
    pub const fn device_resident(index: u8, entries: u16, completion_ring: u8, doorbell: u16) -> Self {
        Self {
            index,
            entries,
            head_size: 0,
            foot_size: 0,
            completion_ring,
            doorbell,
            flags: OpenPipeMessage::FLAG_DEVICE_RESIDENT,
        }
    }

    pub const fn is_device_resident(&self) -> bool {
        self.flags & OpenPipeMessage::FLAG_DEVICE_RESIDENT != 0
    }

    pub const fn entry_size(&self) -> usize {
        codec::entry_size(TransferHeader::SIZE, self.head_size, self.foot_size)
    }

    /// Control message opening this pipe. `ring_iova` is zero for a device-resident ring.
    pub fn message(&self, ring_iova: u64) -> OpenPipeMessage {
        OpenPipeMessage {
            head_size: self.head_size,
            foot_size: self.foot_size,
            pipe_idx: self.index as u16,
            ring_iova,
            ring_count: self.entries,
            completion_ring: self.completion_ring as u16,
            doorbell: self.doorbell,
            flags: self.flags,
        }
    }
}

//=============================================================================
// Transport
//=============================================================================

struct State {
    layout: Layout,
    registry: RingRegistry,
    next_msg_id: u16,
}

pub struct Transport<D: Device> {
    device: D,
    window: SharedWindow,
    indices: IndexStore,
    config: TransportConfig,
    state: BlockingMutex<CriticalSectionRawMutex, RefCell<State>>,
    pub(crate) pending: PendingTable,
    /// Serializes producers of every transfer ring.
    submit: Mutex<CriticalSectionRawMutex, ()>,
    /// Held while a pipe 0 request owns the out-of-line control buffer.
    control: Mutex<CriticalSectionRawMutex, ()>,
    pub(crate) progress: Signal<CriticalSectionRawMutex, u64>,
    pub(crate) shutdown: Signal<CriticalSectionRawMutex, ()>,
    armed: AtomicBool,
    closed: AtomicBool,
}

impl<D: Device> Transport<D> {
    /// Create a transport over `window`.
    ///
    /// The window's length and IOVA override the geometry in `layout`.
    pub fn new(device: D, window: SharedWindow, layout: &LayoutConfig, config: TransportConfig) -> Result<Self, Error> {
        let layout = Layout::new(&LayoutConfig {
            window_size: window.len(),
            window_iova: window.iova(),
            ..*layout
        })?;

        let ring0_transfer = RingDescriptor::new(
            layout.transfer_ring0(),
            layout.config().ring0_transfer_entries,
            layout.config().ring0_transfer_entry_size,
        );
        let ring0_completion = RingDescriptor::new(
            layout.completion_ring0(),
            layout.config().ring0_completion_entries,
            layout.config().ring0_completion_entry_size,
        );
        let indices = IndexStore::new(window, &layout);

        Ok(Self {
            device,
            window,
            indices,
            config,
            state: BlockingMutex::new(RefCell::new(State {
                layout,
                registry: RingRegistry::new(ring0_transfer, ring0_completion),
                next_msg_id: config.first_message_id,
            })),
            pending: PendingTable::new(),
            submit: Mutex::new(()),
            control: Mutex::new(()),
            progress: Signal::new(),
            shutdown: Signal::new(),
            armed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn window(&self) -> &SharedWindow {
        &self.window
    }

    pub fn indices(&self) -> &IndexStore {
        &self.indices
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Run `f` against the current layout.
    pub fn with_layout<R>(&self, f: impl FnOnce(&Layout) -> R) -> R {
        self.state.lock(|s| f(&s.borrow().layout))
    }

    pub fn pipe(&self, idx: u8) -> Option<Pipe> {
        self.state.lock(|s| s.borrow().registry.pipe(idx))
    }

    pub fn completion_ring(&self, idx: u8) -> Option<RingDescriptor> {
        self.state.lock(|s| s.borrow().registry.completion(idx))
    }

    pub(crate) fn completion_rings(&self) -> [Option<RingDescriptor>; MAX_RINGS] {
        self.state.lock(|s| {
            let mut out = [None; MAX_RINGS];
            for (idx, desc) in s.borrow().registry.completions() {
                out[idx as usize] = Some(desc);
            }
            out
        })
    }

    fn allocate_msg_id(&self) -> u16 {
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let id = s.next_msg_id;
            s.next_msg_id = id.wrapping_add(1);
            id
        })
    }

    /// Whether the dispatcher drains completion rings on interrupts.
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Let the dispatcher drain completion rings. Only valid once the context block is in
    /// the window; before that the window holds the firmware image.
    pub(crate) fn arm(&self) {
        self.armed.store(true, Ordering::Release);
    }

    //=========================================================================
    // Requests
    //=========================================================================

    /// Send `payload` on `pipe` and wait for the matching completion.
    ///
    /// Pipe 0 payloads go through the out-of-line control buffer; other pipes carry the
    /// payload inline after the transfer header.
    pub async fn send_request(&self, pipe: u8, payload: &[u8]) -> Result<Completion, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }

        let entry = self.pipe(pipe).ok_or(Error::InvalidPipe { pipe })?;
        let desc = match entry.ring {
            PipeRing::Host(desc) => desc,
            PipeRing::DeviceResident { .. } => return Err(Error::InvalidPipe { pipe }),
        };

        let out_of_line = pipe == 0;
        let control_buffer = self.with_layout(|l| l.region(RegionKind::ControlBuffer));
        let max = match (out_of_line, control_buffer) {
            (true, Some(region)) => region.len,
            (true, None) => 0,
            (false, _) => desc.payload_capacity(TransferHeader::SIZE),
        }
        .min(u16::MAX as usize);
        if payload.len() > max {
            return Err(Error::PayloadTooLarge { len: payload.len(), max });
        }

        let _control = if out_of_line {
            Some(self.control.lock().await)
        } else {
            None
        };

        let mut pending = {
            let _submit = self.submit.lock().await;

            let ring = RingId::Transfer(pipe);
            let head = self.indices.read_head(ring);
            let tail = self.indices.read_tail(ring);
            for index in [head, tail] {
                if !desc.contains(index) {
                    return Err(Violation::IndexOutOfRange {
                        ring: pipe,
                        index,
                        entries: desc.entries,
                    }
                    .into());
                }
            }
            let next = desc.next(head);
            if next == tail {
                warn!("pipe {}: transfer ring full (head {}, tail {})", pipe, head, tail);
                return Err(Error::RingFull { pipe });
            }

            let msg_id = self.allocate_msg_id();
            let pending = self.pending.register(msg_id)?;

            let slot = desc.slot_offset(head);
            let header = match control_buffer {
                Some(region) if out_of_line => {
                    self.window.write(region.offset, payload);
                    TransferHeader {
                        flags: TransferHeader::OUT_OF_LINE,
                        len: payload.len() as u16,
                        buf_addr: self.window.iova_of(region.offset),
                        msg_id,
                    }
                }
                _ => {
                    self.window.write(slot + TransferHeader::SIZE, payload);
                    TransferHeader {
                        flags: TransferHeader::INLINE,
                        len: payload.len() as u16,
                        buf_addr: 0,
                        msg_id,
                    }
                }
            };
            self.window.write(slot, &header.to_bytes());
            self.device.barrier();

            self.indices.write_head(ring, next);
            self.device.barrier();

            trace!("pipe {}: msg {:#x} len {} head -> {}", pipe, msg_id, payload.len(), next);
            self.device.write32(bar0::RING_DOORBELL, doorbell_value(next, pipe));
            pending
        };

        let msg_id = pending.msg_id();
        match with_timeout(self.config.request_timeout, pending.wait()).await {
            Ok(completion) => Ok(completion),
            Err(_) => {
                warn!("pipe {}: msg {:#x} timed out", pipe, msg_id);
                Err(Error::RequestTimeout { msg_id })
            }
        }
    }

    /// Allocate a completion ring in the window and ask the firmware to produce into it.
    pub async fn open_completion_ring(&self, params: &CompletionRingParams) -> Result<RingDescriptor, Error> {
        let entry_size = params.entry_size();
        let region = self.state.lock(|s| {
            s.borrow_mut()
                .layout
                .allocate_ring(RegionKind::CompletionRing(params.index), params.entries, entry_size)
        })?;
        self.window.fill(region.offset, region.len, 0);
        let desc = RingDescriptor::new(region.offset, params.entries, entry_size);

        let msg = params.message(self.window.iova_of(region.offset));
        debug!(
            "opening CR{}: {} x {} bytes at {:#x}",
            params.index, params.entries, entry_size, msg.ring_iova
        );
        self.send_request(0, &msg.to_bytes()).await?;

        let registered = self
            .state
            .lock(|s| s.borrow_mut().registry.insert_completion(params.index, desc));
        if !registered {
            error!("CR{}: opened but not tracked", params.index);
            return Err(Error::ResourceUnavailable);
        }
        Ok(desc)
    }

    /// Open a pipe. Host-backed pipes get a transfer ring in the window.
    pub async fn open_pipe(&self, params: &PipeParams) -> Result<Pipe, Error> {
        // Device-resident pipes get no region, so the layout cannot catch these.
        if params.index >= self.indices.transfer_rings() || self.pipe(params.index).is_some() {
            return Err(Error::InvalidPipe { pipe: params.index });
        }
        if self.completion_ring(params.completion_ring).is_none() {
            return Err(Violation::UnknownCompletionRing {
                ring: params.completion_ring,
            }
            .into());
        }

        let (ring, ring_iova) = if params.is_device_resident() {
            (PipeRing::DeviceResident { entries: params.entries }, 0)
        } else {
            let entry_size = params.entry_size();
            let region = self.state.lock(|s| {
                s.borrow_mut()
                    .layout
                    .allocate_ring(RegionKind::TransferRing(params.index), params.entries, entry_size)
            })?;
            self.window.fill(region.offset, region.len, 0);
            (
                PipeRing::Host(RingDescriptor::new(region.offset, params.entries, entry_size)),
                self.window.iova_of(region.offset),
            )
        };

        let msg = params.message(ring_iova);
        debug!(
            "opening pipe {}: {} entries, CR{}, doorbell {}, ring at {:#x}",
            params.index, params.entries, params.completion_ring, params.doorbell, ring_iova
        );
        self.send_request(0, &msg.to_bytes()).await?;

        let pipe = Pipe {
            ring,
            completion_ring: params.completion_ring,
            doorbell: params.doorbell,
        };
        let registered = self.state.lock(|s| s.borrow_mut().registry.insert_pipe(params.index, pipe));
        if !registered {
            error!("pipe {}: opened but not tracked", params.index);
            return Err(Error::ResourceUnavailable);
        }
        Ok(pipe)
    }

    /// Publish a new completion ring tail and tell the device about it.
    ///
    /// Only the dispatcher calls this, so completion tails have a single writer. Without a
    /// valid `pipe` the tail is published through the index array only.
    pub(crate) fn notify_consumed(&self, ring: u8, pipe: Option<u8>, new_tail: u16) {
        self.indices.write_tail(RingId::Completion(ring), new_tail);
        self.device.barrier();
        // Ring 0 is registered without a completion doorbell.
        if let Some(pipe) = pipe.filter(|_| ring != 0) {
            self.device.write32(bar0::RING_DOORBELL, doorbell_value(new_tail, pipe));
        }
    }

    //=========================================================================
    // Boot support
    //=========================================================================

    /// Write the context block for the current layout and fence it.
    pub(crate) fn write_context_block(&self) -> ContextBlock {
        let (ctx, offset) = self.with_layout(|l| (ContextBlock::for_layout(l), l.context()));
        self.window.write(offset, &ctx.to_bytes());
        self.device.barrier();
        ctx
    }

    /// Telemetry block the firmware fills in after boot.
    pub fn per_info(&self) -> PerInfoBlock {
        let offset = self.with_layout(|l| l.per_info());
        let mut raw = [0u8; PerInfoBlock::SIZE];
        self.window.read(offset, &mut raw);
        PerInfoBlock(raw)
    }

    /// Log the per-info block, every ring index and the bridge error registers.
    pub fn debug_dump(&self) {
        let per_info = self.per_info();
        debug!("per info:\n{}", Hexdump(per_info.as_bytes()));

        for i in 0..self.indices.transfer_rings() {
            let ring = RingId::Transfer(i);
            debug!(
                "TR{} head {} tail {}",
                i,
                self.indices.read_head(ring),
                self.indices.read_tail(ring)
            );
        }
        for i in 0..self.indices.completion_rings() {
            let ring = RingId::Completion(i);
            debug!(
                "CR{} head {} tail {}",
                i,
                self.indices.read_head(ring),
                self.indices.read_tail(ring)
            );
        }

        for reg in [
            bar0::AXI2AHB_ERROR_STATUS,
            bar0::APBBRIDGECB0_ERROR_STATUS,
            bar0::APBBRIDGECB0_ERROR_LO,
            bar0::APBBRIDGECB0_ERROR_HI,
            bar0::APBBRIDGECB0_ERROR_MASTER_ID,
        ] {
            debug!("bar0+{:#06x} = {:#010x}", reg.offset, self.device.read32(reg));
        }
    }

    /// Stop the dispatcher, fail further requests and unmap the window.
    pub fn teardown(&self) -> Result<(), Error> {
        info!("transport teardown");
        self.closed.store(true, Ordering::Release);
        self.armed.store(false, Ordering::Release);
        self.shutdown.signal(());
        self.device.unmap_dma(&self.window)
    }
}

#[cfg(test)]
mod tests;
