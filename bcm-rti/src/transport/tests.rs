use core::cell::{Cell, RefCell};
use core::future::Future;
use std::vec::Vec;

use embassy_futures::block_on;
use embassy_futures::join::{join, join_array};
use embassy_futures::yield_now;
use embassy_time::{with_timeout, Duration};

use super::*;
use crate::boot::{BootCause, BootConfig, BootError, BootReport, BootSequencer, BootStage};
use crate::codec::CompletionHeader;
use crate::dispatcher::Event;
use crate::layout::Error as LayoutError;
use crate::regs::{bar1, config, pci};
use crate::sim::{self, SimDevice, SimIrq, IMAGE_RUNNING_STAGE, RESET_CONTROL_INITIAL};

const IOVA: u64 = 0x0200_0000;
const FIRMWARE: [u8; 0x300] = [0x5a; 0x300];

/// Default BCM4387 rings plus an echo pipe whose completions have room for a payload.
const ECHO_RINGS: [CompletionRingParams; 2] = [
    CompletionRingParams::new(1, 256, 0),
    CompletionRingParams::new(2, 64, 66),
];
const ECHO_PIPES: [PipeParams; 3] = [
    PipeParams::new(1, 128, 66, 1, 1),
    PipeParams::device_resident(2, 128, 2, 2),
    PipeParams::new(3, 16, 66, 2, 3),
];

fn transport(sim: &SimDevice, window: SharedWindow) -> Transport<&SimDevice> {
    let config = TransportConfig {
        request_timeout: Duration::from_millis(200),
        ..TransportConfig::new()
    };
    Transport::new(sim, window, &sim::small_layout(), config).unwrap()
}

fn boot_config() -> BootConfig<'static> {
    BootConfig {
        stage_timeout: Duration::from_millis(200),
        ..BootConfig::new(&FIRMWARE)
    }
}

fn echo_boot_config() -> BootConfig<'static> {
    BootConfig {
        completion_rings: &ECHO_RINGS,
        pipes: &ECHO_PIPES,
        ..boot_config()
    }
}

/// Run `body` next to the dispatcher, then tear the transport down.
fn session<F, O, R>(t: &Transport<&SimDevice>, irq: &mut SimIrq<'_>, observer: O, body: F) -> R
where
    F: Future<Output = R>,
    O: FnMut(Event<'_>),
{
    let (dispatched, out) = block_on(join(t.dispatcher().run(irq, observer), async {
        let out = body.await;
        t.teardown().unwrap();
        out
    }));
    dispatched.unwrap();
    out
}

async fn boot(t: &Transport<&SimDevice>, config: BootConfig<'_>) -> Result<BootReport, BootError> {
    BootSequencer::new(t, config).run().await
}

/// Yield until `done` holds, failing the test after a second.
async fn settle(done: impl Fn() -> bool) {
    with_timeout(Duration::from_secs(1), async {
        while !done() {
            yield_now().await;
        }
    })
    .await
    .unwrap();
}

//=============================================================================
// Boot
//=============================================================================

#[test]
fn boot_reaches_operational() {
    let window = sim::window(0x10_0000, IOVA);
    let sim = SimDevice::new(window);
    let t = transport(&sim, window);
    let mut irq = sim.irq();

    let report = session(&t, &mut irq, |_| {}, boot(&t, boot_config())).unwrap();
    assert_eq!(report.boot_stage, IMAGE_RUNNING_STAGE);
    assert_eq!(report.image.len, FIRMWARE.len());
    assert_eq!(report.image.padded_len, 0x400);
    assert_eq!(sim.resets(), 1);
    assert!(!sim.is_mapped());

    // Control stages in order, after the context block was registered.
    let writes = sim.writes();
    let controls: Vec<u32> = writes
        .iter()
        .filter(|(reg, _)| *reg == bar0::RTI_CONTROL)
        .map(|(_, v)| *v)
        .collect();
    assert_eq!(controls, [1, 2]);
    let ctx_at = writes.iter().position(|(reg, _)| *reg == bar1::RTI_CONTEXT_LO).unwrap();
    let control1_at = writes.iter().position(|(reg, _)| *reg == bar0::RTI_CONTROL).unwrap();
    assert!(ctx_at < control1_at);

    let image_size = writes.iter().find(|(reg, _)| *reg == bar1::IMG_SZ).unwrap();
    assert_eq!(image_size.1, FIRMWARE.len() as u32);

    let ctx = sim.context().unwrap();
    assert_eq!(ctx.version, ContextBlock::VERSION);
    assert_eq!(ctx.transfer_ring_count, 9);
    assert_eq!(ctx.completion_ring_count, 6);
    assert_eq!(ctx.ring0_completion_doorbell, ContextBlock::NO_DOORBELL);

    // PCI configuration.
    let cfg = sim.config_writes();
    assert!(cfg.contains(&(pci::COMMAND, pci::COMMAND_BUS_MASTER as u32)));
    for write in config::ADDRESS_WINDOWS {
        assert!(cfg.contains(&(write.offset, write.value)));
    }
    assert_eq!(
        cfg.last(),
        Some(&(pci::RESET_CONTROL, pci::reset_control_update(RESET_CONTROL_INITIAL)))
    );

    // Ring geometry as the firmware saw it.
    assert_eq!(
        sim.completion_rings(),
        [(0, 128, 16), (1, 256, 16), (2, 256, 280), (3, 128, 16), (4, 128, 280), (5, 128, 280)]
    );
    assert_eq!(sim.pipes(), [(0, 128, 16, 0), (1, 128, 280, 1)]);
}

#[test]
fn boot_uses_out_of_line_control_messages() {
    let window = sim::window(0x10_0000, IOVA);
    let sim = SimDevice::new(window);
    let t = transport(&sim, window);
    let mut irq = sim.irq();

    session(&t, &mut irq, |_| {}, boot(&t, boot_config())).unwrap();

    let control_iova = t.with_layout(|l| window.iova_of(l.control_buffer()));
    let transfers = sim.transfers();
    assert_eq!(transfers.len(), 7);
    for (n, transfer) in transfers.iter().enumerate() {
        assert_eq!(transfer.pipe, 0);
        assert_eq!(transfer.header.flags, TransferHeader::OUT_OF_LINE);
        assert_eq!(transfer.header.len, 0x34);
        assert_eq!(transfer.header.buf_addr, control_iova);
        assert_eq!(transfer.header.msg_id, 123 + n as u16);
    }

    let cr2 = OpenCompletionRingMessage::from_bytes(&transfers[1].payload).unwrap();
    assert_eq!(cr2.ring_idx, 2);
    assert_eq!(cr2.foot_size, 66);
    assert_eq!(cr2.intmod_delay, 1000);
    assert_eq!(cr2.intmod_bytes, OpenCompletionRingMessage::INTMOD_BYTES_DISABLED);

    let pipe2 = OpenPipeMessage::from_bytes(&transfers[6].payload).unwrap();
    assert_eq!(pipe2.pipe_idx, 2);
    assert_eq!(pipe2.ring_iova, 0);
    assert!(pipe2.is_device_resident());

    // Pipe 0 doorbells announce each new head.
    let doorbells: Vec<u32> = sim
        .writes()
        .iter()
        .filter(|(reg, _)| *reg == bar0::RING_DOORBELL)
        .map(|(_, v)| *v)
        .collect();
    let expected: Vec<u32> = (1..=7).map(|head| doorbell_value(head, 0)).collect();
    assert_eq!(doorbells, expected);
}

#[test]
fn boot_reports_stage_that_timed_out() {
    let cases = [
        (2, BootStage::Operational, 2, 1),
        (1, BootStage::ContextRegistration, 1, 0),
    ];
    for (stage, failed, expected, observed) in cases {
        let window = sim::window(0x10_0000, IOVA);
        let sim = SimDevice::new(window);
        sim.drop_control_ack(stage);
        let t = transport(&sim, window);
        let mut irq = sim.irq();

        let err = session(&t, &mut irq, |_| {}, boot(&t, boot_config())).unwrap_err();
        assert_eq!(
            err,
            BootError {
                stage: failed,
                cause: BootCause::StageTimeout { expected, observed },
            }
        );
    }
}

#[test]
fn boot_fails_without_image_interrupt() {
    let window = sim::window(0x10_0000, IOVA);
    let sim = SimDevice::new(window);
    sim.drop_image_ack();
    let t = transport(&sim, window);
    let mut irq = sim.irq();

    let err = session(&t, &mut irq, |_| {}, boot(&t, boot_config())).unwrap_err();
    assert_eq!(err.stage, BootStage::ImageHandoff);
    assert_eq!(err.cause, BootCause::NoInterrupt);

    let config = BootConfig {
        image_ready_stage: Some(IMAGE_RUNNING_STAGE),
        ..boot_config()
    };
    let window = sim::window(0x10_0000, IOVA);
    let sim = SimDevice::new(window);
    sim.drop_image_ack();
    let t = transport(&sim, window);
    let mut irq = sim.irq();
    let err = session(&t, &mut irq, |_| {}, boot(&t, config)).unwrap_err();
    assert_eq!(
        err.cause,
        BootCause::StageTimeout {
            expected: IMAGE_RUNNING_STAGE,
            observed: 0
        }
    );
}

#[test]
fn boot_rejects_oversized_firmware() {
    let window = sim::window(0x10_0000, IOVA);
    let sim = SimDevice::new(window);
    let t = transport(&sim, window);
    let mut irq = sim.irq();

    let huge = std::vec![0u8; 0x10_0001];
    let config = BootConfig {
        firmware: &huge,
        ..boot_config()
    };
    let err = session(&t, &mut irq, |_| {}, boot(&t, config)).unwrap_err();
    assert_eq!(err.stage, BootStage::ImageStaging);
}

//=============================================================================
// Requests
//=============================================================================

#[test]
fn request_echo_and_status_only_completion() {
    let window = sim::window(0x10_0000, IOVA);
    let sim = SimDevice::new(window);
    let t = transport(&sim, window);
    let mut irq = sim.irq();

    let (echo, status) = session(&t, &mut irq, |_| {}, async {
        boot(&t, echo_boot_config()).await.unwrap();
        let echo = t.send_request(3, &[0x01, 0x03, 0x0c, 0x00]).await.unwrap();
        // CR1 slots have no room for the echo, so the firmware answers header-only.
        let status = t.send_request(1, &[0x01, 0x03, 0x0c, 0x00]).await.unwrap();
        (echo, status)
    });

    assert_eq!(echo.ring, 2);
    assert_eq!(echo.header.pipe_idx, 3);
    assert_eq!(echo.payload.as_slice(), [0x01, 0x03, 0x0c, 0x00]);

    assert_eq!(status.ring, 1);
    assert!(!status.header.has_inline_payload());
    assert!(status.payload.is_empty());

    let data = sim.transfers().into_iter().find(|t| t.pipe == 3).unwrap();
    assert_eq!(data.header.flags, TransferHeader::INLINE);
    assert_eq!(data.header.len, 4);
    assert!(sim
        .writes()
        .contains(&(bar0::RING_DOORBELL, doorbell_value(1, 3))));
    assert_eq!(t.pending.in_flight(), 0);
}

#[test]
fn request_rejects_bad_pipes_and_payloads() {
    let window = sim::window(0x10_0000, IOVA);
    let sim = SimDevice::new(window);
    let t = transport(&sim, window);
    let mut irq = sim.irq();

    session(&t, &mut irq, |_| {}, async {
        boot(&t, boot_config()).await.unwrap();

        assert_eq!(t.send_request(2, &[1]).await, Err(Error::InvalidPipe { pipe: 2 }));
        assert_eq!(t.send_request(7, &[1]).await, Err(Error::InvalidPipe { pipe: 7 }));
        assert_eq!(
            t.send_request(1, &[0; 265]).await,
            Err(Error::PayloadTooLarge { len: 265, max: 264 })
        );
        assert_eq!(
            t.send_request(0, &[0; 0x35]).await,
            Err(Error::PayloadTooLarge { len: 0x35, max: 0x34 })
        );
        assert_eq!(
            t.open_pipe(&PipeParams::new(4, 16, 0, 9, 4)).await,
            Err(Error::ProtocolViolation(Violation::UnknownCompletionRing { ring: 9 }))
        );
        assert_eq!(
            t.open_pipe(&PipeParams::device_resident(2, 128, 2, 2)).await,
            Err(Error::InvalidPipe { pipe: 2 })
        );
        assert_eq!(
            t.open_pipe(&PipeParams::device_resident(9, 128, 2, 9)).await,
            Err(Error::InvalidPipe { pipe: 9 })
        );
    });
}

#[test]
fn request_checks_transfer_indices() {
    let window = sim::window(0x10_0000, IOVA);
    let sim = SimDevice::new(window);
    let t = transport(&sim, window);
    let mut irq = sim.irq();

    session(&t, &mut irq, |_| {}, async {
        boot(&t, boot_config()).await.unwrap();
        let ring = RingId::Transfer(1);

        // One slot is always left empty: head 0 with tail 1 is a full ring.
        t.indices().write_tail(ring, 1);
        assert_eq!(t.send_request(1, &[1]).await, Err(Error::RingFull { pipe: 1 }));

        t.indices().write_head(ring, 200);
        assert_eq!(
            t.send_request(1, &[1]).await,
            Err(Error::ProtocolViolation(Violation::IndexOutOfRange {
                ring: 1,
                index: 200,
                entries: 128
            }))
        );
    });
    assert_eq!(t.pending.in_flight(), 0);
}

#[test]
fn timed_out_request_is_deregistered() {
    let window = sim::window(0x10_0000, IOVA);
    let sim = SimDevice::new(window);
    let t = transport(&sim, window);
    let mut irq = sim.irq();
    let unsolicited = RefCell::new(Vec::new());

    let observer = |event: Event<'_>| {
        if let Event::Unsolicited(c) = event {
            unsolicited.borrow_mut().push(c.header.msg_id);
        }
    };
    let msg_id = session(&t, &mut irq, observer, async {
        boot(&t, echo_boot_config()).await.unwrap();
        sim.set_respond(false);

        let err = t.send_request(3, &[9, 9]).await.unwrap_err();
        let Error::RequestTimeout { msg_id } = err else {
            panic!("unexpected error {:?}", err);
        };
        assert_eq!(t.pending.in_flight(), 0);

        // The late completion reaches nobody.
        let late = CompletionHeader {
            flags: 0,
            pipe_idx: 3,
            msg_id,
            len: 0,
        };
        sim.post_completion(2, late, &[]);
        settle(|| !unsolicited.borrow().is_empty()).await;
        msg_id
    });
    assert_eq!(unsolicited.into_inner(), [msg_id]);
}

#[test]
fn requests_after_teardown_fail() {
    let window = sim::window(0x10_0000, IOVA);
    let sim = SimDevice::new(window);
    let t = transport(&sim, window);
    let mut irq = sim.irq();

    session(&t, &mut irq, |_| {}, async {
        boot(&t, boot_config()).await.unwrap();
    });
    assert_eq!(block_on(t.send_request(1, &[1])), Err(Error::Shutdown));
    assert!(!t.is_armed());
}

//=============================================================================
// Completions
//=============================================================================

#[test]
fn completions_are_matched_out_of_order() {
    let window = sim::window(0x10_0000, IOVA);
    let sim = SimDevice::new(window);
    let t = transport(&sim, window);
    let mut irq = sim.irq();

    let replies = session(&t, &mut irq, |_| {}, async {
        boot(&t, echo_boot_config()).await.unwrap();
        sim.set_defer(true);

        let requests: [_; 8] = core::array::from_fn(|i| {
            let t = &t;
            async move { t.send_request(3, &[i as u8; 3]).await }
        });
        let flush = async {
            settle(|| sim.deferred() == 8).await;
            sim.flush();
        };
        join(join_array(requests), flush).await.0
    });

    for (i, reply) in replies.into_iter().enumerate() {
        assert_eq!(reply.unwrap().payload.as_slice(), [i as u8; 3]);
    }
}

#[test]
fn concurrent_callers_on_threads() {
    let window = sim::window(0x10_0000, IOVA);
    let sim = SimDevice::new(window);
    let t = transport(&sim, window);
    let mut irq = sim.irq();

    std::thread::scope(|s| {
        let t = &t;
        let dispatcher = s.spawn(move || block_on(t.dispatcher().run(&mut irq, |_| {})));

        let booted = s.spawn(move || block_on(boot(t, echo_boot_config())));
        booted.join().unwrap().unwrap();

        let callers: Vec<_> = (0..8u8)
            .map(|i| s.spawn(move || block_on(t.send_request(3, &[i; 5]))))
            .collect();
        for (i, caller) in callers.into_iter().enumerate() {
            let reply = caller.join().unwrap().unwrap();
            assert_eq!(reply.payload.as_slice(), [i as u8; 5]);
        }

        t.teardown().unwrap();
        dispatcher.join().unwrap().unwrap();
    });

    // Every completion ring tail caught up with its head.
    for ring in 0..3 {
        let id = RingId::Completion(ring);
        assert_eq!(t.indices().read_tail(id), t.indices().read_head(id));
    }
    assert_eq!(t.pending.in_flight(), 0);
}

#[test]
fn header_only_completion_has_empty_payload() {
    let window = sim::window(0x10_0000, IOVA);
    let sim = SimDevice::new(window);
    let t = transport(&sim, window);
    let mut irq = sim.irq();
    let seen = RefCell::new(Vec::new());
    let violations = Cell::new(0);

    let observer = |event: Event<'_>| match event {
        Event::Unsolicited(c) => seen.borrow_mut().push(c.clone()),
        Event::Violation(_) => violations.set(violations.get() + 1),
    };
    session(&t, &mut irq, observer, async {
        boot(&t, echo_boot_config()).await.unwrap();
        let header = CompletionHeader {
            flags: 0,
            pipe_idx: 3,
            msg_id: 0x999,
            len: 8,
        };
        sim.post_completion(2, header, &[0xaa; 8]);
        settle(|| seen.borrow().len() == 1).await;
    });

    let seen = seen.into_inner();
    assert_eq!(seen[0].header.len, 8);
    assert!(seen[0].payload.is_empty());
    assert_eq!(violations.get(), 0);
}

#[test]
fn oversized_completion_is_truncated_and_reported() {
    let window = sim::window(0x10_0000, IOVA);
    let sim = SimDevice::new(window);
    let t = transport(&sim, window);
    let mut irq = sim.irq();
    let violations = RefCell::new(Vec::new());
    let lengths = RefCell::new(Vec::new());

    let observer = |event: Event<'_>| match event {
        Event::Unsolicited(c) => lengths.borrow_mut().push(c.payload.len()),
        Event::Violation(v) => violations.borrow_mut().push(v),
    };
    session(&t, &mut irq, observer, async {
        boot(&t, echo_boot_config()).await.unwrap();
        let header = CompletionHeader {
            flags: CompletionHeader::INLINE_PAYLOAD,
            pipe_idx: 1,
            msg_id: 0x777,
            len: 8,
        };
        sim.post_completion(1, header, &[0xaa; 8]);
        settle(|| !lengths.borrow().is_empty()).await;
    });

    assert_eq!(
        violations.into_inner(),
        [Violation::LengthExceedsSlot {
            ring: 1,
            len: 8,
            capacity: 0
        }]
    );
    assert_eq!(lengths.into_inner(), [0]);
}

#[test]
fn corrupt_completion_head_skips_ring() {
    let window = sim::window(0x10_0000, IOVA);
    let sim = SimDevice::new(window);
    let t = transport(&sim, window);
    let mut irq = sim.irq();
    let violations = RefCell::new(Vec::new());

    let observer = |event: Event<'_>| {
        if let Event::Violation(v) = event {
            violations.borrow_mut().push(v);
        }
    };
    session(&t, &mut irq, observer, async {
        boot(&t, echo_boot_config()).await.unwrap();
        t.indices().write_head(RingId::Completion(2), 64);
        sim.raise();
        settle(|| !violations.borrow().is_empty()).await;
    });

    assert_eq!(
        violations.into_inner()[0],
        Violation::IndexOutOfRange {
            ring: 2,
            index: 64,
            entries: 64
        }
    );
    assert_eq!(t.indices().read_tail(RingId::Completion(2)), 0);
}

#[test]
fn drained_completion_rings_ring_doorbell() {
    let window = sim::window(0x10_0000, IOVA);
    let sim = SimDevice::new(window);
    let t = transport(&sim, window);
    let mut irq = sim.irq();
    let errors = RefCell::new(Vec::new());

    let doorbells_since = |mark: usize| -> Vec<u32> {
        sim.writes()[mark..]
            .iter()
            .filter(|(reg, _)| *reg == bar0::RING_DOORBELL)
            .map(|(_, v)| *v)
            .collect()
    };
    let observer = |event: Event<'_>| errors.borrow_mut().push(event.error());

    let (cr1_doorbells, cr0_doorbells) = session(&t, &mut irq, observer, async {
        boot(&t, echo_boot_config()).await.unwrap();

        let mark = sim.writes().len();
        for msg_id in [0x501, 0x502] {
            let header = CompletionHeader {
                flags: 0,
                pipe_idx: 5,
                msg_id,
                len: 0,
            };
            sim.post_completion(1, header, &[]);
        }
        settle(|| t.indices().read_tail(RingId::Completion(1)) == 2).await;
        let cr1 = doorbells_since(mark);

        let mark = sim.writes().len();
        let cr0_tail = t.indices().read_tail(RingId::Completion(0));
        let header = CompletionHeader {
            flags: 0,
            pipe_idx: 0,
            msg_id: 0x503,
            len: 0,
        };
        sim.post_completion(0, header, &[]);
        settle(|| t.indices().read_tail(RingId::Completion(0)) == cr0_tail + 1).await;
        (cr1, doorbells_since(mark))
    });

    assert_eq!(cr1_doorbells, [doorbell_value(1, 5), doorbell_value(2, 5)]);
    assert!(cr0_doorbells.is_empty());
    assert_eq!(
        errors.into_inner(),
        [
            Error::UnexpectedCompletion { msg_id: 0x501 },
            Error::UnexpectedCompletion { msg_id: 0x502 },
            Error::UnexpectedCompletion { msg_id: 0x503 },
        ]
    );
}

#[test]
fn completion_naming_unknown_pipe_is_reported() {
    let window = sim::window(0x10_0000, IOVA);
    let sim = SimDevice::new(window);
    let t = transport(&sim, window);
    let mut irq = sim.irq();
    let violations = RefCell::new(Vec::new());

    let observer = |event: Event<'_>| {
        if let Event::Violation(v) = event {
            violations.borrow_mut().push(v);
        }
    };
    let doorbells = session(&t, &mut irq, observer, async {
        boot(&t, echo_boot_config()).await.unwrap();

        let mark = sim.writes().len();
        for pipe_idx in [0x1ff, 12] {
            let header = CompletionHeader {
                flags: 0,
                pipe_idx,
                msg_id: 0x600,
                len: 0,
            };
            sim.post_completion(2, header, &[]);
        }
        settle(|| t.indices().read_tail(RingId::Completion(2)) == 2).await;
        sim.writes()[mark..]
            .iter()
            .filter(|(reg, _)| *reg == bar0::RING_DOORBELL)
            .count()
    });

    assert_eq!(
        violations.into_inner(),
        [
            Violation::PipeOutOfRange { ring: 2, pipe: 0x1ff },
            Violation::PipeOutOfRange { ring: 2, pipe: 12 },
        ]
    );
    assert_eq!(doorbells, 0);
}

#[test]
fn ring_counts_beyond_registry_are_rejected() {
    let window = sim::window(0x10_0000, IOVA);
    let sim = SimDevice::new(window);

    let layout = LayoutConfig {
        completion_rings: MAX_RINGS as u8 + 4,
        ..sim::small_layout()
    };
    let err = Transport::new(&sim, window, &layout, TransportConfig::new()).err();
    assert_eq!(
        err,
        Some(Error::Layout(LayoutError::TooManyRings {
            count: MAX_RINGS as u8 + 4,
            max: MAX_RINGS
        }))
    );
}

#[test]
fn highest_tracked_ring_is_drained() {
    let window = sim::window(0x10_0000, IOVA);
    let sim = SimDevice::new(window);
    let top = MAX_RINGS as u8 - 1;
    let layout = LayoutConfig {
        transfer_rings: MAX_RINGS as u8,
        completion_rings: MAX_RINGS as u8,
        ..sim::small_layout()
    };
    let config = TransportConfig {
        request_timeout: Duration::from_millis(200),
        ..TransportConfig::new()
    };
    let t = Transport::new(&sim, window, &layout, config).unwrap();
    let mut irq = sim.irq();

    let reply = session(&t, &mut irq, |_| {}, async {
        boot(&t, boot_config()).await.unwrap();
        t.open_completion_ring(&CompletionRingParams::new(top, 16, 66))
            .await
            .unwrap();
        t.open_pipe(&PipeParams::new(top, 16, 66, top, top as u16))
            .await
            .unwrap();
        t.send_request(top, &[7; 4]).await
    })
    .unwrap();

    assert_eq!(reply.ring, top);
    assert_eq!(reply.payload.as_slice(), [7; 4]);
    assert!(t.completion_ring(top).is_some());
    assert_eq!(
        t.indices().read_tail(RingId::Completion(top)),
        t.indices().read_head(RingId::Completion(top))
    );
}

#[test]
fn context_block_matches_layout() {
    let window = sim::window(0x10_0000, IOVA);
    let sim = SimDevice::new(window);
    let t = transport(&sim, window);

    let ctx = t.write_context_block();
    let mut raw = [0u8; ContextBlock::SIZE];
    window.read(0, &mut raw);
    assert_eq!(ContextBlock::from_bytes(&raw).unwrap(), ctx);
    assert_eq!(ctx.per_info_addr, IOVA + 0x70);
    assert_eq!(ctx.transfer_heads_addr, IOVA + 0x80);
    assert_eq!(ctx.ring0_transfer_addr, IOVA + 0xe0);
    assert_eq!(ctx.ring0_completion_addr, IOVA + 0x8e0);
}
