// DMA engine: channel ownership, single transfers with alignment
// compensation, command packet chains and the relaxed BLT mode.
//
// A spawned thread plays the chip side: it waits for DGCS.ACT, moves
// the "data", flips the status bits and raises the DMA interrupt.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::setup;
use vme_bridge::regs::{bits, offsets};
use vme_bridge::{BridgeError, DmaDirection, DmaParam, MemBus, RegisterBus, UniverseII};

fn wait_for_act(bus: &MemBus) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while bus.read(offsets::DGCS) & bits::DGCS_ACT == 0 {
        assert!(Instant::now() < deadline, "DMA was never started");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Chip side of a single transfer: complete with `status` bits and
/// `remaining` bytes left in DTBC.
fn spawn_dma_hw(
    bus: Arc<MemBus>,
    drv: Arc<UniverseII>,
    remaining: u32,
    status: u32,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        wait_for_act(&bus);
        bus.hw_store(offsets::DTBC, remaining);
        bus.hw_clear(offsets::DGCS, bits::DGCS_ACT);
        bus.hw_set(offsets::DGCS, status);
        bus.hw_set(offsets::LINT_STAT, bits::LINT_DMA);
        drv.handle_interrupt();
    })
}

/// Chip side of a chained transfer: walk the DCPP list and mark the
/// first `process` packets as processed, then signal completion.
fn spawn_chain_hw(bus: Arc<MemBus>, drv: Arc<UniverseII>, process: usize) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        wait_for_act(&bus);
        let mem = drv.dma_packet_mem();
        let mut node = bus.read(offsets::DCPP) & !0x3;
        for _ in 0..process {
            let off = node - mem.base();
            let link = mem.read32(off + 0x18);
            mem.write32(off + 0x18, link | bits::DCPP_PROCESSED);
            if link & bits::DCPP_NULL != 0 {
                break;
            }
            node = link & !0x3;
        }
        bus.hw_clear(offsets::DGCS, bits::DGCS_ACT);
        bus.hw_set(offsets::DGCS, bits::DGCS_DONE);
        bus.hw_set(offsets::LINT_STAT, bits::LINT_DMA);
        drv.handle_interrupt();
    })
}

#[test]
fn test_channel_is_exclusive() {
    let (_bus, _mapper, drv) = setup();

    drv.request_dma_channel(0).unwrap();
    assert_eq!(
        drv.request_dma_channel(0),
        Err(BridgeError::ResourceBusy("DMA channel already in use"))
    );
    drv.release_dma_channel();
    drv.request_dma_channel(4).unwrap();
}

#[test]
fn test_transfer_rejects_oversized_request() {
    let (_bus, _mapper, drv) = setup();

    // Four segments of 0x8000 bytes each
    drv.request_dma_channel(4).unwrap();
    let param = DmaParam {
        count: 0x9000,
        vme_addr: 0x0020_0000,
        ctl: 0,
        buf_index: 3,
    };
    assert!(matches!(
        drv.dma_transfer(DmaDirection::VmeToLocal, param),
        Err(BridgeError::InvalidParameter(_))
    ));
}

#[test]
fn test_transfer_rejects_huge_buffer_index() {
    let (_bus, _mapper, drv) = setup();

    drv.request_dma_channel(1).unwrap();
    // buf_size * buf_index would wrap a 32-bit product
    let param = DmaParam {
        count: 0x100,
        vme_addr: 0x0020_0000,
        ctl: 0,
        buf_index: 0x8000,
    };
    assert!(matches!(
        drv.dma_transfer(DmaDirection::VmeToLocal, param),
        Err(BridgeError::InvalidParameter(_))
    ));
}

#[test]
fn test_chain_rejects_huge_packet_count() {
    let (_bus, _mapper, drv) = setup();
    drv.request_dma_channel(0).unwrap();

    let list = drv.new_dma_chain().unwrap();
    assert!(matches!(
        drv.add_dma_packet(list, 0, u32::MAX, 0x0030_0000),
        Err(BridgeError::ResourceExhausted(_))
    ));
}

#[test]
fn test_single_transfer_completes() {
    let (bus, _mapper, drv) = setup();
    drv.request_dma_channel(0).unwrap();

    let hw = spawn_dma_hw(bus.clone(), drv.clone(), 0, bits::DGCS_DONE);
    let param = DmaParam {
        count: 0x100,
        vme_addr: 0x0020_0000,
        ctl: 0,
        buf_index: 0,
    };
    let offset = drv.dma_transfer(DmaDirection::VmeToLocal, param).unwrap();
    hw.join().unwrap();

    assert_eq!(offset, 0);
    assert_eq!(bus.read(offsets::DVA), 0x0020_0000);
    assert_eq!(drv.stats().dma_errors, 0);
}

#[test]
fn test_transfer_compensates_low_address_bits() {
    let (bus, _mapper, drv) = setup();
    drv.request_dma_channel(0).unwrap();

    let hw = spawn_dma_hw(bus.clone(), drv.clone(), 0, bits::DGCS_DONE);
    // VME address has low bits 0b101, the pool is 8-byte aligned
    let param = DmaParam {
        count: 0x100,
        vme_addr: 0x0020_0005,
        ctl: 0,
        buf_index: 0,
    };
    let offset = drv.dma_transfer(DmaDirection::VmeToLocal, param).unwrap();
    hw.join().unwrap();

    assert_eq!(offset, 5);
    assert_eq!(bus.read(offsets::DLA) & 0x7, bus.read(offsets::DVA) & 0x7);
}

#[test]
fn test_write_transfer_sets_direction_bit() {
    let (bus, _mapper, drv) = setup();
    drv.request_dma_channel(0).unwrap();

    let hw = spawn_dma_hw(bus.clone(), drv.clone(), 0, bits::DGCS_DONE);
    let param = DmaParam {
        count: 0x40,
        vme_addr: 0x0020_0000,
        ctl: 0,
        buf_index: 0,
    };
    drv.dma_transfer(DmaDirection::LocalToVme, param).unwrap();
    hw.join().unwrap();

    assert_ne!(bus.read(offsets::DCTL) & bits::DCTL_L2V, 0);
}

#[test]
fn test_transfer_timeout_is_recoverable() {
    let (bus, _mapper, drv) = setup();
    drv.request_dma_channel(0).unwrap();

    // No chip side: the transfer must time out after one second
    let param = DmaParam {
        count: 0x100,
        vme_addr: 0x0020_0000,
        ctl: 0,
        buf_index: 0,
    };
    assert!(matches!(
        drv.dma_transfer(DmaDirection::VmeToLocal, param),
        Err(BridgeError::HardwareFault(_))
    ));
    let stats = drv.stats();
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.dma_errors, 1);

    // The engine stopped the channel, a retry may start again
    assert_eq!(bus.read(offsets::DGCS) & bits::DGCS_ACT, 0);
    let hw = spawn_dma_hw(bus.clone(), drv.clone(), 0, bits::DGCS_DONE);
    drv.dma_transfer(DmaDirection::VmeToLocal, param).unwrap();
    hw.join().unwrap();
}

#[test]
fn test_blt_until_berr_accepts_partial_read() {
    let (bus, _mapper, drv) = setup();
    drv.request_dma_channel(0).unwrap();
    drv.set_blt_until_berr(true);

    // Chip moves half the data, then aborts with a VME bus error
    let hw = spawn_dma_hw(bus.clone(), drv.clone(), 0x80, bits::DGCS_VERR);
    let param = DmaParam {
        count: 0x100,
        vme_addr: 0x0020_0000,
        ctl: 0,
        buf_index: 0,
    };
    assert_eq!(drv.dma_transfer(DmaDirection::VmeToLocal, param), Ok(0));
    hw.join().unwrap();
}

#[test]
fn test_bus_error_fails_transfer_by_default() {
    let (bus, _mapper, drv) = setup();
    drv.request_dma_channel(0).unwrap();

    let hw = spawn_dma_hw(bus.clone(), drv.clone(), 0x80, bits::DGCS_VERR);
    let param = DmaParam {
        count: 0x100,
        vme_addr: 0x0020_0000,
        ctl: 0,
        buf_index: 0,
    };
    assert_eq!(
        drv.dma_transfer(DmaDirection::VmeToLocal, param),
        Err(BridgeError::HardwareFault("DMA transfer failed"))
    );
    hw.join().unwrap();
    assert_eq!(drv.stats().dma_errors, 1);
}

#[test]
fn test_chain_executes_all_packets() {
    let (bus, _mapper, drv) = setup();
    drv.request_dma_channel(0).unwrap();

    let list = drv.new_dma_chain().unwrap();
    drv.add_dma_packet(list, 0, 0x100, 0x0030_0000).unwrap();
    drv.add_dma_packet(list, 0, 0x80, 0x0030_0100).unwrap();
    drv.add_dma_packet(list, 0, 0x40, 0x0030_0180).unwrap();

    let hw = spawn_chain_hw(bus.clone(), drv.clone(), 3);
    drv.exec_dma_chain(list).unwrap();
    hw.join().unwrap();

    drv.free_dma_chain(list).unwrap();
}

#[test]
fn test_chain_reports_first_unprocessed_packet() {
    let (bus, _mapper, drv) = setup();
    drv.request_dma_channel(0).unwrap();

    let list = drv.new_dma_chain().unwrap();
    drv.add_dma_packet(list, 0, 0x100, 0x0030_0000).unwrap();
    drv.add_dma_packet(list, 0, 0x80, 0x0030_0100).unwrap();
    drv.add_dma_packet(list, 0, 0x40, 0x0030_0180).unwrap();

    // Chip gives up after the first packet
    let hw = spawn_chain_hw(bus.clone(), drv.clone(), 1);
    assert_eq!(
        drv.exec_dma_chain(list),
        Err(BridgeError::PartialFailure { segment: 2 })
    );
    hw.join().unwrap();
}

#[test]
fn test_chain_data_placement_is_contiguous() {
    let (_bus, _mapper, drv) = setup();
    drv.request_dma_channel(0).unwrap();

    let list = drv.new_dma_chain().unwrap();
    // Both VME addresses are 8-byte aligned, so no padding in between
    assert_eq!(drv.add_dma_packet(list, 0, 0x100, 0x0030_0000), Ok(0));
    assert_eq!(drv.add_dma_packet(list, 0, 0x80, 0x0040_0000), Ok(0));
    // Low bits 0b011 against a pool position with low bits 0b000
    assert_eq!(drv.add_dma_packet(list, 0, 0x40, 0x0050_0003), Ok(3));
}

#[test]
fn test_chain_rejects_pool_overflow() {
    let (_bus, _mapper, drv) = setup();
    drv.request_dma_channel(0).unwrap();

    let list = drv.new_dma_chain().unwrap();
    drv.add_dma_packet(list, 0, 0x2_0000, 0x0030_0000).unwrap();
    assert!(matches!(
        drv.add_dma_packet(list, 0, 8, 0x0040_0000),
        Err(BridgeError::ResourceExhausted(_))
    ));
}

#[test]
fn test_empty_or_stale_chain_rejected() {
    let (_bus, _mapper, drv) = setup();
    drv.request_dma_channel(0).unwrap();

    let list = drv.new_dma_chain().unwrap();
    assert!(drv.exec_dma_chain(list).is_err());

    drv.free_dma_chain(list).unwrap();
    assert!(drv.add_dma_packet(list, 0, 0x40, 0x0030_0000).is_err());
}
