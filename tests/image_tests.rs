// Image allocation state machine: acquire/configure/release, overlap
// policy, slave buffers and bus error detection on image access.

mod common;

use common::{configure_master, configure_slave, pos, setup, setup_with};
use vme_bridge::regs::{self, bits};
use vme_bridge::{
    BridgeConfig, BridgeError, ImageKind, ImageRequest, ImageState, RegisterBus,
};

#[test]
fn test_acquire_all_master_images() {
    let (_bus, _mapper, drv) = setup();

    for expected in 0..8 {
        assert_eq!(drv.acquire_image(ImageKind::Master).unwrap(), expected);
    }
    assert_eq!(
        drv.acquire_image(ImageKind::Master),
        Err(BridgeError::ResourceExhausted("no free image slot"))
    );

    // A released slot becomes available again
    drv.release_image(3);
    assert_eq!(drv.acquire_image(ImageKind::Master).unwrap(), 3);
}

#[test]
fn test_acquire_slave_images_use_high_minors() {
    let (_bus, _mapper, drv) = setup();

    assert_eq!(drv.acquire_image(ImageKind::Slave).unwrap(), 10);
    assert_eq!(drv.acquire_image(ImageKind::Slave).unwrap(), 11);
}

#[test]
fn test_configure_translates_vme_range() {
    let (bus, _mapper, drv) = setup();

    let minor = configure_master(&drv, 0x0010_0000, 0x1_0000);
    assert_eq!(drv.image_state(minor), ImageState::Configured);

    // BS + TO and BD + TO must give back the requested VME range
    let bs = bus.read(regs::image_bs(minor));
    let bd = bus.read(regs::image_bd(minor));
    let to = bus.read(regs::image_to(minor));
    assert_eq!(bs.wrapping_add(to), 0x0010_0000);
    assert_eq!(bd.wrapping_add(to), 0x0011_0000);

    drv.image_window(minor).unwrap();
}

#[test]
fn test_configure_requires_reserved_state() {
    let (_bus, _mapper, drv) = setup();

    let req = ImageRequest {
        base: 0x0010_0000,
        size: 0x1_0000,
        kind: ImageKind::Master,
    };
    // Slot 0 was never acquired
    assert!(drv.configure_image(0, req).is_err());

    let minor = drv.acquire_image(ImageKind::Master).unwrap();
    drv.configure_image(minor, req).unwrap();
    // Configuring twice is a conflict
    assert!(drv.configure_image(minor, req).is_err());
}

#[test]
fn test_overlapping_images_rejected() {
    let config = BridgeConfig {
        img_ovl: false,
        ..BridgeConfig::default()
    };
    let (_bus, _mapper, drv) = setup_with(config);

    configure_master(&drv, 0x0010_0000, 0x1_0000);

    let second = drv.acquire_image(ImageKind::Master).unwrap();
    let overlapping = ImageRequest {
        base: 0x0010_8000,
        size: 0x1_0000,
        kind: ImageKind::Master,
    };
    assert_eq!(
        drv.configure_image(second, overlapping),
        Err(BridgeError::Conflict("image overlaps existing image"))
    );
    // Failed configure leaves the slot reserved and usable
    assert_eq!(drv.image_state(second), ImageState::Reserved);

    let disjoint = ImageRequest {
        base: 0x0011_0000,
        size: 0x1_0000,
        kind: ImageKind::Master,
    };
    drv.configure_image(second, disjoint).unwrap();
}

#[test]
fn test_overlapping_images_allowed_by_default() {
    let (_bus, _mapper, drv) = setup();

    configure_master(&drv, 0x0010_0000, 0x1_0000);
    let second = drv.acquire_image(ImageKind::Master).unwrap();
    let overlapping = ImageRequest {
        base: 0x0010_8000,
        size: 0x1_0000,
        kind: ImageKind::Master,
    };
    drv.configure_image(second, overlapping).unwrap();
}

#[test]
fn test_slave_image_read_write_roundtrip() {
    let (_bus, _mapper, drv) = setup();

    let minor = configure_slave(&drv, 0x0100_0000, 0x2_0000);
    assert_eq!(drv.image_state(minor), ImageState::Configured);

    let data = [0x11u8, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
    assert_eq!(drv.write_image(minor, pos(4, 0x100), &data).unwrap(), 8);

    let mut back = [0u8; 8];
    assert_eq!(drv.read_image(minor, pos(4, 0x100), &mut back).unwrap(), 8);
    assert_eq!(back, data);

    // The VME side sees the same bytes through the shared buffer
    let window = drv.image_window(minor).unwrap();
    assert_eq!(window.read32(0x100), 0x4433_2211);
}

#[test]
fn test_read_rejects_bad_width_and_span() {
    let (_bus, _mapper, drv) = setup();
    let minor = configure_master(&drv, 0x0010_0000, 0x1_0000);

    let mut buf = [0u8; 4];
    assert!(drv.read_image(minor, pos(3, 0), &mut buf).is_err());
    assert!(drv.read_image(minor, pos(4, 0xFFFE), &mut buf).is_err());

    // Buffer length must be a multiple of the access width
    let mut odd = [0u8; 6];
    assert!(drv.read_image(minor, pos(4, 0), &mut odd).is_err());
    assert!(drv.write_image(minor, pos(4, 0), &odd).is_err());
}

#[test]
fn test_range_past_end_of_address_space_rejected() {
    let (_bus, _mapper, drv) = setup();

    let minor = drv.acquire_image(ImageKind::Slave).unwrap();
    let req = ImageRequest {
        base: 0xFFFF_0000,
        size: 0x2_0000,
        kind: ImageKind::Slave,
    };
    assert_eq!(
        drv.configure_image(minor, req),
        Err(BridgeError::InvalidParameter("image range exceeds address space"))
    );
    assert_eq!(drv.image_state(minor), ImageState::Reserved);

    let minor = drv.acquire_image(ImageKind::Master).unwrap();
    let req = ImageRequest {
        base: 0xFFFF_8000,
        size: 0x1_0000,
        kind: ImageKind::Master,
    };
    assert!(drv.configure_image(minor, req).is_err());
    assert_eq!(drv.image_state(minor), ImageState::Reserved);
}

#[test]
fn test_overlap_scan_with_top_of_space_request() {
    let config = BridgeConfig {
        img_ovl: false,
        ..BridgeConfig::default()
    };
    let (_bus, _mapper, drv) = setup_with(config);

    configure_master(&drv, 0x0010_0000, 0x1_0000);
    let second = drv.acquire_image(ImageKind::Master).unwrap();
    let req = ImageRequest {
        base: 0xFFFF_F000,
        size: 0x2000,
        kind: ImageKind::Master,
    };
    assert_eq!(
        drv.configure_image(second, req),
        Err(BridgeError::InvalidParameter("image range exceeds address space"))
    );
}

#[test]
fn test_mapping_failure_rolls_back_to_reserved() {
    let (_bus, mapper, drv) = setup();

    let minor = drv.acquire_image(ImageKind::Master).unwrap();
    let req = ImageRequest {
        base: 0x0010_0000,
        size: 0x1_0000,
        kind: ImageKind::Master,
    };

    mapper.fail_next_map();
    assert_eq!(
        drv.configure_image(minor, req),
        Err(BridgeError::HardwareFault("window mapping failed"))
    );
    assert_eq!(drv.image_state(minor), ImageState::Reserved);

    // Retry succeeds once mapping works again
    drv.configure_image(minor, req).unwrap();
    assert_eq!(drv.image_state(minor), ImageState::Configured);
}

#[test]
fn test_release_resets_image() {
    let (_bus, _mapper, drv) = setup();

    let minor = configure_master(&drv, 0x0010_0000, 0x1_0000);
    drv.release_image(minor);
    assert_eq!(drv.image_state(minor), ImageState::Free);
    assert!(drv.image_window(minor).is_err());
}

#[test]
fn test_set_opt_sets_and_clears_ctl_bits() {
    let (bus, _mapper, drv) = setup();

    drv.set_ctl(0, bits::IMAGE_CTL_RESET).unwrap();
    drv.set_opt(0, 0x0040_0000).unwrap();
    assert_eq!(bus.read(regs::image_ctl(0)), 0x00C0_0000);

    drv.set_opt(0, bits::OPT_CLEAR | 0x0040_0000).unwrap();
    assert_eq!(bus.read(regs::image_ctl(0)), bits::IMAGE_CTL_RESET);
}

#[test]
fn test_berr_flag_is_cleared_once() {
    let (bus, _mapper, drv) = setup();

    bus.hw_set(regs::offsets::PCI_CSR, bits::PCI_CSR_S_TA);
    assert!(drv.test_and_clear_berr());
    assert!(!drv.test_and_clear_berr());
    // Control bits survive the write-one-to-clear acknowledge
    assert_ne!(
        bus.read(regs::offsets::PCI_CSR) & bits::PCI_CSR_MASTER_EN,
        0
    );
}

#[test]
fn test_probe_address_responding_device() {
    let (_bus, _mapper, drv) = setup();

    configure_master(&drv, 0x0010_0000, 0x1_0000);
    assert_eq!(drv.probe_address(0x0010_0100), Ok(true));
    // No image covers this address
    assert!(drv.probe_address(0x0090_0000).is_err());
}
