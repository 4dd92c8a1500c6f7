// Shared setup for integration tests: a driver instance backed by the
// RAM register bus, plus handles to poke the "chip side" of it.

#![allow(dead_code)]

use std::sync::Arc;

use vme_bridge::{
    BridgeConfig, ImageKind, ImageRequest, MemBus, MemMapper, MemoryLayout, UniverseII,
};

pub fn setup() -> (Arc<MemBus>, Arc<MemMapper>, Arc<UniverseII>) {
    setup_with(BridgeConfig::default())
}

pub fn setup_with(config: BridgeConfig) -> (Arc<MemBus>, Arc<MemMapper>, Arc<UniverseII>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let bus = Arc::new(MemBus::new());
    let mapper = Arc::new(MemMapper::new());
    let drv = UniverseII::new(bus.clone(), mapper.clone(), config, MemoryLayout::default())
        .expect("bridge probe failed");
    (bus, mapper, Arc::new(drv))
}

/// Acquire and configure a master image covering [base, base + size).
pub fn configure_master(drv: &UniverseII, base: u32, size: u32) -> usize {
    let minor = drv.acquire_image(ImageKind::Master).unwrap();
    drv.configure_image(
        minor,
        ImageRequest {
            base,
            size,
            kind: ImageKind::Master,
        },
    )
    .unwrap();
    minor
}

/// Acquire and configure a slave image covering [base, base + size).
pub fn configure_slave(drv: &UniverseII, base: u32, size: u32) -> usize {
    let minor = drv.acquire_image(ImageKind::Slave).unwrap();
    drv.configure_image(
        minor,
        ImageRequest {
            base,
            size,
            kind: ImageKind::Slave,
        },
    )
    .unwrap();
    minor
}

/// Encode a read/write position: access width in the top nibble,
/// window offset in the low 28 bits.
pub fn pos(dw: u64, offset: u64) -> u64 {
    (dw << 28) | offset
}
