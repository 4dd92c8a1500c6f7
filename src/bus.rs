//! 寄存器总线抽象
//!
//! `RegisterBus` 是其余所有组件的底座：对桥接芯片 4KB 寄存器空间的
//! 原始 32 位读写。真实硬件上它由 MMIO 实现；`MemBus` 提供一个
//! RAM 后端，用于测试和无硬件主机。
//!
//! `BusWindow` 表示一段已映射的窗口（主映像窗口、从映像缓冲区或
//! DMA 缓冲区），支持 1/2/4 字节访问。

use std::sync::Arc;

use parking_lot::Mutex;

use crate::regs::bits;

/// 桥接芯片寄存器的原始读写
pub trait RegisterBus: Send + Sync {
    /// 读取 offset 处的 32 位寄存器
    fn read(&self, offset: u32) -> u32;
    /// 写入 offset 处的 32 位寄存器
    fn write(&self, offset: u32, value: u32);
}

/// RAM 后端的寄存器总线
///
/// 复位值全零，PCI_ID 预置为 CA91C042 的标识，与真实芯片上电后
/// 驱动的探测检查一致。状态寄存器按芯片语义建模：
/// LINT_STAT、PCI_CSR 错误位、V_AMERR 日志位是写 1 清除；
/// DGCS 的 GO 置起 ACT，STOP_REQ 清除 ACT，状态位写 1 清除。
pub struct MemBus {
    regs: Mutex<Vec<u32>>,
}

impl MemBus {
    pub fn new() -> Self {
        let mut regs = vec![0u32; 0x1000 / 4];
        regs[0] = bits::PCI_ID_TUNDRA_CA91C042;
        Self { regs: Mutex::new(regs) }
    }

    /// 芯片侧置位：模拟硬件拉起状态位（挂起中断、错误标志、DMA 完成）
    pub fn hw_set(&self, offset: u32, mask: u32) {
        let mut regs = self.regs.lock();
        regs[(offset as usize & 0xFFF) / 4] |= mask;
    }

    /// 芯片侧清位
    pub fn hw_clear(&self, offset: u32, mask: u32) {
        let mut regs = self.regs.lock();
        regs[(offset as usize & 0xFFF) / 4] &= !mask;
    }

    /// 芯片侧直接写入，绕过写 1 清除语义
    pub fn hw_store(&self, offset: u32, value: u32) {
        let mut regs = self.regs.lock();
        regs[(offset as usize & 0xFFF) / 4] = value;
    }
}

impl Default for MemBus {
    fn default() -> Self {
        Self::new()
    }
}

/// DGCS 中由硬件维护、主机写 1 清除的状态位
const DGCS_W1C: u32 = 0x0000_6F00;

impl RegisterBus for MemBus {
    fn read(&self, offset: u32) -> u32 {
        let regs = self.regs.lock();
        regs[(offset as usize & 0xFFF) / 4]
    }

    fn write(&self, offset: u32, value: u32) {
        use crate::regs::offsets;

        let mut regs = self.regs.lock();
        let index = (offset as usize & 0xFFF) / 4;
        let old = regs[index];
        regs[index] = match offset & 0xFFF {
            o if o == offsets::LINT_STAT => old & !value,
            o if o == offsets::PCI_CSR => {
                (old & bits::PCI_CSR_ERROR_MASK & !value) | (value & !bits::PCI_CSR_ERROR_MASK)
            }
            o if o == offsets::V_AMERR => old & !(value & (bits::AMERR_VALID | bits::AMERR_MULTIPLE)),
            o if o == offsets::DGCS => {
                let mut new = (old & (bits::DGCS_ACT | DGCS_W1C) & !(value & DGCS_W1C))
                    | (value & !(bits::DGCS_ACT | DGCS_W1C | bits::DGCS_STOP_REQ));
                if value & bits::DGCS_GO != 0 {
                    new |= bits::DGCS_ACT;
                }
                if value & bits::DGCS_STOP_REQ != 0 {
                    new &= !bits::DGCS_ACT;
                }
                new
            }
            _ => value,
        };
    }
}

/// 一段已映射的、字节可寻址的窗口
///
/// 底层存储是共享的：同一物理区域的多个窗口（例如映像窗口与
/// 模拟硬件侧）看到同一份数据。
#[derive(Clone)]
pub struct BusWindow {
    base: u32,
    mem: Arc<Mutex<Vec<u8>>>,
}

impl BusWindow {
    pub fn new(base: u32, size: u32) -> Self {
        Self {
            base,
            mem: Arc::new(Mutex::new(vec![0u8; size as usize])),
        }
    }

    /// 窗口对应的总线（物理/PCI）基地址
    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn len(&self) -> u32 {
        self.mem.lock().len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read8(&self, offset: u32) -> u8 {
        self.mem.lock()[offset as usize]
    }

    pub fn read16(&self, offset: u32) -> u16 {
        let mem = self.mem.lock();
        let o = offset as usize;
        u16::from_le_bytes([mem[o], mem[o + 1]])
    }

    pub fn read32(&self, offset: u32) -> u32 {
        let mem = self.mem.lock();
        let o = offset as usize;
        u32::from_le_bytes([mem[o], mem[o + 1], mem[o + 2], mem[o + 3]])
    }

    pub fn write8(&self, offset: u32, value: u8) {
        self.mem.lock()[offset as usize] = value;
    }

    pub fn write16(&self, offset: u32, value: u16) {
        let mut mem = self.mem.lock();
        mem[offset as usize..offset as usize + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn write32(&self, offset: u32, value: u32) {
        let mut mem = self.mem.lock();
        mem[offset as usize..offset as usize + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// 把一段物理地址范围映射为可访问窗口
///
/// 真实驱动里对应 ioremap；映射可能失败，失败时上层必须回滚
/// 已取得的资源。
pub trait BusMapper: Send + Sync {
    fn map(&self, phys: u32, size: u32) -> Option<BusWindow>;
}

/// RAM 后端的映射器
///
/// 为每个映射请求分配共享存储，并缓存物理基址到存储的映射，
/// 同一基址的重复映射返回同一份数据。
pub struct MemMapper {
    regions: Mutex<Vec<BusWindow>>,
    fail_next: Mutex<bool>,
}

impl MemMapper {
    pub fn new() -> Self {
        Self {
            regions: Mutex::new(Vec::new()),
            fail_next: Mutex::new(false),
        }
    }

    /// 让下一次 map 失败，用于测试回滚路径
    pub fn fail_next_map(&self) {
        *self.fail_next.lock() = true;
    }
}

impl Default for MemMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl BusMapper for MemMapper {
    fn map(&self, phys: u32, size: u32) -> Option<BusWindow> {
        let mut fail = self.fail_next.lock();
        if *fail {
            *fail = false;
            return None;
        }
        drop(fail);

        let mut regions = self.regions.lock();
        if let Some(w) = regions.iter().find(|w| w.base() == phys && w.len() >= size) {
            return Some(w.clone());
        }
        let window = BusWindow::new(phys, size);
        regions.push(window.clone());
        Some(window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::offsets;

    #[test]
    fn mem_bus_reset_values() {
        let bus = MemBus::new();
        assert_eq!(bus.read(offsets::PCI_ID), bits::PCI_ID_TUNDRA_CA91C042);
        assert_eq!(bus.read(offsets::DGCS), 0);
    }

    #[test]
    fn status_registers_are_write_one_to_clear() {
        let bus = MemBus::new();
        bus.hw_set(offsets::LINT_STAT, 0x0102);
        bus.write(offsets::LINT_STAT, 0x0100);
        assert_eq!(bus.read(offsets::LINT_STAT), 0x0002);

        bus.hw_set(offsets::PCI_CSR, bits::PCI_CSR_S_TA);
        bus.write(offsets::PCI_CSR, bits::PCI_CSR_S_TA);
        assert_eq!(bus.read(offsets::PCI_CSR) & bits::PCI_CSR_S_TA, 0);
    }

    #[test]
    fn dgcs_go_and_stop_manage_act() {
        let bus = MemBus::new();
        bus.write(offsets::DGCS, bits::DGCS_START);
        assert_ne!(bus.read(offsets::DGCS) & bits::DGCS_ACT, 0);
        bus.write(offsets::DGCS, bits::DGCS_STOP_REQ);
        assert_eq!(bus.read(offsets::DGCS) & bits::DGCS_ACT, 0);
    }

    #[test]
    fn window_width_access() {
        let w = BusWindow::new(0x8000_0000, 64);
        w.write32(0, 0xAABB_CCDD);
        assert_eq!(w.read8(0), 0xDD);
        assert_eq!(w.read16(2), 0xAABB);
        assert_eq!(w.read32(0), 0xAABB_CCDD);
    }

    #[test]
    fn mapper_shares_backing_store() {
        let mapper = MemMapper::new();
        let a = mapper.map(0x9000_0000, 128).unwrap();
        let b = mapper.map(0x9000_0000, 128).unwrap();
        a.write8(5, 0x42);
        assert_eq!(b.read8(5), 0x42);
    }

    #[test]
    fn mapper_injected_failure() {
        let mapper = MemMapper::new();
        mapper.fail_next_map();
        assert!(mapper.map(0x9000_0000, 128).is_none());
        assert!(mapper.map(0x9000_0000, 128).is_some());
    }
}
