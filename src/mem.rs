//! DMA 相干内存与物理窗口分配
//!
//! `CoherentBuffer` 模拟 dma_alloc_coherent 得到的缓冲区：主机侧
//! 可按字节访问，同时有一个对芯片可见的稳定总线地址。
//! `WindowAllocator` 模拟 pci_bus_alloc_resource：从一段 PCI 内存
//! 区域里按 64 KiB 对齐切出主映像窗口。

use parking_lot::Mutex;

use crate::bus::BusWindow;
use crate::error::{BridgeError, Result};

/// 主映像窗口的对齐要求
pub const WINDOW_ALIGN: u32 = 0x10000;

/// 一块 DMA 相干缓冲区
///
/// 克隆共享同一份存储；`window()` 给出 mmap 等价的访问视图。
#[derive(Clone)]
pub struct CoherentBuffer {
    window: BusWindow,
}

impl CoherentBuffer {
    pub fn new(bus_addr: u32, size: u32) -> Self {
        Self {
            window: BusWindow::new(bus_addr, size),
        }
    }

    /// 芯片可见的总线地址
    pub fn bus_addr(&self) -> u32 {
        self.window.base()
    }

    pub fn len(&self) -> u32 {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn window(&self) -> BusWindow {
        self.window.clone()
    }
}

/// 64 KiB 对齐的首次适应物理窗口分配器
#[derive(Debug)]
pub struct WindowAllocator {
    base: u32,
    /// 区域终点（不含），上限卡在 32 位地址空间内
    end: u64,
    /// 已分配区间 (start, end)，按 start 排序
    used: Mutex<Vec<(u32, u32)>>,
}

impl WindowAllocator {
    pub fn new(base: u32, size: u32) -> Self {
        Self {
            base,
            end: (base as u64 + size as u64).min(u32::MAX as u64),
            used: Mutex::new(Vec::new()),
        }
    }

    /// 分配 size 字节，返回窗口起始物理地址
    ///
    /// size 来自调用者，内部比较全部在 u64 里做。
    pub fn alloc(&self, size: u32) -> Result<u32> {
        if size == 0 {
            return Err(BridgeError::InvalidParameter("window size is zero"));
        }
        let size = size as u64;
        let mut used = self.used.lock();
        let mut candidate = align_up(self.base as u64, WINDOW_ALIGN as u64);
        for &(start, end) in used.iter() {
            if candidate + size <= start as u64 {
                break;
            }
            candidate = align_up(end as u64, WINDOW_ALIGN as u64);
        }
        if candidate + size > self.end {
            return Err(BridgeError::ResourceExhausted(
                "not enough iomem for requested image size",
            ));
        }
        let candidate = candidate as u32;
        let pos = used.partition_point(|&(s, _)| s < candidate);
        used.insert(pos, (candidate, candidate + size as u32));
        Ok(candidate)
    }

    /// 释放以 start 起始的窗口
    pub fn free(&self, start: u32) {
        let mut used = self.used.lock();
        used.retain(|&(s, _)| s != start);
    }

    pub fn allocated(&self) -> usize {
        self.used.lock().len()
    }
}

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_aligned_and_first_fit() {
        let alloc = WindowAllocator::new(0x8000_1234, 0x100_0000);
        let a = alloc.alloc(0x20000).unwrap();
        assert_eq!(a % WINDOW_ALIGN, 0);
        let b = alloc.alloc(0x20000).unwrap();
        assert!(b >= a + 0x20000);

        alloc.free(a);
        let c = alloc.alloc(0x10000).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn alloc_exhaustion() {
        let alloc = WindowAllocator::new(0x8000_0000, 0x2_0000);
        alloc.alloc(0x2_0000).unwrap();
        assert_eq!(
            alloc.alloc(0x1000),
            Err(BridgeError::ResourceExhausted(
                "not enough iomem for requested image size"
            ))
        );
    }
}
