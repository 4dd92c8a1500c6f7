//! VME 总线错误环形日志
//!
//! 固定 32 个槽位，按总线错误计数取模循环覆盖，保留最近的
//! 32 条记录供诊断读取。

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub const BERR_RING_SIZE: usize = 32;

/// 一条总线错误记录
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusErrorEntry {
    pub valid: bool,
    /// 出错的 VME 地址
    pub address: u32,
    /// 地址修饰码
    pub am: u8,
    /// 日志覆盖前发生了多个错误
    pub merr: bool,
}

/// 32 槽环形缓冲
#[derive(Debug, Default)]
pub struct BusErrorRing {
    entries: Mutex<[BusErrorEntry; BERR_RING_SIZE]>,
}

impl BusErrorRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一条错误。`counter` 是记录时的总线错误计数（递增前），
    /// 槽位取其模 32。
    pub fn record(&self, counter: u64, address: u32, am: u8, merr: bool) {
        let mut entries = self.entries.lock();
        entries[(counter as usize) % BERR_RING_SIZE] = BusErrorEntry {
            valid: true,
            address,
            am,
            merr,
        };
    }

    /// 按时间顺序（最老到最新）返回最近的有效记录。
    /// `counter` 是当前的总线错误计数。
    pub fn recent(&self, counter: u64) -> Vec<BusErrorEntry> {
        let entries = self.entries.lock();
        let mut out = Vec::new();
        for i in 0..BERR_RING_SIZE {
            let index = (counter as usize + i) % BERR_RING_SIZE;
            if entries[index].valid {
                out.push(entries[index]);
            }
        }
        out
    }

    /// 直接读取某个槽位
    pub fn slot(&self, index: usize) -> BusErrorEntry {
        self.entries.lock()[index % BERR_RING_SIZE]
    }

    pub fn clear(&self) {
        *self.entries.lock() = [BusErrorEntry::default(); BERR_RING_SIZE];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_at_32_entries() {
        let ring = BusErrorRing::new();
        for n in 0..40u64 {
            ring.record(n, 0x1000 + n as u32, 0x0D, false);
        }
        // 第 39 号记录落在槽 39 % 32 = 7
        assert_eq!(ring.slot(7).address, 0x1000 + 39);
        // 第 8..39 号是仍可见的 32 条
        let recent = ring.recent(40);
        assert_eq!(recent.len(), 32);
        assert_eq!(recent.first().unwrap().address, 0x1000 + 8);
        assert_eq!(recent.last().unwrap().address, 0x1000 + 39);
    }
}
