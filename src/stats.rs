//! 驱动统计计数
//!
//! 计数器在中断上下文里也会递增，因此全部使用原子量，
//! 不需要持锁。

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// 进程级统计，只在显式复位或驱动加载时清零
#[derive(Debug, Default)]
pub struct DriverStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub ioctls: AtomicU64,
    pub irqs: AtomicU64,
    pub berrs: AtomicU64,
    pub dma_errors: AtomicU64,
    pub timeouts: AtomicU64,
}

/// 某一时刻的统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub ioctls: u64,
    pub irqs: u64,
    pub berrs: u64,
    pub dma_errors: u64,
    pub timeouts: u64,
}

impl DriverStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            ioctls: self.ioctls.load(Ordering::Relaxed),
            irqs: self.irqs.load(Ordering::Relaxed),
            berrs: self.berrs.load(Ordering::Relaxed),
            dma_errors: self.dma_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.reads.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
        self.ioctls.store(0, Ordering::Relaxed);
        self.irqs.store(0, Ordering::Relaxed);
        self.berrs.store(0, Ordering::Relaxed);
        self.dma_errors.store(0, Ordering::Relaxed);
        self.timeouts.store(0, Ordering::Relaxed);
    }

    /// 递增总线错误计数并返回递增前的值（环形日志用它定位槽位）
    pub fn next_berr(&self) -> u64 {
        self.berrs.fetch_add(1, Ordering::Relaxed)
    }
}
