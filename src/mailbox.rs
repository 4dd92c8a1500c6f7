//! 邮箱子系统
//!
//! 4 个独立邮箱槽。使能即占用（LINT_EN 中对应位的测试置位），
//! 等待时先短暂关闭该邮箱中断、把硬件寄存器清零再重新使能，
//! 保证读到的是等待期间写入的新值。

use std::sync::Arc;
use std::time::Duration;

use log::warn;
use parking_lot::Mutex;

use crate::error::{BridgeError, Result};
use crate::irq::EventHub;
use crate::regs::{bits, mbox, offsets};
use crate::bus::RegisterBus;
use crate::stats::DriverStats;
use crate::wait::WaitOutcome;

pub struct MailboxSet {
    bus: Arc<dyn RegisterBus>,
    hub: Arc<EventHub>,
    stats: Arc<DriverStats>,
    /// 使能/禁用串行化
    lock: Mutex<()>,
}

impl MailboxSet {
    pub fn new(bus: Arc<dyn RegisterBus>, hub: Arc<EventHub>, stats: Arc<DriverStats>) -> Self {
        Self {
            bus,
            hub,
            stats,
            lock: Mutex::new(()),
        }
    }

    /// 使能 n 号邮箱中断；已使能则失败
    pub fn enable(&self, n: usize) -> Result<()> {
        check_index(n)?;
        let bit = bits::LINT_MBOX0 << n;
        let _guard = self.lock.lock();
        let lint_en = self.bus.read(offsets::LINT_EN);
        if lint_en & bit != 0 {
            return Err(BridgeError::ResourceBusy("mailbox already in use"));
        }
        self.bus.write(offsets::LINT_EN, lint_en | bit);
        Ok(())
    }

    /// 禁用 n 号邮箱中断；未使能则失败
    pub fn disable(&self, n: usize) -> Result<()> {
        check_index(n)?;
        let bit = bits::LINT_MBOX0 << n;
        let _guard = self.lock.lock();
        let lint_en = self.bus.read(offsets::LINT_EN);
        if lint_en & bit == 0 {
            return Err(BridgeError::InvalidParameter("mailbox not enabled"));
        }
        self.bus.write(offsets::LINT_EN, lint_en & !bit);
        Ok(())
    }

    /// 等待 n 号邮箱被写入，返回写入的值
    ///
    /// 挂起前短暂关闭该邮箱中断，把寄存器清零后再使能，避免把
    /// 上一轮残留值当作新事件。整个序列在等待注册之后、持邮箱锁
    /// 执行：注册之后到来的中断不会丢失，对 LINT_EN 的改写也不会
    /// 与其他邮箱的使能/禁用交错。
    pub fn wait(&self, n: usize, timeout: Option<Duration>) -> Result<u32> {
        use std::sync::atomic::Ordering;

        check_index(n)?;
        let bit = bits::LINT_MBOX0 << n;

        let outcome = self.hub.mbx[n].wait_unless(timeout, || {
            let _guard = self.lock.lock();
            let lint_en = self.bus.read(offsets::LINT_EN);
            self.bus.write(offsets::LINT_EN, lint_en & !bit);
            self.bus.write(mbox(n), 0);
            self.bus.write(offsets::LINT_EN, lint_en);
            self.bus.read(offsets::LINT_EN); // flush

            // 中断已经挂起则不必睡眠
            if self.bus.read(offsets::LINT_STAT) & bit != 0 {
                warn!("previous mailbox interrupt detected");
                return false;
            }
            true
        })?;

        match outcome {
            WaitOutcome::Woken => Ok(self.bus.read(mbox(n))),
            WaitOutcome::TimedOut => {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(BridgeError::TimedOut)
            }
        }
    }

    pub fn enabled(&self, n: usize) -> bool {
        n < 4 && self.bus.read(offsets::LINT_EN) & (bits::LINT_MBOX0 << n) != 0
    }
}

fn check_index(n: usize) -> Result<()> {
    if n < 4 {
        Ok(())
    } else {
        Err(BridgeError::InvalidParameter("mailbox number out of range"))
    }
}
