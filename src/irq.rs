//! 中断与事件分发
//!
//! 桥接芯片的所有事件走同一条共享中断线。`InterruptRouter::handle_interrupt`
//! 在中断上下文运行：不阻塞、不分配，读出使能且挂起的位，逐类分发，
//! 最后写回 LINT_STAT 确认。等待方通过 `EventHub` 里的槽位挂起。
//!
//! VME 中断分发带优先级偏置：同一次调用里多级挂起时只处理最高级。

use std::sync::Arc;
use std::time::Duration;

use log::warn;

use parking_lot::Mutex;

use crate::berr::BusErrorRing;
use crate::bus::{BusWindow, RegisterBus};
use crate::error::{BridgeError, Result};
use crate::regs::{bits, offsets, virq_statid};
use crate::stats::DriverStats;
use crate::wait::{WaitOutcome, WaitSlot};

/// VME 中断级数
pub const VIRQ_LEVELS: usize = 7;
/// 每级的 Status/ID 取值数
pub const STATUS_IDS: usize = 256;

/// 一次窗口内的寄存器写动作（挂接在等待前/唤醒后执行）
#[derive(Clone)]
pub struct WindowWrite {
    pub window: BusWindow,
    pub offset: u32,
    pub value: u32,
}

impl WindowWrite {
    fn perform(&self) {
        self.window.write32(self.offset, self.value);
    }
}

/// (级别, Status/ID) 槽的注册状态
#[derive(Default)]
struct IrqSlotInfo {
    /// 0 = 空闲，否则为占有者次设备号 + 1
    owner: u8,
    /// 等待开始时执行的写（启动外设）
    entry: Option<WindowWrite>,
    /// 确认周期后、唤醒前执行的写（清除外设中断源）
    exit: Option<WindowWrite>,
}

struct IrqSlot {
    info: Mutex<IrqSlotInfo>,
    wait: WaitSlot,
}

impl Default for IrqSlot {
    fn default() -> Self {
        Self {
            info: Mutex::new(IrqSlotInfo::default()),
            wait: WaitSlot::new(),
        }
    }
}

/// 全部等待槽的集合，中断处理函数与各子系统共享
pub struct EventHub {
    /// DMA 完成
    pub dma: WaitSlot,
    /// 软件中断确认完成
    pub iack: WaitSlot,
    /// 4 个邮箱
    pub mbx: [WaitSlot; 4],
    /// 7×256 的 (级别, Status/ID) 矩阵
    irq: Vec<IrqSlot>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            dma: WaitSlot::new(),
            iack: WaitSlot::new(),
            mbx: Default::default(),
            irq: (0..VIRQ_LEVELS * STATUS_IDS).map(|_| IrqSlot::default()).collect(),
        }
    }

    fn slot(&self, level: u8, statid: u8) -> &IrqSlot {
        &self.irq[(level as usize - 1) * STATUS_IDS + statid as usize]
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

/// 中断路由器：分发共享中断线并管理 IRQ 槽注册
pub struct InterruptRouter {
    bus: Arc<dyn RegisterBus>,
    hub: Arc<EventHub>,
    stats: Arc<DriverStats>,
    ring: Arc<BusErrorRing>,
    /// arm/disarm 串行化，防止两个调用者抢占同一槽
    arm_lock: Mutex<()>,
}

impl InterruptRouter {
    pub fn new(
        bus: Arc<dyn RegisterBus>,
        hub: Arc<EventHub>,
        stats: Arc<DriverStats>,
        ring: Arc<BusErrorRing>,
    ) -> Self {
        Self {
            bus,
            hub,
            stats,
            ring,
            arm_lock: Mutex::new(()),
        }
    }

    /// 共享中断线处理函数。返回 false 表示本设备没有挂起事件
    /// （中断来自共享线上的其他设备）。
    pub fn handle_interrupt(&self) -> bool {
        use std::sync::atomic::Ordering;

        let enable = self.bus.read(offsets::LINT_EN);
        let status = self.bus.read(offsets::LINT_STAT) & enable;
        if status == 0 {
            return false;
        }

        self.stats.irqs.fetch_add(1, Ordering::Relaxed);

        if status & bits::LINT_VIRQ_MASK != 0 {
            // 高级别优先，单次只取最高级
            for level in (1..=7u8).rev() {
                if status & (1 << level) == 0 {
                    continue;
                }
                let stat_vme = self.bus.read(virq_statid(level));
                if stat_vme & bits::STATID_BERR != 0 {
                    warn!(
                        "VMEbus error during IACK cycle level {}, Stat/ID {}",
                        level,
                        stat_vme & 0xFF
                    );
                } else {
                    let slot = self.hub.slot(level, (stat_vme & 0xFF) as u8);
                    let info = slot.info.lock();
                    if info.owner != 0 {
                        if let Some(exit) = &info.exit {
                            exit.perform();
                        }
                        slot.wait.notify();
                    }
                }
                break;
            }
        }

        if status & bits::LINT_DMA != 0 {
            self.hub.dma.notify();
        }

        if status & bits::LINT_MBOX_MASK != 0 {
            for n in 0..4 {
                if status & (bits::LINT_MBOX0 << n) != 0 {
                    self.hub.mbx[n].notify();
                }
            }
        }

        if status & bits::LINT_SW_IACK != 0 {
            self.hub.iack.notify();
        }

        if status & bits::LINT_VERR != 0 {
            let amerr = self.bus.read(offsets::V_AMERR);
            if amerr & bits::AMERR_VALID != 0 {
                let merr = amerr & bits::AMERR_MULTIPLE != 0;
                if merr {
                    warn!("multiple VMEbus errors detected, lost interrupt?");
                }
                let address = self.bus.read(offsets::VAERR);
                let am = ((amerr >> 26) & 0x3F) as u8;
                let counter = self.stats.next_berr();
                self.ring.record(counter, address, am, merr);
                self.bus.write(offsets::V_AMERR, bits::AMERR_VALID);
            } else {
                warn!("VMEbus error but error log invalid");
            }
        }

        // 未识别的挂起位不做分发，仅随写回一起确认
        self.bus.write(offsets::LINT_STAT, status);
        true
    }

    /// 注册 (级别, Status/ID) 等待槽
    ///
    /// `owner_minor` 是占有映像的次设备号；该映像释放时槽被强制清除。
    pub fn arm(
        &self,
        owner_minor: usize,
        level: u8,
        statid: u8,
        entry: Option<WindowWrite>,
        exit: Option<WindowWrite>,
    ) -> Result<()> {
        check_level(level)?;
        let _guard = self.arm_lock.lock();
        let slot = self.hub.slot(level, statid);
        let mut info = slot.info.lock();
        if info.owner != 0 {
            return Err(BridgeError::Conflict("irq/status combination already in use"));
        }
        info.owner = owner_minor as u8 + 1;
        info.entry = entry;
        info.exit = exit;
        Ok(())
    }

    /// 注销等待槽
    pub fn disarm(&self, level: u8, statid: u8) -> Result<()> {
        check_level(level)?;
        let _guard = self.arm_lock.lock();
        let mut info = self.hub.slot(level, statid).info.lock();
        if info.owner == 0 {
            return Err(BridgeError::InvalidParameter("irq/status combination not found"));
        }
        *info = IrqSlotInfo::default();
        Ok(())
    }

    /// 清除某个次设备号占有的全部槽（映像释放路径）
    pub fn disarm_owner(&self, minor: usize) {
        let _guard = self.arm_lock.lock();
        for slot in &self.hub.irq {
            let mut info = slot.info.lock();
            if info.owner == minor as u8 + 1 {
                *info = IrqSlotInfo::default();
            }
        }
    }

    pub fn armed(&self, level: u8, statid: u8) -> bool {
        check_level(level).is_ok() && self.hub.slot(level, statid).info.lock().owner != 0
    }

    /// 阻塞等待已注册槽的中断。`timeout` 为 None 表示无限等待。
    pub fn wait_irq(&self, level: u8, statid: u8, timeout: Option<Duration>) -> Result<()> {
        use std::sync::atomic::Ordering;

        check_level(level)?;
        let slot = self.hub.slot(level, statid);
        let entry = {
            let info = slot.info.lock();
            if info.owner == 0 {
                return Err(BridgeError::InvalidParameter("irq/status combination not found"));
            }
            info.entry.clone()
        };

        let outcome = slot.wait.wait_with(timeout, || {
            if let Some(entry) = entry {
                entry.perform();
            }
        })?;

        match outcome {
            WaitOutcome::Woken => Ok(()),
            WaitOutcome::TimedOut => {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(BridgeError::TimedOut)
            }
        }
    }
}

fn check_level(level: u8) -> Result<()> {
    if (1..=7).contains(&level) {
        Ok(())
    } else {
        Err(BridgeError::InvalidParameter("irq level out of range"))
    }
}
