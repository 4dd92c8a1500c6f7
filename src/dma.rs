//! DMA 引擎
//!
//! 桥接芯片只有一条 DMA 通道，同一时刻只允许一个占有者。单次传输
//! 把控制/计数/地址寄存器编程好后启动并阻塞等待完成中断，超时上限
//! 固定 1 秒。链式传输把每段描述成一个硬件命令包（32 字节，布局与
//! 0x200 寄存器组一致），硬件沿 DCPP 链表逐包执行。
//!
//! 硬件约束：VME 地址与本地地址的低 3 位必须一致，不一致时通过
//! 字节偏移补齐，偏移值返回给调用者用于核对实际传输范围。

use std::sync::Arc;
use std::time::Duration;

use log::warn;
use parking_lot::Mutex;

use crate::bus::{BusWindow, RegisterBus};
use crate::error::{BridgeError, Result};
use crate::irq::EventHub;
use crate::mem::CoherentBuffer;
use crate::regs::{bits, offsets, PCI_BUF_SIZE};
use crate::stats::DriverStats;
use crate::wait::WaitOutcome;

/// DMA 允许的最长活动时间
pub const DMA_ACTIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// 命令包链表槽数
pub const MAX_CHAIN: usize = 256;

/// 命令包大小（硬件布局）
const PACKET_SIZE: u32 = 32;
/// 命令包内的字偏移，与 0x200 寄存器组一致
const PKT_DCTL: u32 = 0x00;
const PKT_DTBC: u32 = 0x04;
const PKT_DLA: u32 = 0x08;
const PKT_DVA: u32 = 0x10;
const PKT_DCPP: u32 = 0x18;

/// 传输方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// VME → 本地缓冲区（读）
    VmeToLocal,
    /// 本地缓冲区 → VME（写）
    LocalToVme,
}

/// 单次传输请求
#[derive(Debug, Clone, Copy)]
pub struct DmaParam {
    /// 传输字节数
    pub count: u32,
    /// VME 起始地址
    pub vme_addr: u32,
    /// DCTL 控制位（地址空间、数据宽度、传输模式）
    pub ctl: u32,
    /// 目标缓冲区块号（requestChannel 划分出的块）
    pub buf_index: u32,
}

#[derive(Default)]
struct ChannelState {
    in_use: bool,
    /// 每块缓冲区大小，0 表示整个池作为一块
    buf_size: u32,
    /// BLT 读到总线错误视为正常结束（显式开启的宽松模式）
    blt_berr: bool,
}

struct Packet {
    /// 命令包在包区内的字节偏移
    node_off: u32,
    /// 数据段的 PCI 起始地址
    pci_start: u32,
    dtbc: u32,
}

#[derive(Default)]
struct ChainSlot {
    in_use: bool,
    packets: Vec<Packet>,
}

pub struct DmaEngine {
    bus: Arc<dyn RegisterBus>,
    hub: Arc<EventHub>,
    stats: Arc<DriverStats>,
    /// 全局 128 KiB DMA 数据池
    pool: CoherentBuffer,
    /// 命令包存放区（芯片沿 DCPP 链访问）
    packet_mem: CoherentBuffer,
    packet_used: Mutex<Vec<bool>>,
    state: Mutex<ChannelState>,
    chains: Mutex<Vec<ChainSlot>>,
}

impl DmaEngine {
    pub fn new(
        bus: Arc<dyn RegisterBus>,
        hub: Arc<EventHub>,
        stats: Arc<DriverStats>,
        pool: CoherentBuffer,
        packet_mem: CoherentBuffer,
    ) -> Self {
        let packets = (packet_mem.len() / PACKET_SIZE) as usize;
        Self {
            bus,
            hub,
            stats,
            pool,
            packet_mem,
            packet_used: Mutex::new(vec![false; packets]),
            state: Mutex::new(ChannelState::default()),
            chains: Mutex::new((0..MAX_CHAIN).map(|_| ChainSlot::default()).collect()),
        }
    }

    /// 占用 DMA 通道，把数据池划分为 `segments` 块（0 = 整池一块）
    pub fn request_channel(&self, segments: u32) -> Result<()> {
        let mut state = self.state.lock();
        if state.in_use {
            return Err(BridgeError::ResourceBusy("DMA channel already in use"));
        }
        state.buf_size = if segments == 0 { 0 } else { PCI_BUF_SIZE / segments };
        state.in_use = true;
        Ok(())
    }

    /// 释放通道；宽松 BLT 模式一并关闭
    pub fn release_channel(&self) {
        let mut state = self.state.lock();
        state.in_use = false;
        state.blt_berr = false;
    }

    pub fn channel_in_use(&self) -> bool {
        self.state.lock().in_use
    }

    /// 开关 "BLT 读到 BERR 为止" 模式。该模式下，读方向传输以
    /// VME 总线错误收尾且已搬运过数据时按成功处理。有意的有损
    /// 放宽，默认关闭。
    pub fn set_blt_until_berr(&self, on: bool) {
        self.state.lock().blt_berr = on;
    }

    /// 数据池的 mmap 等价窗口
    pub fn pool_window(&self) -> BusWindow {
        self.pool.window()
    }

    /// 命令包区窗口（芯片侧视图）
    pub fn packet_window(&self) -> BusWindow {
        self.packet_mem.window()
    }

    /// 单次传输。成功返回补齐对齐用的字节偏移（0..=7）。
    pub fn transfer(&self, direction: DmaDirection, param: DmaParam) -> Result<u32> {
        let (buf_size, blt_berr) = {
            let state = self.state.lock();
            (state.buf_size, state.blt_berr)
        };

        // 块号与计数都来自调用者，先用宽整型校验再落回 u32
        let span = buf_size as u64 * param.buf_index as u64 + param.count as u64;
        if span > PCI_BUF_SIZE as u64 {
            return Err(BridgeError::InvalidParameter("DMA operation exceeds DMA buffer size"));
        }

        let pci = self.pool.bus_addr() + buf_size * param.buf_index;

        if self.bus.read(offsets::DGCS) & bits::DGCS_ACT != 0 {
            return Err(BridgeError::ResourceBusy("DMA device is not idle"));
        }

        let dctl = match direction {
            DmaDirection::VmeToLocal => param.ctl,
            DmaDirection::LocalToVme => param.ctl | bits::DCTL_L2V,
        };
        self.bus.write(offsets::DCTL, dctl);
        self.bus.write(offsets::DTBC, param.count);
        self.bus.write(offsets::DVA, param.vme_addr);

        // VME 与 PCI 地址低 3 位必须一致
        let offset = align_offset(param.vme_addr, pci);
        self.bus.write(offsets::DLA, pci + offset);

        self.exec(0);

        let errors = self.test_and_clear_errors();
        if errors != 0 {
            if blt_berr
                && direction == DmaDirection::VmeToLocal
                && errors & bits::DGCS_ERROR_MASK == bits::DGCS_VERR
                && param.count > self.bus.read(offsets::DTBC)
            {
                // BERR 前已搬运过数据，按正常块结束处理
                return Ok(offset);
            }
            return Err(BridgeError::HardwareFault("DMA transfer failed"));
        }
        Ok(offset)
    }

    /// 申请一个空闲命令包链表，返回链表号
    pub fn new_chain(&self) -> Result<usize> {
        let mut chains = self.chains.lock();
        for (id, slot) in chains.iter_mut().enumerate() {
            if !slot.in_use {
                slot.in_use = true;
                return Ok(id);
            }
        }
        Err(BridgeError::ResourceExhausted("no free command packet list"))
    }

    /// 向链表尾部追加一段。数据段在池内紧跟上一段放置，并按低 3 位
    /// 规则补齐；返回补齐偏移。
    pub fn add_packet(&self, list: usize, dctl: u32, dtbc: u32, dva: u32) -> Result<u32> {
        let mut chains = self.chains.lock();
        let slot = chains
            .get_mut(list)
            .filter(|s| s.in_use)
            .ok_or(BridgeError::InvalidParameter("command packet list not allocated"))?;

        let dla_base = match slot.packets.last() {
            None => self.pool.bus_addr(),
            Some(prev) => prev.pci_start + prev.dtbc,
        };
        let offset = align_offset(dva, dla_base);

        // dtbc 来自调用者，比较在 u64 里做
        if dla_base as u64 + offset as u64 + dtbc as u64
            > self.pool.bus_addr() as u64 + PCI_BUF_SIZE as u64
        {
            warn!("DMA linked list packet exceeds global DMA buffer size");
            return Err(BridgeError::ResourceExhausted("packet exceeds global DMA buffer"));
        }

        let node_off = self.alloc_packet()?;
        let node_addr = self.packet_mem.bus_addr() + node_off;
        if node_addr & bits::DCPP_ALIGN_MASK != 0 {
            self.free_packet(node_off);
            return Err(BridgeError::HardwareFault("command packet not 32-byte aligned"));
        }

        let mem = self.packet_mem.window();
        mem.write32(node_off + PKT_DCTL, dctl);
        mem.write32(node_off + PKT_DTBC, dtbc);
        mem.write32(node_off + PKT_DLA, dla_base + offset);
        mem.write32(node_off + PKT_DVA, dva);
        mem.write32(node_off + PKT_DCPP, bits::DCPP_NULL);

        // 上一包不再是链尾
        if let Some(prev) = slot.packets.last() {
            mem.write32(prev.node_off + PKT_DCPP, node_addr);
        }

        slot.packets.push(Packet {
            node_off,
            pci_start: dla_base + offset,
            dtbc,
        });
        Ok(offset)
    }

    /// 执行链表，完成后核对每个命令包的处理位。
    /// 第 n 个包未被硬件处理时返回 PartialFailure { segment: n }。
    pub fn exec_chain(&self, list: usize) -> Result<()> {
        let (head_addr, node_offs) = {
            let chains = self.chains.lock();
            let slot = chains
                .get(list)
                .filter(|s| s.in_use)
                .ok_or(BridgeError::InvalidParameter("command packet list not allocated"))?;
            let head = match slot.packets.first() {
                Some(p) => self.packet_mem.bus_addr() + p.node_off,
                None => return Err(BridgeError::InvalidParameter("command packet list is empty")),
            };
            (head, slot.packets.iter().map(|p| p.node_off).collect::<Vec<_>>())
        };

        let dgcs = self.bus.read(offsets::DGCS);
        if dgcs & bits::DGCS_ACT != 0 {
            warn!("can't execute list {list}, DMA status = {dgcs:#010x}");
            return Err(BridgeError::ResourceBusy("DMA device is not idle"));
        }

        self.bus.write(offsets::DTBC, 0);
        self.bus.write(offsets::DCPP, head_addr);

        self.exec(bits::DGCS_CHAIN);

        if self.test_and_clear_errors() != 0 {
            return Err(BridgeError::HardwareFault("chained DMA failed"));
        }

        let mem = self.packet_mem.window();
        for (n, node_off) in node_offs.iter().enumerate() {
            if mem.read32(node_off + PKT_DCPP) & bits::DCPP_PROCESSED == 0 {
                warn!("processed bit of packet number {} is not set", n + 1);
                return Err(BridgeError::PartialFailure { segment: n + 1 });
            }
        }
        Ok(())
    }

    /// 拆除链表，释放全部命令包
    pub fn free_chain(&self, list: usize) -> Result<()> {
        let mut chains = self.chains.lock();
        let slot = chains
            .get_mut(list)
            .ok_or(BridgeError::InvalidParameter("command packet list out of range"))?;
        let packets = std::mem::take(&mut slot.packets);
        slot.in_use = false;
        drop(chains);
        for p in packets {
            self.free_packet(p.node_off);
        }
        Ok(())
    }

    pub fn chain_in_use(&self, list: usize) -> bool {
        self.chains.lock().get(list).is_some_and(|s| s.in_use)
    }

    /// 停止 DMA、拆除所有链表、释放通道。DMA 拒绝停止时报硬件故障。
    pub fn reset(&self) -> Result<()> {
        let mut stuck = false;
        {
            let mut state = self.state.lock();
            if state.in_use {
                self.bus.write(offsets::DGCS, bits::DGCS_STOP_REQ);
                if self.bus.read(offsets::DGCS) & bits::DGCS_ACT != 0 {
                    stuck = true;
                }
                self.bus.write(offsets::DGCS, bits::DGCS_CLEAR);
                state.in_use = false;
                state.blt_berr = false;
            }
        }
        for list in 0..MAX_CHAIN {
            if self.chain_in_use(list) {
                self.free_chain(list)?;
            }
        }
        if stuck {
            return Err(BridgeError::HardwareFault("DMA still active after stop request"));
        }
        Ok(())
    }

    /// 启动传输并阻塞等待完成中断或超时
    fn exec(&self, chain_bits: u32) {
        use std::sync::atomic::Ordering;

        let bus = Arc::clone(&self.bus);
        let outcome = self.hub.dma.wait_with(Some(DMA_ACTIVE_TIMEOUT), move || {
            bus.write(offsets::DGCS, bits::DGCS_START | chain_bits);
        });
        if matches!(outcome, Ok(WaitOutcome::TimedOut)) {
            self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// 完成后的状态检查：未正常 DONE 时停住通道、清除错误位并计数，
    /// 返回 DGCS 的错误状态位
    fn test_and_clear_errors(&self) -> u32 {
        use std::sync::atomic::Ordering;

        let dgcs = self.bus.read(offsets::DGCS);
        if dgcs & bits::DGCS_DONE == 0 {
            if dgcs & bits::DGCS_ACT != 0 {
                warn!("DMA stopped with timeout, DGCS = {dgcs:#010x}");
                self.bus.write(offsets::DGCS, bits::DGCS_STOP_REQ);
            }
            self.bus.write(offsets::DGCS, bits::DGCS_CLEAR);
            self.stats.dma_errors.fetch_add(1, Ordering::Relaxed);
            return dgcs & bits::DGCS_ERROR_MASK;
        }
        0
    }

    fn alloc_packet(&self) -> Result<u32> {
        let mut used = self.packet_used.lock();
        for (i, slot) in used.iter_mut().enumerate() {
            if !*slot {
                *slot = true;
                return Ok(i as u32 * PACKET_SIZE);
            }
        }
        Err(BridgeError::ResourceExhausted("no free command packet"))
    }

    fn free_packet(&self, node_off: u32) {
        let mut used = self.packet_used.lock();
        used[(node_off / PACKET_SIZE) as usize] = false;
    }
}

/// 补齐 VME 地址与本地地址低 3 位差异的字节偏移，结果在 0..=7
pub fn align_offset(vme: u32, local: u32) -> u32 {
    (((vme & 0x7) + 0x8) - (local & 0x7)) & 0x7
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_offset_matches_low_bits() {
        // VME 低位 0b101、本地低位 0b010 → 偏移 3，补齐后一致
        let off = align_offset(0b101, 0b010);
        assert_eq!(off, 3);
        assert_eq!((0b010 + off) & 0x7, 0b101);

        for vme in 0..8u32 {
            for local in 0..8u32 {
                let off = align_offset(vme, local);
                assert!(off < 8);
                assert_eq!((local + off) & 0x7, vme & 0x7);
            }
        }
    }
}
