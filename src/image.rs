//! 映像（地址翻译窗口）管理
//!
//! 18 个映像描述符：0..7 为主映像（outbound，本地访问到 VME），
//! 10..17 为从映像（inbound，VME 访问到本地内存），8/9 留给控制
//! 与 DMA 次设备。状态机 Free → Reserved → Configured：acquire
//! 先占位，configure 才编程寄存器，二者分开持锁，防止 acquire
//! 与 configure 之间被第三方插队。

use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::bus::{BusMapper, BusWindow, RegisterBus};
use crate::error::{BridgeError, Result};
use crate::mem::{CoherentBuffer, WindowAllocator};
use crate::regs::{self, MAX_IMAGE};

/// 映像方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageKind {
    /// outbound：本地窗口映射到 VME 地址段
    Master,
    /// inbound：VME 地址段映射到本地相干缓冲区
    Slave,
}

/// 映像槽状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ImageState {
    #[default]
    Free,
    /// 已被 acquire 占位，寄存器尚未编程
    Reserved,
    /// 窗口已编程并映射
    Configured,
}

/// 单个映像描述符
#[derive(Default)]
struct ImageDesc {
    state: ImageState,
    /// 允许通过 read/write 访问
    writable: bool,
    phys_start: u32,
    phys_end: u32,
    size: u32,
    window: Option<BusWindow>,
    /// 主映像占有的物理窗口起始地址
    master_res: Option<u32>,
    /// 从映像的预分配相干缓冲区，释放后保留复用
    slave_buf: Option<CoherentBuffer>,
}

/// 映像配置请求
#[derive(Debug, Clone, Copy)]
pub struct ImageRequest {
    /// 请求的 VME 基地址
    pub base: u32,
    /// 窗口大小（字节）
    pub size: u32,
    pub kind: ImageKind,
}

pub struct ImageManager {
    bus: Arc<dyn RegisterBus>,
    mapper: Arc<dyn BusMapper>,
    allocator: WindowAllocator,
    images: Vec<Mutex<ImageDesc>>,
    /// acquire 扫描串行化
    acquire_lock: Mutex<()>,
    /// 重叠检查到寄存器编程的整个序列串行化
    configure_lock: Mutex<()>,
    allow_overlap: bool,
}

impl ImageManager {
    /// `slave_bufs` 是 10..17 号映像的预分配缓冲区（可少于 8 个，
    /// 缺的槽位无法配置为从映像）。
    pub fn new(
        bus: Arc<dyn RegisterBus>,
        mapper: Arc<dyn BusMapper>,
        allocator: WindowAllocator,
        slave_bufs: Vec<CoherentBuffer>,
        allow_overlap: bool,
    ) -> Self {
        let images = (0..=regs::MAX_MINOR)
            .map(|i| {
                let mut desc = ImageDesc::default();
                if i >= 10 {
                    desc.slave_buf = slave_bufs.get(i - 10).cloned();
                }
                Mutex::new(desc)
            })
            .collect();
        Self {
            bus,
            mapper,
            allocator,
            images,
            acquire_lock: Mutex::new(()),
            configure_lock: Mutex::new(()),
            allow_overlap,
        }
    }

    /// 占用一个空闲映像槽，返回其索引
    pub fn acquire(&self, kind: ImageKind) -> Result<usize> {
        let range = match kind {
            ImageKind::Master => 0..MAX_IMAGE,
            ImageKind::Slave => 10..10 + MAX_IMAGE,
        };
        let _guard = self.acquire_lock.lock();
        for index in range {
            let mut desc = self.images[index].lock();
            if desc.state == ImageState::Free {
                desc.state = ImageState::Reserved;
                return Ok(index);
            }
        }
        Err(BridgeError::ResourceExhausted("no free image slot"))
    }

    /// 配置一个已占位的映像：编程 BS/BD/TO 并映射窗口
    pub fn configure(&self, index: usize, req: ImageRequest) -> Result<()> {
        self.check_index(index, req.kind)?;
        if req.size == 0 {
            return Err(BridgeError::InvalidParameter("window size is zero"));
        }
        // BD 寄存器必须能容纳区间终点
        let vme_end = req
            .base
            .checked_add(req.size)
            .ok_or(BridgeError::InvalidParameter("image range exceeds address space"))?;

        let _guard = self.configure_lock.lock();
        let mut desc = self.images[index].lock();
        if desc.state != ImageState::Reserved {
            return Err(BridgeError::Conflict("image allocation conflicts with existing image"));
        }

        let (pci_base, slave_addr) = match req.kind {
            ImageKind::Master => (Some(self.allocator.alloc(req.size)?), None),
            ImageKind::Slave => match desc.slave_buf.as_ref() {
                Some(buf) => (None, Some(buf.bus_addr())),
                None => return Err(BridgeError::ResourceExhausted("no memory for slave image")),
            },
        };

        // 先做重叠检查再碰寄存器；失败时对称回滚刚取得的窗口
        if !self.allow_overlap {
            if let Err(e) = self.check_overlap(index, req.base, vme_end) {
                if let Some(base) = pci_base {
                    self.allocator.free(base);
                }
                return Err(e);
            }
        }

        match req.kind {
            ImageKind::Master => {
                let pci_base = pci_base.unwrap_or_default();
                self.bus.write(regs::image_bs(index), pci_base);
                self.bus.write(regs::image_bd(index), pci_base + req.size);
                self.bus.write(regs::image_to(index), req.base.wrapping_sub(pci_base));
            }
            ImageKind::Slave => {
                let buffer = slave_addr.unwrap_or_default();
                self.bus.write(regs::image_bs(index), req.base);
                self.bus.write(regs::image_bd(index), vme_end);
                self.bus.write(regs::image_to(index), buffer.wrapping_sub(req.base));
            }
        }

        desc.writable = true;
        desc.state = ImageState::Configured;
        desc.phys_start = self.bus.read(regs::image_bs(index));
        desc.phys_end = self.bus.read(regs::image_bd(index));
        desc.size = desc.phys_end - desc.phys_start;

        let window = match req.kind {
            ImageKind::Master => self.mapper.map(desc.phys_start, req.size),
            // 从映像直接暴露相干缓冲区
            ImageKind::Slave => desc.slave_buf.as_ref().map(|b| b.window()),
        };

        match window {
            Some(w) => {
                desc.window = Some(w);
                desc.master_res = pci_base;
                Ok(())
            }
            None => {
                desc.writable = false;
                desc.state = ImageState::Reserved;
                desc.phys_start = 0;
                desc.phys_end = 0;
                desc.size = 0;
                if let Some(base) = pci_base {
                    self.allocator.free(base);
                }
                warn!("image {index}: mapping of configured window failed");
                Err(BridgeError::HardwareFault("window mapping failed"))
            }
        }
    }

    /// 释放映像：解除映射、归还物理窗口、清零描述符。
    /// 从映像的相干缓冲区保留给下一次使用。
    pub fn release(&self, index: usize) {
        if index > regs::MAX_MINOR {
            return;
        }
        let mut desc = self.images[index].lock();
        desc.window = None;
        if let Some(base) = desc.master_res.take() {
            self.allocator.free(base);
        }
        desc.state = ImageState::Free;
        desc.writable = false;
        desc.phys_start = 0;
        desc.phys_end = 0;
        desc.size = 0;
    }

    pub fn state(&self, index: usize) -> ImageState {
        self.images[index].lock().state
    }

    pub fn writable(&self, index: usize) -> bool {
        self.images[index].lock().writable
    }

    pub fn size(&self, index: usize) -> u32 {
        self.images[index].lock().size
    }

    pub fn phys_range(&self, index: usize) -> (u32, u32) {
        let desc = self.images[index].lock();
        (desc.phys_start, desc.phys_end)
    }

    /// 已配置映像的访问窗口（mmap 等价物）
    pub fn window(&self, index: usize) -> Result<BusWindow> {
        self.images[index]
            .lock()
            .window
            .clone()
            .ok_or(BridgeError::InvalidParameter("image not configured"))
    }

    /// 映像覆盖的 VME 地址区间 [start, end)，由寄存器读回推导。
    ///
    /// 主映像的 BS/BD 是 PCI 地址，加 TO 得到 VME 地址；从映像的
    /// BS/BD 本身就是 VME 地址（TO 指向本地缓冲区）。
    pub fn vme_range(&self, index: usize) -> (u32, u32) {
        let bs = self.bus.read(regs::image_bs(index));
        let bd = self.bus.read(regs::image_bd(index));
        if index >= 10 {
            return (bs, bd);
        }
        let to = self.bus.read(regs::image_to(index));
        (bs.wrapping_add(to), bd.wrapping_add(to))
    }

    /// VME 地址到 PCI/缓冲区地址的翻译偏移（TO 寄存器）
    pub fn translation_offset(&self, index: usize) -> u32 {
        self.bus.read(regs::image_to(index))
    }

    fn check_overlap(&self, index: usize, req_start: u32, req_end: u32) -> Result<()> {
        for i in 0..MAX_IMAGE {
            if i == index {
                continue;
            }
            if self.images[i].lock().state != ImageState::Configured {
                continue;
            }
            let (start, end) = self.vme_range(i);
            if !(req_end <= start || req_start >= end) {
                warn!(
                    "overlap of image {i} and {index}: [{req_start:#x}, {req_end:#x}) \
                     vs [{start:#x}, {end:#x})"
                );
                return Err(BridgeError::Conflict("image overlaps existing image"));
            }
        }
        Ok(())
    }

    fn check_index(&self, index: usize, kind: ImageKind) -> Result<()> {
        let ok = match kind {
            ImageKind::Master => index < MAX_IMAGE,
            ImageKind::Slave => (10..=regs::MAX_MINOR).contains(&index),
        };
        if ok {
            Ok(())
        } else {
            Err(BridgeError::InvalidParameter("image index does not match image kind"))
        }
    }
}
