//! 驱动门面
//!
//! `UniverseII` 把寄存器总线、映像管理、DMA 引擎、中断路由、邮箱
//! 组合成一个驱动实例，对应原生驱动的字符设备层：次设备号 0..7
//! 为主映像，8 为控制设备，9 为 DMA，10..17 为从映像。
//!
//! 所有直接碰 VME 总线的同步访问（映像读写、地址探测）都串行化
//! 在 `vme_lock` 之下，靠 PCI_CSR 的 S_TA 位探测总线错误。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::{info, warn};
use parking_lot::Mutex;
use serde::Serialize;

use crate::berr::{BusErrorEntry, BusErrorRing};
use crate::bus::{BusMapper, BusWindow, RegisterBus};
use crate::config::{BridgeConfig, MemoryLayout};
use crate::dma::{DmaDirection, DmaEngine, DmaParam, MAX_CHAIN};
use crate::error::{BridgeError, Result};
use crate::image::{ImageKind, ImageManager, ImageRequest, ImageState};
use crate::irq::{EventHub, InterruptRouter, WindowWrite};
use crate::mailbox::MailboxSet;
use crate::mem::{CoherentBuffer, WindowAllocator};
use crate::regs::{self, bits, offsets, MAX_IMAGE, MAX_MINOR, PCI_BUF_SIZE};
use crate::stats::{DriverStats, StatsSnapshot};
use crate::wait::WaitOutcome;

/// 软件 VME 中断的 IACK 等待上限
const IACK_TIMEOUT: Duration = Duration::from_secs(1);

/// 命令包存放区大小：256 包 × 32 字节
const PACKET_MEM_SIZE: u32 = 0x2000;

/// 一次挂接在 IRQ 等待上的 VME 写动作（进入等待时启动外设、
/// 唤醒前清除外设中断源）
#[derive(Debug, Clone, Copy)]
pub struct VmeAccess {
    /// VME 地址，必须落在所属映像的地址范围内
    pub addr: u32,
    pub value: u32,
}

/// 桥接驱动实例
pub struct UniverseII {
    bus: Arc<dyn RegisterBus>,
    config: BridgeConfig,
    stats: Arc<DriverStats>,
    ring: Arc<BusErrorRing>,
    hub: Arc<EventHub>,
    images: ImageManager,
    router: InterruptRouter,
    mailboxes: MailboxSet,
    dma: DmaEngine,
    /// 同步 VME 访问（读写、探测）串行化，S_TA 检测依赖它
    vme_lock: Mutex<()>,
}

impl UniverseII {
    /// 探测并初始化桥接芯片
    pub fn new(
        bus: Arc<dyn RegisterBus>,
        mapper: Arc<dyn BusMapper>,
        config: BridgeConfig,
        layout: MemoryLayout,
    ) -> Result<Self> {
        if bus.read(offsets::PCI_ID) != bits::PCI_ID_TUNDRA_CA91C042 {
            return Err(BridgeError::HardwareFault("no Tundra CA91C042 found"));
        }
        let config = sanitize_config(config);

        let stats = Arc::new(DriverStats::new());
        let ring = Arc::new(BusErrorRing::new());
        let hub = Arc::new(EventHub::new());

        // 相干内存划分：DMA 池、8 个从映像缓冲区、命令包区
        let pool = CoherentBuffer::new(layout.coherent_base, PCI_BUF_SIZE);
        let slave_bufs: Vec<CoherentBuffer> = (0..MAX_IMAGE as u32)
            .map(|i| CoherentBuffer::new(layout.coherent_base + PCI_BUF_SIZE * (1 + i), PCI_BUF_SIZE))
            .collect();
        let packet_mem =
            CoherentBuffer::new(layout.coherent_base + PCI_BUF_SIZE * 9, PACKET_MEM_SIZE);

        let allocator = WindowAllocator::new(layout.window_base, layout.window_size);
        let images = ImageManager::new(
            Arc::clone(&bus),
            mapper,
            allocator,
            slave_bufs,
            config.img_ovl,
        );
        let router = InterruptRouter::new(
            Arc::clone(&bus),
            Arc::clone(&hub),
            Arc::clone(&stats),
            Arc::clone(&ring),
        );
        let mailboxes = MailboxSet::new(Arc::clone(&bus), Arc::clone(&hub), Arc::clone(&stats));
        let dma = DmaEngine::new(
            Arc::clone(&bus),
            Arc::clone(&hub),
            Arc::clone(&stats),
            pool,
            packet_mem,
        );

        let driver = Self {
            bus,
            config,
            stats,
            ring,
            hub,
            images,
            router,
            mailboxes,
            dma,
            vme_lock: Mutex::new(()),
        };
        driver.init_chip();
        Ok(driver)
    }

    /// 芯片上电编程：中断先全关再按默认使能，总线请求/仲裁参数
    /// 按配置写入，全部映像寄存器回到复位值
    fn init_chip(&self) {
        let cfg = &self.config;

        self.bus.write(offsets::LINT_EN, 0);
        self.bus.write(offsets::LINT_STAT, 0x00FF_FFFF);
        self.bus.write(offsets::VINT_EN, 0);

        let mut mast = (cfg.br_level as u32) << 22;
        if cfg.req_mode {
            mast |= bits::MAST_REQ_MODE;
        }
        if cfg.rel_mode {
            mast |= bits::MAST_REL_MODE;
        }
        self.bus.write(offsets::MAST_CTL, mast);

        let mut misc = ((cfg.vbto as u32) << 28) | ((cfg.varbto as u32) << 24);
        if cfg.varb != 0 {
            misc |= bits::MISC_VARB_PRI;
        }
        if cfg.sys_ctrl {
            misc |= bits::MISC_SYSCON;
        }
        self.bus.write(offsets::MISC_CTL, misc);
        if cfg.sys_ctrl {
            info!("bridge is the VME system controller");
        }

        // 清掉上电遗留的 SYSFAIL
        self.bus.write(offsets::VCSR_CLR, bits::VCSR_SYSFAIL);

        if cfg.vrai_bs != 0 {
            // 地址空间按基地址量级推断：A16 / A24 / A32
            let vas = match cfg.vrai_bs {
                0..0x1_0000 => 0,
                0x1_0000..0x100_0000 => 1,
                _ => 2,
            };
            self.bus.write(offsets::VRAI_BS, cfg.vrai_bs);
            self.bus.write(offsets::VRAI_CTL, bits::VRAI_CTL_ENABLE | vas << 16);
        }

        self.reset_images();

        // 中断全部路由到 LINT0
        self.bus.write(offsets::LINT_MAP0, 0);
        self.bus.write(offsets::LINT_MAP1, 0);
        self.bus.write(offsets::LINT_MAP2, 0);
        self.bus.write(offsets::LINT_EN, bits::LINT_EN_DEFAULT);

        let csr = self.bus.read(offsets::PCI_CSR);
        self.bus.write(offsets::PCI_CSR, (csr & !bits::PCI_CSR_ERROR_MASK) | bits::PCI_CSR_MASTER_EN);
    }

    fn reset_images(&self) {
        for index in (0..MAX_IMAGE).chain(10..=MAX_MINOR) {
            self.bus.write(regs::image_ctl(index), bits::IMAGE_CTL_RESET);
            self.bus.write(regs::image_bs(index), 0);
            self.bus.write(regs::image_bd(index), 0);
            self.bus.write(regs::image_to(index), 0);
        }
    }

    /// 共享中断线处理入口
    pub fn handle_interrupt(&self) -> bool {
        self.router.handle_interrupt()
    }

    // ------------------------------------------------------------------
    // 映像
    // ------------------------------------------------------------------

    pub fn acquire_image(&self, kind: ImageKind) -> Result<usize> {
        self.stats.ioctls.fetch_add(1, Ordering::Relaxed);
        self.images.acquire(kind)
    }

    pub fn configure_image(&self, minor: usize, req: ImageRequest) -> Result<()> {
        self.stats.ioctls.fetch_add(1, Ordering::Relaxed);
        self.images.configure(minor, req)
    }

    /// 释放映像，同时强制注销它占有的全部 IRQ 等待槽
    pub fn release_image(&self, minor: usize) {
        self.stats.ioctls.fetch_add(1, Ordering::Relaxed);
        self.router.disarm_owner(minor);
        self.images.release(minor);
    }

    pub fn image_state(&self, minor: usize) -> ImageState {
        self.images.state(minor)
    }

    /// 已配置映像的访问窗口（mmap 等价物）
    pub fn image_window(&self, minor: usize) -> Result<BusWindow> {
        self.images.window(minor)
    }

    /// 写映像的 CTL 寄存器（地址空间、数据宽度、使能位）
    pub fn set_ctl(&self, minor: usize, value: u32) -> Result<()> {
        check_image_minor(minor)?;
        self.stats.ioctls.fetch_add(1, Ordering::Relaxed);
        self.bus.write(regs::image_ctl(minor), value);
        Ok(())
    }

    /// 修改 CTL 寄存器的单个选项位。带 OPT_CLEAR 标志时清除掩码位，
    /// 否则置位。
    pub fn set_opt(&self, minor: usize, value: u32) -> Result<()> {
        check_image_minor(minor)?;
        self.stats.ioctls.fetch_add(1, Ordering::Relaxed);
        let ctl = self.bus.read(regs::image_ctl(minor));
        let new = if value & bits::OPT_CLEAR != 0 {
            ctl & !(value & !bits::OPT_CLEAR)
        } else {
            ctl | value
        };
        self.bus.write(regs::image_ctl(minor), new);
        Ok(())
    }

    /// 通过映像读 VME。发生总线错误时返回错误前已读出的字节数。
    ///
    /// `pos` 的高 4 位编码访问宽度（1、2、4 字节），低 28 位是
    /// 窗口内偏移。
    pub fn read_image(&self, minor: usize, pos: u64, buf: &mut [u8]) -> Result<usize> {
        check_image_minor(minor)?;
        let (dw, offset) = decode_pos(pos)?;
        check_len(buf.len(), dw)?;
        let window = self.images.window(minor)?;
        check_span(offset, buf.len(), self.images.size(minor))?;
        self.stats.reads.fetch_add(1, Ordering::Relaxed);

        // 从映像是本地内存，不会产生 VME 总线错误
        if minor >= 10 {
            copy_from_window(&window, offset, dw, buf);
            return Ok(buf.len());
        }

        let _guard = self.vme_lock.lock();
        self.test_and_clear_berr();
        let mut done = 0;
        for chunk in buf.chunks_exact_mut(dw) {
            let o = offset + done as u32;
            match dw {
                1 => chunk[0] = window.read8(o),
                2 => chunk.copy_from_slice(&window.read16(o).to_le_bytes()),
                _ => chunk.copy_from_slice(&window.read32(o).to_le_bytes()),
            }
            if self.test_and_clear_berr() {
                warn!("VMEbus error during image {minor} read at offset {o:#x}");
                break;
            }
            done += dw;
        }
        Ok(done)
    }

    /// 通过映像写 VME。发生总线错误时返回错误前已写入的字节数。
    pub fn write_image(&self, minor: usize, pos: u64, buf: &[u8]) -> Result<usize> {
        check_image_minor(minor)?;
        let (dw, offset) = decode_pos(pos)?;
        check_len(buf.len(), dw)?;
        if !self.images.writable(minor) {
            return Err(BridgeError::InvalidParameter("image is not writable"));
        }
        let window = self.images.window(minor)?;
        check_span(offset, buf.len(), self.images.size(minor))?;
        self.stats.writes.fetch_add(1, Ordering::Relaxed);

        if minor >= 10 {
            copy_to_window(&window, offset, dw, buf);
            return Ok(buf.len());
        }

        let _guard = self.vme_lock.lock();
        self.test_and_clear_berr();
        let mut done = 0;
        for chunk in buf.chunks_exact(dw) {
            let o = offset + done as u32;
            match dw {
                1 => window.write8(o, chunk[0]),
                2 => window.write16(o, u16::from_le_bytes([chunk[0], chunk[1]])),
                _ => window.write32(o, u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
            }
            if self.test_and_clear_berr() {
                warn!("VMEbus error during image {minor} write at offset {o:#x}");
                break;
            }
            done += dw;
        }
        Ok(done)
    }

    /// 探测一个 VME 地址是否有设备应答。
    ///
    /// 在已配置的主映像里找到覆盖该地址的那个，做一次测试读并检查
    /// S_TA。没有映像覆盖该地址时报参数错误。
    pub fn probe_address(&self, addr: u32) -> Result<bool> {
        self.stats.ioctls.fetch_add(1, Ordering::Relaxed);
        let minor = (0..MAX_IMAGE)
            .find(|&i| {
                if self.images.state(i) != ImageState::Configured {
                    return false;
                }
                let (start, end) = self.images.vme_range(i);
                (start..end).contains(&addr)
            })
            .ok_or(BridgeError::InvalidParameter("no image covers probed address"))?;

        let window = self.images.window(minor)?;
        let offset = addr
            .wrapping_sub(self.images.translation_offset(minor))
            .wrapping_sub(self.images.phys_range(minor).0);
        check_span(offset, 4, self.images.size(minor))?;

        let _guard = self.vme_lock.lock();
        self.test_and_clear_berr();
        let _ = window.read32(offset);
        Ok(!self.test_and_clear_berr())
    }

    /// 控制次设备：直接读桥寄存器
    pub fn register_read(&self, offset: u32) -> u32 {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        self.bus.read(offset)
    }

    /// 控制次设备：直接写桥寄存器
    pub fn register_write(&self, offset: u32, value: u32) {
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.bus.write(offset, value);
    }

    /// 检查并清除挂起的 VME 总线错误（PCI_CSR 的 S_TA 位）
    pub fn test_and_clear_berr(&self) -> bool {
        let csr = self.bus.read(offsets::PCI_CSR);
        if csr & bits::PCI_CSR_S_TA != 0 {
            // 读回值里 S_TA 已置位，按写 1 清除语义原样写回
            self.bus.write(offsets::PCI_CSR, csr);
            true
        } else {
            false
        }
    }

    // ------------------------------------------------------------------
    // 中断
    // ------------------------------------------------------------------

    /// 注册 (级别, Status/ID) 等待槽，归属于 `minor` 号映像。
    /// `entry`/`exit` 是挂接的 VME 写动作，地址必须落在该映像内。
    pub fn arm_irq(
        &self,
        minor: usize,
        level: u8,
        statid: u8,
        entry: Option<VmeAccess>,
        exit: Option<VmeAccess>,
    ) -> Result<()> {
        self.stats.ioctls.fetch_add(1, Ordering::Relaxed);
        let entry = entry.map(|a| self.vme_write(minor, a)).transpose()?;
        let exit = exit.map(|a| self.vme_write(minor, a)).transpose()?;
        self.router.arm(minor, level, statid, entry, exit)
    }

    pub fn disarm_irq(&self, level: u8, statid: u8) -> Result<()> {
        self.stats.ioctls.fetch_add(1, Ordering::Relaxed);
        self.router.disarm(level, statid)
    }

    /// 阻塞等待已注册的 VME 中断
    pub fn wait_irq(&self, level: u8, statid: u8, timeout: Option<Duration>) -> Result<()> {
        self.stats.ioctls.fetch_add(1, Ordering::Relaxed);
        self.router.wait_irq(level, statid, timeout)
    }

    pub fn irq_armed(&self, level: u8, statid: u8) -> bool {
        self.router.armed(level, statid)
    }

    /// 在 VME 总线上产生一个软件中断并等待确认周期完成
    pub fn generate_vme_interrupt(&self, level: u8, statid: u8) -> Result<()> {
        if !(1..=7).contains(&level) {
            return Err(BridgeError::InvalidParameter("irq level out of range"));
        }
        self.stats.ioctls.fetch_add(1, Ordering::Relaxed);

        self.bus.write(offsets::STATID, (statid as u32) << 24);
        let vint_en = self.bus.read(offsets::VINT_EN);

        let bus = Arc::clone(&self.bus);
        let outcome = self.hub.iack.wait_with(Some(IACK_TIMEOUT), move || {
            bus.write(offsets::VINT_EN, vint_en | 1 << (24 + level as u32));
        })?;
        // 无论确认与否都撤掉中断线
        self.bus.write(offsets::VINT_EN, vint_en);

        match outcome {
            WaitOutcome::Woken => Ok(()),
            WaitOutcome::TimedOut => {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!("timeout waiting for IACK of generated interrupt level {level}");
                Err(BridgeError::TimedOut)
            }
        }
    }

    /// 把 VME 地址上的写动作翻译成已映射窗口内的写
    fn vme_write(&self, minor: usize, access: VmeAccess) -> Result<WindowWrite> {
        let to = self.images.translation_offset(minor);
        let (start, end) = self.images.phys_range(minor);
        let phys = access.addr.wrapping_sub(to);
        if phys < start || phys.wrapping_add(4) > end {
            return Err(BridgeError::InvalidParameter("address outside image range"));
        }
        Ok(WindowWrite {
            window: self.images.window(minor)?,
            offset: phys - start,
            value: access.value,
        })
    }

    // ------------------------------------------------------------------
    // 邮箱
    // ------------------------------------------------------------------

    pub fn enable_mailbox(&self, n: usize) -> Result<()> {
        self.stats.ioctls.fetch_add(1, Ordering::Relaxed);
        self.mailboxes.enable(n)
    }

    pub fn disable_mailbox(&self, n: usize) -> Result<()> {
        self.stats.ioctls.fetch_add(1, Ordering::Relaxed);
        self.mailboxes.disable(n)
    }

    /// 等待 n 号邮箱被 VME 一侧写入，返回写入的值
    pub fn wait_mailbox(&self, n: usize, timeout: Option<Duration>) -> Result<u32> {
        self.stats.ioctls.fetch_add(1, Ordering::Relaxed);
        self.mailboxes.wait(n, timeout)
    }

    // ------------------------------------------------------------------
    // DMA
    // ------------------------------------------------------------------

    pub fn request_dma_channel(&self, segments: u32) -> Result<()> {
        self.stats.ioctls.fetch_add(1, Ordering::Relaxed);
        self.dma.request_channel(segments)
    }

    pub fn release_dma_channel(&self) {
        self.stats.ioctls.fetch_add(1, Ordering::Relaxed);
        self.dma.release_channel();
    }

    pub fn set_blt_until_berr(&self, on: bool) {
        self.stats.ioctls.fetch_add(1, Ordering::Relaxed);
        self.dma.set_blt_until_berr(on);
    }

    /// 单次 DMA 传输，返回对齐补偿偏移
    pub fn dma_transfer(&self, direction: DmaDirection, param: DmaParam) -> Result<u32> {
        self.stats.ioctls.fetch_add(1, Ordering::Relaxed);
        self.dma.transfer(direction, param)
    }

    pub fn new_dma_chain(&self) -> Result<usize> {
        self.stats.ioctls.fetch_add(1, Ordering::Relaxed);
        self.dma.new_chain()
    }

    pub fn add_dma_packet(&self, list: usize, dctl: u32, dtbc: u32, dva: u32) -> Result<u32> {
        self.stats.ioctls.fetch_add(1, Ordering::Relaxed);
        self.dma.add_packet(list, dctl, dtbc, dva)
    }

    pub fn exec_dma_chain(&self, list: usize) -> Result<()> {
        self.stats.ioctls.fetch_add(1, Ordering::Relaxed);
        self.dma.exec_chain(list)
    }

    pub fn free_dma_chain(&self, list: usize) -> Result<()> {
        self.stats.ioctls.fetch_add(1, Ordering::Relaxed);
        self.dma.free_chain(list)
    }

    /// DMA 数据池的访问窗口
    pub fn dma_pool(&self) -> BusWindow {
        self.dma.pool_window()
    }

    /// 命令包区窗口（模拟硬件沿 DCPP 链访问时使用）
    pub fn dma_packet_mem(&self) -> BusWindow {
        self.dma.packet_window()
    }

    // ------------------------------------------------------------------
    // 全局
    // ------------------------------------------------------------------

    /// 在 VME 总线上发起 SYSRST 脉冲
    pub fn sysrst(&self) {
        self.stats.ioctls.fetch_add(1, Ordering::Relaxed);
        let misc = self.bus.read(offsets::MISC_CTL);
        self.bus.write(offsets::MISC_CTL, misc | bits::MISC_SW_SYSRST);
    }

    /// 把驱动恢复到刚加载的状态：停止 DMA、拆除全部链表和等待槽、
    /// 释放全部映像、清空错误日志与统计。
    ///
    /// DMA 拒绝停止时其余清理照常进行，最后报硬件故障。
    pub fn reset_all(&self) -> Result<()> {
        let csr = self.bus.read(offsets::PCI_CSR);
        self.bus.write(offsets::PCI_CSR, csr | bits::PCI_CSR_ERROR_MASK);

        let dma_result = self.dma.reset();

        for minor in (0..MAX_IMAGE).chain(10..=MAX_MINOR) {
            self.router.disarm_owner(minor);
            self.images.release(minor);
        }
        self.reset_images();

        self.bus.write(offsets::LINT_EN, bits::LINT_EN_RESET);
        self.ring.clear();
        self.stats.reset();
        dma_result
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// 最近的总线错误记录，最老到最新
    pub fn bus_errors(&self) -> Vec<BusErrorEntry> {
        self.ring.recent(self.stats.berrs.load(Ordering::Relaxed))
    }

    /// 当前驱动状态汇总
    pub fn status(&self) -> BridgeStatus {
        let images = (0..MAX_IMAGE)
            .chain(10..=MAX_MINOR)
            .map(|index| {
                let ctl = self.bus.read(regs::image_ctl(index));
                let (vme_start, vme_end) = self.images.vme_range(index);
                ImageSummary {
                    index,
                    state: self.images.state(index),
                    vme_start,
                    vme_end,
                    size: self.images.size(index),
                    address_space: decode_vas(ctl),
                    data_width: decode_vdw(ctl),
                }
            })
            .collect();
        BridgeStatus {
            sys_ctrl: self.bus.read(offsets::MISC_CTL) & bits::MISC_SYSCON != 0,
            images,
            dma_in_use: self.dma.channel_in_use(),
            chains_in_use: (0..MAX_CHAIN).filter(|&l| self.dma.chain_in_use(l)).count(),
            stats: self.stats.snapshot(),
        }
    }
}

/// 映像状态摘要
#[derive(Debug, Clone, Serialize)]
pub struct ImageSummary {
    pub index: usize,
    pub state: ImageState,
    pub vme_start: u32,
    pub vme_end: u32,
    pub size: u32,
    pub address_space: &'static str,
    pub data_width: &'static str,
}

/// 驱动状态摘要（proc 读出的等价物）
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub sys_ctrl: bool,
    pub images: Vec<ImageSummary>,
    pub dma_in_use: bool,
    pub chains_in_use: usize,
    pub stats: StatsSnapshot,
}

impl fmt::Display for BridgeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "UniverseII bridge, system controller: {}",
            if self.sys_ctrl { "yes" } else { "no" }
        )?;
        for img in &self.images {
            if img.state == ImageState::Free {
                continue;
            }
            writeln!(
                f,
                "image {:2}: {:?} [{:#010x}, {:#010x}) {} {} size {:#x}",
                img.index, img.state, img.vme_start, img.vme_end, img.address_space,
                img.data_width, img.size
            )?;
        }
        writeln!(
            f,
            "dma in use: {}, chains: {}, irqs: {}, bus errors: {}",
            self.dma_in_use, self.chains_in_use, self.stats.irqs, self.stats.berrs
        )
    }
}

/// 越界的配置字段退回默认值并记录警告
fn sanitize_config(mut cfg: BridgeConfig) -> BridgeConfig {
    let defaults = BridgeConfig::default();
    if cfg.br_level > 3 {
        warn!("bus request level {} out of range, using {}", cfg.br_level, defaults.br_level);
        cfg.br_level = defaults.br_level;
    }
    if cfg.vbto > 7 {
        warn!("VMEbus timeout {} out of range, using {}", cfg.vbto, defaults.vbto);
        cfg.vbto = defaults.vbto;
    }
    if cfg.varb > 1 {
        warn!("arbitration mode {} out of range, using {}", cfg.varb, defaults.varb);
        cfg.varb = defaults.varb;
    }
    if cfg.varbto > 2 {
        warn!("arbitration timeout {} out of range, using {}", cfg.varbto, defaults.varbto);
        cfg.varbto = defaults.varbto;
    }
    if cfg.vrai_bs & 0xFFF != 0 {
        warn!("VRAI base {:#x} not 4K aligned, disabling register image", cfg.vrai_bs);
        cfg.vrai_bs = 0;
    }
    cfg
}

fn check_image_minor(minor: usize) -> Result<()> {
    if minor < MAX_IMAGE || (10..=MAX_MINOR).contains(&minor) {
        Ok(())
    } else {
        Err(BridgeError::InvalidParameter("minor number is not an image"))
    }
}

/// pos 高 4 位是访问宽度，低 28 位是窗口内偏移
fn decode_pos(pos: u64) -> Result<(usize, u32)> {
    let dw = ((pos >> 28) & 0xF) as usize;
    let offset = (pos & 0x0FFF_FFFF) as u32;
    match dw {
        1 | 2 | 4 => Ok((dw, offset)),
        _ => Err(BridgeError::InvalidParameter("access width must be 1, 2 or 4")),
    }
}

fn check_len(len: usize, dw: usize) -> Result<()> {
    if len % dw == 0 {
        Ok(())
    } else {
        Err(BridgeError::InvalidParameter("buffer length not a multiple of access width"))
    }
}

fn check_span(offset: u32, len: usize, size: u32) -> Result<()> {
    if (offset as u64) + len as u64 <= size as u64 {
        Ok(())
    } else {
        Err(BridgeError::InvalidParameter("access beyond end of image"))
    }
}

fn copy_from_window(window: &BusWindow, offset: u32, dw: usize, buf: &mut [u8]) {
    for (i, chunk) in buf.chunks_exact_mut(dw).enumerate() {
        let o = offset + (i * dw) as u32;
        match dw {
            1 => chunk[0] = window.read8(o),
            2 => chunk.copy_from_slice(&window.read16(o).to_le_bytes()),
            _ => chunk.copy_from_slice(&window.read32(o).to_le_bytes()),
        }
    }
}

fn copy_to_window(window: &BusWindow, offset: u32, dw: usize, buf: &[u8]) {
    for (i, chunk) in buf.chunks_exact(dw).enumerate() {
        let o = offset + (i * dw) as u32;
        match dw {
            1 => window.write8(o, chunk[0]),
            2 => window.write16(o, u16::from_le_bytes([chunk[0], chunk[1]])),
            _ => window.write32(o, u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
        }
    }
}

/// VAS 字段（CTL 位 18:16）到地址空间名
fn decode_vas(ctl: u32) -> &'static str {
    match (ctl >> 16) & 0x7 {
        0 => "A16",
        1 => "A24",
        2 => "A32",
        5 => "CR/SCR",
        6 => "User1",
        7 => "User2",
        _ => "Reserved",
    }
}

/// VDW 字段（CTL 位 23:22）到数据宽度名
fn decode_vdw(ctl: u32) -> &'static str {
    match (ctl >> 22) & 0x3 {
        0 => "D8",
        1 => "D16",
        2 => "D32",
        _ => "D64",
    }
}
