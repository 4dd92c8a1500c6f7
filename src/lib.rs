//! # vme-bridge - Tundra UniverseII PCI-VME 桥驱动核心
//!
//! 提供 CA91C042 桥接芯片的驱动状态机：映像（地址翻译窗口）分配、
//! DMA 引擎与命令包链表、中断/邮箱/总线错误事件分发。
//!
//! ## 模块组织
//!
//! ```text
//! vme-bridge
//! ├── regs        # 寄存器偏移与位掩码
//! ├── bus         # 寄存器总线与窗口抽象（RAM 后端用于测试）
//! ├── mem         # 相干缓冲区与物理窗口分配器
//! ├── image       # 主/从映像状态机
//! ├── dma         # DMA 引擎与链式传输
//! ├── irq         # 共享中断线分发与 IRQ 等待槽
//! ├── mailbox     # 4 个邮箱
//! ├── berr        # VME 总线错误环形日志
//! └── driver      # 门面：UniverseII 驱动实例
//! ```
//!
//! ## 使用方式
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vme_bridge::{BridgeConfig, MemoryLayout, MemBus, MemMapper, UniverseII};
//!
//! let bus = Arc::new(MemBus::new());
//! let mapper = Arc::new(MemMapper::new());
//! let drv = UniverseII::new(bus, mapper, BridgeConfig::default(), MemoryLayout::default())?;
//! let img = drv.acquire_image(vme_bridge::ImageKind::Master)?;
//! ```

pub mod berr;
pub mod bus;
pub mod config;
pub mod dma;
pub mod driver;
pub mod error;
pub mod image;
pub mod irq;
pub mod mailbox;
pub mod mem;
pub mod regs;
pub mod stats;
pub mod wait;

pub use berr::{BusErrorEntry, BusErrorRing, BERR_RING_SIZE};
pub use bus::{BusMapper, BusWindow, MemBus, MemMapper, RegisterBus};
pub use config::{BridgeConfig, MemoryLayout};
pub use dma::{DmaDirection, DmaEngine, DmaParam, DMA_ACTIVE_TIMEOUT, MAX_CHAIN};
pub use driver::{BridgeStatus, ImageSummary, UniverseII, VmeAccess};
pub use error::{BridgeError, Result};
pub use image::{ImageKind, ImageManager, ImageRequest, ImageState};
pub use irq::{EventHub, InterruptRouter, WindowWrite};
pub use mailbox::MailboxSet;
pub use mem::{CoherentBuffer, WindowAllocator};
pub use stats::{DriverStats, StatsSnapshot};
pub use wait::{WaitOutcome, WaitSlot};
