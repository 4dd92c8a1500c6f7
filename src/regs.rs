//! UniverseII (CA91C042) 寄存器映射
//!
//! 定义桥接芯片 4KB 寄存器空间内所有使用到的寄存器偏移和位掩码。
//! 偏移以字节为单位，所有寄存器均为 32 位宽。

/// 寄存器偏移
pub mod offsets {
    /// PCI 配置镜像：设备/厂商 ID
    pub const PCI_ID: u32 = 0x000;
    /// PCI 控制/状态寄存器（含 S_TA 总线错误位）
    pub const PCI_CSR: u32 = 0x004;

    /// 主映像（outbound）寄存器组：LSI0..LSI3
    pub const LSI0_CTL: u32 = 0x100;
    pub const LSI0_BS: u32 = 0x104;
    pub const LSI0_BD: u32 = 0x108;
    pub const LSI0_TO: u32 = 0x10C;
    /// LSI4..LSI7 从 0x1A0 开始，步长与低组一致 (0x14)
    pub const LSI4_CTL: u32 = 0x1A0;

    /// DMA 控制寄存器
    pub const DCTL: u32 = 0x200;
    /// DMA 传输字节计数
    pub const DTBC: u32 = 0x204;
    /// DMA 本地 (PCI) 地址
    pub const DLA: u32 = 0x208;
    /// DMA VME 地址
    pub const DVA: u32 = 0x210;
    /// DMA 命令包链表指针
    pub const DCPP: u32 = 0x218;
    /// DMA 全局控制/状态
    pub const DGCS: u32 = 0x220;

    /// 本地中断使能
    pub const LINT_EN: u32 = 0x300;
    /// 本地中断状态
    pub const LINT_STAT: u32 = 0x304;
    pub const LINT_MAP0: u32 = 0x308;
    pub const LINT_MAP1: u32 = 0x30C;
    /// VME 中断使能（软件中断发生器）
    pub const VINT_EN: u32 = 0x310;
    pub const VINT_STAT: u32 = 0x314;
    /// 软件中断的 Status/ID 输出
    pub const STATID: u32 = 0x320;
    /// IACK 周期读回的 Status/ID：V1_STATID..V7_STATID，步长 4
    pub const V1_STATID: u32 = 0x324;
    pub const LINT_MAP2: u32 = 0x340;
    /// 邮箱寄存器 MBOX0..MBOX3，步长 4
    pub const MBOX0: u32 = 0x348;

    /// VME 主控制（请求级别、请求/释放模式）
    pub const MAST_CTL: u32 = 0x400;
    /// 杂项控制（系统控制器、总线超时、仲裁、SYSRST）
    pub const MISC_CTL: u32 = 0x404;

    /// 从映像（inbound）寄存器组：VSI0..VSI3
    pub const VSI0_CTL: u32 = 0xF00;
    pub const VSI0_BS: u32 = 0xF04;
    pub const VSI0_BD: u32 = 0xF08;
    pub const VSI0_TO: u32 = 0xF0C;
    /// VME 访问本桥寄存器的窗口
    pub const VRAI_CTL: u32 = 0xF70;
    pub const VRAI_BS: u32 = 0xF74;
    /// VME 总线错误：地址修饰码与日志状态
    pub const V_AMERR: u32 = 0xF88;
    /// VME 总线错误地址
    pub const VAERR: u32 = 0xF8C;
    /// VSI4..VSI7 从 0xF90 开始
    pub const VSI4_CTL: u32 = 0xF90;
    /// VCSR 位清除寄存器（SYSFAIL 等）
    pub const VCSR_CLR: u32 = 0xFF4;
}

/// 位掩码与常数
pub mod bits {
    /// CA91C042 的 PCI_ID 读回值（厂商 Tundra）
    pub const PCI_ID_TUNDRA_CA91C042: u32 = 0x0000_10E3;

    /// PCI_CSR: Signalled Target-Abort，VME 总线错误指示
    pub const PCI_CSR_S_TA: u32 = 0x0800_0000;
    /// PCI_CSR: 总线主控使能（从映像必需）
    pub const PCI_CSR_MASTER_EN: u32 = 0x0000_0004;
    /// PCI_CSR: 所有错误状态位
    pub const PCI_CSR_ERROR_MASK: u32 = 0xF900_0000;

    /// LINT: VME 中断级 1..7（位 1..7）
    pub const LINT_VIRQ_MASK: u32 = 0x0000_00FE;
    /// LINT: DMA 完成
    pub const LINT_DMA: u32 = 0x0000_0100;
    /// LINT: VME 总线错误
    pub const LINT_VERR: u32 = 0x0000_0400;
    /// LINT: 软件中断确认完成
    pub const LINT_SW_IACK: u32 = 0x0000_1000;
    /// LINT: 邮箱 0 中断位，n 号邮箱为 MBOX0 << n
    pub const LINT_MBOX0: u32 = 0x0001_0000;
    pub const LINT_MBOX_MASK: u32 = 0x000F_0000;
    /// 启动时使能：DMA、BERR、VIRQ1..7 与 SW_IACK
    pub const LINT_EN_DEFAULT: u32 = 0x0000_15FE;
    /// 复位后保留的使能（邮箱与软件 IACK 关闭）
    pub const LINT_EN_RESET: u32 = 0x0000_05FE;

    /// IACK 读回：确认周期中发生总线错误
    pub const STATID_BERR: u32 = 0x0000_0100;

    /// DGCS: 启动传输
    pub const DGCS_GO: u32 = 0x8000_0000;
    /// DGCS: 请求停止
    pub const DGCS_STOP_REQ: u32 = 0x4000_0000;
    /// DGCS: 链式模式
    pub const DGCS_CHAIN: u32 = 0x0800_0000;
    /// DGCS: 传输进行中
    pub const DGCS_ACT: u32 = 0x0000_8000;
    /// DGCS: 正常完成
    pub const DGCS_DONE: u32 = 0x0000_0800;
    /// DGCS: VME 总线错误终止
    pub const DGCS_VERR: u32 = 0x0000_0200;
    /// DGCS: 错误状态汇总
    pub const DGCS_ERROR_MASK: u32 = 0x0000_E700;
    /// 清除全部错误并关闭 DMA 中断
    pub const DGCS_CLEAR: u32 = 0x0000_6F00;
    /// 启动值：GO、清错误、使能全部 DMA 中断
    pub const DGCS_START: u32 = 0x8000_6F0F;

    /// DCTL: 传输方向，置位为 PCI→VME（写）
    pub const DCTL_L2V: u32 = 0x8000_0000;

    /// 命令包链表指针：链表结束
    pub const DCPP_NULL: u32 = 0x0000_0001;
    /// 命令包链表指针：硬件已处理
    pub const DCPP_PROCESSED: u32 = 0x0000_0002;
    /// 命令包地址必须 32 字节对齐
    pub const DCPP_ALIGN_MASK: u32 = 0x0000_001F;

    /// MISC_CTL: VME 系统控制器使能
    pub const MISC_SYSCON: u32 = 0x0002_0000;
    /// MISC_CTL: 发起 SYSRST 脉冲
    pub const MISC_SW_SYSRST: u32 = 0x0040_0000;
    /// MISC_CTL: 仲裁模式（优先级）
    pub const MISC_VARB_PRI: u32 = 0x0400_0000;

    /// MAST_CTL: 请求模式 demand/fair
    pub const MAST_REQ_MODE: u32 = 0x0020_0000;
    /// MAST_CTL: 释放模式 RWD/ROR
    pub const MAST_REL_MODE: u32 = 0x0010_0000;

    /// V_AMERR: 错误日志有效
    pub const AMERR_VALID: u32 = 0x0080_0000;
    /// V_AMERR: 发生过多个错误（日志丢失）
    pub const AMERR_MULTIPLE: u32 = 0x0100_0000;

    /// VCSR: SYSFAIL 线有效
    pub const VCSR_SYSFAIL: u32 = 0x4000_0000;

    /// VRAI_CTL: 使能 VME 侧寄存器访问窗口（A16/A24/A32，各种周期）
    pub const VRAI_CTL_ENABLE: u32 = 0x80F0_0000;

    /// 映像 CTL 复位值（窗口关闭，VDW = A32）
    pub const IMAGE_CTL_RESET: u32 = 0x0080_0000;
    /// 映像 CTL 数据宽度字段（D8/D16/D32/D64）
    pub const IMAGE_CTL_VDW_MASK: u32 = 0x00C0_0000;
    /// set_opt: 该位指示清除掩码位而非置位
    pub const OPT_CLEAR: u32 = 0x1000_0000;
}

/// 映像索引常数
pub const MAX_IMAGE: usize = 8;
/// 最大次设备号（0..7 主映像，8 控制，9 DMA，10..17 从映像）
pub const MAX_MINOR: usize = 17;
pub const CONTROL_MINOR: usize = 8;
pub const DMA_MINOR: usize = 9;

/// 单个从映像缓冲区/全局 DMA 缓冲区大小（128 KiB）
pub const PCI_BUF_SIZE: u32 = 0x20000;

/// 第 n 个映像的 CTL/BS/BD/TO 寄存器偏移。
///
/// 索引 0..7 为主映像（LSIx），10..17 为从映像（VSIx），8/9 不对应映像。
pub fn image_ctl(index: usize) -> u32 {
    image_base(index)
}

pub fn image_bs(index: usize) -> u32 {
    image_base(index) + 0x4
}

pub fn image_bd(index: usize) -> u32 {
    image_base(index) + 0x8
}

pub fn image_to(index: usize) -> u32 {
    image_base(index) + 0xC
}

fn image_base(index: usize) -> u32 {
    match index {
        0..=3 => offsets::LSI0_CTL + 0x14 * index as u32,
        4..=7 => offsets::LSI4_CTL + 0x14 * (index as u32 - 4),
        10..=13 => offsets::VSI0_CTL + 0x14 * (index as u32 - 10),
        14..=17 => offsets::VSI4_CTL + 0x14 * (index as u32 - 14),
        _ => panic!("image index {index} has no register bank"),
    }
}

/// VME 中断级 level (1..=7) 对应的 Status/ID 寄存器偏移
pub fn virq_statid(level: u8) -> u32 {
    debug_assert!((1..=7).contains(&level));
    offsets::V1_STATID + 4 * (level as u32 - 1)
}

/// n 号邮箱寄存器偏移 (0..=3)
pub fn mbox(n: usize) -> u32 {
    debug_assert!(n < 4);
    offsets::MBOX0 + 4 * n as u32
}
