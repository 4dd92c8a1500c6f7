//! 驱动配置
//!
//! 对应原生驱动的模块参数。越界的字段在芯片初始化时记录警告并
//! 退回默认值，而不是让整个驱动加载失败。

use serde::{Deserialize, Serialize};

/// 桥接芯片初始化配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// 作为 VME 系统控制器工作
    pub sys_ctrl: bool,
    /// VME 总线请求级别 BR0..BR3
    pub br_level: u8,
    /// 请求模式：false = demand，true = fair
    pub req_mode: bool,
    /// 释放模式：false = RWD（做完即放），true = ROR
    pub rel_mode: bool,
    /// 从 VME 一侧访问桥寄存器的基地址，0 表示禁用；低 12 位必须为零
    pub vrai_bs: u32,
    /// VME 总线超时档位 0..7
    pub vbto: u8,
    /// 仲裁模式：0 = round-robin，1 = 优先级
    pub varb: u8,
    /// 仲裁超时档位 0..2
    pub varbto: u8,
    /// 允许映像地址范围重叠
    pub img_ovl: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            sys_ctrl: true,
            br_level: 3,
            req_mode: false,
            rel_mode: false,
            vrai_bs: 0,
            vbto: 3,
            varb: 0,
            varbto: 1,
            img_ovl: true,
        }
    }
}

/// 模型内存布局：主映像窗口可分配的 PCI 区域与 DMA 相干内存基址
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryLayout {
    /// 主映像物理窗口分配区起点
    pub window_base: u32,
    /// 分配区大小
    pub window_size: u32,
    /// 相干缓冲区（DMA 池、从映像缓冲区、命令包区）基址
    pub coherent_base: u32,
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self {
            window_base: 0x8000_0000,
            window_size: 0x2000_0000,
            coherent_base: 0x4000_0000,
        }
    }
}
