//! 驱动统一错误类型

use thiserror::Error;

/// 桥接驱动的所有失败结果
///
/// 中断上下文代码从不返回错误，只记录日志与计数；
/// 这里的错误均由同步请求路径返回给直接调用者。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// 资源已被其他调用者占用（DMA 通道、等待槽）
    #[error("resource busy: {0}")]
    ResourceBusy(&'static str),

    /// 没有空闲槽位或物理资源不足
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// 参数越界或与目标状态不符
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// 与既有配置冲突（映像重叠、IRQ 槽已注册）
    #[error("conflict: {0}")]
    Conflict(&'static str),

    /// 硬件故障（总线错误、DMA 错误、映射失败）
    #[error("hardware fault: {0}")]
    HardwareFault(&'static str),

    /// 等待超时
    #[error("timed out")]
    TimedOut,

    /// 链式 DMA 部分失败，记录第一个未处理命令包的序号（从 1 起）
    #[error("chain stopped at packet {segment}")]
    PartialFailure { segment: usize },
}

pub type Result<T> = core::result::Result<T, BridgeError>;
