//! 阻塞等待原语
//!
//! 每个事件源（DMA 完成、某个 (级别, Status/ID) 组合、邮箱、IACK）
//! 各占一个 `WaitSlot`。调用线程在槽上挂起；中断处理函数通过
//! `notify` 唤醒，唤醒对单次等待恰好一次。超时与唤醒竞争时只有
//! 一条恢复路径生效，两条退出路径都会把槽位还原成可复用状态。

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{BridgeError, Result};

/// 等待结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// 被中断处理函数唤醒
    Woken,
    /// 计时器先到期
    TimedOut,
}

#[derive(Debug, Default)]
struct WaitState {
    signaled: bool,
    waiting: bool,
}

/// 单等待者事件槽
#[derive(Debug, Default)]
pub struct WaitSlot {
    state: Mutex<WaitState>,
    cond: Condvar,
}

impl WaitSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从中断上下文唤醒等待者。不阻塞、不分配。
    ///
    /// 唤醒只对正在进行的等待生效；没有等待者时信号被丢弃。
    pub fn notify(&self) {
        let mut state = self.state.lock();
        if state.waiting {
            state.signaled = true;
            self.cond.notify_one();
        }
    }

    /// 阻塞直到被唤醒或超时。`timeout` 为 None 表示无限等待。
    ///
    /// `arm` 在注册等待之后、挂起之前执行，用于触发硬件动作
    /// （使能中断位、写启动寄存器），保证动作与等待之间没有
    /// 丢失唤醒的窗口。
    pub fn wait_with<F: FnOnce()>(&self, timeout: Option<Duration>, arm: F) -> Result<WaitOutcome> {
        let mut state = self.state.lock();
        if state.waiting {
            return Err(BridgeError::ResourceBusy("wait slot already occupied"));
        }
        state.signaled = false;
        state.waiting = true;

        arm();

        let deadline = timeout.map(|t| Instant::now() + t);
        let outcome = loop {
            if state.signaled {
                break WaitOutcome::Woken;
            }
            match deadline {
                Some(d) => {
                    if self.cond.wait_until(&mut state, d).timed_out() && !state.signaled {
                        break WaitOutcome::TimedOut;
                    }
                }
                None => self.cond.wait(&mut state),
            }
        };

        state.signaled = false;
        state.waiting = false;
        Ok(outcome)
    }

    /// 不带硬件动作的等待
    pub fn wait(&self, timeout: Option<Duration>) -> Result<WaitOutcome> {
        self.wait_with(timeout, || {})
    }

    /// 同 `wait_with`，但 `arm` 返回 false 表示事件在挂起前已经
    /// 发生，直接按被唤醒处理，不再睡眠。注册先于 `arm` 执行，
    /// `arm` 检查之后到来的唤醒不会丢失。
    pub fn wait_unless<F: FnOnce() -> bool>(
        &self,
        timeout: Option<Duration>,
        arm: F,
    ) -> Result<WaitOutcome> {
        let mut state = self.state.lock();
        if state.waiting {
            return Err(BridgeError::ResourceBusy("wait slot already occupied"));
        }
        state.signaled = false;
        state.waiting = true;

        if !arm() {
            state.signaled = false;
            state.waiting = false;
            return Ok(WaitOutcome::Woken);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let outcome = loop {
            if state.signaled {
                break WaitOutcome::Woken;
            }
            match deadline {
                Some(d) => {
                    if self.cond.wait_until(&mut state, d).timed_out() && !state.signaled {
                        break WaitOutcome::TimedOut;
                    }
                }
                None => self.cond.wait(&mut state),
            }
        };

        state.signaled = false;
        state.waiting = false;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wake_beats_timeout() {
        let slot = Arc::new(WaitSlot::new());
        let waker = Arc::clone(&slot);
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.notify();
        });
        let outcome = slot.wait(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(outcome, WaitOutcome::Woken);
        h.join().unwrap();
    }

    #[test]
    fn timeout_leaves_slot_reusable() {
        let slot = Arc::new(WaitSlot::new());
        let outcome = slot.wait(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);

        // 超时后槽位必须可以再次等待并正常被唤醒
        let waker = Arc::clone(&slot);
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.notify();
        });
        let outcome = slot.wait(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(outcome, WaitOutcome::Woken);
        h.join().unwrap();
    }

    #[test]
    fn stale_notify_does_not_satisfy_next_wait() {
        let slot = WaitSlot::new();
        slot.notify();
        let outcome = slot.wait(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[test]
    fn wait_unless_skips_sleep_when_event_already_there() {
        let slot = WaitSlot::new();
        let outcome = slot
            .wait_unless(Some(Duration::from_secs(5)), || false)
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Woken);

        // arm 返回 true 时照常等待并可超时
        let outcome = slot
            .wait_unless(Some(Duration::from_millis(10)), || true)
            .unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }
}
