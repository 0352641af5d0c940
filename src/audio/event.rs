//! 手动复位事件
//!
//! set 之后保持有信号，直到 reset。等待者用带超时的 wait，
//! 渲染器用它做两件事：flush 打断正在睡眠的 push/finish，
//! 以及通知"设备缓冲区已填满"。

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
pub struct ManualResetEvent {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl ManualResetEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut signaled = self.signaled.lock();
        if !*signaled {
            *signaled = true;
            self.cond.notify_all();
        }
    }

    pub fn reset(&self) {
        *self.signaled.lock() = false;
    }

    /// 不阻塞地查询状态
    pub fn check(&self) -> bool {
        *self.signaled.lock()
    }

    /// 等待最多 `timeout`，返回事件是否有信号
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut signaled = self.signaled.lock();
        if !*signaled {
            // 虚假唤醒时按剩余时间继续等
            let deadline = std::time::Instant::now() + timeout;
            while !*signaled {
                if self.cond.wait_until(&mut signaled, deadline).timed_out() {
                    break;
                }
            }
        }
        *signaled
    }
}

impl std::fmt::Debug for ManualResetEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualResetEvent")
            .field("signaled", &self.check())
            .finish()
    }
}
