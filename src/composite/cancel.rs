//! # 取消信号
//!
//! 基于 `tokio::sync::watch` 的可克隆取消令牌：
//! - `is_cancelled` 供 worker 在领取新任务前同步检查
//! - `cancelled` 供 `tokio::select!` 与在途的下载/渲染调用竞争，信号触发后在途 future 被丢弃

use std::sync::Arc;

use tokio::sync::watch;

/// 请求级取消令牌，克隆后共享同一信号。
#[derive(Debug, Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// 触发取消，重复调用无副作用。
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// 等待取消信号。未触发前一直挂起。
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // sender 由自身持有，wait_for 只会在信号为 true 时返回
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}
