//! 会话监管：中断管理
//!
//! 每个回合开始时换一个新的 CancellationToken；用户 Cancel（Ctrl+C）只取消当前回合，
//! 下一个回合不受影响。

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// 会话级取消令牌（可在多个任务间克隆共享）
#[derive(Debug, Clone, Default)]
pub struct SessionSupervisor {
    current: Arc<Mutex<CancellationToken>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为新回合换一个新令牌并返回
    pub fn begin_turn(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *current = token.clone();
        token
    }

    /// 触发取消（用户 Ctrl+C）
    pub fn cancel(&self) {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
    }
}
