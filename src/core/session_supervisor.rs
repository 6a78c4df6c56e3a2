//! 会话监管：取消令牌
//!
//! 每个会话一个 SessionSupervisor；cancel() 中止进行中的委派链，下一条消息到来时 begin_turn() 换上新令牌。

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// 会话级取消管理
#[derive(Debug)]
pub struct SessionSupervisor {
    cancel_token: RwLock<CancellationToken>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            cancel_token: RwLock::new(CancellationToken::new()),
        }
    }

    /// 触发取消（客户端发送 cancel）
    pub async fn cancel(&self) {
        self.cancel_token.read().await.cancel();
    }

    /// 开始新一轮处理：若上一令牌已取消则替换为新令牌，返回本轮使用的令牌
    pub async fn begin_turn(&self) -> CancellationToken {
        let mut token = self.cancel_token.write().await;
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        token.clone()
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_then_fresh_token() {
        let sup = SessionSupervisor::new();
        let first = sup.begin_turn().await;
        sup.cancel().await;
        assert!(first.is_cancelled());

        let second = sup.begin_turn().await;
        assert!(!second.is_cancelled());
        // 未取消时沿用同一令牌
        let third = sup.begin_turn().await;
        sup.cancel().await;
        assert!(second.is_cancelled() && third.is_cancelled());
    }
}
