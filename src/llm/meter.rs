//! LLM token 计量：把客户端的累计统计转成每次调用后的增量，扣进运行预算

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::llm::LlmClient;

pub struct UsageMeter {
    client: Arc<dyn LlmClient>,
    seen: AtomicU64,
}

impl UsageMeter {
    /// 从客户端当前累计值开始计量
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        let (_, _, total) = client.token_usage();
        Self {
            client,
            seen: AtomicU64::new(total),
        }
    }

    /// 自上次 take 以来新增的 total tokens
    pub fn take(&self) -> u64 {
        let (_, _, total) = self.client.token_usage();
        let previous = self.seen.swap(total, Ordering::SeqCst);
        total.saturating_sub(previous)
    }
}

impl std::fmt::Debug for UsageMeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageMeter")
            .field("seen", &self.seen.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Message, ScriptedLlmClient};

    #[tokio::test]
    async fn test_take_returns_increments() {
        let llm = Arc::new(ScriptedLlmClient::new(["a", "b"]).with_tokens_per_reply(7));
        llm.complete(&[Message::user("warm up")]).await.unwrap();
        let meter = UsageMeter::new(llm.clone());
        assert_eq!(meter.take(), 0);
        llm.complete(&[Message::user("x")]).await.unwrap();
        assert_eq!(meter.take(), 7);
        assert_eq!(meter.take(), 0);
    }
}
