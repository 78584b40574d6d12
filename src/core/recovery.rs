//! 限流退避
//!
//! 连续限流失败的等待时间按 base·2^(n-1) 翻倍，封顶 max_delay；成功响应后计数清零。
//! 非限流错误不重试。

use std::time::Duration;

use crate::core::RecoveryAction;
use crate::llm::LlmError;

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 连续限流的最大重试次数；None 表示不限次数（仍受 max_delay 约束）
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// 第 attempt 次连续失败后的等待时间（attempt 从 1 开始）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// 连续限流计数器
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    consecutive: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            consecutive: 0,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }

    /// 成功响应后清零
    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    /// 根据错误决定重试或终止；只有限流错误会递增计数
    pub fn next_action(&mut self, err: &LlmError) -> RecoveryAction {
        if !err.is_rate_limit() {
            return RecoveryAction::Abort;
        }
        if self
            .policy
            .max_attempts
            .is_some_and(|max| self.consecutive >= max)
        {
            return RecoveryAction::Abort;
        }
        self.consecutive += 1;
        RecoveryAction::RetryAfter(self.policy.delay_for(self.consecutive))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: Option<u32>) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            max_attempts,
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let p = policy(None);
        assert_eq!(p.delay_for(1), Duration::from_secs(2));
        assert_eq!(p.delay_for(2), Duration::from_secs(4));
        assert_eq!(p.delay_for(5), Duration::from_secs(32));
        assert_eq!(p.delay_for(6), Duration::from_secs(60));
        assert_eq!(p.delay_for(1000), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_sequence_and_reset() {
        let mut b = Backoff::new(policy(None));
        let rl = LlmError::RateLimited("busy".into());
        assert_eq!(b.next_action(&rl), RecoveryAction::RetryAfter(Duration::from_secs(2)));
        assert_eq!(b.next_action(&rl), RecoveryAction::RetryAfter(Duration::from_secs(4)));
        b.reset();
        assert_eq!(b.next_action(&rl), RecoveryAction::RetryAfter(Duration::from_secs(2)));
    }

    #[test]
    fn test_non_rate_limit_aborts_without_counting() {
        let mut b = Backoff::new(policy(None));
        let err = LlmError::Api {
            status: 500,
            message: "boom".into(),
        };
        assert_eq!(b.next_action(&err), RecoveryAction::Abort);
        assert_eq!(b.consecutive_failures(), 0);
    }

    #[test]
    fn test_max_attempts() {
        let mut b = Backoff::new(policy(Some(2)));
        let rl = LlmError::RateLimited("busy".into());
        assert!(matches!(b.next_action(&rl), RecoveryAction::RetryAfter(_)));
        assert!(matches!(b.next_action(&rl), RecoveryAction::RetryAfter(_)));
        assert_eq!(b.next_action(&rl), RecoveryAction::Abort);
    }
}
