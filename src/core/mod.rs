//! 核心编排层：错误与恢复、过程事件、采样主控循环

pub mod error;
pub mod events;
pub mod orchestrator;
pub mod recovery;

pub use error::{AgentError, RecoveryAction};
pub use events::{EventSink, LoopEvent};
pub use orchestrator::{SamplingOutcome, SamplingSession, SamplingSettings};
pub use recovery::{Backoff, RetryPolicy};
