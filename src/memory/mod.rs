//! 记忆层：对话历史（History Manager）、token 账本、图片剥离策略

pub mod conversation;
pub mod media;
pub mod token_budget;

pub use conversation::{
    ContentBlock, ConversationTurn, History, ImageSource, Role, ToolResultContent,
    TruncationReport, Usage, WireMessage, WireRole, TRUNCATION_NOTICE, TRUNCATION_NOTICE_TOKENS,
};
pub use media::{MediaRetention, IMAGE_PLACEHOLDER};
pub use token_budget::{TokenEstimator, TokenLedger};
