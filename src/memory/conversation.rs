//! 短期记忆：对话历史（History Manager）
//!
//! 按时间顺序保存 ConversationTurn，维护逐轮 token 账本；请求前由 truncate 按上下文窗口预算
//! 从最前面整轮删除，evict_media 按批次剥离旧图片。serialize 只读地投影为线上格式。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::media::{self, MediaRetention};
use crate::memory::token_budget::TokenLedger;

/// 截断后插入最前面的提示文本
pub const TRUNCATION_NOTICE: &str = "[Earlier history has been truncated.]";
/// 截断提示本身计入的 token 数
pub const TRUNCATION_NOTICE_TOKENS: u64 = 25;

/// 轮次角色：用户输入 / 助手回复 / 工具结果
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    ToolResult,
}

impl Role {
    /// 线上角色：工具结果以 user 身份发送
    pub fn wire_role(self) -> WireRole {
        match self {
            Role::Assistant => WireRole::Assistant,
            Role::User | Role::ToolResult => WireRole::User,
        }
    }
}

/// 线上格式只有 user / assistant 两种角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireRole {
    User,
    Assistant,
}

/// base64 图片数据
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub kind: String,
    pub media_type: String,
    pub data: String,
}

impl ImageSource {
    pub fn png_base64(data: impl Into<String>) -> Self {
        Self {
            kind: "base64".to_string(),
            media_type: "image/png".to_string(),
            data: data.into(),
        }
    }
}

/// tool_result 内部的内容块
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResultContent {
    Text { text: String },
    Image { source: ImageSource },
}

/// 一轮中的内容块：文本 / 工具调用 / 工具结果 / 图片
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Vec<ToolResultContent>,
        #[serde(default)]
        is_error: bool,
    },
    Image {
        source: ImageSource,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, ContentBlock::Image { .. })
    }
}

/// 远端返回的用量统计
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
}

impl Usage {
    /// 本次请求的完整输入 token（含缓存读写部分）
    pub fn prompt_tokens(&self) -> u64 {
        self.input_tokens
            + self.cache_read_input_tokens.unwrap_or(0)
            + self.cache_creation_input_tokens.unwrap_or(0)
    }
}

/// 单轮对话
#[derive(Clone, Debug, PartialEq)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub usage: Option<Usage>,
}

impl ConversationTurn {
    pub fn new(role: Role, content: Vec<ContentBlock>) -> Self {
        Self {
            role,
            content,
            usage: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentBlock::text(text)])
    }

    /// 本轮中所有文本块拼接
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn is_truncation_notice(&self) -> bool {
        self.role == Role::User
            && matches!(self.content.as_slice(), [ContentBlock::Text { text }] if text == TRUNCATION_NOTICE)
    }
}

/// 线上消息：{role, content}
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: WireRole,
    pub content: Vec<ContentBlock>,
}

/// 单次 truncate 的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TruncationReport {
    pub removed_turns: usize,
    pub tokens_after: u64,
    /// 已无可删轮次但仍超出预算
    pub still_over_budget: bool,
}

/// 对话历史：轮次 + token 账本 + 上下文窗口预算
#[derive(Clone, Debug)]
pub struct History {
    turns: Vec<ConversationTurn>,
    ledger: TokenLedger,
    context_window_tokens: u64,
}

impl History {
    pub fn new(context_window_tokens: u64) -> Self {
        Self {
            turns: Vec::new(),
            ledger: TokenLedger::default(),
            context_window_tokens,
        }
    }

    /// 设置 system prompt 的 token 基线（在首轮之前调用）
    pub fn with_baseline(mut self, system_tokens: u64) -> Self {
        self.ledger.set_baseline(system_tokens);
        self
    }

    /// 从线上格式重建：仅含 tool_result 块的 user 消息还原为 ToolResult 轮
    pub fn from_wire(messages: &[WireMessage], context_window_tokens: u64) -> Self {
        let mut history = Self::new(context_window_tokens);
        for m in messages {
            let role = match m.role {
                WireRole::Assistant => Role::Assistant,
                WireRole::User => {
                    let all_results = !m.content.is_empty()
                        && m
                            .content
                            .iter()
                            .all(|b| matches!(b, ContentBlock::ToolResult { .. }));
                    if all_results {
                        Role::ToolResult
                    } else {
                        Role::User
                    }
                }
            };
            history.add_turn(role, m.content.clone(), None);
        }
        history
    }

    /// 追加一轮；助手轮若带 usage，则把本次新增输入归到前一轮、输出归到本轮
    pub fn add_turn(&mut self, role: Role, content: Vec<ContentBlock>, usage: Option<Usage>) {
        let output_cost = match (&usage, role) {
            (Some(u), Role::Assistant) => {
                let delta = u.prompt_tokens().saturating_sub(self.ledger.total());
                match self.turns.len().checked_sub(1) {
                    Some(prev) => self.ledger.add_to(prev, delta),
                    None => self.ledger.add_unattributed(delta),
                }
                u.output_tokens
            }
            _ => 0,
        };
        self.turns.push(ConversationTurn {
            role,
            content,
            usage,
        });
        self.ledger.push(output_cost);
    }

    pub fn add_text(&mut self, role: Role, text: impl Into<String>) {
        self.add_turn(role, vec![ContentBlock::text(text)], None);
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn context_window_tokens(&self) -> u64 {
        self.context_window_tokens
    }

    /// 当前估算的总 token（含 system 基线）
    pub fn estimated_tokens(&self) -> u64 {
        self.ledger.total()
    }

    /// 用远端计数结果校准账本
    pub fn calibrate(&mut self, measured_tokens: u64) {
        self.ledger.calibrate(measured_tokens);
    }

    /// 投影为线上格式（纯函数，不修改历史）
    pub fn serialize(&self) -> Vec<WireMessage> {
        self.turns
            .iter()
            .map(|t| WireMessage {
                role: t.role.wire_role(),
                content: t.content.clone(),
            })
            .collect()
    }

    /// 超出上下文预算时，从最前面成对删除轮次，并用截断提示替换新的首轮。
    /// 最近一次 user 侧轮次（用户输入或工具结果）永不删除。
    pub fn truncate(&mut self) -> TruncationReport {
        let mut report = TruncationReport::default();
        while self.ledger.total() > self.context_window_tokens {
            let Some(protected) = self.last_user_side_index() else {
                break;
            };
            // 删除 [0, 1]，原第 2 轮成为新的首轮并被提示替换，因此它也必须在保护轮之前
            if protected <= 2 {
                break;
            }
            self.turns.drain(..2);
            self.ledger.remove_front(2);
            report.removed_turns += 2;

            if !self.turns.first().is_some_and(|t| t.is_truncation_notice()) {
                self.turns[0] = ConversationTurn::user(TRUNCATION_NOTICE);
                self.ledger.replace(0, TRUNCATION_NOTICE_TOKENS);
                report.removed_turns += 1;
            }
        }
        report.tokens_after = self.ledger.total();
        report.still_over_budget = report.tokens_after > self.context_window_tokens;
        if report.removed_turns > 0 {
            tracing::info!(
                removed = report.removed_turns,
                tokens_after = report.tokens_after,
                budget = self.context_window_tokens,
                "history truncated"
            );
        }
        if report.still_over_budget {
            tracing::warn!(
                tokens = report.tokens_after,
                budget = self.context_window_tokens,
                "history still over budget, nothing left to truncate"
            );
        }
        report
    }

    /// 按批次剥离最旧的图片，返回剥离数量
    pub fn evict_media(&mut self, retention: &MediaRetention) -> usize {
        let total = media::count_images(&self.turns);
        let to_remove = retention.removal_count(total);
        if to_remove == 0 {
            return 0;
        }
        let removed = media::strip_oldest_images(&mut self.turns, to_remove);
        tracing::debug!(total, removed, keep = retention.keep_recent, "evicted images");
        removed
    }

    /// 取出全部轮次（返回给调用方的完整记录）
    pub fn into_turns(self) -> Vec<ConversationTurn> {
        self.turns
    }

    fn last_user_side_index(&self) -> Option<usize> {
        self.turns
            .iter()
            .rposition(|t| t.role.wire_role() == WireRole::User)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn usage(input: u64, output: u64) -> Usage {
        Usage {
            input_tokens: input,
            output_tokens: output,
            ..Default::default()
        }
    }

    fn tool_use(id: &str) -> ContentBlock {
        ContentBlock::ToolUse {
            id: id.to_string(),
            name: "think".to_string(),
            input: json!({"thought": "x"}),
        }
    }

    fn tool_result(id: &str) -> ContentBlock {
        ContentBlock::ToolResult {
            tool_use_id: id.to_string(),
            content: vec![ToolResultContent::Text {
                text: "ok".to_string(),
            }],
            is_error: false,
        }
    }

    #[test]
    fn test_usage_attribution() {
        let mut h = History::new(1000).with_baseline(10);
        h.add_text(Role::User, "hi");
        h.add_turn(Role::Assistant, vec![ContentBlock::text("hello")], Some(usage(50, 7)));
        // 50 输入中 10 是基线，40 归到用户轮；7 输出归到助手轮
        assert_eq!(h.estimated_tokens(), 57);
    }

    #[test]
    fn test_cache_tokens_count_as_input() {
        let mut h = History::new(1000);
        h.add_text(Role::User, "hi");
        let u = Usage {
            input_tokens: 5,
            output_tokens: 1,
            cache_creation_input_tokens: Some(20),
            cache_read_input_tokens: Some(30),
        };
        h.add_turn(Role::Assistant, vec![ContentBlock::text("a")], Some(u));
        assert_eq!(h.estimated_tokens(), 56);
    }

    #[test]
    fn test_truncate_under_budget_is_noop() {
        let mut h = History::new(1000);
        h.add_text(Role::User, "hi");
        h.add_turn(Role::Assistant, vec![ContentBlock::text("a")], Some(usage(100, 10)));
        let report = h.truncate();
        assert_eq!(report.removed_turns, 0);
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn test_truncate_drops_oldest_pair_and_inserts_notice() {
        let mut h = History::new(150);
        h.add_text(Role::User, "start");
        h.add_turn(Role::Assistant, vec![tool_use("1")], Some(usage(60, 10)));
        h.add_turn(Role::ToolResult, vec![tool_result("1")], None);
        h.add_turn(Role::Assistant, vec![tool_use("2")], Some(usage(100, 10)));
        h.add_turn(Role::ToolResult, vec![tool_result("2")], None);
        assert_eq!(h.estimated_tokens(), 110);
        h.add_turn(Role::Assistant, vec![tool_use("3")], Some(usage(160, 10)));
        h.add_turn(Role::ToolResult, vec![tool_result("3")], None);
        assert!(h.estimated_tokens() > 150);

        let report = h.truncate();
        assert!(report.removed_turns >= 3);
        let first = &h.turns()[0];
        assert_eq!(first.role, Role::User);
        assert_eq!(first.text(), TRUNCATION_NOTICE);
        // 最后的工具结果轮始终保留
        assert_eq!(h.turns().last().map(|t| t.role), Some(Role::ToolResult));
        assert!(h.estimated_tokens() <= 150);
    }

    #[test]
    fn test_truncate_never_removes_latest_user_side_turn() {
        let mut h = History::new(10);
        h.add_text(Role::User, "only turn");
        h.add_turn(Role::Assistant, vec![ContentBlock::text("a")], Some(usage(500, 500)));
        h.add_text(Role::User, "follow up");
        let report = h.truncate();
        assert_eq!(report.removed_turns, 0);
        assert!(report.still_over_budget);
        assert_eq!(h.len(), 3);
    }

    #[test]
    fn test_evict_media_keeps_recent_images() {
        let mut history = History::new(180_000);
        history.add_turn(
            Role::User,
            vec![
                ContentBlock::Image {
                    source: ImageSource::png_base64("AAAA"),
                },
            ],
            None,
        );
        for i in 0..4 {
            history.add_turn(
                Role::ToolResult,
                vec![ContentBlock::ToolResult {
                    tool_use_id: format!("s{i}"),
                    content: vec![ToolResultContent::Image {
                        source: ImageSource::png_base64("AAAA"),
                    }],
                    is_error: false,
                }],
                None,
            );
        }

        // 5 张，保留 1，批次 3：剥离 3 张（最旧的顶层图片 + 前两次截图）
        let retention = MediaRetention::new(1, 3);
        assert_eq!(history.evict_media(&retention), 3);
        assert_eq!(
            history.turns()[0].content,
            vec![ContentBlock::text(crate::memory::IMAGE_PLACEHOLDER)]
        );
        assert_eq!(media::count_images(history.turns()), 2);
        // 剩余超出 1 张，不足一个批次
        assert_eq!(history.evict_media(&retention), 0);
        assert_eq!(history.len(), 5);
    }

    #[test]
    fn test_serialize_maps_tool_results_to_user() {
        let mut h = History::new(1000);
        h.add_text(Role::User, "hi");
        h.add_turn(Role::Assistant, vec![tool_use("t1")], None);
        h.add_turn(Role::ToolResult, vec![tool_result("t1")], None);
        let wire = h.serialize();
        let roles: Vec<WireRole> = wire.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![WireRole::User, WireRole::Assistant, WireRole::User]);
    }

    #[test]
    fn test_round_trip_through_wire() {
        let mut h = History::new(1000);
        h.add_text(Role::User, "hi");
        h.add_turn(
            Role::Assistant,
            vec![ContentBlock::text("checking"), tool_use("t1")],
            Some(usage(10, 3)),
        );
        h.add_turn(Role::ToolResult, vec![tool_result("t1")], None);
        h.add_turn(Role::Assistant, vec![ContentBlock::text("done")], None);

        let wire = h.serialize();
        let json = serde_json::to_string(&wire).unwrap();
        let parsed: Vec<WireMessage> = serde_json::from_str(&json).unwrap();
        let rebuilt = History::from_wire(&parsed, 1000);

        assert_eq!(rebuilt.serialize(), wire);
        let roles: Vec<Role> = rebuilt.turns().iter().map(|t| t.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::ToolResult, Role::Assistant]
        );
    }

    #[test]
    fn test_wire_json_shape() {
        let block = tool_result("abc");
        let v = serde_json::to_value(&block).unwrap();
        assert_eq!(v["type"], "tool_result");
        assert_eq!(v["tool_use_id"], "abc");
        assert_eq!(v["content"][0]["type"], "text");
        assert_eq!(v["is_error"], false);
    }
}
