//! 图片剥离策略
//!
//! 只保留最近 N 张图片；实际剥离数向下取整到批次大小的整数倍，使请求前缀在多轮之间保持稳定
//! （远端的前缀缓存才能命中）。因此超出 N 但不足一个批次的图片会被保留。

use crate::memory::conversation::{ContentBlock, ConversationTurn, ToolResultContent};

/// 图片以顶层块形式被删光时留下的占位文本
pub const IMAGE_PLACEHOLDER: &str = "[image omitted]";

/// 图片保留策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaRetention {
    /// 保留最近的图片数
    pub keep_recent: usize,
    /// 单次剥离的批次大小
    pub removal_batch: usize,
}

impl MediaRetention {
    pub fn new(keep_recent: usize, removal_batch: usize) -> Self {
        Self {
            keep_recent,
            removal_batch,
        }
    }

    /// 给定当前图片总数，返回应剥离的数量：(K - N) 向下取整到批次倍数
    pub fn removal_count(&self, total_images: usize) -> usize {
        let excess = total_images.saturating_sub(self.keep_recent);
        let batch = self.removal_batch.max(1);
        excess - excess % batch
    }
}

fn images_in_block(block: &ContentBlock) -> usize {
    match block {
        ContentBlock::Image { .. } => 1,
        ContentBlock::ToolResult { content, .. } => content
            .iter()
            .filter(|c| matches!(c, ToolResultContent::Image { .. }))
            .count(),
        _ => 0,
    }
}

/// 统计全部轮次中的图片数（顶层图片块 + tool_result 内的图片）
pub fn count_images(turns: &[ConversationTurn]) -> usize {
    turns
        .iter()
        .flat_map(|t| t.content.iter())
        .map(images_in_block)
        .sum()
}

/// 从最旧的轮次开始剥离 count 张图片，返回实际剥离数
pub fn strip_oldest_images(turns: &mut [ConversationTurn], count: usize) -> usize {
    let mut remaining = count;
    for turn in turns.iter_mut() {
        if remaining == 0 {
            break;
        }
        let before = remaining;
        let mut kept = Vec::with_capacity(turn.content.len());
        for block in turn.content.drain(..) {
            match block {
                ContentBlock::Image { .. } if remaining > 0 => {
                    remaining -= 1;
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    let content = content
                        .into_iter()
                        .filter(|c| {
                            if remaining > 0 && matches!(c, ToolResultContent::Image { .. }) {
                                remaining -= 1;
                                false
                            } else {
                                true
                            }
                        })
                        .collect();
                    kept.push(ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    });
                }
                other => kept.push(other),
            }
        }
        if kept.is_empty() && remaining < before {
            kept.push(ContentBlock::text(IMAGE_PLACEHOLDER));
        }
        turn.content = kept;
    }
    count - remaining
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::conversation::{ImageSource, Role};

    fn screenshot_turn(id: &str) -> ConversationTurn {
        ConversationTurn::new(
            Role::ToolResult,
            vec![ContentBlock::ToolResult {
                tool_use_id: id.to_string(),
                content: vec![
                    ToolResultContent::Text {
                        text: "took screenshot".to_string(),
                    },
                    ToolResultContent::Image {
                        source: ImageSource::png_base64("AAAA"),
                    },
                ],
                is_error: false,
            }],
        )
    }

    fn turns_with_images(k: usize) -> Vec<ConversationTurn> {
        (0..k).map(|i| screenshot_turn(&format!("t{i}"))).collect()
    }

    #[test]
    fn test_removal_count_rounds_down_to_batch() {
        let r = MediaRetention::new(3, 10);
        assert_eq!(r.removal_count(3), 0);
        assert_eq!(r.removal_count(12), 0); // 超出 9 张，不足一个批次
        assert_eq!(r.removal_count(13), 10);
        assert_eq!(r.removal_count(25), 20);
    }

    #[test]
    fn test_removal_count_zero_batch_treated_as_one() {
        let r = MediaRetention::new(2, 0);
        assert_eq!(r.removal_count(5), 3);
    }

    #[test]
    fn test_remaining_images_match_formula() {
        for (k, n, t) in [(3, 2, 1), (13, 3, 10), (25, 3, 10), (7, 2, 2), (9, 9, 4)] {
            let mut turns = turns_with_images(k);
            let r = MediaRetention::new(n, t);
            let removed = strip_oldest_images(&mut turns, r.removal_count(k));
            let expected_left = k - ((k - n.min(k)) / t) * t;
            assert_eq!(count_images(&turns), expected_left, "k={k} n={n} t={t}");
            assert_eq!(removed % t, 0);
        }
    }

    #[test]
    fn test_oldest_images_go_first_and_text_survives() {
        let mut turns = turns_with_images(3);
        strip_oldest_images(&mut turns, 1);
        assert_eq!(images_in_block(&turns[0].content[0]), 0);
        assert_eq!(images_in_block(&turns[2].content[0]), 1);
        match &turns[0].content[0] {
            ContentBlock::ToolResult { content, .. } => {
                assert_eq!(content.len(), 1);
                assert!(matches!(&content[0], ToolResultContent::Text { text } if text == "took screenshot"));
            }
            other => panic!("unexpected block {other:?}"),
        }
    }

    #[test]
    fn test_top_level_image_only_turn_gets_placeholder() {
        let mut turns = vec![ConversationTurn::new(
            Role::User,
            vec![ContentBlock::Image {
                source: ImageSource::png_base64("AAAA"),
            }],
        )];
        assert_eq!(strip_oldest_images(&mut turns, 1), 1);
        assert_eq!(turns[0].text(), IMAGE_PLACEHOLDER);
    }
}
