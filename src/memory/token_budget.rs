//! Token 预算：本地估算器与逐轮 token 账本
//!
//! 远端返回 usage 时按实际值记账；没有 usage 的轮次记为 0，依赖定期的远端计数校准。

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量
    /// 使用简单的启发式规则：英文约 4 字符/token，中文约 1.5 字符/token
    pub fn estimate(text: &str) -> u64 {
        let mut ascii_chars: u64 = 0;
        let mut non_ascii_chars: u64 = 0;

        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }

        // 中文按 1.5 字符/token，向上取整：ceil(n / 1.5) = ceil(2n / 3)
        let tokens = ascii_chars / 4 + (non_ascii_chars * 2).div_ceil(3);
        tokens.max(1)
    }
}

/// 逐轮 token 账本：与历史轮次一一对应，外加 system 基线
#[derive(Debug, Clone, Default)]
pub struct TokenLedger {
    baseline: u64,
    costs: Vec<u64>,
}

impl TokenLedger {
    pub fn set_baseline(&mut self, tokens: u64) {
        self.baseline = tokens;
    }

    pub fn baseline(&self) -> u64 {
        self.baseline
    }

    /// 总量 = 基线 + 各轮成本
    pub fn total(&self) -> u64 {
        self.baseline + self.costs.iter().sum::<u64>()
    }

    pub fn push(&mut self, cost: u64) {
        self.costs.push(cost);
    }

    pub fn add_to(&mut self, index: usize, amount: u64) {
        if let Some(c) = self.costs.get_mut(index) {
            *c += amount;
        }
    }

    /// 无法归到任何轮次的输入（历史为空时）计入基线
    pub fn add_unattributed(&mut self, amount: u64) {
        self.baseline += amount;
    }

    /// 删除最前面 n 轮的成本，返回删除的总量
    pub fn remove_front(&mut self, n: usize) -> u64 {
        let n = n.min(self.costs.len());
        self.costs.drain(..n).sum()
    }

    pub fn replace(&mut self, index: usize, cost: u64) {
        if let Some(c) = self.costs.get_mut(index) {
            *c = cost;
        }
    }

    /// 用远端计数结果校准：差值记到最后一轮（没有轮次时调整基线）
    pub fn calibrate(&mut self, measured: u64) {
        let current = self.total();
        match self.costs.last_mut() {
            Some(last) if measured >= current => *last += measured - current,
            Some(last) => *last = last.saturating_sub(current - measured),
            None => self.baseline = measured,
        }
    }
}
