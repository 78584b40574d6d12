//! Token 用量账本
//!
//! 显式上下文对象：每次模型调用记录一条，随调用链传递，不使用进程级全局状态。

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::memory::Usage;

/// 单次模型调用的用量
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub iteration: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
}

/// 累计用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageTotals {
    pub calls: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
}

impl UsageTotals {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_read_input_tokens
            + self.cache_creation_input_tokens
    }
}

#[derive(Debug, Default)]
pub struct UsageLedger {
    records: Mutex<Vec<UsageRecord>>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, model: &str, iteration: usize, usage: &Usage) -> UsageRecord {
        let record = UsageRecord {
            timestamp: Utc::now(),
            model: model.to_string(),
            iteration,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_read_input_tokens: usage.cache_read_input_tokens.unwrap_or(0),
            cache_creation_input_tokens: usage.cache_creation_input_tokens.unwrap_or(0),
        };
        tracing::info!(
            model = %record.model,
            iteration,
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            cache_read = record.cache_read_input_tokens,
            cache_creation = record.cache_creation_input_tokens,
            "token usage"
        );
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
        record
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn totals(&self) -> UsageTotals {
        let records = self.records();
        records.iter().fold(UsageTotals::default(), |mut acc, r| {
            acc.calls += 1;
            acc.input_tokens += r.input_tokens;
            acc.output_tokens += r.output_tokens;
            acc.cache_read_input_tokens += r.cache_read_input_tokens;
            acc.cache_creation_input_tokens += r.cache_creation_input_tokens;
            acc
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals_accumulate() {
        let ledger = UsageLedger::new();
        ledger.record(
            "m",
            1,
            &Usage {
                input_tokens: 10,
                output_tokens: 5,
                cache_read_input_tokens: Some(3),
                cache_creation_input_tokens: None,
            },
        );
        ledger.record(
            "m",
            2,
            &Usage {
                input_tokens: 1,
                output_tokens: 2,
                ..Default::default()
            },
        );
        let totals = ledger.totals();
        assert_eq!(totals.calls, 2);
        assert_eq!(totals.input_tokens, 11);
        assert_eq!(totals.output_tokens, 7);
        assert_eq!(totals.total_tokens(), 21);
        assert_eq!(ledger.records()[1].iteration, 2);
    }
}
