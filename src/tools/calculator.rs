//! 计算器：两个数的四则运算、乘方与开方
//!
//! calculate 同时供本地 CalculatorTool 与 hive-calculator（stdio 工具提供方）使用。

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::schema::input_schema;
use crate::tools::{Tool, ToolOutput};

pub const CALCULATOR_DESCRIPTION: &str = "Performs basic calculations with two numbers. \
     Supported operators: +, -, *, /, ^, sqrt (sqrt uses number1 only).";

/// 计算器参数
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct CalculatorArgs {
    /// First number in the calculation
    pub number1: f64,
    /// Second number in the calculation
    #[serde(default)]
    pub number2: f64,
    /// Operation symbol: +, -, *, /, ^, sqrt
    pub operator: String,
}

pub fn calculator_schema() -> Value {
    input_schema::<CalculatorArgs>()
}

/// 执行计算，返回 "Result: n" 或以 "Error:" 开头的文本
pub fn calculate(args: &CalculatorArgs) -> String {
    let (a, b) = (args.number1, args.number2);
    let result = match args.operator.as_str() {
        "+" => a + b,
        "-" => a - b,
        "*" => a * b,
        "/" => {
            if b == 0.0 {
                return "Error: Division by zero".to_string();
            }
            a / b
        }
        "^" => a.powf(b),
        "sqrt" => {
            if a < 0.0 {
                return "Error: Cannot take square root of negative number".to_string();
            }
            a.sqrt()
        }
        other => return format!("Error: Unsupported operator '{}'", other),
    };
    if !result.is_finite() {
        return format!("Error: Result is not finite ({})", result);
    }
    if result.fract() == 0.0 && result.abs() < 1e15 {
        format!("Result: {}", result as i64)
    } else {
        format!("Result: {}", result)
    }
}

pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        CALCULATOR_DESCRIPTION
    }

    fn input_schema(&self) -> Value {
        calculator_schema()
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, String> {
        let args: CalculatorArgs = serde_json::from_value(args).map_err(|e| e.to_string())?;
        Ok(ToolOutput::text(calculate(&args)))
    }
}
