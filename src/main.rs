//! Hive 命令行入口
//!
//! 加载配置、构建 Agent，对一条 prompt 跑完整的工具循环，打印最终回复与用量汇总。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use hive::config::load_config;
use hive::llm::MockLlmClient;
use hive::Agent;

#[derive(Parser, Debug)]
#[command(name = "hive", version, about = "Tool-augmented conversation orchestrator")]
struct Cli {
    /// 额外的配置文件（TOML）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 整体超时（秒），覆盖 [app].run_timeout_secs
    #[arg(short, long)]
    timeout: Option<u64>,

    /// 使用本地 Mock 模型（无需 API key）
    #[arg(long)]
    mock: bool,

    /// 用户输入
    #[arg(required = true)]
    prompt: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();
    let cli = Cli::parse();

    let mut cfg = load_config(cli.config.clone()).context("Failed to load configuration")?;
    if let Some(secs) = cli.timeout {
        cfg.app.run_timeout_secs = Some(secs);
    }

    let agent = if cli.mock {
        Agent::new(cfg, Arc::new(MockLlmClient::new()))
    } else {
        Agent::from_config(cfg).context("Failed to create model client")?
    };

    let prompt = cli.prompt.join(" ");
    let result = agent.run(&prompt).await.context("Run failed")?;

    println!("{}", result.reply);
    let u = result.usage;
    eprintln!(
        "[{} iterations, {} calls] input={} output={} cache_read={} cache_write={} total={}",
        result.iterations,
        u.calls,
        u.input_tokens,
        u.output_tokens,
        u.cache_read_input_tokens,
        u.cache_creation_input_tokens,
        u.total_tokens()
    );
    Ok(())
}
