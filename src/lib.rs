//! Hive - Rust 工具增强对话编排器
//!
//! 模块划分：
//! - **agent**: 一次编排调用（打开提供方、跑采样循环、保证拆除连接）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 采样编排器、限流退避、错误与循环事件
//! - **llm**: 远端模型客户端抽象与实现（Anthropic Messages API / Mock）
//! - **mcp**: 外部工具提供方连接管理（stdio / 流式 HTTP）
//! - **memory**: 对话历史、token 账本、图片剥离
//! - **observability**: tracing 初始化与用量账本
//! - **tools**: 工具注册表、并发调度与本地工具（think、calculator、file_read、file_write）

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod mcp;
pub mod memory;
pub mod observability;
pub mod tools;

pub use agent::{Agent, RunResult};
