//! Hive - Rust 智能体回合编排运行时
//!
//! 模块划分：
//! - **agent**: Agent 组件构建与单会话运行时（Session）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、回合状态、会话监管、命令通道编排
//! - **llm**: 协议适配器（Gemini / OpenAI 兼容）、流解码、重试回退、HTTP 传输与脚本化测试传输
//! - **memory**: 对话历史与 Token 预算
//! - **observability**: 日志初始化
//! - **react**: 回合状态机主循环与调用方事件
//! - **subagents**: 子代理 profile 与任务路由
//! - **tools**: 工具注册、参数校验、用户确认与执行管线

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod subagents;
pub mod tools;

pub use agent::{create_agent_components, AgentComponents, Session};
