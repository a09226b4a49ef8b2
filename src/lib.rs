//! Hive - 单端点意图编排网关
//!
//! 模块划分：
//! - **api**: axum 路由（/orchestrate、/jobs/:job_id、/callbacks/ingest、/health）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、优雅关闭、Webhook 签名
//! - **dispatch**: 模式解析、幂等、作业状态机、快速路径 / 后台执行、回调投递
//! - **executors**: Flow（工作流 Webhook）/ Protocol（占位）/ Agent（本地工具）执行器
//! - **observability**: 日志初始化
//! - **tools**: 本地工具（memory.*、ssh.*、debug.echo）与注册表

#[cfg(feature = "server")]
pub mod api;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod executors;
pub mod observability;
pub mod tools;

#[cfg(test)]
pub(crate) mod test_support;

pub use dispatch::{DispatchRequest, DispatchResponse, Dispatcher};
