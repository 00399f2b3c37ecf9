//! Hive - 单监督者任务编排器
//!
//! 把一个高层目标拆成带依赖的任务图，为每个任务写出 Briefing，拉起外部 Worker 进程执行，
//! 解析其输出流并校验交付物，支持暂停与断点续跑。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **observability**: tracing 订阅器
//! - **store**: 共享存储（事务型 KV、前缀列举、watch）
//! - **monitor**: Worker 进程启动、输出采集与终止
//! - **stream**: Worker 输出行解析、事件打标与落盘
//! - **workflow**: 任务、状态机与任务图
//! - **briefing**: TaskBriefing 协议与交付物校验
//! - **planner**: 目标 → 任务图
//! - **core**: 编排引擎、状态投影、会话监管、前端 API
//! - **continuation**: 检查点与对账恢复

pub mod briefing;
pub mod config;
pub mod continuation;
pub mod core;
pub mod monitor;
pub mod observability;
pub mod planner;
pub mod store;
pub mod stream;
pub mod workflow;

pub use crate::core::{Engine, Orchestrator, OrchestratorError, StatusReport};
pub use crate::store::SharedStore;
