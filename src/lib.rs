//! todowa - 多 Agent 个人助理指令编排
//!
//! 模块划分：
//! - **agent**: 从配置装配 Orchestrator
//! - **answer**: 多 Planner 输出合并与最终回复生成
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、处理阶段、用户会话、编排器
//! - **llm**: 模型客户端抽象、凭证轮换、OpenAI 兼容后端与 Mock
//! - **memory**: 对话历史、最近实体、存储协作者接口与内存实现
//! - **notify**: 通知协作者
//! - **observability**: 日志初始化
//! - **planners**: 任务、日记、偏好、日程、查找、兜底六个专家 Planner
//! - **router**: 意图路由
//! - **tools**: 工具注册表、内置工具表与动作执行器

pub mod agent;
pub mod answer;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod notify;
pub mod observability;
pub mod planners;
pub mod router;
pub mod tools;

pub use crate::core::{Orchestrator, PipelineError};
