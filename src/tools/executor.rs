//! 动作执行器
//!
//! 按顺序消费 Planner 的动作列表：拆出工具名与扁平参数，经 ToolRegistry 调用，
//! 每个动作独立捕获失败（含 panic），一个失败不影响其余动作；返回与输入等长、同序的结果。
//! 每次调用输出结构化审计日志（JSON）。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;

use crate::tools::{Action, ToolCallResult, ToolContext, ToolRegistry};

/// 单个动作的执行结果
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ActionResult {
    /// 工具名（审计与汇总用，不下发给用户）
    #[serde(skip)]
    pub tool: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResult {
    pub fn failure(tool: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    fn from_call(call: ToolCallResult) -> Self {
        // 处理函数自身可能以 {"success": false, "error": ...} 报告业务失败
        if let Some(Value::Object(map)) = &call.data {
            if map.get("success") == Some(&Value::Bool(false)) {
                let error = map
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("operation failed")
                    .to_string();
                return Self::failure(call.tool, error);
            }
        }
        Self {
            tool: call.tool,
            success: call.success,
            data: call.data,
            error: call.error,
        }
    }
}

/// 动作执行器：持有共享注册表
#[derive(Clone)]
pub struct ActionExecutor {
    registry: Arc<ToolRegistry>,
}

impl ActionExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// 执行单个动作
    pub async fn execute_action(&self, action: Action, ctx: &ToolContext) -> ActionResult {
        let (tool, args) = action.into_call();
        if tool.trim().is_empty() {
            return ActionResult::failure("", "Action is missing a 'type' field.");
        }
        let preview = args_preview(&args);

        let call = AssertUnwindSafe(self.registry.execute(&tool, args, ctx))
            .catch_unwind()
            .await;
        let result = match call {
            Ok(call) => ActionResult::from_call(call),
            Err(_) => {
                tracing::error!(tool = %tool, "tool handler panicked");
                ActionResult::failure(tool.clone(), format!("Tool '{tool}' failed unexpectedly."))
            }
        };

        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool,
            "ok": result.success,
            "error": result.error,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit, "tool");
        result
    }

    /// 顺序执行动作列表；结果与输入一一对应
    pub async fn execute_all(&self, actions: Vec<Action>, ctx: &ToolContext) -> Vec<ActionResult> {
        let mut results = Vec::with_capacity(actions.len());
        for action in actions {
            results.push(self.execute_action(action, ctx).await);
        }
        results
    }
}

fn args_preview(args: &serde_json::Map<String, Value>) -> String {
    let s = Value::Object(args.clone()).to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
