//! 工具注册表
//!
//! 启动时通过显式注册表把 (名称, 处理函数, 分类, 必填参数, 可选参数默认值, 自动注入键)
//! 写入 ToolRegistry；execute 时补齐自动注入与默认参数、校验必填参数、计时调用，
//! 并无论成败都更新该工具的 ToolMetrics。未知工具返回结构化错误而不是 panic。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("Tool '{0}' not found in registry.")]
    NotFound(String),

    #[error("Missing required parameters for tool '{tool}': {}", .missing.join(", "))]
    MissingParams { tool: String, missing: Vec<String> },

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("{0}")]
    Execution(String),

    #[error("Tool '{0}' timed out")]
    Timeout(String),
}

/// 工具处理函数：接收扁平参数表，返回 data 部分
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Map<String, Value>) -> Result<Value, ToolError>;
}

/// 把异步闭包包装成 ToolHandler
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ToolError>> + Send,
{
    async fn call(&self, args: Map<String, Value>) -> Result<Value, ToolError> {
        (self.0)(args).await
    }
}

/// 工具元数据 + 处理函数，注册后不可变
#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub category: String,
    pub required: Vec<String>,
    /// 可选参数及默认值（Null 表示无默认，不补齐）
    pub optional: Vec<(String, Value)>,
    /// 从共享上下文补齐的参数名（如 user_id）
    pub auto_inject: Vec<String>,
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolDescriptor {
    pub fn new(
        name: impl Into<String>,
        category: impl Into<String>,
        handler: impl ToolHandler + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            category: category.into(),
            required: Vec::new(),
            optional: Vec::new(),
            auto_inject: Vec::new(),
            handler: Arc::new(handler),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn required(mut self, params: &[&str]) -> Self {
        self.required = params.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn optional(mut self, name: &str, default: Value) -> Self {
        self.optional.push((name.to_string(), default));
        self
    }

    pub fn inject(mut self, key: &str) -> Self {
        self.auto_inject.push(key.to_string());
        self
    }

    fn signature(&self) -> String {
        let mut parts: Vec<String> = self.required.clone();
        parts.extend(self.optional.iter().map(|(n, d)| {
            if d.is_null() {
                format!("{n}?")
            } else {
                format!("{n}={d}")
            }
        }));
        format!("{}({})", self.name, parts.join(", "))
    }
}

/// 每个工具的累计统计；原子计数，可并发更新
#[derive(Debug, Default)]
pub struct ToolMetrics {
    execution_count: AtomicU64,
    success_count: AtomicU64,
    error_count: AtomicU64,
    total_time_us: AtomicU64,
    /// Unix 毫秒；0 表示从未执行
    last_execution_ms: AtomicI64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolMetricsSnapshot {
    pub execution_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub total_time_ms: f64,
    pub average_time_ms: f64,
    pub last_execution: Option<String>,
}

impl ToolMetrics {
    fn record(&self, ok: bool, elapsed: Duration) {
        self.execution_count.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.success_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }
        self.total_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.last_execution_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ToolMetricsSnapshot {
        let count = self.execution_count.load(Ordering::Relaxed);
        let total_ms = self.total_time_us.load(Ordering::Relaxed) as f64 / 1000.0;
        let last = self.last_execution_ms.load(Ordering::Relaxed);
        ToolMetricsSnapshot {
            execution_count: count,
            success_count: self.success_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            total_time_ms: total_ms,
            average_time_ms: if count == 0 { 0.0 } else { total_ms / count as f64 },
            last_execution: (last > 0)
                .then(|| chrono::DateTime::from_timestamp_millis(last))
                .flatten()
                .map(|t| t.format(crate::memory::ISO_UTC_FORMAT).to_string()),
        }
    }
}

/// 自动注入来源（当前用户等）
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    values: Map<String, Value>,
}

impl ToolContext {
    pub fn for_user(user_id: &str) -> Self {
        let mut values = Map::new();
        values.insert("user_id".into(), Value::String(user_id.to_string()));
        Self { values }
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.values.insert(key.to_string(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}

/// 单次调用结果
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolCallResult {
    pub tool: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

impl ToolCallResult {
    fn failure(tool: &str, err: &ToolError, elapsed: Duration) -> Self {
        Self {
            tool: tool.to_string(),
            success: false,
            data: None,
            error: Some(err.to_string()),
            execution_time_ms: elapsed.as_millis() as u64,
        }
    }
}

struct Entry {
    descriptor: ToolDescriptor,
    metrics: ToolMetrics,
}

/// 工具注册表：按名称存储描述符与统计
pub struct ToolRegistry {
    tools: HashMap<String, Entry>,
    timeout: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self {
            tools: HashMap::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register(&mut self, descriptor: ToolDescriptor) {
        tracing::debug!(tool = %descriptor.name, category = %descriptor.category, "tool registered");
        self.tools.insert(
            descriptor.name.clone(),
            Entry {
                descriptor,
                metrics: ToolMetrics::default(),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name).map(|e| &e.descriptor)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 某分类下的工具名；None 返回全部
    pub fn list_tools(&self, category: Option<&str>) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .values()
            .filter(|e| category.map_or(true, |c| e.descriptor.category == c))
            .map(|e| e.descriptor.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn list_categories(&self) -> Vec<String> {
        self.tools
            .values()
            .map(|e| e.descriptor.category.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn metrics(&self, name: &str) -> Option<ToolMetricsSnapshot> {
        self.tools.get(name).map(|e| e.metrics.snapshot())
    }

    pub fn all_metrics(&self) -> BTreeMap<String, ToolMetricsSnapshot> {
        self.tools
            .iter()
            .map(|(name, e)| (name.clone(), e.metrics.snapshot()))
            .collect()
    }

    /// 按分类分组的工具说明，拼入 prompt
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for category in self.list_categories() {
            out.push_str(&format!("[{category}]\n"));
            for name in self.list_tools(Some(&category)) {
                if let Some(d) = self.get(&name) {
                    out.push_str(&format!("- {}: {}\n", d.signature(), d.description));
                }
            }
        }
        out
    }

    /// 补齐自动注入与默认参数并校验必填参数
    fn prepare_args(
        descriptor: &ToolDescriptor,
        mut args: Map<String, Value>,
        ctx: &ToolContext,
    ) -> Result<Map<String, Value>, ToolError> {
        for key in &descriptor.auto_inject {
            if !args.contains_key(key) {
                if let Some(v) = ctx.get(key) {
                    args.insert(key.clone(), v.clone());
                }
            }
        }
        for (name, default) in &descriptor.optional {
            if !default.is_null() && !args.contains_key(name) {
                args.insert(name.clone(), default.clone());
            }
        }
        let missing: Vec<String> = descriptor
            .required
            .iter()
            .filter(|p| args.get(p.as_str()).map_or(true, Value::is_null))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(ToolError::MissingParams {
                tool: descriptor.name.clone(),
                missing,
            });
        }
        Ok(args)
    }

    /// 执行工具：未知工具、参数缺失、处理失败、超时都转为失败的 ToolCallResult
    pub async fn execute(&self, name: &str, args: Map<String, Value>, ctx: &ToolContext) -> ToolCallResult {
        let start = Instant::now();
        let Some(entry) = self.tools.get(name) else {
            return ToolCallResult::failure(name, &ToolError::NotFound(name.to_string()), start.elapsed());
        };

        let outcome = match Self::prepare_args(&entry.descriptor, args, ctx) {
            Ok(args) => {
                let call = AssertUnwindSafe(entry.descriptor.handler.call(args)).catch_unwind();
                match tokio::time::timeout(self.timeout, call).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(_)) => {
                        tracing::error!(tool = %name, "tool handler panicked");
                        Err(ToolError::Execution(format!("Tool '{name}' failed unexpectedly.")))
                    }
                    Err(_) => Err(ToolError::Timeout(name.to_string())),
                }
            }
            Err(e) => Err(e),
        };

        let elapsed = start.elapsed();
        entry.metrics.record(outcome.is_ok(), elapsed);
        match outcome {
            Ok(data) => ToolCallResult {
                tool: name.to_string(),
                success: true,
                data: Some(data),
                error: None,
                execution_time_ms: elapsed.as_millis() as u64,
            },
            Err(e) => ToolCallResult::failure(name, &e, elapsed),
        }
    }
}
