//! 动作（Action）：Planner 产出、Executor 消费
//!
//! 线上格式是扁平对象 `{"type": "<tool>", ...其余键即参数}`，没有嵌套的 parameters。
//! 已知工具各有一个强类型变体；无法匹配已知变体的对象落入 Raw，由注册表按声明的必填参数校验。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 已知工具的强类型动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KnownAction {
    InternetSearch {
        query: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        num_results: Option<u32>,
    },
    CreateTask {
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        notes: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        due_date: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        category: Option<String>,
    },
    UpdateTask {
        task_id: String,
        patch: Map<String, Value>,
    },
    DeleteTask {
        task_id: String,
    },
    GetTasks {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        category: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        order_by: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ascending: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_ids: Option<Vec<String>>,
    },
    GetTaskStats {},
    CreateJournalEntry {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        category: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entry_type: Option<String>,
    },
    SearchJournalEntries {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        query: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        titles: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        category: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },
    UpdateJournalEntry {
        patch: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(rename = "titleMatch", default, skip_serializing_if = "Option::is_none")]
        title_match: Option<String>,
    },
    DeleteJournalEntry {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(rename = "titleMatch", default, skip_serializing_if = "Option::is_none")]
        title_match: Option<String>,
    },
    CreateOrUpdateMemory {
        memory_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        importance: Option<i64>,
    },
    GetMemories {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        memory_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },
    DeleteMemory {
        memory_id: String,
    },
    CreateSchedule {
        action_type: String,
        action_payload: Value,
        schedule_type: String,
        schedule_value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next_run_at: Option<String>,
    },
    GetSchedules {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },
    UpdateSchedule {
        schedule_id: String,
        patch: Map<String, Value>,
    },
    DeleteSchedule {
        schedule_id: String,
    },
}

/// 未知或参数不合已知形状的动作，原样保留
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAction {
    #[serde(rename = "type", default)]
    pub tool: String,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Action {
    Known(KnownAction),
    Raw(RawAction),
}

impl From<KnownAction> for Action {
    fn from(a: KnownAction) -> Self {
        Action::Known(a)
    }
}

impl Action {
    pub fn raw(tool: impl Into<String>, params: Map<String, Value>) -> Self {
        Action::Raw(RawAction {
            tool: tool.into(),
            params,
        })
    }

    /// 从模型给出的任意 JSON 值解析；非对象返回 None
    pub fn from_value(value: Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value).ok()
    }

    /// 工具名
    pub fn tool_name(&self) -> String {
        match self {
            Action::Raw(raw) => raw.tool.clone(),
            Action::Known(_) => self
                .to_value()
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// 拆出 (工具名, 扁平参数)；参数中不含 type 键
    pub fn into_call(self) -> (String, Map<String, Value>) {
        match self {
            Action::Raw(RawAction { tool, mut params }) => {
                params.remove("type");
                (tool, params)
            }
            known => {
                let mut map = match known.to_value() {
                    Value::Object(map) => map,
                    _ => Map::new(),
                };
                let tool = match map.remove("type") {
                    Some(Value::String(s)) => s,
                    _ => String::new(),
                };
                (tool, map)
            }
        }
    }
}
