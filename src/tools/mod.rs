//! 工具层：动作格式、注册表、内置工具表、执行器与网络搜索

pub mod action;
pub mod catalogue;
pub mod executor;
pub mod registry;
pub mod schema;
pub mod search;

pub use action::{Action, KnownAction, RawAction};
pub use catalogue::{register_builtin_tools, CatalogueSettings};
pub use executor::{ActionExecutor, ActionResult};
pub use registry::{
    FnHandler, ToolCallResult, ToolContext, ToolDescriptor, ToolError, ToolHandler, ToolMetricsSnapshot,
    ToolRegistry,
};
pub use schema::{reply_schema, schema_block};
pub use search::{DuckDuckGoSearch, SearchHit, StaticSearch, WebSearch};
