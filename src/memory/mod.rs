//! 记忆层：消息与交互历史（短期）、存储协作者接口与内存实现（持久数据）

pub mod conversation;
pub mod in_memory;
pub mod store;

pub use conversation::{
    ConversationHistory, EntityKind, EntityRef, Interaction, Message, RecentRefs, Role,
};
pub use in_memory::InMemoryStore;
pub use store::{
    CategoryIndex, JournalQuery, JournalRecord, MemoryRecord, NewJournal, NewMemory, NewSchedule,
    NewTask, ScheduleRecord, ScheduleStatus, ScheduleType, Store, StoreError, TaskQuery,
    TaskRecord, TaskStats,
};

/// 全系统统一的 UTC 时间格式
pub const ISO_UTC_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

pub fn now_iso() -> String {
    chrono::Utc::now().format(ISO_UTC_FORMAT).to_string()
}
