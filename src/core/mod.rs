//! 核心编排层：错误分类、处理阶段、用户会话、编排器

pub mod error;
pub mod orchestrator;
pub mod session;
pub mod state;

pub use error::PipelineError;
pub use orchestrator::{Orchestrator, OrchestratorSettings, TurnReport};
pub use session::{Session, SessionManager};
pub use state::{PipelineStage, StageTrace};
