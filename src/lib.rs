pub mod approval;
pub mod chat_loop;
pub mod config;
pub mod error;
pub mod json_accum;
pub mod logger;
pub mod model;
pub mod parser;
pub mod request;
pub mod sse;
pub mod step;

pub use config::{ApiType, ChatOpts, ThinkingLevel};
pub use error::{ChatError, ErrorSubtype, StopKind};
pub use logger::log;
pub use model::{
    ApprovalPolicy, ContentBlock, ImageSource, Message, Role, ToolCallId, ToolCallRequest,
    ToolDefinition, ToolExecFuture, ToolExecutor, ToolResultContent, UiPart,
};
