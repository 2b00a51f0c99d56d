//! Agent 模块 - 嵌入目标进程，持有真实存储
//!
//! Agent 负责：
//! - 握手后为每个会话发送全量快照
//! - 监听存储变更并推送增量
//! - 执行 Mirror 发来的写入/删除/清空命令

mod broadcaster;
mod handler;
mod server;
pub mod snapshot;

// Re-export protocol types from crate root
pub use crate::protocol::{AgentMessage, KeyChange, MirrorCommand};
pub use broadcaster::{Broadcaster, ConnId, SessionInfo, SessionPhase};
pub use handler::{Flow, Handler};
pub use server::{Agent, AgentConfig, AgentPhase};
