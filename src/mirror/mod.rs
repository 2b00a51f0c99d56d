//! Mirror 模块 - Inspector 侧的镜像副本
//!
//! 提供连接 Agent 的客户端与可查询的镜像状态

mod connect;
pub mod state;

pub use connect::{MirrorClient, MirrorConfig};
pub use state::{EntryRef, MirrorState, Row};
