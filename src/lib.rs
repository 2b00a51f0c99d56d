//! kv-inspect-bridge - 键值存储实时检查桥
//!
//! 把目标进程内一个或多个键值存储实例镜像到远端 Inspector，
//! 并把 Inspector 中的编辑回传给目标进程。
//!
//! # 核心功能
//!
//! - **启动快照**: 每次握手发送一条包含所有实例的全量快照
//! - **增量推送**: 任何写入者造成的变化都以单 key 增量推送
//! - **乐观更新**: Mirror 先本地应用编辑，再发送命令
//! - **最终一致**: 两个副本通过幂等增量收敛，冲突时后写者胜
//!
//! # Feature Flags
//!
//! - `agent`: Agent 模式（嵌入目标进程，持有真实存储）
//! - `mirror`: Mirror 模式（Inspector 侧镜像状态 + 客户端）
//!
//! # 架构
//!
//! Agent → Mirror 是单向事件流（快照 + 增量），Mirror → Agent 是单向命令流。
//! 没有同步的请求/响应，命令的结果通过存储变更通知产生的增量体现。

pub mod config;
pub mod error;
pub mod protocol;
pub mod store;

#[cfg(feature = "agent")]
pub mod agent;

#[cfg(feature = "mirror")]
pub mod mirror;

// Re-exports
pub use config::BridgeConfig;
pub use error::{Error, Result};
pub use store::{KvStore, MemoryStore, StoreSet};

// Protocol types (always available)
pub use protocol::{AgentMessage, KeyChange, MirrorCommand, SnapshotPayload, Variant, DEFAULT_INSTANCE};

#[cfg(feature = "agent")]
pub use agent::{Agent, AgentConfig, AgentPhase};

#[cfg(feature = "mirror")]
pub use mirror::{EntryRef, MirrorClient, MirrorConfig, MirrorState, Row};
