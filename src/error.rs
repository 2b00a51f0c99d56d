//! 错误类型定义

use thiserror::Error;

/// 库错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 协议错误（消息格式不合法，在传输边界被拒绝）
    #[error("协议错误: {0}")]
    Protocol(String),

    /// 存储引擎错误
    #[error("存储错误: {0}")]
    Store(String),

    /// 依赖组件不可用（初始化阶段致命，不重试）
    #[error("组件不可用: {0}")]
    Unavailable(String),

    /// 连接错误
    #[error("连接错误: {0}")]
    Connection(String),

    /// 生命周期错误（在错误的阶段调用）
    #[error("生命周期错误: {0}")]
    Lifecycle(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, Error>;
