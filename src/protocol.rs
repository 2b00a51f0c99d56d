//! 桥接协议定义
//!
//! 通信方式：Unix Socket + JSONL（每条消息一行 JSON + '\n'）
//!
//! 两个方向各自是一个封闭的 tagged enum：
//! - Agent → Mirror: [`AgentMessage`]（启动快照 + 单 key 增量）
//! - Mirror → Agent: [`MirrorCommand`]（握手 + 写入/删除/清空命令）
//!
//! 所有消息都是 fire-and-forget，没有请求/响应配对。
//! 不合法的消息只在 [`decode_agent_message`] / [`decode_command`] 这一处被拒绝。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// 单实例模式下隐式存储的内部名称（不会出现在线上消息中）
pub const DEFAULT_INSTANCE: &str = "default";

/// 实例模式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// 只有一个未命名存储，消息不携带 instanceName
    Single,
    /// 多个命名实例
    #[default]
    Multi,
}

impl Variant {
    /// 内部实例名 → 线上 instanceName 字段
    pub fn wire_instance(self, instance: &str) -> Option<String> {
        match self {
            Variant::Single => None,
            Variant::Multi => Some(instance.to_string()),
        }
    }
}

/// 线上 instanceName 字段 → 内部实例名
pub fn resolve_instance(instance_name: Option<&str>) -> &str {
    instance_name.unwrap_or(DEFAULT_INSTANCE)
}

/// 单个实例的数据：key → value（`None` 表示读取时已被删除）
pub type InstanceData = BTreeMap<String, Option<String>>;

/// 快照载荷
///
/// 多实例模式为 `instanceName → key → value`，单实例模式为 `key → value`。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SnapshotPayload {
    Multi(BTreeMap<String, InstanceData>),
    Single(InstanceData),
}

impl SnapshotPayload {
    /// 统一展开为 `实例名 → 数据`
    pub fn into_instances(self) -> BTreeMap<String, InstanceData> {
        match self {
            SnapshotPayload::Multi(instances) => instances,
            SnapshotPayload::Single(data) => {
                let mut instances = BTreeMap::new();
                instances.insert(DEFAULT_INSTANCE.to_string(), data);
                instances
            }
        }
    }

    /// 快照中的 key 总数
    pub fn key_count(&self) -> usize {
        match self {
            SnapshotPayload::Multi(instances) => instances.values().map(|d| d.len()).sum(),
            SnapshotPayload::Single(data) => data.len(),
        }
    }
}

/// Agent → Mirror 消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AgentMessage {
    /// 全量快照（每次握手后发送一次）
    DataSnapshot { data: SnapshotPayload },

    /// 单个 key 变化，`value = None` 表示删除
    KeyChanged {
        key: String,
        #[serde(default)]
        value: Option<String>,
        #[serde(
            rename = "instanceName",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        instance_name: Option<String>,
    },
}

/// Mirror → Agent 命令
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MirrorCommand {
    /// 握手，Agent 收到后为该连接发送全量快照
    Hello {
        #[serde(rename = "pluginId")]
        plugin_id: String,
        /// 组件名称（用于日志和诊断）
        #[serde(default)]
        component: String,
        /// 组件版本
        #[serde(default)]
        version: String,
    },

    /// 删除单个 key
    RemoveKey {
        key: String,
        #[serde(
            rename = "instanceName",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        instance_name: Option<String>,
    },

    /// 清空整个实例
    RemoveAll {
        #[serde(
            rename = "instanceName",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        instance_name: Option<String>,
    },

    /// 写入单个 key
    SetValue {
        key: String,
        value: String,
        #[serde(
            rename = "instanceName",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        instance_name: Option<String>,
    },
}

impl MirrorCommand {
    /// 命令类型名称（日志用）
    pub fn kind(&self) -> &'static str {
        match self {
            MirrorCommand::Hello { .. } => "hello",
            MirrorCommand::RemoveKey { .. } => "remove-key",
            MirrorCommand::RemoveAll { .. } => "remove-all",
            MirrorCommand::SetValue { .. } => "set-value",
        }
    }
}

/// 存储变化（内部使用，由 change listener 产生，广播前转换为 [`AgentMessage`]）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChange {
    pub instance: String,
    pub key: String,
    pub value: Option<String>,
}

impl KeyChange {
    /// 转换为线上消息
    pub fn to_message(&self, variant: Variant) -> AgentMessage {
        AgentMessage::KeyChanged {
            key: self.key.clone(),
            value: self.value.clone(),
            instance_name: variant.wire_instance(&self.instance),
        }
    }
}

/// 序列化为一行 JSONL
pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    let json = serde_json::to_string(message)?;
    Ok(format!("{}\n", json))
}

/// 解析 Agent → Mirror 的一行消息
pub fn decode_agent_message(line: &str) -> Result<AgentMessage> {
    let line = line.trim();
    if line.is_empty() {
        return Err(Error::Protocol("empty frame".to_string()));
    }
    serde_json::from_str(line).map_err(|e| Error::Protocol(format!("invalid agent message: {}", e)))
}

/// 解析 Mirror → Agent 的一行命令
pub fn decode_command(line: &str) -> Result<MirrorCommand> {
    let line = line.trim();
    if line.is_empty() {
        return Err(Error::Protocol("empty frame".to_string()));
    }
    serde_json::from_str(line).map_err(|e| Error::Protocol(format!("invalid command: {}", e)))
}
