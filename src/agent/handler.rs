//! 命令处理器
//!
//! 处理来自 Mirror 的命令。命令通道是单向的：处理结果不回传，
//! 写入成功与否由存储变更通知产生的增量消息体现。

use std::sync::Arc;

use super::broadcaster::{Broadcaster, ConnId, SessionPhase};
use super::snapshot;
use crate::protocol::{encode_line, MirrorCommand};
use crate::store::StoreSet;

/// 处理后连接应继续还是关闭
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// 命令处理器
pub struct Handler {
    /// 托管的实例
    stores: StoreSet,
    /// 广播器
    broadcaster: Arc<Broadcaster>,
    /// 期望的插件 ID
    plugin_id: String,
}

impl Handler {
    /// 创建处理器
    pub fn new(stores: StoreSet, broadcaster: Arc<Broadcaster>, plugin_id: &str) -> Self {
        Self {
            stores,
            broadcaster,
            plugin_id: plugin_id.to_string(),
        }
    }

    /// 处理命令
    pub async fn handle(&self, conn_id: ConnId, command: MirrorCommand) -> Flow {
        if let MirrorCommand::Hello {
            plugin_id,
            component,
            version,
        } = command
        {
            return self.handle_hello(conn_id, &plugin_id, &component, &version);
        }

        // 未握手（或插件 ID 未通过校验）的连接不能修改存储
        if self.broadcaster.phase(conn_id) != Some(SessionPhase::Active) {
            tracing::warn!("🚫 Ignoring {} before hello: conn_id={}", command.kind(), conn_id);
            return Flow::Continue;
        }

        match command {
            MirrorCommand::SetValue {
                key,
                value,
                instance_name,
            } => self.apply_set(instance_name.as_deref(), &key, &value),
            MirrorCommand::RemoveKey { key, instance_name } => {
                self.apply_delete_key(instance_name.as_deref(), &key)
            }
            MirrorCommand::RemoveAll { instance_name } => {
                self.apply_clear_instance(instance_name.as_deref())
            }
            MirrorCommand::Hello { .. } => {}
        }
        Flow::Continue
    }

    /// 握手：生成全量快照并激活会话
    ///
    /// 每次握手都重新生成快照（重连时 Mirror 依赖它补齐断线期间的变化）。
    /// 读取快照期间的增量由广播器暂存，在快照之后补发。
    fn handle_hello(&self, conn_id: ConnId, plugin_id: &str, component: &str, version: &str) -> Flow {
        if plugin_id != self.plugin_id {
            tracing::warn!(
                "🚫 Rejecting hello: conn_id={}, plugin_id={} (expected {})",
                conn_id,
                plugin_id,
                self.plugin_id
            );
            return Flow::Close;
        }

        tracing::info!(
            "🤝 握手: conn_id={}, component={}, version={}",
            conn_id,
            component,
            version
        );

        if !self.broadcaster.begin_bootstrap(conn_id, component) {
            return Flow::Close;
        }

        let line = match encode_line(&snapshot::bootstrap(&self.stores)) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("Failed to serialize snapshot: {}", e);
                return Flow::Close;
            }
        };

        if self.broadcaster.complete_bootstrap(conn_id, line) {
            Flow::Continue
        } else {
            Flow::Close
        }
    }

    /// 写入 value
    pub fn apply_set(&self, instance_name: Option<&str>, key: &str, value: &str) {
        let Some(store) = self.stores.lookup(instance_name) else {
            tracing::debug!("Ignoring set-value for unknown instance {:?}", instance_name);
            return;
        };

        tracing::debug!("✏️ set-value: instance={:?}, key={}", instance_name, key);
        if let Err(e) = store.set_value(key, value) {
            tracing::warn!("Failed to set {:?}/{}: {}", instance_name, key, e);
        }
    }

    /// 删除 key
    pub fn apply_delete_key(&self, instance_name: Option<&str>, key: &str) {
        let Some(store) = self.stores.lookup(instance_name) else {
            tracing::debug!("Ignoring remove-key for unknown instance {:?}", instance_name);
            return;
        };

        tracing::debug!("🗑️ remove-key: instance={:?}, key={}", instance_name, key);
        if let Err(e) = store.delete_key(key) {
            tracing::warn!("Failed to delete {:?}/{}: {}", instance_name, key, e);
        }
    }

    /// 清空实例
    pub fn apply_clear_instance(&self, instance_name: Option<&str>) {
        let Some(store) = self.stores.lookup(instance_name) else {
            tracing::debug!("Ignoring remove-all for unknown instance {:?}", instance_name);
            return;
        };

        tracing::debug!("🧹 remove-all: instance={:?}", instance_name);
        if let Err(e) = store.clear_all() {
            tracing::warn!("Failed to clear {:?}: {}", instance_name, e);
        }
    }
}
