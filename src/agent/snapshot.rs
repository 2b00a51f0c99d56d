//! 快照与增量读取
//!
//! 读取失败采用部分上报策略：失败的 key（或无法列出 key 的实例）
//! 被省略，不影响同一批次的其他数据，后续变更通知会自行修正。

use std::collections::BTreeMap;

use super::broadcaster::Broadcaster;
use crate::protocol::{AgentMessage, InstanceData, KeyChange, SnapshotPayload, Variant, DEFAULT_INSTANCE};
use crate::store::{KvStore, StoreSet};

/// 为所有实例生成一条全量快照消息
pub fn bootstrap(stores: &StoreSet) -> AgentMessage {
    let mut instances = BTreeMap::new();
    for (name, store) in stores.iter() {
        if let Some(data) = read_instance(name, store.as_ref()) {
            instances.insert(name.clone(), data);
        }
    }

    let data = match stores.variant() {
        Variant::Single => {
            SnapshotPayload::Single(instances.remove(DEFAULT_INSTANCE).unwrap_or_default())
        }
        Variant::Multi => SnapshotPayload::Multi(instances),
    };

    tracing::debug!("📸 Snapshot built: {} keys", data.key_count());
    AgentMessage::DataSnapshot { data }
}

/// 读取单个实例的所有 key/value
///
/// 枚举期间被删除的 key 以 `None` 上报。
fn read_instance(name: &str, store: &dyn KvStore) -> Option<InstanceData> {
    let keys = match store.list_keys() {
        Ok(keys) => keys,
        Err(e) => {
            tracing::warn!("Failed to list keys of instance {}: {}", name, e);
            return None;
        }
    };

    let mut data = InstanceData::new();
    for key in keys {
        match store.get_value(&key) {
            Ok(value) => {
                data.insert(key, value);
            }
            Err(e) => {
                tracing::warn!("Skipping {}/{} in snapshot: {}", name, key, e);
            }
        }
    }
    Some(data)
}

/// 读取单个 key 的当前值，读取失败返回 `None`
pub fn read_change(instance: &str, store: &dyn KvStore, key: &str) -> Option<KeyChange> {
    match store.get_value(key) {
        Ok(value) => Some(KeyChange {
            instance: instance.to_string(),
            key: key.to_string(),
            value,
        }),
        Err(e) => {
            tracing::warn!("Dropping change of {}/{}: {}", instance, key, e);
            None
        }
    }
}

/// 变更通知入口：读取当前值并广播给所有会话
pub(crate) fn emit_change(broadcaster: &Broadcaster, instance: &str, store: &dyn KvStore, key: &str) {
    if !broadcaster.has_receivers() {
        tracing::trace!("No active session, skipping change of {}/{}", instance, key);
        return;
    }

    broadcaster.deliver_with(|| read_change(instance, store, key));
}
