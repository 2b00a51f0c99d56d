//! Mirror 状态：Inspector 侧的镜像副本
//!
//! 只由 UI 事件循环单线程修改，不需要加锁。
//! 两个副本（Agent 的真实存储与这里的镜像）通过幂等的增量应用最终收敛：
//! 本地乐观写入之后，Agent 执行命令产生的回声增量会再次确认同一个值。

use std::collections::BTreeMap;

use serde::Serialize;

use crate::protocol::{
    resolve_instance, AgentMessage, MirrorCommand, SnapshotPayload, Variant, DEFAULT_INSTANCE,
};

/// 单个实例的镜像数据
pub type Entries = BTreeMap<String, String>;

/// 条目引用：`(实例名, key)` 是条目的唯一标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct EntryRef {
    pub instance: String,
    pub key: String,
}

impl EntryRef {
    pub fn new(instance: &str, key: &str) -> Self {
        Self {
            instance: instance.to_string(),
            key: key.to_string(),
        }
    }
}

/// 可见行
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Row {
    pub instance: String,
    pub key: String,
    pub value: String,
}

impl Row {
    /// 以 JSON 解析 value，解析失败时作为普通字符串
    pub fn value_json(&self) -> serde_json::Value {
        serde_json::from_str(&self.value)
            .unwrap_or_else(|_| serde_json::Value::String(self.value.clone()))
    }
}

/// 镜像状态
#[derive(Debug, Clone)]
pub struct MirrorState {
    variant: Variant,
    /// 实例名 → key → value
    instances: BTreeMap<String, Entries>,
    selected_instance: Option<String>,
    selected_entry: Option<EntryRef>,
    /// 每次可见变化递增
    version: u64,
}

impl MirrorState {
    pub fn new(variant: Variant) -> Self {
        let mut instances = BTreeMap::new();
        if variant == Variant::Single {
            // 单实例模式的唯一存储是隐式存在的
            instances.insert(DEFAULT_INSTANCE.to_string(), Entries::new());
        }

        Self {
            variant,
            instances,
            selected_instance: None,
            selected_entry: None,
            version: 0,
        }
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    /// 应用一条 Agent 消息，返回是否产生了可见变化
    pub fn apply_message(&mut self, message: AgentMessage) -> bool {
        match message {
            AgentMessage::DataSnapshot { data } => self.apply_snapshot(data) > 0,
            AgentMessage::KeyChanged {
                key,
                value,
                instance_name,
            } => {
                let instance = self.target_instance(instance_name.as_deref()).to_string();
                self.apply_delta(&instance, &key, value.as_deref())
            }
        }
    }

    /// 合并快照（增量合并，不移除快照中未出现的实例或 key），返回变化的条目数
    ///
    /// 快照中值为 `None` 的 key 视为已删除。
    pub fn apply_snapshot(&mut self, data: SnapshotPayload) -> usize {
        let shape_matches = matches!(
            (&data, self.variant),
            (SnapshotPayload::Multi(_), Variant::Multi) | (SnapshotPayload::Single(_), Variant::Single)
        );
        if !shape_matches {
            if data.key_count() > 0 {
                tracing::warn!("Ignoring snapshot with mismatched shape for {:?} mirror", self.variant);
            }
            return 0;
        }

        let mut changed = 0;
        for (instance, entries) in data.into_instances() {
            if self.announce(&instance) {
                changed += 1;
            }
            for (key, value) in entries {
                let applied = match value {
                    Some(value) => self.upsert(&instance, &key, &value),
                    None => self.remove(&instance, &key),
                };
                if applied {
                    changed += 1;
                }
            }
        }

        tracing::debug!("📸 Snapshot merged: {} changes", changed);
        changed
    }

    /// 应用单个 key 的增量，`value = None` 表示删除
    ///
    /// 值相同的重复增量（例如乐观写入后的回声）不产生变化。
    pub fn apply_delta(&mut self, instance: &str, key: &str, value: Option<&str>) -> bool {
        let announced = self.announce(instance);
        let applied = match value {
            Some(value) => self.upsert(instance, key, value),
            None => self.remove(instance, key),
        };
        announced || applied
    }

    /// 乐观写入：先更新本地并选中该条目，返回需要发送的命令
    ///
    /// 未知实例返回 `None`（镜像只持有已被 Agent 宣告过的实例）。
    pub fn optimistic_set(&mut self, instance: &str, key: &str, value: &str) -> Option<MirrorCommand> {
        let instance = self.known_instance(instance)?;

        self.upsert(&instance, key, value);
        self.select(EntryRef::new(&instance, key));

        Some(MirrorCommand::SetValue {
            key: key.to_string(),
            value: value.to_string(),
            instance_name: self.variant.wire_instance(&instance),
        })
    }

    /// 乐观删除
    pub fn optimistic_delete_key(&mut self, instance: &str, key: &str) -> Option<MirrorCommand> {
        let instance = self.known_instance(instance)?;

        self.remove(&instance, key);

        Some(MirrorCommand::RemoveKey {
            key: key.to_string(),
            instance_name: self.variant.wire_instance(&instance),
        })
    }

    /// 乐观清空实例：清空本地数据，并清除指向该实例的选择
    pub fn optimistic_clear_instance(&mut self, instance: &str) -> Option<MirrorCommand> {
        let instance = self.known_instance(instance)?;

        if let Some(entries) = self.instances.get_mut(&instance) {
            if !entries.is_empty() {
                entries.clear();
                self.bump();
            }
        }

        if self.selected_instance.as_deref() == Some(instance.as_str()) {
            self.selected_instance = None;
            self.bump();
        }
        if self
            .selected_entry
            .as_ref()
            .is_some_and(|entry| entry.instance == instance)
        {
            self.selected_entry = None;
            self.bump();
        }

        Some(MirrorCommand::RemoveAll {
            instance_name: self.variant.wire_instance(&instance),
        })
    }

    /// 切换当前实例，可见行随之变为该实例的条目
    ///
    /// 单实例模式没有选择步骤，总是返回 `false`。
    pub fn select_instance(&mut self, name: &str) -> bool {
        if self.variant == Variant::Single || !self.instances.contains_key(name) {
            return false;
        }
        if self.selected_instance.as_deref() == Some(name) {
            return true;
        }

        self.selected_instance = Some(name.to_string());
        self.selected_entry = None;
        self.bump();
        true
    }

    /// 设置或清除正在编辑的条目，不修改数据
    pub fn select_entry(&mut self, entry: Option<EntryRef>) -> bool {
        let Some(entry) = entry else {
            if self.selected_entry.take().is_some() {
                self.bump();
            }
            return true;
        };

        let instance = self.target_instance(Some(entry.instance.as_str())).to_string();
        let exists = self
            .instances
            .get(&instance)
            .is_some_and(|entries| entries.contains_key(&entry.key));
        if !exists {
            return false;
        }

        self.select(EntryRef::new(&instance, &entry.key));
        true
    }

    /// 当前可见行
    pub fn rows(&self) -> Vec<Row> {
        let instance = match self.variant {
            Variant::Single => Some(DEFAULT_INSTANCE),
            Variant::Multi => self.selected_instance.as_deref(),
        };

        let Some(instance) = instance else {
            return Vec::new();
        };

        self.instances
            .get(instance)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(key, value)| Row {
                        instance: instance.to_string(),
                        key: key.clone(),
                        value: value.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 实例的全部条目
    pub fn entries(&self, instance: &str) -> Option<&Entries> {
        self.instances.get(instance)
    }

    pub fn value(&self, instance: &str, key: &str) -> Option<&str> {
        self.instances
            .get(instance)
            .and_then(|entries| entries.get(key))
            .map(String::as_str)
    }

    pub fn instance_names(&self) -> Vec<&str> {
        self.instances.keys().map(String::as_str).collect()
    }

    pub fn selected_instance(&self) -> Option<&str> {
        self.selected_instance.as_deref()
    }

    pub fn selection(&self) -> Option<&EntryRef> {
        self.selected_entry.as_ref()
    }

    /// 当前选中条目的行
    pub fn selected_row(&self) -> Option<Row> {
        let entry = self.selected_entry.as_ref()?;
        let value = self.value(&entry.instance, &entry.key)?;
        Some(Row {
            instance: entry.instance.clone(),
            key: entry.key.clone(),
            value: value.to_string(),
        })
    }

    /// 所有实例的条目总数
    pub fn len(&self) -> usize {
        self.instances.values().map(|entries| entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    fn target_instance<'a>(&self, instance_name: Option<&'a str>) -> &'a str {
        match self.variant {
            Variant::Single => DEFAULT_INSTANCE,
            Variant::Multi => {
                if instance_name.is_none() {
                    tracing::debug!("Frame without instanceName, using {}", DEFAULT_INSTANCE);
                }
                resolve_instance(instance_name)
            }
        }
    }

    fn known_instance(&self, instance: &str) -> Option<String> {
        let instance = self.target_instance(Some(instance));
        if self.instances.contains_key(instance) {
            Some(instance.to_string())
        } else {
            tracing::debug!("Ignoring local edit of unannounced instance {}", instance);
            None
        }
    }

    /// 首次出现的实例，返回是否新建
    fn announce(&mut self, instance: &str) -> bool {
        if self.instances.contains_key(instance) {
            return false;
        }
        self.instances.insert(instance.to_string(), Entries::new());
        self.bump();
        true
    }

    fn upsert(&mut self, instance: &str, key: &str, value: &str) -> bool {
        let entries = self.instances.entry(instance.to_string()).or_default();
        if entries.get(key).map(String::as_str) == Some(value) {
            return false;
        }
        entries.insert(key.to_string(), value.to_string());
        self.bump();
        true
    }

    /// 删除条目（不保留墓碑），被删条目正被选中时清除选择
    fn remove(&mut self, instance: &str, key: &str) -> bool {
        let removed = self
            .instances
            .get_mut(instance)
            .and_then(|entries| entries.remove(key))
            .is_some();

        let selected = self
            .selected_entry
            .as_ref()
            .is_some_and(|entry| entry.instance == instance && entry.key == key);
        if selected {
            self.selected_entry = None;
        }

        if removed || selected {
            self.bump();
        }
        removed
    }

    fn select(&mut self, entry: EntryRef) {
        if self.variant == Variant::Multi {
            self.selected_instance = Some(entry.instance.clone());
        }
        if self.selected_entry.as_ref() != Some(&entry) {
            self.selected_entry = Some(entry);
            self.bump();
        }
    }

    fn bump(&mut self) {
        self.version += 1;
    }
}

impl Default for MirrorState {
    fn default() -> Self {
        Self::new(Variant::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn multi_snapshot(instance: &str, entries: &[(&str, &str)]) -> SnapshotPayload {
        let data = entries
            .iter()
            .map(|(k, v)| (k.to_string(), Some(v.to_string())))
            .collect();
        let mut instances = BTreeMap::new();
        instances.insert(instance.to_string(), data);
        SnapshotPayload::Multi(instances)
    }

    #[test]
    fn test_upsert_then_delete_removes_key() {
        let mut state = MirrorState::new(Variant::Multi);
        assert!(state.apply_delta("A", "k", Some("v")));
        assert_eq!(state.value("A", "k"), Some("v"));

        assert!(state.apply_delta("A", "k", None));
        assert!(!state.entries("A").unwrap().contains_key("k"));
    }

    #[test]
    fn test_snapshot_is_additive() {
        let mut state = MirrorState::new(Variant::Multi);
        state.apply_snapshot(multi_snapshot("A", &[("x", "1")]));
        state.apply_snapshot(multi_snapshot("B", &[("y", "2")]));

        assert_eq!(state.value("A", "x"), Some("1"));
        assert_eq!(state.value("B", "y"), Some("2"));

        // 同一实例的新快照不会删除未出现的 key
        state.apply_snapshot(multi_snapshot("A", &[("z", "3")]));
        assert_eq!(state.value("A", "x"), Some("1"));
        assert_eq!(state.value("A", "z"), Some("3"));
    }

    #[test]
    fn test_snapshot_null_value_deletes() {
        let mut state = MirrorState::new(Variant::Multi);
        state.apply_delta("A", "k", Some("v"));

        let mut data = BTreeMap::new();
        data.insert("k".to_string(), None);
        let mut instances = BTreeMap::new();
        instances.insert("A".to_string(), data);
        state.apply_snapshot(SnapshotPayload::Multi(instances));

        assert_eq!(state.value("A", "k"), None);
    }

    #[test]
    fn test_snapshot_shape_mismatch_ignored() {
        let mut state = MirrorState::new(Variant::Single);
        assert_eq!(state.apply_snapshot(multi_snapshot("A", &[("x", "1")])), 0);
        assert!(state.entries("A").is_none());
    }

    #[test]
    fn test_delete_clears_selection() {
        let mut state = MirrorState::new(Variant::Multi);
        state.apply_delta("A", "k", Some("v"));
        assert!(state.select_entry(Some(EntryRef::new("A", "k"))));
        assert_eq!(state.selection(), Some(&EntryRef::new("A", "k")));

        state.apply_delta("A", "k", None);
        assert_eq!(state.selection(), None);
    }

    #[test]
    fn test_delete_of_other_key_keeps_selection() {
        let mut state = MirrorState::new(Variant::Multi);
        state.apply_delta("A", "k", Some("v"));
        state.apply_delta("A", "j", Some("w"));
        state.select_entry(Some(EntryRef::new("A", "k")));

        state.apply_delta("A", "j", None);
        assert_eq!(state.selection(), Some(&EntryRef::new("A", "k")));
    }

    #[test]
    fn test_optimistic_set_then_echo_is_idempotent() {
        let mut state = MirrorState::new(Variant::Multi);
        state.apply_delta("A", "other", Some("x"));

        let command = state.optimistic_set("A", "k", "v1").unwrap();
        assert_eq!(
            command,
            MirrorCommand::SetValue {
                key: "k".to_string(),
                value: "v1".to_string(),
                instance_name: Some("A".to_string()),
            }
        );
        assert_eq!(state.selection(), Some(&EntryRef::new("A", "k")));
        assert_eq!(state.selected_instance(), Some("A"));

        let version = state.version();
        assert!(!state.apply_delta("A", "k", Some("v1")));
        assert_eq!(state.version(), version);
        assert_eq!(state.value("A", "k"), Some("v1"));
        assert_eq!(state.entries("A").unwrap().len(), 2);
    }

    #[test]
    fn test_optimistic_ops_require_announced_instance() {
        let mut state = MirrorState::new(Variant::Multi);
        assert!(state.optimistic_set("ghost", "k", "v").is_none());
        assert!(state.optimistic_delete_key("ghost", "k").is_none());
        assert!(state.optimistic_clear_instance("ghost").is_none());
        assert!(state.instance_names().is_empty());
    }

    #[test]
    fn test_optimistic_delete() {
        let mut state = MirrorState::new(Variant::Multi);
        state.apply_delta("A", "k", Some("v"));
        state.select_entry(Some(EntryRef::new("A", "k")));

        let command = state.optimistic_delete_key("A", "k").unwrap();
        assert_eq!(command.kind(), "remove-key");
        assert_eq!(state.value("A", "k"), None);
        assert_eq!(state.selection(), None);
    }

    #[test]
    fn test_clear_instance_clears_selection() {
        let mut state = MirrorState::new(Variant::Multi);
        state.apply_snapshot(multi_snapshot("A", &[("k", "v"), ("j", "w")]));
        state.apply_snapshot(multi_snapshot("B", &[("y", "2")]));
        state.select_instance("A");
        state.select_entry(Some(EntryRef::new("A", "k")));

        let command = state.optimistic_clear_instance("A").unwrap();
        assert_eq!(
            command,
            MirrorCommand::RemoveAll {
                instance_name: Some("A".to_string())
            }
        );
        assert!(state.entries("A").unwrap().is_empty());
        assert_eq!(state.selected_instance(), None);
        assert_eq!(state.selection(), None);
        // 其他实例不受影响
        assert_eq!(state.value("B", "y"), Some("2"));
    }

    #[test]
    fn test_select_instance_reprojects_rows() {
        let mut state = MirrorState::new(Variant::Multi);
        state.apply_snapshot(multi_snapshot("A", &[("x", "1")]));
        state.apply_snapshot(multi_snapshot("B", &[("y", "2"), ("z", "3")]));
        assert!(state.rows().is_empty());

        assert!(state.select_instance("A"));
        assert_eq!(state.rows().len(), 1);

        state.select_entry(Some(EntryRef::new("A", "x")));
        assert!(state.select_instance("B"));
        let keys: Vec<String> = state.rows().into_iter().map(|r| r.key).collect();
        assert_eq!(keys, vec!["y", "z"]);
        // 切换实例清除条目选择
        assert_eq!(state.selection(), None);

        assert!(!state.select_instance("missing"));
        assert_eq!(state.selected_instance(), Some("B"));
    }

    #[test]
    fn test_single_variant() {
        let mut state = MirrorState::new(Variant::Single);
        let message = AgentMessage::KeyChanged {
            key: "token".to_string(),
            value: Some("abc".to_string()),
            instance_name: None,
        };
        assert!(state.apply_message(message));

        // 没有实例选择步骤，整个存储始终可见
        assert!(!state.select_instance(DEFAULT_INSTANCE));
        assert_eq!(state.rows().len(), 1);

        let command = state.optimistic_set("", "token", "xyz").unwrap();
        assert_eq!(
            command,
            MirrorCommand::SetValue {
                key: "token".to_string(),
                value: "xyz".to_string(),
                instance_name: None,
            }
        );
        assert_eq!(state.rows()[0].value, "xyz");
        assert_eq!(state.selected_instance(), None);
    }

    #[test]
    fn test_multi_frame_without_instance_uses_default() {
        let mut state = MirrorState::new(Variant::Multi);
        let message = AgentMessage::KeyChanged {
            key: "token".to_string(),
            value: Some("abc".to_string()),
            instance_name: None,
        };
        assert!(state.apply_message(message));

        assert_eq!(state.instance_names(), vec![DEFAULT_INSTANCE]);
        assert_eq!(state.value(DEFAULT_INSTANCE, "token"), Some("abc"));
    }

    #[test]
    fn test_select_entry_requires_existing_entry() {
        let mut state = MirrorState::new(Variant::Multi);
        state.apply_delta("A", "k", Some("v"));
        assert!(!state.select_entry(Some(EntryRef::new("A", "missing"))));
        assert!(state.select_entry(Some(EntryRef::new("A", "k"))));
        assert_eq!(state.selected_row().unwrap().value, "v");
        assert!(state.select_entry(None));
        assert_eq!(state.selection(), None);
    }

    #[test]
    fn test_row_value_json() {
        let row = Row {
            instance: "A".to_string(),
            key: "k".to_string(),
            value: r#"{"theme":"dark"}"#.to_string(),
        };
        assert_eq!(row.value_json()["theme"], "dark");

        let plain = Row {
            value: "not json".to_string(),
            ..row
        };
        assert_eq!(plain.value_json(), serde_json::Value::String("not json".to_string()));
    }
}
