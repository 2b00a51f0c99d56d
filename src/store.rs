//! 存储引擎能力集
//!
//! Agent 只通过 [`KvStore`] 访问真实存储。存储引擎必须在每次变更时
//! （无论写入来自谁）通知已注册的 listener，这是 Mirror 保持一致的基础。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::protocol::{resolve_instance, Variant, DEFAULT_INSTANCE};

/// 变更回调，参数为发生变化的 key
pub type ChangeListener = Arc<dyn Fn(&str) + Send + Sync>;

/// Listener ID
pub type ListenerId = u64;

/// 键值存储能力集
pub trait KvStore: Send + Sync {
    /// 列出所有 key
    fn list_keys(&self) -> Result<Vec<String>>;

    /// 读取 value，不存在返回 `None`
    fn get_value(&self, key: &str) -> Result<Option<String>>;

    /// 写入 value
    fn set_value(&self, key: &str, value: &str) -> Result<()>;

    /// 删除 key
    fn delete_key(&self, key: &str) -> Result<()>;

    /// 删除所有 key
    fn clear_all(&self) -> Result<()>;

    /// 注册变更回调
    fn add_listener(&self, listener: ChangeListener) -> ListenerId;

    /// 注销变更回调
    fn remove_listener(&self, id: ListenerId);
}

/// 内存存储（线程安全）
///
/// 回调在释放锁之后执行，因此回调内部可以安全地读取本存储。
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<String, String>>,
    listeners: RwLock<BTreeMap<ListenerId, ChangeListener>>,
    next_listener_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 使用初始数据创建（不触发回调）
    pub fn with_entries<I, K, V>(entries: I) -> Arc<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let store = Self::default();
        {
            let mut data = store.data.write();
            for (key, value) in entries {
                data.insert(key.into(), value.into());
            }
        }
        Arc::new(store)
    }

    /// 当前 key 数量
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    fn notify(&self, key: &str) {
        // 先 clone 出 listener 列表，避免回调期间持有锁
        let listeners: Vec<ChangeListener> = self.listeners.read().values().cloned().collect();
        for listener in listeners {
            listener(key);
        }
    }
}

impl KvStore for MemoryStore {
    fn list_keys(&self) -> Result<Vec<String>> {
        Ok(self.data.read().keys().cloned().collect())
    }

    fn get_value(&self, key: &str) -> Result<Option<String>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn set_value(&self, key: &str, value: &str) -> Result<()> {
        self.data.write().insert(key.to_string(), value.to_string());
        self.notify(key);
        Ok(())
    }

    fn delete_key(&self, key: &str) -> Result<()> {
        self.data.write().remove(key);
        self.notify(key);
        Ok(())
    }

    fn clear_all(&self) -> Result<()> {
        let removed: Vec<String> = {
            let mut data = self.data.write();
            let keys = data.keys().cloned().collect();
            data.clear();
            keys
        };
        for key in &removed {
            self.notify(key);
        }
        Ok(())
    }

    fn add_listener(&self, listener: ChangeListener) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.listeners.write().insert(id, listener);
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.write().remove(&id);
    }
}

/// Agent 托管的实例集合
#[derive(Clone)]
pub struct StoreSet {
    variant: Variant,
    instances: BTreeMap<String, Arc<dyn KvStore>>,
}

impl StoreSet {
    /// 多实例模式（空集合，通过 [`StoreSet::with_instance`] 添加）
    pub fn new() -> Self {
        Self {
            variant: Variant::Multi,
            instances: BTreeMap::new(),
        }
    }

    /// 单实例模式：唯一的未命名存储
    pub fn single(store: Arc<dyn KvStore>) -> Self {
        let mut instances = BTreeMap::new();
        instances.insert(DEFAULT_INSTANCE.to_string(), store);
        Self {
            variant: Variant::Single,
            instances,
        }
    }

    /// 添加命名实例（名称重复时覆盖）
    pub fn with_instance(mut self, name: &str, store: Arc<dyn KvStore>) -> Self {
        if self.variant == Variant::Single {
            tracing::warn!("Ignoring instance {} on single-instance store set", name);
            return self;
        }
        self.instances.insert(name.to_string(), store);
        self
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    /// 按线上 instanceName 查找
    ///
    /// 单实例模式忽略 instanceName，始终返回唯一存储。
    pub fn lookup(&self, instance_name: Option<&str>) -> Option<&Arc<dyn KvStore>> {
        match self.variant {
            Variant::Single => self.instances.get(DEFAULT_INSTANCE),
            Variant::Multi => self.instances.get(resolve_instance(instance_name)),
        }
    }

    /// 按内部实例名查找
    pub fn get(&self, instance: &str) -> Option<&Arc<dyn KvStore>> {
        self.instances.get(instance)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn KvStore>)> {
        self.instances.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.instances.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// 初始化检查：没有任何实例时功能无法启用
    pub fn ensure_available(&self) -> Result<()> {
        if self.instances.is_empty() {
            return Err(Error::Unavailable("no key-value store instance registered".to_string()));
        }
        Ok(())
    }
}

impl Default for StoreSet {
    fn default() -> Self {
        Self::new()
    }
}
