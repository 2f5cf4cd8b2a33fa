use std::{any::Any, fmt, sync::Arc};

use dashmap::DashMap;

/// 上层保存会话标识时约定使用的键。
pub const SESSION_ID: &str = "session_id";

type AttributeValue = Arc<dyn Any + Send + Sync>;

/// 连接级的键值元数据表。
///
/// 核心层只负责存取，不理解任何键的语义；上层（如会话管理）借此在通道上挂载状态。
/// 内部使用 `DashMap`，可在任意调度线程上并发读写。
#[derive(Default)]
pub struct AttributeMap {
    entries: DashMap<String, AttributeValue>,
}

impl AttributeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入属性，返回是否覆盖了已有值。
    pub fn add_attribute<T>(&self, key: impl Into<String>, value: T) -> bool
    where
        T: Any + Send + Sync,
    {
        self.entries.insert(key.into(), Arc::new(value)).is_some()
    }

    /// 读取属性；键不存在或类型不符时返回 `None`。
    pub fn get_attribute<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let value = self.entries.get(key)?.value().clone();
        value.downcast::<T>().ok()
    }

    pub fn remove_attribute(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for AttributeMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        f.debug_struct("AttributeMap").field("keys", &keys).finish()
    }
}
