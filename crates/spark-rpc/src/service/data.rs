use std::sync::Arc;

use parking_lot::Mutex;

use crate::wire::{Map, Value};

/// 服务级数据。
///
/// 挂载时从 [`ServiceMeta`](super::ServiceMeta) 拷贝一份配置映射，此后同一服务的所有动作
/// 共享这份数据，读写由服务自己的互斥锁串行化。
#[derive(Clone, Debug, Default)]
pub struct ServiceData {
    inner: Arc<Mutex<Map>>,
}

impl ServiceData {
    pub(crate) fn new(data: Map) -> Self {
        Self {
            inner: Arc::new(Mutex::new(data)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().get(key).cloned()
    }

    /// 写入键值，返回被覆盖的旧值。
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.inner.lock().insert(key.into(), value.into())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner.lock().remove(key)
    }

    pub fn snapshot(&self) -> Map {
        self.inner.lock().clone()
    }
}
