//! 有界 TTL 缓存
//!
//! 编排器持有的进程内映射（吞没标记、预回复冷却、检索结果、回合快照）统一用它实现：
//! 过期条目在访问时惰性清除，超过容量时淘汰最早写入的条目。

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

/// 单线程版本；跨任务共享时使用 SharedCache
pub struct TtlCache<K, V> {
    entries: HashMap<K, Entry<V>>,
    ttl: Option<Duration>,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V> TtlCache<K, V> {
    /// ttl 为 None 时条目不过期，只受容量约束
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    fn is_expired(&self, entry: &Entry<V>) -> bool {
        self.ttl
            .is_some_and(|ttl| entry.inserted_at.elapsed() >= ttl)
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        let expired = self.entries.get(key).map(|e| self.is_expired(e))?;
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key).map(|e| &e.value)
    }

    pub fn contains(&mut self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn insert(&mut self, key: K, value: V) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.purge_expired();
            if self.entries.len() >= self.capacity {
                self.evict_oldest();
            }
        }
        self.entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    pub fn purge_expired(&mut self) {
        if let Some(ttl) = self.ttl {
            self.entries.retain(|_, e| e.inserted_at.elapsed() < ttl);
        }
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.inserted_at)
            .map(|(k, _)| k.clone());
        if let Some(k) = oldest {
            self.entries.remove(&k);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 以 Mutex 包装的 TtlCache，读取返回克隆值；临界区只包含 map 操作
pub struct SharedCache<K, V> {
    inner: Mutex<TtlCache<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> SharedCache<K, V> {
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            inner: Mutex::new(TtlCache::new(capacity, ttl)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TtlCache<K, V>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().contains(key)
    }

    pub fn insert(&self, key: K, value: V) {
        self.lock().insert(key, value);
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.lock().remove(key)
    }

    /// 原子地「不存在则写入」，返回是否写入
    pub fn insert_if_absent(&self, key: K, value: V) -> bool {
        let mut guard = self.lock();
        if guard.contains(&key) {
            return false;
        }
        guard.insert(key, value);
        true
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
