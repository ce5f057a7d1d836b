//! 加载标记
//!
//! 按选择表达式（如 `*,users(*)`）记录“该形状的全量加载已完成”。
//! 没有自动失效：标记一旦设置，重复的全量加载直接返回缓存内容。

use std::collections::HashSet;
use std::sync::RwLock;

#[derive(Debug, Default)]
pub struct LoadMarkers {
    loaded: RwLock<HashSet<String>>,
}

impl LoadMarkers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self, key: &str) -> bool {
        self.loaded
            .read()
            .map(|loaded| loaded.contains(key))
            .unwrap_or(false)
    }

    pub fn mark(&self, key: &str) {
        if let Ok(mut loaded) = self.loaded.write() {
            loaded.insert(key.to_string());
        }
    }

    /// 清除某个形状的标记，下次 `select` 会重新请求后端
    pub fn clear(&self, key: &str) {
        if let Ok(mut loaded) = self.loaded.write() {
            loaded.remove(key);
        }
    }

    pub fn clear_all(&self) {
        if let Ok(mut loaded) = self.loaded.write() {
            loaded.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.loaded.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
