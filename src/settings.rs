//! Settings store interface
//!
//! The engine reads a few keys when building selection criteria and listens for
//! changes so it can drop cached results that were computed under old settings.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

pub const KEY_ACCENT: &str = "accent-color";
pub const KEY_FLAVOR: &str = "catppuccin-flavor";
pub const KEY_INTENSITY: &str = "visual-intensity";
pub const KEY_QUALITY: &str = "quality-tier";
pub const KEY_PREFERRED_STRATEGY: &str = "preferred-strategy";

/// Changes to keys containing any of these fragments invalidate the result cache
pub const INVALIDATING_KEY_FRAGMENTS: &[&str] = &["accent", "flavor", "intensity"];

pub fn invalidates_cache(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    INVALIDATING_KEY_FRAGMENTS.iter().any(|f| key.contains(f))
}

#[derive(Debug, Clone, PartialEq)]
pub struct SettingChange {
    pub key: String,
    pub value: Value,
}

pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    /// Stream of changes; stores that never change may return a dead receiver
    fn subscribe(&self) -> broadcast::Receiver<SettingChange>;

    fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(str::to_string))
    }

    fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_f64())
    }
}

/// In-process settings map with change notifications
pub struct MemorySettings {
    values: RwLock<HashMap<String, Value>>,
    changes: broadcast::Sender<SettingChange>,
}

impl MemorySettings {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            values: RwLock::new(HashMap::new()),
            changes,
        }
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if let Ok(mut map) = self.values.write() {
            map.insert(key.clone(), value.clone());
        }
        debug!("Setting changed: {}", key);
        // No listeners is fine
        let _ = self.changes.send(SettingChange { key, value });
    }
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.read().ok().and_then(|map| map.get(key).cloned())
    }

    fn subscribe(&self) -> broadcast::Receiver<SettingChange> {
        self.changes.subscribe()
    }
}
