//! Result cache and per-track dedup window
//!
//! Both maps are plain single-owner structures; the engine keeps them behind its
//! state lock. Time is read from `tokio::time::Instant` so paused-clock tests can
//! drive TTLs.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::context::{ColorContext, ColorResult};

/// What the result cache keys on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKeyMode {
    /// Sorted role names only; palettes with the same roles share an entry
    Roles,
    /// Sorted role/color pairs
    #[default]
    Content,
}

/// Order-independent cache key for a context's inputs
///
/// Entries are sorted before joining, so two maps with the same entries
/// fingerprint identically however they were built. Energy is quantized to one
/// decimal so jitter in the analysis feed does not defeat the cache.
pub fn fingerprint(context: &ColorContext, mode: CacheKeyMode) -> String {
    let mut parts: Vec<String> = context
        .raw_colors
        .iter()
        .map(|(role, hex)| match mode {
            CacheKeyMode::Roles => role.clone(),
            CacheKeyMode::Content => format!("{}={}", role, hex.trim().to_ascii_lowercase()),
        })
        .collect();
    parts.sort_unstable();

    let energy = match context.energy() {
        Some(e) if e.is_finite() => format!("e:{}", (e.clamp(0.0, 1.0) * 10.0).round() as u8),
        _ => "e:-".to_string(),
    };

    format!("{}#{}", parts.join("|"), energy)
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub result: ColorResult,
    pub written_at: Instant,
}

#[derive(Debug)]
pub struct ResultCache {
    entries: HashMap<String, CacheEntry>,
    ttl: Duration,
    soft_cap: usize,
    sweep_every: usize,
    writes_since_sweep: usize,
}

impl ResultCache {
    pub fn new(ttl: Duration, soft_cap: usize, sweep_every: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            soft_cap: soft_cap.max(1),
            sweep_every: sweep_every.max(1),
            writes_since_sweep: 0,
        }
    }

    /// Hit only while `now - written_at < ttl`; a stale entry is dropped
    pub fn get(&mut self, key: &str) -> Option<ColorResult> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if now.duration_since(entry.written_at) < self.ttl => Some(entry.result.clone()),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Always stamps `written_at = now`, whatever the context's own timestamp
    pub fn insert(&mut self, key: String, result: ColorResult) {
        self.entries.insert(
            key,
            CacheEntry {
                result,
                written_at: Instant::now(),
            },
        );

        self.writes_since_sweep += 1;
        if self.entries.len() > self.soft_cap && self.writes_since_sweep >= self.sweep_every {
            self.sweep();
        }
    }

    /// Drop expired entries; if still above twice the soft cap, evict oldest first
    pub fn sweep(&mut self) {
        self.writes_since_sweep = 0;
        let now = Instant::now();
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, e| now.duration_since(e.written_at) < ttl);

        let hard_cap = self.soft_cap * 2;
        if self.entries.len() > hard_cap {
            let mut by_age: Vec<(String, Instant)> = self
                .entries
                .iter()
                .map(|(k, e)| (k.clone(), e.written_at))
                .collect();
            by_age.sort_by_key(|(_, written_at)| *written_at);
            let excess = self.entries.len() - hard_cap;
            for (key, _) in by_age.into_iter().take(excess) {
                self.entries.remove(&key);
            }
        }

        debug!("Cache sweep: {} -> {} entries", before, self.entries.len());
    }

    pub fn invalidate_all(&mut self) {
        self.entries.clear();
        self.writes_since_sweep = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What the dedup window keys on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupKeyMode {
    /// Same track id inside the window returns the previous result even if the
    /// colors changed
    #[default]
    Track,
    /// Track id plus the color fingerprint
    Content,
}

#[derive(Debug, Clone)]
pub struct DedupEntry {
    pub last_processed_at: Instant,
    pub result: ColorResult,
}

#[derive(Debug)]
pub struct DedupCache {
    entries: HashMap<String, DedupEntry>,
    ttl: Duration,
    max_entries: usize,
    mode: DedupKeyMode,
}

impl DedupCache {
    pub const DEFAULT_MAX_ENTRIES: usize = 100;

    pub fn new(ttl: Duration, mode: DedupKeyMode) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            max_entries: Self::DEFAULT_MAX_ENTRIES,
            mode,
        }
    }

    pub fn key_for(&self, context: &ColorContext) -> String {
        match self.mode {
            DedupKeyMode::Track => context.track_id.clone(),
            DedupKeyMode::Content => {
                format!("{}@{}", context.track_id, fingerprint(context, CacheKeyMode::Content))
            }
        }
    }

    /// Previous result if this key was fully processed inside the window
    pub fn check(&self, context: &ColorContext) -> Option<ColorResult> {
        let entry = self.entries.get(&self.key_for(context))?;
        (Instant::now().duration_since(entry.last_processed_at) < self.ttl).then(|| entry.result.clone())
    }

    pub fn record(&mut self, context: &ColorContext, result: ColorResult) {
        let now = Instant::now();
        self.entries.insert(
            self.key_for(context),
            DedupEntry {
                last_processed_at: now,
                result,
            },
        );

        if self.entries.len() > self.max_entries {
            let ttl = self.ttl;
            self.entries.retain(|_, e| now.duration_since(e.last_processed_at) < ttl);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
