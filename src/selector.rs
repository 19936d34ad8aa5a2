//! Strategy selection
//!
//! Ranking is a pure function of the context, the criteria and the registry
//! contents. The last tie-break is the strategy name, never timing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::capabilities::DeviceCapabilities;
use crate::context::ColorContext;
use crate::error::{ChromaError, Result};
use crate::settings::{self, SettingsStore};
use crate::strategy::{ColorStrategy, QualityTier};

/// Upper bound on strategies run together in multi-strategy mode
pub const MAX_PARALLEL_STRATEGIES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceTier {
    Low,
    #[default]
    Medium,
    High,
}

impl PerformanceTier {
    /// Per-frame processing budget in milliseconds
    pub fn budget_ms(&self) -> f64 {
        match self {
            PerformanceTier::Low => 8.0,
            PerformanceTier::Medium => 16.0,
            PerformanceTier::High => 33.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCriteria {
    pub has_webgl: bool,
    pub memory_mb: u64,
    pub is_mobile: bool,
}

impl Default for DeviceCriteria {
    fn default() -> Self {
        Self {
            has_webgl: true,
            memory_mb: 8192,
            is_mobile: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionCriteria {
    pub performance_tier: PerformanceTier,
    pub quality_tier: QualityTier,
    pub device_capabilities: DeviceCriteria,
    #[serde(default)]
    pub settings_context: BTreeMap<String, String>,
}

impl SelectionCriteria {
    /// Derive criteria from the probe output and the current settings
    pub fn from_environment(capabilities: &DeviceCapabilities, store: &dyn SettingsStore) -> Self {
        let device = DeviceCriteria {
            has_webgl: capabilities.gpu.supports_webgl,
            memory_mb: capabilities.memory.total,
            is_mobile: capabilities.is_mobile,
        };

        let performance_tier = if !device.has_webgl || device.is_mobile || device.memory_mb < 2048 {
            PerformanceTier::Low
        } else if device.memory_mb < 8192 {
            PerformanceTier::Medium
        } else {
            PerformanceTier::High
        };

        let quality_tier = match store.get_str(settings::KEY_QUALITY).as_deref() {
            Some("performance") => QualityTier::Performance,
            Some("quality") => QualityTier::Quality,
            _ => QualityTier::Balanced,
        };

        let settings_context = [
            settings::KEY_ACCENT,
            settings::KEY_FLAVOR,
            settings::KEY_INTENSITY,
            settings::KEY_PREFERRED_STRATEGY,
        ]
        .iter()
        .filter_map(|key| {
            let value = store.get(key)?;
            let value = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
            Some((key.to_string(), value))
        })
        .collect();

        Self {
            performance_tier,
            quality_tier,
            device_capabilities: device,
            settings_context,
        }
    }

    fn budget_ms(&self) -> f64 {
        let budget = self.performance_tier.budget_ms();
        if self.device_capabilities.is_mobile || self.device_capabilities.memory_mb < 2048 {
            budget / 2.0
        } else {
            budget
        }
    }
}

pub trait StrategySelector: Send + Sync {
    /// Up to `limit` strategies, best first. Errors when nothing can process.
    fn select_strategies(
        &self,
        context: &ColorContext,
        criteria: &SelectionCriteria,
        limit: usize,
    ) -> Result<Vec<Arc<dyn ColorStrategy>>>;
}

/// Selector over a fixed registry of strategies
#[derive(Default, Clone)]
pub struct RegistrySelector {
    strategies: Vec<Arc<dyn ColorStrategy>>,
}

impl RegistrySelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn ColorStrategy>) -> Self {
        self.register(strategy);
        self
    }

    /// A strategy registered under an existing name replaces it
    pub fn register(&mut self, strategy: Arc<dyn ColorStrategy>) {
        self.strategies.retain(|s| s.name() != strategy.name());
        self.strategies.push(strategy);
    }

    pub fn names(&self) -> Vec<String> {
        self.strategies.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

fn quality_rank(wanted: QualityTier, offered: QualityTier) -> u8 {
    match wanted {
        QualityTier::Quality => 2 - offered as u8,
        QualityTier::Balanced => (offered as i8 - QualityTier::Balanced as i8).unsigned_abs(),
        QualityTier::Performance => 0,
    }
}

impl StrategySelector for RegistrySelector {
    fn select_strategies(
        &self,
        context: &ColorContext,
        criteria: &SelectionCriteria,
        limit: usize,
    ) -> Result<Vec<Arc<dyn ColorStrategy>>> {
        if self.strategies.is_empty() {
            return Err(ChromaError::StrategySelection("strategy registry is empty".to_string()));
        }

        let budget = criteria.budget_ms();
        let mut ranked: Vec<(Arc<dyn ColorStrategy>, f64)> = self
            .strategies
            .iter()
            .filter(|s| s.can_process(context))
            .map(|s| (Arc::clone(s), s.estimated_cost(context)))
            .collect();

        if ranked.is_empty() {
            return Err(ChromaError::StrategySelection(format!(
                "no strategy can process track {}",
                context.track_id
            )));
        }

        ranked.sort_by(|(a, cost_a), (b, cost_b)| {
            let over_a = *cost_a > budget;
            let over_b = *cost_b > budget;
            over_a
                .cmp(&over_b)
                .then_with(|| {
                    quality_rank(criteria.quality_tier, a.quality_tier())
                        .cmp(&quality_rank(criteria.quality_tier, b.quality_tier()))
                })
                .then_with(|| cost_a.total_cmp(cost_b))
                .then_with(|| a.name().cmp(b.name()))
        });

        if let Some(preferred) = criteria.settings_context.get(settings::KEY_PREFERRED_STRATEGY) {
            if let Some(pos) = ranked.iter().position(|(s, _)| s.name() == preferred) {
                let entry = ranked.remove(pos);
                ranked.insert(0, entry);
            }
        }

        ranked.truncate(limit.max(1));
        let selected: Vec<_> = ranked.into_iter().map(|(s, _)| s).collect();

        debug!(
            "Selected strategies for {}: {:?}",
            context.track_id,
            selected.iter().map(|s| s.name()).collect::<Vec<_>>()
        );

        Ok(selected)
    }
}
