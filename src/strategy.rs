//! Strategy contract
//!
//! A strategy is a named, pluggable transformer from [`ColorContext`] to
//! [`ColorResult`]. Strategies report failure through `Err`; the engine records
//! the failure per strategy and never lets it escape the pipeline.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::context::{ColorContext, ColorResult, DEFAULT_ACCENT_HEX};
use crate::error::Result;

/// Coarse quality class a strategy advertises to the selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Performance,
    #[default]
    Balanced,
    Quality,
}

impl QualityTier {
    pub fn as_str(&self) -> &str {
        match self {
            QualityTier::Performance => "performance",
            QualityTier::Balanced => "balanced",
            QualityTier::Quality => "quality",
        }
    }
}

#[async_trait]
pub trait ColorStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn can_process(&self, context: &ColorContext) -> bool;

    /// Expected cost in milliseconds, used for ranking and budgeting
    fn estimated_cost(&self, context: &ColorContext) -> f64;

    fn quality_tier(&self) -> QualityTier {
        QualityTier::Balanced
    }

    /// `cancel` fires when the owning cycle is abandoned (watchdog or dispose).
    /// Strategies that hand work to other tasks should stop it when it fires.
    async fn process(&self, context: &ColorContext, cancel: CancellationToken) -> Result<ColorResult>;
}

/// Always-available passthrough: raw colors unchanged, accent pinned to the default
#[derive(Debug, Default, Clone)]
pub struct FallbackStrategy;

impl FallbackStrategy {
    pub const NAME: &'static str = "fallback-passthrough";

    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ColorStrategy for FallbackStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn can_process(&self, _context: &ColorContext) -> bool {
        true
    }

    fn estimated_cost(&self, _context: &ColorContext) -> f64 {
        0.0
    }

    fn quality_tier(&self) -> QualityTier {
        QualityTier::Performance
    }

    async fn process(&self, context: &ColorContext, _cancel: CancellationToken) -> Result<ColorResult> {
        Ok(ColorResult::from_colors(Self::NAME, context.raw_colors.clone(), context)
            .with_accent(DEFAULT_ACCENT_HEX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fallback_is_passthrough() {
        let strategy = FallbackStrategy::new();
        let context = ColorContext::new("t1", [("VIBRANT", "#ff0000"), ("weird", "not-hex")]);

        assert!(strategy.can_process(&context));
        let result = strategy.process(&context, CancellationToken::new()).await.unwrap();

        assert_eq!(result.processed_colors, context.raw_colors);
        assert_eq!(result.accent_hex, DEFAULT_ACCENT_HEX);
        assert_eq!(result.metadata.strategy_name, FallbackStrategy::NAME);
    }
}
