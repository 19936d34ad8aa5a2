//! Merge engine: N strategy outcomes in, one [`ColorResult`] out

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::color::average_hex;
use crate::context::{ColorResult, StrategyOutcome};
use crate::error::ChromaError;

/// How a conflicting role value from a secondary result is folded in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Keep the primary value, drop the incoming one
    Override,
    /// Keep the primary value and add the incoming one under `<role>-<strategy>`
    #[default]
    Merge,
    /// Per-channel average when both sides are `#rrggbb`, otherwise `Override`
    Average,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &str {
        match self {
            ConflictPolicy::Override => "override",
            ConflictPolicy::Merge => "merge",
            ConflictPolicy::Average => "average",
        }
    }
}

impl std::str::FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "override" => Ok(ConflictPolicy::Override),
            "merge" => Ok(ConflictPolicy::Merge),
            "average" => Ok(ConflictPolicy::Average),
            other => Err(format!("unknown conflict policy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MergeEngine {
    policy: ConflictPolicy,
}

impl MergeEngine {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    pub fn merge(&self, outcomes: Vec<StrategyOutcome>) -> ColorResult {
        let (mut successes, failures): (Vec<_>, Vec<_>) =
            outcomes.into_iter().partition(|o| o.success);

        if successes.is_empty() {
            let reason = failures
                .iter()
                .filter_map(|o| o.error.as_deref().map(|e| format!("{}: {}", o.strategy, e)))
                .collect::<Vec<_>>()
                .join("; ");
            let reason = if reason.is_empty() {
                "no strategies ran".to_string()
            } else {
                reason
            };
            return ColorResult::fallback(ChromaError::NoSuccessfulStrategies(reason).to_string());
        }

        if successes.len() == 1 {
            return successes.remove(0).result;
        }

        // Stable sort keeps selection order among equal timings
        successes.sort_by(|a, b| a.processing_time_ms.total_cmp(&b.processing_time_ms));

        let mut iter = successes.into_iter();
        let Some(primary) = iter.next() else {
            let err = ChromaError::NoSuccessfulStrategies("no strategies ran".to_string());
            return ColorResult::fallback(err.to_string());
        };

        let mut strategies_used = primary.result.metadata.strategies_used.clone();
        let mut slowest = primary.processing_time_ms;
        let mut merged = primary.result;

        for outcome in iter {
            slowest = slowest.max(outcome.processing_time_ms);
            for name in &outcome.result.metadata.strategies_used {
                if !strategies_used.contains(name) {
                    strategies_used.push(name.clone());
                }
            }

            for (role, incoming) in outcome.result.processed_colors {
                let Some(current) = merged.processed_colors.get(&role).cloned() else {
                    merged.processed_colors.insert(role, incoming);
                    continue;
                };
                if current == incoming {
                    continue;
                }

                match self.policy {
                    ConflictPolicy::Override => {}
                    ConflictPolicy::Merge => {
                        merged
                            .processed_colors
                            .insert(format!("{}-{}", role, outcome.strategy), incoming);
                    }
                    ConflictPolicy::Average => {
                        if let Some(mixed) = average_hex(&current, &incoming) {
                            merged.processed_colors.insert(role, mixed);
                        }
                    }
                }
            }
        }

        debug!(
            "Merged {} strategies with {} policy",
            strategies_used.len(),
            self.policy.as_str()
        );

        merged.metadata.strategy_name = "merged".to_string();
        merged.metadata.strategies_used = strategies_used;
        merged.metadata.processing_time_ms = slowest;
        merged.metadata.timestamp = Utc::now();
        merged
    }
}
