//! Perceptual (OKLAB) coordination stage
//!
//! Maps raw colors plus music mood into an enhanced color set. The stage only
//! looks at the context, never at strategy output, so it can run alongside any
//! strategy mix. Its output is folded into results in two ways:
//!
//! - [`apply_to_result`]: one result gains `oklab-<role>` entries
//! - [`blend_outcomes`]: every successful strategy output is coordinated at once,
//!   keeping each producer's color (extra producers land under
//!   `<role>-variant-<n>`)

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::color::{Rgb, MAX_CHROMA};
use crate::context::{ColorContext, ColorMap, ColorResult, MusicData, StrategyOutcome};
use crate::error::Result;

pub const OKLAB_PREFIX: &str = "oklab-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmotionalState {
    Energetic,
    Uplifted,
    Calm,
    Melancholic,
    Balanced,
}

impl EmotionalState {
    /// Energy above 0.8 always reads as energetic
    pub fn from_music(music: Option<&MusicData>) -> Self {
        let Some(music) = music else {
            return EmotionalState::Balanced;
        };
        if music.energy > 0.8 {
            EmotionalState::Energetic
        } else if music.energy >= 0.5 && music.valence >= 0.6 {
            EmotionalState::Uplifted
        } else if music.energy < 0.4 && music.valence < 0.4 {
            EmotionalState::Melancholic
        } else if music.energy < 0.4 {
            EmotionalState::Calm
        } else {
            EmotionalState::Balanced
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EmotionalState::Energetic => "energetic",
            EmotionalState::Uplifted => "uplifted",
            EmotionalState::Calm => "calm",
            EmotionalState::Melancholic => "melancholic",
            EmotionalState::Balanced => "balanced",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinationMetrics {
    pub emotional_state: EmotionalState,
    pub emotional_intensity: f64,
    pub lightness_shift: f64,
    pub chroma_scale: f64,
    pub strategies_coordinated: usize,
    pub variant_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinationOutput {
    /// Keyed by the raw role name (unprefixed)
    pub enhanced_colors: ColorMap,
    pub metrics: CoordinationMetrics,
}

#[async_trait]
pub trait PerceptualCoordinator: Send + Sync {
    async fn coordinate(&self, context: &ColorContext) -> Result<CoordinationOutput>;
}

/// OKLCh mood shaping: valence moves lightness, energy scales chroma
#[derive(Debug, Clone)]
pub struct OklabCoordinator {
    intensity: f64,
}

impl OklabCoordinator {
    pub fn new() -> Self {
        Self { intensity: 1.0 }
    }

    /// Scale the mood adjustments (0 disables them, 1 is the default strength)
    pub fn with_intensity(intensity: f64) -> Self {
        Self {
            intensity: intensity.clamp(0.0, 2.0),
        }
    }

    fn lightness_shift(&self, music: Option<&MusicData>) -> f64 {
        music.map_or(0.0, |m| (m.valence.clamp(0.0, 1.0) - 0.5) * 0.1 * self.intensity)
    }

    fn chroma_scale(&self, music: Option<&MusicData>) -> f64 {
        let Some(music) = music else {
            return 1.0;
        };
        let mut scale = 0.8 + music.energy.clamp(0.0, 1.0) * 0.4;
        if music.tempo.is_some_and(|bpm| bpm > 140.0) {
            scale += 0.05;
        }
        if let Some(genre) = music.genre.as_deref() {
            let genre = genre.to_ascii_lowercase();
            if ["ambient", "classical", "acoustic"].iter().any(|g| genre.contains(g)) {
                scale *= 0.9;
            }
        }
        1.0 + (scale - 1.0) * self.intensity
    }

    fn emotional_intensity(music: Option<&MusicData>) -> f64 {
        music.map_or(0.0, |m| {
            (m.energy.clamp(0.0, 1.0) * 0.6 + (m.valence.clamp(0.0, 1.0) - 0.5).abs() * 0.8).clamp(0.0, 1.0)
        })
    }
}

impl Default for OklabCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PerceptualCoordinator for OklabCoordinator {
    async fn coordinate(&self, context: &ColorContext) -> Result<CoordinationOutput> {
        let music = context.music_data.as_ref();
        let lightness_shift = self.lightness_shift(music);
        let chroma_scale = self.chroma_scale(music);

        let enhanced_colors: ColorMap = context
            .raw_colors
            .iter()
            .filter_map(|(role, hex)| {
                let mut lch = Rgb::from_hex(hex).ok()?.to_oklch();
                lch.l = (lch.l + lightness_shift).clamp(0.0, 1.0);
                lch.c = (lch.c * chroma_scale).clamp(0.0, MAX_CHROMA);
                Some((role.clone(), lch.to_hex()))
            })
            .collect();

        debug!(
            "OKLAB coordination: {} colors, shift={:.3}, scale={:.3}",
            enhanced_colors.len(),
            lightness_shift,
            chroma_scale
        );

        Ok(CoordinationOutput {
            enhanced_colors,
            metrics: CoordinationMetrics {
                emotional_state: EmotionalState::from_music(music),
                emotional_intensity: Self::emotional_intensity(music),
                lightness_shift,
                chroma_scale,
                strategies_coordinated: 1,
                variant_count: 0,
            },
        })
    }
}

/// Union the enhanced colors into a single result under the `oklab-` namespace
pub fn apply_to_result(mut result: ColorResult, output: CoordinationOutput) -> ColorResult {
    for (role, hex) in output.enhanced_colors {
        result.processed_colors.insert(format!("{}{}", OKLAB_PREFIX, role), hex);
    }
    result.metadata.coordination_metrics = Some(output.metrics);
    result
}

/// Coordinate several successful outcomes at once
///
/// Outcomes are taken in the given order: the first producer of a role is its
/// primary value, later distinct values become `<role>-variant-<n>`.
pub fn blend_outcomes(output: CoordinationOutput, successes: &[StrategyOutcome]) -> ColorResult {
    let Some(first) = successes.first() else {
        return ColorResult::fallback("no successful strategies to coordinate");
    };

    let mut per_role: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for outcome in successes {
        for (role, hex) in &outcome.result.processed_colors {
            per_role.entry(role.as_str()).or_default().push(hex.as_str());
        }
    }

    let mut blended: ColorMap = output
        .enhanced_colors
        .into_iter()
        .map(|(role, hex)| (format!("{}{}", OKLAB_PREFIX, role), hex))
        .collect();

    let mut variant_count = 0;
    for (role, producers) in per_role {
        let mut seen: Vec<&str> = Vec::with_capacity(producers.len());
        for hex in producers {
            if seen.iter().any(|s| s.eq_ignore_ascii_case(hex)) {
                continue;
            }
            if seen.is_empty() {
                blended.insert(role.to_string(), hex.to_string());
            } else {
                blended.insert(format!("{}-variant-{}", role, seen.len()), hex.to_string());
                variant_count += 1;
            }
            seen.push(hex);
        }
    }

    let mut strategies_used: Vec<String> = Vec::new();
    for name in successes.iter().flat_map(|o| o.result.metadata.strategies_used.iter()) {
        if !strategies_used.contains(name) {
            strategies_used.push(name.clone());
        }
    }

    let processing_time_ms = successes
        .iter()
        .map(|o| o.processing_time_ms)
        .fold(0.0, f64::max);

    let mut metrics = output.metrics;
    metrics.strategies_coordinated = successes.len();
    metrics.variant_count = variant_count;

    let mut result = first.result.clone();
    result.processed_colors = blended;
    result.metadata.strategy_name = "oklab-coordinated".to_string();
    result.metadata.strategies_used = strategies_used;
    result.metadata.processing_time_ms = processing_time_ms;
    result.metadata.timestamp = Utc::now();
    result.metadata.coordination_metrics = Some(metrics);
    result
}
