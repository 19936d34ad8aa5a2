//! Built-in strategies registered by the daemon

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::color::{Rgb, MAX_CHROMA};
use crate::context::{ColorContext, ColorMap, ColorResult};
use crate::error::{ChromaError, Result};
use crate::strategy::{ColorStrategy, QualityTier};

/// Normalizes colors and promotes the most chromatic one to accent
#[derive(Debug, Default, Clone)]
pub struct VibrantAccentStrategy;

impl VibrantAccentStrategy {
    pub const NAME: &'static str = "vibrant-accent";
}

#[async_trait]
impl ColorStrategy for VibrantAccentStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn can_process(&self, context: &ColorContext) -> bool {
        !context.raw_colors.is_empty()
    }

    fn estimated_cost(&self, _context: &ColorContext) -> f64 {
        1.0
    }

    fn quality_tier(&self) -> QualityTier {
        QualityTier::Performance
    }

    async fn process(&self, context: &ColorContext, _cancel: CancellationToken) -> Result<ColorResult> {
        let colors = context.valid_colors();
        if colors.is_empty() {
            return Err(ChromaError::strategy(Self::NAME, "no parseable colors"));
        }

        let accent = colors
            .values()
            .filter_map(|hex| Rgb::from_hex(hex).ok().map(|rgb| (hex, rgb.to_oklch().c)))
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(hex, _)| hex.clone());

        let result = ColorResult::from_colors(Self::NAME, colors, context);
        Ok(match accent {
            Some(hex) => result.with_accent(&hex),
            None => result,
        })
    }
}

/// Shifts every color in OKLCh by the track's mood
///
/// Energy widens or narrows chroma, valence lifts or darkens lightness. Needs
/// music data; without it the selector skips this strategy.
#[derive(Debug, Clone)]
pub struct MoodTintStrategy {
    strength: f64,
}

impl MoodTintStrategy {
    pub const NAME: &'static str = "mood-tint";

    pub fn new(strength: f64) -> Self {
        Self {
            strength: strength.clamp(0.0, 1.0),
        }
    }
}

impl Default for MoodTintStrategy {
    fn default() -> Self {
        Self::new(0.5)
    }
}

#[async_trait]
impl ColorStrategy for MoodTintStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn can_process(&self, context: &ColorContext) -> bool {
        context.music_data.is_some() && !context.raw_colors.is_empty()
    }

    fn estimated_cost(&self, context: &ColorContext) -> f64 {
        2.0 + context.raw_colors.len() as f64 * 0.25
    }

    fn quality_tier(&self) -> QualityTier {
        QualityTier::Quality
    }

    async fn process(&self, context: &ColorContext, cancel: CancellationToken) -> Result<ColorResult> {
        let music = context
            .music_data
            .as_ref()
            .ok_or_else(|| ChromaError::strategy(Self::NAME, "music data required"))?;

        let chroma_factor = 1.0 + (music.energy.clamp(0.0, 1.0) - 0.5) * self.strength;
        let lightness_delta = (music.valence.clamp(0.0, 1.0) - 0.5) * 0.2 * self.strength;

        let mut tinted = ColorMap::new();
        for (role, hex) in context.valid_colors() {
            if cancel.is_cancelled() {
                return Err(ChromaError::Cancelled);
            }
            let mut lch = Rgb::from_hex(&hex)?.to_oklch();
            lch.c = (lch.c * chroma_factor).clamp(0.0, MAX_CHROMA);
            lch.l = (lch.l + lightness_delta).clamp(0.02, 0.98);
            tinted.insert(role, lch.to_hex());
        }

        Ok(ColorResult::from_colors(Self::NAME, tinted, context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MusicData;

    #[tokio::test]
    async fn test_vibrant_picks_most_chromatic() {
        let context = ColorContext::new(
            "t1",
            [("MUTED", "#777777"), ("DARK_MUTED", "#333344"), ("other", "#00ff00")],
        );
        let result = VibrantAccentStrategy
            .process(&context, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.accent_hex, "#00ff00");
        assert_eq!(result.processed_colors.len(), 3);
    }

    #[tokio::test]
    async fn test_vibrant_fails_without_valid_colors() {
        let context = ColorContext::new("t1", [("VIBRANT", "nope")]);
        let err = VibrantAccentStrategy
            .process(&context, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ChromaError::StrategyExecution { .. }));
    }

    #[tokio::test]
    async fn test_mood_tint_requires_music() {
        let strategy = MoodTintStrategy::default();
        let plain = ColorContext::new("t1", [("VIBRANT", "#3366cc")]);
        assert!(!strategy.can_process(&plain));

        let moody = plain.with_music_data(MusicData::new(1.0, 1.0));
        assert!(strategy.can_process(&moody));
        let result = strategy.process(&moody, CancellationToken::new()).await.unwrap();

        let before = Rgb::from_hex("#3366cc").unwrap().to_oklch();
        let after = Rgb::from_hex(&result.processed_colors["VIBRANT"]).unwrap().to_oklch();
        assert!(after.l > before.l);
    }

    #[tokio::test]
    async fn test_mood_tint_honors_cancellation() {
        let context = ColorContext::new("t1", [("VIBRANT", "#3366cc")])
            .with_music_data(MusicData::new(0.5, 0.5));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = MoodTintStrategy::default().process(&context, cancel).await.unwrap_err();
        assert!(matches!(err, ChromaError::Cancelled));
    }
}
