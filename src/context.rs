//! Pipeline data model
//!
//! [`ColorContext`] is the unit of work, [`ColorResult`] the unit of output and
//! [`StrategyOutcome`] the per-strategy record handed to the merge stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use crate::color::{hex_to_rgb_string, normalize_hex, Rgb};
use crate::perceptual::CoordinationMetrics;

/// Catppuccin mauve, the accent shown whenever the pipeline cannot do better
pub const DEFAULT_ACCENT_HEX: &str = "#cba6f7";
pub const DEFAULT_ACCENT_RGB: &str = "203,166,247";

/// Role names tried, in order, when picking an accent from a color map
pub const ACCENT_ROLE_PRIORITY: &[&str] = &[
    "accent",
    "VIBRANT",
    "PRIMARY",
    "PROMINENT",
    "LIGHT_VIBRANT",
    "DARK_VIBRANT",
    "MUTED",
    "LIGHT_MUTED",
    "DARK_MUTED",
];

/// Role name → hex color. Ordered so iteration (and serialization) is stable.
pub type ColorMap = BTreeMap<String, String>;

/// Music analysis attached to the now-playing track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MusicData {
    /// 0.0 - 1.0
    pub energy: f64,
    /// 0.0 - 1.0
    pub valence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
    /// BPM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tempo: Option<f64>,
}

impl MusicData {
    pub fn new(energy: f64, valence: f64) -> Self {
        Self {
            energy,
            valence,
            genre: None,
            tempo: None,
        }
    }
}

/// Input to a single processing attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColorContext {
    pub raw_colors: ColorMap,
    pub track_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub music_data: Option<MusicData>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ColorContext {
    pub fn new<I, K, V>(track_id: impl Into<String>, raw_colors: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            raw_colors: raw_colors
                .into_iter()
                .map(|(role, hex)| (role.into(), hex.into()))
                .collect(),
            track_id: track_id.into(),
            music_data: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_music_data(mut self, music_data: MusicData) -> Self {
        self.music_data = Some(music_data);
        self
    }

    pub fn energy(&self) -> Option<f64> {
        self.music_data.as_ref().map(|m| m.energy)
    }

    /// Raw colors that parse, normalized to lower-case `#rrggbb`
    pub fn valid_colors(&self) -> ColorMap {
        self.raw_colors
            .iter()
            .filter_map(|(role, hex)| normalize_hex(hex).ok().map(|h| (role.clone(), h)))
            .collect()
    }
}

/// Inbound "colors extracted" payload as published by the artwork extractor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColorsExtractedEvent {
    pub raw_colors: ColorMap,
    pub track_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub music_data: Option<MusicData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl From<ColorsExtractedEvent> for ColorContext {
    fn from(event: ColorsExtractedEvent) -> Self {
        let mut raw_colors = ColorMap::new();
        for (role, hex) in event.raw_colors {
            match normalize_hex(&hex) {
                Ok(normalized) => {
                    raw_colors.insert(role, normalized);
                }
                Err(e) => warn!("Dropping extracted color {}={}: {}", role, hex, e),
            }
        }

        Self {
            raw_colors,
            track_id: event.track_id,
            music_data: event.music_data,
            timestamp: event.timestamp.unwrap_or_else(Utc::now),
        }
    }
}

/// What a caller hands the engine; the caller states which shape it has
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Submission {
    Context(ColorContext),
    RawEvent(ColorsExtractedEvent),
}

impl Submission {
    pub fn into_context(self) -> ColorContext {
        match self {
            Submission::Context(context) => context,
            Submission::RawEvent(event) => event.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetadata {
    pub strategy_name: String,
    #[serde(default)]
    pub strategies_used: Vec<String>,
    pub processing_time_ms: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordination_metrics: Option<CoordinationMetrics>,
}

/// Output of a processing attempt
///
/// `processed_colors` has no fixed key set: readers look up the roles they know
/// and must ignore `oklab-*`, `*-variant-N` and `<role>-<strategy>` extras.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColorResult {
    pub processed_colors: ColorMap,
    pub accent_hex: String,
    pub accent_rgb: String,
    pub metadata: ResultMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_context: Option<ColorContext>,
}

impl ColorResult {
    /// Build a result whose accent is picked from `processed_colors` by role priority
    pub fn from_colors(
        strategy_name: impl Into<String>,
        processed_colors: ColorMap,
        context: &ColorContext,
    ) -> Self {
        let accent = pick_accent(&processed_colors)
            .and_then(|hex| Rgb::from_hex(&hex).ok())
            .map(|rgb| (rgb.to_hex(), rgb.to_rgb_string()))
            .unwrap_or_else(|| (DEFAULT_ACCENT_HEX.to_string(), DEFAULT_ACCENT_RGB.to_string()));
        let strategy_name = strategy_name.into();

        Self {
            processed_colors,
            accent_hex: accent.0,
            accent_rgb: accent.1,
            metadata: ResultMetadata {
                strategies_used: vec![strategy_name.clone()],
                strategy_name,
                processing_time_ms: 0.0,
                timestamp: Utc::now(),
                error: None,
                coordination_metrics: None,
            },
            source_context: Some(context.clone()),
        }
    }

    /// Deterministic result used whenever an upstream stage fails irrecoverably
    pub fn fallback(error: impl Into<String>) -> Self {
        let mut processed_colors = ColorMap::new();
        processed_colors.insert("fallback".to_string(), DEFAULT_ACCENT_HEX.to_string());

        Self {
            processed_colors,
            accent_hex: DEFAULT_ACCENT_HEX.to_string(),
            accent_rgb: DEFAULT_ACCENT_RGB.to_string(),
            metadata: ResultMetadata {
                strategy_name: "fallback".to_string(),
                strategies_used: vec!["fallback".to_string()],
                processing_time_ms: 0.0,
                timestamp: Utc::now(),
                error: Some(error.into()),
                coordination_metrics: None,
            },
            source_context: None,
        }
    }

    pub fn with_accent(mut self, hex: &str) -> Self {
        if let Ok(rgb) = hex_to_rgb_string(hex) {
            self.accent_hex = hex.to_ascii_lowercase();
            self.accent_rgb = rgb;
        }
        self
    }

    pub fn is_fallback(&self) -> bool {
        self.metadata.strategy_name == "fallback"
    }
}

/// Pick the accent candidate from a color map: known roles first, then the
/// first valid color in key order
pub fn pick_accent(colors: &ColorMap) -> Option<String> {
    ACCENT_ROLE_PRIORITY
        .iter()
        .filter_map(|role| colors.get(*role))
        .chain(colors.values())
        .find_map(|hex| normalize_hex(hex).ok())
}

/// Record of one strategy invocation
#[derive(Debug, Clone)]
pub struct StrategyOutcome {
    pub strategy: String,
    pub result: ColorResult,
    pub processing_time_ms: f64,
    pub success: bool,
    pub error: Option<String>,
}

impl StrategyOutcome {
    pub fn succeeded(strategy: impl Into<String>, result: ColorResult, processing_time_ms: f64) -> Self {
        Self {
            strategy: strategy.into(),
            result,
            processing_time_ms,
            success: true,
            error: None,
        }
    }

    pub fn failed(strategy: impl Into<String>, error: impl Into<String>, processing_time_ms: f64) -> Self {
        let error = error.into();
        Self {
            strategy: strategy.into(),
            result: ColorResult::fallback(error.clone()),
            processing_time_ms,
            success: false,
            error: Some(error),
        }
    }
}
