//! soma_chroma - perceptual color harmonization for the SOMA platform
//!
//! Turns colors extracted from album art into a processed palette and accent
//! color. Strategies are selected per context, run under a watchdog, merged,
//! and enhanced in OKLAB space according to the track's mood.

pub mod cache;
pub mod capabilities;
pub mod color;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod merge;
pub mod metrics;
pub mod perceptual;
pub mod queue;
pub mod selector;
pub mod service;
pub mod settings;
pub mod strategies;
pub mod strategy;

pub use color::{OkLab, OkLch, Rgb};
pub use config::EngineConfig;
pub use context::{ColorContext, ColorResult, ColorsExtractedEvent, MusicData, Submission};
pub use engine::{ColorEngine, ColorEngineBuilder};
pub use error::{ChromaError, Result};
pub use merge::ConflictPolicy;
pub use queue::EngineState;
pub use strategy::{ColorStrategy, QualityTier};
