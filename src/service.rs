//! Stimulus/response interface for soma_chroma
//!
//! Exposes the engine to orchestrators over JSON so the daemon and embedded
//! callers speak the same protocol.
//!
//! ## Available Operations
//!
//! 1. `colors.process` - Run a submission through the engine
//! 2. `metrics` - Engine metrics snapshot
//! 3. `engine.state` - Processing state and queue contents
//! 4. `cache.invalidate` - Drop all cached results
//! 5. `chroma.capabilities` - Capability card query
//!
//! ## Example
//!
//! ```rust,no_run
//! use soma_chroma::service::{ChromaService, Service, Stimulus};
//! use soma_chroma::ColorEngine;
//! use serde_json::json;
//! use std::collections::HashMap;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let service = ChromaService::new(ColorEngine::builder().build()?);
//!
//! let response = service.stimulate(Stimulus {
//!     op: "colors.process".to_string(),
//!     input: json!({
//!         "kind": "context",
//!         "payload": { "trackId": "t1", "rawColors": { "VIBRANT": "#ff0000" } }
//!     }),
//!     context: HashMap::new(),
//! }).await?;
//! println!("{}", response.output["accentHex"]);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use thiserror::Error;
use tokio::time::Instant;

use crate::context::Submission;
use crate::engine::ColorEngine;

pub const OPERATIONS: [&str; 5] = [
    "colors.process",
    "metrics",
    "engine.state",
    "cache.invalidate",
    "chroma.capabilities",
];

/// Input to a service operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stimulus {
    pub op: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub context: HashMap<String, String>,
}

/// Output of a service operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    pub output: Value,
    pub latency_ms: u64,
    pub cost: Option<f64>,
}

#[async_trait]
pub trait Service: Send + Sync {
    async fn stimulate(&self, stimulus: Stimulus) -> Result<Response, ServiceError>;
    fn describe(&self) -> ServiceCard;
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Service capability card
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCard {
    pub name: String,
    pub version: String,
    pub description: String,
    pub tags: Vec<String>,
    pub execution_modes: Vec<String>,
    pub functions: Vec<FunctionCard>,
}

/// Function capability card
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCard {
    pub name: String,
    pub description: String,
    pub idempotent: bool,
    pub side_effects: Vec<String>,
    pub input_schema: Option<Value>,
    pub output_schema: Value,
}

pub struct ChromaService {
    engine: ColorEngine,
}

impl ChromaService {
    pub fn new(engine: ColorEngine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &ColorEngine {
        &self.engine
    }

    async fn handle_process(&self, input: Value) -> Result<Value, ServiceError> {
        let submission: Submission = serde_json::from_value(input)
            .map_err(|e| ServiceError::InvalidInput(format!("expected a submission: {}", e)))?;
        let result = self.engine.submit(submission).await;
        Ok(serde_json::to_value(&result)?)
    }

    async fn handle_state(&self) -> Result<Value, ServiceError> {
        Ok(json!({
            "state": self.engine.state().await,
            "queueLength": self.engine.queue_len().await,
            "pendingTracks": self.engine.pending_track_ids().await,
            "cachedResults": self.engine.cache_len().await,
        }))
    }

    async fn handle_invalidate(&self) -> Result<Value, ServiceError> {
        let dropped = self.engine.cache_len().await;
        self.engine.invalidate_cache().await;
        Ok(json!({ "invalidated": dropped }))
    }

    fn handle_capabilities(&self) -> Result<Value, ServiceError> {
        Ok(serde_json::to_value(self.describe())?)
    }
}

#[async_trait]
impl Service for ChromaService {
    async fn stimulate(&self, stimulus: Stimulus) -> Result<Response, ServiceError> {
        let start = Instant::now();

        let output = match stimulus.op.as_str() {
            "colors.process" => self.handle_process(stimulus.input).await?,
            "metrics" => serde_json::to_value(self.engine.metrics().snapshot())?,
            "engine.state" => self.handle_state().await?,
            "cache.invalidate" => self.handle_invalidate().await?,
            "chroma.capabilities" => self.handle_capabilities()?,
            _ => {
                return Ok(Response {
                    ok: false,
                    output: json!({
                        "error": "UnsupportedOperation",
                        "op": stimulus.op,
                        "available_operations": OPERATIONS,
                    }),
                    latency_ms: start.elapsed().as_millis() as u64,
                    cost: None,
                });
            }
        };

        Ok(Response {
            ok: true,
            output,
            latency_ms: start.elapsed().as_millis() as u64,
            cost: None,
        })
    }

    fn describe(&self) -> ServiceCard {
        ServiceCard {
            name: "soma_chroma".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: "Perceptual color harmonization engine for album-art palettes".to_string(),
            tags: ["color", "oklab", "palette", "harmonization", "music"]
                .iter()
                .map(|t| t.to_string())
                .collect(),
            execution_modes: vec!["embedded".to_string(), "server".to_string()],
            functions: vec![
                FunctionCard {
                    name: "colors.process".to_string(),
                    description: "Harmonize extracted colors into a processed palette and accent".to_string(),
                    idempotent: false,
                    side_effects: vec!["publishes colors:harmonized".to_string(), "writes result cache".to_string()],
                    input_schema: Some(json!({
                        "type": "object",
                        "properties": {
                            "kind": { "type": "string", "enum": ["context", "raw_event"] },
                            "payload": {
                                "type": "object",
                                "properties": {
                                    "trackId": { "type": "string" },
                                    "rawColors": { "type": "object" },
                                    "musicData": { "type": "object" }
                                },
                                "required": ["trackId", "rawColors"]
                            }
                        },
                        "required": ["kind", "payload"]
                    })),
                    output_schema: json!({
                        "type": "object",
                        "properties": {
                            "processedColors": { "type": "object" },
                            "accentHex": { "type": "string" },
                            "accentRgb": { "type": "string" },
                            "metadata": { "type": "object" }
                        }
                    }),
                },
                FunctionCard {
                    name: "metrics".to_string(),
                    description: "Engine counters, latency and success rate".to_string(),
                    idempotent: true,
                    side_effects: vec![],
                    input_schema: None,
                    output_schema: json!({ "type": "object" }),
                },
                FunctionCard {
                    name: "engine.state".to_string(),
                    description: "Processing state, queue length and queued track ids".to_string(),
                    idempotent: true,
                    side_effects: vec![],
                    input_schema: None,
                    output_schema: json!({
                        "type": "object",
                        "properties": {
                            "state": { "type": "string", "enum": ["idle", "processing", "disposed"] },
                            "queueLength": { "type": "integer" },
                            "pendingTracks": { "type": "array", "items": { "type": "string" } },
                            "cachedResults": { "type": "integer" }
                        }
                    }),
                },
                FunctionCard {
                    name: "cache.invalidate".to_string(),
                    description: "Drop every cached result".to_string(),
                    idempotent: true,
                    side_effects: vec!["clears result cache".to_string()],
                    input_schema: None,
                    output_schema: json!({
                        "type": "object",
                        "properties": { "invalidated": { "type": "integer" } }
                    }),
                },
                FunctionCard {
                    name: "chroma.capabilities".to_string(),
                    description: "This capability card".to_string(),
                    idempotent: true,
                    side_effects: vec![],
                    input_schema: None,
                    output_schema: json!({ "type": "object" }),
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> ChromaService {
        ChromaService::new(ColorEngine::builder().build().unwrap())
    }

    fn stimulus(op: &str, input: Value) -> Stimulus {
        Stimulus {
            op: op.to_string(),
            input,
            context: HashMap::new(),
        }
    }

    #[test]
    fn test_card_lists_every_operation() {
        let card = service().describe();
        let names: Vec<_> = card.functions.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, OPERATIONS.to_vec());
    }

    #[tokio::test]
    async fn test_process_rejects_untagged_input() {
        let result = service()
            .stimulate(stimulus("colors.process", json!({ "trackId": "t1" })))
            .await;
        assert!(matches!(result, Err(ServiceError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_invalidate_reports_dropped_entries() {
        let service = service();
        service
            .stimulate(stimulus(
                "colors.process",
                json!({ "kind": "context", "payload": {
                    "trackId": "t1",
                    "rawColors": { "VIBRANT": "#ff0000" },
                    "timestamp": "2026-01-01T00:00:00Z"
                }}),
            ))
            .await
            .unwrap();

        let response = service.stimulate(stimulus("cache.invalidate", Value::Null)).await.unwrap();
        assert_eq!(response.output["invalidated"], 1);
        assert_eq!(service.engine().cache_len().await, 0);
    }
}
