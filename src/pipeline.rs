//! Per-frame pipeline: detections → engines → payload assembly.
//!
//! The pipeline runs synchronously on the caller's thread. Assembled payloads
//! leave through a channel so publishing happens elsewhere.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};

use crate::detection::DetectionRecord;
use crate::measurement::{DistanceEngine, DistanceSink, EngineConfig, EngineDiagnostics};
use crate::movement::MovementConfig;
use crate::telemetry::{CombinedPayload, PayloadAssembler, PayloadConfig};
use crate::utils::{Clock, SystemClock};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub engines: Vec<EngineConfig>,
    pub payload: PayloadConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            engines: vec![EngineConfig::frame_to_target(), EngineConfig::marker_spring()],
            payload: PayloadConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        tracing::info!(path = %path.as_ref().display(), engines = config.engines.len(), "loaded pipeline config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engines.is_empty() {
            return Err(Error::InvalidConfig("pipeline needs at least one engine".to_string()));
        }

        let mut fields = Vec::with_capacity(self.engines.len());
        for engine in &self.engines {
            engine.validate()?;
            if fields.contains(&engine.field) {
                return Err(Error::InvalidConfig(format!("field {} is produced by two engines", engine.field)));
            }
            fields.push(engine.field.clone());
        }

        self.payload.validate()?;
        for required in &self.payload.required_fields {
            if !fields.contains(required) {
                return Err(Error::InvalidConfig(format!("no engine produces payload field {}", required)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineDiagnostics {
    pub frames: u64,
    pub engines: Vec<EngineDiagnostics>,
    pub payloads_emitted: u64,
    pub payloads_rejected: u64,
    pub pending_fields: Vec<String>,
}

/// All engines of a deployment feeding one [`PayloadAssembler`].
pub struct MeasurementPipeline {
    engines: Vec<DistanceEngine>,
    assembler: Arc<PayloadAssembler>,
    frames: u64,
}

impl MeasurementPipeline {
    pub fn new(config: PipelineConfig, output: Sender<CombinedPayload>) -> Result<Self> {
        Self::with_clock(config, output, Arc::new(SystemClock))
    }

    pub fn with_clock(config: PipelineConfig, output: Sender<CombinedPayload>, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let assembler = Arc::new(PayloadAssembler::with_clock(config.payload, output, Arc::clone(&clock)));
        let sink: Arc<dyn DistanceSink> = assembler.clone();
        let engines = config
            .engines
            .into_iter()
            .map(|engine| DistanceEngine::with_clock(engine, Arc::clone(&clock)).with_sink(Arc::clone(&sink)))
            .collect();

        Ok(Self {
            engines,
            assembler,
            frames: 0,
        })
    }

    /// Run every engine on one frame.
    ///
    /// Returns the distances computed this frame keyed by payload field,
    /// whether or not the movement gate let them through.
    pub fn process_frame(&mut self, detections: &[DetectionRecord]) -> BTreeMap<String, f64> {
        self.frames += 1;
        let mut distances = BTreeMap::new();
        for engine in &mut self.engines {
            if let Some(distance) = engine.compute(detections) {
                distances.insert(engine.config().field.clone(), distance);
            }
        }
        distances
    }

    pub fn engine(&self, field: &str) -> Option<&DistanceEngine> {
        self.engines.iter().find(|e| e.config().field == field)
    }

    pub fn engine_mut(&mut self, field: &str) -> Option<&mut DistanceEngine> {
        self.engines.iter_mut().find(|e| e.config().field == field)
    }

    pub fn engines(&self) -> &[DistanceEngine] {
        &self.engines
    }

    /// Hot-swap the movement thresholds of the engine reporting `field`.
    pub fn reload_movement_config(&mut self, field: &str, config: MovementConfig) -> Result<()> {
        let engine = self
            .engine_mut(field)
            .ok_or_else(|| Error::InvalidConfig(format!("no engine produces field {}", field)))?;
        engine.reload_movement_config(config)?;
        tracing::info!(field, "movement config reloaded");
        Ok(())
    }

    pub fn diagnostics(&self) -> PipelineDiagnostics {
        PipelineDiagnostics {
            frames: self.frames,
            engines: self.engines.iter().map(DistanceEngine::diagnostics).collect(),
            payloads_emitted: self.assembler.emitted(),
            payloads_rejected: self.assembler.rejected(),
            pending_fields: self.assembler.pending_fields(),
        }
    }
}

impl std::fmt::Debug for MeasurementPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeasurementPipeline")
            .field("engines", &self.engines)
            .field("frames", &self.frames)
            .finish()
    }
}
