//! Combined telemetry payloads and their assembly from distance samples.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::measurement::{DistanceSample, DistanceSink};
use crate::utils::{Clock, SystemClock};
use crate::{Error, Result};

/// Timestamp layout of outbound payloads (UTC, microseconds).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Reasons a payload is refused before it reaches the transport.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("required field {0} is missing")]
    MissingField(String),

    #[error("field {0} is not a finite number")]
    NonFinite(String),

    #[error("field {field} = {value} is outside [{min}, {max})")]
    OutOfRange { field: String, value: f64, min: f64, max: f64 },

    #[error("all primary fields are zero")]
    AllZero,
}

/// A field computed as `source * scale`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedField {
    pub name: String,
    pub source: String,
    pub scale: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadConfig {
    pub required_fields: Vec<String>,
    pub derived_fields: Vec<DerivedField>,
    /// Inclusive lower bound for every field.
    pub min_value: f64,
    /// Exclusive upper bound for every field.
    pub max_value: f64,
    /// All primary fields at exactly zero usually means nothing was detected.
    pub reject_all_zero: bool,
    /// Samples older than this never make it into a payload.
    pub max_sample_age_secs: f64,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            required_fields: vec!["markerZ".to_string(), "buttonX".to_string()],
            derived_fields: vec![DerivedField {
                name: "marker".to_string(),
                source: "markerZ".to_string(),
                scale: 9.1,
            }],
            min_value: 0.0,
            max_value: 1000.0,
            reject_all_zero: true,
            max_sample_age_secs: 2.0,
        }
    }
}

impl PayloadConfig {
    pub fn validate(&self) -> Result<()> {
        if self.required_fields.is_empty() {
            return Err(Error::InvalidConfig("payload needs at least one required field".to_string()));
        }
        if !(self.min_value < self.max_value) {
            return Err(Error::InvalidConfig(format!(
                "payload range [{}, {}) is empty",
                self.min_value, self.max_value
            )));
        }
        for derived in &self.derived_fields {
            if !self.required_fields.contains(&derived.source) {
                return Err(Error::InvalidConfig(format!(
                    "derived field {} reads unknown field {}",
                    derived.name, derived.source
                )));
            }
        }
        if !(self.max_sample_age_secs > 0.0) {
            return Err(Error::InvalidConfig("max_sample_age_secs must be positive".to_string()));
        }
        Ok(())
    }
}

/// One outbound record: a timestamp plus named distance fields.
///
/// Serializes flat, e.g.
/// `{"timestamp":"2024-05-01T10:00:00.000000Z","buttonX":10.1,"marker":29.12,"markerZ":3.2}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedPayload {
    pub timestamp: String,
    #[serde(flatten)]
    pub fields: BTreeMap<String, f64>,
}

impl CombinedPayload {
    /// Assemble and validate a payload from primary field values.
    pub fn build(
        config: &PayloadConfig,
        primary: &BTreeMap<String, f64>,
        timestamp: DateTime<Utc>,
    ) -> std::result::Result<Self, ValidationError> {
        let mut fields = BTreeMap::new();
        for name in &config.required_fields {
            let value = primary
                .get(name)
                .copied()
                .ok_or_else(|| ValidationError::MissingField(name.clone()))?;
            fields.insert(name.clone(), value);
        }
        for derived in &config.derived_fields {
            if let Some(source) = fields.get(&derived.source).copied() {
                fields.insert(derived.name.clone(), source * derived.scale);
            }
        }

        let payload = Self {
            timestamp: timestamp.format(TIMESTAMP_FORMAT).to_string(),
            fields,
        };
        payload.validate(config)?;
        Ok(payload)
    }

    pub fn validate(&self, config: &PayloadConfig) -> std::result::Result<(), ValidationError> {
        for name in &config.required_fields {
            if !self.fields.contains_key(name) {
                return Err(ValidationError::MissingField(name.clone()));
            }
        }

        for (name, &value) in &self.fields {
            if !value.is_finite() {
                return Err(ValidationError::NonFinite(name.clone()));
            }
            if value < config.min_value || value >= config.max_value {
                return Err(ValidationError::OutOfRange {
                    field: name.clone(),
                    value,
                    min: config.min_value,
                    max: config.max_value,
                });
            }
        }

        if config.reject_all_zero && config.required_fields.iter().all(|name| self.fields[name] == 0.0) {
            return Err(ValidationError::AllZero);
        }

        Ok(())
    }

    pub fn get(&self, field: &str) -> Option<f64> {
        self.fields.get(field).copied()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    value: f64,
    timestamp: DateTime<Utc>,
    fresh: bool,
}

/// Collects samples per field and emits a [`CombinedPayload`] once every
/// required field holds a fresh, unexpired sample.
///
/// Emitting consumes the slots, so a field must be measured again before it
/// can appear in another payload.
pub struct PayloadAssembler {
    config: PayloadConfig,
    slots: Mutex<BTreeMap<String, Slot>>,
    output: Sender<CombinedPayload>,
    clock: Arc<dyn Clock>,
    emitted: AtomicU64,
    rejected: AtomicU64,
}

impl PayloadAssembler {
    pub fn new(config: PayloadConfig, output: Sender<CombinedPayload>) -> Self {
        Self::with_clock(config, output, Arc::new(SystemClock))
    }

    /// Create an assembler that judges sample age and stamps payloads with
    /// `clock`.
    pub fn with_clock(config: PayloadConfig, output: Sender<CombinedPayload>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            slots: Mutex::new(BTreeMap::new()),
            output,
            clock,
            emitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PayloadConfig {
        &self.config
    }

    /// Payloads handed to the output channel.
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Complete cycles dropped by validation.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Fields currently holding a fresh sample.
    pub fn pending_fields(&self) -> Vec<String> {
        match self.slots.lock() {
            Ok(slots) => slots.iter().filter(|(_, s)| s.fresh).map(|(k, _)| k.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn try_assemble(&self, slots: &mut BTreeMap<String, Slot>, now: DateTime<Utc>) -> Option<CombinedPayload> {
        let max_age_ms = self.config.max_sample_age_secs * 1000.0;
        let mut primary = BTreeMap::new();
        for name in &self.config.required_fields {
            let slot = slots.get(name)?;
            let age_ms = (now - slot.timestamp).num_milliseconds() as f64;
            if !slot.fresh || age_ms > max_age_ms {
                return None;
            }
            primary.insert(name.clone(), slot.value);
        }

        for name in &self.config.required_fields {
            if let Some(slot) = slots.get_mut(name) {
                slot.fresh = false;
            }
        }

        match CombinedPayload::build(&self.config, &primary, now) {
            Ok(payload) => Some(payload),
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, ?primary, "combined payload rejected");
                None
            }
        }
    }
}

impl DistanceSink for PayloadAssembler {
    fn accept(&self, sample: DistanceSample) {
        if !self.config.required_fields.contains(&sample.source_tag) {
            tracing::debug!(field = %sample.source_tag, "sample for unknown payload field ignored");
            return;
        }

        let payload = {
            let mut slots = match self.slots.lock() {
                Ok(slots) => slots,
                Err(poisoned) => poisoned.into_inner(),
            };
            slots.insert(
                sample.source_tag,
                Slot {
                    value: sample.distance,
                    timestamp: sample.timestamp,
                    fresh: true,
                },
            );
            self.try_assemble(&mut slots, self.clock.utc_now())
        };

        if let Some(payload) = payload {
            if self.output.send(payload).is_ok() {
                self.emitted.fetch_add(1, Ordering::Relaxed);
            } else {
                tracing::warn!("combined payload dropped, telemetry worker is gone");
            }
        }
    }
}

impl std::fmt::Debug for PayloadAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadAssembler")
            .field("config", &self.config)
            .field("emitted", &self.emitted())
            .field("rejected", &self.rejected())
            .finish()
    }
}
