//! Pipeline configuration with serde-friendly defaults.
//!
//! Every knob has a default matching the shipped tuning, so a config file can
//! override just the fields it cares about and an empty `{}` is a valid
//! config.

use serde::{Deserialize, Serialize};

/// Rate the recognition models expect.
pub const DEFAULT_MODEL_RATE: u32 = 16_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub model_rate: u32,
    /// Duration of one audio quantum in milliseconds.
    pub quantum_ms: u32,
    /// Bound on the capture to recognition channel, in quanta.
    pub channel_capacity: usize,
    /// How long the recognition worker sleeps per loop while paused.
    pub pause_sleep_ms: u64,
    /// Attempts to open the capture stream before giving up.
    pub capture_retries: u32,
    pub capture_retry_delay_ms: u64,
    /// Substring match against input device names; `None` takes the default.
    pub input_device: Option<String>,
    /// Enable the JSON trace log.
    pub logs: bool,
    pub endpoint: EndpointConfig,
    pub recording: RecordingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_rate: DEFAULT_MODEL_RATE,
            quantum_ms: 100,
            channel_capacity: 32,
            pause_sleep_ms: 100,
            capture_retries: 5,
            capture_retry_delay_ms: 1_000,
            input_device: None,
            logs: false,
            endpoint: EndpointConfig::default(),
            recording: RecordingConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Samples per quantum after downsampling to the model rate.
    pub fn model_quantum_samples(&self) -> usize {
        (self.model_rate as usize * self.quantum_ms as usize) / 1_000
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.model_rate == 0 {
            return Err("model_rate must be non-zero".into());
        }
        if self.quantum_ms == 0 {
            return Err("quantum_ms must be non-zero".into());
        }
        if self.channel_capacity == 0 {
            return Err("channel_capacity must be non-zero".into());
        }
        if self.endpoint.vad_window_size == 0 {
            return Err("vad_window_size must be non-zero".into());
        }
        if self.endpoint.vad_patience < 0
            || self.endpoint.rule1_patience <= 0
            || self.endpoint.rule2_patience <= 0
        {
            return Err("patience values out of range".into());
        }
        Ok(())
    }
}

/// Tuning for the endpoint state machine, in quanta unless noted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Quanta a speech run survives after the VAD stops reporting speech.
    pub vad_patience: i32,
    /// Silent quanta between engine flushes during long silence.
    pub rule1_patience: i32,
    /// Trailing-silence quanta before an endpoint is declared.
    pub rule2_patience: i32,
    /// Samples per VAD analysis window at the model rate.
    pub vad_window_size: usize,
    /// Silence appended before the final phoneme decode.
    pub tail_padding_ms: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            vad_patience: 6,
            rule1_patience: 6,
            rule2_patience: 6,
            vad_window_size: 512,
            tail_padding_ms: 160,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Raw captures smaller than this are treated as accidental taps and
    /// deleted instead of encoded.
    pub min_keep_bytes: u64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            min_keep_bytes: 7_000,
        }
    }
}
