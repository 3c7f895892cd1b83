pub mod audio;
pub mod config;
pub mod controller;
pub mod endpoint;
pub mod engine;
pub mod error;
mod recognition;
pub mod recorder;
mod telemetry;
#[cfg(feature = "vad_earshot")]
pub mod vad_earshot;

pub use config::{EndpointConfig, PipelineConfig, RecordingConfig};
pub use controller::Controller;
pub use endpoint::TranscriptEvent;
pub use engine::{AsrMode, EngineFactory, SpeechVad, StreamingAsr};
pub use error::SpeechError;
pub use recognition::PausePredicate;
pub use recorder::{AudioEncoder, WavEncoder};
