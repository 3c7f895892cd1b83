//! Error taxonomy surfaced on the pipeline's error event stream.

use thiserror::Error;

/// Faults the pipeline reports to its consumer instead of crashing a worker.
#[derive(Debug, Error)]
pub enum SpeechError {
    /// The capture stream could not be opened after all retries.
    #[error("microphone capture failed: {0}")]
    CaptureInit(String),

    /// A decode call failed; the offending quantum was dropped.
    #[error("engine decode failed: {0}")]
    EngineDecode(String),

    /// Encoding a finished raw capture failed; the raw file is kept.
    #[error("encoding {path} failed: {reason}")]
    Encode { path: String, reason: String },

    /// Audio arrived before any recognizer session was initialized.
    #[error("no active session: {0}")]
    SessionMismatch(String),
}
