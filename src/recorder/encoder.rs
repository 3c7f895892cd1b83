//! Raw PCM to container encoding for finished captures.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Encodes a finished raw capture into its archival container.
///
/// Implementations run on the encode queue, never on the recording worker.
pub trait AudioEncoder: Send + Sync {
    fn encode(&self, raw: &Path, target: &Path) -> Result<()>;
    /// Extension of the encoded file, without the dot.
    fn target_extension(&self) -> &'static str;
}

/// Default encoder wrapping raw little-endian i16 mono PCM in a WAV header.
pub struct WavEncoder {
    sample_rate: u32,
}

impl WavEncoder {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

impl AudioEncoder for WavEncoder {
    fn encode(&self, raw: &Path, target: &Path) -> Result<()> {
        let bytes = fs::read(raw).with_context(|| format!("reading {}", raw.display()))?;
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(target, spec)
            .with_context(|| format!("creating {}", target.display()))?;
        for pair in bytes.chunks_exact(2) {
            writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
        }
        writer.finalize().context("finalizing wav")?;
        Ok(())
    }

    fn target_extension(&self) -> &'static str {
        "wav"
    }
}
