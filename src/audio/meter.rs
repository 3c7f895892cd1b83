//! Exponentially smoothed peak level for UI feedback.

const SMOOTHING_ALPHA: f64 = 0.9;

/// Flicker floor: smoothed levels below this report as silence.
const LEVEL_FLOOR: f64 = 1.0;

/// Peak amplitude meter with exponential smoothing.
///
/// Owned by the level queue worker; one instance per controller.
#[derive(Debug, Clone)]
pub struct LevelMeter {
    smoothed: f64,
}

impl LevelMeter {
    pub fn new() -> Self {
        Self { smoothed: 0.0 }
    }

    /// Fold one quantum into the smoothed level and return the current value
    /// as a percentage in `[0, 100]`.
    pub fn on_audio(&mut self, buffer: &[i16]) -> f64 {
        let peak = buffer
            .iter()
            .map(|&s| i32::from(s).unsigned_abs())
            .max()
            .unwrap_or(0);

        let percentage = (f64::from(peak) / 32_767.0 * 100.0).clamp(0.0, 100.0);
        self.smoothed = SMOOTHING_ALPHA * self.smoothed + (1.0 - SMOOTHING_ALPHA) * percentage;

        if self.smoothed < LEVEL_FLOOR {
            0.0
        } else {
            self.smoothed
        }
    }
}

impl Default for LevelMeter {
    fn default() -> Self {
        Self::new()
    }
}
