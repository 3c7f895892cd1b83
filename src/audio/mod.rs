//! Audio capture, resampling, and level metering.
//!
//! Microphone audio arrives as 16-bit mono quanta at the hardware rate; this
//! module converts it to the model rate for recognition and derives the UI
//! level signal. Capture is CPAL-based and format-agnostic past the callback.

mod capture;
mod dispatch;
mod meter;
mod resample;
#[cfg(test)]
mod tests;

pub use capture::MicCapture;
pub use dispatch::DispatchQueue;
pub use meter::LevelMeter;
pub use resample::{resample, samples_to_float};
