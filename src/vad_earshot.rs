//! Earshot-powered Voice Activity Detector adapter implementing `SpeechVad`.

use crate::engine::SpeechVad;
use earshot::{VoiceActivityDetector, VoiceActivityProfile};
use std::collections::VecDeque;

/// Earshot frame length at 16 kHz (10 ms).
const FRAME_SAMPLES: usize = 160;

/// Thin wrapper that adapts `earshot` to the crate's `SpeechVad` trait.
///
/// Windows whose frames produce any speech verdict are buffered in the ring
/// so the drain discipline of the endpoint loop applies to them.
pub struct EarshotVad {
    detector: VoiceActivityDetector,
    window_size: usize,
    pending: Vec<f32>,
    scratch: Vec<i16>,
    speech_active: bool,
    ring: VecDeque<Vec<f32>>,
}

impl EarshotVad {
    pub fn new(window_size: usize) -> Self {
        Self {
            detector: VoiceActivityDetector::new(VoiceActivityProfile::AGGRESSIVE),
            window_size: window_size.max(FRAME_SAMPLES),
            pending: Vec::new(),
            scratch: Vec::with_capacity(FRAME_SAMPLES),
            speech_active: false,
            ring: VecDeque::new(),
        }
    }

    fn predict_window(&mut self, window: &[f32]) -> bool {
        let mut any_speech = false;
        for frame in window.chunks(FRAME_SAMPLES) {
            self.scratch.clear();
            for sample in frame.iter().copied() {
                self.scratch
                    .push((sample.clamp(-1.0, 1.0) * 32_768.0) as i16);
            }
            // Earshot requires full frames; pad the tail with silence.
            self.scratch.resize(FRAME_SAMPLES, 0);
            if let Ok(true) = self.detector.predict_16khz(&self.scratch) {
                any_speech = true;
            }
        }
        any_speech
    }
}

impl SpeechVad for EarshotVad {
    fn accept_waveform(&mut self, samples: &[f32]) {
        self.pending.extend_from_slice(samples);
        while self.pending.len() >= self.window_size {
            let rest = self.pending.split_off(self.window_size);
            let window = std::mem::replace(&mut self.pending, rest);
            if self.predict_window(&window) {
                self.speech_active = true;
                self.ring.push_back(window);
            } else {
                self.speech_active = false;
            }
        }
    }

    fn is_speech_detected(&mut self) -> bool {
        self.speech_active
    }

    fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    fn pop(&mut self) {
        self.ring.pop_front();
    }

    fn reset(&mut self) {
        self.detector.reset();
        self.pending.clear();
        self.speech_active = false;
        self.ring.clear();
    }
}
