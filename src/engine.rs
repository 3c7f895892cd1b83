//! Trait seams for the opaque streaming ASR and VAD engines.
//!
//! The neural models themselves live outside this crate; the pipeline only
//! depends on the narrow surfaces below. Word and phoneme recognition are the
//! same capability with different vocabularies, so the mode is a session
//! parameter rather than a separate trait.

use anyhow::Result;
use std::collections::HashMap;
use std::collections::VecDeque;

/// Vocabulary variant a recognizer session decodes with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AsrMode {
    /// Full-word transcripts via `StreamingAsr::text`.
    Word,
    /// Phoneme tokens via `StreamingAsr::tokens`, space-joined.
    Phoneme,
}

impl AsrMode {
    pub fn label(self) -> &'static str {
        match self {
            AsrMode::Word => "word",
            AsrMode::Phoneme => "phoneme",
        }
    }
}

/// Streaming speech recognizer.
///
/// `accept_waveform` only buffers; nothing is transcribed until `decode` is
/// driven while `is_ready` holds. `reset` recreates the decoding stream but
/// keeps the loaded model.
pub trait StreamingAsr: Send {
    fn accept_waveform(&mut self, samples: &[f32], sample_rate: u32);
    fn is_ready(&self) -> bool;
    fn decode(&mut self) -> Result<()>;
    fn text(&self) -> String;
    fn tokens(&self) -> Vec<String>;
    fn reset(&mut self, hotwords: Option<&str>, recreate: bool);
    fn input_finished(&mut self);
}

/// Voice activity detector with an internal ring of buffered speech segments.
///
/// # Frame Size Contract
/// Implementations are trained on frames much smaller than a capture quantum;
/// callers must feed `accept_waveform` windows of the configured size (e.g.
/// 512 samples at 16 kHz, ~32 ms).
pub trait SpeechVad: Send {
    fn accept_waveform(&mut self, samples: &[f32]);
    fn is_speech_detected(&mut self) -> bool;
    fn is_empty(&self) -> bool;
    fn pop(&mut self);
    fn reset(&mut self);
}

/// Builds engine instances for a `(language, mode)` pair.
///
/// Invoked lazily on the recognition worker the first time a pair is used;
/// the resulting session is cached and reset between utterances, never
/// recreated per utterance.
pub trait EngineFactory: Send {
    fn create_asr(&self, language: &str, mode: AsrMode) -> Result<Box<dyn StreamingAsr>>;
    fn create_vad(&self, window_size: usize) -> Result<Box<dyn SpeechVad>>;
}

/// One cached ASR engine plus its companion VAD.
pub struct RecognizerSession {
    asr: Box<dyn StreamingAsr>,
    vad: Box<dyn SpeechVad>,
    mode: AsrMode,
}

impl RecognizerSession {
    pub fn new(asr: Box<dyn StreamingAsr>, vad: Box<dyn SpeechVad>, mode: AsrMode) -> Self {
        Self { asr, vad, mode }
    }

    pub fn mode(&self) -> AsrMode {
        self.mode
    }

    pub fn asr(&mut self) -> &mut dyn StreamingAsr {
        self.asr.as_mut()
    }

    pub fn vad(&mut self) -> &mut dyn SpeechVad {
        self.vad.as_mut()
    }

    /// Extract the current decode result for this session's mode.
    pub fn result_text(&self) -> String {
        match self.mode {
            AsrMode::Word => self.asr.text(),
            AsrMode::Phoneme => self.asr.tokens().join(" "),
        }
    }

    /// Drain the VAD ring so stale speech segments cannot leak into the next
    /// utterance.
    pub fn drain_vad(&mut self) {
        while !self.vad.is_empty() {
            self.vad.pop();
        }
    }

    /// Recreate the decoding stream and clear VAD state. The model stays
    /// loaded.
    pub fn reset(&mut self, hotwords: Option<&str>) {
        self.asr.reset(hotwords, true);
        self.drain_vad();
        self.vad.reset();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    language: String,
    mode: AsrMode,
}

/// Lazily-built cache of recognizer sessions, one per `(language, mode)`.
///
/// Owned exclusively by the recognition worker; no locking needed.
pub struct SessionCache {
    factory: Box<dyn EngineFactory>,
    window_size: usize,
    sessions: HashMap<SessionKey, RecognizerSession>,
}

impl SessionCache {
    pub fn new(factory: Box<dyn EngineFactory>, window_size: usize) -> Self {
        Self {
            factory,
            window_size,
            sessions: HashMap::new(),
        }
    }

    pub fn session(&mut self, language: &str, mode: AsrMode) -> Result<&mut RecognizerSession> {
        let key = SessionKey {
            language: language.to_string(),
            mode,
        };
        if !self.sessions.contains_key(&key) {
            tracing::info!(language, mode = mode.label(), "creating recognizer session");
            let asr = self.factory.create_asr(language, mode)?;
            let vad = self.factory.create_vad(self.window_size)?;
            self.sessions
                .insert(key.clone(), RecognizerSession::new(asr, vad, mode));
        }
        Ok(self
            .sessions
            .get_mut(&key)
            .expect("session inserted above"))
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }
}

/// Energy-threshold VAD used when no neural detector is wired in.
///
/// Windows whose RMS level clears the threshold are buffered in the ring the
/// way a segmenting VAD would buffer speech, so the endpoint loop's drain
/// discipline behaves identically with either implementation.
pub struct EnergyVad {
    threshold_db: f32,
    speech_active: bool,
    ring: VecDeque<Vec<f32>>,
}

impl EnergyVad {
    pub fn new(threshold_db: f32) -> Self {
        Self {
            threshold_db,
            speech_active: false,
            ring: VecDeque::new(),
        }
    }

    fn window_db(samples: &[f32]) -> f32 {
        let energy: f32 = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
        let rms = energy.sqrt().max(1e-6);
        20.0 * rms.log10()
    }
}

impl SpeechVad for EnergyVad {
    fn accept_waveform(&mut self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        if Self::window_db(samples) >= self.threshold_db {
            self.speech_active = true;
            self.ring.push_back(samples.to_vec());
        } else {
            self.speech_active = false;
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
        self.speech_active = false;
        self.ring.clear();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Scripted fakes shared by the endpoint and worker tests.

    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    pub struct FakeAsrState {
        /// Result text returned by `text`/`tokens` after all pending decodes
        /// are drained.
        pub result: String,
        /// Lengths of every waveform handed to `accept_waveform`.
        pub accepted: Vec<usize>,
        /// How often the decoding stream was recreated.
        pub resets: usize,
        pub hotwords: Vec<String>,
        pub input_finished: usize,
        /// When set, the next `decode` call fails once.
        pub fail_next_decode: bool,
    }

    pub struct FakeAsr {
        state: Arc<Mutex<FakeAsrState>>,
        pending: usize,
    }

    impl FakeAsr {
        pub fn new(state: Arc<Mutex<FakeAsrState>>) -> Self {
            Self { state, pending: 0 }
        }
    }

    impl StreamingAsr for FakeAsr {
        fn accept_waveform(&mut self, samples: &[f32], _sample_rate: u32) {
            self.state
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .accepted
                .push(samples.len());
            self.pending += 1;
        }

        fn is_ready(&self) -> bool {
            self.pending > 0
        }

        fn decode(&mut self) -> Result<()> {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.fail_next_decode {
                state.fail_next_decode = false;
                anyhow::bail!("scripted decode failure");
            }
            self.pending = self.pending.saturating_sub(1);
            Ok(())
        }

        fn text(&self) -> String {
            self.state
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .result
                .clone()
        }

        fn tokens(&self) -> Vec<String> {
            let result = self.text();
            if result.is_empty() {
                Vec::new()
            } else {
                result.split_whitespace().map(str::to_string).collect()
            }
        }

        fn reset(&mut self, hotwords: Option<&str>, _recreate: bool) {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.resets += 1;
            if let Some(words) = hotwords {
                state.hotwords.push(words.to_string());
            }
            self.pending = 0;
        }

        fn input_finished(&mut self) {
            self.state
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .input_finished += 1;
        }
    }

    /// VAD whose per-quantum verdicts are scripted up front. `accept_waveform`
    /// fills the ring; `is_speech_detected` pops one scripted verdict (it is
    /// queried exactly once per quantum).
    pub struct ScriptedVad {
        verdicts: Arc<Mutex<VecDeque<bool>>>,
        ring: usize,
        pub ring_high_water: usize,
    }

    impl ScriptedVad {
        pub fn new(verdicts: Arc<Mutex<VecDeque<bool>>>) -> Self {
            Self {
                verdicts,
                ring: 0,
                ring_high_water: 0,
            }
        }
    }

    impl SpeechVad for ScriptedVad {
        fn accept_waveform(&mut self, _samples: &[f32]) {
            self.ring += 1;
            self.ring_high_water = self.ring_high_water.max(self.ring);
        }

        fn is_speech_detected(&mut self) -> bool {
            self.verdicts
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
                .unwrap_or(false)
        }

        fn is_empty(&self) -> bool {
            self.ring == 0
        }

        fn pop(&mut self) {
            self.ring = self.ring.saturating_sub(1);
        }

        fn reset(&mut self) {
            self.ring = 0;
        }
    }

    /// Factory producing fakes wired to shared state handles the test keeps.
    pub struct FakeFactory {
        pub asr_state: Arc<Mutex<FakeAsrState>>,
        pub verdicts: Arc<Mutex<VecDeque<bool>>>,
        pub created_asr: Arc<Mutex<usize>>,
    }

    impl FakeFactory {
        pub fn new() -> Self {
            Self {
                asr_state: Arc::new(Mutex::new(FakeAsrState::default())),
                verdicts: Arc::new(Mutex::new(VecDeque::new())),
                created_asr: Arc::new(Mutex::new(0)),
            }
        }
    }

    impl EngineFactory for FakeFactory {
        fn create_asr(&self, _language: &str, _mode: AsrMode) -> Result<Box<dyn StreamingAsr>> {
            *self.created_asr.lock().unwrap_or_else(|e| e.into_inner()) += 1;
            Ok(Box::new(FakeAsr::new(self.asr_state.clone())))
        }

        fn create_vad(&self, _window_size: usize) -> Result<Box<dyn SpeechVad>> {
            Ok(Box::new(ScriptedVad::new(self.verdicts.clone())))
        }
    }
}
