//! VAD-gated endpoint detection driving the streaming recognizer.
//!
//! One call per audio quantum, always on the recognition worker. Two patience
//! counters shape the behavior:
//!
//! - `vad_patience` keeps a speech run alive across spurious VAD
//!   false-negatives mid-utterance.
//! - the reset counter walks down from `rule2_patience` during trailing
//!   silence after speech (endpoint declared when it hits zero) and down to
//!   `-rule1_patience` during long silences with no speech at all (engine
//!   flushed silently so buffered audio never jams the decoder).
//!
//! State walk for a typical utterance, with both patiences at 6:
//!
//! ```text
//! armed --speech--> speaking --silence--> trailing(6) .. trailing(0)
//!   ^                  ^                                    |
//!   |                  +------speech resumes----------------+
//!   +-------------- endpoint fired, session reset ----------+
//! ```
//!
//! With no speech at all the counter instead walks 0, -1, .., -rule1 and the
//! engine is reset without emitting an endpoint, indefinitely.

use crate::config::EndpointConfig;
use crate::engine::{AsrMode, RecognizerSession};
use anyhow::Result;

/// One decode result pushed to the transcript event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEvent {
    pub transcript: String,
    /// True exactly once per utterance, on the trailing-silence endpoint.
    pub was_endpoint: bool,
    /// True when the consumer should restart utterance-relative positions.
    pub reset_end_pos: bool,
    pub is_voice_active: bool,
    /// Endpoint only: whether the VAD saw no speech in the final quantum.
    pub is_no_speech: bool,
}

impl TranscriptEvent {
    pub(crate) fn partial(transcript: String) -> Self {
        Self {
            transcript,
            was_endpoint: false,
            reset_end_pos: false,
            is_voice_active: true,
            is_no_speech: false,
        }
    }

    pub(crate) fn endpoint(transcript: String, is_no_speech: bool) -> Self {
        Self {
            transcript,
            was_endpoint: true,
            reset_end_pos: true,
            is_voice_active: false,
            is_no_speech,
        }
    }

    fn inactive() -> Self {
        Self {
            transcript: String::new(),
            was_endpoint: false,
            reset_end_pos: false,
            is_voice_active: false,
            is_no_speech: false,
        }
    }
}

/// What one quantum produced: at most one event and one transcript snapshot
/// for the recording task.
#[derive(Debug, Default)]
pub(crate) struct QuantumOutcome {
    pub(crate) event: Option<TranscriptEvent>,
    pub(crate) transcript: Option<String>,
}

/// The dual patience-counter endpoint state machine.
///
/// Owned exclusively by the recognition worker; every field is touched from
/// that one thread only.
pub(crate) struct EndpointLoop {
    cfg: EndpointConfig,
    vad_patience_counter: i32,
    vad_reset_patience_counter: i32,
    speech_seen: bool,
    last_emitted: String,
}

impl EndpointLoop {
    pub(crate) fn new(cfg: EndpointConfig) -> Self {
        Self {
            cfg,
            vad_patience_counter: 0,
            vad_reset_patience_counter: 0,
            speech_seen: false,
            last_emitted: String::new(),
        }
    }

    /// Return to the armed state. Called whenever the session is reset from
    /// outside the loop (hotword update, explicit reset, session switch).
    pub(crate) fn reset(&mut self) {
        self.vad_patience_counter = 0;
        self.vad_reset_patience_counter = 0;
        self.speech_seen = false;
        self.last_emitted.clear();
    }

    /// Process one downsampled float quantum through the session.
    ///
    /// The engine error path drops the quantum: counters keep whatever value
    /// they had and the next quantum proceeds normally.
    pub(crate) fn on_quantum(
        &mut self,
        session: &mut RecognizerSession,
        samples: &[f32],
        model_rate: u32,
    ) -> Result<QuantumOutcome> {
        let mut outcome = QuantumOutcome::default();
        if samples.is_empty() {
            return Ok(outcome);
        }

        // Buffer into the ASR first; nothing decodes until the VAD verdict
        // says it is worth the inference cost.
        session.asr().accept_waveform(samples, model_rate);

        // The VAD is trained on windows far smaller than a capture quantum,
        // so feed it in window-size slices.
        for chunk in samples.chunks(self.cfg.vad_window_size) {
            session.vad().accept_waveform(chunk);
        }

        let has_speech = session.vad().is_speech_detected();
        if has_speech {
            // The VAD occasionally flickers false-negative mid-utterance;
            // re-arm both counters on every positive verdict.
            self.vad_patience_counter = self.cfg.vad_patience;
            self.vad_reset_patience_counter = self.cfg.rule2_patience;
            self.speech_seen = true;
        }

        if has_speech || self.vad_patience_counter > 0 {
            if !has_speech {
                self.vad_patience_counter -= 1;
            }
            self.drain_decode(session)?;

            let result = session.result_text();
            outcome.transcript = Some(result.clone());
            if self.last_emitted != result {
                self.last_emitted = result.clone();
                outcome.event = Some(TranscriptEvent::partial(result));
            }
        } else if self.speech_seen && self.vad_reset_patience_counter >= 0 {
            if self.vad_reset_patience_counter == 0 {
                // End of utterance. Soft final sounds decode better with a
                // stretch of silence appended, so pad the phoneme stream
                // before the last decode.
                if session.mode() == AsrMode::Phoneme {
                    let tail_samples =
                        ((u64::from(model_rate) * self.cfg.tail_padding_ms) / 1000) as usize;
                    session
                        .asr()
                        .accept_waveform(&vec![0.0f32; tail_samples], model_rate);
                }
                self.drain_decode(session)?;

                let result = session.result_text();
                tracing::debug!(transcript = %result, "endpoint");
                outcome.transcript = Some(result.clone());
                outcome.event = Some(TranscriptEvent::endpoint(result, !has_speech));

                session.reset(None);
                self.speech_seen = false;
                self.last_emitted.clear();
            }
            self.vad_reset_patience_counter -= 1;
        } else {
            outcome.event = Some(TranscriptEvent::inactive());

            if self.vad_reset_patience_counter == -self.cfg.rule1_patience {
                // Long silence: decode whatever is buffered so the engine
                // never accumulates a backlog, discard the result, and start
                // the countdown again. No endpoint is emitted.
                self.drain_decode(session)?;
                session.reset(None);
                self.speech_seen = false;
                self.last_emitted.clear();
                self.vad_reset_patience_counter = -1;
                tracing::debug!("silent engine reset after long silence");
            } else {
                self.vad_reset_patience_counter -= 1;
            }
        }

        debug_assert!(
            (0..=self.cfg.vad_patience).contains(&self.vad_patience_counter),
            "vad patience out of range: {}",
            self.vad_patience_counter
        );
        debug_assert!(
            (-self.cfg.rule1_patience..=self.cfg.rule2_patience)
                .contains(&self.vad_reset_patience_counter),
            "reset patience out of range: {}",
            self.vad_reset_patience_counter
        );

        Ok(outcome)
    }

    fn drain_decode(&mut self, session: &mut RecognizerSession) -> Result<()> {
        while session.asr().is_ready() {
            session.asr().decode()?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn counters(&self) -> (i32, i32) {
        (self.vad_patience_counter, self.vad_reset_patience_counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::FakeFactory;
    use crate::engine::EngineFactory;

    const MODEL_RATE: u32 = 16_000;
    const QUANTUM: usize = 1_600;

    struct Harness {
        factory: FakeFactory,
        session: RecognizerSession,
        endpoint: EndpointLoop,
    }

    impl Harness {
        fn new(cfg: EndpointConfig, mode: AsrMode) -> Self {
            let factory = FakeFactory::new();
            let asr = factory.create_asr("en", mode).expect("fake asr");
            let vad = factory.create_vad(cfg.vad_window_size).expect("fake vad");
            let session = RecognizerSession::new(asr, vad, mode);
            Self {
                factory,
                session,
                endpoint: EndpointLoop::new(cfg),
            }
        }

        fn script(&self, verdicts: &[bool]) {
            self.factory
                .verdicts
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .extend(verdicts.iter().copied());
        }

        fn set_result(&self, text: &str) {
            self.factory
                .asr_state
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .result = text.to_string();
        }

        fn resets(&self) -> usize {
            self.factory
                .asr_state
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .resets
        }

        fn accepted(&self) -> Vec<usize> {
            self.factory
                .asr_state
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .accepted
                .clone()
        }

        fn feed(&mut self, count: usize) -> Vec<TranscriptEvent> {
            let quantum = vec![0.1f32; QUANTUM];
            let mut events = Vec::new();
            for _ in 0..count {
                let outcome = self
                    .endpoint
                    .on_quantum(&mut self.session, &quantum, MODEL_RATE)
                    .expect("quantum should process");
                events.extend(outcome.event);
            }
            events
        }
    }

    fn no_patience_cfg() -> EndpointConfig {
        EndpointConfig {
            vad_patience: 0,
            ..EndpointConfig::default()
        }
    }

    #[test]
    fn trailing_silence_fires_exactly_one_endpoint() {
        // 6 silent quanta, 10 speech, 7 trailing silence with rule2 = 6:
        // one endpoint, on the (patience + 1)-th trailing quantum.
        let mut h = Harness::new(no_patience_cfg(), AsrMode::Word);
        let mut script = vec![false; 6];
        script.extend(vec![true; 10]);
        script.extend(vec![false; 7]);
        h.script(&script);
        h.set_result("the cat sat");

        let cold = h.feed(6);
        assert!(cold.iter().all(|e| !e.was_endpoint && !e.is_voice_active));

        let speaking = h.feed(10);
        assert_eq!(
            speaking
                .iter()
                .filter(|e| e.is_voice_active && e.transcript == "the cat sat")
                .count(),
            1,
            "identical partials must be deduplicated"
        );

        let trailing = h.feed(7);
        let endpoints: Vec<_> = trailing.iter().filter(|e| e.was_endpoint).collect();
        assert_eq!(endpoints.len(), 1);
        assert!(endpoints[0].reset_end_pos);
        assert!(!endpoints[0].is_voice_active);
        assert!(endpoints[0].is_no_speech);
        assert_eq!(endpoints[0].transcript, "the cat sat");

        // The six trailing quanta before the endpoint only count down and
        // emit nothing.
        assert_eq!(trailing.len(), 1);
        assert_eq!(h.resets(), 1);
    }

    #[test]
    fn endpoint_transcript_reports_final_decode() {
        let mut h = Harness::new(no_patience_cfg(), AsrMode::Word);
        let mut script = vec![true; 4];
        script.extend(vec![false; 7]);
        h.script(&script);
        h.set_result("hello");

        h.feed(4);
        let trailing = h.feed(7);
        let endpoint = trailing
            .iter()
            .find(|e| e.was_endpoint)
            .expect("endpoint event");
        assert_eq!(endpoint.transcript, "hello");
    }

    #[test]
    fn cold_silence_resets_engine_without_endpoint() {
        // 8 silent quanta from a cold start with rule1 = 6: a silent reset
        // after quantum 7, no endpoint, and the countdown resumes.
        let mut h = Harness::new(no_patience_cfg(), AsrMode::Word);
        h.script(&[false; 8]);

        let events = h.feed(7);
        assert_eq!(h.resets(), 1, "engine must be flushed after quantum 7");
        assert!(events.iter().all(|e| !e.was_endpoint));
        assert!(events.iter().all(|e| e.transcript.is_empty()));
        assert_eq!(h.endpoint.counters().1, -1);

        h.feed(1);
        assert_eq!(h.endpoint.counters().1, -2, "countdown resumes after reset");
        assert_eq!(h.resets(), 1);
    }

    #[test]
    fn long_silence_cycles_indefinitely() {
        let mut h = Harness::new(no_patience_cfg(), AsrMode::Word);
        h.script(&[false; 30]);
        h.feed(30);
        // Quantum 7 fires the first flush, then every rule1-wide cycle after.
        assert_eq!(h.resets(), 4);
    }

    #[test]
    fn vad_patience_bridges_false_negatives() {
        // Speech, one flickered negative, speech again: the run never drops
        // out of the voice-active branch and no endpoint fires.
        let cfg = EndpointConfig::default(); // vad_patience = 6
        let mut h = Harness::new(cfg, AsrMode::Word);
        h.script(&[true, false, true, false, false]);
        h.set_result("read");

        let events = h.feed(5);
        assert!(events.iter().all(|e| !e.was_endpoint));
        assert!(h.endpoint.counters().0 >= 4);
        assert_eq!(h.resets(), 0);
    }

    #[test]
    fn counters_stay_in_bounds_for_arbitrary_sequences() {
        let cfg = EndpointConfig::default();
        let mut h = Harness::new(cfg.clone(), AsrMode::Word);
        // Pseudo-random but deterministic verdict pattern.
        let script: Vec<bool> = (0..200).map(|i| (i * 7 + 3) % 11 < 4).collect();
        h.script(&script);

        let quantum = vec![0.1f32; QUANTUM];
        for _ in 0..200 {
            h.endpoint
                .on_quantum(&mut h.session, &quantum, MODEL_RATE)
                .expect("quantum");
            let (patience, reset) = h.endpoint.counters();
            assert!((0..=cfg.vad_patience).contains(&patience));
            assert!((-cfg.rule1_patience..=cfg.rule2_patience).contains(&reset));
        }
    }

    #[test]
    fn phoneme_endpoint_feeds_tail_padding() {
        let mut h = Harness::new(no_patience_cfg(), AsrMode::Phoneme);
        let mut script = vec![true; 3];
        script.extend(vec![false; 7]);
        h.script(&script);
        h.set_result("k ae t");

        h.feed(10);
        // 160 ms of zeros at 16 kHz.
        assert!(
            h.accepted().contains(&2_560),
            "tail padding must reach the engine in phoneme mode"
        );
    }

    #[test]
    fn word_endpoint_skips_tail_padding() {
        let mut h = Harness::new(no_patience_cfg(), AsrMode::Word);
        let mut script = vec![true; 3];
        script.extend(vec![false; 7]);
        h.script(&script);

        h.feed(10);
        assert!(
            !h.accepted().contains(&2_560),
            "word mode must not receive tail padding"
        );
    }

    #[test]
    fn speech_resuming_mid_trailing_cancels_endpoint() {
        let mut h = Harness::new(no_patience_cfg(), AsrMode::Word);
        let mut script = vec![true; 2];
        script.extend(vec![false; 4]); // trailing, but short of rule2 = 6
        script.extend(vec![true; 2]); // speech resumes
        script.extend(vec![false; 7]); // full trailing run
        h.script(&script);
        h.set_result("again");

        let events = h.feed(15);
        assert_eq!(events.iter().filter(|e| e.was_endpoint).count(), 1);
        assert_eq!(h.resets(), 1);
    }

    #[test]
    fn decode_failure_drops_quantum_and_continues() {
        let mut h = Harness::new(no_patience_cfg(), AsrMode::Word);
        h.script(&[true, true, true]);
        h.factory
            .asr_state
            .lock()
            .unwrap()
            .fail_next_decode = true;
        h.set_result("ok");

        let quantum = vec![0.1f32; QUANTUM];
        let first = h.endpoint.on_quantum(&mut h.session, &quantum, MODEL_RATE);
        assert!(first.is_err(), "scripted failure must surface");

        let second = h
            .endpoint
            .on_quantum(&mut h.session, &quantum, MODEL_RATE)
            .expect("recovers on the next quantum");
        assert_eq!(second.event.expect("partial").transcript, "ok");
    }

    #[test]
    fn empty_quantum_is_a_no_op() {
        let mut h = Harness::new(no_patience_cfg(), AsrMode::Word);
        let outcome = h
            .endpoint
            .on_quantum(&mut h.session, &[], MODEL_RATE)
            .expect("empty quantum");
        assert!(outcome.event.is_none());
        assert!(outcome.transcript.is_none());
        assert_eq!(h.endpoint.counters(), (0, 0));
    }

    #[test]
    fn reset_rearms_the_loop() {
        let mut h = Harness::new(no_patience_cfg(), AsrMode::Word);
        h.script(&[true, false, false]);
        h.set_result("abc");
        h.feed(3);
        h.endpoint.reset();
        assert_eq!(h.endpoint.counters(), (0, 0));

        // After an external reset an unchanged decode result is re-emitted.
        h.script(&[true]);
        let events = h.feed(1);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].transcript, "abc");
    }
}
