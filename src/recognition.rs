//! The recognition worker: one thread owning all decoding state.
//!
//! Audio quanta and control requests arrive over channels. Control requests
//! queued while a quantum was in flight are drained before the next quantum
//! is touched, so a hotword update or session switch can never interleave
//! with a half-processed quantum.

use crate::audio::{resample, samples_to_float};
use crate::config::PipelineConfig;
use crate::endpoint::{EndpointLoop, TranscriptEvent};
use crate::engine::{AsrMode, EngineFactory, SessionCache};
use crate::error::SpeechError;
use crate::recorder::RecorderHandle;
use anyhow::Result;
use crossbeam_channel::{never, select, Receiver, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

/// One capture quantum, tagged with the rate the device actually delivered.
pub(crate) struct AudioQuantum {
    pub(crate) samples: Vec<i16>,
    pub(crate) sample_rate: u32,
}

/// Deferred requests applied between quanta on the recognition worker.
pub(crate) enum ControlRequest {
    Reset,
    SetHotwords(String),
    SetPaused(bool),
    SetSession {
        language: String,
        mode: AsrMode,
    },
    SetRecorder(Option<RecorderHandle>),
    OfflineAudio {
        samples: Vec<i16>,
        sample_rate: u32,
    },
}

/// Predicate polled before each quantum; true suspends decoding.
pub type PausePredicate = Box<dyn Fn() -> bool + Send>;

pub(crate) struct RecognitionWorker {
    cfg: PipelineConfig,
    cache: SessionCache,
    endpoint: EndpointLoop,
    active: Option<(String, AsrMode)>,
    paused: bool,
    should_pause: Option<PausePredicate>,
    mismatch_reported: bool,
    events: Sender<TranscriptEvent>,
    errors: Sender<SpeechError>,
    recorder: Option<RecorderHandle>,
}

impl RecognitionWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        cfg: PipelineConfig,
        factory: Box<dyn EngineFactory>,
        quanta: Receiver<AudioQuantum>,
        control: Receiver<ControlRequest>,
        events: Sender<TranscriptEvent>,
        errors: Sender<SpeechError>,
        recorder: Option<RecorderHandle>,
        should_pause: Option<PausePredicate>,
    ) -> Result<JoinHandle<()>> {
        let window_size = cfg.endpoint.vad_window_size;
        let endpoint = EndpointLoop::new(cfg.endpoint.clone());
        let worker = Self {
            cfg,
            cache: SessionCache::new(factory, window_size),
            endpoint,
            active: None,
            paused: false,
            should_pause,
            mismatch_reported: false,
            events,
            errors,
            recorder,
        };
        std::thread::Builder::new()
            .name("recognition".to_string())
            .spawn(move || worker.run(quanta, control))
            .map_err(Into::into)
    }

    fn run(mut self, quanta: Receiver<AudioQuantum>, control: Receiver<ControlRequest>) {
        let mut quanta = quanta;
        let mut control = control;
        let mut quanta_open = true;
        let mut control_open = true;
        // A disconnected channel is swapped for `never()` rather than ending
        // the loop, so queued quanta still drain when control closes first and
        // offline recognition still works after capture stops. The worker
        // exits once both channels are gone.
        while quanta_open || control_open {
            select! {
                recv(control) -> msg => match msg {
                    Ok(req) => self.handle_control(req),
                    Err(_) => {
                        control = never();
                        control_open = false;
                    }
                },
                recv(quanta) -> msg => match msg {
                    Ok(quantum) => {
                        // Apply queued control before touching the audio.
                        while let Ok(req) = control.try_recv() {
                            self.handle_control(req);
                        }
                        self.on_quantum(quantum);
                    }
                    Err(_) => {
                        quanta = never();
                        quanta_open = false;
                    }
                },
            }
        }
        tracing::debug!("recognition worker stopped");
    }

    fn handle_control(&mut self, req: ControlRequest) {
        match req {
            ControlRequest::Reset => {
                self.endpoint.reset();
                self.with_session(|session| session.reset(None));
            }
            ControlRequest::SetHotwords(hotwords) => {
                tracing::debug!(%hotwords, "updating hotwords");
                self.endpoint.reset();
                self.with_session(|session| session.reset(Some(&hotwords)));
            }
            ControlRequest::SetPaused(paused) => self.paused = paused,
            ControlRequest::SetSession { language, mode } => {
                self.endpoint.reset();
                self.mismatch_reported = false;
                match self.cache.session(&language, mode) {
                    Ok(session) => {
                        session.reset(None);
                        self.active = Some((language, mode));
                    }
                    Err(err) => {
                        tracing::warn!("session init failed: {err:#}");
                        let _ = self
                            .errors
                            .send(SpeechError::SessionMismatch(format!("{err:#}")));
                    }
                }
            }
            ControlRequest::SetRecorder(handle) => self.recorder = handle,
            ControlRequest::OfflineAudio {
                samples,
                sample_rate,
            } => self.recognize_offline(&samples, sample_rate),
        }
    }

    fn is_paused(&self) -> bool {
        self.paused || self.should_pause.as_ref().map_or(false, |p| p())
    }

    fn on_quantum(&mut self, quantum: AudioQuantum) {
        if self.is_paused() {
            // Quanta keep draining so the channel never backs up, but
            // nothing reaches the engine while paused.
            std::thread::sleep(Duration::from_millis(self.cfg.pause_sleep_ms));
            return;
        }

        let Some((language, mode)) = self.active.clone() else {
            if !self.mismatch_reported {
                self.mismatch_reported = true;
                let _ = self.errors.send(SpeechError::SessionMismatch(
                    "audio received before init_session".to_string(),
                ));
            }
            return;
        };

        let model_rate = self.cfg.model_rate;
        let downsampled = resample(&quantum.samples, quantum.sample_rate, model_rate);
        let floats = samples_to_float(&downsampled);

        let session = match self.cache.session(&language, mode) {
            Ok(session) => session,
            Err(err) => {
                tracing::warn!("session lookup failed: {err:#}");
                return;
            }
        };
        match self.endpoint.on_quantum(session, &floats, model_rate) {
            Ok(outcome) => {
                if let (Some(recorder), Some(transcript)) =
                    (&self.recorder, outcome.transcript)
                {
                    recorder.record_transcript(transcript);
                }
                if let Some(event) = outcome.event {
                    let _ = self.events.send(event);
                }
            }
            Err(err) => {
                // Drop the quantum; the stream recovers on the next one.
                tracing::warn!("decode failed, dropping quantum: {err:#}");
                let _ = self
                    .errors
                    .send(SpeechError::EngineDecode(format!("{err:#}")));
            }
        }
    }

    /// Decode a prerecorded buffer through the active session, VAD bypassed.
    ///
    /// Partials stream out like live audio; a second of appended silence
    /// settles the decoder before the final result is emitted as an
    /// endpoint.
    fn recognize_offline(&mut self, samples: &[i16], sample_rate: u32) {
        let Some((language, mode)) = self.active.clone() else {
            let _ = self.errors.send(SpeechError::SessionMismatch(
                "recognize_audio before init_session".to_string(),
            ));
            return;
        };

        let model_rate = self.cfg.model_rate;
        let quantum_samples = self.cfg.model_quantum_samples();
        let downsampled = resample(samples, sample_rate, model_rate);
        let floats = samples_to_float(&downsampled);

        self.endpoint.reset();
        let session = match self.cache.session(&language, mode) {
            Ok(session) => session,
            Err(err) => {
                tracing::warn!("session lookup failed: {err:#}");
                return;
            }
        };
        session.reset(None);

        let mut last_emitted = String::new();
        let mut decode = |session: &mut crate::engine::RecognizerSession,
                          chunk: &[f32]|
         -> Result<String> {
            session.asr().accept_waveform(chunk, model_rate);
            while session.asr().is_ready() {
                session.asr().decode()?;
            }
            Ok(session.result_text())
        };

        for chunk in floats.chunks(quantum_samples.max(1)) {
            match decode(session, chunk) {
                Ok(result) => {
                    if result != last_emitted {
                        last_emitted = result.clone();
                        let _ = self.events.send(TranscriptEvent::partial(result));
                    }
                }
                Err(err) => {
                    let _ = self
                        .errors
                        .send(SpeechError::EngineDecode(format!("{err:#}")));
                    return;
                }
            }
        }

        // A trailing second of silence flushes the decoder's lookahead, then
        // the end-of-input marker lets it commit the final hypothesis.
        session
            .asr()
            .accept_waveform(&vec![0.0f32; model_rate as usize], model_rate);
        session.asr().input_finished();
        let finished = (|| -> Result<String> {
            while session.asr().is_ready() {
                session.asr().decode()?;
            }
            Ok(session.result_text())
        })();
        match finished {
            Ok(result) => {
                let _ = self.events.send(TranscriptEvent::endpoint(result, false));
            }
            Err(err) => {
                let _ = self
                    .errors
                    .send(SpeechError::EngineDecode(format!("{err:#}")));
            }
        }
        session.reset(None);
    }

    fn with_session(&mut self, f: impl FnOnce(&mut crate::engine::RecognizerSession)) {
        if let Some((language, mode)) = self.active.clone() {
            if let Ok(session) = self.cache.session(&language, mode) {
                f(session);
            }
        }
    }
}
