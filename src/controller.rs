//! Public pipeline facade tying capture, recognition, and recording together.
//!
//! The controller owns the channels and worker threads; consumers poll the
//! event receivers it hands out. All heavy work happens on the capture,
//! recognition, recording, encode, and level threads; every method here
//! returns quickly.

use crate::audio::{DispatchQueue, LevelMeter, MicCapture};
use crate::config::PipelineConfig;
use crate::endpoint::TranscriptEvent;
use crate::engine::{AsrMode, EngineFactory};
use crate::error::SpeechError;
use crate::recognition::{AudioQuantum, ControlRequest, PausePredicate, RecognitionWorker};
use crate::recorder::{AudioEncoder, RecordingManager};
use crate::telemetry::init_tracing;
use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

struct CaptureThread {
    stop_flag: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct Controller {
    cfg: PipelineConfig,
    recordings_dir: PathBuf,
    encoder: Arc<dyn AudioEncoder>,
    quanta_tx: Option<Sender<AudioQuantum>>,
    control_tx: Option<Sender<ControlRequest>>,
    worker: Option<JoinHandle<()>>,
    capture: Option<CaptureThread>,
    recorder: Option<RecordingManager>,
    level_queue: Arc<DispatchQueue>,
    meter: Arc<Mutex<LevelMeter>>,
    events_rx: Receiver<TranscriptEvent>,
    levels_tx: Sender<f64>,
    levels_rx: Receiver<f64>,
    running_tx: Sender<bool>,
    running_rx: Receiver<bool>,
    errors_tx: Sender<SpeechError>,
    errors_rx: Receiver<SpeechError>,
}

impl Controller {
    /// Build the pipeline and spawn the recognition worker. Capture does not
    /// start until [`start`](Self::start).
    ///
    /// `recordings_dir` is the root under which per-profile recordings land;
    /// `should_pause` lets the host suspend decoding while it plays its own
    /// audio.
    pub fn new(
        cfg: PipelineConfig,
        factory: Box<dyn EngineFactory>,
        encoder: Arc<dyn AudioEncoder>,
        recordings_dir: PathBuf,
        should_pause: Option<PausePredicate>,
    ) -> Result<Self> {
        cfg.validate().map_err(anyhow::Error::msg)?;
        init_tracing(cfg.logs);

        let (quanta_tx, quanta_rx) = unbounded();
        let (control_tx, control_rx) = unbounded();
        let (events_tx, events_rx) = unbounded();
        let (levels_tx, levels_rx) = unbounded();
        let (running_tx, running_rx) = unbounded();
        let (errors_tx, errors_rx) = unbounded();

        let worker = RecognitionWorker::spawn(
            cfg.clone(),
            factory,
            quanta_rx,
            control_rx,
            events_tx,
            errors_tx.clone(),
            None,
            should_pause,
        )?;

        Ok(Self {
            cfg,
            recordings_dir,
            encoder,
            quanta_tx: Some(quanta_tx),
            control_tx: Some(control_tx),
            worker: Some(worker),
            capture: None,
            recorder: None,
            level_queue: Arc::new(DispatchQueue::new("level")?),
            meter: Arc::new(Mutex::new(LevelMeter::new())),
            events_rx,
            levels_tx,
            levels_rx,
            running_tx,
            running_rx,
            errors_tx,
            errors_rx,
        })
    }

    /// Select language and vocabulary for subsequent audio, and wire up
    /// recording when a profile id is given.
    pub fn init_session(
        &mut self,
        language: &str,
        profile_id: Option<&str>,
        word_mode: bool,
    ) -> Result<()> {
        let mode = if word_mode {
            AsrMode::Word
        } else {
            AsrMode::Phoneme
        };
        self.recorder = match profile_id {
            Some(id) => Some(RecordingManager::new(
                self.recordings_dir.clone(),
                id.to_string(),
                self.cfg.recording.clone(),
                self.encoder.clone(),
                self.errors_tx.clone(),
            )?),
            None => None,
        };
        self.send_control(ControlRequest::SetRecorder(
            self.recorder.as_ref().map(|m| m.handle()),
        ));
        self.send_control(ControlRequest::SetSession {
            language: language.to_string(),
            mode,
        });
        Ok(())
    }

    /// Open the microphone and start streaming quanta into recognition.
    ///
    /// Device setup and the bounded init retries happen on the capture
    /// thread, so this returns before the stream is live; failures surface on
    /// the error stream and `running` never reports true.
    pub fn start(&mut self) {
        self.send_control(ControlRequest::SetPaused(false));
        if self.capture.is_some() {
            return;
        }

        let Some(quanta_tx) = self.quanta_tx.clone() else {
            return;
        };
        let stop_flag = Arc::new(AtomicBool::new(false));
        let cfg = self.cfg.clone();
        let recorder = self.recorder.as_ref().map(|m| m.handle());
        let meter = self.meter.clone();
        let level_queue = self.level_queue.clone();
        let levels_tx = self.levels_tx.clone();
        let running_tx = self.running_tx.clone();
        let errors_tx = self.errors_tx.clone();
        let flag = stop_flag.clone();

        let handle = std::thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || {
                run_capture(
                    cfg, flag, quanta_tx, recorder, meter, level_queue, levels_tx, running_tx,
                    errors_tx,
                )
            });
        match handle {
            Ok(handle) => self.capture = Some(CaptureThread { stop_flag, handle }),
            Err(err) => {
                tracing::warn!("failed to spawn capture thread: {err}");
                let _ = self
                    .errors_tx
                    .send(SpeechError::CaptureInit(err.to_string()));
            }
        }
    }

    /// Stop listening. With `pause` the microphone stays open and decoding
    /// suspends; otherwise the capture thread shuts down, joined before this
    /// returns, and the outstanding recording runs the finalize policy.
    pub fn stop(&mut self, pause: bool) {
        if pause {
            self.send_control(ControlRequest::SetPaused(true));
            return;
        }
        if let Some(capture) = self.capture.take() {
            capture.stop_flag.store(true, Ordering::Relaxed);
            let _ = capture.handle.join();
        }
        if let Some(recorder) = &self.recorder {
            recorder.handle().flush(String::new());
        }
    }

    /// Finalize the current utterance's recording and, when `transcript` is
    /// non-empty, open the next one under that text. Optionally updates
    /// hotwords for what follows.
    pub fn flush(&mut self, transcript: &str, hotwords: Option<&str>) {
        if let Some(recorder) = &self.recorder {
            recorder.handle().flush(transcript.to_string());
        }
        if let Some(hotwords) = hotwords {
            self.send_control(ControlRequest::SetHotwords(hotwords.to_string()));
        }
    }

    /// Drop all buffered engine state and re-arm the endpoint loop.
    pub fn reset_session(&mut self) {
        self.send_control(ControlRequest::Reset);
    }

    pub fn set_hotwords(&mut self, hotwords: &str) {
        self.send_control(ControlRequest::SetHotwords(hotwords.to_string()));
    }

    /// Push a prerecorded WAV file through the active session. Results stream
    /// on the same transcript receiver live audio uses.
    pub fn recognize_wav(&self, path: &Path) -> Result<()> {
        let mut reader = hound::WavReader::open(path)
            .with_context(|| format!("opening {}", path.display()))?;
        let spec = reader.spec();
        let interleaved: Vec<i16> = match spec.sample_format {
            hound::SampleFormat::Int => reader
                .samples::<i16>()
                .collect::<std::result::Result<_, _>>()
                .context("reading wav samples")?,
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * 32_767.0) as i16))
                .collect::<std::result::Result<_, _>>()
                .context("reading wav samples")?,
        };
        let samples = downmix(&interleaved, usize::from(spec.channels.max(1)));
        self.send_control(ControlRequest::OfflineAudio {
            samples,
            sample_rate: spec.sample_rate,
        });
        Ok(())
    }

    /// Non-final and endpoint transcript events, in emission order.
    pub fn transcripts(&self) -> Receiver<TranscriptEvent> {
        self.events_rx.clone()
    }

    /// Smoothed input level percentages, one per captured quantum.
    pub fn levels(&self) -> Receiver<f64> {
        self.levels_rx.clone()
    }

    /// True when the capture stream comes up, false when it stops.
    pub fn running(&self) -> Receiver<bool> {
        self.running_rx.clone()
    }

    pub fn errors(&self) -> Receiver<SpeechError> {
        self.errors_rx.clone()
    }

    /// Full teardown: stop capture, drain and join every worker. Safe to call
    /// more than once; also runs on drop.
    pub fn destroy(&mut self) {
        self.stop(false);
        // The worker exits once both of its channels disconnect.
        drop(self.control_tx.take());
        drop(self.quanta_tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        // RecordingManager's drop joins the recording worker and lets queued
        // encode jobs drain.
        self.recorder = None;
    }

    fn send_control(&self, req: ControlRequest) {
        if let Some(control) = &self.control_tx {
            if control.send(req).is_err() {
                tracing::warn!("recognition worker is gone, control request dropped");
            }
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Why the quantum pump stopped pulling from the capture stream.
enum PumpExit {
    Stopped,
    Disconnected,
    Failed,
}

/// Route captured quanta to the recorder, the level queue, and recognition
/// until told to stop, the channel closes, or `failed` reports a stream
/// error.
#[allow(clippy::too_many_arguments)]
fn pump_quanta(
    receiver: &Receiver<Vec<i16>>,
    sample_rate: u32,
    failed: impl Fn() -> bool,
    stop_flag: &AtomicBool,
    wait: Duration,
    quanta_tx: &Sender<AudioQuantum>,
    recorder: Option<&crate::recorder::RecorderHandle>,
    meter: &Arc<Mutex<LevelMeter>>,
    level_queue: &DispatchQueue,
    levels_tx: &Sender<f64>,
) -> PumpExit {
    while !stop_flag.load(Ordering::Relaxed) {
        if failed() {
            return PumpExit::Failed;
        }
        match receiver.recv_timeout(wait) {
            Ok(samples) => {
                if let Some(recorder) = recorder {
                    recorder.record_mic(samples.clone());
                }
                let meter = meter.clone();
                let levels_tx = levels_tx.clone();
                let for_level = samples.clone();
                level_queue.execute(move || {
                    if let Ok(mut meter) = meter.lock() {
                        let _ = levels_tx.send(meter.on_audio(&for_level));
                    }
                });
                let _ = quanta_tx.send(AudioQuantum {
                    samples,
                    sample_rate,
                });
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return PumpExit::Disconnected,
        }
    }
    PumpExit::Stopped
}

#[allow(clippy::too_many_arguments)]
fn run_capture(
    cfg: PipelineConfig,
    stop_flag: Arc<AtomicBool>,
    quanta_tx: Sender<AudioQuantum>,
    recorder: Option<crate::recorder::RecorderHandle>,
    meter: Arc<Mutex<LevelMeter>>,
    level_queue: Arc<DispatchQueue>,
    levels_tx: Sender<f64>,
    running_tx: Sender<bool>,
    errors_tx: Sender<SpeechError>,
) {
    let mic = match MicCapture::open(cfg.input_device.as_deref()) {
        Ok(mic) => mic,
        Err(err) => {
            let _ = errors_tx.send(SpeechError::CaptureInit(format!("{err:#}")));
            return;
        }
    };
    let mut stream = match mic.start_with_retry(
        u64::from(cfg.quantum_ms),
        cfg.channel_capacity,
        cfg.capture_retries,
        Duration::from_millis(cfg.capture_retry_delay_ms),
    ) {
        Ok(stream) => stream,
        Err(err) => {
            let _ = errors_tx.send(SpeechError::CaptureInit(format!("{err:#}")));
            return;
        }
    };
    tracing::info!(device = %mic.device_name(), rate = stream.sample_rate, "capture running");
    let _ = running_tx.send(true);

    let wait = Duration::from_millis(u64::from(cfg.quantum_ms) * 2);
    let mut restarts = 0u32;
    loop {
        let exit = pump_quanta(
            &stream.receiver,
            stream.sample_rate,
            || stream.failed(),
            &stop_flag,
            wait,
            &quanta_tx,
            recorder.as_ref(),
            &meter,
            &level_queue,
            &levels_tx,
        );
        match exit {
            PumpExit::Stopped | PumpExit::Disconnected => break,
            PumpExit::Failed => {
                // Surface the failure once, then rebuild the stream with the
                // same bounded backoff used for the initial open.
                let _ = errors_tx.send(SpeechError::CaptureInit(
                    "capture stream failed, restarting".to_string(),
                ));
                stream.stop();
                restarts += 1;
                if restarts > cfg.capture_retries {
                    tracing::warn!(restarts, "capture restart budget exhausted");
                    let _ = running_tx.send(false);
                    return;
                }
                match mic.start_with_retry(
                    u64::from(cfg.quantum_ms),
                    cfg.channel_capacity,
                    cfg.capture_retries,
                    Duration::from_millis(cfg.capture_retry_delay_ms),
                ) {
                    Ok(next) => stream = next,
                    Err(err) => {
                        let _ = errors_tx.send(SpeechError::CaptureInit(format!("{err:#}")));
                        let _ = running_tx.send(false);
                        return;
                    }
                }
            }
        }
    }

    let dropped = stream.dropped();
    if dropped > 0 {
        tracing::debug!(dropped, "capture callbacks dropped while busy");
    }
    stream.stop();
    let _ = running_tx.send(false);
}

/// Average interleaved frames down to mono.
fn downmix(interleaved: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().copied().map(i32::from).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}
