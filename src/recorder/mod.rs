//! Per-utterance recording of raw microphone audio plus transcript sidecars.
//!
//! A dedicated worker thread owns all recording state; the rest of the
//! pipeline talks to it through a cloneable [`RecorderHandle`]. `flush(text)`
//! with non-empty text opens a `RecordingTask` bound to that text, writing
//! `{recording_id}_{millis}.raw` while audio flows; the next flush finalizes
//! it: short or transcript-less captures are deleted, everything else gets a
//! `.json` sidecar and an asynchronous encode on the encode queue. Audio with
//! no open task is dropped.

mod encoder;

pub use encoder::{AudioEncoder, WavEncoder};

use crate::audio::DispatchQueue;
use crate::config::RecordingConfig;
use crate::error::SpeechError;
use anyhow::{Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

enum RecorderMsg {
    Mic(Vec<i16>),
    Transcript(String),
    Flush { text: String },
    Discard,
    Sync(Sender<()>),
    Shutdown,
}

/// Cheap cloneable front for the recording worker.
#[derive(Clone)]
pub struct RecorderHandle {
    sender: Sender<RecorderMsg>,
}

impl RecorderHandle {
    pub fn record_mic(&self, samples: Vec<i16>) {
        let _ = self.sender.send(RecorderMsg::Mic(samples));
    }

    pub fn record_transcript(&self, transcript: String) {
        let _ = self.sender.send(RecorderMsg::Transcript(transcript));
    }

    /// Finalize the current utterance, then open a new one bound to `text`.
    /// Empty text only finalizes; audio arriving with no open utterance is
    /// dropped.
    pub fn flush(&self, text: String) {
        let _ = self.sender.send(RecorderMsg::Flush { text });
    }

    /// Drop the in-progress utterance without keeping its audio.
    pub fn discard(&self) {
        let _ = self.sender.send(RecorderMsg::Discard);
    }

    /// Block until the worker has handled everything sent so far, including
    /// encode jobs already submitted.
    pub fn sync(&self) {
        let (tx, rx) = bounded(1);
        if self.sender.send(RecorderMsg::Sync(tx)).is_ok() {
            let _ = rx.recv();
        }
    }
}

/// Owns the recording worker thread. Dropping the manager finalizes any
/// in-progress capture and joins the worker, even while handles are still
/// alive elsewhere.
pub struct RecordingManager {
    sender: Option<Sender<RecorderMsg>>,
    worker: Option<JoinHandle<()>>,
}

impl RecordingManager {
    pub fn new(
        save_dir: PathBuf,
        recording_id: String,
        cfg: RecordingConfig,
        encoder: Arc<dyn AudioEncoder>,
        errors: Sender<SpeechError>,
    ) -> Result<Self> {
        fs::create_dir_all(&save_dir)
            .with_context(|| format!("creating recording dir {}", save_dir.display()))?;
        let encode_queue = DispatchQueue::new("encode")?;
        let (sender, receiver) = unbounded();
        let worker = std::thread::Builder::new()
            .name("recording".to_string())
            .spawn(move || {
                let mut state = RecorderState {
                    save_dir,
                    recording_id,
                    cfg,
                    encoder,
                    encode_queue,
                    errors,
                    current: None,
                    last_id: 0,
                };
                state.run(receiver);
            })
            .context("failed to spawn recording worker")?;
        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> RecorderHandle {
        RecorderHandle {
            sender: self
                .sender
                .clone()
                .expect("sender taken only in drop"),
        }
    }
}

impl Drop for RecordingManager {
    fn drop(&mut self) {
        // Handles hold sender clones, so channel disconnect alone cannot end
        // the worker loop; an explicit shutdown message does.
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(RecorderMsg::Shutdown);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Transcript sidecar written next to every kept recording.
#[derive(Serialize)]
struct Sidecar<'a> {
    text: &'a str,
    ipa: String,
}

struct RecorderState {
    save_dir: PathBuf,
    recording_id: String,
    cfg: RecordingConfig,
    encoder: Arc<dyn AudioEncoder>,
    encode_queue: DispatchQueue,
    errors: Sender<SpeechError>,
    current: Option<RecordingTask>,
    last_id: u64,
}

impl RecorderState {
    fn run(&mut self, receiver: Receiver<RecorderMsg>) {
        loop {
            match receiver.recv() {
                Ok(RecorderMsg::Mic(samples)) => {
                    if let Some(task) = &mut self.current {
                        if let Err(err) = task.record_mic(&samples) {
                            tracing::warn!("recording write failed: {err:#}");
                        }
                    }
                }
                Ok(RecorderMsg::Transcript(transcript)) => {
                    if let Some(task) = &mut self.current {
                        task.record_transcript(transcript);
                    }
                }
                Ok(RecorderMsg::Flush { text }) => self.flush(&text),
                Ok(RecorderMsg::Discard) => self.discard(),
                Ok(RecorderMsg::Sync(reply)) => {
                    self.encode_queue.drain();
                    let _ = reply.send(());
                }
                Ok(RecorderMsg::Shutdown) | Err(_) => break,
            }
        }
        // Run the finalize policy on whatever is left so a completed
        // utterance survives teardown.
        self.flush("");
    }

    /// Finalize the current utterance, then open the next one when `text` is
    /// non-empty. The opening text is what the sidecar records.
    fn flush(&mut self, text: &str) {
        if let Some(task) = self.current.take() {
            let outcome = task.finalize(
                self.cfg.min_keep_bytes,
                self.encoder.clone(),
                &self.encode_queue,
                self.errors.clone(),
            );
            if let Err(err) = outcome {
                tracing::warn!("finalize failed: {err:#}");
            }
        }
        if text.is_empty() {
            return;
        }
        let id = self.next_id();
        match RecordingTask::create(&self.save_dir, &self.recording_id, id, text.to_string()) {
            Ok(task) => self.current = Some(task),
            Err(err) => tracing::warn!("failed to open recording file: {err:#}"),
        }
    }

    fn discard(&mut self) {
        if let Some(task) = self.current.take() {
            task.clean_up();
        }
    }

    /// Millisecond timestamps bumped to stay strictly increasing so two
    /// utterances opened within the same millisecond never collide.
    fn next_id(&mut self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.last_id = now.max(self.last_id + 1);
        self.last_id
    }
}

/// One utterance's files: `{base}.raw` while recording, then the sidecar and
/// encoded audio after finalize. `text` is the transcript the utterance was
/// opened under.
struct RecordingTask {
    base: PathBuf,
    writer: BufWriter<File>,
    text: String,
    transcripts: Vec<String>,
}

impl RecordingTask {
    fn create(save_dir: &Path, recording_id: &str, id: u64, text: String) -> Result<Self> {
        let base = save_dir.join(format!("{recording_id}_{id}"));
        let raw = base.with_extension("raw");
        let file = File::create(&raw).with_context(|| format!("creating {}", raw.display()))?;
        tracing::debug!(path = %raw.display(), "recording started");
        Ok(Self {
            base,
            writer: BufWriter::new(file),
            text,
            transcripts: Vec::new(),
        })
    }

    fn record_mic(&mut self, samples: &[i16]) -> Result<()> {
        for sample in samples {
            self.writer.write_all(&sample.to_le_bytes())?;
        }
        Ok(())
    }

    /// Fold an intermediate transcript into the utterance's history.
    ///
    /// Streaming decoders re-emit a growing prefix of the same utterance, so
    /// a result that extends the previous one replaces it in place; only
    /// genuinely new text appends.
    fn record_transcript(&mut self, transcript: String) {
        if transcript.trim().is_empty() {
            return;
        }
        match self.transcripts.last_mut() {
            Some(last) if *last == transcript => {}
            Some(last) if transcript.contains(last.as_str()) => *last = transcript,
            _ => self.transcripts.push(transcript),
        }
    }

    fn finalize(
        mut self,
        min_keep_bytes: u64,
        encoder: Arc<dyn AudioEncoder>,
        encode_queue: &DispatchQueue,
        errors: Sender<SpeechError>,
    ) -> Result<()> {
        self.writer.flush().context("flushing raw capture")?;
        drop(self.writer);

        let raw = self.base.with_extension("raw");
        let ipa = self.transcripts.join(",");
        if ipa.is_empty() {
            // Nothing was recognized; the audio is noise or an accidental tap.
            fs::remove_file(&raw).ok();
            return Ok(());
        }

        let raw_len = fs::metadata(&raw)
            .with_context(|| format!("stat {}", raw.display()))?
            .len();
        if raw_len <= min_keep_bytes {
            fs::remove_file(&raw).ok();
            return Ok(());
        }

        let sidecar = self.base.with_extension("json");
        let payload = serde_json::to_string(&Sidecar {
            text: &self.text,
            ipa,
        })
        .context("serializing transcript sidecar")?;
        fs::write(&sidecar, payload)
            .with_context(|| format!("writing {}", sidecar.display()))?;

        let target = self.base.with_extension(encoder.target_extension());
        encode_queue.execute(move || {
            if target.exists() {
                // Already encoded by an earlier attempt; just drop the raw.
                fs::remove_file(&raw).ok();
                return;
            }
            match encoder.encode(&raw, &target) {
                Ok(()) => {
                    fs::remove_file(&raw).ok();
                    tracing::debug!(path = %target.display(), "recording encoded");
                }
                Err(err) => {
                    tracing::warn!("encode failed, keeping raw capture: {err:#}");
                    let _ = errors.send(SpeechError::Encode {
                        path: raw.display().to_string(),
                        reason: format!("{err:#}"),
                    });
                }
            }
        });
        Ok(())
    }

    fn clean_up(self) {
        let raw = self.base.with_extension("raw");
        drop(self.writer);
        fs::remove_file(&raw).ok();
        tracing::debug!(path = %raw.display(), "recording discarded");
    }
}
