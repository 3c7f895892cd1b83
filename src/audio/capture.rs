//! System microphone capture via CPAL, chunked into fixed-duration quanta.
//!
//! CPAL delivers interleaved samples of whatever format and channel count the
//! hardware prefers; everything is converted to mono 16-bit PCM up front and
//! regrouped into quanta of `quantum_ms` before it reaches the pipeline. The
//! audio callback never blocks: full channels count a drop and move on.

use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Audio input device wrapper.
pub struct MicCapture {
    device: cpal::Device,
}

impl MicCapture {
    /// List microphone names so callers can expose a device selector.
    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices().context("no input devices available")?;
        let mut names = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Open a capture device, optionally forcing a specific one by name.
    pub fn open(preferred_device: Option<&str>) -> Result<Self> {
        let host = cpal::default_host();
        let device = match preferred_device {
            Some(name) => {
                let mut devices = host.input_devices().context("no input devices available")?;
                devices
                    .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                    .ok_or_else(|| anyhow!("input device '{name}' not found"))?
            }
            None => host
                .default_input_device()
                .context("no default input device available")?,
        };
        Ok(Self { device })
    }

    pub fn device_name(&self) -> String {
        self.device
            .name()
            .unwrap_or_else(|_| "Unknown Device".to_string())
    }

    /// Open the input stream and start delivering quanta, retrying a bounded
    /// number of times because mobile-grade hardware frequently reports the
    /// microphone as busy right after another client released it.
    pub(crate) fn start_with_retry(
        &self,
        quantum_ms: u64,
        capacity: usize,
        retries: u32,
        retry_delay: Duration,
    ) -> Result<CaptureStream> {
        let mut last_err = None;
        for attempt in 0..=retries {
            if attempt > 0 {
                std::thread::sleep(retry_delay);
                tracing::debug!(attempt, "retrying capture init");
            }
            match self.start(quantum_ms, capacity) {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err
            .unwrap_or_else(|| anyhow!("capture init failed"))
            .context(format!(
                "microphone '{}' unavailable after {} attempts. {}",
                self.device_name(),
                retries + 1,
                mic_permission_hint()
            )))
    }

    fn start(&self, quantum_ms: u64, capacity: usize) -> Result<CaptureStream> {
        let default_config = self
            .device
            .default_input_config()
            .context("failed to query input format")?;
        let format = default_config.sample_format();
        let device_config: StreamConfig = default_config.into();
        let sample_rate = device_config.sample_rate.0;
        let channels = usize::from(device_config.channels.max(1));
        let quantum_samples = ((u64::from(sample_rate) * quantum_ms) / 1000).max(1) as usize;

        tracing::debug!(
            ?format,
            sample_rate,
            channels,
            quantum_samples,
            "capture config"
        );

        let (sender, receiver) = bounded::<Vec<i16>>(capacity.max(1));
        let dropped = Arc::new(AtomicUsize::new(0));
        let dispatcher = Arc::new(Mutex::new(QuantumDispatcher::new(
            quantum_samples,
            sender,
            dropped.clone(),
        )));

        // Runtime stream errors land on a flag the capture loop polls; the
        // callback itself must not block or tear anything down.
        let failed = Arc::new(AtomicBool::new(false));
        let err_fn = {
            let failed = failed.clone();
            move |err| {
                tracing::warn!("audio stream error: {err}");
                failed.store(true, Ordering::Relaxed);
            }
        };
        let stream = match format {
            SampleFormat::F32 => {
                let dispatcher = dispatcher.clone();
                let dropped = dropped.clone();
                self.device.build_input_stream(
                    &device_config,
                    move |data: &[f32], _| {
                        if let Ok(mut pump) = dispatcher.try_lock() {
                            pump.push(data, channels, |sample| {
                                (sample.clamp(-1.0, 1.0) * 32_767.0) as i16
                            });
                        } else {
                            dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    },
                    err_fn,
                    None,
                )?
            }
            SampleFormat::I16 => {
                let dispatcher = dispatcher.clone();
                let dropped = dropped.clone();
                self.device.build_input_stream(
                    &device_config,
                    move |data: &[i16], _| {
                        if let Ok(mut pump) = dispatcher.try_lock() {
                            pump.push(data, channels, |sample| sample);
                        } else {
                            dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    },
                    err_fn,
                    None,
                )?
            }
            SampleFormat::U16 => {
                let dispatcher = dispatcher.clone();
                let dropped = dropped.clone();
                self.device.build_input_stream(
                    &device_config,
                    move |data: &[u16], _| {
                        if let Ok(mut pump) = dispatcher.try_lock() {
                            pump.push(data, channels, |sample| {
                                (i32::from(sample) - 32_768) as i16
                            });
                        } else {
                            dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    },
                    err_fn,
                    None,
                )?
            }
            other => return Err(anyhow!("unsupported sample format: {other:?}")),
        };

        stream.play().context("failed to start input stream")?;

        Ok(CaptureStream {
            stream,
            receiver,
            sample_rate,
            dropped,
            failed,
        })
    }
}

fn mic_permission_hint() -> &'static str {
    #[cfg(target_os = "macos")]
    {
        "macOS: System Settings > Privacy & Security > Microphone (enable this app)."
    }
    #[cfg(target_os = "linux")]
    {
        "Linux: check PipeWire/PulseAudio permissions and ensure the device is not muted."
    }
    #[cfg(target_os = "windows")]
    {
        "Windows: Settings > Privacy & Security > Microphone (allow access for this app)."
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        "Check OS microphone permissions."
    }
}

/// Live input stream handing out mono quanta at the device rate.
///
/// Not `Send`; it is created and consumed on the capture thread.
pub(crate) struct CaptureStream {
    stream: cpal::Stream,
    pub(crate) receiver: Receiver<Vec<i16>>,
    pub(crate) sample_rate: u32,
    dropped: Arc<AtomicUsize>,
    failed: Arc<AtomicBool>,
}

impl CaptureStream {
    pub(crate) fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// True once the device reported a runtime stream error.
    pub(crate) fn failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    pub(crate) fn stop(self) {
        if let Err(err) = self.stream.pause() {
            tracing::debug!("failed to pause audio stream: {err}");
        }
        drop(self.stream);
    }
}

/// Downmix multi-channel input to mono while applying the provided converter.
pub(super) fn append_downmixed_samples<T, F>(
    buf: &mut Vec<i16>,
    data: &[T],
    channels: usize,
    mut convert: F,
) where
    T: Copy,
    F: FnMut(T) -> i16,
{
    if channels <= 1 {
        buf.extend(data.iter().copied().map(&mut convert));
        return;
    }

    // Average each interleaved frame to produce a mono representation.
    let mut acc = 0i32;
    let mut count = 0usize;
    for sample in data.iter().copied() {
        acc += i32::from(convert(sample));
        count += 1;
        if count == channels {
            buf.push((acc / channels as i32) as i16);
            acc = 0;
            count = 0;
        }
    }
    if count > 0 {
        buf.push((acc / count as i32) as i16);
    }
}

/// Regroups callback buffers into fixed-size quanta and hands them to the
/// capture channel without ever blocking the audio thread.
pub(super) struct QuantumDispatcher {
    quantum_samples: usize,
    pending: Vec<i16>,
    scratch: Vec<i16>,
    sender: Sender<Vec<i16>>,
    dropped: Arc<AtomicUsize>,
}

impl QuantumDispatcher {
    pub(super) fn new(
        quantum_samples: usize,
        sender: Sender<Vec<i16>>,
        dropped: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            quantum_samples: quantum_samples.max(1),
            pending: Vec::with_capacity(quantum_samples),
            scratch: Vec::new(),
            sender,
            dropped,
        }
    }

    pub(super) fn push<T, F>(&mut self, data: &[T], channels: usize, convert: F)
    where
        T: Copy,
        F: FnMut(T) -> i16,
    {
        self.scratch.clear();
        append_downmixed_samples(&mut self.scratch, data, channels, convert);
        self.pending.extend_from_slice(&self.scratch);

        while self.pending.len() >= self.quantum_samples {
            let quantum: Vec<i16> = self.pending.drain(..self.quantum_samples).collect();
            if let Err(err) = self.sender.try_send(quantum) {
                match err {
                    TrySendError::Full(_) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    TrySendError::Disconnected(_) => break,
                }
            }
        }
    }
}
