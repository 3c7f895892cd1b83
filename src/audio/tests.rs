use super::capture::{append_downmixed_samples, QuantumDispatcher};
use super::dispatch::DispatchQueue;
use super::meter::LevelMeter;
use super::resample::{resample, samples_to_float, sine_wave, zero_crossings};
use crossbeam_channel::bounded;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[test]
fn downmixes_multi_channel_audio() {
    let mut buf = Vec::new();
    let samples = [1_000i16, -1_000, 500, 500];
    append_downmixed_samples(&mut buf, &samples, 2, |sample| sample);
    assert_eq!(buf, vec![0, 500]);
}

#[test]
fn preserves_single_channel_audio() {
    let mut buf = Vec::new();
    let samples = [100i16, 200, 300];
    append_downmixed_samples(&mut buf, &samples, 1, |sample| sample);
    assert_eq!(buf, samples);
}

#[test]
fn resample_is_identity_for_equal_rates() {
    let input = vec![0i16, 100, -100, 32_000];
    assert_eq!(resample(&input, 16_000, 16_000), input);
}

#[test]
fn resample_handles_empty_input() {
    assert!(resample(&[], 44_100, 16_000).is_empty());
}

#[test]
fn resample_scales_length_by_rate_ratio() {
    let input = sine_wave(440.0, 44_100, 4_410, 8_000.0);
    let output = resample(&input, 44_100, 16_000);
    let expected = (4_410.0 * 16_000.0 / 44_100.0) as usize;
    assert!(
        (output.len() as i64 - expected as i64).abs() <= 1,
        "expected ~{expected} samples, got {}",
        output.len()
    );
}

#[test]
fn resample_is_deterministic() {
    let input = sine_wave(300.0, 44_100, 4_410, 12_000.0);
    assert_eq!(resample(&input, 44_100, 16_000), resample(&input, 44_100, 16_000));
}

#[test]
fn resample_preserves_dc_level() {
    // Unit DC gain: a constant signal survives the filter within rounding.
    let input = vec![10_000i16; 4_410];
    let output = resample(&input, 44_100, 16_000);
    let mid = &output[100..output.len() - 100];
    for &sample in mid {
        assert!((i32::from(sample) - 10_000).abs() <= 2, "got {sample}");
    }
}

#[test]
fn resample_round_trip_preserves_frequency() {
    // 200 Hz sits well under the 8 kHz cutoff, so down- and up-sampling must
    // keep the fundamental intact (measured by zero-crossing density).
    let seconds = 0.5;
    let input = sine_wave(200.0, 44_100, (44_100.0 * seconds) as usize, 16_000.0);
    let down = resample(&input, 44_100, 16_000);
    let back = resample(&down, 16_000, 44_100);

    let expected = (2.0 * 200.0 * seconds) as i64;
    let crossings = zero_crossings(&back) as i64;
    assert!(
        (crossings - expected).abs() <= 4,
        "expected ~{expected} crossings, got {crossings}"
    );
}

#[test]
fn resample_suppresses_content_above_target_nyquist() {
    // 12 kHz is past the 16 kHz target's Nyquist; after decimation next to
    // nothing of it should remain. The first and last samples ride the
    // filter's zero-padding transient, so the check covers the steady state.
    let input = sine_wave(12_000.0, 44_100, 8_820, 16_000.0);
    let output = resample(&input, 44_100, 16_000);
    let core = &output[100..output.len() - 100];
    let peak = core.iter().map(|&s| i32::from(s).abs()).max().unwrap_or(0);
    assert!(peak < 1_600, "aliased peak {peak} too large");
}

#[test]
fn samples_to_float_normalizes_range() {
    let floats = samples_to_float(&[0, 16_384, -32_768]);
    assert_eq!(floats[0], 0.0);
    assert!((floats[1] - 0.5).abs() < 1e-6);
    assert!((floats[2] + 1.0).abs() < 1e-6);
}

#[test]
fn meter_reports_peak_percentage_after_settling() {
    let mut meter = LevelMeter::new();
    let quantum = vec![32_767i16; 1_600];
    let mut level = 0.0;
    for _ in 0..100 {
        level = meter.on_audio(&quantum);
    }
    assert!(level > 99.0, "smoothed level should approach 100, got {level}");
}

#[test]
fn meter_floors_faint_levels_to_zero() {
    let mut meter = LevelMeter::new();
    let quantum = vec![40i16; 1_600];
    assert_eq!(meter.on_audio(&quantum), 0.0);
}

#[test]
fn meter_decays_smoothly_after_silence() {
    let mut meter = LevelMeter::new();
    let loud = vec![32_767i16; 1_600];
    for _ in 0..50 {
        meter.on_audio(&loud);
    }
    let silent = vec![0i16; 1_600];
    let first = meter.on_audio(&silent);
    let second = meter.on_audio(&silent);
    assert!(first > second, "level should decay, got {first} then {second}");
}

#[test]
fn dispatch_queue_runs_jobs_in_fifo_order() {
    let queue = DispatchQueue::new("test-fifo").expect("queue");
    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..16 {
        let order = order.clone();
        queue.execute(move || {
            order.lock().unwrap().push(i);
        });
    }
    queue.drain();
    assert_eq!(*order.lock().unwrap(), (0..16).collect::<Vec<_>>());
}

#[test]
fn dispatch_queue_drop_finishes_pending_jobs() {
    let counter = Arc::new(AtomicUsize::new(0));
    {
        let queue = DispatchQueue::new("test-drop").expect("queue");
        for _ in 0..8 {
            let counter = counter.clone();
            queue.execute(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
    }
    assert_eq!(counter.load(Ordering::Relaxed), 8);
}

#[test]
fn quantum_dispatcher_emits_fixed_size_quanta() {
    let (sender, receiver) = bounded(8);
    let dropped = Arc::new(AtomicUsize::new(0));
    let mut pump = QuantumDispatcher::new(4, sender, dropped.clone());

    pump.push(&[1i16, 2, 3, 4, 5, 6], 1, |s| s);
    assert_eq!(receiver.try_recv().expect("first quantum"), vec![1, 2, 3, 4]);
    assert!(receiver.try_recv().is_err(), "partial quantum must stay pending");

    pump.push(&[7i16, 8], 1, |s| s);
    assert_eq!(receiver.try_recv().expect("second quantum"), vec![5, 6, 7, 8]);
    assert_eq!(dropped.load(Ordering::Relaxed), 0);
}

#[test]
fn quantum_dispatcher_counts_drops_when_channel_full() {
    let (sender, receiver) = bounded(1);
    let dropped = Arc::new(AtomicUsize::new(0));
    let mut pump = QuantumDispatcher::new(2, sender, dropped.clone());

    pump.push(&[1i16, 2, 3, 4, 5, 6], 1, |s| s);
    assert_eq!(dropped.load(Ordering::Relaxed), 2);
    assert_eq!(receiver.try_recv().expect("kept quantum"), vec![1, 2]);
}

#[test]
fn quantum_dispatcher_downmixes_stereo_input() {
    let (sender, receiver) = bounded(4);
    let dropped = Arc::new(AtomicUsize::new(0));
    let mut pump = QuantumDispatcher::new(2, sender, dropped);

    pump.push(&[100i16, 300, -50, 50], 2, |s| s);
    assert_eq!(receiver.try_recv().expect("quantum"), vec![200, 0]);
}
