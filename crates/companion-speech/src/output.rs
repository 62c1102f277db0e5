//! Shared audio output and the playback-side level analysis that drives the
//! avatar's mouth.
//!
//! There is exactly one output per process. Only the queue manager causes a new
//! clip to start, and whoever starts one is responsible for stopping it on its
//! own cleanup path.

use crate::error::{Result, SpeechError};

pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;

/// Mid-range band sampled for mouth movement, roughly the speech formants.
pub const SPEECH_BAND_LOW_HZ: f32 = 300.0;
pub const SPEECH_BAND_HIGH_HZ: f32 = 2_000.0;

/// A decoded audio buffer ready for playback.
#[derive(Debug, Clone, Default)]
pub struct AudioClip {
    pub samples: Vec<f32>,
    pub sample_rate_hz: u32,
}

impl AudioClip {
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate_hz == 0 {
            return 0;
        }
        (self.samples.len() as u64 * 1000) / self.sample_rate_hz as u64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// The single shared audio output. `begin` queues a whole clip for playback,
/// `stop` silences it immediately, and `band_level` reports the mid-band
/// energy of the most recently played window for mouth sync.
pub trait AudioOutput: Send + Sync {
    fn begin(&self, clip: &AudioClip) -> Result<()>;
    fn stop(&self);
    fn is_active(&self) -> bool;
    fn band_level(&self) -> f32;
}

/// Headless output that discards audio and finishes instantly. Used when no
/// sound device is wanted (tests, --no-play).
#[derive(Debug, Default)]
pub struct NullOutput;

impl AudioOutput for NullOutput {
    fn begin(&self, _clip: &AudioClip) -> Result<()> {
        Ok(())
    }

    fn stop(&self) {}

    fn is_active(&self) -> bool {
        false
    }

    fn band_level(&self) -> f32 {
        0.0
    }
}

/// Average spectral magnitude over a fixed band, via Goertzel bins spread
/// across the band. Returns roughly 1.0 for a full-scale sine inside the band.
pub fn band_energy(samples: &[f32], sample_rate_hz: u32, low_hz: f32, high_hz: f32) -> f32 {
    if samples.len() < 2 || sample_rate_hz == 0 {
        return 0.0;
    }
    const BINS: usize = 5;
    let mut acc = 0.0f32;
    for bin in 0..BINS {
        let t = (bin as f32 + 0.5) / BINS as f32;
        let freq_hz = low_hz + (high_hz - low_hz) * t;
        acc += goertzel_magnitude(samples, sample_rate_hz, freq_hz);
    }
    acc / BINS as f32
}

fn goertzel_magnitude(samples: &[f32], sample_rate_hz: u32, freq_hz: f32) -> f32 {
    let n = samples.len() as f32;
    let k = (freq_hz * n / sample_rate_hz as f32).round();
    let w = 2.0 * std::f32::consts::PI * k / n;
    let coeff = 2.0 * w.cos();

    let mut s_prev = 0.0f32;
    let mut s_prev2 = 0.0f32;
    for &x in samples {
        let s = x + coeff * s_prev - s_prev2;
        s_prev2 = s_prev;
        s_prev = s;
    }

    let power = s_prev * s_prev + s_prev2 * s_prev2 - coeff * s_prev * s_prev2;
    power.max(0.0).sqrt() * 2.0 / n
}

/// Per-session smoothing state between the raw band level and the avatar
/// parameters: gate out the noise floor, smooth exponentially, normalize to
/// [0, 1].
#[derive(Debug, Clone)]
pub struct MouthLevel {
    smoothing: f32,
    noise_floor: f32,
    gain: f32,
    last: f32,
}

impl MouthLevel {
    pub fn new(smoothing: f32, noise_floor: f32, gain: f32) -> Self {
        Self {
            smoothing: smoothing.clamp(0.0, 1.0),
            noise_floor,
            gain,
            last: 0.0,
        }
    }

    pub fn update(&mut self, raw: f32) -> f32 {
        let gated = (raw - self.noise_floor).max(0.0);
        let smoothed = self.last + (gated - self.last) * self.smoothing;
        self.last = smoothed;
        (smoothed * self.gain).clamp(0.0, 1.0)
    }

    pub fn reset(&mut self) {
        self.last = 0.0;
    }
}

/// Linear-interpolation resampler for matching a clip's rate to the device.
pub struct LinearResampler {
    in_rate_hz: u32,
    out_rate_hz: u32,
    step: f64,
    pos: f64,
    buf: Vec<f32>,
}

impl LinearResampler {
    pub fn new(in_rate_hz: u32, out_rate_hz: u32) -> Self {
        Self {
            in_rate_hz,
            out_rate_hz,
            step: in_rate_hz as f64 / out_rate_hz as f64,
            pos: 0.0,
            buf: Vec::new(),
        }
    }

    pub fn process_into(&mut self, input: &[f32], out: &mut Vec<f32>) {
        out.clear();
        if input.is_empty() {
            return;
        }

        self.buf.extend_from_slice(input);

        let approx_out_len = ((input.len() as u64 * self.out_rate_hz as u64)
            / self.in_rate_hz.max(1) as u64)
            .saturating_add(2) as usize;
        out.reserve(approx_out_len);

        while self.pos + 1.0 < self.buf.len() as f64 {
            let i = self.pos.floor() as usize;
            let frac = self.pos - i as f64;

            let a = self.buf[i];
            let b = self.buf[i + 1];

            out.push(a + (b - a) * frac as f32);
            self.pos += self.step;
        }

        let drain = self.pos.floor() as usize;
        if drain > 0 {
            self.buf.drain(0..drain);
            self.pos -= drain as f64;
        }
    }
}

#[cfg(feature = "playback")]
pub use cpal_output::CpalOutput;

#[cfg(feature = "playback")]
mod cpal_output {
    use super::*;

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, MutexGuard};
    use std::time::Duration;

    use anyhow::Context;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use ringbuf::traits::*;
    use ringbuf::HeapRb;

    /// How much audio the output ring can hold. Chunks are bounded by the
    /// segmenter's character limit, so a couple of minutes is generous.
    const RING_CAPACITY_MS: u64 = 120_000;
    /// Monitor window for level analysis, about 50 ms of playback.
    const MONITOR_WINDOW_MS: u64 = 50;

    fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        match mutex.lock() {
            Ok(g) => g,
            Err(g) => g.into_inner(),
        }
    }

    struct MonitorTap {
        consumer: ringbuf::HeapCons<f32>,
        window: Vec<f32>,
        window_len: usize,
    }

    /// cpal-backed output. The device callback pulls samples from a ring
    /// buffer and mirrors what it plays into a monitor ring for `band_level`.
    ///
    /// `cpal::Stream` is not `Send`, so the stream lives on a dedicated audio
    /// thread; all traffic with it goes through ring buffers and atomics.
    pub struct CpalOutput {
        producer: Mutex<ringbuf::HeapProd<f32>>,
        queued: Arc<AtomicUsize>,
        flush: Arc<AtomicBool>,
        monitor: Mutex<MonitorTap>,
        output_sample_rate: u32,
        shutdown: Arc<AtomicBool>,
        audio_thread: Option<std::thread::JoinHandle<()>>,
    }

    type StreamParts = (ringbuf::HeapProd<f32>, ringbuf::HeapCons<f32>, u32);

    fn build_stream(
        queued: Arc<AtomicUsize>,
        flush: Arc<AtomicBool>,
    ) -> anyhow::Result<(cpal::Stream, StreamParts)> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .context("no output device available")?;

        let mut supported_configs_range = device.supported_output_configs()?;
        let config_range = match supported_configs_range.find(|c| c.channels() == 1) {
            None => device
                .supported_output_configs()?
                .next()
                .context("no audio output available")?,
            Some(config_range) => config_range,
        };

        let default_sr = device
            .default_output_config()
            .ok()
            .map(|cfg| cfg.sample_rate().0);
        let desired_sr = default_sr.unwrap_or(DEFAULT_SAMPLE_RATE);

        let sample_rate = cpal::SampleRate(desired_sr).clamp(
            config_range.min_sample_rate(),
            config_range.max_sample_rate(),
        );
        let config: cpal::StreamConfig = config_range.with_sample_rate(sample_rate).into();
        let channels = config.channels as usize;
        let output_sample_rate = config.sample_rate.0;

        let ring_capacity = ((output_sample_rate as u64 * RING_CAPACITY_MS) / 1000) as usize;
        let rb = HeapRb::<f32>::new(ring_capacity);
        let (producer, mut consumer) = rb.split();

        let monitor_capacity =
            ((output_sample_rate as u64 * MONITOR_WINDOW_MS * 4) / 1000).max(256) as usize;
        let monitor_rb = HeapRb::<f32>::new(monitor_capacity);
        let (mut monitor_prod, monitor_cons) = monitor_rb.split();

        let mut last_elem_state = 0.0f32;

        let stream = device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                data.fill(0.);

                if flush.swap(false, Ordering::AcqRel) {
                    while consumer.try_pop().is_some() {}
                    queued.store(0, Ordering::Release);
                    last_elem_state = 0.0;
                    return;
                }

                let mut last_elem = last_elem_state;
                let mut popped = 0usize;
                for (idx, elem) in data.iter_mut().enumerate() {
                    if idx % channels == 0 {
                        match consumer.try_pop() {
                            None => break,
                            Some(v) => {
                                last_elem = v;
                                popped = popped.saturating_add(1);
                                *elem = v;
                                // Overflow just loses level history, never audio.
                                let _ = monitor_prod.try_push(v);
                            }
                        }
                    } else {
                        *elem = last_elem;
                    }
                }

                if popped > 0 {
                    let _ = queued.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v0| {
                        Some(v0.saturating_sub(popped))
                    });
                }
                last_elem_state = last_elem;
            },
            move |err| tracing::error!("cpal error: {err}"),
            None,
        )?;
        stream.play()?;

        Ok((stream, (producer, monitor_cons, output_sample_rate)))
    }

    impl CpalOutput {
        pub fn setup() -> anyhow::Result<Self> {
            let queued = Arc::new(AtomicUsize::new(0));
            let flush = Arc::new(AtomicBool::new(false));
            let shutdown = Arc::new(AtomicBool::new(false));

            let (init_tx, init_rx) = std::sync::mpsc::channel();
            let t_queued = queued.clone();
            let t_flush = flush.clone();
            let t_shutdown = shutdown.clone();

            let audio_thread = std::thread::Builder::new()
                .name("audio-output".to_string())
                .spawn(move || match build_stream(t_queued, t_flush) {
                    Ok((stream, parts)) => {
                        let _ = init_tx.send(Ok(parts));
                        while !t_shutdown.load(Ordering::Acquire) {
                            std::thread::sleep(Duration::from_millis(50));
                        }
                        drop(stream);
                    }
                    Err(err) => {
                        let _ = init_tx.send(Err(err));
                    }
                })?;

            let (producer, monitor_cons, output_sample_rate) = init_rx
                .recv()
                .context("audio thread exited before reporting its stream")??;
            let window_len =
                ((output_sample_rate as u64 * MONITOR_WINDOW_MS) / 1000).max(64) as usize;

            Ok(Self {
                producer: Mutex::new(producer),
                queued,
                flush,
                monitor: Mutex::new(MonitorTap {
                    consumer: monitor_cons,
                    window: Vec::with_capacity(window_len),
                    window_len,
                }),
                output_sample_rate,
                shutdown,
                audio_thread: Some(audio_thread),
            })
        }

        pub fn output_sample_rate(&self) -> u32 {
            self.output_sample_rate
        }
    }

    impl Drop for CpalOutput {
        fn drop(&mut self) {
            self.shutdown.store(true, Ordering::Release);
            if let Some(handle) = self.audio_thread.take() {
                let _ = handle.join();
            }
        }
    }

    impl AudioOutput for CpalOutput {
        fn begin(&self, clip: &AudioClip) -> Result<()> {
            // A pending stop is applied by the audio callback; give it a
            // moment so the new clip is not swept away with the old samples.
            let mut waited_ms = 0u32;
            while self.flush.load(Ordering::Acquire) && waited_ms < 50 {
                std::thread::sleep(Duration::from_millis(1));
                waited_ms += 1;
            }

            let samples: Vec<f32> = if clip.sample_rate_hz == self.output_sample_rate {
                clip.samples.clone()
            } else {
                let mut resampler =
                    LinearResampler::new(clip.sample_rate_hz, self.output_sample_rate);
                let mut out = Vec::new();
                resampler.process_into(&clip.samples, &mut out);
                out
            };

            let mut producer = lock_or_recover(&self.producer);
            let pushed = producer.push_slice(&samples);
            if pushed < samples.len() {
                return Err(SpeechError::Output(format!(
                    "clip of {} samples exceeds output buffer capacity",
                    samples.len()
                )));
            }
            self.queued.fetch_add(pushed, Ordering::AcqRel);
            Ok(())
        }

        fn stop(&self) {
            self.flush.store(true, Ordering::Release);
            self.queued.store(0, Ordering::Release);
        }

        fn is_active(&self) -> bool {
            self.queued.load(Ordering::Acquire) > 0
        }

        fn band_level(&self) -> f32 {
            let mut tap = lock_or_recover(&self.monitor);
            let window_len = tap.window_len;
            while let Some(v) = tap.consumer.try_pop() {
                tap.window.push(v);
            }
            let excess = tap.window.len().saturating_sub(window_len);
            if excess > 0 {
                tap.window.drain(0..excess);
            }
            band_energy(
                &tap.window,
                self.output_sample_rate,
                SPEECH_BAND_LOW_HZ,
                SPEECH_BAND_HIGH_HZ,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq_hz: f32, sample_rate_hz: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| {
                (2.0 * std::f32::consts::PI * freq_hz * i as f32 / sample_rate_hz as f32).sin()
            })
            .collect()
    }

    #[test]
    fn band_energy_is_zero_for_silence() {
        let samples = vec![0.0f32; 1024];
        let level = band_energy(&samples, 24_000, SPEECH_BAND_LOW_HZ, SPEECH_BAND_HIGH_HZ);
        assert!(level < 1e-6);
    }

    #[test]
    fn band_energy_reacts_to_in_band_tone() {
        let in_band = sine(1_000.0, 24_000, 2048);
        let out_of_band = sine(60.0, 24_000, 2048);

        let hot = band_energy(&in_band, 24_000, SPEECH_BAND_LOW_HZ, SPEECH_BAND_HIGH_HZ);
        let cold = band_energy(&out_of_band, 24_000, SPEECH_BAND_LOW_HZ, SPEECH_BAND_HIGH_HZ);
        assert!(hot > cold * 5.0, "in-band {hot} vs out-of-band {cold}");
    }

    #[test]
    fn mouth_level_gates_noise_and_clamps() {
        let mut mouth = MouthLevel::new(0.8, 0.05, 4.0);
        assert_eq!(mouth.update(0.04), 0.0);

        // A loud sustained level saturates at 1.0 and never exceeds it.
        let mut last = 0.0;
        for _ in 0..50 {
            last = mouth.update(5.0);
        }
        assert!((last - 1.0).abs() < 1e-6);

        mouth.reset();
        assert_eq!(mouth.update(0.0), 0.0);
    }

    #[test]
    fn clip_duration_is_sample_count_over_rate() {
        let clip = AudioClip {
            samples: vec![0.0; 24_000],
            sample_rate_hz: 24_000,
        };
        assert_eq!(clip.duration_ms(), 1000);
        assert_eq!(AudioClip::default().duration_ms(), 0);
    }

    #[test]
    fn linear_resampler_halves_sample_count_for_2x_downrate() {
        let mut rs = LinearResampler::new(48_000, 24_000);
        let input = sine(440.0, 48_000, 4800);
        let mut out = Vec::new();
        rs.process_into(&input, &mut out);
        assert!((out.len() as i64 - 2400).abs() < 4);
    }
}
