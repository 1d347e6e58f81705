//! Audio output stage: owns a `cpal` stream, a gain stage, a scheduling
//! cursor anchored to a master clock, and `rubato` resampling both for
//! device-rate matching and for rate-preserving playback-speed scaling.
//! MediaFox resamples rather than time-stretches, so pitch shifts with rate.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use audio_mixer::{Channel as MixChannel, Mixer};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use rubato::{FftFixedIn, Resampler};

use crate::model::AudioSamples;

/// Maximum allowed drift between the scheduling cursor and the
/// clock-predicted target before re-anchoring.
const DRIFT_THRESHOLD: Duration = Duration::from_millis(40);

/// Maps media time to device (wall-clock) time. Re-anchored on drift and on
/// every pause/resume transition.
#[derive(Debug, Clone, Copy)]
struct MasterClock {
    anchor_media_time: f64,
    anchor_device_time: Instant,
    playback_rate: f32,
}

impl MasterClock {
    fn new(now: Instant) -> Self {
        Self { anchor_media_time: 0.0, anchor_device_time: now, playback_rate: 1.0 }
    }

    fn anchor(&mut self, media_time: f64, now: Instant) {
        self.anchor_media_time = media_time;
        self.anchor_device_time = now;
    }

    fn set_rate(&mut self, rate: f32, media_time: f64, now: Instant) {
        // Re-anchor at the current point so the rate change doesn't jump
        // already-scheduled audio.
        self.anchor(media_time, now);
        self.playback_rate = rate;
    }

    /// The device instant at which `media_time` should sound.
    fn device_time_for(&self, media_time: f64) -> Instant {
        let delta_media = media_time - self.anchor_media_time;
        let delta_device = Duration::from_secs_f64((delta_media / self.playback_rate as f64).max(0.0));
        self.anchor_device_time + delta_device
    }

    /// Whether `actual` has drifted past [`DRIFT_THRESHOLD`] from the
    /// clock-predicted device time for `media_time`.
    fn has_drifted(&self, media_time: f64, actual: Instant) -> bool {
        let expected = self.device_time_for(media_time);
        let diff = if expected > actual { expected - actual } else { actual - expected };
        diff > DRIFT_THRESHOLD
    }
}

struct Inner {
    queue: VecDeque<f32>,
    clock: MasterClock,
    channel_count: u16,
    device_sample_rate: u32,
    downmix_mixers: HashMap<(u16, u16), Mixer<f32>>,
}

/// Owns the output device stream and the gain/clock/queue state around it.
/// `cpal` stream objects aren't `Send`-safe to hold behind a plain struct
/// field on some platforms, so the live stream itself is kept in an
/// `Option` created lazily by [`AudioOutput::start`] and torn down by
/// [`AudioOutput::dispose`].
pub struct AudioOutput {
    inner: Arc<Mutex<Inner>>,
    volume_bits: Arc<AtomicU32>,
    muted: Arc<AtomicBool>,
    playing: Arc<AtomicBool>,
    stream: Option<cpal::Stream>,
}

impl AudioOutput {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                queue: VecDeque::new(),
                clock: MasterClock::new(Instant::now()),
                channel_count: 2,
                device_sample_rate: 48_000,
                downmix_mixers: HashMap::new(),
            })),
            volume_bits: Arc::new(AtomicU32::new(1.0f32.to_bits())),
            muted: Arc::new(AtomicBool::new(false)),
            playing: Arc::new(AtomicBool::new(false)),
            stream: None,
        }
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume_bits.store(volume.clamp(0.0, 1.0).to_bits(), Ordering::SeqCst);
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    /// `volume * (1 - muted)`.
    pub fn gain(&self) -> f32 {
        let volume = f32::from_bits(self.volume_bits.load(Ordering::SeqCst));
        if self.muted.load(Ordering::SeqCst) {
            0.0
        } else {
            volume
        }
    }

    pub fn set_playback_rate(&self, rate: f32, media_time: f64) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner.clock.set_rate(rate, media_time, now);
    }

    /// On pause, outstanding scheduled buffers are stopped and the cursor
    /// frozen; on resume, the mapping re-anchors to the current device
    /// time.
    pub fn pause(&self, media_time: f64) {
        self.playing.store(false, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        inner.queue.clear();
        inner.clock.anchor(media_time, Instant::now());
    }

    pub fn resume(&self, media_time: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.clock.anchor(media_time, Instant::now());
        drop(inner);
        self.playing.store(true, Ordering::SeqCst);
    }

    /// Initializes the cpal output stream against the default device,
    /// resampling to its native rate via `rubato` if the chunk rate
    /// differs. Returns the negotiated device sample rate.
    pub fn start(&mut self) -> Result<u32, String> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or("no default audio output device")?;
        let config = device.default_output_config().map_err(|err| err.to_string())?;
        let sample_rate = config.sample_rate().0;
        let channel_count = config.channels();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.device_sample_rate = sample_rate;
            inner.channel_count = channel_count;
        }
        let inner = Arc::clone(&self.inner);
        let volume_bits = Arc::clone(&self.volume_bits);
        let muted = Arc::clone(&self.muted);
        let stream = device
            .build_output_stream(
                &config.into(),
                move |output: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    let gain = if muted.load(Ordering::SeqCst) {
                        0.0
                    } else {
                        f32::from_bits(volume_bits.load(Ordering::SeqCst))
                    };
                    let mut guard = inner.lock().unwrap();
                    for sample in output.iter_mut() {
                        *sample = guard.queue.pop_front().unwrap_or(0.0) * gain;
                    }
                },
                move |err| log::error!("audio output stream error: {err}"),
                None,
            )
            .map_err(|err| err.to_string())?;
        stream.play().map_err(|err| err.to_string())?;
        self.stream = Some(stream);
        Ok(sample_rate)
    }

    /// Remaps `samples` to the device's channel count, resamples to the
    /// device rate (if known and different), and appends the result to the
    /// playback queue, re-anchoring the master clock if the chunk's
    /// presentation time has drifted past the threshold.
    pub fn push_samples(&self, samples: AudioSamples) {
        let mut inner = self.inner.lock().unwrap();
        let device_rate = inner.device_sample_rate;
        let device_channels = inner.channel_count;
        let pts = samples.pts;
        let source_rate = samples.sample_rate;
        let source_channels = samples.channel_count;
        let data = samples.into_data();

        let now = Instant::now();
        if inner.clock.has_drifted(pts, now) {
            inner.clock.anchor(pts, now);
        }

        let (remapped, effective_channels) = if device_channels == 0 || source_channels == device_channels {
            (data, source_channels.max(1))
        } else {
            let mixed = remap_channels(&mut inner.downmix_mixers, &data, source_channels, device_channels);
            (mixed, device_channels)
        };

        let resampled = if source_rate == device_rate || device_rate == 0 {
            remapped
        } else {
            resample_interleaved(&remapped, effective_channels as usize, source_rate, device_rate)
                .unwrap_or(remapped)
        };
        inner.queue.extend(resampled);
    }

    pub fn queued_sample_count(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn dispose(&mut self) {
        self.stream = None;
        let mut inner = self.inner.lock().unwrap();
        inner.queue.clear();
        self.playing.store(false, Ordering::SeqCst);
    }
}

impl Default for AudioOutput {
    fn default() -> Self {
        Self::new()
    }
}

/// Resamples interleaved `f32` audio from `source_rate` to `target_rate`
/// using `rubato`'s FFT-based fixed-input resampler.
fn resample_interleaved(data: &[f32], channels: usize, source_rate: u32, target_rate: u32) -> Option<Vec<f32>> {
    if channels == 0 || data.is_empty() {
        return None;
    }
    let frames = data.len() / channels;
    if frames == 0 {
        return None;
    }
    let mut deinterleaved: Vec<Vec<f32>> = vec![Vec::with_capacity(frames); channels];
    for chunk in data.chunks(channels) {
        for (ch, sample) in chunk.iter().enumerate() {
            deinterleaved[ch].push(*sample);
        }
    }
    let mut resampler = FftFixedIn::<f32>::new(source_rate as usize, target_rate as usize, frames, 1, channels).ok()?;
    let output = resampler.process(&deinterleaved, None).ok()?;
    let out_frames = output.first().map_or(0, |ch| ch.len());
    let mut interleaved = Vec::with_capacity(out_frames * channels);
    for frame in 0..out_frames {
        for ch in output.iter() {
            interleaved.push(ch[frame]);
        }
    }
    Some(interleaved)
}

/// Per-frame channel remap: averages down to mono, repeats the sole
/// channel up, or copies/wraps channels into place. Used whenever a
/// proper downmix matrix isn't needed or available.
fn channel_map_channels(samples: &[f32], source_channels: u16, target_channels: u16) -> Vec<f32> {
    let (source_channels, target_channels) = (source_channels as usize, target_channels as usize);
    if source_channels == 0 || target_channels == 0 {
        return Vec::new();
    }
    if source_channels == target_channels {
        return samples.to_vec();
    }

    let frame_count = samples.len() / source_channels;
    let mut remapped = Vec::with_capacity(frame_count * target_channels);

    for frame_index in 0..frame_count {
        let frame_start = frame_index * source_channels;
        let frame = &samples[frame_start..frame_start + source_channels];
        for out_channel in 0..target_channels {
            let sample = if target_channels == 1 {
                frame.iter().copied().sum::<f32>() / source_channels as f32
            } else if source_channels == 1 {
                frame[0]
            } else if out_channel < source_channels {
                frame[out_channel]
            } else {
                frame[out_channel % source_channels]
            };
            remapped.push(sample);
        }
    }

    remapped
}

/// Maps a channel count to the speaker positions `audio_mixer` needs to
/// build a downmix matrix. Beyond 8 channels, extra channels are left
/// `Discrete` since there's no further named layout to place them in.
fn channel_layout_for_count(channel_count: u16) -> Vec<MixChannel> {
    match channel_count {
        0 => Vec::new(),
        1 => vec![MixChannel::FrontCenter],
        2 => vec![MixChannel::FrontLeft, MixChannel::FrontRight],
        3 => vec![MixChannel::FrontLeft, MixChannel::FrontRight, MixChannel::FrontCenter],
        4 => vec![
            MixChannel::FrontLeft,
            MixChannel::FrontRight,
            MixChannel::BackLeft,
            MixChannel::BackRight,
        ],
        5 => vec![
            MixChannel::FrontLeft,
            MixChannel::FrontRight,
            MixChannel::FrontCenter,
            MixChannel::BackLeft,
            MixChannel::BackRight,
        ],
        6 => vec![
            MixChannel::FrontLeft,
            MixChannel::FrontRight,
            MixChannel::FrontCenter,
            MixChannel::LowFrequency,
            MixChannel::BackLeft,
            MixChannel::BackRight,
        ],
        7 => vec![
            MixChannel::FrontLeft,
            MixChannel::FrontRight,
            MixChannel::FrontCenter,
            MixChannel::LowFrequency,
            MixChannel::BackLeft,
            MixChannel::BackRight,
            MixChannel::BackCenter,
        ],
        8 => vec![
            MixChannel::FrontLeft,
            MixChannel::FrontRight,
            MixChannel::FrontCenter,
            MixChannel::LowFrequency,
            MixChannel::BackLeft,
            MixChannel::BackRight,
            MixChannel::SideLeft,
            MixChannel::SideRight,
        ],
        _ => {
            let mut layout = channel_layout_for_count(8);
            layout.resize(channel_count as usize, MixChannel::Discrete);
            layout
        }
    }
}

/// Lazily builds and caches the `Mixer` for a `(source, target)` channel
/// pair so repeated chunks on the same track don't rebuild it every call.
fn downmix_mixer_for<'a>(
    mixers: &'a mut HashMap<(u16, u16), Mixer<f32>>,
    source_channels: u16,
    target_channels: u16,
) -> &'a Mixer<f32> {
    mixers.entry((source_channels, target_channels)).or_insert_with(|| {
        let input_layout = channel_layout_for_count(source_channels);
        let output_layout = channel_layout_for_count(target_channels);
        Mixer::<f32>::new(&input_layout, &output_layout)
    })
}

fn downmix_channels(
    mixers: &mut HashMap<(u16, u16), Mixer<f32>>,
    samples: &[f32],
    source_channels: u16,
    target_channels: u16,
) -> Vec<f32> {
    let frame_count = samples.len() / source_channels as usize;
    let mut downmixed = Vec::with_capacity(frame_count * target_channels as usize);
    let mixer = downmix_mixer_for(mixers, source_channels, target_channels);
    let mut output_frame = vec![0.0f32; target_channels as usize];

    for input_frame in samples.chunks_exact(source_channels as usize) {
        mixer.mix(input_frame, &mut output_frame);
        downmixed.extend_from_slice(&output_frame);
    }

    downmixed
}

/// Reconciles `samples`'s channel count with the device's. Uses a proper
/// downmix matrix when collapsing to fewer channels, and the cheaper
/// per-frame remap when expanding or channel counts already match.
fn remap_channels(
    mixers: &mut HashMap<(u16, u16), Mixer<f32>>,
    samples: &[f32],
    source_channels: u16,
    target_channels: u16,
) -> Vec<f32> {
    if source_channels == 0 || target_channels == 0 {
        return Vec::new();
    }
    if source_channels > target_channels {
        downmix_channels(mixers, samples, source_channels, target_channels)
    } else {
        channel_map_channels(samples, source_channels, target_channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gain_is_volume_times_one_minus_muted() {
        let output = AudioOutput::new();
        output.set_volume(0.5);
        assert_eq!(output.gain(), 0.5);
        output.set_muted(true);
        assert_eq!(output.gain(), 0.0);
    }

    #[test]
    fn volume_is_clamped_to_the_unit_range() {
        let output = AudioOutput::new();
        output.set_volume(5.0);
        assert_eq!(output.gain(), 1.0);
        output.set_volume(-1.0);
        assert_eq!(output.gain(), 0.0);
    }

    #[test]
    fn clock_predicts_device_time_scaled_by_playback_rate() {
        let now = Instant::now();
        let mut clock = MasterClock::new(now);
        clock.anchor(10.0, now);
        clock.set_rate(2.0, 10.0, now);
        let predicted = clock.device_time_for(12.0); // 2 media seconds at 2x = 1 wall second
        assert!((predicted - now) >= Duration::from_millis(990));
        assert!((predicted - now) <= Duration::from_millis(1010));
    }

    #[test]
    fn small_drift_does_not_trigger_a_re_anchor() {
        let now = Instant::now();
        let mut clock = MasterClock::new(now);
        clock.anchor(0.0, now);
        assert!(!clock.has_drifted(0.0, now + Duration::from_millis(10)));
    }

    #[test]
    fn large_drift_is_detected() {
        let now = Instant::now();
        let mut clock = MasterClock::new(now);
        clock.anchor(0.0, now);
        assert!(clock.has_drifted(0.0, now + Duration::from_millis(80)));
    }

    #[test]
    fn pause_clears_the_queue_and_freezes_the_cursor() {
        let output = AudioOutput::new();
        output.push_samples(AudioSamples::new(1, 48_000, 0.0, 0.1, vec![0.5; 4_800]));
        assert!(output.queued_sample_count() > 0);
        output.pause(0.1);
        assert_eq!(output.queued_sample_count(), 0);
    }

    #[test]
    fn pushing_samples_at_the_device_rate_requires_no_resampling() {
        let output = AudioOutput::new();
        output.push_samples(AudioSamples::new(2, 48_000, 0.0, 0.01, vec![1.0; 960]));
        assert_eq!(output.queued_sample_count(), 960);
    }

    #[test]
    fn mono_source_is_remapped_to_a_stereo_device() {
        let output = AudioOutput::new();
        // Default device channel_count is 2; pushing mono samples must not
        // silently leave the queue with a stereo-device/mono-data mismatch.
        output.push_samples(AudioSamples::new(1, 48_000, 0.0, 0.01, vec![1.0; 480]));
        assert_eq!(output.queued_sample_count(), 960);
    }

    #[test]
    fn channel_map_upmixes_mono_by_repeating_the_sole_channel() {
        let remapped = channel_map_channels(&[0.5, -0.5], 1, 2);
        assert_eq!(remapped, vec![0.5, 0.5, -0.5, -0.5]);
    }

    #[test]
    fn channel_map_downmixes_stereo_to_mono_by_averaging() {
        let remapped = channel_map_channels(&[1.0, 0.0], 2, 1);
        assert_eq!(remapped, vec![0.5]);
    }

    #[test]
    fn downmix_mixer_is_cached_across_calls() {
        let mut mixers = HashMap::new();
        let first = downmix_channels(&mut mixers, &[1.0, 1.0, 1.0, 1.0, 1.0, 1.0], 6, 2);
        assert_eq!(first.len(), 4);
        assert_eq!(mixers.len(), 1);
        let second = downmix_channels(&mut mixers, &[1.0, 1.0, 1.0, 1.0, 1.0, 1.0], 6, 2);
        assert_eq!(second.len(), 4);
        assert_eq!(mixers.len(), 1);
    }
}
