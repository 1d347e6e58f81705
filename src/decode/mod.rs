//! Decode pipeline: host-supplied demux/packet traits, a per-kind `Decoder`
//! trait, and bounded queues between decode and the Sync Scheduler.

mod symphonia_audio;

pub use symphonia_audio::SymphoniaAudioDecoder;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::EngineResult;
use crate::model::{AudioSamples, Frame, MediaInfo, TrackDescriptor};

/// Bounded queue capacities: video queue holds ~10 frames, audio ~20
/// chunks.
pub const VIDEO_QUEUE_CAPACITY: usize = 10;
pub const AUDIO_QUEUE_CAPACITY: usize = 20;

/// A compressed packet read from a [`PacketSource`].
#[derive(Debug, Clone)]
pub struct Packet {
    pub pts: f64,
    pub keyframe: bool,
    pub data: Vec<u8>,
}

/// One unit of decoded output.
pub enum DecodedUnit {
    Video(Frame),
    Audio(AudioSamples),
}

/// Host-supplied ordered packet stream for one track. Concrete container
/// demuxing is out of scope here; MediaFox only defines the seam.
pub trait PacketSource: Send {
    fn next_packet(&mut self) -> Option<Packet>;

    /// Positions the source at the keyframe at-or-before `target_pts`,
    /// returning that keyframe's PTS, or `None` if the source has no data
    /// at or before it.
    fn seek(&mut self, target_pts: f64) -> Option<f64>;
}

/// Host-supplied demuxer: yields the container's track descriptors and a
/// packet source per track.
pub trait Demuxer: Send {
    fn media_info(&self) -> MediaInfo;
    fn track_descriptors(&self) -> Vec<TrackDescriptor>;
    fn open_packet_source(&mut self, track_id: &str) -> Option<Box<dyn PacketSource>>;
}

/// Per-track-kind decoder: compressed packet in, zero or more decoded units
/// out (a packet may produce zero units while priming, or several when a
/// container packet bundles multiple access units).
pub trait Decoder: Send {
    fn decode(&mut self, packet: Packet) -> EngineResult<Vec<DecodedUnit>>;
    fn flush(&mut self) -> Vec<DecodedUnit>;
}

/// Receiving half of a decode worker's output queue.
pub struct DecodeQueue {
    receiver: mpsc::Receiver<DecodedUnit>,
}

impl DecodeQueue {
    pub async fn recv(&mut self) -> Option<DecodedUnit> {
        self.receiver.recv().await
    }

    /// Non-blocking pop, used by the Sync Scheduler's synchronous `tick`.
    pub fn try_recv(&mut self) -> Option<DecodedUnit> {
        self.receiver.try_recv().ok()
    }

    /// Drains whatever is already queued without awaiting, used on seek/
    /// track-switch to flush stale output.
    pub fn drain(&mut self) {
        while self.receiver.try_recv().is_ok() {}
    }
}

/// Owns a spawned decode task reading from a [`PacketSource`] through a
/// [`Decoder`] into a bounded `tokio::sync::mpsc` channel — the channel's
/// own backpressure suspends the decoder when the queue is full, with no
/// separate gate needed.
///
/// Cancellation (seek, track switch, dispose) bumps a shared generation
/// counter; the worker loop checks it between packets and exits without
/// pushing further output once superseded, the Rust analogue of the
/// teacher's `DecodeWorkItem { generation: u64, .. }` staleness check in
/// `audio_decoder.rs`.
pub struct DecodeWorker {
    generation: Arc<AtomicU64>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl DecodeWorker {
    pub fn spawn(
        mut source: Box<dyn PacketSource>,
        mut decoder: Box<dyn Decoder>,
        capacity: usize,
    ) -> (Self, DecodeQueue) {
        let (tx, rx) = mpsc::channel(capacity);
        let generation = Arc::new(AtomicU64::new(0));
        let spawn_generation = 0u64;
        let worker_generation = Arc::clone(&generation);

        let handle = tokio::spawn(async move {
            loop {
                if worker_generation.load(Ordering::SeqCst) != spawn_generation {
                    return; // superseded by a seek/track-switch/dispose
                }
                let Some(packet) = source.next_packet() else { break };
                match decoder.decode(packet) {
                    Ok(units) => {
                        for unit in units {
                            if worker_generation.load(Ordering::SeqCst) != spawn_generation {
                                return;
                            }
                            if tx.send(unit).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => log::warn!("decode error: {err}"),
                }
            }
            for unit in decoder.flush() {
                let _ = tx.send(unit).await;
            }
        });

        (
            Self { generation, handle: Some(handle) },
            DecodeQueue { receiver: rx },
        )
    }

    /// Invalidates this worker's in-flight output; used on seek, track
    /// switch, and dispose.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn abort(&mut self) {
        self.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for DecodeWorker {
    fn drop(&mut self) {
        self.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
