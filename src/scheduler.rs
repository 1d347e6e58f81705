//! Sync Scheduler: drives presentation from the video decode queue against
//! a media-time clock, with a one-frame lookahead buffer since the decode
//! queue is a one-directional channel (you can't un-pop a frame once
//! you've peeked past its PTS).

use std::num::NonZeroU32;
use std::sync::Mutex;

use governor::{Quota, RateLimiter};

use crate::decode::{DecodeQueue, DecodedUnit};
use crate::model::Frame;

/// How late a frame's presentation window may end before it counts as a
/// drop instead of the current frame.
const DEFAULT_TOLERANCE: f64 = 0.0;

/// `timeupdate` must not fire more than 4 times per second in Playing
/// state: no more frequently than every 250 ms.
const TIMEUPDATE_HZ: u32 = 4;

pub enum TickOutcome {
    /// A frame was selected for presentation; the caller presents it and
    /// then calls [`Frame::close`].
    Presented(Frame),
    /// Nothing was due; the caller should leave the renderer's existing
    /// surface on screen and mark `waiting=true`.
    Waiting,
}

pub struct TickResult {
    pub outcome: TickOutcome,
    pub dropped: usize,
}

/// Drives video presentation. Owns a one-frame lookahead buffer and the
/// `timeupdate` rate limiter; does not own the renderer or audio output —
/// those are supplied/consumed by the caller each tick.
pub struct SyncScheduler {
    next_frame: Option<Frame>,
    tolerance: f64,
    timeupdate_limiter: RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>,
    seek_target: Mutex<Option<(f64, bool)>>,
}

impl SyncScheduler {
    pub fn new() -> Self {
        Self {
            next_frame: None,
            tolerance: DEFAULT_TOLERANCE,
            timeupdate_limiter: RateLimiter::direct(Quota::per_second(
                NonZeroU32::new(TIMEUPDATE_HZ).expect("4 is nonzero"),
            )),
            seek_target: Mutex::new(None),
        }
    }

    /// Runs one presentation step for media time `now_media`, pulling from
    /// `queue` until it finds a frame due for presentation, a future
    /// frame to stash as lookahead, or an empty queue.
    pub fn tick(&mut self, now_media: f64, queue: &mut DecodeQueue) -> TickResult {
        let mut dropped = 0usize;
        let mut candidate: Option<Frame> = None;

        loop {
            let frame = match self.next_frame.take() {
                Some(frame) => frame,
                None => match queue.try_recv() {
                    Some(DecodedUnit::Video(frame)) => frame,
                    Some(DecodedUnit::Audio(samples)) => {
                        samples.close();
                        continue;
                    }
                    None => break,
                },
            };

            let is_late = frame.pts + frame.display_duration <= now_media - self.tolerance;
            let is_current = frame.pts <= now_media;

            if is_late || is_current {
                if let Some(previous) = candidate.take() {
                    dropped += 1;
                    previous.close();
                }
                candidate = Some(frame);
                if is_current && !is_late {
                    break; // the on-time frame is the final word for this tick
                }
                // else: a late frame — keep consuming in case a later,
                // even-more-current frame follows in the same tick.
            } else {
                self.next_frame = Some(frame);
                break;
            }
        }

        match candidate {
            Some(frame) => TickResult { outcome: TickOutcome::Presented(frame), dropped },
            None => TickResult { outcome: TickOutcome::Waiting, dropped },
        }
    }

    /// Whether a `timeupdate` may be emitted right now without exceeding
    /// the 4 Hz cadence. `seeked` events bypass this limiter entirely and
    /// fire once immediately after a seek completes.
    pub fn should_emit_timeupdate(&self) -> bool {
        self.timeupdate_limiter.check().is_ok()
    }

    /// Records a seek target, replacing any not-yet-processed target from
    /// a prior call — rapid repeated seeks coalesce onto the latest one.
    pub fn request_seek(&self, target: f64, precise: bool) {
        *self.seek_target.lock().unwrap() = Some((target, precise));
    }

    pub fn take_seek_target(&self) -> Option<(f64, bool)> {
        self.seek_target.lock().unwrap().take()
    }

    /// Drops the lookahead buffer and any queued frames, used on seek and
    /// track switch.
    pub fn flush(&mut self, queue: &mut DecodeQueue) {
        if let Some(frame) = self.next_frame.take() {
            frame.close();
        }
        queue.drain();
    }
}

impl Default for SyncScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{DecodeWorker, Packet};
    use crate::model::PixelFormat;

    fn video_frame(pts: f64, display_duration: f64) -> Frame {
        Frame::new(pts, display_duration, PixelFormat::Rgba8, 2, 2, vec![0u8; 16])
    }

    struct FixedFrameDecoder;
    impl crate::decode::Decoder for FixedFrameDecoder {
        fn decode(&mut self, packet: Packet) -> crate::error::EngineResult<Vec<crate::decode::DecodedUnit>> {
            Ok(vec![crate::decode::DecodedUnit::Video(video_frame(packet.pts, 1.0 / 30.0))])
        }
        fn flush(&mut self) -> Vec<crate::decode::DecodedUnit> {
            Vec::new()
        }
    }

    struct FixedPacketSource {
        packets: Vec<Packet>,
    }
    impl crate::decode::PacketSource for FixedPacketSource {
        fn next_packet(&mut self) -> Option<Packet> {
            if self.packets.is_empty() {
                None
            } else {
                Some(self.packets.remove(0))
            }
        }
        fn seek(&mut self, _target_pts: f64) -> Option<f64> {
            None
        }
    }

    async fn make_queue(pts_values: &[f64]) -> DecodeQueue {
        let packets = pts_values
            .iter()
            .map(|pts| Packet { pts: *pts, keyframe: true, data: vec![0] })
            .collect();
        let source = Box::new(FixedPacketSource { packets });
        let (worker, mut queue) = DecodeWorker::spawn(source, Box::new(FixedFrameDecoder), 10);
        // Let the spawned task actually push its output before we try_recv;
        // the data is already sitting in the channel buffer by the time we
        // drop `worker`, so aborting its (by-then-finished) task is harmless.
        for _ in 0..(pts_values.len() + 1) {
            tokio::task::yield_now().await;
        }
        drop(worker);
        queue
    }

    #[tokio::test(flavor = "current_thread")]
    async fn an_on_time_frame_is_presented_without_drops() {
        let mut queue = make_queue(&[1.0]).await;
        let mut scheduler = SyncScheduler::new();
        let result = scheduler.tick(1.0, &mut queue);
        assert_eq!(result.dropped, 0);
        match result.outcome {
            TickOutcome::Presented(frame) => frame.close(),
            TickOutcome::Waiting => panic!("expected a presented frame"),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn late_frames_are_dropped_except_the_latest() {
        let mut queue = make_queue(&[0.0, 0.1, 0.2]).await;
        let mut scheduler = SyncScheduler::new();
        // now_media far ahead: all three are late; 0.2 survives as current.
        let result = scheduler.tick(5.0, &mut queue);
        assert_eq!(result.dropped, 2);
        match result.outcome {
            TickOutcome::Presented(frame) => {
                assert_eq!(frame.pts, 0.2);
                frame.close();
            }
            TickOutcome::Waiting => panic!("expected a presented frame"),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn a_future_frame_is_stashed_as_lookahead_and_reused_next_tick() {
        let mut queue = make_queue(&[10.0]).await;
        let mut scheduler = SyncScheduler::new();
        let first = scheduler.tick(0.0, &mut queue);
        assert!(matches!(first.outcome, TickOutcome::Waiting));
        let second = scheduler.tick(10.0, &mut queue);
        match second.outcome {
            TickOutcome::Presented(frame) => frame.close(),
            TickOutcome::Waiting => panic!("lookahead frame should now be due"),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn an_empty_queue_reports_waiting() {
        let mut queue = make_queue(&[]).await;
        let mut scheduler = SyncScheduler::new();
        let result = scheduler.tick(0.0, &mut queue);
        assert!(matches!(result.outcome, TickOutcome::Waiting));
        assert_eq!(result.dropped, 0);
    }

    #[test]
    fn repeated_seek_requests_coalesce_to_the_latest() {
        let scheduler = SyncScheduler::new();
        scheduler.request_seek(5.0, false);
        scheduler.request_seek(9.0, true);
        assert_eq!(scheduler.take_seek_target(), Some((9.0, true)));
        assert_eq!(scheduler.take_seek_target(), None);
    }

    #[test]
    fn timeupdate_is_rate_limited() {
        let scheduler = SyncScheduler::new();
        let mut allowed = 0;
        for _ in 0..10 {
            if scheduler.should_emit_timeupdate() {
                allowed += 1;
            }
        }
        assert!(allowed < 10);
    }
}
