use std::collections::VecDeque;

use super::codec;

/// Buffered-ahead duration above which the scheduler starts warning.
const BACKLOG_WARN_SECS: f64 = 30.0;

/// A decoded buffer and the time it must start playing on the output clock.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackItem {
    pub seq: u64,
    pub start: f64,
    pub duration: f64,
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

impl PlaybackItem {
    #[must_use]
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Chains inbound audio buffers back to back on a monotonic clock.
///
/// Each buffer starts at `max(now, next_start)` and pushes `next_start` to its
/// own end, so buffers never overlap and leave no gap while audio keeps
/// arriving faster than it plays. Nothing limits how far ahead the cursor can
/// run; [`PlaybackScheduler::backlog`] reports how much is queued.
#[derive(Debug, Clone)]
pub struct PlaybackScheduler {
    sample_rate: u32,
    next_start: f64,
    next_seq: u64,
    warned_backlog: bool,
}

impl PlaybackScheduler {
    #[must_use]
    pub const fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            next_start: 0.0,
            next_seq: 0,
            warned_backlog: false,
        }
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Start time the next buffer would get if `now` were earlier.
    #[must_use]
    pub const fn next_start(&self) -> f64 {
        self.next_start
    }

    /// Decode `pcm` and place it on the timeline. Empty input schedules nothing.
    pub fn schedule(&mut self, pcm: &[u8], now: f64) -> Option<PlaybackItem> {
        let samples = codec::decode(pcm);
        if samples.is_empty() {
            return None;
        }
        let duration = codec::duration_secs(pcm.len(), self.sample_rate);
        let start = now.max(self.next_start);
        self.next_start = start + duration;

        let item = PlaybackItem {
            seq: self.next_seq,
            start,
            duration,
            sample_rate: self.sample_rate,
            samples,
        };
        self.next_seq += 1;

        let backlog = self.backlog(now);
        if backlog > BACKLOG_WARN_SECS && !self.warned_backlog {
            tracing::warn!(backlog_secs = backlog, "Inbound audio is outrunning playback");
            self.warned_backlog = true;
        } else if backlog <= BACKLOG_WARN_SECS {
            self.warned_backlog = false;
        }
        Some(item)
    }

    /// Seconds of audio scheduled beyond `now`.
    #[must_use]
    pub fn backlog(&self, now: f64) -> f64 {
        (self.next_start - now).max(0.0)
    }

    /// Forget queued audio so the next buffer starts immediately.
    pub const fn reset(&mut self) {
        self.next_start = 0.0;
        self.warned_backlog = false;
    }
}

/// Scheduled items waiting for an output device, read one sample at a time
/// against the device clock.
#[derive(Debug, Default)]
pub struct PlayoutBuffer {
    items: VecDeque<PlaybackItem>,
}

impl PlayoutBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert keeping items ordered by start time.
    pub fn push(&mut self, item: PlaybackItem) {
        let at = self.items.partition_point(|queued| queued.start <= item.start);
        self.items.insert(at, item);
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The sample due at `clock` seconds, or silence. Items that have finished
    /// by `clock` are dropped, so `clock` must not go backwards.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn sample_at(&mut self, clock: f64) -> f32 {
        while let Some(item) = self.items.front() {
            if clock < item.start {
                return 0.0;
            }
            let index = ((clock - item.start) * f64::from(item.sample_rate)) as usize;
            if let Some(sample) = item.samples.get(index) {
                return *sample;
            }
            self.items.pop_front();
        }
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(seq: u64, start: f64, samples: Vec<f32>) -> PlaybackItem {
        #[allow(clippy::cast_precision_loss)]
        let duration = samples.len() as f64 / 10.0;
        PlaybackItem { seq, start, duration, sample_rate: 10, samples }
    }

    fn pcm(samples: usize) -> Vec<u8> {
        vec![0u8; samples * 2]
    }

    #[test]
    fn late_arrival_starts_at_now() {
        let mut scheduler = PlaybackScheduler::new(1000);
        let first = scheduler.schedule(&pcm(500), 0.0).unwrap();
        assert!((first.start - 0.0).abs() < 1e-9);
        assert!((scheduler.next_start() - 0.5).abs() < 1e-9);

        let second = scheduler.schedule(&pcm(500), 2.0).unwrap();
        assert!((second.start - 2.0).abs() < 1e-9);
    }

    #[test]
    fn early_arrival_queues_behind_cursor() {
        let mut scheduler = PlaybackScheduler::new(1000);
        let first = scheduler.schedule(&pcm(1000), 1.0).unwrap();
        let second = scheduler.schedule(&pcm(250), 1.1).unwrap();
        assert!((second.start - first.end()).abs() < 1e-9);
        assert!((scheduler.backlog(1.1) - 1.15).abs() < 1e-9);
    }

    #[test]
    fn reset_drops_queued_time_and_empty_chunks_are_ignored() {
        let mut scheduler = PlaybackScheduler::new(1000);
        scheduler.schedule(&pcm(5000), 0.0);
        scheduler.reset();
        let item = scheduler.schedule(&pcm(10), 0.2).unwrap();
        assert!((item.start - 0.2).abs() < 1e-9);
        assert!(scheduler.schedule(&[7], 0.3).is_none());
        assert_eq!(item.seq, 1);
    }

    #[test]
    fn playout_reads_items_in_start_order_with_silence_between() {
        let mut buffer = PlayoutBuffer::new();
        buffer.push(item(1, 1.0, vec![0.5, 0.6]));
        buffer.push(item(0, 0.0, vec![0.1, 0.2]));

        assert!((buffer.sample_at(0.0) - 0.1).abs() < f32::EPSILON);
        assert!((buffer.sample_at(0.15) - 0.2).abs() < f32::EPSILON);
        assert!(buffer.sample_at(0.5).abs() < f32::EPSILON);
        assert_eq!(buffer.len(), 1, "the finished item is dropped");
        assert!((buffer.sample_at(1.1) - 0.6).abs() < f32::EPSILON);
        assert!(buffer.sample_at(1.3).abs() < f32::EPSILON);
        assert!(buffer.is_empty());
    }

    #[test]
    fn cleared_playout_is_silent() {
        let mut buffer = PlayoutBuffer::new();
        buffer.push(item(0, 0.0, vec![0.9; 10]));
        buffer.clear();
        assert!(buffer.sample_at(0.1).abs() < f32::EPSILON);
    }
}
