//! Gap-free playback scheduling on the device clock.
//!
//! Each inbound frame is placed at `max(now, cursor)` where the cursor is the
//! end of the previous entry, so buffers play back-to-back in arrival order
//! even when they arrive faster than real time. When the queue drains, the
//! cursor snaps back to the clock so silence does not accumulate as drift.

use crate::audio::codec::AudioFrame;
use crate::audio::device::PlaybackToken;
use std::collections::VecDeque;

/// One frame bound to its time window on the render clock
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackEntry {
    pub token: PlaybackToken,
    pub start_time: f64,
    pub duration: f64,
}

impl PlaybackEntry {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

/// Result of a buffer finishing playback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Other entries are still queued
    Pending,
    /// The queue is now empty
    Drained,
    /// The token was not queued (already stopped or never scheduled)
    Unknown,
}

#[derive(Debug, Default)]
pub struct PlaybackScheduler {
    entries: VecDeque<PlaybackEntry>,
    cursor: f64,
    next_token: PlaybackToken,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `frame` after everything already scheduled
    pub fn schedule(&mut self, frame: &AudioFrame, now: f64) -> PlaybackEntry {
        let start_time = if self.cursor > now { self.cursor } else { now };
        let entry = PlaybackEntry {
            token: self.next_token,
            start_time,
            duration: frame.duration(),
        };
        self.next_token += 1;
        self.cursor = entry.end_time();
        self.entries.push_back(entry);
        entry
    }

    /// Move an entry to the start the device actually gave it. A later start
    /// pushes the cursor out so the next frame follows it without overlap.
    pub fn reanchor(&mut self, token: PlaybackToken, start_time: f64) {
        let Some(entry) = self.entries.iter_mut().find(|e| e.token == token) else {
            return;
        };
        if start_time > entry.start_time {
            entry.start_time = start_time;
            self.cursor = self.cursor.max(entry.end_time());
        }
    }

    /// Remove a buffer that finished playing naturally
    pub fn complete(&mut self, token: PlaybackToken, now: f64) -> Completion {
        let Some(pos) = self.entries.iter().position(|e| e.token == token) else {
            return Completion::Unknown;
        };
        self.entries.remove(pos);

        if self.entries.is_empty() {
            self.cursor = now;
            Completion::Drained
        } else {
            Completion::Pending
        }
    }

    /// Drop every queued entry, returning the tokens so the device can stop them
    pub fn stop_all(&mut self) -> Vec<PlaybackToken> {
        self.entries.drain(..).map(|e| e.token).collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &PlaybackEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// End time of the last scheduled entry
    pub fn cursor(&self) -> f64 {
        self.cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(samples: usize) -> AudioFrame {
        AudioFrame::new(vec![0.0; samples], 24000)
    }

    #[test]
    fn test_first_entry_starts_at_clock() {
        let mut scheduler = PlaybackScheduler::new();
        let entry = scheduler.schedule(&frame(320), 1.5);
        assert_eq!(entry.start_time, 1.5);
        assert!((entry.duration - 320.0 / 24000.0).abs() < 1e-12);
    }

    #[test]
    fn test_burst_is_contiguous() {
        let mut scheduler = PlaybackScheduler::new();
        let sizes = [480, 960, 240, 2400, 120];
        let entries: Vec<_> = sizes
            .iter()
            .map(|&n| scheduler.schedule(&frame(n), 0.25))
            .collect();

        for pair in entries.windows(2) {
            assert!(pair[1].start_time >= pair[0].start_time);
            assert!((pair[1].start_time - pair[0].end_time()).abs() < 1e-9);
        }
        assert_eq!(scheduler.len(), sizes.len());
    }

    #[test]
    fn test_late_arrival_starts_at_clock() {
        let mut scheduler = PlaybackScheduler::new();
        let first = scheduler.schedule(&frame(240), 0.0);
        let second = scheduler.schedule(&frame(240), 5.0);
        assert_eq!(second.start_time, 5.0);
        assert!(second.start_time >= first.end_time());
    }

    #[test]
    fn test_drain_resets_cursor() {
        let mut scheduler = PlaybackScheduler::new();
        let a = scheduler.schedule(&frame(2400), 0.0);
        let b = scheduler.schedule(&frame(2400), 0.0);

        assert_eq!(scheduler.complete(a.token, 0.1), Completion::Pending);
        assert_eq!(scheduler.complete(b.token, 0.2), Completion::Drained);
        assert_eq!(scheduler.cursor(), 0.2);
        assert!(scheduler.is_empty());

        let next = scheduler.schedule(&frame(240), 0.3);
        assert_eq!(next.start_time, 0.3);
    }

    #[test]
    fn test_reanchor_pushes_cursor() {
        let mut scheduler = PlaybackScheduler::new();
        let a = scheduler.schedule(&frame(2400), 1.0);
        scheduler.reanchor(a.token, 1.02);
        assert!((scheduler.cursor() - 1.12).abs() < 1e-9);

        let b = scheduler.schedule(&frame(240), 1.0);
        assert!((b.start_time - 1.12).abs() < 1e-9);

        // An earlier start never pulls the cursor back
        scheduler.reanchor(b.token, 0.5);
        assert!((scheduler.cursor() - 1.13).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_and_stopped_tokens() {
        let mut scheduler = PlaybackScheduler::new();
        let a = scheduler.schedule(&frame(240), 0.0);
        let b = scheduler.schedule(&frame(240), 0.0);

        assert_eq!(scheduler.stop_all(), vec![a.token, b.token]);
        assert_eq!(scheduler.complete(a.token, 1.0), Completion::Unknown);
        assert_eq!(scheduler.complete(99, 1.0), Completion::Unknown);
    }

    #[test]
    fn test_tokens_are_unique() {
        let mut scheduler = PlaybackScheduler::new();
        let a = scheduler.schedule(&frame(1), 0.0);
        scheduler.complete(a.token, 0.0);
        let b = scheduler.schedule(&frame(1), 0.0);
        assert_ne!(a.token, b.token);
    }
}
