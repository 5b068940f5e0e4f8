//! # Gapless Playback Scheduler
//!
//! Turns a stream of independently decoded chunks into one continuous
//! utterance on the output clock.
//!
//! ## Scheduling Algorithm:
//! The scheduler keeps a single forward-only `next_free_slot` on the output
//! clock. For each dequeued chunk:
//! 1. If the slot is behind `clock + safety_margin`, playback has starved (or
//!    this is the first chunk), so the slot jumps to `clock + safety_margin`
//! 2. Otherwise the chunk starts exactly at the slot, back to back with the
//!    previous one
//! 3. The slot advances by the chunk's duration
//!
//! When the slot runs more than `max_lookahead` ahead of the clock, scheduling
//! pauses. Output devices do not report "buffer getting low", so a timer
//! re-checks the clock every `resume_poll`.
//!
//! ## Start Policies:
//! - **Immediate**: the first chunk is scheduled as soon as it arrives
//! - **Prebuffered**: wait for the preset's chunk target or its timeout,
//!   whichever comes first, then schedule everything queued at once
//!
//! ## Time:
//! Two clocks are involved. Decisions about *where* a chunk lands use the
//! output clock (`AudioOutput::current_time`). Timers (pre-buffer deadline,
//! resume poll, drain check) are `Instant`s passed in by the caller, which
//! keeps the scheduler free of I/O and fully deterministic under test.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::audio::chunk::AudioChunk;
use crate::audio::output::AudioOutput;
use crate::audio::processor::AudioProcessor;
use crate::config::{AudioConfig, PlaybackPolicy};
use crate::error::{EngineError, EngineResult, TimeoutKind};

/// Scheduler tuning, derived once from [`AudioConfig`].
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub sample_rate: u32,
    pub policy: PlaybackPolicy,
    pub prebuffer_chunks: usize,
    pub prebuffer_timeout: Duration,
    /// `None` disables crossfading
    pub crossfade_ms: Option<f64>,
    /// Seconds
    pub max_lookahead: f64,
    /// Seconds
    pub safety_margin: f64,
    pub resume_poll: Duration,
}

impl From<&AudioConfig> for SchedulerSettings {
    fn from(config: &AudioConfig) -> Self {
        Self {
            sample_rate: config.output_sample_rate,
            policy: config.playback_policy,
            prebuffer_chunks: config.quality.prebuffer_chunks(),
            prebuffer_timeout: config.quality.prebuffer_timeout(),
            crossfade_ms: config.crossfade.then(|| config.quality.crossfade_ms()),
            max_lookahead: config.max_lookahead_ms as f64 / 1000.0,
            safety_margin: config.safety_margin_ms as f64 / 1000.0,
            resume_poll: Duration::from_millis(config.resume_poll_ms),
        }
    }
}

/// Something the session should know about.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// First chunk of an utterance was scheduled
    PlaybackStarted { start_at: f64 },
    /// Pre-buffer target was not reached in time; playback started anyway
    PrebufferTimedOut { queued: usize },
    /// Queue drained, nothing left playing, end of stream signalled
    PlaybackComplete,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub chunks_scheduled: u64,
    pub chunks_dropped: u64,
    pub underruns: u64,
    pub prebuffer_timeouts: u64,
}

pub struct PlaybackScheduler {
    settings: SchedulerSettings,
    processor: AudioProcessor,
    queue: VecDeque<AudioChunk>,
    next_free_slot: f64,
    /// End time of the last scheduled chunk; 0.0 when nothing was scheduled
    active_until: f64,
    /// Pre-buffer gate released for the current utterance
    started: bool,
    end_of_stream: bool,
    completed: bool,
    prebuffer_deadline: Option<Instant>,
    resume_at: Option<Instant>,
    drain_check_at: Option<Instant>,
    last_chunk_at: Option<Instant>,
    stats: SchedulerStats,
}

impl PlaybackScheduler {
    pub fn new(settings: SchedulerSettings) -> Self {
        let processor = AudioProcessor::new(settings.sample_rate, settings.crossfade_ms);
        Self {
            settings,
            processor,
            queue: VecDeque::new(),
            next_free_slot: 0.0,
            active_until: 0.0,
            started: false,
            end_of_stream: false,
            completed: false,
            prebuffer_deadline: None,
            resume_at: None,
            drain_check_at: None,
            last_chunk_at: None,
            stats: SchedulerStats::default(),
        }
    }

    /// Accept a decoded chunk and schedule whatever the policy allows.
    ///
    /// A chunk arriving after the previous utterance completed starts a new
    /// utterance (and a new pre-buffer wait).
    pub fn enqueue(
        &mut self,
        chunk: AudioChunk,
        now: Instant,
        output: &mut dyn AudioOutput,
    ) -> EngineResult<Vec<SchedulerEvent>> {
        if self.completed {
            debug!("new utterance after completed playback");
            self.completed = false;
            self.end_of_stream = false;
            self.started = false;
        }

        self.last_chunk_at = Some(now);
        let is_final = chunk.is_final;
        if !chunk.is_empty() {
            self.queue.push_back(chunk);
        }
        if is_final {
            self.end_of_stream = true;
        }

        self.pump(now, output)
    }

    /// No more chunks will arrive for the current utterance.
    pub fn signal_end_of_stream(
        &mut self,
        now: Instant,
        output: &mut dyn AudioOutput,
    ) -> EngineResult<Vec<SchedulerEvent>> {
        self.end_of_stream = true;
        self.pump(now, output)
    }

    /// Fire whichever timers are due.
    pub fn on_tick(&mut self, now: Instant, output: &mut dyn AudioOutput) -> EngineResult<Vec<SchedulerEvent>> {
        let mut events = Vec::new();

        if let Some(deadline) = self.prebuffer_deadline {
            if now >= deadline && !self.started {
                self.stats.prebuffer_timeouts += 1;
                warn!(
                    queued = self.queue.len(),
                    target = self.settings.prebuffer_chunks,
                    "{}, starting playback with what is queued",
                    EngineError::Timeout(TimeoutKind::Prebuffer)
                );
                self.release_gate();
                events.push(SchedulerEvent::PrebufferTimedOut {
                    queued: self.queue.len(),
                });
            }
        }

        if self.resume_at.is_some_and(|at| now >= at) {
            self.resume_at = None;
        }
        if self.drain_check_at.is_some_and(|at| now >= at) {
            self.drain_check_at = None;
        }

        events.extend(self.pump(now, output)?);
        Ok(events)
    }

    /// Earliest instant at which `on_tick` has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        [self.prebuffer_deadline, self.resume_at, self.drain_check_at]
            .into_iter()
            .flatten()
            .min()
    }

    /// Drop everything queued and forget the schedule (barge-in).
    ///
    /// Returns the number of queued chunks that were discarded. Buffers already
    /// handed to the output are the caller's to fade or stop.
    pub fn clear(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        self.next_free_slot = 0.0;
        self.active_until = 0.0;
        self.started = false;
        self.end_of_stream = false;
        self.completed = false;
        self.prebuffer_deadline = None;
        self.resume_at = None;
        self.drain_check_at = None;
        self.stats.chunks_dropped += dropped as u64;
        if dropped > 0 {
            info!(dropped, "playback queue cleared");
        }
        dropped
    }

    /// Count a chunk discarded before it reached the queue.
    pub fn record_dropped(&mut self) {
        self.stats.chunks_dropped += 1;
    }

    /// Audio is audible right now.
    pub fn is_playing(&self, clock: f64) -> bool {
        self.active_until > clock
    }

    /// Audio is audible or waiting to be scheduled.
    pub fn is_active(&self, clock: f64) -> bool {
        !self.queue.is_empty() || self.is_playing(clock)
    }

    /// A chunk arrived within `window` of `now`.
    pub fn received_within(&self, now: Instant, window: Duration) -> bool {
        self.last_chunk_at
            .is_some_and(|at| now.saturating_duration_since(at) <= window)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn next_free_slot(&self) -> f64 {
        self.next_free_slot
    }

    pub fn is_paused(&self) -> bool {
        self.resume_at.is_some()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    fn release_gate(&mut self) {
        self.started = true;
        self.prebuffer_deadline = None;
    }

    fn gate_open(&mut self, now: Instant) -> bool {
        if self.started {
            return true;
        }
        let ready = match self.settings.policy {
            PlaybackPolicy::Immediate => !self.queue.is_empty(),
            PlaybackPolicy::Prebuffered => {
                self.queue.len() >= self.settings.prebuffer_chunks
                    || (self.end_of_stream && !self.queue.is_empty())
            }
        };
        if ready {
            self.release_gate();
            return true;
        }
        if !self.queue.is_empty() && self.prebuffer_deadline.is_none() {
            self.prebuffer_deadline = Some(now + self.settings.prebuffer_timeout);
            debug!(
                target_chunks = self.settings.prebuffer_chunks,
                timeout_ms = self.settings.prebuffer_timeout.as_millis() as u64,
                "pre-buffering"
            );
        }
        false
    }

    fn pump(&mut self, now: Instant, output: &mut dyn AudioOutput) -> EngineResult<Vec<SchedulerEvent>> {
        let mut events = Vec::new();

        if self.gate_open(now) && self.resume_at.is_none() {
            while !self.queue.is_empty() {
                let clock = output.current_time();
                if self.next_free_slot - clock > self.settings.max_lookahead {
                    debug!(
                        ahead_s = self.next_free_slot - clock,
                        queued = self.queue.len(),
                        "lookahead reached, pausing scheduling"
                    );
                    self.resume_at = Some(now + self.settings.resume_poll);
                    break;
                }
                let Some(chunk) = self.queue.pop_front() else {
                    break;
                };
                if let Some(event) = self.schedule_chunk(chunk, clock, output)? {
                    events.push(event);
                }
            }
        }

        if let Some(event) = self.check_complete(now, output.current_time()) {
            events.push(event);
        }
        Ok(events)
    }

    fn schedule_chunk(
        &mut self,
        mut chunk: AudioChunk,
        clock: f64,
        output: &mut dyn AudioOutput,
    ) -> EngineResult<Option<SchedulerEvent>> {
        let earliest = clock + self.settings.safety_margin;
        let first_of_utterance = self.active_until <= 0.0;

        let start_at = if self.next_free_slot < earliest {
            if !first_of_utterance && self.next_free_slot < clock {
                self.stats.underruns += 1;
                warn!(
                    behind_ms = ((clock - self.next_free_slot) * 1000.0) as u64,
                    "playback underrun, rescheduling from the output clock"
                );
            }
            earliest
        } else {
            self.next_free_slot
        };

        let duration = chunk.duration_secs();
        self.processor.apply_crossfade(&mut chunk.samples);
        output.schedule(chunk.samples, chunk.sample_rate, start_at)?;

        self.next_free_slot = start_at + duration;
        self.active_until = self.next_free_slot;
        self.stats.chunks_scheduled += 1;

        Ok(first_of_utterance.then_some(SchedulerEvent::PlaybackStarted { start_at }))
    }

    fn check_complete(&mut self, now: Instant, clock: f64) -> Option<SchedulerEvent> {
        if self.completed || !self.end_of_stream || !self.queue.is_empty() {
            return None;
        }
        if self.active_until > clock {
            // Still audible; look again once the last chunk has played out
            let remaining = Duration::from_secs_f64(self.active_until - clock);
            self.drain_check_at = Some(now + remaining);
            return None;
        }

        self.completed = true;
        self.active_until = 0.0;
        self.drain_check_at = None;
        info!(chunks = self.stats.chunks_scheduled, "playback complete");
        Some(SchedulerEvent::PlaybackComplete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::output::{VirtualOutput, VirtualOutputHandle};
    use crate::config::QualityPreset;

    const RATE: u32 = 24_000;

    fn settings(policy: PlaybackPolicy) -> SchedulerSettings {
        let config = AudioConfig {
            playback_policy: policy,
            quality: QualityPreset::Balanced,
            ..AudioConfig::default()
        };
        SchedulerSettings::from(&config)
    }

    fn chunk(seconds: f64) -> AudioChunk {
        AudioChunk {
            samples: vec![0.25; (seconds * RATE as f64).round() as usize],
            sample_rate: RATE,
            seq: None,
            is_final: false,
        }
    }

    fn setup(policy: PlaybackPolicy) -> (PlaybackScheduler, VirtualOutput, VirtualOutputHandle) {
        let (output, handle) = VirtualOutput::manual();
        (PlaybackScheduler::new(settings(policy)), output, handle)
    }

    #[test]
    fn test_back_to_back_chunks_are_exactly_d1_apart() {
        let (mut scheduler, mut output, handle) = setup(PlaybackPolicy::Immediate);
        let now = Instant::now();

        let events = scheduler.enqueue(chunk(0.1), now, &mut output).unwrap();
        assert!(matches!(events[0], SchedulerEvent::PlaybackStarted { .. }));
        scheduler.enqueue(chunk(0.05), now, &mut output).unwrap();

        let scheduled = handle.scheduled();
        assert_eq!(scheduled.len(), 2);
        assert!((scheduled[0].start_at - 0.02).abs() < 1e-9);
        assert!((scheduled[1].start_at - scheduled[0].start_at - 0.1).abs() < 1e-9);
        assert!(scheduled[1].start_at >= scheduled[0].end_at() - 1e-9);
    }

    #[test]
    fn test_behind_schedule_resets_to_clock_plus_margin() {
        let (mut scheduler, mut output, handle) = setup(PlaybackPolicy::Immediate);
        let now = Instant::now();

        scheduler.enqueue(chunk(0.1), now, &mut output).unwrap();
        handle.advance(0.5);
        scheduler.enqueue(chunk(0.1), now, &mut output).unwrap();

        let scheduled = handle.scheduled();
        assert!((scheduled[1].start_at - 0.52).abs() < 1e-9);
        assert_eq!(scheduler.stats().underruns, 1);
    }

    #[test]
    fn test_lookahead_pauses_then_resumes_on_timer() {
        let (mut scheduler, mut output, handle) = setup(PlaybackPolicy::Immediate);
        let now = Instant::now();

        for _ in 0..6 {
            scheduler.enqueue(chunk(1.0), now, &mut output).unwrap();
        }
        assert_eq!(handle.scheduled().len(), 3);
        assert!(scheduler.is_paused());
        assert_eq!(scheduler.queued(), 3);

        let deadline = scheduler.next_deadline().unwrap();
        handle.advance(1.5);
        scheduler.on_tick(deadline, &mut output).unwrap();
        assert_eq!(handle.scheduled().len(), 5);
    }

    #[test]
    fn test_prebuffer_waits_for_target() {
        let (mut scheduler, mut output, handle) = setup(PlaybackPolicy::Prebuffered);
        let now = Instant::now();

        scheduler.enqueue(chunk(0.1), now, &mut output).unwrap();
        assert!(handle.scheduled().is_empty());
        assert!(scheduler.next_deadline().is_some());

        scheduler.enqueue(chunk(0.1), now, &mut output).unwrap();
        assert_eq!(handle.scheduled().len(), 2);
        assert!(scheduler.next_deadline().is_none());
    }

    #[test]
    fn test_prebuffer_timeout_starts_playback() {
        let (mut scheduler, mut output, handle) = setup(PlaybackPolicy::Prebuffered);
        let now = Instant::now();

        scheduler.enqueue(chunk(0.1), now, &mut output).unwrap();
        let events = scheduler
            .on_tick(now + Duration::from_millis(120), &mut output)
            .unwrap();

        assert!(events.contains(&SchedulerEvent::PrebufferTimedOut { queued: 1 }));
        assert_eq!(handle.scheduled().len(), 1);
        assert_eq!(scheduler.stats().prebuffer_timeouts, 1);
    }

    #[test]
    fn test_completion_fires_exactly_once() {
        let (mut scheduler, mut output, handle) = setup(PlaybackPolicy::Immediate);
        let now = Instant::now();

        let mut last = chunk(0.1);
        last.is_final = true;
        scheduler.enqueue(chunk(0.1), now, &mut output).unwrap();
        let events = scheduler.enqueue(last, now, &mut output).unwrap();
        assert!(!events.contains(&SchedulerEvent::PlaybackComplete));
        assert!(scheduler.next_deadline().is_some());

        handle.advance(0.3);
        let events = scheduler.on_tick(now + Duration::from_millis(300), &mut output).unwrap();
        assert_eq!(events, vec![SchedulerEvent::PlaybackComplete]);

        let events = scheduler.on_tick(now + Duration::from_millis(400), &mut output).unwrap();
        assert!(events.is_empty());
        assert!(scheduler.next_deadline().is_none());
    }

    #[test]
    fn test_new_chunk_after_completion_starts_new_utterance() {
        let (mut scheduler, mut output, handle) = setup(PlaybackPolicy::Immediate);
        let now = Instant::now();

        scheduler.enqueue(chunk(0.1), now, &mut output).unwrap();
        handle.advance(0.2);
        let events = scheduler.signal_end_of_stream(now, &mut output).unwrap();
        assert_eq!(events, vec![SchedulerEvent::PlaybackComplete]);

        let events = scheduler.enqueue(chunk(0.1), now, &mut output).unwrap();
        assert!(matches!(events[0], SchedulerEvent::PlaybackStarted { .. }));
        assert_eq!(scheduler.stats().underruns, 0);
    }

    #[test]
    fn test_clear_drops_queue_and_resets_slot() {
        let (mut scheduler, mut output, handle) = setup(PlaybackPolicy::Immediate);
        let now = Instant::now();

        for _ in 0..6 {
            scheduler.enqueue(chunk(1.0), now, &mut output).unwrap();
        }
        assert_eq!(scheduler.clear(), 3);
        assert_eq!(scheduler.queued(), 0);
        assert_eq!(scheduler.next_free_slot(), 0.0);
        assert!(!scheduler.is_active(handle.now()));
        assert!(scheduler.next_deadline().is_none());

        // Nothing from the cleared stream reaches the output afterwards
        scheduler.on_tick(now + Duration::from_secs(5), &mut output).unwrap();
        assert_eq!(handle.scheduled().len(), 3);
    }

    #[test]
    fn test_recent_audio_window() {
        let (mut scheduler, mut output, _handle) = setup(PlaybackPolicy::Immediate);
        let now = Instant::now();
        assert!(!scheduler.received_within(now, Duration::from_secs(3)));

        scheduler.enqueue(chunk(0.1), now, &mut output).unwrap();
        assert!(scheduler.received_within(now + Duration::from_secs(2), Duration::from_secs(3)));
        assert!(!scheduler.received_within(now + Duration::from_secs(4), Duration::from_secs(3)));
    }
}
