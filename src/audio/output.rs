//! # Audio Output Boundary
//!
//! The scheduler never talks to a sound card directly. It talks to an
//! [`AudioOutput`]: something with a monotonic clock that can start a sample
//! buffer at an absolute time on that clock.
//!
//! ## Clock:
//! `current_time()` is in seconds and only ever moves forward. Start times
//! passed to `schedule()` are on the same clock; a start time in the past is a
//! scheduler bug, not something the sink has to handle gracefully.
//!
//! ## Implementations:
//! - [`VirtualOutput`]: records what would have been played, driven either by
//!   a manual clock (tests) or by wall time (headless runs)

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// A low-latency sink that plays buffers at absolute clock times.
pub trait AudioOutput: Send {
    /// Current output clock in seconds.
    fn current_time(&self) -> f64;

    /// Start `samples` at `start_at` seconds on the output clock.
    fn schedule(&mut self, samples: Vec<f32>, sample_rate: u32, start_at: f64) -> EngineResult<()>;

    /// Ramp the master gain to silence over `duration`, then cut everything scheduled.
    fn fade_out(&mut self, duration: Duration);

    /// Stop every scheduled buffer immediately.
    fn stop_all(&mut self);

    /// Release the device. Further calls are errors.
    fn close(&mut self) -> EngineResult<()>;
}

/// One buffer handed to a [`VirtualOutput`].
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledBuffer {
    pub start_at: f64,
    pub duration: f64,
    pub sample_count: usize,
    pub sample_rate: u32,
    /// Set when a fade or stop cut this buffer short
    pub cut: bool,
}

impl ScheduledBuffer {
    pub fn end_at(&self) -> f64 {
        self.start_at + self.duration
    }
}

#[derive(Debug)]
enum Clock {
    Manual(f64),
    Wall(Instant),
}

#[derive(Debug)]
struct VirtualState {
    clock: Clock,
    scheduled: Vec<ScheduledBuffer>,
    fades: Vec<Duration>,
    stops: usize,
    closed: bool,
}

impl VirtualState {
    fn now(&self) -> f64 {
        match self.clock {
            Clock::Manual(t) => t,
            Clock::Wall(origin) => origin.elapsed().as_secs_f64(),
        }
    }

    fn cut_pending(&mut self) {
        let now = self.now();
        for buffer in self.scheduled.iter_mut().filter(|b| b.end_at() > now) {
            buffer.cut = true;
        }
    }
}

fn lock(state: &Mutex<VirtualState>) -> MutexGuard<'_, VirtualState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Output sink that plays nothing and remembers everything.
#[derive(Debug)]
pub struct VirtualOutput {
    state: Arc<Mutex<VirtualState>>,
}

/// Inspection and clock control for a [`VirtualOutput`] owned elsewhere.
#[derive(Debug, Clone)]
pub struct VirtualOutputHandle {
    state: Arc<Mutex<VirtualState>>,
}

impl VirtualOutput {
    /// Output whose clock only moves when the handle advances it.
    pub fn manual() -> (Self, VirtualOutputHandle) {
        Self::with_clock(Clock::Manual(0.0))
    }

    /// Output whose clock follows wall time from construction.
    pub fn wall_clock() -> (Self, VirtualOutputHandle) {
        Self::with_clock(Clock::Wall(Instant::now()))
    }

    fn with_clock(clock: Clock) -> (Self, VirtualOutputHandle) {
        let state = Arc::new(Mutex::new(VirtualState {
            clock,
            scheduled: Vec::new(),
            fades: Vec::new(),
            stops: 0,
            closed: false,
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            VirtualOutputHandle { state },
        )
    }
}

impl AudioOutput for VirtualOutput {
    fn current_time(&self) -> f64 {
        lock(&self.state).now()
    }

    fn schedule(&mut self, samples: Vec<f32>, sample_rate: u32, start_at: f64) -> EngineResult<()> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "audio output is closed",
            )));
        }
        let duration = if sample_rate == 0 {
            0.0
        } else {
            samples.len() as f64 / sample_rate as f64
        };
        state.scheduled.push(ScheduledBuffer {
            start_at,
            duration,
            sample_count: samples.len(),
            sample_rate,
            cut: false,
        });
        Ok(())
    }

    fn fade_out(&mut self, duration: Duration) {
        let mut state = lock(&self.state);
        debug!(fade_ms = duration.as_millis() as u64, "virtual output fade");
        state.fades.push(duration);
        state.cut_pending();
    }

    fn stop_all(&mut self) {
        let mut state = lock(&self.state);
        state.stops += 1;
        state.cut_pending();
    }

    fn close(&mut self) -> EngineResult<()> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "audio output already closed",
            )));
        }
        state.closed = true;
        Ok(())
    }
}

impl VirtualOutputHandle {
    /// Move a manual clock forward. No effect on a wall clock.
    pub fn advance(&self, seconds: f64) {
        let mut state = lock(&self.state);
        if let Clock::Manual(t) = state.clock {
            state.clock = Clock::Manual(t + seconds);
        }
    }

    pub fn now(&self) -> f64 {
        lock(&self.state).now()
    }

    pub fn scheduled(&self) -> Vec<ScheduledBuffer> {
        lock(&self.state).scheduled.clone()
    }

    pub fn fades(&self) -> Vec<Duration> {
        lock(&self.state).fades.clone()
    }

    pub fn stop_count(&self) -> usize {
        lock(&self.state).stops
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_and_schedule_log() {
        let (mut output, handle) = VirtualOutput::manual();
        assert_eq!(output.current_time(), 0.0);

        output.schedule(vec![0.0; 2_400], 24_000, 0.02).unwrap();
        handle.advance(0.05);
        assert!((output.current_time() - 0.05).abs() < 1e-12);

        let scheduled = handle.scheduled();
        assert_eq!(scheduled.len(), 1);
        assert!((scheduled[0].duration - 0.1).abs() < 1e-12);
        assert!((scheduled[0].end_at() - 0.12).abs() < 1e-12);
    }

    #[test]
    fn test_fade_cuts_pending_buffers() {
        let (mut output, handle) = VirtualOutput::manual();
        output.schedule(vec![0.0; 240], 24_000, 0.0).unwrap();
        output.schedule(vec![0.0; 24_000], 24_000, 0.01).unwrap();
        handle.advance(0.5);

        output.fade_out(Duration::from_millis(30));
        let scheduled = handle.scheduled();
        assert!(!scheduled[0].cut);
        assert!(scheduled[1].cut);
        assert_eq!(handle.fades(), vec![Duration::from_millis(30)]);
    }

    #[test]
    fn test_closed_output_rejects_work() {
        let (mut output, handle) = VirtualOutput::manual();
        output.close().unwrap();
        assert!(handle.is_closed());
        assert!(output.schedule(vec![0.0; 10], 24_000, 0.0).is_err());
        assert!(output.close().is_err());
    }
}
