//! # Barge-In Controller
//!
//! Decides whether a "the user started talking" signal should interrupt the
//! assistant, and tracks the short-lived state an interruption leaves behind.
//!
//! ## Triggers:
//! - **ServerVad**: `input_audio_buffer.speech_started` from the backend
//! - **ServerPhase**: `speaking → listening` with reason `barge_in`
//! - **LocalVad**: the host's own voice-activity detector (instant barge-in)
//! - **Explicit**: the caller pressed "stop"
//!
//! ## Interruption Sequence (carried out by the session engine):
//! 1. Fade the output over `fade_ms`
//! 2. Clear the playback queue and reset the schedule
//! 3. Raise the drop-incoming-audio flag
//! 4. Send `barge_in` to the backend
//! 5. Lower the flag when the next response stream begins
//!
//! ## Recent-Audio Fallback:
//! Backend phase reports can lag. A local trigger is also accepted when a
//! chunk arrived within `recent_audio_window_ms`, even if the mirrored phase
//! is no longer `speaking`. This is a heuristic; every decision it makes is
//! logged so false positives can be traced.

use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::BargeInConfig;
use crate::session::status::PipelineState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BargeInSource {
    ServerVad,
    ServerPhase,
    LocalVad,
    Explicit,
}

impl BargeInSource {
    /// Reason string sent to the backend.
    pub fn as_str(&self) -> &'static str {
        match self {
            BargeInSource::ServerVad => "server_vad",
            BargeInSource::ServerPhase => "server_phase",
            BargeInSource::LocalVad => "local_vad",
            BargeInSource::Explicit => "explicit",
        }
    }
}

impl fmt::Display for BargeInSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a decision needs to know about the moment of the trigger.
#[derive(Debug, Clone, Copy)]
pub struct InterruptContext {
    pub source: BargeInSource,
    pub pipeline: PipelineState,
    /// A scheduled buffer is audible right now
    pub audio_playing: bool,
    /// Chunks are queued but not yet scheduled
    pub audio_queued: bool,
    /// A chunk arrived within the fallback window
    pub recent_audio: bool,
}

impl InterruptContext {
    fn has_output(&self) -> bool {
        self.audio_playing || self.audio_queued
    }
}

/// Higher-level discourse rule that can veto an interruption.
pub trait InterruptionPolicy: Send {
    fn allow(&self, ctx: &InterruptContext) -> bool;
}

/// Every eligible trigger interrupts.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysInterrupt;

impl InterruptionPolicy for AlwaysInterrupt {
    fn allow(&self, _ctx: &InterruptContext) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Local trigger while instant barge-in is off
    Disabled,
    /// Nothing is speaking or playing
    NothingToInterrupt,
    /// A previous trigger already silenced this response
    AlreadyInterrupted,
    PolicyBlocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BargeInDecision {
    /// Run the interruption sequence. `successful` is false for a misfire
    /// (no audio was actually playing).
    Interrupt { successful: bool },
    Ignored(IgnoreReason),
}

pub struct BargeInController {
    config: BargeInConfig,
    policy: Box<dyn InterruptionPolicy>,
    drop_incoming: bool,
    interrupted_at: Option<Instant>,
}

impl BargeInController {
    pub fn new(config: BargeInConfig, policy: Box<dyn InterruptionPolicy>) -> Self {
        Self {
            config,
            policy,
            drop_incoming: false,
            interrupted_at: None,
        }
    }

    /// Decide whether a trigger interrupts, and arm the drop flag if it does.
    pub fn evaluate(&mut self, ctx: InterruptContext, now: Instant) -> BargeInDecision {
        if ctx.source == BargeInSource::LocalVad && !self.config.instant {
            return BargeInDecision::Ignored(IgnoreReason::Disabled);
        }

        if self.drop_incoming && !ctx.has_output() {
            debug!(source = %ctx.source, "already interrupted, ignoring repeated trigger");
            return BargeInDecision::Ignored(IgnoreReason::AlreadyInterrupted);
        }

        if !self.eligible(&ctx) {
            debug!(source = %ctx.source, pipeline = %ctx.pipeline, "nothing to interrupt");
            return BargeInDecision::Ignored(IgnoreReason::NothingToInterrupt);
        }

        if !self.policy.allow(&ctx) {
            info!(source = %ctx.source, "interruption blocked by policy");
            return BargeInDecision::Ignored(IgnoreReason::PolicyBlocked);
        }

        self.drop_incoming = true;
        self.interrupted_at = Some(now);
        BargeInDecision::Interrupt {
            successful: ctx.audio_playing,
        }
    }

    fn eligible(&self, ctx: &InterruptContext) -> bool {
        match ctx.source {
            BargeInSource::Explicit | BargeInSource::ServerPhase => true,
            BargeInSource::ServerVad => ctx.pipeline == PipelineState::Speaking || ctx.has_output(),
            BargeInSource::LocalVad => {
                if ctx.pipeline == PipelineState::Speaking || ctx.has_output() {
                    return true;
                }
                if self.config.recent_audio_fallback && ctx.recent_audio {
                    info!(
                        pipeline = %ctx.pipeline,
                        window_ms = self.config.recent_audio_window_ms,
                        "accepting local barge-in on recent-audio fallback"
                    );
                    return true;
                }
                false
            }
        }
    }

    /// Audio for the cancelled response must be discarded.
    pub fn should_drop_audio(&self) -> bool {
        self.drop_incoming
    }

    /// A new response stream began; audio is welcome again.
    pub fn response_started(&mut self) {
        if self.drop_incoming {
            debug!("new response stream, accepting audio again");
        }
        self.drop_incoming = false;
    }

    pub fn interrupted_at(&self) -> Option<Instant> {
        self.interrupted_at
    }

    pub fn fade_duration(&self) -> Duration {
        self.config.fade_duration()
    }

    pub fn recent_audio_window(&self) -> Duration {
        Duration::from_millis(self.config.recent_audio_window_ms)
    }

    /// Forget interruption state (new connection).
    pub fn reset(&mut self) {
        self.drop_incoming = false;
        self.interrupted_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(config: BargeInConfig) -> BargeInController {
        BargeInController::new(config, Box::new(AlwaysInterrupt))
    }

    fn ctx(source: BargeInSource, pipeline: PipelineState, playing: bool) -> InterruptContext {
        InterruptContext {
            source,
            pipeline,
            audio_playing: playing,
            audio_queued: false,
            recent_audio: false,
        }
    }

    #[test]
    fn test_local_trigger_while_speaking_interrupts_once() {
        let mut barge_in = controller(BargeInConfig::default());
        let now = Instant::now();

        let first = barge_in.evaluate(ctx(BargeInSource::LocalVad, PipelineState::Speaking, true), now);
        assert_eq!(first, BargeInDecision::Interrupt { successful: true });
        assert!(barge_in.should_drop_audio());

        // Output is silent now; a second trigger for the same response is ignored
        let second = barge_in.evaluate(ctx(BargeInSource::LocalVad, PipelineState::Speaking, false), now);
        assert_eq!(second, BargeInDecision::Ignored(IgnoreReason::AlreadyInterrupted));

        barge_in.response_started();
        assert!(!barge_in.should_drop_audio());
    }

    #[test]
    fn test_local_trigger_respects_instant_flag() {
        let config = BargeInConfig {
            instant: false,
            ..BargeInConfig::default()
        };
        let mut barge_in = controller(config);
        let decision = barge_in.evaluate(
            ctx(BargeInSource::LocalVad, PipelineState::Speaking, true),
            Instant::now(),
        );
        assert_eq!(decision, BargeInDecision::Ignored(IgnoreReason::Disabled));
    }

    #[test]
    fn test_recent_audio_fallback() {
        let mut idle = ctx(BargeInSource::LocalVad, PipelineState::Listening, false);
        idle.recent_audio = true;

        let mut barge_in = controller(BargeInConfig::default());
        assert_eq!(
            barge_in.evaluate(idle, Instant::now()),
            BargeInDecision::Interrupt { successful: false }
        );

        let mut strict = controller(BargeInConfig {
            recent_audio_fallback: false,
            ..BargeInConfig::default()
        });
        assert_eq!(
            strict.evaluate(idle, Instant::now()),
            BargeInDecision::Ignored(IgnoreReason::NothingToInterrupt)
        );
    }

    #[test]
    fn test_explicit_without_audio_is_a_misfire() {
        let mut barge_in = controller(BargeInConfig::default());
        let decision = barge_in.evaluate(
            ctx(BargeInSource::Explicit, PipelineState::Listening, false),
            Instant::now(),
        );
        assert_eq!(decision, BargeInDecision::Interrupt { successful: false });
    }

    #[test]
    fn test_queued_but_silent_audio_is_a_misfire() {
        let mut queued = ctx(BargeInSource::ServerVad, PipelineState::Speaking, false);
        queued.audio_queued = true;

        let mut barge_in = controller(BargeInConfig::default());
        assert_eq!(
            barge_in.evaluate(queued, Instant::now()),
            BargeInDecision::Interrupt { successful: false }
        );
        assert!(barge_in.should_drop_audio());
    }

    #[test]
    fn test_policy_veto() {
        struct NeverInterrupt;
        impl InterruptionPolicy for NeverInterrupt {
            fn allow(&self, _ctx: &InterruptContext) -> bool {
                false
            }
        }

        let mut barge_in = BargeInController::new(BargeInConfig::default(), Box::new(NeverInterrupt));
        let decision = barge_in.evaluate(
            ctx(BargeInSource::ServerVad, PipelineState::Speaking, true),
            Instant::now(),
        );
        assert_eq!(decision, BargeInDecision::Ignored(IgnoreReason::PolicyBlocked));
        assert!(!barge_in.should_drop_audio());
    }
}
