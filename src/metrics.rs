//! # Session Metrics
//!
//! Latency and quality counters for one session, pushed to an injected
//! [`TelemetrySink`].
//!
//! ## What gets measured:
//! - **connection**: `connect()` → `session.ready`
//! - **stt**: end of user speech → final transcript
//! - **llm_first_token**: final transcript → first response delta
//! - **ttfa**: end of user speech → first playable audio chunk
//! - **heartbeat_rtt**: ping → pong
//! - **barge_in_mute**: barge-in trigger → server truncation acknowledgement
//!
//! Counters (reconnects, barge-ins, misfires, underruns, reorder drops) are
//! folded into a [`MetricsSnapshot`] on demand.
//!
//! ## Ownership:
//! The engine owns its [`SessionMetrics`] outright. Only the sink is shared,
//! as an `Arc<dyn TelemetrySink>` handed in at construction, so telemetry has
//! exactly the lifetime the host gives it.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::audio::scheduler::SchedulerStats;
use crate::protocol::reorder::ReorderStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LatencyKind {
    Connection,
    Stt,
    LlmFirstToken,
    TimeToFirstAudio,
    HeartbeatRtt,
    BargeInMute,
}

impl LatencyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LatencyKind::Connection => "connection",
            LatencyKind::Stt => "stt",
            LatencyKind::LlmFirstToken => "llm_first_token",
            LatencyKind::TimeToFirstAudio => "ttfa",
            LatencyKind::HeartbeatRtt => "heartbeat_rtt",
            LatencyKind::BargeInMute => "barge_in_mute",
        }
    }
}

impl fmt::Display for LatencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receiver for structured metric updates.
pub trait TelemetrySink: Send + Sync {
    fn latency(&self, kind: LatencyKind, value: Duration);

    fn counter(&self, name: &'static str, total: u64);

    fn snapshot(&self, snapshot: &MetricsSnapshot);
}

/// Sink that writes every update to the `tracing` log.
#[derive(Debug, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn latency(&self, kind: LatencyKind, value: Duration) {
        info!(metric = %kind, duration_ms = %value.as_millis(), "latency recorded");
    }

    fn counter(&self, name: &'static str, total: u64) {
        debug!(metric = name, total, "counter updated");
    }

    fn snapshot(&self, snapshot: &MetricsSnapshot) {
        info!(
            connection_ms = ?snapshot.connection_ms,
            stt_ms = ?snapshot.stt_ms,
            ttfa_ms = ?snapshot.ttfa_ms,
            reconnects = snapshot.reconnects,
            barge_ins = snapshot.barge_ins,
            underruns = snapshot.underruns,
            "session metrics"
        );
    }
}

/// Point-in-time copy of every metric, as handed to the presentation layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub connection_ms: Option<u64>,
    pub stt_ms: Option<u64>,
    pub llm_first_token_ms: Option<u64>,
    pub ttfa_ms: Option<u64>,
    pub heartbeat_rtt_ms: Option<u64>,
    pub barge_in_mute_ms: Option<u64>,
    pub reconnects: u64,
    pub barge_ins: u64,
    pub barge_in_misfires: u64,
    pub chunks_played: u64,
    pub chunks_dropped: u64,
    pub underruns: u64,
    pub prebuffer_timeouts: u64,
    pub messages_reordered: u64,
    pub messages_stale: u64,
    pub messages_overflowed: u64,
    pub sequence_gaps_skipped: u64,
}

fn millis(value: Option<Duration>) -> Option<u64> {
    value.map(|d| d.as_millis() as u64)
}

pub struct SessionMetrics {
    sink: Arc<dyn TelemetrySink>,
    connect_started_at: Option<Instant>,
    end_of_speech_at: Option<Instant>,
    transcript_final_at: Option<Instant>,
    awaiting_first_token: bool,
    awaiting_first_audio: bool,
    barge_in_at: Option<Instant>,

    connection: Option<Duration>,
    stt: Option<Duration>,
    llm_first_token: Option<Duration>,
    ttfa: Option<Duration>,
    heartbeat_rtt: Option<Duration>,
    barge_in_mute: Option<Duration>,

    reconnects: u64,
    barge_ins: u64,
    barge_in_misfires: u64,
}

impl SessionMetrics {
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            sink,
            connect_started_at: None,
            end_of_speech_at: None,
            transcript_final_at: None,
            awaiting_first_token: false,
            awaiting_first_audio: false,
            barge_in_at: None,
            connection: None,
            stt: None,
            llm_first_token: None,
            ttfa: None,
            heartbeat_rtt: None,
            barge_in_mute: None,
            reconnects: 0,
            barge_ins: 0,
            barge_in_misfires: 0,
        }
    }

    /// Start over for a new session. The sink is kept.
    pub fn reset(&mut self) {
        *self = Self::new(Arc::clone(&self.sink));
    }

    fn record(&mut self, kind: LatencyKind, value: Duration) {
        self.sink.latency(kind, value);
        let slot = match kind {
            LatencyKind::Connection => &mut self.connection,
            LatencyKind::Stt => &mut self.stt,
            LatencyKind::LlmFirstToken => &mut self.llm_first_token,
            LatencyKind::TimeToFirstAudio => &mut self.ttfa,
            LatencyKind::HeartbeatRtt => &mut self.heartbeat_rtt,
            LatencyKind::BargeInMute => &mut self.barge_in_mute,
        };
        *slot = Some(value);
    }

    pub fn connect_started(&mut self, now: Instant) {
        self.connect_started_at = Some(now);
    }

    pub fn session_ready(&mut self, now: Instant) {
        if let Some(started) = self.connect_started_at.take() {
            self.record(LatencyKind::Connection, now.saturating_duration_since(started));
        }
    }

    pub fn end_of_speech(&mut self, now: Instant) {
        self.end_of_speech_at = Some(now);
        self.awaiting_first_audio = true;
    }

    pub fn transcript_final(&mut self, now: Instant) {
        if let Some(eos) = self.end_of_speech_at {
            self.record(LatencyKind::Stt, now.saturating_duration_since(eos));
        }
        self.transcript_final_at = Some(now);
        self.awaiting_first_token = true;
    }

    pub fn response_delta(&mut self, now: Instant) {
        if !self.awaiting_first_token {
            return;
        }
        self.awaiting_first_token = false;
        if let Some(final_at) = self.transcript_final_at {
            self.record(LatencyKind::LlmFirstToken, now.saturating_duration_since(final_at));
        }
    }

    pub fn audio_received(&mut self, now: Instant) {
        if !self.awaiting_first_audio {
            return;
        }
        self.awaiting_first_audio = false;
        if let Some(eos) = self.end_of_speech_at {
            self.record(LatencyKind::TimeToFirstAudio, now.saturating_duration_since(eos));
        }
    }

    pub fn heartbeat_rtt(&mut self, rtt: Duration) {
        self.record(LatencyKind::HeartbeatRtt, rtt);
    }

    /// A barge-in fired; `audio_was_playing` separates real interruptions from misfires.
    pub fn barge_in(&mut self, now: Instant, audio_was_playing: bool) {
        self.barge_ins += 1;
        self.sink.counter("barge_ins", self.barge_ins);
        if !audio_was_playing {
            self.barge_in_misfires += 1;
            self.sink.counter("barge_in_misfires", self.barge_in_misfires);
        }
        self.barge_in_at = Some(now);
    }

    /// Server confirmed the truncation for the last barge-in.
    pub fn truncation_acknowledged(&mut self, now: Instant) {
        if let Some(triggered) = self.barge_in_at.take() {
            self.record(LatencyKind::BargeInMute, now.saturating_duration_since(triggered));
        }
    }

    pub fn reconnect(&mut self) {
        self.reconnects += 1;
        self.sink.counter("reconnects", self.reconnects);
    }

    pub fn end_of_speech_at(&self) -> Option<Instant> {
        self.end_of_speech_at
    }

    pub fn snapshot(
        &self,
        playback: SchedulerStats,
        messages: ReorderStats,
        audio: ReorderStats,
    ) -> MetricsSnapshot {
        MetricsSnapshot {
            connection_ms: millis(self.connection),
            stt_ms: millis(self.stt),
            llm_first_token_ms: millis(self.llm_first_token),
            ttfa_ms: millis(self.ttfa),
            heartbeat_rtt_ms: millis(self.heartbeat_rtt),
            barge_in_mute_ms: millis(self.barge_in_mute),
            reconnects: self.reconnects,
            barge_ins: self.barge_ins,
            barge_in_misfires: self.barge_in_misfires,
            chunks_played: playback.chunks_scheduled,
            chunks_dropped: playback.chunks_dropped,
            underruns: playback.underruns,
            prebuffer_timeouts: playback.prebuffer_timeouts,
            messages_reordered: messages.buffered + audio.buffered,
            messages_stale: messages.stale_dropped + audio.stale_dropped,
            messages_overflowed: messages.overflow_dropped + audio.overflow_dropped,
            sequence_gaps_skipped: messages.gaps_skipped + audio.gaps_skipped,
        }
    }

    /// Build a snapshot and push it to the sink.
    pub fn publish(
        &self,
        playback: SchedulerStats,
        messages: ReorderStats,
        audio: ReorderStats,
    ) -> MetricsSnapshot {
        let snapshot = self.snapshot(playback, messages, audio);
        self.sink.snapshot(&snapshot);
        snapshot
    }
}
