//! # Session Engine
//!
//! The single owner of all session state: connection status, handshake
//! progress, heartbeat, reordering, conversation text, playback and barge-in.
//! Every input is a method call; every output is either an [`Action`] for the
//! transport driver or a [`SessionEvent`] for the presentation layer.
//!
//! ## Driving the Engine:
//! The engine performs no network I/O and reads no clock of its own. A driver
//! (see `runtime::SessionRuntime`) must:
//! 1. Call the `on_*` method matching each input, passing the current `Instant`
//! 2. Execute every [`Action`] returned by [`SessionEngine::drain_actions`]
//! 3. Forward every [`SessionEvent`] from [`SessionEngine::drain_events`]
//! 4. Call [`SessionEngine::on_tick`] no later than [`SessionEngine::next_deadline`]
//!
//! ## Connection Lifecycle:
//! ```text
//! connect() ─► Connecting ─► (session.resume?) ─► session.init
//!          session.init.ack ─► Connected ─► session.ready ─► Ready
//! unexpected close ─► Reconnecting ─(backoff)─► Connecting ... ─► Failed
//! ```
//!
//! Audio devices are owned here too: they are opened when the session becomes
//! ready and torn down on every close, so a new connection never inherits a
//! device from a dead one.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audio::capture::{CaptureError, CaptureSource};
use crate::audio::chunk::AudioChunk;
use crate::audio::devices::AudioDevices;
use crate::audio::output::AudioOutput;
use crate::audio::processor::AudioProcessor;
use crate::audio::scheduler::{PlaybackScheduler, SchedulerEvent, SchedulerSettings};
use crate::barge_in::{
    AlwaysInterrupt, BargeInController, BargeInDecision, BargeInSource, InterruptContext, InterruptionPolicy,
};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, TimeoutKind};
use crate::metrics::{MetricsSnapshot, SessionMetrics, TelemetrySink, TracingTelemetry};
use crate::protocol::frame::{AudioFrame, FrameType};
use crate::protocol::messages::{
    AudioFormat, ClientMessage, Envelope, ServerMessage, FEATURE_BINARY_AUDIO, PROTOCOL_VERSION, SUPPORTED_FEATURES,
};
use crate::protocol::reorder::{ReorderBuffer, DEFAULT_CAPACITY};
use crate::session::backoff::Backoff;
use crate::session::dispatcher::Dispatcher;
use crate::session::events::SessionEvent;
use crate::session::recovery::{FileRecoveryStore, MemoryRecoveryStore, RecoveryRecord, RecoveryStore};
use crate::session::status::{ConnectionStatus, PipelineState};
use crate::transport::{Outbound, CLOSE_ABNORMAL, CLOSE_NORMAL, CLOSE_ZOMBIE};

/// Work the driver must carry out on the engine's behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Open a new transport. `id` identifies this attempt in the callbacks.
    OpenTransport { id: u64, url: String, credential: String },
    /// Write a frame to the current transport
    Send(Outbound),
    /// Close the current transport. The engine has already handled the close;
    /// the driver must not report it back.
    CloseTransport { code: u16, reason: String },
}

/// One voice interaction, from `connect()` to disconnect or terminal failure.
#[derive(Debug, Clone, Default)]
pub struct Session {
    /// Issued by the server in `session.ready`
    pub session_id: Option<String>,
    pub conversation_id: Option<String>,
    pub features: BTreeSet<String>,
    pub recovery_eligible: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Idle,
    Opening(u64),
    Open(u64),
}

pub struct SessionEngine {
    config: EngineConfig,
    client_id: String,
    status: ConnectionStatus,
    pipeline: PipelineState,
    session: Option<Session>,
    intentional: bool,
    link: Link,
    next_link_id: u64,

    backoff: Backoff,
    reconnect_at: Option<Instant>,
    handshake_deadline: Option<(TimeoutKind, Instant)>,
    init_acknowledged: bool,
    pending_resume: Option<RecoveryRecord>,
    /// Dispatcher and sequence counters describe the live session and may
    /// be saved for recovery. Cleared once they have been saved or reset.
    state_current: bool,

    focused: bool,
    next_ping_at: Option<Instant>,
    ping_sent_at: Option<Instant>,
    pong_deadline: Option<Instant>,

    message_order: ReorderBuffer<Envelope>,
    audio_order: ReorderBuffer<AudioChunk>,
    outbound_audio_seq: u32,
    capture_encoder: AudioProcessor,

    dispatcher: Dispatcher,
    scheduler: PlaybackScheduler,
    barge_in: BargeInController,
    metrics: SessionMetrics,

    devices: Box<dyn AudioDevices>,
    output: Option<Box<dyn AudioOutput>>,
    capture: Option<Box<dyn CaptureSource>>,
    capture_tx: mpsc::UnboundedSender<Vec<f32>>,
    recovery: Box<dyn RecoveryStore>,

    actions: Vec<Action>,
    events: Vec<SessionEvent>,
}

impl SessionEngine {
    /// Build an engine from a validated configuration.
    ///
    /// ## Parameters:
    /// - **devices**: opens capture and output when a session becomes ready
    /// - **capture_tx**: where capture sources deliver microphone blocks; the
    ///   driver feeds the receiving end back through `on_capture_block`
    ///
    /// The recovery store defaults to a file store when `recovery.path` is
    /// set and to memory otherwise; telemetry defaults to `tracing`.
    pub fn new(
        config: EngineConfig,
        devices: Box<dyn AudioDevices>,
        capture_tx: mpsc::UnboundedSender<Vec<f32>>,
    ) -> Self {
        let recovery: Box<dyn RecoveryStore> = match &config.recovery.path {
            Some(path) => Box::new(FileRecoveryStore::new(path.clone())),
            None => Box::new(MemoryRecoveryStore::new()),
        };

        Self {
            client_id: Uuid::new_v4().to_string(),
            status: ConnectionStatus::Disconnected,
            pipeline: PipelineState::Idle,
            session: None,
            intentional: false,
            link: Link::Idle,
            next_link_id: 0,
            backoff: Backoff::from_config(&config.connection),
            reconnect_at: None,
            handshake_deadline: None,
            init_acknowledged: false,
            pending_resume: None,
            state_current: false,
            focused: true,
            next_ping_at: None,
            ping_sent_at: None,
            pong_deadline: None,
            message_order: ReorderBuffer::new("messages", DEFAULT_CAPACITY),
            audio_order: ReorderBuffer::new("audio", DEFAULT_CAPACITY),
            outbound_audio_seq: 0,
            capture_encoder: AudioProcessor::new(config.audio.input_sample_rate, None),
            dispatcher: Dispatcher::new(),
            scheduler: PlaybackScheduler::new(SchedulerSettings::from(&config.audio)),
            barge_in: BargeInController::new(config.barge_in.clone(), Box::new(AlwaysInterrupt)),
            metrics: SessionMetrics::new(Arc::new(TracingTelemetry)),
            devices,
            output: None,
            capture: None,
            capture_tx,
            recovery,
            actions: Vec::new(),
            events: Vec::new(),
            config,
        }
    }

    pub fn with_recovery_store(mut self, store: Box<dyn RecoveryStore>) -> Self {
        self.recovery = store;
        self
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.metrics = SessionMetrics::new(sink);
        self
    }

    pub fn with_interruption_policy(mut self, policy: Box<dyn InterruptionPolicy>) -> Self {
        self.barge_in = BargeInController::new(self.config.barge_in.clone(), policy);
        self
    }

    // ---------------------------------------------------------------------
    // Control surface
    // ---------------------------------------------------------------------

    /// Start a session.
    ///
    /// ## Behaviour:
    /// - Already connecting, connected, ready or reconnecting: no-op
    /// - Terminal status: refused until `reset_fatal_error()`
    /// - No credential configured: status `Error`, authentication error returned
    pub fn connect(&mut self, conversation_id: Option<String>, now: Instant) -> EngineResult<()> {
        if self.status.is_terminal() {
            return Err(EngineError::Terminal(self.status));
        }
        if self.status.is_active() {
            debug!(status = %self.status, "connect ignored, session already active");
            return Ok(());
        }
        if self.config.credential().is_none() {
            let err = EngineError::Authentication("no credential configured".to_string());
            self.set_status(ConnectionStatus::Error);
            self.emit_error(&err);
            return Err(err);
        }

        self.intentional = false;
        self.backoff.reset();
        self.session = Some(Session {
            conversation_id: conversation_id.or_else(|| self.config.server.conversation_id.clone()),
            ..Session::default()
        });
        self.state_current = false;
        self.metrics.reset();
        self.message_order = ReorderBuffer::new("messages", DEFAULT_CAPACITY);
        self.audio_order = ReorderBuffer::new("audio", DEFAULT_CAPACITY);
        self.scheduler = PlaybackScheduler::new(SchedulerSettings::from(&self.config.audio));
        self.metrics.connect_started(now);
        self.set_status(ConnectionStatus::Connecting);
        self.open_transport(now);
        Ok(())
    }

    /// End the session on purpose. Nothing reconnects afterwards.
    pub fn disconnect(&mut self) {
        info!(status = %self.status, "disconnecting");
        self.intentional = true;
        self.reconnect_at = None;
        self.handshake_deadline = None;
        self.stop_heartbeat();

        if self.link != Link::Idle {
            self.actions.push(Action::CloseTransport {
                code: CLOSE_NORMAL,
                reason: "client disconnect".to_string(),
            });
            self.link = Link::Idle;
        }
        self.teardown_devices();

        if let Err(e) = self.recovery.clear() {
            warn!(error = %e, "failed to clear recovery record");
        }
        self.pending_resume = None;
        self.state_current = false;
        self.dispatcher.reset();
        self.barge_in.reset();
        self.session = None;
        self.set_pipeline(PipelineState::Idle);

        if !self.status.is_terminal() {
            self.set_status(ConnectionStatus::Disconnected);
        }
        self.publish_metrics();
    }

    /// Send typed user input.
    pub fn send_text(&mut self, text: &str) -> EngineResult<()> {
        self.require_ready()?;
        self.send(ClientMessage::TextInput {
            text: text.to_string(),
        });
        Ok(())
    }

    /// The user asked to stop the assistant.
    pub fn barge_in(&mut self, now: Instant) {
        self.trigger_barge_in(BargeInSource::Explicit, now);
    }

    /// The host's voice-activity detector heard the user.
    pub fn on_local_speech(&mut self, now: Instant) {
        self.trigger_barge_in(BargeInSource::LocalVad, now);
    }

    /// Manual end of utterance.
    pub fn commit_audio(&mut self, now: Instant) -> EngineResult<()> {
        self.require_ready()?;
        self.send(ClientMessage::AudioCommit {});
        self.metrics.end_of_speech(now);
        Ok(())
    }

    /// Leave `Error`, `Failed` or `MicPermissionDenied` so `connect()` works again.
    pub fn reset_fatal_error(&mut self) {
        if !self.status.is_resettable() {
            return;
        }
        info!(status = %self.status, "resetting fatal error");
        self.intentional = false;
        self.backoff.reset();
        self.reconnect_at = None;
        self.set_status(ConnectionStatus::Disconnected);
    }

    /// Host focus changed (window hidden or shown).
    ///
    /// Losing focus pauses the heartbeat. Regaining it verifies the connection
    /// with an immediate ping, or reconnects at once if the transport is gone.
    pub fn set_focus(&mut self, focused: bool, now: Instant) {
        if self.focused == focused {
            return;
        }
        self.focused = focused;

        if !focused {
            debug!("focus lost, pausing heartbeat");
            self.stop_heartbeat();
            return;
        }

        match (self.status, self.link) {
            (ConnectionStatus::Ready, Link::Open(_)) => {
                debug!("focus regained, verifying connection");
                self.send_ping(now);
                self.next_ping_at = Some(now + self.config.connection.heartbeat_interval());
            }
            (ConnectionStatus::Reconnecting, Link::Idle) => {
                info!("focus regained with transport closed, reconnecting now");
                self.reconnect_at = None;
                self.open_transport(now);
            }
            _ => {}
        }
    }

    // ---------------------------------------------------------------------
    // Transport callbacks
    // ---------------------------------------------------------------------

    /// The transport requested by `OpenTransport { id }` is open.
    ///
    /// Returns `false` when the attempt is stale; the driver must then drop
    /// the link it just opened.
    pub fn on_transport_opened(&mut self, id: u64, now: Instant) -> bool {
        if self.link != Link::Opening(id) || self.intentional {
            debug!(id, "discarding stale transport");
            return false;
        }
        self.link = Link::Open(id);
        info!(id, "transport open, negotiating");

        self.message_order.reset(0);
        self.audio_order.reset(0);
        self.outbound_audio_seq = 0;
        self.init_acknowledged = false;
        self.handshake_deadline = Some((
            TimeoutKind::Handshake,
            now + self.config.connection.handshake_timeout(),
        ));

        if let Some(record) = self.usable_recovery_record() {
            info!(session_id = %record.session_id, "requesting session resume");
            let conversation_id = record.conversation_id.clone();
            self.send(ClientMessage::SessionResume {
                session_id: record.session_id.clone(),
                conversation_id,
                last_seq: record.last_seq,
                last_audio_seq: record.last_audio_seq,
            });
            self.pending_resume = Some(record);
        } else {
            self.send_init(None);
        }
        true
    }

    /// The transport requested by `OpenTransport { id }` could not be opened.
    pub fn on_transport_failed(&mut self, id: u64, err: EngineError, now: Instant) {
        if self.link != Link::Opening(id) {
            return;
        }
        self.link = Link::Idle;
        warn!(id, error = %err, "transport open failed");

        if matches!(err, EngineError::Authentication(_)) {
            self.fail_authentication(&err);
            return;
        }
        self.handle_close(CLOSE_ABNORMAL, &err.to_string(), now);
    }

    /// The peer closed the transport, or it died.
    pub fn on_transport_closed(&mut self, code: u16, reason: &str, now: Instant) {
        if !matches!(self.link, Link::Open(_)) {
            return;
        }
        self.link = Link::Idle;
        info!(code, reason, "transport closed");
        self.handle_close(code, reason, now);
    }

    /// A text frame arrived.
    pub fn on_text(&mut self, text: &str, now: Instant) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "dropping message that is not JSON");
                return;
            }
        };
        let Some(envelope) = decode_or_placeholder(value) else {
            return;
        };

        let delivered = match envelope.message {
            ServerMessage::Batch { messages, count } => {
                if count.is_some_and(|count| count != messages.len()) {
                    warn!(declared = ?count, actual = messages.len(), "batch count mismatch");
                }
                let members = messages
                    .into_iter()
                    .filter_map(decode_or_placeholder)
                    .map(|member| (member.seq, member))
                    .collect();
                self.message_order.submit_batch(members)
            }
            _ => self.message_order.submit(envelope.seq, envelope),
        };

        for envelope in delivered {
            self.dispatch(envelope, now);
        }
    }

    /// A binary frame arrived.
    pub fn on_binary(&mut self, data: &[u8], now: Instant) {
        let frame = match AudioFrame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping undecodable binary frame");
                return;
            }
        };
        if frame.frame_type != FrameType::AudioOutput {
            warn!(frame_type = ?frame.frame_type, "ignoring binary frame not meant for this client");
            return;
        }

        let seq = u64::from(frame.seq);
        let chunk = match AudioChunk::from_pcm_bytes(&frame.payload, self.config.audio.output_sample_rate, Some(seq)) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(seq, error = %e, "dropping malformed audio frame");
                // Still advance ordering past it
                AudioChunk {
                    samples: Vec::new(),
                    sample_rate: self.config.audio.output_sample_rate,
                    seq: Some(seq),
                    is_final: false,
                }
            }
        };

        for chunk in self.audio_order.submit(Some(seq), chunk) {
            if !chunk.is_empty() {
                self.ingest_audio(chunk, now);
            }
        }
    }

    /// A microphone block arrived from the capture source.
    pub fn on_capture_block(&mut self, samples: &[f32]) {
        if self.status != ConnectionStatus::Ready || !matches!(self.link, Link::Open(_)) {
            return;
        }
        let pcm = self.capture_encoder.encode_capture_block(samples);

        if self.feature_negotiated(FEATURE_BINARY_AUDIO) {
            let frame = AudioFrame::new(FrameType::AudioInput, self.outbound_audio_seq, pcm);
            self.outbound_audio_seq = self.outbound_audio_seq.wrapping_add(1);
            self.actions.push(Action::Send(Outbound::Binary(frame.encode())));
        } else {
            self.send(ClientMessage::AudioAppend {
                audio: BASE64.encode(pcm),
            });
        }
    }

    // ---------------------------------------------------------------------
    // Timers
    // ---------------------------------------------------------------------

    /// Earliest instant at which `on_tick` has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.reconnect_at,
            self.handshake_deadline.map(|(_, at)| at),
            self.next_ping_at,
            self.pong_deadline,
            self.scheduler.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Fire every timer that is due at `now`.
    pub fn on_tick(&mut self, now: Instant) {
        if self.reconnect_at.is_some_and(|at| now >= at) {
            self.reconnect_at = None;
            info!(attempt = self.backoff.attempts(), "reconnecting");
            self.open_transport(now);
        }

        if let Some((kind, at)) = self.handshake_deadline {
            if now >= at {
                self.handshake_deadline = None;
                let err = EngineError::Timeout(kind);
                warn!(error = %err, "handshake stalled");
                self.emit_error(&err);
                self.close_and_recover(CLOSE_ZOMBIE, &err.to_string(), now);
            }
        }

        if self.pong_deadline.is_some_and(|at| now >= at) {
            let err = EngineError::Timeout(TimeoutKind::Pong);
            warn!(error = %err, "connection is a zombie");
            self.close_and_recover(CLOSE_ZOMBIE, "heartbeat timeout", now);
        }

        if self.next_ping_at.is_some_and(|at| now >= at) {
            self.send_ping(now);
            self.next_ping_at = Some(now + self.config.connection.heartbeat_interval());
        }

        if let Some(output) = self.output.as_mut() {
            match self.scheduler.on_tick(now, output.as_mut()) {
                Ok(events) => self.forward_scheduler_events(events),
                Err(e) => warn!(error = %e, "scheduler tick failed"),
            }
        }
    }

    // ---------------------------------------------------------------------
    // Outputs
    // ---------------------------------------------------------------------

    pub fn drain_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn pipeline(&self) -> PipelineState {
        self.pipeline
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn partial_transcript(&self) -> &str {
        self.dispatcher.partial_transcript()
    }

    pub fn response_text(&self) -> &str {
        self.dispatcher.response()
    }

    pub fn is_dropping_audio(&self) -> bool {
        self.barge_in.should_drop_audio()
    }

    pub fn queued_audio(&self) -> usize {
        self.scheduler.queued()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot(
            self.scheduler.stats(),
            self.message_order.stats(),
            self.audio_order.stats(),
        )
    }

    // ---------------------------------------------------------------------
    // Dispatch
    // ---------------------------------------------------------------------

    fn dispatch(&mut self, envelope: Envelope, now: Instant) {
        match envelope.message {
            ServerMessage::SessionInitAck {
                features,
                protocol_version,
            } => self.on_init_ack(features, protocol_version, now),
            ServerMessage::SessionReady {
                session_id,
                recovery_eligible,
            } => self.on_session_ready(session_id, recovery_eligible, now),
            ServerMessage::SessionResumeAck { session_id } => self.on_resume_ack(session_id),
            ServerMessage::SessionResumeNak { reason } => self.on_resume_nak(reason),

            ServerMessage::TranscriptDelta { text } => {
                let event = self.dispatcher.transcript_delta(text);
                self.events.push(event);
            }
            ServerMessage::TranscriptComplete { text } => {
                self.metrics.transcript_final(now);
                let event = self.dispatcher.transcript_complete(text);
                self.events.push(event);
            }
            ServerMessage::TranscriptTruncated {
                spoken_text,
                unspoken_text,
            } => {
                self.metrics.truncation_acknowledged(now);
                let event = self.dispatcher.truncated(spoken_text, unspoken_text);
                self.events.push(event);
            }

            ServerMessage::ResponseCreated { response_id } => {
                debug!(response_id = ?response_id, "response stream started");
                self.barge_in.response_started();
            }
            ServerMessage::ResponseDelta { delta } => {
                self.metrics.response_delta(now);
                let event = self.dispatcher.response_delta(delta);
                self.events.push(event);
            }
            ServerMessage::ResponseComplete { text } => {
                let event = self.dispatcher.response_complete(text);
                self.events.push(event);
                self.publish_metrics();
            }

            ServerMessage::AudioDelta { audio, is_final } => {
                match AudioChunk::from_base64(&audio, self.config.audio.output_sample_rate, is_final) {
                    Ok(chunk) => self.ingest_audio(chunk, now),
                    Err(e) => warn!(error = %e, "dropping malformed audio delta"),
                }
            }
            ServerMessage::AudioDone {} => self.end_of_audio(now),

            ServerMessage::PipelineState { state, reason } => self.on_pipeline_state(&state, reason, now),
            ServerMessage::SpeechStarted {} => self.trigger_barge_in(BargeInSource::ServerVad, now),
            ServerMessage::SpeechStopped {} => self.metrics.end_of_speech(now),

            ServerMessage::ToolCallStart {
                call_id,
                name,
                arguments,
            } => {
                let event = self.dispatcher.tool_call_started(call_id, name, arguments);
                self.events.push(event);
            }
            ServerMessage::ToolCallComplete { call_id, result } => {
                let event = self.dispatcher.tool_call_completed(call_id, result);
                self.events.push(event);
            }
            ServerMessage::ToolCallError { call_id, message } => {
                let event = self.dispatcher.tool_call_failed(call_id, message);
                self.events.push(event);
            }

            ServerMessage::Ping { timestamp } => self.send(ClientMessage::Pong { timestamp }),
            ServerMessage::Pong { .. } => self.on_pong(now),

            ServerMessage::Error {
                code,
                message,
                recoverable,
            } => self.on_backend_error(code, message, recoverable),

            ServerMessage::Batch { .. } => warn!("ignoring nested batch"),
            ServerMessage::Unknown { kind } => debug!(kind = %kind, "ignoring unknown message type"),
        }
    }

    fn on_init_ack(&mut self, features: Vec<String>, protocol_version: Option<u32>, now: Instant) {
        if let Some(version) = protocol_version.filter(|v| *v != PROTOCOL_VERSION) {
            warn!(ours = PROTOCOL_VERSION, theirs = version, "protocol version mismatch");
        }
        let offered = self.offered_features();
        let negotiated: BTreeSet<String> = features.into_iter().filter(|f| offered.contains(f)).collect();
        info!(features = ?negotiated, "capabilities negotiated");

        if let Some(session) = self.session.as_mut() {
            session.features = negotiated;
        }
        self.init_acknowledged = true;
        self.handshake_deadline = Some((
            TimeoutKind::SessionReady,
            now + self.config.connection.handshake_timeout(),
        ));
        self.set_status(ConnectionStatus::Connected);
    }

    fn on_session_ready(&mut self, session_id: String, recovery_eligible: bool, now: Instant) {
        if !self.init_acknowledged {
            // Older servers skip the ack; carry on with no optional features
            warn!("session.ready without session.init.ack, continuing without negotiated features");
        }
        let resumed = self
            .session
            .as_ref()
            .and_then(|s| s.session_id.as_deref())
            .is_some_and(|previous| previous == session_id);

        let session = self.session.get_or_insert_with(Session::default);
        session.session_id = Some(session_id.clone());
        session.recovery_eligible = recovery_eligible;

        self.handshake_deadline = None;
        self.backoff.reset();
        self.metrics.session_ready(now);

        if let Err(err) = self.open_devices() {
            self.fail_capture(err);
            return;
        }

        self.set_status(ConnectionStatus::Ready);
        self.state_current = true;
        info!(session_id = %session_id, resumed, recovery_eligible, "session ready");
        self.events.push(SessionEvent::SessionReady { session_id, resumed });
        if self.focused {
            self.next_ping_at = Some(now + self.config.connection.heartbeat_interval());
        }
        self.publish_metrics();
    }

    fn on_resume_ack(&mut self, session_id: String) {
        let Some(record) = self.pending_resume.take() else {
            warn!("unexpected session.resume.ack");
            return;
        };
        info!(session_id = %session_id, "session resumed");

        self.message_order.reset(record.last_seq.map_or(0, |seq| seq + 1));
        self.audio_order.reset(record.last_audio_seq.map_or(0, |seq| seq + 1));
        self.dispatcher
            .restore(record.partial_transcript.clone(), record.partial_response.clone());
        if !record.partial_transcript.is_empty() {
            self.events.push(SessionEvent::PartialTranscript {
                text: record.partial_transcript,
            });
        }
        if let Some(session) = self.session.as_mut() {
            session.session_id = Some(session_id.clone());
        }
        self.send_init(Some(session_id));
    }

    fn on_resume_nak(&mut self, reason: Option<String>) {
        info!(reason = ?reason, "session resume rejected, starting fresh");
        self.pending_resume = None;
        self.state_current = false;
        if let Err(e) = self.recovery.clear() {
            warn!(error = %e, "failed to clear recovery record");
        }
        self.dispatcher.reset();
        self.message_order.reset(0);
        self.audio_order.reset(0);
        if let Some(session) = self.session.as_mut() {
            session.session_id = None;
        }
        self.send_init(None);
    }

    fn on_pipeline_state(&mut self, state: &str, reason: Option<String>, now: Instant) {
        let Some(next) = PipelineState::from_wire(state) else {
            debug!(state, "ignoring unknown pipeline state");
            return;
        };
        let previous = self.pipeline;
        self.set_pipeline(next);

        if next == PipelineState::Processing {
            self.barge_in.response_started();
        }

        // speaking → listening also happens when speech simply ends; only an
        // explicit barge_in reason may cut audio still queued locally
        if previous == PipelineState::Speaking
            && next == PipelineState::Listening
            && reason.as_deref() == Some("barge_in")
        {
            self.trigger_barge_in(BargeInSource::ServerPhase, now);
        }
    }

    fn on_backend_error(&mut self, code: String, message: String, recoverable: bool) {
        let err = EngineError::Backend {
            code,
            message,
            recoverable,
        };
        self.emit_error(&err);

        if recoverable {
            warn!(error = %err, "backend reported a recoverable error");
            return;
        }

        error!(error = %err, "backend reported a fatal error");
        self.intentional = true;
        self.reconnect_at = None;
        self.handshake_deadline = None;
        self.stop_heartbeat();
        if self.link != Link::Idle {
            self.actions.push(Action::CloseTransport {
                code: CLOSE_NORMAL,
                reason: "fatal backend error".to_string(),
            });
            self.link = Link::Idle;
        }
        self.teardown_devices();
        self.session = None;
        self.set_status(ConnectionStatus::Error);
    }

    // ---------------------------------------------------------------------
    // Audio
    // ---------------------------------------------------------------------

    fn ingest_audio(&mut self, chunk: AudioChunk, now: Instant) {
        if self.barge_in.should_drop_audio() {
            debug!(seq = ?chunk.seq, "dropping audio from interrupted response");
            self.scheduler.record_dropped();
            return;
        }
        let Some(output) = self.output.as_mut() else {
            debug!("audio arrived with no output open");
            self.scheduler.record_dropped();
            return;
        };

        self.metrics.audio_received(now);
        match self.scheduler.enqueue(chunk, now, output.as_mut()) {
            Ok(events) => self.forward_scheduler_events(events),
            Err(e) => warn!(error = %e, "failed to schedule audio"),
        }
    }

    fn end_of_audio(&mut self, now: Instant) {
        if self.barge_in.should_drop_audio() {
            return;
        }
        if let Some(output) = self.output.as_mut() {
            match self.scheduler.signal_end_of_stream(now, output.as_mut()) {
                Ok(events) => self.forward_scheduler_events(events),
                Err(e) => warn!(error = %e, "failed to finish playback"),
            }
        }
    }

    fn forward_scheduler_events(&mut self, events: Vec<SchedulerEvent>) {
        for event in events {
            match event {
                SchedulerEvent::PlaybackStarted { start_at } => {
                    debug!(start_at, "playback started");
                    self.events.push(SessionEvent::PlaybackStarted);
                }
                SchedulerEvent::PlaybackComplete => self.events.push(SessionEvent::PlaybackComplete),
                SchedulerEvent::PrebufferTimedOut { .. } => {}
            }
        }
    }

    fn trigger_barge_in(&mut self, source: BargeInSource, now: Instant) {
        let clock = self.output.as_ref().map_or(0.0, |o| o.current_time());
        let ctx = InterruptContext {
            source,
            pipeline: self.pipeline,
            audio_playing: self.scheduler.is_playing(clock),
            audio_queued: self.scheduler.queued() > 0,
            recent_audio: self
                .scheduler
                .received_within(now, self.barge_in.recent_audio_window()),
        };

        let successful = match self.barge_in.evaluate(ctx, now) {
            BargeInDecision::Interrupt { successful } => successful,
            BargeInDecision::Ignored(reason) => {
                debug!(source = %source, reason = ?reason, "barge-in ignored");
                return;
            }
        };

        let fade = self.barge_in.fade_duration();
        if let Some(output) = self.output.as_mut() {
            output.fade_out(fade);
        }
        self.events.push(SessionEvent::PlaybackStopped { fade });
        self.scheduler.clear();
        self.send(ClientMessage::BargeIn {
            reason: source.as_str().to_string(),
            timestamp: Utc::now().timestamp_millis(),
        });
        self.metrics.barge_in(now, successful);
        info!(source = %source, successful, "barge-in");
    }

    fn open_devices(&mut self) -> Result<(), CaptureError> {
        self.teardown_devices();

        match self.devices.open_output(self.config.audio.output_sample_rate) {
            Ok(output) => self.output = Some(output),
            Err(e) => {
                // Text still works without a speaker
                warn!(error = %e, "audio output unavailable");
                self.emit_error(&e);
            }
        }

        let mut capture = self.devices.open_capture(self.config.audio.input_sample_rate)?;
        capture.start(self.capture_tx.clone())?;
        self.capture = Some(capture);
        Ok(())
    }

    /// Release capture and output. Every step runs even if an earlier one fails.
    fn teardown_devices(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(mut output) = self.output.take() {
            output.stop_all();
            if let Err(e) = output.close() {
                warn!(error = %e, "failed to close audio output");
            }
        }
        self.scheduler.clear();
    }

    // ---------------------------------------------------------------------
    // Connection internals
    // ---------------------------------------------------------------------

    fn open_transport(&mut self, now: Instant) {
        let Some(credential) = self.config.credential().map(str::to_string) else {
            let err = EngineError::Authentication("no credential configured".to_string());
            self.fail_authentication(&err);
            return;
        };
        self.next_link_id += 1;
        let id = self.next_link_id;
        self.link = Link::Opening(id);
        self.handshake_deadline = Some((
            TimeoutKind::Handshake,
            now + self.config.connection.handshake_timeout(),
        ));
        self.actions.push(Action::OpenTransport {
            id,
            url: self.config.server.url.clone(),
            credential,
        });
    }

    /// Close the transport ourselves and treat it like an unexpected close.
    fn close_and_recover(&mut self, code: u16, reason: &str, now: Instant) {
        if self.link != Link::Idle {
            self.actions.push(Action::CloseTransport {
                code,
                reason: reason.to_string(),
            });
            self.link = Link::Idle;
        }
        self.handle_close(code, reason, now);
    }

    fn handle_close(&mut self, code: u16, reason: &str, now: Instant) {
        self.handshake_deadline = None;
        self.stop_heartbeat();
        self.teardown_devices();
        self.barge_in.reset();

        if self.intentional {
            self.set_status(ConnectionStatus::Disconnected);
            return;
        }

        if code == self.config.connection.auth_failure_close_code {
            let err = EngineError::Authentication(format!("server closed with {}: {}", code, reason));
            self.fail_authentication(&err);
            return;
        }

        // Only the close that ends a live session saves; a failed reconnect
        // attempt keeps the record from that session
        if self.state_current {
            self.save_recovery_record();
            self.state_current = false;
        }
        self.dispatcher.reset();
        self.pending_resume = None;

        match self.backoff.next_delay() {
            Some((attempt, delay)) => {
                self.reconnect_at = Some(now + delay);
                self.metrics.reconnect();
                self.set_status(ConnectionStatus::Reconnecting);
                info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
                self.events.push(SessionEvent::Reconnecting { attempt, delay });
            }
            None => {
                error!(
                    attempts = self.backoff.attempts(),
                    "reconnect attempts exhausted"
                );
                self.reconnect_at = None;
                self.session = None;
                self.set_status(ConnectionStatus::Failed);
                self.emit_error(&EngineError::Transport(format!(
                    "connection lost after {} reconnect attempts",
                    self.backoff.attempts()
                )));
            }
        }
    }

    fn fail_authentication(&mut self, err: &EngineError) {
        error!(error = %err, "authentication failed");
        self.reconnect_at = None;
        self.handshake_deadline = None;
        self.session = None;
        self.set_status(ConnectionStatus::Error);
        self.emit_error(err);
    }

    fn fail_capture(&mut self, err: CaptureError) {
        error!(error = %err, "microphone unavailable");
        let engine_err = EngineError::Capture(err.to_string());
        self.intentional = true;
        self.stop_heartbeat();
        if self.link != Link::Idle {
            self.actions.push(Action::CloseTransport {
                code: CLOSE_NORMAL,
                reason: "capture unavailable".to_string(),
            });
            self.link = Link::Idle;
        }
        self.teardown_devices();
        self.session = None;
        let status = match err {
            CaptureError::PermissionDenied | CaptureError::DeviceUnavailable(_) => {
                ConnectionStatus::MicPermissionDenied
            }
            CaptureError::Backend(_) => ConnectionStatus::Error,
        };
        self.set_status(status);
        self.emit_error(&engine_err);
    }

    fn usable_recovery_record(&mut self) -> Option<RecoveryRecord> {
        if !self.config.recovery.enabled {
            return None;
        }
        let record = match self.recovery.load() {
            Ok(record) => record?,
            Err(e) => {
                warn!(error = %e, "failed to load recovery record");
                return None;
            }
        };
        let conversation_id = self.session.as_ref().and_then(|s| s.conversation_id.as_deref());
        let ttl = Duration::from_secs(self.config.recovery.ttl_secs);
        if record.is_usable(Utc::now(), ttl, conversation_id) {
            return Some(record);
        }
        debug!(session_id = %record.session_id, "recovery record not usable, discarding");
        if let Err(e) = self.recovery.clear() {
            warn!(error = %e, "failed to clear recovery record");
        }
        None
    }

    fn save_recovery_record(&mut self) {
        if !self.config.recovery.enabled {
            return;
        }
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let Some(session_id) = session.session_id.clone() else {
            return;
        };
        if !session.recovery_eligible {
            return;
        }
        let record = RecoveryRecord {
            session_id,
            conversation_id: session.conversation_id.clone(),
            last_seq: self.message_order.last_delivered(),
            last_audio_seq: self.audio_order.last_delivered(),
            partial_transcript: self.dispatcher.partial_transcript().to_string(),
            partial_response: self.dispatcher.response().to_string(),
            saved_at: Utc::now(),
        };
        match self.recovery.save(&record) {
            Ok(()) => debug!(session_id = %record.session_id, "recovery record saved"),
            Err(e) => warn!(error = %e, "failed to save recovery record"),
        }
    }

    fn offered_features(&self) -> Vec<String> {
        SUPPORTED_FEATURES
            .iter()
            .filter(|f| !self.config.connection.disabled_features.iter().any(|d| d == *f))
            .map(|f| f.to_string())
            .collect()
    }

    fn feature_negotiated(&self, feature: &str) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.features.contains(feature))
    }

    fn send_init(&mut self, resume_session_id: Option<String>) {
        let conversation_id = self.session.as_ref().and_then(|s| s.conversation_id.clone());
        self.send(ClientMessage::SessionInit {
            client_id: self.client_id.clone(),
            protocol_version: PROTOCOL_VERSION,
            features: self.offered_features(),
            conversation_id,
            resume_session_id,
            audio: AudioFormat {
                input_sample_rate: self.config.audio.input_sample_rate,
                output_sample_rate: self.config.audio.output_sample_rate,
                encoding: "pcm16",
            },
        });
    }

    fn send_ping(&mut self, now: Instant) {
        self.send(ClientMessage::Ping {
            timestamp: Utc::now().timestamp_millis(),
        });
        if self.ping_sent_at.is_none() {
            self.ping_sent_at = Some(now);
            self.pong_deadline = Some(now + self.config.connection.pong_deadline());
        }
    }

    fn on_pong(&mut self, now: Instant) {
        if let Some(sent) = self.ping_sent_at.take() {
            self.metrics.heartbeat_rtt(now.saturating_duration_since(sent));
        }
        self.pong_deadline = None;
    }

    fn stop_heartbeat(&mut self) {
        self.next_ping_at = None;
        self.ping_sent_at = None;
        self.pong_deadline = None;
    }

    fn send(&mut self, message: ClientMessage) {
        match message.to_json() {
            Ok(json) => self.actions.push(Action::Send(Outbound::Text(json))),
            Err(e) => error!(error = %e, "failed to encode client message"),
        }
    }

    fn require_ready(&self) -> EngineResult<()> {
        if self.status == ConnectionStatus::Ready {
            Ok(())
        } else {
            Err(EngineError::NotReady(self.status))
        }
    }

    fn set_status(&mut self, to: ConnectionStatus) {
        let from = self.status;
        if from == to {
            return;
        }
        self.status = to;
        info!(from = %from, to = %to, "connection status changed");
        self.events.push(SessionEvent::StatusChanged { from, to });
    }

    fn set_pipeline(&mut self, to: PipelineState) {
        let from = self.pipeline;
        if from == to {
            return;
        }
        self.pipeline = to;
        debug!(from = %from, to = %to, "pipeline state changed");
        self.events.push(SessionEvent::PipelineChanged { from, to });
    }

    fn emit_error(&mut self, err: &EngineError) {
        self.events.push(SessionEvent::Error {
            code: err.code().to_string(),
            message: err.to_string(),
            recoverable: err.is_recoverable(),
        });
    }

    fn publish_metrics(&mut self) {
        let snapshot = self.metrics.publish(
            self.scheduler.stats(),
            self.message_order.stats(),
            self.audio_order.stats(),
        );
        self.events.push(SessionEvent::Metrics(snapshot));
    }
}

/// Decode a message, or stand in for a malformed one that still has a `seq`
/// so the reorder buffer is not left waiting for it.
fn decode_or_placeholder(value: Value) -> Option<Envelope> {
    let placeholder = Envelope::placeholder(&value);
    match Envelope::from_value(value) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            match &placeholder {
                Some(p) => warn!(seq = ?p.seq, error = %e, "malformed message, skipping past its sequence"),
                None => warn!(error = %e, "dropping undecodable message"),
            }
            placeholder
        }
    }
}
