//! # Configuration Management
//!
//! Loads the engine configuration from multiple sources and validates it once,
//! before any session is created. The resulting [`EngineConfig`] is immutable:
//! every feature toggle (instant barge-in, crossfade, pre-buffering, session
//! recovery) lives here instead of being threaded through call sites.
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Shortcut environment variables (`VOICE_URL`, `VOICE_TOKEN`)
//! 2. Environment variables with the `VOICE_` prefix, `__` between sections
//!    (e.g. `VOICE_AUDIO__CROSSFADE=false`, `VOICE_CONNECTION__MAX_RECONNECT_ATTEMPTS=3`)
//! 3. Configuration file (`voice.toml`, optional)
//! 4. Default values (defined in the Default impls)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Main engine configuration.
///
/// ## Sections:
/// - **server**: where to connect and with which credential
/// - **connection**: reconnect backoff, heartbeat and handshake timers
/// - **audio**: playback start policy, quality preset, scheduling margins
/// - **barge_in**: interruption behaviour
/// - **recovery**: session recovery persistence
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub server: ServerConfig,
    pub connection: ConnectionConfig,
    pub audio: AudioConfig,
    pub barge_in: BargeInConfig,
    pub recovery: RecoveryConfig,
}

/// Backend endpoint settings.
///
/// ## Fields:
/// - `url`: WebSocket endpoint of the voice pipeline (`ws://` or `wss://`)
/// - `auth_token`: bearer credential; `connect()` fails fast without one
/// - `conversation_id`: conversation to attach to; also scopes recovery records
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub url: String,
    pub auth_token: Option<String>,
    pub conversation_id: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws/voice".to_string(),
            auth_token: None,
            conversation_id: None,
        }
    }
}

/// Connection lifecycle timers.
///
/// ## Reconnect backoff:
/// Attempt `n` (1-based) waits `reconnect_base_ms * 2^(n-1)`, capped at
/// `reconnect_max_ms`. After `max_reconnect_attempts` failures the session
/// moves to `failed`.
///
/// ## Heartbeat:
/// A ping goes out every `heartbeat_interval_ms` once the session is ready; if
/// no pong arrives within `heartbeat_interval_ms + heartbeat_timeout_ms` the
/// connection is treated as a zombie and closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Close code the server uses for a rejected credential
    pub auth_failure_close_code: u16,
    /// Features this client refuses to negotiate even if the server offers them
    pub disabled_features: Vec<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_base_ms: 300,
            reconnect_max_ms: 30_000,
            max_reconnect_attempts: 5,
            heartbeat_interval_ms: 15_000,
            heartbeat_timeout_ms: 5_000,
            handshake_timeout_ms: 10_000,
            auth_failure_close_code: 4001,
            disabled_features: Vec::new(),
        }
    }
}

impl ConnectionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// How long a ping may stay unanswered before the connection is a zombie.
    pub fn pong_deadline(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms + self.heartbeat_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// When playback of a new utterance begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackPolicy {
    /// Schedule the first chunk as soon as it arrives
    Immediate,
    /// Wait for the preset's chunk target or its timeout, whichever is first
    Prebuffered,
}

/// Quality preset that scales pre-buffer depth and crossfade length together.
///
/// | preset        | pre-buffer chunks | pre-buffer timeout | crossfade |
/// |---------------|-------------------|--------------------|-----------|
/// | low_latency   | 1                 | 40 ms              | 3 ms      |
/// | balanced      | 2                 | 120 ms             | 5 ms      |
/// | high_quality  | 3                 | 250 ms             | 10 ms     |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityPreset {
    LowLatency,
    Balanced,
    HighQuality,
}

impl QualityPreset {
    pub fn prebuffer_chunks(self) -> usize {
        match self {
            QualityPreset::LowLatency => 1,
            QualityPreset::Balanced => 2,
            QualityPreset::HighQuality => 3,
        }
    }

    pub fn prebuffer_timeout(self) -> Duration {
        match self {
            QualityPreset::LowLatency => Duration::from_millis(40),
            QualityPreset::Balanced => Duration::from_millis(120),
            QualityPreset::HighQuality => Duration::from_millis(250),
        }
    }

    pub fn crossfade_ms(self) -> f64 {
        match self {
            QualityPreset::LowLatency => 3.0,
            QualityPreset::Balanced => 5.0,
            QualityPreset::HighQuality => 10.0,
        }
    }
}

/// Audio pipeline settings.
///
/// ## Sample rates:
/// - `input_sample_rate`: microphone blocks sent upstream (16 kHz)
/// - `output_sample_rate`: synthesized speech arriving from the backend (24 kHz)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub playback_policy: PlaybackPolicy,
    pub quality: QualityPreset,
    pub crossfade: bool,
    /// Stop scheduling once this far ahead of the output clock
    pub max_lookahead_ms: u64,
    /// Minimum distance between the output clock and a newly scheduled chunk
    pub safety_margin_ms: u64,
    /// How often a paused scheduler re-checks the output clock
    pub resume_poll_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            playback_policy: PlaybackPolicy::Prebuffered,
            quality: QualityPreset::Balanced,
            crossfade: true,
            max_lookahead_ms: 3_000,
            safety_margin_ms: 20,
            resume_poll_ms: 100,
        }
    }
}

/// Barge-in (user interrupts playback) settings.
///
/// ## Recent-audio fallback:
/// Backend phase reports can lag behind reality. When `recent_audio_fallback`
/// is on, a chunk received within `recent_audio_window_ms` counts as "still
/// speaking" for the purpose of accepting a local voice-activity trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BargeInConfig {
    /// React to local voice activity without waiting for the server
    pub instant: bool,
    pub fade_ms: u64,
    pub recent_audio_fallback: bool,
    pub recent_audio_window_ms: u64,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            instant: true,
            fade_ms: 30,
            recent_audio_fallback: true,
            recent_audio_window_ms: 3_000,
        }
    }
}

impl BargeInConfig {
    pub fn fade_duration(&self) -> Duration {
        Duration::from_millis(self.fade_ms)
    }
}

/// Session recovery persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    /// Where the file store keeps its record; `None` keeps it in memory only
    pub path: Option<PathBuf>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 120,
            path: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from defaults, an optional `voice.toml` and the environment.
    ///
    /// ## Parameters:
    /// - **file**: explicit config file stem/path; `None` looks for `voice.toml`
    ///   in the working directory and silently skips it when absent
    pub fn load(file: Option<&str>) -> Result<Self> {
        let file_source = match file {
            Some(path) => config::File::with_name(path).required(true),
            None => config::File::with_name("voice").required(false),
        };

        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&EngineConfig::default())?)
            .add_source(file_source)
            .add_source(
                config::Environment::with_prefix("VOICE")
                    .prefix_separator("_")
                    .separator("__"),
            );

        // Short names for the two values people actually set by hand
        if let Ok(url) = env::var("VOICE_URL") {
            settings = settings.set_override("server.url", url)?;
        }
        if let Ok(token) = env::var("VOICE_TOKEN") {
            settings = settings.set_override("server.auth_token", token)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - The endpoint is a WebSocket URL
    /// - Backoff, heartbeat and handshake timers are non-zero and ordered
    /// - Sample rates are non-zero
    /// - The lookahead window is larger than the scheduling safety margin
    /// - Barge-in fade is short enough to feel instantaneous
    pub fn validate(&self) -> Result<()> {
        if !(self.server.url.starts_with("ws://") || self.server.url.starts_with("wss://")) {
            return Err(anyhow::anyhow!(
                "Server url must start with ws:// or wss://, got {}",
                self.server.url
            ));
        }

        let conn = &self.connection;
        if conn.reconnect_base_ms == 0 {
            return Err(anyhow::anyhow!("Reconnect base delay must be greater than 0"));
        }
        if conn.reconnect_max_ms < conn.reconnect_base_ms {
            return Err(anyhow::anyhow!(
                "Reconnect max delay ({}ms) is below the base delay ({}ms)",
                conn.reconnect_max_ms,
                conn.reconnect_base_ms
            ));
        }
        if conn.heartbeat_interval_ms == 0 {
            return Err(anyhow::anyhow!("Heartbeat interval must be greater than 0"));
        }
        if conn.handshake_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Handshake timeout must be greater than 0"));
        }

        let audio = &self.audio;
        if audio.input_sample_rate == 0 || audio.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }
        if audio.max_lookahead_ms <= audio.safety_margin_ms {
            return Err(anyhow::anyhow!(
                "Lookahead ({}ms) must exceed the safety margin ({}ms)",
                audio.max_lookahead_ms,
                audio.safety_margin_ms
            ));
        }
        if audio.resume_poll_ms == 0 {
            return Err(anyhow::anyhow!("Scheduler resume poll interval must be greater than 0"));
        }

        if self.barge_in.fade_ms == 0 || self.barge_in.fade_ms > 500 {
            return Err(anyhow::anyhow!(
                "Barge-in fade must be between 1 and 500ms, got {}",
                self.barge_in.fade_ms
            ));
        }

        if self.recovery.enabled && self.recovery.ttl_secs == 0 {
            return Err(anyhow::anyhow!("Recovery TTL must be greater than 0 when recovery is enabled"));
        }

        Ok(())
    }

    /// Render the effective configuration as TOML (used by `--print-config`).
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// The credential used for the transport, if one is configured and non-empty.
    pub fn credential(&self) -> Option<&str> {
        self.server
            .auth_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }
}
