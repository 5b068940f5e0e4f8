//! # Microphone Capture Boundary
//!
//! Capture sources push fixed-size blocks of mono `f32` samples at the input
//! rate (16 kHz) into a channel owned by the session runtime. The engine never
//! pulls from the device; it only reacts to blocks as they arrive.

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

/// Why a capture source could not start.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    /// The host refused microphone access. Fatal until the user fixes it.
    #[error("microphone permission denied")]
    PermissionDenied,
    /// No input device is present
    #[error("no input device: {0}")]
    DeviceUnavailable(String),
    /// Anything else the backend reported
    #[error("capture backend error: {0}")]
    Backend(String),
}

/// A microphone that can be started and stopped.
pub trait CaptureSource: Send {
    /// Begin delivering blocks into `tx`. Calling `start` twice restarts delivery.
    fn start(&mut self, tx: mpsc::UnboundedSender<Vec<f32>>) -> Result<(), CaptureError>;

    /// Stop delivering blocks and release the device.
    fn stop(&mut self);
}

/// Capture source that produces no audio.
///
/// Used by headless runs, where user input arrives as text instead.
#[derive(Debug, Default)]
pub struct NullCapture {
    tx: Option<mpsc::UnboundedSender<Vec<f32>>>,
}

impl NullCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.tx.is_some()
    }
}

impl CaptureSource for NullCapture {
    fn start(&mut self, tx: mpsc::UnboundedSender<Vec<f32>>) -> Result<(), CaptureError> {
        info!("null capture started (no microphone attached)");
        self.tx = Some(tx);
        Ok(())
    }

    fn stop(&mut self) {
        self.tx = None;
    }
}
