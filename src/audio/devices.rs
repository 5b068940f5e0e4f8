//! # Audio Device Management
//!
//! Opens the capture and output devices a session owns. A session opens both
//! when it becomes ready and closes both on every teardown, so each reconnect
//! gets fresh devices and stale audio can never be routed into a new session.
//!
//! ## Backends:
//! Only headless devices ship with the engine. A host with real sound hardware
//! implements [`AudioDevices`] over its own audio stack.

use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::audio::capture::{CaptureError, CaptureSource, NullCapture};
use crate::audio::output::{AudioOutput, VirtualOutput, VirtualOutputHandle};
use crate::error::EngineResult;

/// Factory for the two devices a session owns.
pub trait AudioDevices: Send {
    fn open_output(&mut self, sample_rate: u32) -> EngineResult<Box<dyn AudioOutput>>;

    fn open_capture(&mut self, sample_rate: u32) -> Result<Box<dyn CaptureSource>, CaptureError>;
}

/// Which clock headless outputs run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputClock {
    /// Follows wall time, so scheduling behaves as on real hardware
    #[default]
    Wall,
    /// Frozen until advanced through a [`VirtualOutputHandle`]
    Manual,
}

impl std::str::FromStr for OutputClock {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "wall" | "realtime" => Ok(OutputClock::Wall),
            "manual" | "virtual" => Ok(OutputClock::Manual),
            _ => Err(format!("Unknown output clock: {}", s)),
        }
    }
}

/// Devices that need no sound hardware.
///
/// Every output opened is a [`VirtualOutput`]; its handle is kept so callers
/// can inspect what the scheduler did. Capture is a [`NullCapture`] unless
/// permission denial is being simulated.
#[derive(Debug, Clone, Default)]
pub struct HeadlessDevices {
    clock: OutputClock,
    deny_capture: bool,
    outputs: Arc<Mutex<Vec<VirtualOutputHandle>>>,
}

impl HeadlessDevices {
    pub fn new(clock: OutputClock) -> Self {
        Self {
            clock,
            ..Self::default()
        }
    }

    /// Make every capture request fail with a permission denial.
    pub fn deny_capture(mut self) -> Self {
        self.deny_capture = true;
        self
    }

    /// Handle of the most recently opened output, if any.
    pub fn latest_output(&self) -> Option<VirtualOutputHandle> {
        self.outputs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .last()
            .cloned()
    }

    pub fn outputs_opened(&self) -> usize {
        self.outputs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl AudioDevices for HeadlessDevices {
    fn open_output(&mut self, sample_rate: u32) -> EngineResult<Box<dyn AudioOutput>> {
        let (output, handle) = match self.clock {
            OutputClock::Wall => VirtualOutput::wall_clock(),
            OutputClock::Manual => VirtualOutput::manual(),
        };
        debug!(sample_rate, clock = ?self.clock, "opened headless output");
        self.outputs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handle);
        Ok(Box::new(output))
    }

    fn open_capture(&mut self, sample_rate: u32) -> Result<Box<dyn CaptureSource>, CaptureError> {
        if self.deny_capture {
            return Err(CaptureError::PermissionDenied);
        }
        info!(sample_rate, "opened headless capture");
        Ok(Box::new(NullCapture::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_clock_from_str() {
        assert_eq!("wall".parse::<OutputClock>().unwrap(), OutputClock::Wall);
        assert_eq!("MANUAL".parse::<OutputClock>().unwrap(), OutputClock::Manual);
        assert!("cuda".parse::<OutputClock>().is_err());
    }

    #[test]
    fn test_headless_devices_track_outputs() {
        let mut devices = HeadlessDevices::new(OutputClock::Manual);
        let probe = devices.clone();
        assert!(probe.latest_output().is_none());

        let _first = devices.open_output(24_000).unwrap();
        let _second = devices.open_output(24_000).unwrap();
        assert_eq!(probe.outputs_opened(), 2);
        assert_eq!(probe.latest_output().unwrap().now(), 0.0);
    }

    #[test]
    fn test_denied_capture() {
        let mut devices = HeadlessDevices::default().deny_capture();
        assert_eq!(
            devices.open_capture(16_000).err(),
            Some(CaptureError::PermissionDenied)
        );
    }
}
