//! Audio device seam for live calls.
//!
//! Frames are raw PCM: 16 kHz, mono, signed 16-bit little-endian, 1024
//! bytes (512 samples, 32 ms) each. Both calls block at the device cadence.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

pub const SAMPLE_RATE: u32 = 16_000;
pub const CHANNELS: u16 = 1;
pub const BITS_PER_SAMPLE: u16 = 16;

/// Bytes per captured or played frame.
pub const FRAME_BYTES: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("No input device available")]
    NoInputDevice,

    #[error("No output device available")]
    NoOutputDevice,

    #[error("Audio device error: {0}")]
    DeviceError(String),

    #[error("Audio stream error: {0}")]
    StreamError(String),
}

/// Playback time covered by one frame (32 ms).
pub fn frame_duration() -> Duration {
    let bytes_per_second = SAMPLE_RATE as u64 * CHANNELS as u64 * (BITS_PER_SAMPLE as u64 / 8);
    Duration::from_micros(FRAME_BYTES as u64 * 1_000_000 / bytes_per_second)
}

/// A capture/playback pair. Shared between the capture and playback threads,
/// so every method takes `&self`.
pub trait AudioDevice: Send + Sync + 'static {
    /// Acquire device handles before a call's pumps start.
    fn open(&self) -> Result<(), AudioError> {
        Ok(())
    }

    /// Block until one frame has been captured.
    fn capture_frame(&self) -> Result<Vec<u8>, AudioError>;

    /// Block until `frame` has been handed to the output.
    fn play_frame(&self, frame: &[u8]) -> Result<(), AudioError>;

    /// Release device handles once the pumps have stopped.
    fn close(&self) {}
}

/// Headless device: captures silence and discards playback, both paced at
/// the frame cadence.
#[derive(Default)]
pub struct SilentDevice {
    open: AtomicBool,
    captured: AtomicU64,
    played: AtomicU64,
}

impl SilentDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn frames_captured(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }

    pub fn frames_played(&self) -> u64 {
        self.played.load(Ordering::Relaxed)
    }
}

impl AudioDevice for SilentDevice {
    fn open(&self) -> Result<(), AudioError> {
        self.open.store(true, Ordering::Release);
        debug!("Silent audio device opened");
        Ok(())
    }

    fn capture_frame(&self) -> Result<Vec<u8>, AudioError> {
        std::thread::sleep(frame_duration());
        self.captured.fetch_add(1, Ordering::Relaxed);
        Ok(vec![0u8; FRAME_BYTES])
    }

    fn play_frame(&self, _frame: &[u8]) -> Result<(), AudioError> {
        std::thread::sleep(frame_duration());
        self.played.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
        debug!("Silent audio device closed");
    }
}
