//! Capture and playback threads for a live call.
//!
//! Capture reads one frame at a time from the device and sends it straight
//! through the datagram relay. Playback drains a bounded queue fed by the
//! relay's receive loop. Device failures are pushed to a fault channel and
//! end that thread; whoever owns the call decides how to abort it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use parley_net::DatagramRelay;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, trace, warn};

use crate::audio::{AudioDevice, AudioError};

/// Default playback queue depth in frames (about 1.6 s of audio).
pub const DEFAULT_PLAYBACK_FRAMES: usize = 50;

/// How long playback waits on the queue before rechecking the stop flag.
const PLAYBACK_POLL: Duration = Duration::from_millis(100);

pub type FaultSender = UnboundedSender<AudioError>;

/// Bounded frame queue between the relay receive loop and playback.
/// Pushing never blocks: when full, the oldest frame is dropped.
#[derive(Clone)]
pub struct PlaybackQueue {
    tx: Sender<Bytes>,
    rx: Receiver<Bytes>,
    dropped: Arc<AtomicU64>,
}

impl PlaybackQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            tx,
            rx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn push(&self, frame: Bytes) {
        let mut frame = frame;
        loop {
            match self.tx.try_send(frame) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    if self.rx.try_recv().is_ok() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    frame = back;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Frames discarded to make room since the queue was created.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        while self.rx.try_recv().is_ok() {}
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Bytes, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }
}

/// The running pair of audio threads for one call.
pub struct AudioPump {
    running: Arc<AtomicBool>,
    device: Arc<dyn AudioDevice>,
    queue: PlaybackQueue,
    capture: Option<JoinHandle<()>>,
    playback: Option<JoinHandle<()>>,
}

impl AudioPump {
    /// Open the device and start both threads. Frames queued before the call
    /// started are discarded.
    pub fn start(
        device: Arc<dyn AudioDevice>,
        relay: Arc<DatagramRelay>,
        queue: PlaybackQueue,
        faults: FaultSender,
    ) -> Result<Self, AudioError> {
        device.open()?;
        queue.clear();

        let running = Arc::new(AtomicBool::new(true));

        let capture = {
            let running = running.clone();
            let device = device.clone();
            let faults = faults.clone();
            std::thread::Builder::new()
                .name("audio-capture".into())
                .spawn(move || capture_loop(running, device, relay, faults))
        };
        let capture = match capture {
            Ok(handle) => handle,
            Err(e) => {
                running.store(false, Ordering::Release);
                device.close();
                return Err(AudioError::StreamError(format!("capture thread: {}", e)));
            }
        };

        let playback = {
            let running = running.clone();
            let device = device.clone();
            let queue = queue.clone();
            std::thread::Builder::new()
                .name("audio-playback".into())
                .spawn(move || playback_loop(running, device, queue, faults))
        };
        let playback = match playback {
            Ok(handle) => handle,
            Err(e) => {
                running.store(false, Ordering::Release);
                let _ = capture.join();
                device.close();
                return Err(AudioError::StreamError(format!("playback thread: {}", e)));
            }
        };

        info!("Audio pump started");
        Ok(Self {
            running,
            device,
            queue,
            capture: Some(capture),
            playback: Some(playback),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop both threads, wait for them, then release the device.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);

        for handle in [self.capture.take(), self.playback.take()].into_iter().flatten() {
            if handle.thread().id() == std::thread::current().id() {
                continue;
            }
            if handle.join().is_err() {
                warn!("Audio thread panicked");
            }
        }

        self.device.close();
        self.queue.clear();
        info!("Audio pump stopped");
    }
}

impl Drop for AudioPump {
    fn drop(&mut self) {
        if self.capture.is_some() || self.playback.is_some() {
            self.stop();
        }
    }
}

fn capture_loop(
    running: Arc<AtomicBool>,
    device: Arc<dyn AudioDevice>,
    relay: Arc<DatagramRelay>,
    faults: FaultSender,
) {
    let mut sent: u64 = 0;
    while running.load(Ordering::Acquire) {
        match device.capture_frame() {
            Ok(frame) => {
                if !running.load(Ordering::Acquire) {
                    break;
                }
                if let Err(e) = relay.send(&frame) {
                    trace!("Dropped captured frame: {}", e);
                    continue;
                }
                sent += 1;
            }
            Err(e) => {
                warn!("Capture failed: {}", e);
                let _ = faults.send(e);
                break;
            }
        }
    }
    debug!("Capture loop exiting after {} frames", sent);
}

fn playback_loop(
    running: Arc<AtomicBool>,
    device: Arc<dyn AudioDevice>,
    queue: PlaybackQueue,
    faults: FaultSender,
) {
    let mut played: u64 = 0;
    while running.load(Ordering::Acquire) {
        match queue.recv_timeout(PLAYBACK_POLL) {
            Ok(frame) => {
                if let Err(e) = device.play_frame(&frame) {
                    warn!("Playback failed: {}", e);
                    let _ = faults.send(e);
                    break;
                }
                played += 1;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("Playback loop exiting after {} frames", played);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{FRAME_BYTES, SilentDevice};
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use std::time::Instant;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    /// Records every played frame; fails capture after `capture_ok` frames.
    struct ScriptedDevice {
        capture_ok: u64,
        captured: AtomicU64,
        played: Mutex<Vec<Vec<u8>>>,
        opened: AtomicBool,
    }

    impl ScriptedDevice {
        fn new(capture_ok: u64) -> Self {
            Self {
                capture_ok,
                captured: AtomicU64::new(0),
                played: Mutex::new(Vec::new()),
                opened: AtomicBool::new(false),
            }
        }
    }

    impl AudioDevice for ScriptedDevice {
        fn open(&self) -> Result<(), AudioError> {
            self.opened.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn capture_frame(&self) -> Result<Vec<u8>, AudioError> {
            std::thread::sleep(Duration::from_millis(5));
            let n = self.captured.fetch_add(1, Ordering::SeqCst);
            if n >= self.capture_ok {
                return Err(AudioError::DeviceError("microphone unplugged".into()));
            }
            Ok(vec![n as u8; FRAME_BYTES])
        }

        fn play_frame(&self, frame: &[u8]) -> Result<(), AudioError> {
            self.played.lock().unwrap().push(frame.to_vec());
            Ok(())
        }

        fn close(&self) {
            self.opened.store(false, Ordering::SeqCst);
        }
    }

    struct Unavailable;

    impl AudioDevice for Unavailable {
        fn open(&self) -> Result<(), AudioError> {
            Err(AudioError::NoInputDevice)
        }
        fn capture_frame(&self) -> Result<Vec<u8>, AudioError> {
            Err(AudioError::NoInputDevice)
        }
        fn play_frame(&self, _frame: &[u8]) -> Result<(), AudioError> {
            Err(AudioError::NoOutputDevice)
        }
    }

    #[test]
    fn queue_drops_oldest_when_full() {
        let queue = PlaybackQueue::new(3);
        for i in 0..5u8 {
            queue.push(Bytes::from(vec![i]));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 2);

        let remaining: Vec<u8> = (0..3)
            .map(|_| queue.recv_timeout(Duration::from_millis(10)).unwrap()[0])
            .collect();
        assert_eq!(remaining, vec![2, 3, 4]);
    }

    #[test]
    fn open_failure_is_reported() {
        let relay = Arc::new(DatagramRelay::bind(loopback()).unwrap());
        let (faults, _rx) = tokio::sync::mpsc::unbounded_channel();
        let result = AudioPump::start(Arc::new(Unavailable), relay, PlaybackQueue::new(4), faults);
        assert_eq!(result.err(), Some(AudioError::NoInputDevice));
    }

    #[test]
    fn playback_in_arrival_order() {
        let relay = Arc::new(DatagramRelay::bind(loopback()).unwrap());
        let device = Arc::new(ScriptedDevice::new(u64::MAX));
        let queue = PlaybackQueue::new(8);
        let (faults, _rx) = tokio::sync::mpsc::unbounded_channel();

        let mut pump = AudioPump::start(device.clone(), relay, queue.clone(), faults).unwrap();
        for i in 0..4u8 {
            queue.push(Bytes::from(vec![i; 4]));
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while device.played.lock().unwrap().len() < 4 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        pump.stop();

        let played = device.played.lock().unwrap().clone();
        assert_eq!(played, (0..4u8).map(|i| vec![i; 4]).collect::<Vec<_>>());
        assert!(!device.opened.load(Ordering::SeqCst));
        assert!(!pump.is_running());
    }

    #[test]
    fn capture_fault_reaches_channel() {
        let relay = Arc::new(DatagramRelay::bind(loopback()).unwrap());
        let device = Arc::new(ScriptedDevice::new(3));
        let (faults, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut pump = AudioPump::start(device, relay, PlaybackQueue::new(4), faults).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let fault = loop {
            if let Ok(fault) = rx.try_recv() {
                break fault;
            }
            assert!(Instant::now() < deadline, "no fault reported");
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(fault, AudioError::DeviceError("microphone unplugged".into()));
        pump.stop();
    }

    #[test]
    fn captured_frames_cross_the_relay() {
        let a = Arc::new(DatagramRelay::bind(loopback()).unwrap());
        let b = DatagramRelay::bind(loopback()).unwrap();
        a.configure_peer(b.local_addr());

        let (seen_tx, seen_rx) = crossbeam_channel::unbounded();
        b.start(Arc::new(move |data: &[u8], _from: SocketAddr| {
            let _ = seen_tx.send(data.len());
        }))
        .unwrap();

        let device = Arc::new(SilentDevice::new());
        let (faults, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mut pump = AudioPump::start(device.clone(), a, PlaybackQueue::new(4), faults).unwrap();
        assert!(device.is_open());

        let len = seen_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(len, FRAME_BYTES);

        pump.stop();
        assert!(!device.is_open());
        b.close();
    }
}
