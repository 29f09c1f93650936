//! Background capture thread feeding a bounded, drop-oldest frame queue.

use crate::camera::CameraError;
use crate::frame::Frame;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_QUEUE_CAPACITY: usize = 5;
pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 10;
const ERROR_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture already running")]
    AlreadyRunning,
    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Anything that yields camera frames. Reads may block until a frame is ready.
pub trait FrameSource: Send + 'static {
    fn read_frame(&mut self) -> Result<Frame, CameraError>;
}

impl FrameSource for Box<dyn FrameSource> {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        (**self).read_frame()
    }
}

/// Bounded FIFO that evicts its oldest frame instead of blocking the producer.
pub struct FrameQueue {
    frames: Mutex<VecDeque<Frame>>,
    ready: Condvar,
    capacity: usize,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Frame>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, frame: Frame) {
        let mut frames = self.lock();
        while frames.len() >= self.capacity {
            frames.pop_front();
        }
        frames.push_back(frame);
        drop(frames);
        self.ready.notify_one();
    }

    /// Oldest queued frame, if any. Never blocks.
    pub fn pop(&self) -> Option<Frame> {
        self.lock().pop_front()
    }

    /// Oldest queued frame, waiting up to `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Frame> {
        let frames = self.lock();
        let (mut frames, _) = self
            .ready
            .wait_timeout_while(frames, timeout, |f| f.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        frames.pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// Owns the capture thread. One source at a time.
pub struct Capture {
    queue: Arc<FrameQueue>,
    running: Arc<AtomicBool>,
    frames_captured: Arc<AtomicU64>,
    max_consecutive_errors: u32,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Capture {
    pub fn new(queue_capacity: usize, max_consecutive_errors: u32) -> Self {
        Self {
            queue: Arc::new(FrameQueue::new(queue_capacity)),
            running: Arc::new(AtomicBool::new(false)),
            frames_captured: Arc::new(AtomicU64::new(0)),
            max_consecutive_errors: max_consecutive_errors.max(1),
            thread: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &Arc<FrameQueue> {
        &self.queue
    }

    /// True while the capture thread is producing frames. Turns false on
    /// `stop()` or after too many consecutive read errors.
    pub fn is_active(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames_captured.load(Ordering::Relaxed)
    }

    /// Next frame from the queue, or `None` if it is empty.
    pub fn get_frame(&self) -> Option<Frame> {
        self.queue.pop()
    }

    pub fn start<S: FrameSource>(&self, mut source: S) -> Result<(), CaptureError> {
        let mut thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner);
        if self.running.load(Ordering::SeqCst) {
            return Err(CaptureError::AlreadyRunning);
        }
        // A thread that stopped itself after read errors is still joinable.
        if let Some(old) = thread.take() {
            let _ = old.join();
        }

        self.queue.clear();
        self.running.store(true, Ordering::SeqCst);

        let queue = Arc::clone(&self.queue);
        let running = Arc::clone(&self.running);
        let captured = Arc::clone(&self.frames_captured);
        let max_errors = self.max_consecutive_errors;

        let spawned = std::thread::Builder::new()
            .name("frec-capture".into())
            .spawn(move || {
                tracing::info!("capture thread started");
                let mut consecutive_errors = 0u32;
                while running.load(Ordering::SeqCst) {
                    match source.read_frame() {
                        Ok(frame) if !frame.is_empty() => {
                            consecutive_errors = 0;
                            captured.fetch_add(1, Ordering::Relaxed);
                            queue.push(frame);
                        }
                        Ok(_) => {
                            consecutive_errors += 1;
                            tracing::debug!(consecutive_errors, "empty frame from camera");
                        }
                        Err(e) => {
                            consecutive_errors += 1;
                            tracing::warn!(consecutive_errors, error = %e, "frame read failed");
                        }
                    }
                    if consecutive_errors >= max_errors {
                        tracing::error!(consecutive_errors, "too many capture errors, stopping capture");
                        running.store(false, Ordering::SeqCst);
                        break;
                    }
                    if consecutive_errors > 0 {
                        std::thread::sleep(ERROR_BACKOFF);
                    }
                }
                tracing::info!("capture thread exiting");
            });

        match spawned {
            Ok(handle) => {
                *thread = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Stop the capture thread and wait for it. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("capture thread panicked");
            }
        }
        self.queue.clear();
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use std::time::Instant;

    fn frame(sequence: u32) -> Frame {
        Frame::new(RgbImage::new(4, 4), sequence)
    }

    /// Yields numbered frames, then fails forever.
    struct ScriptedSource {
        next: u32,
        good_frames: u32,
    }

    impl FrameSource for ScriptedSource {
        fn read_frame(&mut self) -> Result<Frame, CameraError> {
            std::thread::sleep(Duration::from_millis(1));
            if self.next >= self.good_frames {
                return Err(CameraError::CaptureFailed("unplugged".into()));
            }
            self.next += 1;
            Ok(frame(self.next))
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_queue_drops_oldest() {
        let queue = FrameQueue::new(5);
        for i in 1..=7 {
            queue.push(frame(i));
        }
        assert_eq!(queue.len(), 5);
        let order: Vec<u32> = std::iter::from_fn(|| queue.pop()).map(|f| f.sequence).collect();
        assert_eq!(order, vec![3, 4, 5, 6, 7]);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_queue_pop_timeout() {
        let queue = Arc::new(FrameQueue::new(2));
        assert!(queue.pop_timeout(Duration::from_millis(10)).is_none());

        let producer = Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.push(frame(9));
        });
        let got = queue.pop_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got.sequence, 9);
        handle.join().unwrap();
    }

    #[test]
    fn test_capture_stops_after_consecutive_errors() {
        let capture = Capture::new(5, 3);
        capture.start(ScriptedSource { next: 0, good_frames: 2 }).unwrap();
        assert!(wait_until(|| !capture.is_active()));
        assert_eq!(capture.frames_captured(), 2);
        assert_eq!(capture.get_frame().map(|f| f.sequence), Some(1));

        // restartable after self-termination
        capture.start(ScriptedSource { next: 0, good_frames: 1 }).unwrap();
        assert!(wait_until(|| !capture.is_active()));
        capture.stop();
    }

    #[test]
    fn test_start_twice_and_stop_idempotent() {
        let capture = Capture::new(5, 10);
        capture.start(ScriptedSource { next: 0, good_frames: u32::MAX }).unwrap();
        assert!(capture.is_active());
        assert!(matches!(
            capture.start(ScriptedSource { next: 0, good_frames: 1 }),
            Err(CaptureError::AlreadyRunning)
        ));
        assert!(wait_until(|| capture.queue().len() == 5));

        capture.stop();
        assert!(!capture.is_active());
        assert!(capture.get_frame().is_none());
        capture.stop();
    }
}
