//! Camera capture loop
//!
//! The loop owns the frame source exclusively. It blocks on the device for
//! the next frame, applies the consecutive-timeout policy and hands each raw
//! frame to the encoder without ever waiting for it.

mod test_pattern;
#[cfg(feature = "v4l2")]
mod v4l2;

pub use test_pattern::TestPatternSource;
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Source;

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::frame::RawFrame;
use crate::handoff::Handoff;
use crate::stats::PipelineStats;

/// Longest single device wait. Keeps cancellation latency well below the
/// graceful shutdown deadline even with long per-frame timeouts.
pub const WAIT_SLICE: Duration = Duration::from_millis(250);

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("timed out waiting for frame")]
    Timeout,

    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device error: {0}")]
    Device(String),
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("{count} consecutive frame timeouts, giving up on the device")]
    TooManyTimeouts { count: u32 },
}

/// A camera that can be waited on for frames.
///
/// Opening is the implementor's constructor and closing is `Drop`.
pub trait FrameSource: Send {
    fn start_streaming(&mut self) -> Result<(), SourceError>;

    fn stop_streaming(&mut self) -> Result<(), SourceError>;

    /// Block until a frame is ready or `timeout` elapses.
    ///
    /// Must return [`SourceError::Timeout`] for an expired wait so it can be
    /// told apart from hard device failures.
    fn wait_for_frame(&mut self, timeout: Duration) -> Result<(), SourceError>;

    /// Bytes of the frame made ready by the last successful wait. Only valid
    /// until the next call into the source.
    fn read_frame(&mut self) -> Result<&[u8], SourceError>;
}

/// Timeout policy for the capture loop
#[derive(Debug, Clone, Copy)]
pub struct CaptureSettings {
    /// How long one frame may take before it counts as a timeout.
    pub frame_timeout: Duration,
    /// Consecutive timeouts tolerated; the next one is fatal.
    pub max_frame_timeouts: u32,
}

enum Wait {
    Ready,
    Cancelled,
}

pub struct CaptureLoop {
    source: Box<dyn FrameSource>,
    settings: CaptureSettings,
    stats: Arc<PipelineStats>,
}

impl CaptureLoop {
    pub fn new(source: Box<dyn FrameSource>, settings: CaptureSettings, stats: Arc<PipelineStats>) -> Self {
        Self {
            source,
            settings,
            stats,
        }
    }

    /// Run until cancelled or until the source fails.
    ///
    /// Blocking; run it on a dedicated thread.
    pub fn run(mut self, raw: &Handoff<RawFrame>, token: &CancellationToken) -> Result<(), CaptureError> {
        info!(
            frame_timeout_ms = self.settings.frame_timeout.as_millis() as u64,
            max_timeouts = self.settings.max_frame_timeouts,
            "Starting camera capture"
        );

        self.source.start_streaming()?;
        let result = self.pump(raw, token);

        info!("Stopping camera capture");
        if let Err(e) = self.source.stop_streaming() {
            warn!(error = %e, "Failed to stop camera stream");
        }

        result
    }

    fn pump(&mut self, raw: &Handoff<RawFrame>, token: &CancellationToken) -> Result<(), CaptureError> {
        let mut timeouts = 0u32;

        while !token.is_cancelled() {
            match self.wait(token) {
                Ok(Wait::Ready) => timeouts = 0,
                Ok(Wait::Cancelled) => break,
                Err(SourceError::Timeout) => {
                    self.stats.record_timeout();
                    if timeouts == self.settings.max_frame_timeouts {
                        return Err(CaptureError::TooManyTimeouts { count: timeouts + 1 });
                    }
                    timeouts += 1;
                    warn!(consecutive = timeouts, "Timed out waiting for camera frame");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            let data = self.source.read_frame()?;
            if data.is_empty() {
                debug!("Camera returned an empty frame");
                continue;
            }

            match raw.try_deliver(RawFrame::copy_from_slice(data)) {
                Ok(()) => self.stats.record_captured(),
                Err(_) => self.stats.record_dropped(),
            }
        }

        Ok(())
    }

    /// Wait up to the frame timeout in short slices, checking for
    /// cancellation between them. Only an expired final slice is a timeout.
    fn wait(&mut self, token: &CancellationToken) -> Result<Wait, SourceError> {
        let deadline = Instant::now() + self.settings.frame_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let slice = remaining.min(WAIT_SLICE);

            match self.source.wait_for_frame(slice) {
                Ok(()) => return Ok(Wait::Ready),
                Err(SourceError::Timeout) if slice < remaining => {
                    if token.is_cancelled() {
                        return Ok(Wait::Cancelled);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::thread;

    enum Step {
        Frame(&'static [u8]),
        Timeout,
        Fail,
    }

    #[derive(Default)]
    struct SourceLog {
        waits: usize,
        started: bool,
        stopped: bool,
    }

    struct ScriptedSource {
        script: VecDeque<Step>,
        current: Vec<u8>,
        log: Arc<Mutex<SourceLog>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Step>) -> (Self, Arc<Mutex<SourceLog>>) {
            let log = Arc::new(Mutex::new(SourceLog::default()));
            let source = Self {
                script: script.into(),
                current: Vec::new(),
                log: Arc::clone(&log),
            };
            (source, log)
        }
    }

    impl FrameSource for ScriptedSource {
        fn start_streaming(&mut self) -> Result<(), SourceError> {
            self.log.lock().started = true;
            Ok(())
        }

        fn stop_streaming(&mut self) -> Result<(), SourceError> {
            self.log.lock().stopped = true;
            Ok(())
        }

        fn wait_for_frame(&mut self, timeout: Duration) -> Result<(), SourceError> {
            self.log.lock().waits += 1;
            match self.script.pop_front() {
                Some(Step::Frame(data)) => {
                    self.current = data.to_vec();
                    Ok(())
                }
                Some(Step::Timeout) => Err(SourceError::Timeout),
                Some(Step::Fail) => Err(SourceError::Device("unplugged".into())),
                None => {
                    thread::sleep(timeout);
                    Err(SourceError::Timeout)
                }
            }
        }

        fn read_frame(&mut self) -> Result<&[u8], SourceError> {
            Ok(&self.current)
        }
    }

    fn settings(max_frame_timeouts: u32) -> CaptureSettings {
        CaptureSettings {
            frame_timeout: Duration::from_millis(10),
            max_frame_timeouts,
        }
    }

    #[test]
    fn eleventh_consecutive_timeout_is_fatal() {
        let script = (0..11).map(|_| Step::Timeout).collect();
        let (source, log) = ScriptedSource::new(script);
        let stats = Arc::new(PipelineStats::new());
        let capture = CaptureLoop::new(Box::new(source), settings(10), Arc::clone(&stats));

        let result = capture.run(&Handoff::new(), &CancellationToken::new());

        assert_matches!(result, Err(CaptureError::TooManyTimeouts { count: 11 }));
        let log = log.lock();
        assert_eq!(log.waits, 11);
        assert!(log.started && log.stopped);
        assert_eq!(stats.snapshot().frame_timeouts, 11);
    }

    #[test]
    fn successful_frame_resets_timeout_count() {
        let mut script: Vec<Step> = (0..10).map(|_| Step::Timeout).collect();
        script.push(Step::Frame(b"frame"));
        script.extend((0..10).map(|_| Step::Timeout));
        script.push(Step::Fail);
        let (source, _log) = ScriptedSource::new(script);
        let capture = CaptureLoop::new(Box::new(source), settings(10), Arc::new(PipelineStats::new()));

        let result = capture.run(&Handoff::new(), &CancellationToken::new());

        assert_matches!(result, Err(CaptureError::Source(SourceError::Device(_))));
    }

    #[test]
    fn device_error_is_fatal_immediately() {
        let (source, log) = ScriptedSource::new(vec![Step::Fail, Step::Frame(b"late")]);
        let capture = CaptureLoop::new(Box::new(source), settings(10), Arc::new(PipelineStats::new()));

        let result = capture.run(&Handoff::new(), &CancellationToken::new());

        assert_matches!(result, Err(CaptureError::Source(SourceError::Device(_))));
        assert_eq!(log.lock().waits, 1);
    }

    #[test]
    fn frames_are_dropped_when_encoder_is_busy() {
        let (source, _log) = ScriptedSource::new(vec![Step::Frame(b"a"), Step::Frame(b"b"), Step::Fail]);
        let stats = Arc::new(PipelineStats::new());
        let capture = CaptureLoop::new(Box::new(source), settings(10), Arc::clone(&stats));

        let _ = capture.run(&Handoff::new(), &CancellationToken::new());

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.frames_dropped, 2);
        assert_eq!(snapshot.frames_captured, 0);
    }

    #[test]
    fn cancellation_stops_streaming() {
        let (source, log) = ScriptedSource::new(Vec::new());
        let token = CancellationToken::new();
        let capture = CaptureLoop::new(
            Box::new(source),
            CaptureSettings {
                frame_timeout: Duration::from_secs(30),
                max_frame_timeouts: 10,
            },
            Arc::new(PipelineStats::new()),
        );

        let handle = {
            let token = token.clone();
            thread::spawn(move || capture.run(&Handoff::new(), &token))
        };
        thread::sleep(Duration::from_millis(50));
        token.cancel();

        let result = handle.join().unwrap();
        assert!(result.is_ok());
        assert!(log.lock().stopped);
    }

    /// Camera whose frames arrive further apart than one wait slice. A frame
    /// lands on whichever wait covers its arrival; restarting the stream
    /// would push it back by a full interval.
    struct SlowCamera {
        interval: Duration,
        next_frame: Option<Instant>,
        starts: Arc<Mutex<usize>>,
    }

    impl FrameSource for SlowCamera {
        fn start_streaming(&mut self) -> Result<(), SourceError> {
            *self.starts.lock() += 1;
            self.next_frame = Some(Instant::now() + self.interval);
            Ok(())
        }

        fn stop_streaming(&mut self) -> Result<(), SourceError> {
            self.next_frame = None;
            Ok(())
        }

        fn wait_for_frame(&mut self, timeout: Duration) -> Result<(), SourceError> {
            let due = self.next_frame.ok_or_else(|| SourceError::Device("not streaming".into()))?;
            let now = Instant::now();
            if due > now + timeout {
                thread::sleep(timeout);
                return Err(SourceError::Timeout);
            }
            thread::sleep(due.saturating_duration_since(now));
            self.next_frame = Some(due + self.interval);
            Ok(())
        }

        fn read_frame(&mut self) -> Result<&[u8], SourceError> {
            Ok(b"slow")
        }
    }

    #[test]
    fn frames_slower_than_a_wait_slice_are_not_timeouts() {
        let starts = Arc::new(Mutex::new(0));
        let source = SlowCamera {
            interval: WAIT_SLICE + Duration::from_millis(150),
            next_frame: None,
            starts: Arc::clone(&starts),
        };
        let stats = Arc::new(PipelineStats::new());
        let token = CancellationToken::new();
        let capture = CaptureLoop::new(
            Box::new(source),
            CaptureSettings {
                frame_timeout: Duration::from_secs(2),
                max_frame_timeouts: 0,
            },
            Arc::clone(&stats),
        );

        let handle = {
            let token = token.clone();
            thread::spawn(move || capture.run(&Handoff::new(), &token))
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while stats.snapshot().frames_dropped < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        token.cancel();

        assert!(handle.join().unwrap().is_ok());
        let snapshot = stats.snapshot();
        assert!(snapshot.frames_dropped >= 2);
        assert_eq!(snapshot.frame_timeouts, 0);
        assert_eq!(*starts.lock(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delivers_to_waiting_encoder() {
        let (source, _log) = ScriptedSource::new(vec![Step::Frame(b"raw")]);
        let raw = Arc::new(Handoff::new());
        let token = CancellationToken::new();
        let stats = Arc::new(PipelineStats::new());

        let receiver = {
            let raw = Arc::clone(&raw);
            let token = token.clone();
            tokio::spawn(async move { raw.receive(&token).await })
        };
        while raw.waiting() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let capture = CaptureLoop::new(Box::new(source), settings(100), Arc::clone(&stats));
        let worker = {
            let raw = Arc::clone(&raw);
            let token = token.clone();
            tokio::task::spawn_blocking(move || capture.run(&raw, &token))
        };

        let frame = receiver.await.unwrap().unwrap();
        assert_eq!(frame.as_bytes(), b"raw");
        token.cancel();
        assert!(worker.await.unwrap().is_ok());
        assert_eq!(stats.snapshot().frames_captured, 1);
    }
}
