use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crate::{error::CaptureError, types::Frame};

/// Outcome of one capture request.
#[derive(Debug)]
pub enum Capture {
    Frame(Frame),
    /// No new frame yet; ask again later.
    Pending,
    /// The source is exhausted or was closed.
    Closed,
}

/// Anything that yields frames on request without blocking indefinitely.
pub trait FrameSource: Send {
    fn capture(&mut self) -> Result<Capture, CaptureError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn capture(&mut self) -> Result<Capture, CaptureError> {
        (**self).capture()
    }
}

/// Shared close switch for a source. Closing is how a stream is cancelled.
#[derive(Clone, Debug, Default)]
pub struct SourceCloser {
    closed: Arc<AtomicBool>,
}

impl SourceCloser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub trait Clock: Send {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// A clock that only moves when slept on or advanced; clones share the same time.
#[derive(Clone, Debug)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|err| err.into_inner());
        *now += duration;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Minimum spacing between accepted frames.
#[derive(Clone, Debug)]
pub struct FramePacer {
    interval: Duration,
    last_frame: Option<Instant>,
}

impl FramePacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_frame: None,
        }
    }

    pub fn from_fps(fps: u32) -> Self {
        Self::new(Duration::from_nanos(1_000_000_000 / fps.max(1) as u64))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn ready(&self, now: Instant) -> bool {
        self.remaining(now).is_zero()
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        match self.last_frame {
            Some(last) => self.interval.saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }

    pub fn mark(&mut self, now: Instant) {
        self.last_frame = Some(now);
    }
}

/// Rate-limits an inner source. Requests inside the pacing interval return
/// [`Capture::Pending`] without touching the inner source.
pub struct ThrottledSource<S, C = SystemClock> {
    inner: S,
    pacer: FramePacer,
    clock: C,
    closer: SourceCloser,
}

impl<S: FrameSource> ThrottledSource<S, SystemClock> {
    pub fn new(inner: S, fps: u32) -> Self {
        Self::with_clock(inner, fps, SystemClock)
    }
}

impl<S: FrameSource, C: Clock> ThrottledSource<S, C> {
    pub fn with_clock(inner: S, fps: u32, clock: C) -> Self {
        Self {
            inner,
            pacer: FramePacer::from_fps(fps),
            clock,
            closer: SourceCloser::new(),
        }
    }

    pub fn closer(&self) -> SourceCloser {
        self.closer.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }

    pub fn interval(&self) -> Duration {
        self.pacer.interval()
    }

    /// How long until a capture request could yield a frame.
    pub fn wait_hint(&self) -> Duration {
        self.pacer.remaining(self.clock.now())
    }

    /// Waits for at most `limit`, never past the next pacing slot.
    pub fn wait(&self, limit: Duration) {
        let remaining = self.wait_hint();
        let duration = if remaining.is_zero() {
            limit
        } else {
            remaining.min(limit)
        };
        self.clock.sleep(duration);
    }
}

impl<S: FrameSource, C: Clock> FrameSource for ThrottledSource<S, C> {
    fn capture(&mut self) -> Result<Capture, CaptureError> {
        if self.closer.is_closed() {
            return Ok(Capture::Closed);
        }

        let now = self.clock.now();
        if !self.pacer.ready(now) {
            return Ok(Capture::Pending);
        }

        let capture = self.inner.capture()?;
        match &capture {
            Capture::Frame(_) => self.pacer.mark(now),
            Capture::Closed => self.closer.close(),
            Capture::Pending => {}
        }
        Ok(capture)
    }
}

/// Frames held in memory, handed out in order.
#[derive(Debug, Default)]
pub struct MemorySource {
    frames: VecDeque<Frame>,
}

impl MemorySource {
    pub fn new(frames: impl IntoIterator<Item = Frame>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for MemorySource {
    fn capture(&mut self) -> Result<Capture, CaptureError> {
        Ok(match self.frames.pop_front() {
            Some(frame) => Capture::Frame(frame),
            None => Capture::Closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelOrder;

    /// Always has a fresh frame ready, like a camera running faster than the pipeline.
    struct EndlessSource;

    impl FrameSource for EndlessSource {
        fn capture(&mut self) -> Result<Capture, CaptureError> {
            Ok(Capture::Frame(Frame::filled(2, 2, PixelOrder::Rgb, [0, 0, 0])))
        }
    }

    #[test]
    fn twenty_fps_source_polled_at_hundred_hz_yields_twenty_frames_per_second() {
        let clock = ManualClock::new();
        let mut source = ThrottledSource::with_clock(EndlessSource, 20, clock.clone());

        let mut frames = 0;
        for _ in 0..100 {
            if let Capture::Frame(_) = source.capture().unwrap() {
                frames += 1;
            }
            clock.advance(Duration::from_millis(10));
        }

        assert_eq!(frames, 20);
    }

    #[test]
    fn pending_inside_interval_does_not_touch_inner_source() {
        let clock = ManualClock::new();
        let mut source = ThrottledSource::with_clock(
            MemorySource::new(vec![
                Frame::filled(1, 1, PixelOrder::Rgb, [1, 1, 1]),
                Frame::filled(1, 1, PixelOrder::Rgb, [2, 2, 2]),
            ]),
            10,
            clock.clone(),
        );

        assert!(matches!(source.capture().unwrap(), Capture::Frame(_)));
        assert!(matches!(source.capture().unwrap(), Capture::Pending));
        assert_eq!(source.inner.remaining(), 1);
        assert_eq!(source.wait_hint(), Duration::from_millis(100));

        clock.advance(Duration::from_millis(100));
        assert!(matches!(source.capture().unwrap(), Capture::Frame(_)));
    }

    #[test]
    fn closed_switch_ends_capture() {
        let mut source = ThrottledSource::new(EndlessSource, 1_000);
        let closer = source.closer();
        assert!(matches!(source.capture().unwrap(), Capture::Frame(_)));
        closer.close();
        assert!(matches!(source.capture().unwrap(), Capture::Closed));
    }

    #[test]
    fn exhausted_inner_source_closes_throttle() {
        let mut source = ThrottledSource::new(MemorySource::default(), 30);
        assert!(matches!(source.capture().unwrap(), Capture::Closed));
        assert!(source.is_closed());
    }

    #[test]
    fn manual_clock_keeps_ticking_after_a_panicked_holder() {
        let clock = ManualClock::new();
        let start = clock.now();
        let shared = clock.clone();
        let _ = thread::spawn(move || {
            let _guard = shared.now.lock().unwrap();
            panic!("poison the clock");
        })
        .join();
        assert!(clock.now.is_poisoned());

        clock.advance(Duration::from_millis(30));
        assert_eq!(clock.now() - start, Duration::from_millis(30));
    }

    #[test]
    fn wait_never_passes_next_slot() {
        let clock = ManualClock::new();
        let start = clock.now();
        let mut source = ThrottledSource::with_clock(EndlessSource, 20, clock.clone());
        source.capture().unwrap();
        source.wait(Duration::from_secs(1));
        assert_eq!(clock.now() - start, Duration::from_millis(50));
    }
}
