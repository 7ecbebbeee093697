//! Display runtime: commit-event consumer and frame presenter.
//!
//! `run_once` pops one commit event, drains whatever else queued while the
//! target was busy, and presents a single frame stamped with the newest
//! revision — the presentation stream skips revisions but never regresses.
//! Two run modes cover both windowing worlds: a background thread for
//! targets that tolerate it, and a caller-thread loop for main-thread-only
//! windowing systems.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use core_matrix::{CommitEvent, CommitQueue, Rgba8, WindowMatrix};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DisplayError {
    #[error("render target is already started")]
    AlreadyStarted,
    #[error("render target failed: {0}")]
    Target(String),
    #[error("display worker spawn failed: {0}")]
    Spawn(String),
}

/// Frame handed to a render target. `rgba` is row-major, `height * width`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayFrame {
    pub revision: u64,
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<Rgba8>,
}

/// Presentation backend boundary. `pump_events` and `should_close` have
/// no-op defaults for offscreen targets.
pub trait RenderTarget: Send {
    fn start(&mut self) -> Result<(), DisplayError>;
    fn present_frame(&mut self, frame: &DisplayFrame) -> Result<(), DisplayError>;
    fn stop(&mut self);

    fn pump_events(&mut self) {}

    fn should_close(&self) -> bool {
        false
    }
}

/// Counting offscreen target; keeps the last presented frame around for
/// assertions and embedding smoke runs. Clones share state, so callers can
/// hand one handle to the display runtime and keep another to observe.
#[derive(Debug, Default, Clone)]
pub struct HeadlessTarget {
    inner: Arc<Mutex<HeadlessState>>,
}

#[derive(Debug, Default)]
struct HeadlessState {
    started: bool,
    frames_presented: u64,
    last_frame: Option<DisplayFrame>,
}

impl HeadlessTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_presented(&self) -> u64 {
        lock(&self.inner).frames_presented
    }

    pub fn last_frame(&self) -> Option<DisplayFrame> {
        lock(&self.inner).last_frame.clone()
    }

    pub fn is_started(&self) -> bool {
        lock(&self.inner).started
    }
}

impl RenderTarget for HeadlessTarget {
    fn start(&mut self) -> Result<(), DisplayError> {
        lock(&self.inner).started = true;
        Ok(())
    }

    fn present_frame(&mut self, frame: &DisplayFrame) -> Result<(), DisplayError> {
        let mut state = lock(&self.inner);
        if !state.started {
            return Err(DisplayError::Target("headless target not started".into()));
        }
        state.frames_presented += 1;
        state.last_frame = Some(frame.clone());
        Ok(())
    }

    fn stop(&mut self) {
        lock(&self.inner).started = false;
    }
}

/// One presentation: the commit event that won coalescing plus the frame
/// built from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderTick {
    pub event: CommitEvent,
    pub frame_revision: u64,
}

pub struct DisplayRuntime {
    matrix: Arc<WindowMatrix>,
    commits: CommitQueue,
    target: Arc<Mutex<Box<dyn RenderTarget>>>,
    running: Arc<AtomicBool>,
    target_started: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
    last_error: Arc<Mutex<Option<DisplayError>>>,
}

impl DisplayRuntime {
    pub fn new(matrix: Arc<WindowMatrix>, target: Box<dyn RenderTarget>) -> Self {
        let commits = matrix.commit_queue();
        Self {
            matrix,
            commits,
            target: Arc::new(Mutex::new(target)),
            running: Arc::new(AtomicBool::new(false)),
            target_started: AtomicBool::new(false),
            handle: Mutex::new(None),
            last_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the target and a background presentation thread.
    pub fn start(&self) -> Result<(), DisplayError> {
        let mut handle = lock(&self.handle);
        if handle.is_some() {
            return Ok(());
        }
        self.start_target()?;
        self.running.store(true, Ordering::SeqCst);
        let matrix = Arc::clone(&self.matrix);
        let commits = self.commits.clone();
        let target = Arc::clone(&self.target);
        let running = Arc::clone(&self.running);
        let last_error = Arc::clone(&self.last_error);
        let joiner = std::thread::Builder::new()
            .name("luvatrix-display".to_string())
            .spawn(move || {
                debug!(target: "display.loop", "worker started");
                while running.load(Ordering::SeqCst) {
                    let mut guard = lock(&target);
                    guard.pump_events();
                    if guard.should_close() {
                        running.store(false, Ordering::SeqCst);
                        break;
                    }
                    let outcome = run_once_inner(
                        &matrix,
                        &commits,
                        &mut **guard,
                        Some(Duration::from_millis(100)),
                    );
                    drop(guard);
                    if let Err(err) = outcome {
                        error!(target: "display.loop", error = %err, "presentation failed");
                        *lock(&last_error) = Some(err);
                        running.store(false, Ordering::SeqCst);
                        break;
                    }
                }
                debug!(target: "display.loop", "worker stopped");
            })
            .map_err(|e| DisplayError::Spawn(e.to_string()))?;
        *handle = Some(joiner);
        Ok(())
    }

    /// Run the presentation loop on the caller's thread until the target
    /// requests close or `stop` is called from elsewhere. Required where
    /// the windowing system is main-thread-only.
    pub fn run_main_thread(
        &self,
        timeout: Option<Duration>,
        idle_sleep: Duration,
    ) -> Result<(), DisplayError> {
        if self.target_started.load(Ordering::SeqCst) {
            return Err(DisplayError::AlreadyStarted);
        }
        self.start_target()?;
        self.running.store(true, Ordering::SeqCst);
        let outcome = loop {
            if !self.running.load(Ordering::SeqCst) {
                break Ok(());
            }
            {
                let mut guard = lock(&self.target);
                guard.pump_events();
                if guard.should_close() {
                    self.running.store(false, Ordering::SeqCst);
                    break Ok(());
                }
            }
            match self.run_once(timeout) {
                Ok(Some(_)) => {}
                Ok(None) => {
                    if !idle_sleep.is_zero() {
                        std::thread::sleep(idle_sleep);
                    }
                }
                Err(err) => {
                    *lock(&self.last_error) = Some(err.clone());
                    break Err(err);
                }
            }
        };
        self.stop();
        outcome
    }

    /// Present at most one frame: pop a commit event (waiting up to
    /// `timeout`), coalesce the backlog to the newest, snapshot, present.
    pub fn run_once(&self, timeout: Option<Duration>) -> Result<Option<RenderTick>, DisplayError> {
        let mut guard = lock(&self.target);
        run_once_inner(&self.matrix, &self.commits, &mut **guard, timeout)
    }

    /// Signal the worker, join it, and stop the target exactly once.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = lock(&self.handle).take()
            && handle.join().is_err()
        {
            error!(target: "display.loop", "worker panicked");
        }
        if self.target_started.swap(false, Ordering::SeqCst) {
            lock(&self.target).stop();
        }
    }

    pub fn last_error(&self) -> Option<DisplayError> {
        lock(&self.last_error).clone()
    }

    pub fn pending_commit_count(&self) -> usize {
        self.commits.len()
    }

    /// Drive the target's event pump from the owning loop thread.
    pub fn pump_target(&self) {
        lock(&self.target).pump_events();
    }

    pub fn target_should_close(&self) -> bool {
        lock(&self.target).should_close()
    }

    /// Start the target without a presentation thread; used by the unified
    /// loop, which calls `run_once` itself.
    pub fn start_target(&self) -> Result<(), DisplayError> {
        if !self.target_started.swap(true, Ordering::SeqCst) {
            lock(&self.target).start()?;
        }
        Ok(())
    }
}

fn run_once_inner(
    matrix: &WindowMatrix,
    commits: &CommitQueue,
    target: &mut dyn RenderTarget,
    timeout: Option<Duration>,
) -> Result<Option<RenderTick>, DisplayError> {
    let Some(mut event) = commits.pop(timeout) else {
        return Ok(None);
    };
    // Coalesce queued commits so frame data and revision stay aligned on
    // the newest state.
    while let Some(newer) = commits.try_pop() {
        event = newer;
    }
    let frame = DisplayFrame {
        revision: event.revision,
        width: matrix.width(),
        height: matrix.height(),
        rgba: matrix.snapshot(),
    };
    target.present_frame(&frame)?;
    Ok(Some(RenderTick {
        event,
        frame_revision: frame.revision,
    }))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use core_matrix::{PixelRect, WriteBatch, WriteOp};

    use super::*;

    fn fill(matrix: &WindowMatrix, red: f32) {
        matrix
            .submit_write_batch(&WriteBatch::single(WriteOp::FullRewrite(
                PixelRect::solid(matrix.width(), matrix.height(), [red, 0.0, 0.0, 255.0]).unwrap(),
            )))
            .unwrap();
    }

    #[test]
    fn run_once_presents_nothing_without_commits() {
        let matrix = Arc::new(WindowMatrix::with_dimensions(2, 2).unwrap());
        let runtime = DisplayRuntime::new(matrix, Box::new(HeadlessTarget::new()));
        runtime.run_once(None).unwrap();
        assert_eq!(runtime.pending_commit_count(), 0);
    }

    #[test]
    fn queued_commits_coalesce_to_newest_revision() {
        let matrix = Arc::new(WindowMatrix::with_dimensions(2, 2).unwrap());
        let target = HeadlessTarget::new();
        let observer = target.clone();
        let runtime = DisplayRuntime::new(Arc::clone(&matrix), Box::new(target));
        runtime.start_target().unwrap();
        for red in 1..=4 {
            fill(&matrix, red as f32);
        }
        let tick = runtime.run_once(None).unwrap().unwrap();
        assert_eq!(tick.event.revision, 4);
        assert_eq!(tick.frame_revision, 4);
        assert_eq!(runtime.pending_commit_count(), 0);
        assert_eq!(observer.frames_presented(), 1);
        let frame = observer.last_frame().unwrap();
        assert_eq!(frame.revision, 4);
        assert_eq!(frame.rgba[0], [4, 0, 0, 255]);
    }

    #[test]
    fn presented_revisions_never_regress() {
        let matrix = Arc::new(WindowMatrix::with_dimensions(1, 1).unwrap());
        let target = HeadlessTarget::new();
        let runtime = DisplayRuntime::new(Arc::clone(&matrix), Box::new(target));
        runtime.start_target().unwrap();
        let mut last = 0;
        for round in 0..5 {
            for _ in 0..=round {
                fill(&matrix, 1.0);
            }
            let tick = runtime.run_once(None).unwrap().unwrap();
            assert!(tick.frame_revision > last);
            last = tick.frame_revision;
        }
    }

    #[test]
    fn background_loop_presents_and_honors_close() {
        struct ClosingTarget {
            presented: Arc<AtomicBool>,
            close: Arc<AtomicBool>,
        }
        impl RenderTarget for ClosingTarget {
            fn start(&mut self) -> Result<(), DisplayError> {
                Ok(())
            }
            fn present_frame(&mut self, _frame: &DisplayFrame) -> Result<(), DisplayError> {
                self.presented.store(true, Ordering::SeqCst);
                self.close.store(true, Ordering::SeqCst);
                Ok(())
            }
            fn stop(&mut self) {}
            fn should_close(&self) -> bool {
                self.close.load(Ordering::SeqCst)
            }
        }
        let matrix = Arc::new(WindowMatrix::with_dimensions(1, 1).unwrap());
        let presented = Arc::new(AtomicBool::new(false));
        let close = Arc::new(AtomicBool::new(false));
        let runtime = DisplayRuntime::new(
            Arc::clone(&matrix),
            Box::new(ClosingTarget {
                presented: Arc::clone(&presented),
                close: Arc::clone(&close),
            }),
        );
        runtime.start().unwrap();
        fill(&matrix, 9.0);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !close.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        runtime.stop();
        assert!(presented.load(Ordering::SeqCst));
    }

    #[test]
    fn failing_target_stops_the_loop_and_stores_the_error() {
        struct FailingTarget;
        impl RenderTarget for FailingTarget {
            fn start(&mut self) -> Result<(), DisplayError> {
                Ok(())
            }
            fn present_frame(&mut self, _frame: &DisplayFrame) -> Result<(), DisplayError> {
                Err(DisplayError::Target("swapchain lost".into()))
            }
            fn stop(&mut self) {}
        }
        let matrix = Arc::new(WindowMatrix::with_dimensions(1, 1).unwrap());
        let runtime = DisplayRuntime::new(Arc::clone(&matrix), Box::new(FailingTarget));
        runtime.start().unwrap();
        fill(&matrix, 1.0);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while runtime.last_error().is_none() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        runtime.stop();
        assert!(matches!(runtime.last_error(), Some(DisplayError::Target(_))));
    }
}
