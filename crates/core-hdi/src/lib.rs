//! HDI (human-device interface) collection thread.
//!
//! A single worker polls a platform [`HdiSource`] at a fixed interval,
//! normalizes what it reports, derives keyboard press phases, and feeds a
//! bounded queue. The worker is the only producer; the app context is the
//! only consumer. Queue policy, in priority order:
//!
//! * pointer moves coalesce in place (latest position wins, queue never
//!   grows on a move burst);
//! * keyboard transitions are never dropped — under saturation a
//!   non-transition event is evicted to make room, and if none exists the
//!   thread fails fatally rather than lose a key edge;
//! * other events evict the oldest non-keyboard entry, else the oldest.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, error};

mod event;
mod normalize;
mod press;
mod source;

pub use event::{
    Device, EventType, HdiEvent, Payload, PointerExtras, PressPhase, RawHdiEvent, RawPayload,
    Status,
};
pub use normalize::{ContentRect, WindowGeometry};
pub use press::{PressMachine, PressOut, PressTimings};
pub use source::{HdiSource, NoopSource, ScriptedSource};

pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1024;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_micros(1_000_000 / 240);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HdiError {
    #[error("hdi config invalid: {0}")]
    InvalidConfig(&'static str),
    #[error("hdi queue saturated with keyboard transitions; refusing to drop keyboard events")]
    QueueSaturated,
    #[error("hdi worker spawn failed: {0}")]
    Spawn(String),
}

pub type ActiveProvider = Box<dyn Fn() -> bool + Send>;
pub type GeometryProvider = Box<dyn Fn() -> WindowGeometry + Send>;
pub type ExtentProvider = Box<dyn Fn() -> (f64, f64) + Send>;
pub type ContentRectProvider = Box<dyn Fn() -> Option<ContentRect> + Send>;

/// Thread configuration. Providers default to an always-active 1x1 window
/// with no target extent or content inset.
pub struct HdiConfig {
    pub max_queue_size: usize,
    pub poll_interval: Duration,
    pub timings: PressTimings,
    pub window_active: Option<ActiveProvider>,
    pub window_geometry: Option<GeometryProvider>,
    pub target_extent: Option<ExtentProvider>,
    pub content_rect: Option<ContentRectProvider>,
}

impl Default for HdiConfig {
    fn default() -> Self {
        Self {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            timings: PressTimings::default(),
            window_active: None,
            window_geometry: None,
            target_extent: None,
            content_rect: None,
        }
    }
}

struct Shared {
    queue: Mutex<VecDeque<HdiEvent>>,
    running: AtomicBool,
    last_error: Mutex<Option<HdiError>>,
    max_queue_size: usize,
}

/// Worker-owned state; parked here between runs so the thread can be
/// restarted after `stop`.
struct Worker {
    source: Box<dyn HdiSource>,
    config_poll_interval: Duration,
    window_active: ActiveProvider,
    window_geometry: GeometryProvider,
    target_extent: Option<ExtentProvider>,
    content_rect: Option<ContentRectProvider>,
    machine: PressMachine,
    was_active: bool,
    keyboard_window_id: String,
    next_synth_id: u64,
}

pub struct HdiThread {
    shared: Arc<Shared>,
    worker: Arc<Mutex<Worker>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    poll_interval: Duration,
}

impl HdiThread {
    pub fn new(source: impl HdiSource + 'static, config: HdiConfig) -> Result<Self, HdiError> {
        if config.max_queue_size == 0 {
            return Err(HdiError::InvalidConfig("max_queue_size must be > 0"));
        }
        if config.poll_interval.is_zero() {
            return Err(HdiError::InvalidConfig("poll_interval must be > 0"));
        }
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(false),
            last_error: Mutex::new(None),
            max_queue_size: config.max_queue_size,
        });
        let worker = Worker {
            source: Box::new(source),
            config_poll_interval: config.poll_interval,
            window_active: config.window_active.unwrap_or_else(|| Box::new(|| true)),
            window_geometry: config
                .window_geometry
                .unwrap_or_else(|| Box::new(WindowGeometry::default)),
            target_extent: config.target_extent,
            content_rect: config.content_rect,
            machine: PressMachine::new(config.timings),
            was_active: true,
            keyboard_window_id: String::new(),
            next_synth_id: 1,
        };
        Ok(Self {
            shared,
            worker: Arc::new(Mutex::new(worker)),
            handle: Mutex::new(None),
            poll_interval: config.poll_interval,
        })
    }

    /// Spawn the polling worker. A second call while running is a no-op.
    pub fn start(&self) -> Result<(), HdiError> {
        let mut handle = lock(&self.handle);
        if handle.is_some() {
            return Ok(());
        }
        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let worker = Arc::clone(&self.worker);
        let joiner = std::thread::Builder::new()
            .name("luvatrix-hdi".to_string())
            .spawn(move || run_worker(&shared, &worker))
            .map_err(|e| HdiError::Spawn(e.to_string()))?;
        *handle = Some(joiner);
        Ok(())
    }

    /// Signal the worker and join it. Pending single-presses are flushed
    /// into the queue before the worker exits.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = lock(&self.handle).take()
            && handle.join().is_err()
        {
            error!(target: "hdi.thread", "worker panicked");
        }
    }

    /// Drain up to `max` oldest events.
    pub fn poll_events(&self, max: usize) -> Vec<HdiEvent> {
        let mut queue = lock(&self.shared.queue);
        let take = max.min(queue.len());
        queue.drain(..take).collect()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.shared.queue).len()
    }

    /// Fatal worker error, if the thread has died.
    pub fn last_error(&self) -> Option<HdiError> {
        lock(&self.shared.last_error).clone()
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

fn run_worker(shared: &Shared, worker: &Mutex<Worker>) {
    let mut worker = lock(worker);
    debug!(target: "hdi.thread", "worker started");
    while shared.running.load(Ordering::SeqCst) {
        if let Err(err) = worker.poll_once(shared) {
            error!(target: "hdi.thread", error = %err, "worker failed");
            *lock(&shared.last_error) = Some(err);
            shared.running.store(false, Ordering::SeqCst);
            break;
        }
        std::thread::sleep(worker.config_poll_interval);
    }
    // Resolve pending singles so short sessions still observe them.
    let flushed = worker.machine.flush_pending();
    for out in flushed {
        let event = worker.synthesize_press(out);
        let mut queue = lock(&shared.queue);
        let _ = enqueue(&mut queue, shared.max_queue_size, event);
    }
    debug!(target: "hdi.thread", "worker stopped");
}

impl Worker {
    fn poll_once(&mut self, shared: &Shared) -> Result<(), HdiError> {
        let active = (self.window_active)();
        let now = Instant::now();
        let mut synthesized: Vec<HdiEvent> = Vec::new();
        if self.was_active && !active {
            for out in self.machine.cancel_all() {
                synthesized.push(self.synthesize_press(out));
            }
        }
        self.was_active = active;
        let raw_events = self.source.poll(active, now_ts_ns());
        let geometry = (self.window_geometry)();
        let target_extent = self.target_extent.as_ref().map(|p| p());
        let content_rect = self.content_rect.as_ref().and_then(|p| p());
        let mut normalized: Vec<HdiEvent> = synthesized;
        for raw in raw_events {
            if raw.device.is_pointer() {
                normalized.push(normalize::normalize_pointer(
                    raw,
                    active,
                    geometry,
                    target_extent,
                    content_rect,
                ));
                continue;
            }
            // Keyboard lane.
            if !active {
                normalized.push(suppress_keyboard(raw));
                continue;
            }
            match (raw.event_type, raw.payload) {
                (EventType::KeyDown, Some(RawPayload::Key { key })) => {
                    self.keyboard_window_id = raw.window_id;
                    for out in self.machine.key_down(&key, now) {
                        normalized.push(self.synthesize_press(out));
                    }
                }
                (EventType::KeyUp, Some(RawPayload::Key { key })) => {
                    self.keyboard_window_id = raw.window_id;
                    for out in self.machine.key_up(&key, now) {
                        normalized.push(self.synthesize_press(out));
                    }
                }
                (event_type, _payload) => {
                    // A key transition without a key is malformed input;
                    // anything else on the keyboard device passes through
                    // payload-free.
                    let status = if matches!(event_type, EventType::KeyDown | EventType::KeyUp) {
                        Status::NotDetected
                    } else {
                        raw.status
                    };
                    normalized.push(HdiEvent {
                        event_id: raw.event_id,
                        ts_ns: raw.ts_ns,
                        window_id: raw.window_id,
                        device: raw.device,
                        event_type,
                        status,
                        payload: None,
                    });
                }
            }
        }
        for out in self.machine.tick(now) {
            normalized.push(self.synthesize_press(out));
        }
        let mut queue = lock(&shared.queue);
        for event in normalized {
            enqueue(&mut queue, shared.max_queue_size, event)?;
        }
        Ok(())
    }

    fn synthesize_press(&mut self, out: PressOut) -> HdiEvent {
        let event_id = self.next_synth_id;
        self.next_synth_id += 1;
        HdiEvent {
            event_id,
            ts_ns: now_ts_ns(),
            window_id: self.keyboard_window_id.clone(),
            device: Device::Keyboard,
            event_type: EventType::Press,
            status: Status::Ok,
            payload: Some(Payload::Press {
                key: out.key,
                phase: out.phase,
                active_keys: out.active_keys,
            }),
        }
    }
}

fn suppress_keyboard(raw: RawHdiEvent) -> HdiEvent {
    HdiEvent {
        event_id: raw.event_id,
        ts_ns: raw.ts_ns,
        window_id: raw.window_id,
        device: raw.device,
        event_type: raw.event_type,
        status: Status::NotDetected,
        payload: None,
    }
}

/// Queue admission. See the module docs for the policy.
fn enqueue(
    queue: &mut VecDeque<HdiEvent>,
    max_queue_size: usize,
    event: HdiEvent,
) -> Result<(), HdiError> {
    if event.event_type.is_move()
        && let Some(slot) = queue.iter_mut().rev().find(|e| {
            e.event_type.is_move() && e.device == event.device && e.window_id == event.window_id
        })
    {
        *slot = event;
        return Ok(());
    }
    if queue.len() < max_queue_size {
        queue.push_back(event);
        return Ok(());
    }
    if event.is_keyboard_transition() {
        if let Some(pos) = queue.iter().position(|e| !e.is_keyboard_transition()) {
            queue.remove(pos);
            queue.push_back(event);
            return Ok(());
        }
        return Err(HdiError::QueueSaturated);
    }
    if event.event_type.is_move() {
        // Already coalesced; a full queue simply drops the newest move.
        return Ok(());
    }
    if let Some(pos) = queue.iter().position(|e| e.device != Device::Keyboard) {
        queue.remove(pos);
    } else {
        queue.pop_front();
    }
    queue.push_back(event);
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn now_ts_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pointer_move(event_id: u64, x: f64, y: f64) -> RawHdiEvent {
        RawHdiEvent {
            event_id,
            ts_ns: event_id,
            window_id: "w".to_string(),
            device: Device::Mouse,
            event_type: EventType::PointerMove,
            status: Status::Ok,
            payload: Some(RawPayload::Pointer {
                screen_position: None,
                position: Some((x, y)),
                extras: PointerExtras::default(),
            }),
        }
    }

    fn key_event(event_id: u64, event_type: EventType, key: &str) -> RawHdiEvent {
        RawHdiEvent {
            event_id,
            ts_ns: event_id,
            window_id: "w".to_string(),
            device: Device::Keyboard,
            event_type,
            status: Status::Ok,
            payload: Some(RawPayload::Key {
                key: key.to_string(),
            }),
        }
    }

    fn wide_geometry() -> Option<GeometryProvider> {
        Some(Box::new(|| WindowGeometry {
            left: 0.0,
            top: 0.0,
            width: 100.0,
            height: 100.0,
        }))
    }

    /// Hold phases pushed far out so slow test hosts never see them.
    fn no_hold_timings() -> PressTimings {
        PressTimings {
            hold_threshold: Duration::from_secs(600),
            ..PressTimings::default()
        }
    }

    fn spin_until<F: Fn() -> bool>(thread: &HdiThread, done: F) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !done() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        thread.stop();
    }

    #[test]
    fn move_burst_coalesces_to_latest_position() {
        let source = ScriptedSource::new(vec![vec![
            pointer_move(1, 1.0, 1.0),
            pointer_move(2, 2.0, 2.0),
            pointer_move(3, 3.0, 3.0),
        ]]);
        let thread = HdiThread::new(
            source,
            HdiConfig {
                max_queue_size: 2,
                poll_interval: Duration::from_millis(1),
                window_geometry: wide_geometry(),
                ..HdiConfig::default()
            },
        )
        .unwrap();
        thread.start().unwrap();
        spin_until(&thread, || thread.pending_count() >= 1);
        let events = thread.poll_events(10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].position(), Some((3.0, 3.0)));
    }

    #[test]
    fn keyboard_transition_is_kept_under_pointer_pressure() {
        let source = ScriptedSource::new(vec![vec![
            pointer_move(1, 1.0, 1.0),
            pointer_move(2, 2.0, 2.0),
            pointer_move(3, 3.0, 3.0),
            key_event(4, EventType::KeyDown, "a"),
        ]]);
        let thread = HdiThread::new(
            source,
            HdiConfig {
                max_queue_size: 2,
                poll_interval: Duration::from_millis(1),
                timings: no_hold_timings(),
                window_geometry: wide_geometry(),
                ..HdiConfig::default()
            },
        )
        .unwrap();
        thread.start().unwrap();
        spin_until(&thread, || thread.pending_count() >= 2);
        let events = thread.poll_events(10);
        assert_eq!(events.len(), 2);
        // The moves coalesced to the newest; the key edge was not dropped.
        assert_eq!(events[0].event_type, EventType::PointerMove);
        assert_eq!(events[0].position(), Some((3.0, 3.0)));
        assert_eq!(events[1].event_type, EventType::Press);
        assert_eq!(events[1].press_phase(), Some(PressPhase::Down));
        assert!(thread.last_error().is_none());
    }

    #[test]
    fn saturated_queue_evicts_oldest_non_keyboard_for_keyboard_edge() {
        let mut queue: VecDeque<HdiEvent> = VecDeque::new();
        let click = |id: u64| HdiEvent {
            event_id: id,
            ts_ns: id,
            window_id: "w".to_string(),
            device: Device::Mouse,
            event_type: EventType::Click,
            status: Status::Ok,
            payload: None,
        };
        enqueue(&mut queue, 2, click(1)).unwrap();
        enqueue(&mut queue, 2, click(2)).unwrap();
        let press = HdiEvent {
            event_id: 3,
            ts_ns: 3,
            window_id: "w".to_string(),
            device: Device::Keyboard,
            event_type: EventType::Press,
            status: Status::Ok,
            payload: Some(Payload::Press {
                key: "a".to_string(),
                phase: PressPhase::Down,
                active_keys: vec!["a".to_string()],
            }),
        };
        enqueue(&mut queue, 2, press).unwrap();
        let ids: Vec<u64> = queue.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn saturation_with_only_keyboard_transitions_is_fatal() {
        let source = ScriptedSource::new(vec![vec![
            key_event(1, EventType::KeyDown, "a"),
            key_event(2, EventType::KeyDown, "b"),
            key_event(3, EventType::KeyDown, "c"),
        ]]);
        let thread = HdiThread::new(
            source,
            HdiConfig {
                max_queue_size: 2,
                poll_interval: Duration::from_millis(1),
                ..HdiConfig::default()
            },
        )
        .unwrap();
        thread.start().unwrap();
        spin_until(&thread, || thread.last_error().is_some());
        assert_eq!(thread.last_error(), Some(HdiError::QueueSaturated));
    }

    #[test]
    fn inactive_window_suppresses_keyboard_and_pointer() {
        let source = ScriptedSource::new(vec![vec![
            pointer_move(1, 1.0, 2.0),
            key_event(2, EventType::KeyDown, "a"),
        ]]);
        let thread = HdiThread::new(
            source,
            HdiConfig {
                poll_interval: Duration::from_millis(1),
                window_active: Some(Box::new(|| false)),
                window_geometry: wide_geometry(),
                ..HdiConfig::default()
            },
        )
        .unwrap();
        thread.start().unwrap();
        spin_until(&thread, || thread.pending_count() >= 2);
        let events = thread.poll_events(10);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.status == Status::NotDetected));
        assert!(events.iter().all(|e| e.payload.is_none()));
    }

    #[test]
    fn poll_events_respects_max() {
        let source = ScriptedSource::new(vec![
            (1..=5)
                .map(|i| key_event(i, EventType::KeyDown, &format!("k{i}")))
                .collect(),
        ]);
        let thread = HdiThread::new(
            source,
            HdiConfig {
                poll_interval: Duration::from_millis(1),
                timings: no_hold_timings(),
                ..HdiConfig::default()
            },
        )
        .unwrap();
        thread.start().unwrap();
        spin_until(&thread, || thread.pending_count() >= 5);
        let first = thread.poll_events(2);
        let rest = thread.poll_events(10);
        assert_eq!(first.len(), 2);
        assert_eq!(rest.len(), 3);
    }

    #[test]
    fn down_up_synthesizes_press_stream_with_single() {
        let source = ScriptedSource::new(vec![vec![
            key_event(1, EventType::KeyDown, "a"),
            key_event(2, EventType::KeyUp, "a"),
        ]]);
        let thread = HdiThread::new(
            source,
            HdiConfig {
                poll_interval: Duration::from_millis(1),
                ..HdiConfig::default()
            },
        )
        .unwrap();
        thread.start().unwrap();
        spin_until(&thread, || thread.pending_count() >= 2);
        // stop() flushes the pending single.
        let phases: Vec<PressPhase> = thread
            .poll_events(20)
            .iter()
            .filter_map(HdiEvent::press_phase)
            .collect();
        assert!(phases.contains(&PressPhase::Down));
        assert!(phases.contains(&PressPhase::Up));
        assert!(phases.contains(&PressPhase::Single));
    }

    #[test]
    fn hold_phases_are_emitted_while_key_stays_down() {
        let source = ScriptedSource::new(vec![
            vec![key_event(1, EventType::KeyDown, "a")],
            Vec::new(),
            Vec::new(),
            Vec::new(),
        ]);
        let thread = HdiThread::new(
            source,
            HdiConfig {
                poll_interval: Duration::from_millis(2),
                timings: PressTimings {
                    hold_threshold: Duration::from_millis(4),
                    hold_tick_interval: Duration::from_millis(4),
                    ..PressTimings::default()
                },
                ..HdiConfig::default()
            },
        )
        .unwrap();
        thread.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        let has_phase = |phase: PressPhase| {
            move |events: &[HdiEvent]| events.iter().any(|e| e.press_phase() == Some(phase))
        };
        let mut seen: Vec<HdiEvent> = Vec::new();
        while Instant::now() < deadline {
            seen.extend(thread.poll_events(50));
            if has_phase(PressPhase::HoldStart)(&seen) && has_phase(PressPhase::HoldTick)(&seen) {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        thread.stop();
        seen.extend(thread.poll_events(50));
        assert!(has_phase(PressPhase::HoldStart)(&seen), "no hold_start");
        assert!(has_phase(PressPhase::HoldTick)(&seen), "no hold_tick");
    }

    #[test]
    fn double_press_suppresses_single() {
        let source = ScriptedSource::new(vec![vec![
            key_event(1, EventType::KeyDown, "a"),
            key_event(2, EventType::KeyUp, "a"),
            key_event(3, EventType::KeyDown, "a"),
            key_event(4, EventType::KeyUp, "a"),
        ]]);
        let thread = HdiThread::new(
            source,
            HdiConfig {
                poll_interval: Duration::from_millis(1),
                timings: PressTimings {
                    double_press_threshold: Duration::from_secs(1),
                    ..PressTimings::default()
                },
                ..HdiConfig::default()
            },
        )
        .unwrap();
        thread.start().unwrap();
        spin_until(&thread, || thread.pending_count() >= 5);
        let phases: Vec<PressPhase> = thread
            .poll_events(20)
            .iter()
            .filter_map(HdiEvent::press_phase)
            .collect();
        assert!(phases.contains(&PressPhase::Double));
        assert!(!phases.contains(&PressPhase::Single));
    }

    #[test]
    fn focus_loss_cancels_held_keys() {
        let active = Arc::new(AtomicBool::new(true));
        let active_for_provider = Arc::clone(&active);
        let source = ScriptedSource::new(vec![
            vec![key_event(1, EventType::KeyDown, "a")],
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
        ]);
        let thread = HdiThread::new(
            source,
            HdiConfig {
                poll_interval: Duration::from_millis(1),
                timings: no_hold_timings(),
                window_active: Some(Box::new(move || {
                    active_for_provider.load(Ordering::SeqCst)
                })),
                ..HdiConfig::default()
            },
        )
        .unwrap();
        thread.start().unwrap();
        spin_until(&thread, || {
            if thread.pending_count() >= 1 {
                active.store(false, Ordering::SeqCst);
            }
            thread.pending_count() >= 2
        });
        let phases: Vec<PressPhase> = thread
            .poll_events(20)
            .iter()
            .filter_map(HdiEvent::press_phase)
            .collect();
        assert!(phases.contains(&PressPhase::Down));
        assert!(phases.contains(&PressPhase::Cancel));
    }

    #[test]
    fn active_keys_reflect_simultaneous_holds() {
        let source = ScriptedSource::new(vec![vec![
            key_event(1, EventType::KeyDown, "a"),
            key_event(2, EventType::KeyDown, "b"),
        ]]);
        let thread = HdiThread::new(
            source,
            HdiConfig {
                poll_interval: Duration::from_millis(1),
                timings: no_hold_timings(),
                ..HdiConfig::default()
            },
        )
        .unwrap();
        thread.start().unwrap();
        spin_until(&thread, || thread.pending_count() >= 2);
        let events = thread.poll_events(10);
        let last_down = events
            .iter()
            .rev()
            .find(|e| e.press_phase() == Some(PressPhase::Down))
            .unwrap();
        match &last_down.payload {
            Some(Payload::Press { active_keys, .. }) => {
                assert_eq!(active_keys, &vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
