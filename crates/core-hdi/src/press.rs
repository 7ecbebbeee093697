//! Keyboard press state machine.
//!
//! The platform reports only `key_down`/`key_up`; applications consume a
//! single `press` stream with derived phases (`down`, `repeat`,
//! `hold_start`, `hold_tick`, `up`, `hold_end`, `single`, `double`,
//! `cancel`). The machine is pure: every entry point takes the caller's
//! monotonic `now`, so the HDI thread drives it from its poll clock and
//! tests drive it with synthetic instants.
//!
//! Per-key states: up (absent from the map), held (`Held`), and released
//! awaiting single/double resolution (`ReleasedPending`). `active_keys` is
//! derived from the set of held keys after the transition being reported.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::event::PressPhase;

/// Timing knobs for phase derivation. Defaults are conservative desktop
/// values; embedders tune them per platform through the HDI config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PressTimings {
    /// Held at least this long without an `up` => `hold_start`.
    pub hold_threshold: Duration,
    /// Cadence of `hold_tick` once holding.
    pub hold_tick_interval: Duration,
    /// Second `down` within this window after an `up` => `double`.
    pub double_press_threshold: Duration,
}

impl Default for PressTimings {
    fn default() -> Self {
        Self {
            hold_threshold: Duration::from_millis(500),
            hold_tick_interval: Duration::from_millis(250),
            double_press_threshold: Duration::from_millis(300),
        }
    }
}

/// One synthesized phase for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PressOut {
    pub key: String,
    pub phase: PressPhase,
    pub active_keys: Vec<String>,
}

#[derive(Debug)]
enum KeyState {
    Held {
        pressed_at: Instant,
        hold_started: bool,
        last_hold_tick: Instant,
        /// Set when this press completed a double; its release must not
        /// arm another single/double cycle.
        after_double: bool,
    },
    ReleasedPending {
        released_at: Instant,
    },
}

#[derive(Debug, Default)]
pub struct PressMachine {
    timings: PressTimings,
    keys: HashMap<String, KeyState>,
}

impl PressMachine {
    pub fn new(timings: PressTimings) -> Self {
        Self {
            timings,
            keys: HashMap::new(),
        }
    }

    /// Feed a raw `key_down`.
    pub fn key_down(&mut self, key: &str, now: Instant) -> Vec<PressOut> {
        let mut out = Vec::new();
        match self.keys.remove(key) {
            None => {
                self.insert_held(key, now, false);
                out.push(self.emit(key, PressPhase::Down));
            }
            Some(KeyState::ReleasedPending { released_at }) => {
                if now.duration_since(released_at) <= self.timings.double_press_threshold {
                    self.insert_held(key, now, true);
                    out.push(self.emit(key, PressPhase::Down));
                    out.push(self.emit(key, PressPhase::Double));
                } else {
                    // The pending single expired but no tick resolved it yet.
                    out.push(self.emit(key, PressPhase::Single));
                    self.insert_held(key, now, false);
                    out.push(self.emit(key, PressPhase::Down));
                }
            }
            Some(held @ KeyState::Held { .. }) => {
                // OS auto-repeat: an extra down with no intervening up.
                self.keys.insert(key.to_string(), held);
                out.push(self.emit(key, PressPhase::Repeat));
            }
        }
        out
    }

    /// Feed a raw `key_up`.
    pub fn key_up(&mut self, key: &str, now: Instant) -> Vec<PressOut> {
        let mut out = Vec::new();
        match self.keys.remove(key) {
            Some(KeyState::Held {
                hold_started,
                after_double,
                ..
            }) => {
                out.push(self.emit(key, PressPhase::Up));
                if hold_started {
                    out.push(self.emit(key, PressPhase::HoldEnd));
                }
                if !after_double {
                    self.keys.insert(
                        key.to_string(),
                        KeyState::ReleasedPending { released_at: now },
                    );
                }
            }
            Some(pending @ KeyState::ReleasedPending { .. }) => {
                // Spurious up while already released; keep the pending state.
                self.keys.insert(key.to_string(), pending);
            }
            None => {}
        }
        out
    }

    /// Advance timers: hold starts/ticks and single-press resolution.
    pub fn tick(&mut self, now: Instant) -> Vec<PressOut> {
        let mut out = Vec::new();
        let mut resolved_singles = Vec::new();
        for (key, state) in self.keys.iter_mut() {
            match state {
                KeyState::Held {
                    pressed_at,
                    hold_started,
                    last_hold_tick,
                    ..
                } => {
                    if !*hold_started {
                        if now.duration_since(*pressed_at) >= self.timings.hold_threshold {
                            *hold_started = true;
                            *last_hold_tick = now;
                            out.push((key.clone(), PressPhase::HoldStart));
                        }
                    } else if now.duration_since(*last_hold_tick)
                        >= self.timings.hold_tick_interval
                    {
                        *last_hold_tick = now;
                        out.push((key.clone(), PressPhase::HoldTick));
                    }
                }
                KeyState::ReleasedPending { released_at } => {
                    if now.duration_since(*released_at) > self.timings.double_press_threshold {
                        resolved_singles.push(key.clone());
                    }
                }
            }
        }
        for key in &resolved_singles {
            self.keys.remove(key);
        }
        let mut events: Vec<PressOut> = out
            .into_iter()
            .map(|(key, phase)| self.emit(&key, phase))
            .collect();
        events.extend(
            resolved_singles
                .into_iter()
                .map(|key| self.emit(&key, PressPhase::Single)),
        );
        events
    }

    /// Focus left while keys were held: cancel them and drop pending
    /// single/double resolution.
    pub fn cancel_all(&mut self) -> Vec<PressOut> {
        let mut held: Vec<String> = self
            .keys
            .iter()
            .filter(|(_, state)| matches!(state, KeyState::Held { .. }))
            .map(|(key, _)| key.clone())
            .collect();
        held.sort();
        self.keys.clear();
        held.into_iter()
            .map(|key| self.emit(&key, PressPhase::Cancel))
            .collect()
    }

    /// Resolve every pending single immediately. Called when the HDI
    /// thread shuts down so short-lived sessions still observe singles.
    pub fn flush_pending(&mut self) -> Vec<PressOut> {
        let mut pending: Vec<String> = self
            .keys
            .iter()
            .filter(|(_, state)| matches!(state, KeyState::ReleasedPending { .. }))
            .map(|(key, _)| key.clone())
            .collect();
        pending.sort();
        for key in &pending {
            self.keys.remove(key);
        }
        pending
            .into_iter()
            .map(|key| self.emit(&key, PressPhase::Single))
            .collect()
    }

    /// Sorted keys currently held down.
    pub fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .keys
            .iter()
            .filter(|(_, state)| matches!(state, KeyState::Held { .. }))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    fn insert_held(&mut self, key: &str, now: Instant, after_double: bool) {
        self.keys.insert(
            key.to_string(),
            KeyState::Held {
                pressed_at: now,
                hold_started: false,
                last_hold_tick: now,
                after_double,
            },
        );
    }

    fn emit(&self, key: &str, phase: PressPhase) -> PressOut {
        PressOut {
            key: key.to_string(),
            phase,
            active_keys: self.active_keys(),
        }
    }
}
