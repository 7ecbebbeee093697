//! Event source boundary.

use std::collections::VecDeque;

use crate::event::RawHdiEvent;

/// Platform input reader polled by the HDI thread. Implementations report
/// events in whatever shape the OS hands them; normalization happens in
/// the thread, not here.
pub trait HdiSource: Send {
    fn poll(&mut self, window_active: bool, ts_ns: u64) -> Vec<RawHdiEvent>;
}

/// Source that never reports anything; the headless default.
#[derive(Debug, Default)]
pub struct NoopSource;

impl HdiSource for NoopSource {
    fn poll(&mut self, _window_active: bool, _ts_ns: u64) -> Vec<RawHdiEvent> {
        Vec::new()
    }
}

/// Plays back pre-scripted bursts, one burst per poll. Used by tests and
/// headless runs that want deterministic input.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    bursts: VecDeque<Vec<RawHdiEvent>>,
}

impl ScriptedSource {
    pub fn new(bursts: Vec<Vec<RawHdiEvent>>) -> Self {
        Self {
            bursts: bursts.into(),
        }
    }
}

impl HdiSource for ScriptedSource {
    fn poll(&mut self, _window_active: bool, _ts_ns: u64) -> Vec<RawHdiEvent> {
        self.bursts.pop_front().unwrap_or_default()
    }
}
