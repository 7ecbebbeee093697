//! HDI event model.
//!
//! Raw events enter from an [`HdiSource`](crate::HdiSource) in whatever
//! coordinate space the platform reports; the HDI thread normalizes them
//! into [`HdiEvent`]s whose pointer positions are window-local `screen_tl`
//! coordinates and whose payloads carry only the whitelisted fields.

/// Input device class an event originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Keyboard,
    Mouse,
    Trackpad,
}

impl Device {
    pub fn is_pointer(self) -> bool {
        matches!(self, Device::Mouse | Device::Trackpad)
    }
}

/// Delivery status. Only `Ok` events carry a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    NotDetected,
    Unavailable,
    Denied,
}

/// Closed set of event kinds the runtime understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    PointerMove,
    Click,
    Tap,
    Scroll,
    Pressure,
    Magnify,
    Rotate,
    KeyDown,
    KeyUp,
    /// Synthesized by the keyboard press machine; never produced by sources.
    Press,
}

impl EventType {
    /// Move, click, tap, and scroll are meaningless without a position.
    pub fn requires_position(self) -> bool {
        matches!(
            self,
            EventType::PointerMove | EventType::Click | EventType::Tap | EventType::Scroll
        )
    }

    pub fn is_move(self) -> bool {
        matches!(self, EventType::PointerMove)
    }
}

/// Phase of a synthesized `press` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressPhase {
    Down,
    Repeat,
    HoldStart,
    HoldTick,
    Up,
    HoldEnd,
    Single,
    Double,
    Cancel,
}

/// Optional pointer fields that survive normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointerExtras {
    pub button: Option<u8>,
    pub delta_x: Option<f64>,
    pub delta_y: Option<f64>,
    pub pressure: Option<f64>,
    pub stage: Option<i32>,
    pub magnification: Option<f64>,
    pub rotation: Option<f64>,
    pub click_count: Option<u32>,
    pub phase: Option<String>,
}

impl PointerExtras {
    pub fn is_empty(&self) -> bool {
        self.button.is_none()
            && self.delta_x.is_none()
            && self.delta_y.is_none()
            && self.pressure.is_none()
            && self.stage.is_none()
            && self.magnification.is_none()
            && self.rotation.is_none()
            && self.click_count.is_none()
            && self.phase.is_none()
    }
}

/// Payload of a raw source event, pre-normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    Pointer {
        /// Absolute screen position; converted to window-local by the
        /// normalization pipeline.
        screen_position: Option<(f64, f64)>,
        /// Already window-local position.
        position: Option<(f64, f64)>,
        extras: PointerExtras,
    },
    Key { key: String },
}

/// Event as reported by a platform source.
#[derive(Debug, Clone, PartialEq)]
pub struct RawHdiEvent {
    pub event_id: u64,
    pub ts_ns: u64,
    pub window_id: String,
    pub device: Device,
    pub event_type: EventType,
    pub status: Status,
    pub payload: Option<RawPayload>,
}

/// Normalized payload; the only shapes the app boundary ever sees.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Pointer {
        /// Window-local (or target-extent) `screen_tl` position.
        position: Option<(f64, f64)>,
        extras: PointerExtras,
    },
    Press {
        key: String,
        phase: PressPhase,
        /// Sorted set of keys currently held, after this event's effect.
        active_keys: Vec<String>,
    },
}

/// Normalized event delivered through [`poll_events`](crate::HdiThread::poll_events).
#[derive(Debug, Clone, PartialEq)]
pub struct HdiEvent {
    pub event_id: u64,
    pub ts_ns: u64,
    pub window_id: String,
    pub device: Device,
    pub event_type: EventType,
    pub status: Status,
    pub payload: Option<Payload>,
}

impl HdiEvent {
    /// Rewrite to a payload-free terminal status, preserving identity.
    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self.payload = None;
        self
    }

    /// Pointer position, when this is an `Ok` pointer event carrying one.
    pub fn position(&self) -> Option<(f64, f64)> {
        match &self.payload {
            Some(Payload::Pointer { position, .. }) => *position,
            _ => None,
        }
    }

    /// Press phase, when this is a synthesized press event.
    pub fn press_phase(&self) -> Option<PressPhase> {
        match &self.payload {
            Some(Payload::Press { phase, .. }) => Some(*phase),
            _ => None,
        }
    }

    pub(crate) fn is_keyboard_transition(&self) -> bool {
        if self.device != Device::Keyboard {
            return false;
        }
        match self.event_type {
            EventType::KeyDown | EventType::KeyUp => true,
            EventType::Press => matches!(
                self.press_phase(),
                Some(PressPhase::Down | PressPhase::Up | PressPhase::Cancel)
            ),
            _ => false,
        }
    }
}
