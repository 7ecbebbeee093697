//! Pointer normalization pipeline.
//!
//! Stages, in order: active-window gating, screen-to-window conversion,
//! window bounds check, content-rect (letterbox) cutoff, target-extent
//! projection, payload whitelisting. Output coordinates are window-local
//! `screen_tl`; the app context applies any further frame transform.

use crate::event::{HdiEvent, Payload, RawHdiEvent, RawPayload, Status};

/// Window placement in screen coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowGeometry {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl Default for WindowGeometry {
    fn default() -> Self {
        Self {
            left: 0.0,
            top: 0.0,
            width: 1.0,
            height: 1.0,
        }
    }
}

/// Inset content area inside the window (preserve-aspect presentation).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContentRect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

pub(crate) fn normalize_pointer(
    event: RawHdiEvent,
    active: bool,
    geometry: WindowGeometry,
    target_extent: Option<(f64, f64)>,
    content_rect: Option<ContentRect>,
) -> HdiEvent {
    let requires_position = event.event_type.requires_position();
    let base = HdiEvent {
        event_id: event.event_id,
        ts_ns: event.ts_ns,
        window_id: event.window_id.clone(),
        device: event.device,
        event_type: event.event_type,
        status: event.status,
        payload: None,
    };
    if !active {
        return base.with_status(Status::NotDetected);
    }
    let (screen_position, position, extras) = match event.payload {
        Some(RawPayload::Pointer {
            screen_position,
            position,
            extras,
        }) => (screen_position, position, extras),
        // A key payload on a pointer device is malformed input.
        Some(RawPayload::Key { .. }) => return base.with_status(Status::NotDetected),
        None if requires_position => return base.with_status(Status::NotDetected),
        None => return base,
    };
    if geometry.width <= 0.0 || geometry.height <= 0.0 {
        return base.with_status(Status::NotDetected);
    }
    let local = match (screen_position, position) {
        (Some((sx, sy)), _) => Some((sx - geometry.left, sy - geometry.top)),
        (None, Some(xy)) => Some(xy),
        (None, None) => None,
    };
    if let Some((x, y)) = local
        && (!x.is_finite() || !y.is_finite())
    {
        return base.with_status(Status::NotDetected);
    }
    if requires_position && local.is_none() {
        return base.with_status(Status::NotDetected);
    }
    let mut projected = None;
    if let Some((x, y)) = local {
        if x < 0.0 || y < 0.0 || x >= geometry.width || y >= geometry.height {
            return base.with_status(Status::NotDetected);
        }
        // With an inset content rect, positions outside it are dead space
        // and positions inside are re-based onto the rect.
        let (x, y, source_w, source_h) = match content_rect {
            Some(rect) => {
                if x < rect.left
                    || y < rect.top
                    || x >= rect.left + rect.width
                    || y >= rect.top + rect.height
                {
                    return base.with_status(Status::NotDetected);
                }
                (x - rect.left, y - rect.top, rect.width, rect.height)
            }
            None => (x, y, geometry.width, geometry.height),
        };
        projected = Some(match target_extent {
            Some((tw, th)) => (
                project_axis(x, source_w, tw),
                project_axis(y, source_h, th),
            ),
            None => (x, y),
        });
    }
    if projected.is_none() && extras.is_empty() {
        return base.with_status(Status::NotDetected);
    }
    HdiEvent {
        status: Status::Ok,
        payload: Some(Payload::Pointer {
            position: projected,
            extras,
        }),
        ..base
    }
}

/// Linear projection preserving `[0, extent-1]` on both ends.
fn project_axis(value: f64, source_extent: f64, target_extent: f64) -> f64 {
    if source_extent <= 1.0 || target_extent <= 0.0 {
        return 0.0;
    }
    value * (target_extent - 1.0) / (source_extent - 1.0)
}

#[cfg(test)]
mod tests {
    use crate::event::{Device, EventType, PointerExtras};

    use super::*;

    fn raw_move(screen: Option<(f64, f64)>, local: Option<(f64, f64)>) -> RawHdiEvent {
        RawHdiEvent {
            event_id: 1,
            ts_ns: 1,
            window_id: "w".to_string(),
            device: Device::Mouse,
            event_type: EventType::PointerMove,
            status: Status::Ok,
            payload: Some(RawPayload::Pointer {
                screen_position: screen,
                position: local,
                extras: PointerExtras::default(),
            }),
        }
    }

    fn geometry(left: f64, top: f64, width: f64, height: f64) -> WindowGeometry {
        WindowGeometry {
            left,
            top,
            width,
            height,
        }
    }

    #[test]
    fn screen_coordinates_become_window_local() {
        let event = normalize_pointer(
            raw_move(Some((150.0, 260.0)), None),
            true,
            geometry(100.0, 200.0, 300.0, 200.0),
            None,
            None,
        );
        assert_eq!(event.status, Status::Ok);
        assert_eq!(event.position(), Some((50.0, 60.0)));
    }

    #[test]
    fn out_of_window_position_is_not_detected() {
        let event = normalize_pointer(
            raw_move(Some((1000.0, 1000.0)), None),
            true,
            geometry(100.0, 200.0, 300.0, 200.0),
            None,
            None,
        );
        assert_eq!(event.status, Status::NotDetected);
        assert!(event.payload.is_none());
    }

    #[test]
    fn projection_preserves_extent_corners() {
        let event = normalize_pointer(
            raw_move(None, Some((199.0, 99.0))),
            true,
            geometry(0.0, 0.0, 200.0, 100.0),
            Some((100.0, 50.0)),
            None,
        );
        let (x, y) = event.position().unwrap();
        assert!((x - 99.0).abs() < 1e-9);
        assert!((y - 49.0).abs() < 1e-9);
    }

    #[test]
    fn letterbox_region_is_dead_space() {
        let event = normalize_pointer(
            raw_move(None, Some((10.0, 10.0))),
            true,
            geometry(0.0, 0.0, 300.0, 200.0),
            Some((100.0, 100.0)),
            Some(ContentRect {
                left: 50.0,
                top: 20.0,
                width: 200.0,
                height: 160.0,
            }),
        );
        assert_eq!(event.status, Status::NotDetected);
    }

    #[test]
    fn content_rect_rebases_before_projection() {
        let event = normalize_pointer(
            raw_move(None, Some((50.0, 20.0))),
            true,
            geometry(0.0, 0.0, 300.0, 200.0),
            Some((100.0, 100.0)),
            Some(ContentRect {
                left: 50.0,
                top: 20.0,
                width: 200.0,
                height: 160.0,
            }),
        );
        assert_eq!(event.position(), Some((0.0, 0.0)));
    }

    #[test]
    fn inactive_window_suppresses_even_non_positional_events() {
        let mut raw = raw_move(None, None);
        raw.event_type = EventType::Pressure;
        raw.payload = Some(RawPayload::Pointer {
            screen_position: None,
            position: None,
            extras: PointerExtras {
                pressure: Some(0.7),
                ..PointerExtras::default()
            },
        });
        let event = normalize_pointer(raw, false, WindowGeometry::default(), None, None);
        assert_eq!(event.status, Status::NotDetected);
        assert!(event.payload.is_none());
    }

    #[test]
    fn non_positional_event_passes_with_extras_only() {
        let mut raw = raw_move(None, None);
        raw.event_type = EventType::Pressure;
        raw.payload = Some(RawPayload::Pointer {
            screen_position: None,
            position: None,
            extras: PointerExtras {
                pressure: Some(0.7),
                stage: Some(2),
                ..PointerExtras::default()
            },
        });
        let event = normalize_pointer(
            raw,
            true,
            geometry(0.0, 0.0, 300.0, 200.0),
            None,
            None,
        );
        assert_eq!(event.status, Status::Ok);
        match event.payload {
            Some(Payload::Pointer { position, extras }) => {
                assert_eq!(position, None);
                assert_eq!(extras.pressure, Some(0.7));
                assert_eq!(extras.stage, Some(2));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn non_finite_position_is_not_detected() {
        let event = normalize_pointer(
            raw_move(None, Some((f64::NAN, 4.0))),
            true,
            geometry(0.0, 0.0, 300.0, 200.0),
            None,
            None,
        );
        assert_eq!(event.status, Status::NotDetected);
        assert!(event.payload.is_none());
    }

    #[test]
    fn positional_event_without_position_is_not_detected() {
        let event = normalize_pointer(
            raw_move(None, None),
            true,
            geometry(0.0, 0.0, 300.0, 200.0),
            None,
            None,
        );
        assert_eq!(event.status, Status::NotDetected);
    }
}
