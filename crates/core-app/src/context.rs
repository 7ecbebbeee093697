//! Per-run app context: the sole boundary between an application and the
//! runtime.
//!
//! Grants are frozen at construction. Matrix writes require
//! `window.write` and violations are hard errors; everything else is
//! encoded in event/sample statuses so an app can keep running with
//! whatever it was actually granted.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use core_audit::{AuditRow, AuditSink, NullSink};
use core_frames::{Extent, Frame};
use core_hdi::{HdiEvent, HdiThread, Payload, Status};
use core_matrix::{CommitEvent, Rgba8, RgbaF, WindowMatrix, WriteBatch, WriteOp};
use core_sensors::{
    FieldValue, SampleStatus, SensorManager, SensorSample, SensorValue,
};
use tracing::debug;

use crate::capability::{self, SENSOR_HIGH_PRECISION, WINDOW_WRITE};
use crate::ui::{UiComponent, UiFrameRenderer};
use crate::AppError;

pub const DEFAULT_SENSOR_READ_MIN_INTERVAL: Duration = Duration::from_millis(200);

pub struct AppContext {
    matrix: Arc<WindowMatrix>,
    hdi: Arc<HdiThread>,
    sensors: Arc<SensorManager>,
    granted: BTreeSet<String>,
    audit: Arc<dyn AuditSink>,
    sensor_read_min_interval: Duration,
    last_sensor_read: HashMap<String, Instant>,
    default_frame: Frame,
    ui_frame: Option<Box<dyn UiFrameRenderer>>,
}

impl AppContext {
    pub fn new(
        matrix: Arc<WindowMatrix>,
        hdi: Arc<HdiThread>,
        sensors: Arc<SensorManager>,
        granted: BTreeSet<String>,
    ) -> Self {
        Self::with_audit(matrix, hdi, sensors, granted, Arc::new(NullSink))
    }

    pub fn with_audit(
        matrix: Arc<WindowMatrix>,
        hdi: Arc<HdiThread>,
        sensors: Arc<SensorManager>,
        granted: BTreeSet<String>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            matrix,
            hdi,
            sensors,
            granted,
            audit,
            sensor_read_min_interval: DEFAULT_SENSOR_READ_MIN_INTERVAL,
            last_sensor_read: HashMap::new(),
            default_frame: Frame::default(),
            ui_frame: None,
        }
    }

    pub fn set_sensor_read_min_interval(&mut self, interval: Duration) {
        self.sensor_read_min_interval = interval;
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.granted.contains(capability)
    }

    pub fn granted_capabilities(&self) -> &BTreeSet<String> {
        &self.granted
    }

    pub fn matrix_extent(&self) -> Extent {
        Extent::new(self.matrix.width(), self.matrix.height())
    }

    /// Submit a write batch; requires `window.write`.
    pub fn submit_write_batch(&self, batch: &WriteBatch) -> Result<CommitEvent, AppError> {
        self.require_capability(WINDOW_WRITE)?;
        Ok(self.matrix.submit_write_batch(batch)?)
    }

    /// Always-allowed deep copy of the matrix.
    pub fn read_matrix_snapshot(&self) -> Vec<Rgba8> {
        self.matrix.snapshot()
    }

    /// Drain HDI events in the context's default frame.
    pub fn poll_hdi_events(&mut self, max: usize) -> Vec<HdiEvent> {
        let frame = self.default_frame;
        self.poll_hdi_events_in(max, frame)
    }

    /// Drain HDI events with a per-call frame override.
    pub fn poll_hdi_events_in(&mut self, max: usize, frame: Frame) -> Vec<HdiEvent> {
        let extent = self.matrix_extent();
        self.hdi
            .poll_events(max)
            .into_iter()
            .map(|event| self.gate_hdi_event(event, frame, extent))
            .collect()
    }

    /// Cached sensor sample, gated by capability and per-type read rate,
    /// precision-sanitized unless `sensor.high_precision` was granted.
    pub fn read_sensor(&mut self, sensor_type: &str) -> SensorSample {
        if !capability::covers_sensor(&self.granted, sensor_type) {
            self.audit_sensor_denial("sensor_denied_capability", sensor_type);
            return denied_sample(sensor_type);
        }
        let now = Instant::now();
        if let Some(last) = self.last_sensor_read.get(sensor_type)
            && now.duration_since(*last) < self.sensor_read_min_interval
        {
            self.audit_sensor_denial("sensor_denied_rate_limit", sensor_type);
            return denied_sample(sensor_type);
        }
        self.last_sensor_read.insert(sensor_type.to_string(), now);
        let sample = self.sensors.read_sensor(sensor_type);
        if self.granted.contains(SENSOR_HIGH_PRECISION) {
            sample
        } else {
            sanitize_precision(sample)
        }
    }

    pub fn default_coordinate_frame(&self) -> Frame {
        self.default_frame
    }

    /// Switch the frame used for event output and the coord helpers.
    pub fn set_default_coordinate_frame(&mut self, frame: Frame) {
        debug!(target: "app.context", %frame, "default coordinate frame changed");
        self.default_frame = frame;
    }

    /// Map a point in the current default frame to render (`screen_tl`)
    /// coordinates.
    pub fn to_render_coords(&self, x: f64, y: f64) -> (f64, f64) {
        self.default_frame.to_screen_tl(self.matrix_extent(), x, y)
    }

    /// Map a render (`screen_tl`) point into the current default frame.
    pub fn from_render_coords(&self, x: f64, y: f64) -> (f64, f64) {
        self.default_frame
            .from_screen_tl(self.matrix_extent(), x, y)
    }

    /// Open a batched UI frame on `renderer`, cleared to `clear_color`.
    pub fn begin_ui_frame(
        &mut self,
        mut renderer: Box<dyn UiFrameRenderer>,
        clear_color: RgbaF,
    ) {
        renderer.begin(self.matrix.width(), self.matrix.height(), clear_color);
        self.ui_frame = Some(renderer);
    }

    pub fn mount_component(&mut self, component: &UiComponent) -> Result<(), AppError> {
        let renderer = self.ui_frame.as_mut().ok_or(AppError::UiFrameNotBegun)?;
        renderer.mount(component)
    }

    /// Compose the mounted components and submit them as one full-frame
    /// write. Requires `window.write`.
    pub fn finalize_ui_frame(&mut self) -> Result<CommitEvent, AppError> {
        let mut renderer = self.ui_frame.take().ok_or(AppError::UiFrameNotBegun)?;
        let pixels = renderer.compose()?;
        self.submit_write_batch(&WriteBatch::single(WriteOp::FullRewrite(pixels)))
    }

    fn require_capability(&self, capability: &str) -> Result<(), AppError> {
        if self.granted.contains(capability) {
            Ok(())
        } else {
            Err(AppError::MissingCapability(capability.to_string()))
        }
    }

    fn gate_hdi_event(&self, event: HdiEvent, frame: Frame, extent: Extent) -> HdiEvent {
        if !self.granted.contains(capability::for_device(event.device)) {
            return event.with_status(Status::Denied);
        }
        if frame == Frame::ScreenTl {
            return event;
        }
        reframe_pointer(event, frame, extent)
    }

    fn audit_sensor_denial(&self, action: &str, sensor_type: &str) {
        self.audit
            .log(&AuditRow::new(action, "app_context").with_sensor_type(sensor_type));
    }
}

fn reframe_pointer(mut event: HdiEvent, frame: Frame, extent: Extent) -> HdiEvent {
    if let Some(Payload::Pointer { position, .. }) = &mut event.payload
        && let Some((x, y)) = position
    {
        let (fx, fy) = frame.from_screen_tl(extent, *x, *y);
        *position = Some((fx, fy));
    }
    event
}

fn denied_sample(sensor_type: &str) -> SensorSample {
    SensorSample {
        sample_id: 0,
        ts_ns: now_ts_ns(),
        sensor_type: sensor_type.to_string(),
        status: SampleStatus::Denied,
        value: None,
        unit: None,
    }
}

/// Coarsen values for apps without the high-precision grant: thermal to
/// 0.5 °C steps, power electricals to one decimal, motion components to
/// integers, device metadata down to availability and counts.
fn sanitize_precision(mut sample: SensorSample) -> SensorSample {
    if sample.status != SampleStatus::Ok {
        return sample;
    }
    let Some(value) = sample.value.take() else {
        return sample;
    };
    let sensor_type = sample.sensor_type.clone();
    let sanitized = match (sensor_type.as_str(), value) {
        ("thermal.temperature", SensorValue::Scalar(v)) => {
            SensorValue::Scalar((v * 2.0).round() / 2.0)
        }
        ("power.voltage_current", SensorValue::Record(fields)) => SensorValue::Record(
            fields
                .into_iter()
                .map(|(k, v)| (k, round_number(v, 10.0)))
                .collect(),
        ),
        ("sensor.motion", SensorValue::Record(fields)) => SensorValue::Record(
            fields
                .into_iter()
                .map(|(k, v)| (k, round_number(v, 1.0)))
                .collect(),
        ),
        (st, SensorValue::Record(fields)) if st.ends_with(".device") => SensorValue::Record(
            fields
                .into_iter()
                .filter(|(k, _)| k == "available" || k == "device_count")
                .collect(),
        ),
        (_, other) => other,
    };
    sample.value = Some(sanitized);
    sample
}

fn round_number(value: FieldValue, scale: f64) -> FieldValue {
    match value {
        FieldValue::Number(v) => FieldValue::Number((v * scale).round() / scale),
        flag => flag,
    }
}

fn now_ts_ns() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
