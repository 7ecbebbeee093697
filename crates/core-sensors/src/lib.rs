//! Polled sensor manager with consent, safety, and audit gates.
//!
//! One worker thread samples every enabled sensor at a fixed interval and
//! caches the newest [`SensorSample`] per type; readers only ever see the
//! cache, so `read_sensor` never blocks on an OS call. Policy lives here,
//! not in providers: enabling a non-default sensor needs consent, disabling
//! a default sensor needs the safety guard's permission, and every state
//! transition lands in the audit sink.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use core_audit::{AuditRow, AuditSink, NullSink};
use thiserror::Error;
use tracing::{debug, error};

/// Sensor types sampled without explicit consent.
pub const DEFAULT_ENABLED_SENSORS: [&str; 2] = ["thermal.temperature", "power.voltage_current"];

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Read outcome taxonomy surfaced by providers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SensorReadError {
    #[error("sensor read denied: {0}")]
    Denied(String),
    #[error("sensor read unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SensorError {
    #[error("sensor config invalid: {0}")]
    InvalidConfig(&'static str),
    #[error("fallback provider list must not be empty")]
    EmptyFallback,
    #[error("sensor worker spawn failed: {0}")]
    Spawn(String),
}

/// One field inside a record-shaped sensor value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Number(f64),
    Flag(bool),
}

/// Scalar reading or a named record (voltage/current, xyz, device
/// availability metadata).
#[derive(Debug, Clone, PartialEq)]
pub enum SensorValue {
    Scalar(f64),
    Record(BTreeMap<String, FieldValue>),
}

impl SensorValue {
    pub fn record(fields: impl IntoIterator<Item = (&'static str, FieldValue)>) -> Self {
        SensorValue::Record(
            fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            SensorValue::Scalar(v) => Some(*v),
            SensorValue::Record(_) => None,
        }
    }

    pub fn field(&self, name: &str) -> Option<FieldValue> {
        match self {
            SensorValue::Record(fields) => fields.get(name).copied(),
            SensorValue::Scalar(_) => None,
        }
    }

    pub fn number_field(&self, name: &str) -> Option<f64> {
        match self.field(name) {
            Some(FieldValue::Number(v)) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleStatus {
    Ok,
    Disabled,
    Unavailable,
    Denied,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorSample {
    pub sample_id: u64,
    pub ts_ns: u64,
    pub sensor_type: String,
    pub status: SampleStatus,
    pub value: Option<SensorValue>,
    pub unit: Option<String>,
}

/// Platform reader for one sensor type. Called only from the manager's
/// worker thread; may block on OS calls.
pub trait SensorProvider: Send {
    fn read(&mut self) -> Result<(SensorValue, String), SensorReadError>;
}

/// Fixed-value provider for tests and headless embeddings.
pub struct StaticProvider {
    value: SensorValue,
    unit: String,
}

impl StaticProvider {
    pub fn new(value: SensorValue, unit: impl Into<String>) -> Self {
        Self {
            value,
            unit: unit.into(),
        }
    }
}

impl SensorProvider for StaticProvider {
    fn read(&mut self) -> Result<(SensorValue, String), SensorReadError> {
        Ok((self.value.clone(), self.unit.clone()))
    }
}

/// Tries providers in order; first success wins, all failures surface as
/// `Unavailable`.
pub struct FallbackProvider {
    providers: Vec<Box<dyn SensorProvider>>,
}

impl FallbackProvider {
    pub fn new(providers: Vec<Box<dyn SensorProvider>>) -> Result<Self, SensorError> {
        if providers.is_empty() {
            return Err(SensorError::EmptyFallback);
        }
        Ok(Self { providers })
    }
}

impl SensorProvider for FallbackProvider {
    fn read(&mut self) -> Result<(SensorValue, String), SensorReadError> {
        let mut last = None;
        for provider in &mut self.providers {
            match provider.read() {
                Ok(sample) => return Ok(sample),
                Err(err) => last = Some(err),
            }
        }
        Err(match last {
            Some(SensorReadError::Denied(reason)) => SensorReadError::Denied(reason),
            Some(SensorReadError::Unavailable(reason)) => SensorReadError::Unavailable(reason),
            None => SensorReadError::Unavailable("all fallback providers failed".to_string()),
        })
    }
}

/// Decides whether a sensor type may be switched on. `enable` is always
/// true today; it is part of the signature so embedders can distinguish
/// future revoke flows.
pub type ConsentProvider = Box<dyn Fn(&str, bool) -> bool + Send + Sync>;
/// Permits or refuses disabling a default-enabled sensor.
pub type SafetyDisableGuard = Box<dyn Fn(&str) -> bool + Send + Sync>;

pub struct SensorManagerConfig {
    pub poll_interval: Duration,
    pub consent: Option<ConsentProvider>,
    pub safety_guard: Option<SafetyDisableGuard>,
    pub audit: Arc<dyn AuditSink>,
}

impl Default for SensorManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            consent: None,
            safety_guard: None,
            audit: Arc::new(NullSink),
        }
    }
}

struct SensorState {
    enabled: HashMap<String, bool>,
    denied: HashSet<String>,
    samples: HashMap<String, SensorSample>,
    next_sample_id: u64,
}

struct Shared {
    state: Mutex<SensorState>,
    running: AtomicBool,
}

pub struct SensorManager {
    shared: Arc<Shared>,
    providers: Arc<Mutex<HashMap<String, Box<dyn SensorProvider>>>>,
    consent: ConsentProvider,
    safety_guard: SafetyDisableGuard,
    audit: Arc<dyn AuditSink>,
    poll_interval: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SensorManager {
    pub fn new(
        providers: HashMap<String, Box<dyn SensorProvider>>,
        config: SensorManagerConfig,
    ) -> Result<Self, SensorError> {
        if config.poll_interval.is_zero() {
            return Err(SensorError::InvalidConfig("poll_interval must be > 0"));
        }
        let enabled = providers
            .keys()
            .map(|sensor_type| {
                (
                    sensor_type.clone(),
                    DEFAULT_ENABLED_SENSORS.contains(&sensor_type.as_str()),
                )
            })
            .collect();
        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SensorState {
                    enabled,
                    denied: HashSet::new(),
                    samples: HashMap::new(),
                    next_sample_id: 1,
                }),
                running: AtomicBool::new(false),
            }),
            providers: Arc::new(Mutex::new(providers)),
            consent: config.consent.unwrap_or_else(|| Box::new(|_, _| true)),
            safety_guard: config.safety_guard.unwrap_or_else(|| Box::new(|_| true)),
            audit: config.audit,
            poll_interval: config.poll_interval,
            handle: Mutex::new(None),
        })
    }

    pub fn start(&self) -> Result<(), SensorError> {
        let mut handle = lock(&self.handle);
        if handle.is_some() {
            return Ok(());
        }
        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let providers = Arc::clone(&self.providers);
        let poll_interval = self.poll_interval;
        let joiner = std::thread::Builder::new()
            .name("luvatrix-sensors".to_string())
            .spawn(move || run_worker(&shared, &providers, poll_interval))
            .map_err(|e| SensorError::Spawn(e.to_string()))?;
        *handle = Some(joiner);
        Ok(())
    }

    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = lock(&self.handle).take()
            && handle.join().is_err()
        {
            error!(target: "sensors.thread", "worker panicked");
        }
    }

    pub fn enabled_sensors(&self) -> Vec<String> {
        let state = lock(&self.shared.state);
        let mut out: Vec<String> = state
            .enabled
            .iter()
            .filter(|(_, on)| **on)
            .map(|(k, _)| k.clone())
            .collect();
        out.sort();
        out
    }

    /// Enable or disable a sensor type, enforcing consent and the safety
    /// guard. Returns whether the request took effect.
    pub fn set_sensor_enabled(&self, sensor_type: &str, enabled: bool, actor: &str) -> bool {
        let is_default = DEFAULT_ENABLED_SENSORS.contains(&sensor_type);
        if enabled {
            if !is_default && !(self.consent)(sensor_type, true) {
                let mut state = lock(&self.shared.state);
                state.denied.insert(sensor_type.to_string());
                drop(state);
                self.audit("enable_denied", sensor_type, actor);
                return false;
            }
            let mut state = lock(&self.shared.state);
            state.enabled.insert(sensor_type.to_string(), true);
            state.denied.remove(sensor_type);
            drop(state);
            self.audit("enabled", sensor_type, actor);
            return true;
        }
        if is_default && !(self.safety_guard)(sensor_type) {
            self.audit("disable_denied", sensor_type, actor);
            return false;
        }
        let mut state = lock(&self.shared.state);
        state.enabled.insert(sensor_type.to_string(), false);
        // Disabling invalidates the cache for the type.
        state.samples.remove(sensor_type);
        drop(state);
        self.audit("disabled", sensor_type, actor);
        true
    }

    /// Most recent cached sample for `sensor_type`, or a status-only
    /// sample describing why none exists.
    pub fn read_sensor(&self, sensor_type: &str) -> SensorSample {
        let has_provider = lock(&self.providers).contains_key(sensor_type);
        let mut state = lock(&self.shared.state);
        if !has_provider && !state.enabled.contains_key(sensor_type) {
            return status_sample(&mut state, sensor_type, SampleStatus::Unavailable);
        }
        if state.denied.contains(sensor_type) {
            return status_sample(&mut state, sensor_type, SampleStatus::Denied);
        }
        if !state.enabled.get(sensor_type).copied().unwrap_or(false) {
            return status_sample(&mut state, sensor_type, SampleStatus::Disabled);
        }
        if !has_provider {
            return status_sample(&mut state, sensor_type, SampleStatus::Unavailable);
        }
        match state.samples.get(sensor_type) {
            Some(sample) => sample.clone(),
            None => status_sample(&mut state, sensor_type, SampleStatus::Unavailable),
        }
    }

    fn audit(&self, action: &str, sensor_type: &str, actor: &str) {
        self.audit
            .log(&AuditRow::new(action, actor).with_sensor_type(sensor_type));
    }
}

fn run_worker(
    shared: &Shared,
    providers: &Mutex<HashMap<String, Box<dyn SensorProvider>>>,
    poll_interval: Duration,
) {
    debug!(target: "sensors.thread", "worker started");
    while shared.running.load(Ordering::SeqCst) {
        let enabled: Vec<String> = {
            let state = lock(&shared.state);
            state
                .enabled
                .iter()
                .filter(|(_, on)| **on)
                .map(|(k, _)| k.clone())
                .collect()
        };
        for sensor_type in enabled {
            // Provider reads may block on OS calls; the state lock is not
            // held across them.
            let outcome = {
                let mut providers = lock(providers);
                match providers.get_mut(&sensor_type) {
                    Some(provider) => Some(provider.read()),
                    None => None,
                }
            };
            let (status, value, unit) = match outcome {
                Some(Ok((value, unit))) => (SampleStatus::Ok, Some(value), Some(unit)),
                Some(Err(SensorReadError::Denied(_))) => (SampleStatus::Denied, None, None),
                Some(Err(SensorReadError::Unavailable(_))) => {
                    (SampleStatus::Unavailable, None, None)
                }
                None => (SampleStatus::Unavailable, None, None),
            };
            let mut state = lock(&shared.state);
            let sample_id = state.next_sample_id;
            state.next_sample_id += 1;
            state.samples.insert(
                sensor_type.clone(),
                SensorSample {
                    sample_id,
                    ts_ns: now_ts_ns(),
                    sensor_type: sensor_type.clone(),
                    status,
                    value,
                    unit,
                },
            );
        }
        std::thread::sleep(poll_interval);
    }
    debug!(target: "sensors.thread", "worker stopped");
}

fn status_sample(
    state: &mut SensorState,
    sensor_type: &str,
    status: SampleStatus,
) -> SensorSample {
    let sample_id = state.next_sample_id;
    state.next_sample_id += 1;
    SensorSample {
        sample_id,
        ts_ns: now_ts_ns(),
        sensor_type: sensor_type.to_string(),
        status,
        value: None,
        unit: None,
    }
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
