//! Capability vocabulary and grant checks.
//!
//! Capabilities are opaque strings from a closed set; unknown names are
//! logged at grant time but still routed through the decider so a newer
//! app degrades to a denial instead of a parse failure.

use std::collections::BTreeSet;

use core_hdi::Device;

pub const WINDOW_WRITE: &str = "window.write";
pub const SENSOR_WILDCARD: &str = "sensor.*";
pub const SENSOR_HIGH_PRECISION: &str = "sensor.high_precision";

/// Every capability the runtime understands.
pub const KNOWN_CAPABILITIES: [&str; 12] = [
    WINDOW_WRITE,
    "hdi.keyboard",
    "hdi.mouse",
    "hdi.trackpad",
    "sensor.thermal",
    "sensor.power",
    "sensor.motion",
    "sensor.camera",
    "sensor.microphone",
    "sensor.speaker",
    SENSOR_WILDCARD,
    SENSOR_HIGH_PRECISION,
];

pub fn is_known(capability: &str) -> bool {
    KNOWN_CAPABILITIES.contains(&capability)
}

/// Capability gating HDI delivery for `device`.
pub fn for_device(device: Device) -> &'static str {
    match device {
        Device::Keyboard => "hdi.keyboard",
        Device::Mouse => "hdi.mouse",
        Device::Trackpad => "hdi.trackpad",
    }
}

/// Whether `granted` covers reads of `sensor_type`.
///
/// Three spellings authorize a read: the wildcard, an exact grant of the
/// sensor type itself, or the `sensor.<prefix>` class derived from the
/// type's first path segment (`thermal.temperature` -> `sensor.thermal`).
pub fn covers_sensor(granted: &BTreeSet<String>, sensor_type: &str) -> bool {
    if granted.contains(SENSOR_WILDCARD) || granted.contains(sensor_type) {
        return true;
    }
    let prefix = sensor_type.split('.').next().unwrap_or(sensor_type);
    granted.contains(&format!("sensor.{prefix}"))
}
