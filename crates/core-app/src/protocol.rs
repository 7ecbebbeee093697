//! App/runtime protocol governance.
//!
//! Pure function over version strings: the runtime accepts a manifest when
//! its `protocol_version` is supported and the runtime's own protocol sits
//! inside any min/max bounds the app declares. Deprecated versions accept
//! with a warning instead of rejecting.

/// Protocol spoken by this runtime build.
pub const CURRENT_PROTOCOL_VERSION: &str = "2";

/// Versions the runtime can host. `1` is the in-process lifecycle lane,
/// `2` adds the stdio process lane.
pub const SUPPORTED_PROTOCOL_VERSIONS: [&str; 2] = ["1", "2"];

pub const DEPRECATED_PROTOCOL_VERSIONS: [&str; 0] = [];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compatibility {
    pub accepted: bool,
    pub warning: Option<String>,
}

impl Compatibility {
    fn accept() -> Self {
        Self {
            accepted: true,
            warning: None,
        }
    }

    fn reject(warning: String) -> Self {
        Self {
            accepted: false,
            warning: Some(warning),
        }
    }
}

pub fn check_compatibility(
    manifest_version: &str,
    min_runtime_version: Option<&str>,
    max_runtime_version: Option<&str>,
) -> Compatibility {
    if !SUPPORTED_PROTOCOL_VERSIONS.contains(&manifest_version) {
        return Compatibility::reject(format!(
            "unsupported app protocol_version={manifest_version}"
        ));
    }
    let current = parse_version(CURRENT_PROTOCOL_VERSION);
    if let Some(min) = min_runtime_version {
        match parse_version(min) {
            Some(bound) if current < Some(bound) => {
                return Compatibility::reject(format!(
                    "runtime protocol {CURRENT_PROTOCOL_VERSION} is below app \
                     min_runtime_protocol_version {min}"
                ));
            }
            Some(_) => {}
            None => {
                return Compatibility::reject(format!(
                    "min_runtime_protocol_version is not a version: {min}"
                ));
            }
        }
    }
    if let Some(max) = max_runtime_version {
        match parse_version(max) {
            Some(bound) if current > Some(bound) => {
                return Compatibility::reject(format!(
                    "runtime protocol {CURRENT_PROTOCOL_VERSION} is above app \
                     max_runtime_protocol_version {max}"
                ));
            }
            Some(_) => {}
            None => {
                return Compatibility::reject(format!(
                    "max_runtime_protocol_version is not a version: {max}"
                ));
            }
        }
    }
    if DEPRECATED_PROTOCOL_VERSIONS.contains(&manifest_version) {
        return Compatibility {
            accepted: true,
            warning: Some(format!(
                "app protocol_version={manifest_version} is deprecated"
            )),
        };
    }
    Compatibility::accept()
}

fn parse_version(version: &str) -> Option<u32> {
    version.trim().parse().ok()
}
