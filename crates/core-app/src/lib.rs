//! App loading, capability enforcement, and the app<->runtime boundary.

use thiserror::Error;

mod capability;
mod context;
mod lifecycle;
mod manifest;
mod process;
mod protocol;
mod runtime;
mod ui;

pub use capability::{
    KNOWN_CAPABILITIES, SENSOR_HIGH_PRECISION, SENSOR_WILDCARD, WINDOW_WRITE, covers_sensor,
    for_device, is_known,
};
pub use context::{AppContext, DEFAULT_SENSOR_READ_MIN_INTERVAL};
pub use lifecycle::{AppLifecycle, EntrypointRegistry, LifecycleFactory};
pub use manifest::{
    AppManifest, MANIFEST_FILE_NAME, ManifestError, ResolvedVariant, RuntimeSection, VariantSpec,
    parse_entrypoint, resolve_variant,
};
pub use process::{ProcessLifecycle, STDIO_JSONL_TRANSPORT};
pub use protocol::{
    CURRENT_PROTOCOL_VERSION, Compatibility, SUPPORTED_PROTOCOL_VERSIONS, check_compatibility,
};
pub use runtime::{AppRuntime, CapabilityDecider, RunOptions};
pub use ui::{SolidFrameRenderer, UiComponent, UiFrameRenderer};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("missing capability: {0}")]
    MissingCapability(String),
    #[error("required capabilities denied: {0}")]
    RequiredCapabilitiesDenied(String),
    #[error(transparent)]
    Matrix(#[from] core_matrix::MatrixError),
    #[error("no ui frame in progress")]
    UiFrameNotBegun,
    #[error("ui renderer failed: {0}")]
    UiRender(String),
    #[error("no lifecycle registered for entrypoint: {0}")]
    UnknownEntrypoint(String),
    #[error("app process failed: {0}")]
    Process(String),
    #[error("invalid run options: {0}")]
    InvalidOptions(&'static str),
    #[error("app lifecycle failed: {0}")]
    App(anyhow::Error),
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::App(error)
    }
}
