//! App manifest (`app.toml`) loading and variant resolution.
//!
//! The manifest is deliberately tolerant at the document level — unknown
//! top-level keys are ignored so newer apps still load on older runtimes —
//! but strict at the field level: required keys must be present and typed,
//! entrypoints must parse as `module_path:symbol`, and a variant's
//! `module_root` can never escape the app directory.

use std::path::{Component, Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::protocol;

pub const MANIFEST_FILE_NAME: &str = "app.toml";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("app manifest not found: {0}")]
    NotFound(PathBuf),
    #[error("app manifest unreadable: {0}")]
    Unreadable(String),
    #[error("app manifest malformed: {0}")]
    Malformed(String),
    #[error("manifest missing required field: {0}")]
    MissingField(&'static str),
    #[error("entrypoint must use `module:symbol` format with non-empty parts: {0:?}")]
    BadEntrypoint(String),
    #[error("protocol compatibility check failed: {0}")]
    Protocol(String),
    #[error("platform not supported by app: {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },
    #[error("no variant matches host platform: {os}/{arch}")]
    NoMatchingVariant { os: String, arch: String },
    #[error("variant module_root must stay inside the app directory: {0:?}")]
    ModuleRootEscapes(String),
}

/// Variant as declared in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VariantSpec {
    pub id: String,
    pub os: String,
    #[serde(default)]
    pub arch: Option<String>,
    #[serde(default)]
    pub module_root: Option<String>,
    #[serde(default)]
    pub entrypoint: Option<String>,
}

/// `[runtime]` table selecting the process lane.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct RuntimeSection {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub transport: Option<String>,
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct ManifestFile {
    app_id: Option<String>,
    protocol_version: Option<String>,
    entrypoint: Option<String>,
    #[serde(default)]
    required_capabilities: Vec<String>,
    #[serde(default)]
    optional_capabilities: Vec<String>,
    min_runtime_protocol_version: Option<String>,
    max_runtime_protocol_version: Option<String>,
    platform_support: Option<Vec<String>>,
    #[serde(default)]
    variants: Vec<VariantSpec>,
    runtime: Option<RuntimeSection>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppManifest {
    pub app_id: String,
    pub protocol_version: String,
    pub entrypoint: String,
    pub required_capabilities: Vec<String>,
    pub optional_capabilities: Vec<String>,
    pub min_runtime_protocol_version: Option<String>,
    pub max_runtime_protocol_version: Option<String>,
    pub platform_support: Option<Vec<String>>,
    pub variants: Vec<VariantSpec>,
    pub runtime: Option<RuntimeSection>,
}

impl AppManifest {
    /// Read and validate `<app_dir>/app.toml`.
    pub fn load(app_dir: &Path) -> Result<Self, ManifestError> {
        let path = app_dir.join(MANIFEST_FILE_NAME);
        if !path.exists() {
            return Err(ManifestError::NotFound(path));
        }
        let text =
            std::fs::read_to_string(&path).map_err(|e| ManifestError::Unreadable(e.to_string()))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let file: ManifestFile =
            toml::from_str(text).map_err(|e| ManifestError::Malformed(e.to_string()))?;
        let manifest = AppManifest {
            app_id: file.app_id.ok_or(ManifestError::MissingField("app_id"))?,
            protocol_version: file
                .protocol_version
                .ok_or(ManifestError::MissingField("protocol_version"))?,
            entrypoint: file
                .entrypoint
                .ok_or(ManifestError::MissingField("entrypoint"))?,
            required_capabilities: file.required_capabilities,
            optional_capabilities: file.optional_capabilities,
            min_runtime_protocol_version: file.min_runtime_protocol_version,
            max_runtime_protocol_version: file.max_runtime_protocol_version,
            platform_support: file.platform_support,
            variants: file.variants,
            runtime: file.runtime,
        };
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), ManifestError> {
        let compat = protocol::check_compatibility(
            &self.protocol_version,
            self.min_runtime_protocol_version.as_deref(),
            self.max_runtime_protocol_version.as_deref(),
        );
        if !compat.accepted {
            return Err(ManifestError::Protocol(
                compat
                    .warning
                    .unwrap_or_else(|| "protocol compatibility check failed".to_string()),
            ));
        }
        if let Some(warning) = compat.warning {
            warn!(target: "app.manifest", app_id = %self.app_id, "{warning}");
        }
        parse_entrypoint(&self.entrypoint)?;
        for variant in &self.variants {
            if let Some(entrypoint) = &variant.entrypoint {
                parse_entrypoint(entrypoint)?;
            }
        }
        Ok(())
    }

    /// Whether the `[runtime]` table selects the stdio process lane.
    pub fn is_process_app(&self) -> bool {
        self.runtime
            .as_ref()
            .and_then(|r| r.kind.as_deref())
            .is_some_and(|kind| kind == "process")
    }
}

/// Variant selection outcome: the effective entrypoint and module root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedVariant {
    pub variant_id: Option<String>,
    pub entrypoint: String,
    pub module_dir: PathBuf,
}

/// Pick the variant for the host `(os, arch)`.
///
/// Arch-specific variants beat os-only ones; ties resolve in declaration
/// order. Apps without variants resolve to the manifest entrypoint rooted
/// at the app directory.
pub fn resolve_variant(
    app_dir: &Path,
    manifest: &AppManifest,
    host_os: &str,
    host_arch: &str,
) -> Result<ResolvedVariant, ManifestError> {
    if let Some(support) = &manifest.platform_support
        && !support.iter().any(|os| os == host_os)
    {
        return Err(ManifestError::UnsupportedPlatform {
            os: host_os.to_string(),
            arch: host_arch.to_string(),
        });
    }
    if manifest.variants.is_empty() {
        return Ok(ResolvedVariant {
            variant_id: None,
            entrypoint: manifest.entrypoint.clone(),
            module_dir: app_dir.to_path_buf(),
        });
    }
    let arch_match = manifest
        .variants
        .iter()
        .find(|v| v.os == host_os && v.arch.as_deref() == Some(host_arch));
    let os_match = manifest
        .variants
        .iter()
        .find(|v| v.os == host_os && v.arch.is_none());
    let Some(variant) = arch_match.or(os_match) else {
        return Err(ManifestError::NoMatchingVariant {
            os: host_os.to_string(),
            arch: host_arch.to_string(),
        });
    };
    let module_dir = match &variant.module_root {
        Some(root) => {
            validate_module_root(root)?;
            app_dir.join(root)
        }
        None => app_dir.to_path_buf(),
    };
    Ok(ResolvedVariant {
        variant_id: Some(variant.id.clone()),
        entrypoint: variant
            .entrypoint
            .clone()
            .unwrap_or_else(|| manifest.entrypoint.clone()),
        module_dir,
    })
}

/// Split `module_path:symbol`, rejecting empty halves.
pub fn parse_entrypoint(entrypoint: &str) -> Result<(&str, &str), ManifestError> {
    let Some((module, symbol)) = entrypoint.split_once(':') else {
        return Err(ManifestError::BadEntrypoint(entrypoint.to_string()));
    };
    let (module, symbol) = (module.trim(), symbol.trim());
    if module.is_empty() || symbol.is_empty() {
        return Err(ManifestError::BadEntrypoint(entrypoint.to_string()));
    }
    Ok((module, symbol))
}

fn validate_module_root(root: &str) -> Result<(), ManifestError> {
    let path = Path::new(root);
    if path.is_absolute() {
        return Err(ManifestError::ModuleRootEscapes(root.to_string()));
    }
    for component in path.components() {
        if matches!(component, Component::ParentDir) {
            return Err(ManifestError::ModuleRootEscapes(root.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const MINIMAL: &str = r#"
        app_id = "test.app"
        protocol_version = "1"
        entrypoint = "app_main:create"
    "#;

    #[test]
    fn minimal_manifest_parses_with_defaults() {
        let manifest = AppManifest::parse(MINIMAL).unwrap();
        assert_eq!(manifest.app_id, "test.app");
        assert_eq!(manifest.entrypoint, "app_main:create");
        assert!(manifest.required_capabilities.is_empty());
        assert!(manifest.variants.is_empty());
        assert!(!manifest.is_process_app());
    }

    #[test]
    fn unknown_top_level_keys_are_ignored() {
        let text = format!("{MINIMAL}\nfuture_field = 42\n[future_table]\nx = 1\n");
        assert!(AppManifest::parse(&text).is_ok());
    }

    #[test]
    fn missing_required_field_is_reported_by_name() {
        let err = AppManifest::parse("app_id = \"a\"\nentrypoint = \"m:s\"").unwrap_err();
        assert_eq!(err, ManifestError::MissingField("protocol_version"));
    }

    #[test]
    fn bad_entrypoint_is_rejected() {
        let text = r#"
            app_id = "a"
            protocol_version = "1"
            entrypoint = "no_symbol"
        "#;
        assert!(matches!(
            AppManifest::parse(text),
            Err(ManifestError::BadEntrypoint(_))
        ));
    }

    #[test]
    fn unsupported_protocol_fails_at_load() {
        let text = r#"
            app_id = "a"
            protocol_version = "99"
            entrypoint = "m:s"
        "#;
        assert!(matches!(
            AppManifest::parse(text),
            Err(ManifestError::Protocol(_))
        ));
    }

    #[test]
    fn variants_and_platform_support_parse() {
        let text = r#"
            app_id = "a"
            protocol_version = "1"
            entrypoint = "app_main:create"
            platform_support = ["macos", "linux"]

            [[variants]]
            id = "mac-arm64"
            os = "macos"
            arch = "arm64"
            module_root = "variants/macos_arm64"
            entrypoint = "variant_main:create"
        "#;
        let manifest = AppManifest::parse(text).unwrap();
        assert_eq!(manifest.variants.len(), 1);
        assert_eq!(manifest.variants[0].id, "mac-arm64");
        assert_eq!(
            manifest.platform_support,
            Some(vec!["macos".to_string(), "linux".to_string()])
        );
    }

    #[test]
    fn arch_variant_beats_os_only_variant() {
        let text = r#"
            app_id = "a"
            protocol_version = "1"
            entrypoint = "app_main:create"

            [[variants]]
            id = "mac-any"
            os = "macos"

            [[variants]]
            id = "mac-arm64"
            os = "macos"
            arch = "arm64"
            module_root = "variants/macos_arm64"
            entrypoint = "variant_main:create"
        "#;
        let manifest = AppManifest::parse(text).unwrap();
        let resolved =
            resolve_variant(Path::new("/apps/demo"), &manifest, "macos", "arm64").unwrap();
        assert_eq!(resolved.variant_id.as_deref(), Some("mac-arm64"));
        assert_eq!(resolved.entrypoint, "variant_main:create");
        assert_eq!(
            resolved.module_dir,
            Path::new("/apps/demo/variants/macos_arm64")
        );
        let os_only = resolve_variant(Path::new("/apps/demo"), &manifest, "macos", "x86_64")
            .unwrap();
        assert_eq!(os_only.variant_id.as_deref(), Some("mac-any"));
        assert_eq!(os_only.entrypoint, "app_main:create");
    }

    #[test]
    fn host_without_matching_variant_is_rejected() {
        let text = r#"
            app_id = "a"
            protocol_version = "1"
            entrypoint = "app_main:create"

            [[variants]]
            id = "mac-any"
            os = "macos"
        "#;
        let manifest = AppManifest::parse(text).unwrap();
        let err = resolve_variant(Path::new("/apps/demo"), &manifest, "linux", "x86_64")
            .unwrap_err();
        assert!(matches!(err, ManifestError::NoMatchingVariant { .. }));
    }

    #[test]
    fn platform_support_gates_the_host_os() {
        let text = r#"
            app_id = "a"
            protocol_version = "1"
            entrypoint = "app_main:create"
            platform_support = ["macos"]
        "#;
        let manifest = AppManifest::parse(text).unwrap();
        let err = resolve_variant(Path::new("/apps/demo"), &manifest, "linux", "x86_64")
            .unwrap_err();
        assert!(matches!(err, ManifestError::UnsupportedPlatform { .. }));
    }

    #[test]
    fn module_root_cannot_escape_the_app_dir() {
        let text = r#"
            app_id = "a"
            protocol_version = "1"
            entrypoint = "app_main:create"

            [[variants]]
            id = "escape"
            os = "linux"
            module_root = "../outside"
        "#;
        let manifest = AppManifest::parse(text).unwrap();
        let err = resolve_variant(Path::new("/apps/demo"), &manifest, "linux", "x86_64")
            .unwrap_err();
        assert!(matches!(err, ManifestError::ModuleRootEscapes(_)));
    }

    #[test]
    fn process_runtime_section_is_detected() {
        let text = r#"
            app_id = "a"
            protocol_version = "2"
            entrypoint = "app_main:create"

            [runtime]
            kind = "process"
            transport = "stdio_jsonl"
            command = ["worker", "--flag"]
        "#;
        let manifest = AppManifest::parse(text).unwrap();
        assert!(manifest.is_process_app());
        let runtime = manifest.runtime.unwrap();
        assert_eq!(runtime.transport.as_deref(), Some("stdio_jsonl"));
        assert_eq!(
            runtime.command,
            Some(vec!["worker".to_string(), "--flag".to_string()])
        );
    }

    #[test]
    fn load_reads_from_app_dir(){
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE_NAME), MINIMAL).unwrap();
        let manifest = AppManifest::load(dir.path()).unwrap();
        assert_eq!(manifest.app_id, "test.app");
        let missing = AppManifest::load(&dir.path().join("nope"));
        assert!(matches!(missing, Err(ManifestError::NotFound(_))));
    }
}
