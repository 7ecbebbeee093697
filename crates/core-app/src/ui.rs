//! UI frame batching façade.
//!
//! The component renderer is a collaborator, not part of the runtime: the
//! context only sequences `begin -> mount* -> compose` and submits the
//! composed pixels as one `FullRewrite`. Component semantics (layout,
//! glyphs, widgets) live entirely behind [`UiFrameRenderer`].

use core_matrix::{PixelRect, RgbaF};
use serde_json::Value;

use crate::AppError;

/// Declarative component handed to the renderer, schema-free at this
/// layer. `props` is renderer-defined.
#[derive(Debug, Clone, PartialEq)]
pub struct UiComponent {
    pub component_id: String,
    pub kind: String,
    pub props: Value,
}

impl UiComponent {
    pub fn new(component_id: impl Into<String>, kind: impl Into<String>, props: Value) -> Self {
        Self {
            component_id: component_id.into(),
            kind: kind.into(),
            props,
        }
    }
}

/// Collaborator that rasterizes mounted components into an RGBA rect
/// matching the extent it was given in `begin`.
pub trait UiFrameRenderer: Send {
    fn begin(&mut self, width: u32, height: u32, clear: RgbaF);
    fn mount(&mut self, component: &UiComponent) -> Result<(), AppError>;
    fn compose(&mut self) -> Result<PixelRect, AppError>;
}

/// Renderer that fills the frame with its clear color and ignores
/// components; enough for embeddings without a component library.
#[derive(Debug, Default)]
pub struct SolidFrameRenderer {
    extent: Option<(u32, u32)>,
    clear: RgbaF,
}

impl UiFrameRenderer for SolidFrameRenderer {
    fn begin(&mut self, width: u32, height: u32, clear: RgbaF) {
        self.extent = Some((width, height));
        self.clear = clear;
    }

    fn mount(&mut self, _component: &UiComponent) -> Result<(), AppError> {
        Ok(())
    }

    fn compose(&mut self) -> Result<PixelRect, AppError> {
        let (width, height) = self.extent.take().ok_or(AppError::UiFrameNotBegun)?;
        PixelRect::solid(width, height, self.clear).map_err(AppError::from)
    }
}
