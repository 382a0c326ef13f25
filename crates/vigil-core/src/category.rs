//! Category and option identifiers.
//!
//! Categories partition loaded rules into independently toggleable groups.
//! Id 0 is reserved for the "unfiltered" category: it always evaluates as
//! enabled and cannot be toggled. Ids 1-255 are caller-defined and opaque
//! to the engine.
//!
//! Options are a separate, fixed id space of engine-defined boolean
//! switches; they must not be confused with categories.

use serde::{Deserialize, Serialize};

/// Raw category identifier as it appears on the control surface.
pub type CategoryId = u8;

/// The reserved "unfiltered" category id.
pub const UNFILTERED_CATEGORY: CategoryId = 0;

/// A validated, non-zero category id.
///
/// The reserved id 0 is unrepresentable here, which makes "category 0
/// cannot be toggled" a type-level guarantee: every toggle path goes
/// through `Category`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Category(CategoryId);

impl Category {
    /// Creates a category from a raw id, rejecting the reserved id 0.
    pub fn new(id: CategoryId) -> Option<Self> {
        if id == UNFILTERED_CATEGORY {
            None
        } else {
            Some(Self(id))
        }
    }

    /// Returns the raw id.
    pub fn id(&self) -> CategoryId {
        self.0
    }
}

impl TryFrom<CategoryId> for Category {
    type Error = CategoryId;

    fn try_from(id: CategoryId) -> Result<Self, CategoryId> {
        Self::new(id).ok_or(id)
    }
}

/// Engine-defined boolean switches controlling built-in behaviors.
///
/// Distinct id space from categories. The discriminants are the stable ids
/// seen on the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum EngineOption {
    /// Whether TLS interception is attempted at all.
    TlsInterception = 0,
    /// Whether element-hiding selectors are collected and applied.
    ElementHiding = 1,
    /// Whether response payloads are scanned for text triggers.
    TextTriggerScanning = 2,
}

impl EngineOption {
    /// All defined options.
    pub fn all() -> &'static [EngineOption] {
        &[
            Self::TlsInterception,
            Self::ElementHiding,
            Self::TextTriggerScanning,
        ]
    }

    /// Looks up an option by its stable control-surface id.
    pub fn from_id(id: u32) -> Option<Self> {
        Self::all().iter().copied().find(|o| *o as u32 == id)
    }

    /// Returns the option name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TlsInterception => "tls_interception",
            Self::ElementHiding => "element_hiding",
            Self::TextTriggerScanning => "text_trigger_scanning",
        }
    }
}
