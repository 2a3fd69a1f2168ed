use thiserror::Error;

use crate::registry::{ListenerId, RegistryId};
use crate::session::{ViewId, VolumeId};

/// Errors surfaced by the viewer engine.
#[derive(Error, Debug)]
pub enum ViewerError {
    /// The volume slot is empty or its generation no longer matches.
    #[error("volume handle {0:?} no longer refers to a loaded volume")]
    InvalidVolume(VolumeId),

    /// The view slot is empty or its generation no longer matches.
    #[error("view handle {0:?} no longer refers to a bound view")]
    InvalidView(ViewId),

    /// A listener handle that the registry does not know about.
    #[error("listener handle {0:?} is not registered")]
    InvalidListener(ListenerId),

    /// A handle minted by another registry.
    #[error("registry handle {0:?} does not match this registry")]
    InvalidRegistry(RegistryId),

    #[error("cursor registry is already initialised")]
    AlreadyInitialised,

    #[error("cursor registry has not been initialised")]
    NotInitialised,

    #[error("display area {width}x{height} is degenerate")]
    DegenerateDisplayArea { width: f32, height: f32 },

    #[error("affine transform is singular")]
    SingularAffine,

    #[error("view has been disposed")]
    ViewDisposed,

    #[error("view is not bound to a volume")]
    NotBound,

    #[error("overlay index {index} out of range ({len} layers)")]
    OverlayIndex { index: usize, len: usize },

    #[error("expected a 3D volume, got {0} dimensions")]
    NotThreeDimensional(usize),

    #[error("no statistic volume has been loaded")]
    NoStatistic,

    #[error("no underlay volume has been loaded")]
    NoUnderlay,

    #[error("unsupported connectivity {0}; expected 6, 18 or 26")]
    Connectivity(u8),

    #[error("label table line {line} is not '<index> <name>': {text}")]
    LabelTable { line: usize, text: String },

    #[error("NIfTI error: {0}")]
    Nifti(#[from] nifti::NiftiError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ViewerError>;
