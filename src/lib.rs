//! Orthogonal triple-view engine for statistical brain images.
//!
//! A [`ViewerSession`] holds one shared [`DisplaySpace`], one
//! [`CursorRegistry`] and any number of [`VolumeView`]s. Each view resamples
//! its volume into transverse, coronal and sagittal slices through the
//! cursor, composited with thresholded overlays.

pub mod arena;
pub mod atlas;
pub mod cluster;
pub mod compositor;
pub mod config;
pub mod error;
pub mod loader;
pub mod overlay;
pub mod readout;
pub mod registry;
pub mod session;
pub mod space;
pub mod view;
pub mod volume;

pub use atlas::{AtlasLookup, LabelAtlas};
pub use cluster::{
    ClusterLabeling, ClusterSummary, ClusterThresholder, Connectivity, Direction, Sign,
    ThresholdStatus,
};
pub use compositor::{Colorbar, CompositeMode, OverlayCompositor, SliceImage};
pub use config::{Interpolation, ViewerConfig};
pub use error::{Result, ViewerError};
pub use overlay::{ColorRange, Colormap, ColormapKind, OverlayLayer};
pub use readout::CoordinateReadout;
pub use registry::{
    CursorListener, CursorRegistry, CursorUpdate, ListenerError, ListenerId, ListenerResult,
    RegistryId, RegistryLink, Settled,
};
pub use session::{
    Command, CursorReport, Outcome, ThresholdReport, ViewId, ViewerSession, VolumeId,
};
pub use space::{BoundingBox, DisplaySpace};
pub use view::{Plane, ViewState, VolumeView, Zoom};
pub use volume::{IntensityWindow, Volume, VoxelGrid};
