use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cluster::Connectivity;
use crate::error::Result;
use crate::overlay::ColormapKind;

/// How slices are resampled from voxel space.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    #[default]
    Nearest,
    Trilinear,
}

/// Viewer-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Target display resolution in mm handed to `DisplaySpace::resolution`.
    pub resolution_mm: f64,
    /// Snap positions that arrive without a caller handle to the reference grid.
    pub snap_to_grid: bool,
    /// Neighbourhood used by the cluster thresholder.
    pub connectivity: Connectivity,
    pub interpolation: Interpolation,
    /// Gap between the three slice panels, in pixels.
    pub panel_margin_px: f32,
    pub show_crosshairs: bool,
    pub crosshair_colour: [f32; 3],
    /// Mixing proportion given to full-colour layers that do not set one.
    pub blend_proportion: f32,
    /// Upper bound on relays queued by listeners during one `set_coords`.
    pub max_relay_depth: usize,
    pub default_threshold: f32,
    pub default_extent: usize,
    /// Colormap of the positive threshold tail.
    pub positive_colormap: ColormapKind,
    /// Colormap of the negative tail, applied reversed so the most negative
    /// values are brightest.
    pub negative_colormap: ColormapKind,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            resolution_mm: 1.0,
            snap_to_grid: true,
            connectivity: Connectivity::Edge18,
            interpolation: Interpolation::Nearest,
            panel_margin_px: 4.0,
            show_crosshairs: true,
            crosshair_colour: [0.0, 0.0, 1.0],
            blend_proportion: 0.5,
            max_relay_depth: 8,
            default_threshold: 3.0,
            default_extent: 5,
            positive_colormap: ColormapKind::Hot,
            negative_colormap: ColormapKind::Winter,
        }
    }
}

impl ViewerConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = ViewerConfig::default();
        assert!((cfg.resolution_mm - 1.0).abs() < f64::EPSILON);
        assert!(cfg.snap_to_grid);
        assert_eq!(cfg.connectivity, Connectivity::Edge18);
        assert_eq!(cfg.interpolation, Interpolation::Nearest);
        assert_eq!(cfg.max_relay_depth, 8);
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let cfg = ViewerConfig::from_json_str(
            r#"{ "connectivity": 26, "interpolation": "trilinear", "resolution_mm": 2.0 }"#,
        )
        .unwrap();
        assert_eq!(cfg.connectivity, Connectivity::Vertex26);
        assert_eq!(cfg.interpolation, Interpolation::Trilinear);
        assert!((cfg.resolution_mm - 2.0).abs() < f64::EPSILON);
        assert!(cfg.show_crosshairs);
        assert_eq!(cfg.default_extent, 5);
        assert_eq!(cfg.positive_colormap, ColormapKind::Hot);
        let cfg = ViewerConfig::from_json_str(r#"{ "negative_colormap": "jet" }"#).unwrap();
        assert_eq!(cfg.negative_colormap, ColormapKind::Jet);
    }

    #[test]
    fn test_invalid_connectivity_is_rejected() {
        assert!(ViewerConfig::from_json_str(r#"{ "connectivity": 7 }"#).is_err());
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let cfg = ViewerConfig {
            blend_proportion: 0.3,
            panel_margin_px: 10.0,
            ..ViewerConfig::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let restored = ViewerConfig::from_json_str(&json).unwrap();
        assert!((restored.blend_proportion - 0.3).abs() < f32::EPSILON);
        assert!((restored.panel_margin_px - 10.0).abs() < f32::EPSILON);
    }
}
