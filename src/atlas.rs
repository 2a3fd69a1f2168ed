//! Region names for world positions.

use std::collections::BTreeMap;

use nalgebra::{Matrix4, Point3};
use ndarray::Array3;

use crate::error::{Result, ViewerError};
use crate::volume::{Volume, VoxelGrid};

/// Anything that can name the region under a voxel.
pub trait AtlasLookup {
    /// Voxel of the atlas containing `world`, `None` outside it.
    fn world_to_voxel(&self, world: &Point3<f64>) -> Option<[usize; 3]>;

    fn label_for_voxel(&self, voxel: [usize; 3]) -> Option<&str>;

    fn region_at(&self, world: &Point3<f64>) -> Option<&str> {
        self.world_to_voxel(world)
            .and_then(|voxel| self.label_for_voxel(voxel))
    }
}

/// Integer label volume plus a table of region names. Label 0 is background.
#[derive(Clone, Debug)]
pub struct LabelAtlas {
    labels: Array3<u16>,
    grid: VoxelGrid,
    names: BTreeMap<u16, String>,
}

impl LabelAtlas {
    pub fn new(labels: Array3<u16>, affine: Matrix4<f64>, names: BTreeMap<u16, String>) -> Result<Self> {
        let (nx, ny, nz) = labels.dim();
        let grid = VoxelGrid::new(affine, [nx, ny, nz])?;
        Ok(Self {
            labels,
            grid,
            names,
        })
    }

    /// Build from a loaded label image; values are rounded to the nearest label.
    pub fn from_volume(volume: &Volume, names: BTreeMap<u16, String>) -> Result<Self> {
        let labels = volume.data().mapv(|v| {
            if v.is_finite() && v > 0.0 {
                v.round().min(u16::MAX as f32) as u16
            } else {
                0
            }
        });
        Self::new(labels, *volume.affine(), names)
    }

    pub fn names(&self) -> &BTreeMap<u16, String> {
        &self.names
    }

    pub fn label_at(&self, voxel: [usize; 3]) -> Option<u16> {
        self.labels.get(voxel).copied()
    }
}

impl AtlasLookup for LabelAtlas {
    fn world_to_voxel(&self, world: &Point3<f64>) -> Option<[usize; 3]> {
        let snapped = self.grid.snap(world);
        if !snapped.inside {
            return None;
        }
        Some(snapped.voxel.map(|i| i as usize))
    }

    fn label_for_voxel(&self, voxel: [usize; 3]) -> Option<&str> {
        match self.label_at(voxel)? {
            0 => None,
            label => self.names.get(&label).map(String::as_str),
        }
    }
}

/// Parse a label table with one `<index> <name>` pair per line. Blank lines
/// and lines starting with `#` are skipped.
pub fn parse_label_names(text: &str) -> Result<BTreeMap<u16, String>> {
    let mut names = BTreeMap::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (index, name) = line
            .split_once(|c: char| c.is_whitespace() || c == ',')
            .ok_or_else(|| ViewerError::LabelTable {
                line: lineno + 1,
                text: line.to_string(),
            })?;
        let index: u16 = index.trim().parse().map_err(|_| ViewerError::LabelTable {
            line: lineno + 1,
            text: line.to_string(),
        })?;
        names.insert(index, name.trim().to_string());
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atlas() -> LabelAtlas {
        let mut labels = Array3::<u16>::zeros((4, 4, 4));
        labels[[1, 1, 1]] = 3;
        labels[[2, 2, 2]] = 9;
        let names = BTreeMap::from([(3, "Precuneus_L".to_string())]);
        LabelAtlas::new(labels, Matrix4::identity(), names).unwrap()
    }

    #[test]
    fn test_region_lookup() {
        let a = atlas();
        assert_eq!(a.region_at(&Point3::new(1.2, 0.9, 1.0)), Some("Precuneus_L"));
        // Background and unnamed labels have no region.
        assert_eq!(a.region_at(&Point3::new(0.0, 0.0, 0.0)), None);
        assert_eq!(a.region_at(&Point3::new(2.0, 2.0, 2.0)), None);
        assert_eq!(a.region_at(&Point3::new(-3.0, 0.0, 0.0)), None);
    }

    #[test]
    fn test_parse_label_names() {
        let names = parse_label_names("# aal\n1 Precentral_L\n\n2,Precentral_R\n").unwrap();
        assert_eq!(names.len(), 2);
        assert_eq!(names[&2], "Precentral_R");
        assert!(matches!(
            parse_label_names("x y"),
            Err(ViewerError::LabelTable { line: 1, .. })
        ));
    }

    #[test]
    fn test_from_volume_rounds_labels() {
        let mut data = Array3::<f32>::zeros((2, 2, 2));
        data[[1, 0, 0]] = 2.0001;
        data[[0, 1, 0]] = f32::NAN;
        let vol = Volume::new("labels", data, Matrix4::identity()).unwrap();
        let a = LabelAtlas::from_volume(&vol, BTreeMap::from([(2, "V1".to_string())])).unwrap();
        assert_eq!(a.label_at([1, 0, 0]), Some(2));
        assert_eq!(a.label_at([0, 1, 0]), Some(0));
        assert_eq!(a.label_for_voxel([1, 0, 0]), Some("V1"));
    }
}
