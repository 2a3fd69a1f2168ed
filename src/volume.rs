//! Loaded image volumes and the voxel grids they define.

use nalgebra::{Matrix3, Matrix4, Point3, Vector3, Vector4};
use ndarray::Array3;

use crate::config::Interpolation;
use crate::error::{Result, ViewerError};
use crate::overlay::{LayerSource, OverlayLayer};

/// Apply a homogeneous affine to a point. Affines here never carry a
/// projective row, so `w` is dropped.
#[inline]
pub fn apply(m: &Matrix4<f64>, p: &Point3<f64>) -> Point3<f64> {
    let h = m * Vector4::new(p.x, p.y, p.z, 1.0);
    Point3::new(h.x, h.y, h.z)
}

/// Upper-left 3x3 block of an affine.
#[inline]
pub fn linear_part(m: &Matrix4<f64>) -> Matrix3<f64> {
    m.fixed_view::<3, 3>(0, 0).into_owned()
}

/// Column norms of the linear part, i.e. the voxel edge lengths in mm.
pub fn column_norms(m: &Matrix4<f64>) -> Vector3<f64> {
    let l = linear_part(m);
    Vector3::new(l.column(0).norm(), l.column(1).norm(), l.column(2).norm())
}

/// Intensity clip range used when rescaling the grayscale base.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub enum IntensityWindow {
    /// Min/max of the finite values in the slices currently on screen.
    #[default]
    Auto,
    Explicit { min: f32, max: f32 },
}

/// A voxel lattice: an affine from zero-based voxel indices to world mm.
#[derive(Clone, Debug, PartialEq)]
pub struct VoxelGrid {
    affine: Matrix4<f64>,
    inverse: Matrix4<f64>,
    dims: [usize; 3],
}

/// Result of snapping a world position onto a [`VoxelGrid`].
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Snapped {
    pub position: Point3<f64>,
    pub voxel: [i64; 3],
    /// Euclidean distance in mm between the requested and the snapped position.
    pub discrepancy: f64,
    pub inside: bool,
}

impl VoxelGrid {
    pub fn new(affine: Matrix4<f64>, dims: [usize; 3]) -> Result<Self> {
        let inverse = affine.try_inverse().ok_or(ViewerError::SingularAffine)?;
        Ok(Self {
            affine,
            inverse,
            dims,
        })
    }

    pub fn affine(&self) -> &Matrix4<f64> {
        &self.affine
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn world_to_voxel(&self, world: &Point3<f64>) -> Point3<f64> {
        apply(&self.inverse, world)
    }

    pub fn voxel_to_world(&self, voxel: &Point3<f64>) -> Point3<f64> {
        apply(&self.affine, voxel)
    }

    /// Move `world` to the centre of the nearest voxel. The lattice is treated
    /// as unbounded; `inside` reports whether that voxel lies within `dims`.
    pub fn snap(&self, world: &Point3<f64>) -> Snapped {
        let v = self.world_to_voxel(world);
        let voxel = [v.x.round() as i64, v.y.round() as i64, v.z.round() as i64];
        let centre = Point3::new(voxel[0] as f64, voxel[1] as f64, voxel[2] as f64);
        let position = self.voxel_to_world(&centre);
        let inside = voxel
            .iter()
            .zip(self.dims.iter())
            .all(|(&i, &n)| i >= 0 && (i as usize) < n);
        Snapped {
            position,
            voxel,
            discrepancy: (position - world).norm(),
            inside,
        }
    }
}

/// A loaded image: data, voxel-to-world affine and display state.
#[derive(Clone, Debug)]
pub struct Volume {
    name: String,
    data: Array3<f32>,
    affine: Matrix4<f64>,
    /// Extra world-space transform applied before display (manual reorientation).
    premul: Matrix4<f64>,
    window: IntensityWindow,
    blobs: Vec<OverlayLayer>,
}

impl Volume {
    /// Wrap `data` with its voxel-to-world `affine`. Fails on a singular affine.
    pub fn new(name: impl Into<String>, data: Array3<f32>, affine: Matrix4<f64>) -> Result<Self> {
        if affine.try_inverse().is_none() {
            return Err(ViewerError::SingularAffine);
        }
        Ok(Self {
            name: name.into(),
            data,
            affine,
            premul: Matrix4::identity(),
            window: IntensityWindow::Auto,
            blobs: Vec::new(),
        })
    }

    /// Axis-aligned volume with the given voxel size and origin (world mm of voxel 0,0,0).
    pub fn with_voxel_size(
        name: impl Into<String>,
        data: Array3<f32>,
        voxel_size: [f64; 3],
        origin: [f64; 3],
    ) -> Result<Self> {
        let mut affine = Matrix4::identity();
        for a in 0..3 {
            affine[(a, a)] = voxel_size[a];
            affine[(a, 3)] = origin[a];
        }
        Self::new(name, data, affine)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn affine(&self) -> &Matrix4<f64> {
        &self.affine
    }

    pub fn premul(&self) -> &Matrix4<f64> {
        &self.premul
    }

    pub fn set_premul(&mut self, premul: Matrix4<f64>) -> Result<()> {
        if premul.try_inverse().is_none() {
            return Err(ViewerError::SingularAffine);
        }
        self.premul = premul;
        Ok(())
    }

    pub fn dims(&self) -> [usize; 3] {
        let (x, y, z) = self.data.dim();
        [x, y, z]
    }

    pub fn voxel_size(&self) -> [f64; 3] {
        let n = column_norms(&self.affine);
        [n.x, n.y, n.z]
    }

    pub fn window(&self) -> IntensityWindow {
        self.window
    }

    pub fn set_window(&mut self, window: IntensityWindow) {
        self.window = match window {
            IntensityWindow::Explicit { min, max } if min > max => {
                IntensityWindow::Explicit { min: max, max: min }
            }
            w => w,
        };
    }

    pub fn grid(&self) -> Result<VoxelGrid> {
        VoxelGrid::new(self.affine, self.dims())
    }

    pub fn voxel_to_world(&self, voxel: &Point3<f64>) -> Point3<f64> {
        apply(&self.affine, voxel)
    }

    /// Value at an integer voxel, `None` outside the array.
    pub fn value_at(&self, voxel: [i64; 3]) -> Option<f32> {
        if voxel.iter().any(|&i| i < 0) {
            return None;
        }
        self.data
            .get([voxel[0] as usize, voxel[1] as usize, voxel[2] as usize])
            .copied()
    }

    pub fn blobs(&self) -> &[OverlayLayer] {
        &self.blobs
    }

    pub fn add_blob(&mut self, layer: OverlayLayer) {
        self.blobs.push(layer);
    }

    pub fn remove_blob(&mut self, index: usize) -> Result<OverlayLayer> {
        if index >= self.blobs.len() {
            return Err(ViewerError::OverlayIndex {
                index,
                len: self.blobs.len(),
            });
        }
        Ok(self.blobs.remove(index))
    }

    pub fn clear_blobs(&mut self) {
        self.blobs.clear();
    }

    /// Drop every layer produced by a previous threshold and append `layers`.
    /// User-added layers keep their order ahead of the new ones.
    pub fn replace_threshold_blobs(&mut self, layers: Vec<OverlayLayer>) {
        self.blobs
            .retain(|layer| layer.source() != LayerSource::Threshold);
        self.blobs.extend(layers);
    }
}

/// Sample `data` at a continuous voxel coordinate. Positions outside the
/// array yield NaN.
pub fn sample(data: &Array3<f32>, v: &Point3<f64>, interpolation: Interpolation) -> f32 {
    let (nx, ny, nz) = data.dim();
    let dims = [nx, ny, nz];
    let coords = [v.x, v.y, v.z];

    let nearest = |c: f64, n: usize| -> Option<usize> {
        let i = c.round();
        (i >= 0.0 && i < n as f64).then_some(i as usize)
    };

    match interpolation {
        Interpolation::Nearest => {
            match (
                nearest(coords[0], nx),
                nearest(coords[1], ny),
                nearest(coords[2], nz),
            ) {
                (Some(i), Some(j), Some(k)) => data[[i, j, k]],
                _ => f32::NAN,
            }
        }
        Interpolation::Trilinear => {
            // Per axis: (lower index, upper index, weight of upper).
            let mut axes = [(0usize, 0usize, 0.0f64); 3];
            for a in 0..3 {
                let n = dims[a];
                let c = coords[a];
                if n == 1 {
                    match nearest(c, 1) {
                        Some(_) => axes[a] = (0, 0, 0.0),
                        None => return f32::NAN,
                    }
                    continue;
                }
                const EDGE: f64 = 1e-6;
                if c < -EDGE || c > (n - 1) as f64 + EDGE {
                    return f32::NAN;
                }
                let c = c.clamp(0.0, (n - 1) as f64);
                let lo = (c.floor() as usize).min(n - 2);
                axes[a] = (lo, lo + 1, c - lo as f64);
            }

            let mut acc = 0.0f64;
            for corner in 0..8 {
                let mut w = 1.0;
                let mut idx = [0usize; 3];
                for a in 0..3 {
                    let (lo, hi, t) = axes[a];
                    if corner >> a & 1 == 1 {
                        w *= t;
                        idx[a] = hi;
                    } else {
                        w *= 1.0 - t;
                        idx[a] = lo;
                    }
                }
                if w > 0.0 {
                    acc += w * data[idx] as f64;
                }
            }
            acc as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn oblique_grid() -> VoxelGrid {
        let affine = Matrix4::new(
            -2.0, 0.1, 0.0, 90.0, //
            0.0, 2.0, 0.3, -126.0, //
            0.2, 0.0, 2.5, -72.0, //
            0.0, 0.0, 0.0, 1.0,
        );
        VoxelGrid::new(affine, [91, 109, 91]).unwrap()
    }

    #[test]
    fn test_snap_moves_to_voxel_centre() {
        let mut affine = Matrix4::identity();
        affine[(0, 0)] = 2.0;
        affine[(1, 1)] = 2.0;
        affine[(2, 2)] = 2.0;
        let grid = VoxelGrid::new(affine, [10, 10, 10]).unwrap();
        let s = grid.snap(&Point3::new(3.1, 4.0, 4.9));
        assert_eq!(s.voxel, [2, 2, 2]);
        assert!((s.position - Point3::new(4.0, 4.0, 4.0)).norm() < 1e-12);
        assert!((s.discrepancy - (0.81f64 + 0.81).sqrt()).abs() < 1e-12);
        assert!(s.inside);
        assert!(!grid.snap(&Point3::new(-5.0, 0.0, 0.0)).inside);
    }

    #[test]
    fn test_singular_affine_is_rejected() {
        let mut affine = Matrix4::identity();
        affine[(2, 2)] = 0.0;
        assert!(matches!(
            VoxelGrid::new(affine, [2, 2, 2]),
            Err(ViewerError::SingularAffine)
        ));
        assert!(Volume::new("v", Array3::zeros((2, 2, 2)), affine).is_err());
    }

    #[test]
    fn test_sample_nearest_and_out_of_bounds() {
        let mut data = Array3::<f32>::zeros((3, 3, 3));
        data[[1, 2, 0]] = 7.0;
        let v = sample(&data, &Point3::new(1.2, 1.6, -0.4), Interpolation::Nearest);
        assert_eq!(v, 7.0);
        assert!(sample(&data, &Point3::new(3.0, 0.0, 0.0), Interpolation::Nearest).is_nan());
    }

    #[test]
    fn test_sample_trilinear_midpoint() {
        let mut data = Array3::<f32>::zeros((2, 2, 1));
        data[[1, 0, 0]] = 4.0;
        data[[1, 1, 0]] = 4.0;
        let v = sample(&data, &Point3::new(0.5, 0.5, 0.0), Interpolation::Trilinear);
        assert!((v - 2.0).abs() < 1e-6);
        let edge = sample(&data, &Point3::new(1.0, 1.0, 0.0), Interpolation::Trilinear);
        assert!((edge - 4.0).abs() < 1e-6);
        assert!(sample(&data, &Point3::new(1.5, 0.0, 0.0), Interpolation::Trilinear).is_nan());
    }

    #[test]
    fn test_replace_threshold_blobs_keeps_user_layers() {
        let mut vol = Volume::with_voxel_size("v", Array3::zeros((2, 2, 2)), [1.0; 3], [0.0; 3])
            .unwrap();
        let user = OverlayLayer::new("user", Array3::from_elem((2, 2, 2), 1.0), *vol.affine());
        let thr = OverlayLayer::new("thr", Array3::from_elem((2, 2, 2), 2.0), *vol.affine())
            .with_source(LayerSource::Threshold);
        vol.add_blob(user);
        vol.add_blob(thr.clone());
        vol.replace_threshold_blobs(vec![thr.clone(), thr]);
        assert_eq!(vol.blobs().len(), 3);
        assert_eq!(vol.blobs()[0].name(), "user");
        assert!(matches!(
            vol.remove_blob(5),
            Err(ViewerError::OverlayIndex { index: 5, len: 3 })
        ));
    }

    proptest! {
        #[test]
        fn snap_is_idempotent(
            x in -150.0f64..150.0,
            y in -150.0f64..150.0,
            z in -150.0f64..150.0,
        ) {
            let grid = oblique_grid();
            let once = grid.snap(&Point3::new(x, y, z));
            let twice = grid.snap(&once.position);
            prop_assert_eq!(once.voxel, twice.voxel);
            prop_assert!((once.position - twice.position).norm() < 1e-9);
            prop_assert!(twice.discrepancy < 1e-9);
        }
    }
}
