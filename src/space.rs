//! The shared display space every loaded volume is resampled into.
//!
//! Display coordinates are related to world millimetres by `to_world`. Right
//! after [`DisplaySpace::set_space`] one display unit is one millimetre along
//! the rebased volume's axes; [`DisplaySpace::resolution`] then rescales so that
//! one display unit is one display voxel.

use log::{debug, info};
use nalgebra::{Matrix4, Point3, Vector3};

use crate::error::{Result, ViewerError};
use crate::volume::{apply, column_norms, linear_part, Volume};

/// Axis-aligned box in display units. An empty box has `min > max`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BoundingBox {
    pub min: Point3<f64>,
    pub max: Point3<f64>,
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::empty()
    }
}

impl BoundingBox {
    pub fn new(min: Point3<f64>, max: Point3<f64>) -> Self {
        Self { min, max }
    }

    /// Sentinel returned for an empty set of volumes.
    pub fn empty() -> Self {
        Self {
            min: Point3::new(f64::INFINITY, f64::INFINITY, f64::INFINITY),
            max: Point3::new(f64::NEG_INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY),
        }
    }

    pub fn is_empty(&self) -> bool {
        (0..3).any(|a| !(self.min[a] <= self.max[a]))
    }

    pub fn include(&mut self, p: &Point3<f64>) {
        for a in 0..3 {
            self.min[a] = self.min[a].min(p[a]);
            self.max[a] = self.max[a].max(p[a]);
        }
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        let mut out = *self;
        if !other.is_empty() {
            out.include(&other.min);
            out.include(&other.max);
        }
        out
    }

    /// Whether `other` lies entirely within `self`, with tolerance `eps`.
    pub fn contains(&self, other: &BoundingBox, eps: f64) -> bool {
        if other.is_empty() {
            return true;
        }
        (0..3).all(|a| self.min[a] <= other.min[a] + eps && self.max[a] >= other.max[a] - eps)
    }

    pub fn scaled(&self, factor: f64) -> BoundingBox {
        let mut out = BoundingBox::new(self.min * factor, self.max * factor);
        if factor < 0.0 {
            std::mem::swap(&mut out.min, &mut out.max);
        }
        out
    }

    /// Number of display voxels along each axis, at least one.
    pub fn dims(&self) -> [usize; 3] {
        if self.is_empty() {
            return [1, 1, 1];
        }
        let mut d = [1usize; 3];
        for (a, n) in d.iter_mut().enumerate() {
            *n = ((self.max[a] - self.min[a]).round() as usize + 1).max(1);
        }
        d
    }

    /// Box enclosing the eight corners of the voxel range `lo..=hi` mapped by `m`.
    pub fn of_voxel_range(m: &Matrix4<f64>, lo: [f64; 3], hi: [f64; 3]) -> BoundingBox {
        let mut bb = BoundingBox::empty();
        for corner in 0..8 {
            let p = Point3::new(
                if corner & 1 == 0 { lo[0] } else { hi[0] },
                if corner & 2 == 0 { lo[1] } else { hi[1] },
                if corner & 4 == 0 { lo[2] } else { hi[2] },
            );
            bb.include(&apply(m, &p));
        }
        bb
    }
}

/// The common display space: a display-to-world affine plus the current
/// bounding box in display units.
#[derive(Clone, Debug, PartialEq)]
pub struct DisplaySpace {
    to_world: Matrix4<f64>,
    bb: BoundingBox,
}

impl Default for DisplaySpace {
    fn default() -> Self {
        Self::identity()
    }
}

impl DisplaySpace {
    pub fn identity() -> Self {
        Self {
            to_world: Matrix4::identity(),
            bb: BoundingBox::empty(),
        }
    }

    pub fn to_world(&self) -> &Matrix4<f64> {
        &self.to_world
    }

    pub fn bounding_box(&self) -> BoundingBox {
        self.bb
    }

    pub fn set_bounding_box(&mut self, bb: BoundingBox) {
        self.bb = bb;
    }

    fn from_world(&self) -> Result<Matrix4<f64>> {
        self.to_world
            .try_inverse()
            .ok_or(ViewerError::SingularAffine)
    }

    pub fn world_to_display(&self, world: &Point3<f64>) -> Result<Point3<f64>> {
        Ok(apply(&self.from_world()?, world))
    }

    pub fn display_to_world(&self, display: &Point3<f64>) -> Point3<f64> {
        apply(&self.to_world, display)
    }

    /// Millimetres per display unit along each display axis.
    pub fn scale(&self) -> Vector3<f64> {
        column_norms(&self.to_world)
    }

    /// Voxel indices of `volume` to display coordinates.
    pub fn voxel_to_display(&self, volume: &Volume) -> Result<Matrix4<f64>> {
        self.affine_to_display(volume.premul(), volume.affine())
    }

    /// Voxel indices of any array sharing `volume`'s premultiply, with its own
    /// voxel-to-world `affine`, to display coordinates.
    pub fn affine_to_display(
        &self,
        premul: &Matrix4<f64>,
        affine: &Matrix4<f64>,
    ) -> Result<Matrix4<f64>> {
        Ok(self.from_world()? * premul * affine)
    }

    /// Reset to world coordinates and fit the box around `volumes`.
    pub fn reset<'a>(&mut self, volumes: impl IntoIterator<Item = &'a Volume>) -> Result<()> {
        self.to_world = Matrix4::identity();
        self.bb = self.max_bounding_box(volumes)?;
        info!("display space reset to world coordinates");
        Ok(())
    }

    /// Rebase the display space onto `volume`'s voxel grid.
    ///
    /// Display axes follow the volume's voxel axes scaled to millimetres. When
    /// the grid is left-handed the first voxel size is negated so the display
    /// frame keeps the world's handedness.
    pub fn set_space(&mut self, volume: &Volume) -> Result<()> {
        let mat = volume.premul() * volume.affine();
        let lin = linear_part(&mat);
        let mut vox = column_norms(&mat);
        if lin.determinant() < 0.0 {
            vox.x = -vox.x;
        }
        let scaling = Matrix4::new_nonuniform_scaling(&vox);
        let inv = scaling.try_inverse().ok_or(ViewerError::SingularAffine)?;
        self.to_world = mat * inv;

        let dims = volume.dims();
        let hi = [
            dims[0].saturating_sub(1) as f64,
            dims[1].saturating_sub(1) as f64,
            dims[2].saturating_sub(1) as f64,
        ];
        self.bb = BoundingBox::of_voxel_range(&scaling, [0.0; 3], hi);
        info!(
            "display space rebased onto '{}' ({:?} voxels)",
            volume.name(),
            dims
        );
        Ok(())
    }

    /// Union of every volume's field of view in the current display space.
    /// Zero volumes give [`BoundingBox::empty`].
    pub fn max_bounding_box<'a>(
        &self,
        volumes: impl IntoIterator<Item = &'a Volume>,
    ) -> Result<BoundingBox> {
        let mut bb = BoundingBox::empty();
        for volume in volumes {
            let m = self.voxel_to_display(volume)?;
            let d = volume.dims();
            let hi = [
                d[0].saturating_sub(1) as f64,
                d[1].saturating_sub(1) as f64,
                d[2].saturating_sub(1) as f64,
            ];
            bb = bb.union(&BoundingBox::of_voxel_range(&m, [0.0; 3], hi));
        }
        Ok(bb)
    }

    /// Rescale the display grid.
    ///
    /// The resulting display voxel is the smallest voxel edge among `volumes`,
    /// but never finer than `target_mm`. With no volumes `target_mm` is used.
    /// Returns the display voxel size in mm.
    pub fn resolution<'a>(
        &mut self,
        target_mm: f64,
        volumes: impl IntoIterator<Item = &'a Volume>,
    ) -> f64 {
        let smallest = volumes
            .into_iter()
            .flat_map(|v| v.voxel_size())
            .fold(f64::INFINITY, f64::min);
        let res = if smallest.is_finite() {
            smallest.max(target_mm)
        } else {
            target_mm
        };

        let current = linear_part(&self.to_world)
            .svd(false, false)
            .singular_values
            .mean();
        if !(current > 0.0) || !(res > 0.0) {
            return current;
        }
        let ratio = res / current;
        self.to_world *= Matrix4::new_nonuniform_scaling(&Vector3::new(ratio, ratio, ratio));
        if !self.bb.is_empty() {
            self.bb = self.bb.scaled(1.0 / ratio);
        }
        debug!("display resolution {res:.3} mm (ratio {ratio:.3})");
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use proptest::prelude::*;

    fn volume(dims: (usize, usize, usize), vox: [f64; 3], origin: [f64; 3]) -> Volume {
        Volume::with_voxel_size("v", Array3::zeros(dims), vox, origin).unwrap()
    }

    fn near(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_empty_volume_set_gives_sentinel() {
        let space = DisplaySpace::identity();
        let bb = space.max_bounding_box(std::iter::empty()).unwrap();
        assert!(bb.is_empty());
        assert_eq!(bb.dims(), [1, 1, 1]);
    }

    #[test]
    fn test_max_bounding_box_is_union_and_idempotent() {
        let space = DisplaySpace::identity();
        let a = volume((10, 10, 10), [2.0; 3], [0.0; 3]);
        let b = volume((5, 5, 5), [1.0; 3], [-10.0, 30.0, 0.0]);
        let bb = space.max_bounding_box([&a, &b]).unwrap();
        assert!(near(bb.min.x, -10.0));
        assert!(near(bb.max.x, 18.0));
        assert!(near(bb.max.y, 34.0));
        assert_eq!(bb, space.max_bounding_box([&a, &b]).unwrap());
    }

    #[test]
    fn test_set_space_flips_left_handed_grid() {
        let mut affine = Matrix4::identity();
        affine[(0, 0)] = -2.0;
        affine[(1, 1)] = 2.0;
        affine[(2, 2)] = 3.0;
        affine[(0, 3)] = 90.0;
        let vol = Volume::new("lh", Array3::zeros((10, 8, 6)), affine).unwrap();
        let mut space = DisplaySpace::identity();
        space.set_space(&vol).unwrap();

        // Voxel (0,0,0) sits at display origin and the box spans [-18, 0] on x.
        let bb = space.bounding_box();
        assert!(near(bb.min.x, -18.0) && near(bb.max.x, 0.0));
        assert!(near(bb.max.y, 14.0) && near(bb.max.z, 15.0));
        // Display-to-world along x stays a positive direction in world space.
        assert!(near(space.to_world()[(0, 0)], 1.0));
        let world = vol.voxel_to_world(&Point3::new(9.0, 7.0, 5.0));
        let display = space.world_to_display(&world).unwrap();
        assert!(near(display.x, -18.0) && near(display.y, 14.0) && near(display.z, 15.0));
    }

    #[test]
    fn test_set_space_on_zero_length_axis() {
        let vol = volume((0, 4, 3), [1.0; 3], [0.0; 3]);
        let mut space = DisplaySpace::identity();
        space.set_space(&vol).unwrap();
        let bb = space.bounding_box();
        assert!(near(bb.min.x, 0.0) && near(bb.max.x, 0.0));
        assert!(near(bb.max.y, 3.0) && near(bb.max.z, 2.0));
    }

    #[test]
    fn test_resolution_respects_smallest_voxel_and_target() {
        let vol = volume((64, 64, 40), [2.0, 2.0, 3.0], [0.0; 3]);
        let mut space = DisplaySpace::identity();
        space.set_space(&vol).unwrap();
        let res = space.resolution(1.0, [&vol]);
        assert!(near(res, 2.0));
        assert_eq!(space.bounding_box().dims(), [64, 64, 60]);
        // Applying the same resolution again changes nothing.
        let before = space.clone();
        space.resolution(1.0, [&vol]);
        assert!((space.to_world() - before.to_world()).norm() < 1e-9);

        let mut coarse = DisplaySpace::identity();
        coarse.set_space(&vol).unwrap();
        assert!(near(coarse.resolution(4.0, [&vol]), 4.0));
        assert!(near(coarse.scale().x, 4.0));
    }

    proptest! {
        #[test]
        fn bounding_box_grows_monotonically(
            specs in proptest::collection::vec(
                (1usize..6, 1usize..6, 1usize..6, 0.5f64..3.0, -50.0f64..50.0, -50.0f64..50.0),
                1..6,
            )
        ) {
            let space = DisplaySpace::identity();
            let vols: Vec<Volume> = specs
                .iter()
                .map(|&(x, y, z, vox, ox, oy)| volume((x, y, z), [vox; 3], [ox, oy, 0.0]))
                .collect();
            let mut previous = BoundingBox::empty();
            for n in 1..=vols.len() {
                let bb = space.max_bounding_box(vols[..n].iter()).unwrap();
                prop_assert!(bb.contains(&previous, 1e-9));
                previous = bb;
            }
            // Removing a volume never grows the box.
            let all = space.max_bounding_box(vols.iter()).unwrap();
            let fewer = space.max_bounding_box(vols[1..].iter()).unwrap();
            prop_assert!(all.contains(&fewer, 1e-9));
        }
    }
}
