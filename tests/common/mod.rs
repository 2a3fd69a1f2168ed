#![allow(dead_code)]

use ndarray::Array3;
use nifti_ortho_viewer::Volume;

/// Zeros with a 3x3x3 block of `value` centred on voxel (5,5,5), 2 mm voxels,
/// world origin at that voxel.
pub fn block_statistic(value: f32) -> Volume {
    let data = Array3::from_shape_fn((10, 10, 10), |(x, y, z)| {
        if (4..=6).contains(&x) && (4..=6).contains(&y) && (4..=6).contains(&z) {
            value
        } else {
            0.0
        }
    });
    Volume::with_voxel_size("spmT_0001", data, [2.0; 3], [-10.0; 3]).unwrap()
}

/// Smooth anatomy-like gradient on the same grid as [`block_statistic`].
pub fn anatomy(dims: (usize, usize, usize), voxel_size: [f64; 3]) -> Volume {
    let data = Array3::from_shape_fn(dims, |(x, y, z)| (x + 2 * y + 3 * z) as f32);
    let origin = [
        -(dims.0 as f64 / 2.0) * voxel_size[0],
        -(dims.1 as f64 / 2.0) * voxel_size[1],
        -(dims.2 as f64 / 2.0) * voxel_size[2],
    ];
    Volume::with_voxel_size("T1", data, voxel_size, origin).unwrap()
}
