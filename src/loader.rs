//! NIfTI volumes in, [`Volume`]s out.

use std::io::{Cursor, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use log::{info, warn};
use nalgebra::Matrix4;
use ndarray::{ArrayD, Axis, Ix3};
use nifti::{InMemNiftiVolume, IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};

use crate::error::{Result, ViewerError};
use crate::volume::Volume;

/// Voxel-to-world affine from sform, qform, or pixdims, in that order of preference.
pub fn header_affine(hdr: &NiftiHeader) -> Matrix4<f64> {
    let mut m = Matrix4::identity();
    if hdr.sform_code > 0 {
        for (row, srow) in [hdr.srow_x, hdr.srow_y, hdr.srow_z].iter().enumerate() {
            for col in 0..4 {
                m[(row, col)] = srow[col] as f64;
            }
        }
    } else if hdr.qform_code > 0 {
        let b = hdr.quatern_b as f64;
        let c = hdr.quatern_c as f64;
        let d = hdr.quatern_d as f64;
        let a = (1.0 - b * b - c * c - d * d).max(0.0).sqrt();
        let r = [
            [
                a * a + b * b - c * c - d * d,
                2.0 * (b * c - a * d),
                2.0 * (b * d + a * c),
            ],
            [
                2.0 * (b * c + a * d),
                a * a + c * c - b * b - d * d,
                2.0 * (c * d - a * b),
            ],
            [
                2.0 * (b * d - a * c),
                2.0 * (c * d + a * b),
                a * a + d * d - b * b - c * c,
            ],
        ];
        let qfac = if hdr.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let scale = [
            hdr.pixdim[1] as f64,
            hdr.pixdim[2] as f64,
            hdr.pixdim[3] as f64 * qfac,
        ];
        for row in 0..3 {
            for col in 0..3 {
                m[(row, col)] = r[row][col] * scale[col];
            }
        }
        m[(0, 3)] = hdr.quatern_x as f64;
        m[(1, 3)] = hdr.quatern_y as f64;
        m[(2, 3)] = hdr.quatern_z as f64;
    } else {
        // No orientation info: voxel sizes only.
        for a in 0..3 {
            let p = hdr.pixdim[a + 1] as f64;
            m[(a, a)] = if p > 0.0 { p } else { 1.0 };
        }
    }
    m
}

/// Header fields the viewer shows or consumes as parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct HeaderMetadata {
    pub dims: Vec<usize>,
    pub voxel_size: [f64; 3],
    pub datatype: i16,
    pub description: String,
    /// Parsed from SPM-style `SPM{T_[df]}` descriptions.
    pub degrees_of_freedom: Option<f64>,
}

impl HeaderMetadata {
    pub fn from_header(hdr: &NiftiHeader) -> Self {
        let ndim = (hdr.dim[0] as usize).clamp(1, 7);
        let dims = hdr.dim[1..=ndim].iter().map(|&d| d as usize).collect();
        let description = String::from_utf8_lossy(&hdr.descrip)
            .trim_end_matches('\0')
            .trim()
            .to_string();
        let degrees_of_freedom = degrees_of_freedom(&description);
        Self {
            dims,
            voxel_size: [
                hdr.pixdim[1].abs() as f64,
                hdr.pixdim[2].abs() as f64,
                hdr.pixdim[3].abs() as f64,
            ],
            datatype: hdr.datatype,
            description,
            degrees_of_freedom,
        }
    }
}

/// Degrees of freedom from a description such as `SPM{T_[23.0]} - contrast 1`.
/// For `SPM{F_[1,23]}` the error degrees of freedom are returned.
pub fn degrees_of_freedom(description: &str) -> Option<f64> {
    let start = description.find("SPM{")?;
    let rest = &description[start + 4..];
    let open = rest.find("_[")?;
    let close = rest[open..].find(']')? + open;
    rest[open + 2..close]
        .split(',')
        .last()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|df| df.is_finite() && *df > 0.0)
}

pub fn read_header_metadata(path: impl AsRef<Path>) -> Result<HeaderMetadata> {
    let hdr = NiftiHeader::from_file(path.as_ref())?;
    Ok(HeaderMetadata::from_header(&hdr))
}

fn volume_name(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.trim_end_matches(".gz")
        .trim_end_matches(".nii")
        .to_string()
}

/// Load a `.nii` or `.nii.gz` file.
pub fn load_volume(path: impl AsRef<Path>) -> Result<Volume> {
    let path = path.as_ref();
    let obj = ReaderOptions::new().read_file(path)?;
    let header = obj.header().clone();
    let data = obj.into_volume().into_ndarray::<f32>()?;
    let volume = build_volume(volume_name(path), &header, data)?;
    info!("loaded '{}' {:?}", path.display(), volume.dims());
    Ok(volume)
}

/// Load from an in-memory file, gzip detected from the magic bytes.
pub fn load_volume_bytes(name: impl Into<String>, bytes: &[u8]) -> Result<Volume> {
    let is_gz = bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b;
    let cursor = Cursor::new(bytes);
    if is_gz {
        load_volume_reader(name, GzDecoder::new(cursor))
    } else {
        load_volume_reader(name, cursor)
    }
}

/// Load a single-file NIfTI from an uncompressed stream.
pub fn load_volume_reader<R: Read>(name: impl Into<String>, mut reader: R) -> Result<Volume> {
    let header = NiftiHeader::from_reader(&mut reader)?;
    let vox_offset = header.vox_offset.max(348.0) as usize;
    let skip = vox_offset.saturating_sub(348);
    if skip > 0 {
        let mut discard = vec![0u8; skip];
        reader.read_exact(&mut discard)?;
    }
    let data = InMemNiftiVolume::from_reader(reader, &header)?.into_ndarray::<f32>()?;
    let volume = build_volume(name.into(), &header, data)?;
    info!("loaded '{}' {:?} from memory", volume.name(), volume.dims());
    Ok(volume)
}

fn build_volume(name: String, header: &NiftiHeader, data: ArrayD<f32>) -> Result<Volume> {
    let data = match data.ndim() {
        3 => data,
        4 => {
            if data.shape()[3] > 1 {
                warn!(
                    "'{name}' has {} frames; showing the first",
                    data.shape()[3]
                );
            }
            data.index_axis_move(Axis(3), 0)
        }
        n => return Err(ViewerError::NotThreeDimensional(n)),
    };
    let ndim = data.ndim();
    let data = data
        .into_dimensionality::<Ix3>()
        .map_err(|_| ViewerError::NotThreeDimensional(ndim))?;
    Volume::new(name, data, header_affine(header))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sform_preferred() {
        let hdr = NiftiHeader {
            sform_code: 1,
            qform_code: 1,
            srow_x: [-2.0, 0.0, 0.0, 90.0],
            srow_y: [0.0, 2.0, 0.0, -126.0],
            srow_z: [0.0, 0.0, 2.0, -72.0],
            ..NiftiHeader::default()
        };
        let m = header_affine(&hdr);
        assert_eq!(m[(0, 0)], -2.0);
        assert_eq!(m[(0, 3)], 90.0);
        assert_eq!(m[(2, 3)], -72.0);
        assert_eq!(m[(3, 3)], 1.0);
    }

    #[test]
    fn test_qform_identity_quaternion() {
        let hdr = NiftiHeader {
            sform_code: 0,
            qform_code: 1,
            pixdim: [-1.0, 3.0, 3.0, 4.0, 0.0, 0.0, 0.0, 0.0],
            quatern_x: 1.0,
            quatern_y: 2.0,
            quatern_z: 3.0,
            ..NiftiHeader::default()
        };
        let m = header_affine(&hdr);
        assert_eq!(m[(0, 0)], 3.0);
        assert_eq!(m[(2, 2)], -4.0);
        assert_eq!((m[(0, 3)], m[(1, 3)], m[(2, 3)]), (1.0, 2.0, 3.0));
    }

    #[test]
    fn test_pixdim_fallback() {
        let hdr = NiftiHeader {
            sform_code: 0,
            qform_code: 0,
            pixdim: [1.0, 2.0, 0.0, 3.0, 0.0, 0.0, 0.0, 0.0],
            ..NiftiHeader::default()
        };
        let m = header_affine(&hdr);
        assert_eq!((m[(0, 0)], m[(1, 1)], m[(2, 2)]), (2.0, 1.0, 3.0));
    }

    #[test]
    fn test_degrees_of_freedom() {
        assert_eq!(degrees_of_freedom("SPM{T_[23.0]} - contrast 1: faces"), Some(23.0));
        assert_eq!(degrees_of_freedom("SPM{F_[1.0,40.5]}"), Some(40.5));
        assert_eq!(degrees_of_freedom("SPM{T_[]}"), None);
        assert_eq!(degrees_of_freedom("anatomical"), None);
    }

    #[test]
    fn test_garbage_bytes_are_an_error() {
        assert!(load_volume_bytes("junk", &[0u8; 16]).is_err());
        assert!(load_volume_bytes("junk", &[0x1f, 0x8b, 0, 0]).is_err());
    }

    #[test]
    fn test_volume_name_strips_extensions() {
        assert_eq!(volume_name(Path::new("/data/spmT_0001.nii.gz")), "spmT_0001");
        assert_eq!(volume_name(Path::new("T1.nii")), "T1");
    }
}
