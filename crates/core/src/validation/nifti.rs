//! Minimal NIfTI-1 reader: header geometry and label scanning.
//!
//! Handles single-file volumes (`.nii`) and their gzip-compressed form
//! (`.nii.gz`, detected by magic bytes), in either byte order.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use thiserror::Error;

use crate::job::VoxelGrid;

/// Size of a NIfTI-1 header.
pub const HEADER_SIZE: usize = 348;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Voxels decoded per read.
const SCAN_CHUNK_VOXELS: usize = 64 * 1024;

/// Errors from reading a NIfTI file.
#[derive(Debug, Error)]
pub enum NiftiError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a NIfTI-1 file: {0}")]
    NotNifti(String),

    #[error("Unsupported NIfTI datatype code {0}")]
    UnsupportedDatatype(i16),

    #[error("Voxel data truncated: expected {expected} bytes, found {actual}")]
    Truncated { expected: u64, actual: u64 },
}

/// Fields of a NIfTI-1 header that matter for validation.
#[derive(Debug, Clone, PartialEq)]
pub struct NiftiHeader {
    pub dim: [i16; 8],
    pub datatype: i16,
    pub bitpix: i16,
    pub pixdim: [f32; 8],
    pub vox_offset: f32,
    pub scl_slope: f32,
    pub scl_inter: f32,
    pub little_endian: bool,
}

impl NiftiHeader {
    /// Reads the header of a `.nii` or `.nii.gz` file.
    pub fn read(path: &Path) -> Result<Self, NiftiError> {
        let mut reader = open_volume(path)?;
        Self::from_reader(&mut reader)
    }

    fn from_reader(reader: &mut dyn Read) -> Result<Self, NiftiError> {
        let mut raw = [0u8; HEADER_SIZE];
        reader.read_exact(&mut raw).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                NiftiError::NotNifti("file shorter than a NIfTI-1 header".to_string())
            } else {
                NiftiError::Io(e)
            }
        })?;
        Self::parse(&raw)
    }

    /// Parses a raw 348-byte header.
    pub fn parse(raw: &[u8; HEADER_SIZE]) -> Result<Self, NiftiError> {
        let sizeof_le = i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let sizeof_be = i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let little_endian = match (sizeof_le, sizeof_be) {
            (348, _) => true,
            (_, 348) => false,
            _ => {
                return Err(NiftiError::NotNifti(format!(
                    "sizeof_hdr is {}, expected 348",
                    sizeof_le
                )))
            }
        };

        let magic = &raw[344..348];
        if magic != b"n+1\0" && magic != b"ni1\0" {
            return Err(NiftiError::NotNifti("missing n+1/ni1 magic".to_string()));
        }

        let i16_at = |offset: usize| {
            let bytes = [raw[offset], raw[offset + 1]];
            if little_endian {
                i16::from_le_bytes(bytes)
            } else {
                i16::from_be_bytes(bytes)
            }
        };
        let f32_at = |offset: usize| {
            let bytes = [raw[offset], raw[offset + 1], raw[offset + 2], raw[offset + 3]];
            if little_endian {
                f32::from_le_bytes(bytes)
            } else {
                f32::from_be_bytes(bytes)
            }
        };

        let mut dim = [0i16; 8];
        let mut pixdim = [0f32; 8];
        for i in 0..8 {
            dim[i] = i16_at(40 + 2 * i);
            pixdim[i] = f32_at(76 + 4 * i);
        }

        if !(1..=7).contains(&dim[0]) {
            return Err(NiftiError::NotNifti(format!(
                "dim[0] is {}, expected 1..=7",
                dim[0]
            )));
        }

        let header = Self {
            dim,
            datatype: i16_at(70),
            bitpix: i16_at(72),
            pixdim,
            vox_offset: f32_at(108),
            scl_slope: f32_at(112),
            scl_inter: f32_at(116),
            little_endian,
        };
        if header.voxel_count().is_none() {
            return Err(NiftiError::NotNifti(format!(
                "voxel count of dims {:?} overflows",
                &dim[1..=header.ndim()]
            )));
        }
        Ok(header)
    }

    /// Number of dimensions in use.
    pub fn ndim(&self) -> usize {
        self.dim[0] as usize
    }

    /// Spatial grid (first three axes; missing axes count as 1).
    pub fn grid(&self) -> VoxelGrid {
        let axis = |i: usize| {
            if i <= self.ndim() {
                self.dim[i].max(0) as u32
            } else {
                1
            }
        };
        let spacing = |i: usize| {
            if i <= self.ndim() {
                self.pixdim[i].abs()
            } else {
                1.0
            }
        };
        VoxelGrid {
            dims: [axis(1), axis(2), axis(3)],
            spacing: [spacing(1), spacing(2), spacing(3)],
        }
    }

    /// Total voxels over all used dimensions, `None` if the product overflows.
    pub fn voxel_count(&self) -> Option<u64> {
        (1..=self.ndim())
            .map(|i| self.dim[i].max(0) as u64)
            .try_fold(1u64, |acc, d| acc.checked_mul(d))
    }

    fn bytes_per_voxel(&self) -> Result<usize, NiftiError> {
        match self.datatype {
            2 | 256 => Ok(1),
            4 | 512 => Ok(2),
            8 | 16 | 768 => Ok(4),
            64 => Ok(8),
            other => Err(NiftiError::UnsupportedDatatype(other)),
        }
    }
}

/// Opens a volume, transparently decompressing gzip.
fn open_volume(path: &Path) -> Result<Box<dyn Read>, NiftiError> {
    let mut reader = BufReader::new(File::open(path)?);
    let is_gzip = reader.fill_buf()?.starts_with(&GZIP_MAGIC);
    if is_gzip {
        Ok(Box::new(GzDecoder::new(reader)))
    } else {
        Ok(Box::new(reader))
    }
}

/// Distinct non-zero label values of an integer-valued volume.
pub fn distinct_labels(path: &Path) -> Result<BTreeSet<i64>, NiftiError> {
    let mut reader = open_volume(path)?;
    let header = NiftiHeader::from_reader(&mut reader)?;

    let bytes_per_voxel = header.bytes_per_voxel()?;

    // Extensions and padding between the header and the voxel data
    let skip = (header.vox_offset.max(HEADER_SIZE as f32) as u64) - HEADER_SIZE as u64;
    std::io::copy(&mut (&mut reader).take(skip), &mut std::io::sink())?;

    let total_bytes = header
        .voxel_count()
        .and_then(|voxels| voxels.checked_mul(bytes_per_voxel as u64))
        .ok_or_else(|| NiftiError::NotNifti("voxel data size overflows".to_string()))?;
    let mut remaining = total_bytes;
    let mut buffer = vec![0u8; SCAN_CHUNK_VOXELS * bytes_per_voxel];
    let mut labels = BTreeSet::new();

    let scaled = (header.scl_slope != 0.0 && header.scl_slope != 1.0) || header.scl_inter != 0.0;

    while remaining > 0 {
        let want = remaining.min(buffer.len() as u64) as usize;
        let filled = read_full(&mut reader, &mut buffer[..want])?;
        if filled < want {
            return Err(NiftiError::Truncated {
                expected: total_bytes,
                actual: total_bytes - remaining + filled as u64,
            });
        }

        for voxel in buffer[..filled].chunks_exact(bytes_per_voxel) {
            let mut value = decode_voxel(header.datatype, voxel, header.little_endian);
            if scaled {
                let slope = if header.scl_slope == 0.0 {
                    1.0
                } else {
                    header.scl_slope as f64
                };
                value = value * slope + header.scl_inter as f64;
            }
            let label = value.round() as i64;
            if label != 0 {
                labels.insert(label);
            }
        }

        remaining -= filled as u64;
    }

    Ok(labels)
}

pub(super) fn read_full(reader: &mut dyn Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn decode_voxel(datatype: i16, bytes: &[u8], little_endian: bool) -> f64 {
    macro_rules! decode {
        ($ty:ty, $n:expr) => {{
            let mut raw = [0u8; $n];
            raw.copy_from_slice(&bytes[..$n]);
            if little_endian {
                <$ty>::from_le_bytes(raw) as f64
            } else {
                <$ty>::from_be_bytes(raw) as f64
            }
        }};
    }

    match datatype {
        2 => bytes[0] as f64,
        256 => bytes[0] as i8 as f64,
        4 => decode!(i16, 2),
        512 => decode!(u16, 2),
        8 => decode!(i32, 4),
        768 => decode!(u32, 4),
        16 => decode!(f32, 4),
        64 => decode!(f64, 8),
        _ => 0.0,
    }
}
