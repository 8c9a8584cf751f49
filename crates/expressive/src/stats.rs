//! Global mean/variance (gcmvn) statistics shipped with the vocoder assets.

use std::path::Path;

use memmap2::MmapOptions;
use safetensors::tensor::{Dtype, SafeTensorError};
use thiserror::Error;

use crate::constants::NUM_MEL_BINS;

pub const GCMVN_MEAN_TENSOR: &str = "gcmvn_mean";
pub const GCMVN_STD_TENSOR: &str = "gcmvn_std";

#[derive(Debug, Clone)]
pub struct TensorF32 {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Read-only view over a safetensors file.
#[derive(Debug)]
pub struct TensorStore {
    mmap: memmap2::Mmap,
}

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("safetensors error: {0}")]
    SafeTensors(#[from] SafeTensorError),
    #[error("unsupported dtype for {name}: {dtype:?}")]
    UnsupportedDtype { name: String, dtype: Dtype },
    #[error("invalid tensor byte length for {name}: got {bytes}, expected multiple of {elem_size}")]
    InvalidByteLen {
        name: String,
        bytes: usize,
        elem_size: usize,
    },
    #[error("{name} has {got} values, expected {expected}")]
    WrongLength {
        name: &'static str,
        got: usize,
        expected: usize,
    },
    #[error("{name} has shape {got:?}, expected {expected:?}")]
    WrongShape {
        name: &'static str,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    #[error("{name} contains a non-positive or non-finite value at bin {bin}")]
    InvalidStd { name: &'static str, bin: usize },
}

impl TensorStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StatsError> {
        let file = std::fs::File::open(path)?;
        // SAFETY: read-only file mapping for immutable tensor access.
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        Ok(Self { mmap })
    }

    pub fn tensor_f32(&self, name: &str) -> Result<TensorF32, StatsError> {
        let st = safetensors::SafeTensors::deserialize(&self.mmap)?;
        let tv = st.tensor(name)?;
        let dtype = tv.dtype();
        let shape = tv.shape().to_vec();
        let raw = tv.data();

        let data = match dtype {
            Dtype::F32 => {
                if raw.len() % 4 != 0 {
                    return Err(StatsError::InvalidByteLen {
                        name: name.to_string(),
                        bytes: raw.len(),
                        elem_size: 4,
                    });
                }
                raw.chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect()
            }
            Dtype::F64 => {
                if raw.len() % 8 != 0 {
                    return Err(StatsError::InvalidByteLen {
                        name: name.to_string(),
                        bytes: raw.len(),
                        elem_size: 8,
                    });
                }
                raw.chunks_exact(8)
                    .map(|c| {
                        let mut b = [0u8; 8];
                        b.copy_from_slice(c);
                        f64::from_le_bytes(b) as f32
                    })
                    .collect()
            }
            other => {
                return Err(StatsError::UnsupportedDtype {
                    name: name.to_string(),
                    dtype: other,
                });
            }
        };

        Ok(TensorF32 { shape, data })
    }
}

/// Per-bin global statistics used to standardize the prosody encoder input.
#[derive(Debug, Clone, PartialEq)]
pub struct GcmvnStats {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl GcmvnStats {
    pub fn new(mean: Vec<f32>, std: Vec<f32>) -> Result<Self, StatsError> {
        if mean.len() != NUM_MEL_BINS {
            return Err(StatsError::WrongLength {
                name: GCMVN_MEAN_TENSOR,
                got: mean.len(),
                expected: NUM_MEL_BINS,
            });
        }
        if std.len() != NUM_MEL_BINS {
            return Err(StatsError::WrongLength {
                name: GCMVN_STD_TENSOR,
                got: std.len(),
                expected: NUM_MEL_BINS,
            });
        }
        if let Some(bin) = std.iter().position(|&s| !(s.is_finite() && s > 0.0)) {
            return Err(StatsError::InvalidStd {
                name: GCMVN_STD_TENSOR,
                bin,
            });
        }
        Ok(Self { mean, std })
    }

    /// Load `gcmvn_mean` / `gcmvn_std` from a safetensors file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StatsError> {
        let store = TensorStore::open(path)?;
        let mean = bin_vector(&store, GCMVN_MEAN_TENSOR)?;
        let std = bin_vector(&store, GCMVN_STD_TENSOR)?;
        Self::new(mean, std)
    }

    /// Zero mean, unit std. Leaves features unchanged.
    #[must_use]
    pub fn identity() -> Self {
        Self {
            mean: vec![0.0; NUM_MEL_BINS],
            std: vec![1.0; NUM_MEL_BINS],
        }
    }
}

/// One value per mel bin, stored as a rank-1 tensor.
fn bin_vector(store: &TensorStore, name: &'static str) -> Result<Vec<f32>, StatsError> {
    let tensor = store.tensor_f32(name)?;
    if tensor.shape != [NUM_MEL_BINS] {
        return Err(StatsError::WrongShape {
            name,
            got: tensor.shape,
            expected: vec![NUM_MEL_BINS],
        });
    }
    Ok(tensor.data)
}
