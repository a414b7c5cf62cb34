use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    I64,
    I32,
    U8,
}

impl DType {
    pub fn byte_size(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::I64 => 8,
            DType::I32 => 4,
            DType::U8 => 1,
        }
    }
}

/// Rust scalar types that can back a tensor buffer.
pub trait Element: bytemuck::Pod {
    const DTYPE: DType;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;
}

impl Element for i64 {
    const DTYPE: DType = DType::I64;
}

impl Element for i32 {
    const DTYPE: DType = DType::I32;
}

impl Element for u8 {
    const DTYPE: DType = DType::U8;
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape(pub SmallVec<[usize; 6]>);

impl Shape {
    pub fn from_slice(d: &[usize]) -> Self {
        Self(d.iter().copied().collect())
    }
    pub fn rank(&self) -> usize {
        self.0.len()
    }
    pub fn dims(&self) -> &[usize] {
        &self.0
    }
    pub fn numel(&self) -> usize {
        self.0.iter().product::<usize>()
    }
    /// A usable shape has at least one dimension and no zero-sized ones.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(|&d| d > 0)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

impl From<&[usize]> for Shape {
    fn from(d: &[usize]) -> Self {
        Self::from_slice(d)
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(d: [usize; N]) -> Self {
        Self::from_slice(&d)
    }
}

/// Affine quantization: `real = scale * (q - zero_point)`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuantizationInfo {
    pub scale: f32,
    pub zero_point: i32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TensorDescriptor {
    pub shape: Shape,
    pub dtype: DType,
    pub quantization: Option<QuantizationInfo>,
    pub is_constant: bool,
}

impl TensorDescriptor {
    pub fn new(shape: impl Into<Shape>, dtype: DType) -> Self {
        Self {
            shape: shape.into(),
            dtype,
            quantization: None,
            is_constant: false,
        }
    }

    pub fn with_quantization(mut self, scale: f32, zero_point: i32) -> Self {
        self.quantization = Some(QuantizationInfo { scale, zero_point });
        self
    }

    pub fn constant(mut self, is_constant: bool) -> Self {
        self.is_constant = is_constant;
        self
    }

    pub fn num_elements(&self) -> usize {
        self.shape.numel()
    }

    pub fn num_bytes(&self) -> usize {
        self.num_elements() * self.dtype.byte_size()
    }

    /// Same shape, dtype and quantization; constancy is a property of the view.
    pub fn is_compatible_with(&self, other: &TensorDescriptor) -> bool {
        self.shape == other.shape
            && self.dtype == other.dtype
            && self.quantization == other.quantization
    }

    /// Reads native-endian elements into real values, dequantizing integer
    /// types that carry quantization parameters.
    pub fn decode_f32(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        if bytes.len() != self.num_bytes() {
            return Err(Error::Execution(format!(
                "expected {} bytes for tensor {}, got {}",
                self.num_bytes(),
                self.shape,
                bytes.len()
            )));
        }
        let q = self.quantization;
        let dequant = |v: f64| match q {
            Some(q) => (q.scale as f64 * (v - q.zero_point as f64)) as f32,
            None => v as f32,
        };
        let values = match self.dtype {
            DType::F32 => bytes
                .chunks_exact(4)
                .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
            DType::I64 => bytes
                .chunks_exact(8)
                .map(|b| {
                    let v = i64::from_ne_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
                    dequant(v as f64)
                })
                .collect(),
            DType::I32 => bytes
                .chunks_exact(4)
                .map(|b| dequant(i32::from_ne_bytes([b[0], b[1], b[2], b[3]]) as f64))
                .collect(),
            DType::U8 => bytes.iter().map(|&b| dequant(b as f64)).collect(),
        };
        Ok(values)
    }

    /// Inverse of [`decode_f32`](Self::decode_f32): quantizes (round, clamp)
    /// integer outputs and writes native-endian elements into `out`.
    pub fn encode_f32(&self, values: &[f32], out: &mut [u8]) -> Result<()> {
        if values.len() != self.num_elements() || out.len() != self.num_bytes() {
            return Err(Error::Execution(format!(
                "cannot write {} values into a {} byte buffer for tensor {}",
                values.len(),
                out.len(),
                self.shape
            )));
        }
        let q = self.quantization;
        let quant = |v: f32| -> f64 {
            match q {
                Some(q) => (v as f64 / q.scale as f64).round() + q.zero_point as f64,
                None => (v as f64).round(),
            }
        };
        match self.dtype {
            DType::F32 => {
                for (dst, v) in out.chunks_exact_mut(4).zip(values) {
                    dst.copy_from_slice(&v.to_ne_bytes());
                }
            }
            DType::I64 => {
                for (dst, v) in out.chunks_exact_mut(8).zip(values) {
                    let q = quant(*v).clamp(i64::MIN as f64, i64::MAX as f64) as i64;
                    dst.copy_from_slice(&q.to_ne_bytes());
                }
            }
            DType::I32 => {
                for (dst, v) in out.chunks_exact_mut(4).zip(values) {
                    let q = quant(*v).clamp(i32::MIN as f64, i32::MAX as f64) as i32;
                    dst.copy_from_slice(&q.to_ne_bytes());
                }
            }
            DType::U8 => {
                for (dst, v) in out.iter_mut().zip(values) {
                    *dst = quant(*v).clamp(0.0, 255.0) as u8;
                }
            }
        }
        Ok(())
    }
}

/// Immutable tensor data embedded in a graph (weights, biases, ...).
#[derive(Clone, Debug)]
pub struct ConstTensor {
    desc: TensorDescriptor,
    data: Bytes,
}

impl ConstTensor {
    pub fn new<T: Element>(desc: TensorDescriptor, values: &[T]) -> Result<Self> {
        if desc.dtype != T::DTYPE {
            return Err(Error::DTypeMismatch {
                name: "constant".to_string(),
                expected: desc.dtype,
                got: T::DTYPE,
            });
        }
        Self::from_bytes(desc, Bytes::copy_from_slice(bytemuck::cast_slice(values)))
    }

    pub fn from_bytes(desc: TensorDescriptor, data: Bytes) -> Result<Self> {
        if data.len() != desc.num_bytes() {
            return Err(Error::SizeMismatch {
                name: "constant".to_string(),
                expected: desc.num_elements(),
                got: data.len() / desc.dtype.byte_size(),
            });
        }
        Ok(Self {
            desc: desc.constant(true),
            data,
        })
    }

    pub fn desc(&self) -> &TensorDescriptor {
        &self.desc
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }
}
