//! Dense numeric buffers for parameter and gradient data
//!
//! Parameters are flat f32 or f64 buffers; the logical shape lives on the
//! owning block. Element order is buffer order, so sequential accumulation
//! over a buffer is reproducible run to run.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};

/// Element type of a parameter buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    F32,
    F64,
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElementType::F32 => write!(f, "f32"),
            ElementType::F64 => write!(f, "f64"),
        }
    }
}

/// A dense 1-D numeric buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Tensor {
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl Tensor {
    /// Zero-filled buffer of the given type and length
    pub fn zeros(dtype: ElementType, len: usize) -> Self {
        match dtype {
            ElementType::F32 => Tensor::F32(vec![0.0; len]),
            ElementType::F64 => Tensor::F64(vec![0.0; len]),
        }
    }

    pub fn element_type(&self) -> ElementType {
        match self {
            Tensor::F32(_) => ElementType::F32,
            Tensor::F64(_) => ElementType::F64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Tensor::F32(v) => v.len(),
            Tensor::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check that `other` has the same element type and length.
    pub fn check_compatible(&self, other: &Tensor) -> Result<()> {
        if self.element_type() != other.element_type() || self.len() != other.len() {
            return Err(Error::ShapeMismatch {
                expected: format!("{} x{}", self.element_type(), self.len()),
                actual: format!("{} x{}", other.element_type(), other.len()),
            });
        }
        Ok(())
    }
}

/// Number of elements described by a shape. A scalar (empty shape) has one;
/// `None` when the product overflows `usize`.
pub fn numel(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
}
