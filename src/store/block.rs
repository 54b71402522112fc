//! A single named parameter block and its optimizer state

use crate::common::{Error, Result};
use crate::store::tensor::{numel, ElementType, Tensor};
use serde::{Deserialize, Serialize};

/// One named parameter: value buffer, same-shaped optimizer state buffer,
/// and a version counter bumped by exactly one per applied update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterBlock {
    pub name: String,
    pub shape: Vec<usize>,
    pub value: Tensor,
    pub state: Tensor,
    pub version: u64,
}

impl ParameterBlock {
    /// Create a block from an initial value. The optimizer state starts
    /// zeroed and the version at 0.
    pub fn new(name: String, shape: Vec<usize>, value: Tensor) -> Result<Self> {
        let expected = numel(&shape).ok_or_else(|| {
            Error::InvalidConfig(format!(
                "shape {shape:?} describes more elements than fit in usize"
            ))
        })?;
        if value.len() != expected {
            return Err(Error::ShapeMismatch {
                expected: format!("{:?} ({} elements)", shape, expected),
                actual: format!("{} elements", value.len()),
            });
        }

        let state = Tensor::zeros(value.element_type(), value.len());
        Ok(Self {
            name,
            shape,
            value,
            state,
            version: 0,
        })
    }

    pub fn element_type(&self) -> ElementType {
        self.value.element_type()
    }

    /// Does this block match the given shape and element type?
    pub fn matches(&self, shape: &[usize], dtype: ElementType) -> bool {
        self.shape == shape && self.element_type() == dtype
    }
}
