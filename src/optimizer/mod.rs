//! Gradient update rules
//!
//! One capability: apply a single gradient step to a parameter buffer given
//! its optimizer-state buffer. The rule never touches versioning or locking;
//! the store owns both.

mod momentum;
mod sgd;

pub use momentum::Momentum;
pub use sgd::Sgd;

use crate::common::Result;
use crate::store::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// Strategy for moving parameters from state `t` to `t+1` given a gradient.
pub trait Optimizer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Apply one gradient step.
    ///
    /// Must validate shape/type compatibility before writing any element, so
    /// a failed step leaves `value` and `state` untouched.
    fn step(&self, value: &mut Tensor, state: &mut Tensor, grad: &Tensor) -> Result<()>;
}

/// Update-rule selection, consumed from the configuration surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "lowercase")]
pub enum OptimizerConfig {
    Sgd { learning_rate: f64 },
    Momentum { learning_rate: f64, momentum: f64 },
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig::Sgd {
            learning_rate: 0.01,
        }
    }
}

impl OptimizerConfig {
    pub fn build(&self) -> Box<dyn Optimizer> {
        match *self {
            OptimizerConfig::Sgd { learning_rate } => Box::new(Sgd::new(learning_rate)),
            OptimizerConfig::Momentum {
                learning_rate,
                momentum,
            } => Box::new(Momentum::new(learning_rate, momentum)),
        }
    }
}
