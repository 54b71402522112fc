use super::Optimizer;
use crate::common::Result;
use crate::store::tensor::Tensor;

/// Plain additive rule: `w -= lr * g`. Keeps no optimizer state.
#[derive(Debug)]
pub struct Sgd {
    learning_rate: f64,
}

impl Sgd {
    pub fn new(learning_rate: f64) -> Self {
        Self { learning_rate }
    }
}

impl Optimizer for Sgd {
    fn name(&self) -> &'static str {
        "sgd"
    }

    fn step(&self, value: &mut Tensor, state: &mut Tensor, grad: &Tensor) -> Result<()> {
        value.check_compatible(grad)?;
        let _ = state;

        match (value, grad) {
            (Tensor::F32(w), Tensor::F32(g)) => {
                let lr = self.learning_rate as f32;
                w.iter_mut().zip(g).for_each(|(w, g)| *w -= lr * g);
            }
            (Tensor::F64(w), Tensor::F64(g)) => {
                let lr = self.learning_rate;
                w.iter_mut().zip(g).for_each(|(w, g)| *w -= lr * g);
            }
            // check_compatible already rejected mixed element types
            _ => unreachable!(),
        }
        Ok(())
    }
}
