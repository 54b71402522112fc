use super::Optimizer;
use crate::common::Result;
use crate::store::tensor::Tensor;

/// Momentum-accumulating rule: `v = mu * v + g; w -= lr * v`.
///
/// The gradient is folded into the dedicated velocity buffer first and the
/// combined step applied after, element by element in buffer order, so the
/// result is identical across repeated runs with the same input sequence.
#[derive(Debug)]
pub struct Momentum {
    learning_rate: f64,
    momentum: f64,
}

impl Momentum {
    pub fn new(learning_rate: f64, momentum: f64) -> Self {
        Self {
            learning_rate,
            momentum,
        }
    }
}

impl Optimizer for Momentum {
    fn name(&self) -> &'static str {
        "momentum"
    }

    fn step(&self, value: &mut Tensor, state: &mut Tensor, grad: &Tensor) -> Result<()> {
        value.check_compatible(grad)?;
        value.check_compatible(state)?;

        match (value, state, grad) {
            (Tensor::F32(w), Tensor::F32(v), Tensor::F32(g)) => {
                let lr = self.learning_rate as f32;
                let mu = self.momentum as f32;
                v.iter_mut()
                    .zip(g)
                    .zip(w.iter_mut())
                    .for_each(|((v, g), w)| {
                        *v = mu * *v + g;
                        *w -= lr * *v;
                    });
            }
            (Tensor::F64(w), Tensor::F64(v), Tensor::F64(g)) => {
                let lr = self.learning_rate;
                let mu = self.momentum;
                v.iter_mut()
                    .zip(g)
                    .zip(w.iter_mut())
                    .for_each(|((v, g), w)| {
                        *v = mu * *v + g;
                        *w -= lr * *v;
                    });
            }
            _ => unreachable!(),
        }
        Ok(())
    }
}
