//! Perturbation attribution by sliding a baseline window over the tokens.

use tch::{Kind, Tensor};

use super::{check_target, Attributor};
use crate::core::model::{CnnClassifier, InputMode};
use crate::{Result, SaliencyError};

/// Replaces `window` consecutive tokens with `baseline` at every offset
/// (stride 1) and scores each token by the mean drop of the target logit
/// over the windows covering it.
#[derive(Debug, Clone, Copy)]
pub struct Occlusion {
    window: i64,
    baseline: i64,
}

impl Occlusion {
    pub fn new(window: i64, baseline: i64) -> Self {
        Occlusion {
            window: window.max(1),
            baseline,
        }
    }

    pub fn window(&self) -> i64 {
        self.window
    }
}

impl Attributor for Occlusion {
    fn attribute(&self, model: &CnnClassifier, inputs: &Tensor, target: i64) -> Result<Tensor> {
        model.expect_input_mode(InputMode::TokenIds)?;
        check_target(model, target)?;
        let (batch, tokens) = inputs.size2().map_err(|_| {
            SaliencyError::Attribution(format!(
                "occlusion takes (batch, tokens) token ids, got {:?}",
                inputs.size()
            ))
        })?;
        let window = self.window.min(tokens);
        let device = inputs.device();

        tch::no_grad(|| {
            let original = model.forward(inputs).select(1, target);
            let total = Tensor::zeros([batch, tokens], (Kind::Float, device));
            let mut coverage = vec![0f32; tokens as usize];

            for start in 0..=(tokens - window) {
                let occluded = inputs.copy();
                let _ = occluded.narrow(1, start, window).fill_(self.baseline);
                let drop = &original - model.forward(&occluded).select(1, target);

                let mut covered = total.narrow(1, start, window);
                covered += drop.unsqueeze(1);
                for count in &mut coverage[start as usize..(start + window) as usize] {
                    *count += 1.0;
                }
            }

            let coverage = Tensor::from_slice(&coverage).to_device(device);
            Ok(total / coverage)
        })
    }
}
