//! Gradient-based attribution with respect to input embeddings.
//!
//! All strategies here need the model in [`InputMode::Embeddings`], i.e. with
//! an [`InterpretableEmbedding`](crate::core::InterpretableEmbedding) installed.

use tch::{Kind, Tensor};

use super::{check_target, Attributor};
use crate::core::model::{CnnClassifier, InputMode};
use crate::{Result, SaliencyError};

/// Pre-activations closer than this to the baseline use the local ReLU
/// derivative instead of the finite-difference ratio.
const DEEPLIFT_EPS: f64 = 1e-10;

/// Absolute gradient of the target logit.
#[derive(Debug, Clone, Copy, Default)]
pub struct Saliency;

/// Gradient of the target logit times the input.
#[derive(Debug, Clone, Copy, Default)]
pub struct InputXGradient;

/// Gradient where every ReLU passes back only positive gradient.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuidedBackprop;

/// DeepLift rescale rule against an all-zero embedding baseline.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeepLift;

fn prepare(model: &CnnClassifier, inputs: &Tensor, target: i64) -> Result<Tensor> {
    model.expect_input_mode(InputMode::Embeddings)?;
    check_target(model, target)?;
    if inputs.dim() != 3 {
        return Err(SaliencyError::Attribution(format!(
            "gradient methods take (batch, tokens, dim) embeddings, got {:?}",
            inputs.size()
        )));
    }
    Ok(inputs.detach().to_kind(Kind::Float).set_requires_grad(true))
}

/// Sum over the batch of the `target` logit, the objective differentiated.
fn objective(logits: &Tensor, target: i64) -> Tensor {
    logits.select(1, target).sum(Kind::Float)
}

fn single_gradient(objective: &Tensor, input: &Tensor) -> Result<Tensor> {
    Tensor::f_run_backward(&[objective], &[input], false, false)?
        .pop()
        .ok_or_else(|| SaliencyError::Attribution("backward pass returned no gradient".into()))
}

/// Gradient of the target logit with respect to `inputs`.
fn input_gradient(model: &CnnClassifier, inputs: &Tensor, target: i64) -> Result<Tensor> {
    let logits = model.forward(inputs);
    single_gradient(&objective(&logits, target), inputs)
}

/// Propagates per-feature multipliers at the convolution outputs back to the
/// embeddings. The convolutions are linear in the embeddings, so this is the
/// gradient of `sum(pre * multipliers)`.
fn through_convolutions(
    embeddings: &Tensor,
    preactivations: &[Tensor],
    multipliers: &[Tensor],
) -> Result<Tensor> {
    let terms: Vec<Tensor> = preactivations
        .iter()
        .zip(multipliers)
        .map(|(pre, multiplier)| (pre * multiplier).sum(Kind::Float))
        .collect();
    let surrogate = Tensor::stack(&terms, 0).sum(Kind::Float);
    single_gradient(&surrogate, embeddings)
}

/// Gradients of the target logit with respect to each convolution's
/// post-ReLU activations.
fn activation_gradients(
    model: &CnnClassifier,
    activations: &[Tensor],
    target: i64,
) -> Result<Vec<Tensor>> {
    let logits = model.head(activations);
    Ok(Tensor::f_run_backward(
        &[objective(&logits, target)],
        activations,
        false,
        false,
    )?)
}

impl Attributor for Saliency {
    fn attribute(&self, model: &CnnClassifier, inputs: &Tensor, target: i64) -> Result<Tensor> {
        let inputs = prepare(model, inputs, target)?;
        Ok(input_gradient(model, &inputs, target)?.abs())
    }
}

impl Attributor for InputXGradient {
    fn attribute(&self, model: &CnnClassifier, inputs: &Tensor, target: i64) -> Result<Tensor> {
        let inputs = prepare(model, inputs, target)?;
        let gradient = input_gradient(model, &inputs, target)?;
        Ok(gradient * inputs.detach())
    }
}

impl Attributor for GuidedBackprop {
    fn attribute(&self, model: &CnnClassifier, inputs: &Tensor, target: i64) -> Result<Tensor> {
        let embeddings = prepare(model, inputs, target)?;
        let preactivations = model.conv_preactivations(&embeddings);

        // gradients at the ReLU inputs already carry the forward mask (pre > 0)
        let leaves: Vec<Tensor> = preactivations
            .iter()
            .map(|pre| pre.detach().set_requires_grad(true))
            .collect();
        let activations: Vec<Tensor> = leaves.iter().map(|pre| pre.relu()).collect();
        let logits = model.head(&activations);
        let grads = Tensor::f_run_backward(&[objective(&logits, target)], &leaves, false, false)?;

        let guided: Vec<Tensor> = grads.iter().map(|grad| grad.clamp_min(0.0)).collect();
        through_convolutions(&embeddings, &preactivations, &guided)
    }
}

impl Attributor for DeepLift {
    fn attribute(&self, model: &CnnClassifier, inputs: &Tensor, target: i64) -> Result<Tensor> {
        let embeddings = prepare(model, inputs, target)?;
        let baseline = embeddings.zeros_like();

        let preactivations = model.conv_preactivations(&embeddings);
        let reference = tch::no_grad(|| model.conv_preactivations(&baseline));

        // max pooling and the linear head route multipliers like gradients
        let activations: Vec<Tensor> = preactivations
            .iter()
            .map(|pre| pre.detach().relu().set_requires_grad(true))
            .collect();
        let head_multipliers = activation_gradients(model, &activations, target)?;

        let multipliers: Vec<Tensor> = preactivations
            .iter()
            .zip(&reference)
            .zip(&head_multipliers)
            .map(|((pre, base), upstream)| upstream * relu_rescale(&pre.detach(), base))
            .collect();
        let embedding_multipliers =
            through_convolutions(&embeddings, &preactivations, &multipliers)?;

        Ok((embeddings.detach() - baseline) * embedding_multipliers)
    }
}

/// Rescale multipliers of a ReLU: `Δout / Δin` where the input moved away from
/// the reference, the local derivative elsewhere.
fn relu_rescale(pre: &Tensor, reference: &Tensor) -> Tensor {
    let delta_in = pre - reference;
    let delta_out = pre.relu() - reference.relu();
    let significant = delta_in.abs().gt(DEEPLIFT_EPS);
    let safe_delta = delta_in.where_self(&significant, &delta_in.ones_like());
    let local = pre.gt(0.0).to_kind(Kind::Float);
    (delta_out / safe_delta).where_self(&significant, &local)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::tests::tiny_args;
    use crate::core::model::InterpretableEmbedding;
    use tch::Device;

    fn model(seed: i64) -> CnnClassifier {
        tch::manual_seed(seed);
        CnnClassifier::new(&tiny_args(), 0, Device::Cpu).unwrap()
    }

    fn ids() -> Tensor {
        Tensor::from_slice2(&[&[2i64, 5, 7, 9, 3], &[2, 6, 8, 3, 0]])
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f64 {
        (a - b).abs().max().double_value(&[])
    }

    #[test]
    fn test_requires_interpretable_embedding() {
        let model = model(5);
        let embeddings = model.embed(&ids());

        let result = Saliency.attribute(&model, &embeddings, 0);

        assert!(matches!(result, Err(SaliencyError::Attribution(_))));
    }

    #[test]
    fn test_rejects_unknown_target() {
        let mut model = model(5);
        let adapter = InterpretableEmbedding::install(&mut model);
        let embeddings = adapter.indices_to_embeddings(&ids());

        assert!(Saliency.attribute(adapter.model(), &embeddings, 3).is_err());
        assert!(Saliency.attribute(adapter.model(), &embeddings, -1).is_err());
    }

    #[test]
    fn test_shapes_match_inputs() {
        let mut model = model(6);
        let adapter = InterpretableEmbedding::install(&mut model);
        let embeddings = adapter.indices_to_embeddings(&ids());

        let strategies: [&dyn Attributor; 4] =
            [&Saliency, &InputXGradient, &GuidedBackprop, &DeepLift];
        for strategy in strategies {
            let scores = strategy.attribute(adapter.model(), &embeddings, 1).unwrap();
            assert_eq!(scores.size(), vec![2, 5, 8]);
        }
    }

    #[test]
    fn test_saliency_is_abs_gradient() {
        let mut model = model(7);
        let adapter = InterpretableEmbedding::install(&mut model);
        let embeddings = adapter.indices_to_embeddings(&ids());

        let saliency = Saliency.attribute(adapter.model(), &embeddings, 2).unwrap();
        let input_x = InputXGradient
            .attribute(adapter.model(), &embeddings, 2)
            .unwrap();

        assert!(saliency.min().double_value(&[]) >= 0.0);
        let expected = (&saliency * embeddings.detach()).abs();
        assert!(max_abs_diff(&input_x.abs(), &expected) < 1e-5);
    }

    #[test]
    fn test_padding_embeddings_get_zero_input_x_gradient() {
        let mut model = model(8);
        let adapter = InterpretableEmbedding::install(&mut model);
        let embeddings = adapter.indices_to_embeddings(&ids());

        let scores = InputXGradient
            .attribute(adapter.model(), &embeddings, 0)
            .unwrap();

        let padding = scores.get(1).get(4);
        assert_eq!(padding.abs().sum(Kind::Float).double_value(&[]), 0.0);
    }

    #[test]
    fn test_deeplift_completeness() {
        let mut model = model(9);
        let adapter = InterpretableEmbedding::install(&mut model);
        let embeddings = adapter.indices_to_embeddings(&ids());
        let target = 1;

        let scores = DeepLift.attribute(adapter.model(), &embeddings, target).unwrap();

        // the zero baseline gives position-independent pre-activations, so the
        // attributions sum exactly to the logit difference
        let logits = adapter.model().forward(&embeddings).select(1, target);
        let reference = adapter
            .model()
            .forward(&embeddings.zeros_like())
            .select(1, target);
        let totals = scores.sum_dim_intlist([1, 2], false, Kind::Float);
        assert!(max_abs_diff(&totals, &(logits - reference)) < 1e-4);
    }

    #[test]
    fn test_guided_matches_gradient_with_positive_head() {
        let mut model = model(10);
        tch::no_grad(|| {
            let mut weight = model.var_store().variables()["final.weight"].shallow_clone();
            let _ = weight.abs_();
        });
        let adapter = InterpretableEmbedding::install(&mut model);
        let embeddings = adapter.indices_to_embeddings(&ids());

        let guided = GuidedBackprop
            .attribute(adapter.model(), &embeddings, 0)
            .unwrap();
        let inputs = embeddings.detach().set_requires_grad(true);
        let plain = input_gradient(adapter.model(), &inputs, 0).unwrap();

        assert!(max_abs_diff(&guided, &plain) < 1e-5);
    }

    #[test]
    fn test_relu_rescale() {
        let pre = Tensor::from_slice(&[2.0f32, -1.0, 0.5, 3.0]);
        let reference = Tensor::from_slice(&[1.0f32, 1.0, 0.5, -1.0]);

        let multipliers = relu_rescale(&pre, &reference);

        // (2-1)/(2-1), (0-1)/(-1-1), local derivative at 0.5, (3-0)/(3+1)
        let expected = Tensor::from_slice(&[1.0f32, 0.5, 1.0, 0.75]);
        assert!(max_abs_diff(&multipliers, &expected) < 1e-6);
    }
}
