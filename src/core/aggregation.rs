//! Reduction of attribution tensors to one score per token.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tch::{Kind, Tensor};

use crate::{Result, SaliencyError};

/// Policy reducing a `(batch, tokens, embedding_dim)` attribution to
/// `(batch, tokens)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    /// Pass-through for attributions that are already one scalar per token.
    None,
    /// Dot product of the attribution with the input embedding.
    Dot,
    /// Mean over the embedding dimension, unit L2 norm per instance.
    Mean,
    /// Sum of absolute values over the embedding dimension.
    ///
    /// Despite the name this is an L1 norm; the name is kept so output files
    /// stay comparable with earlier runs.
    L2,
}

impl Aggregation {
    /// Whether the policy reduces 3-D embedding attributions (all but `none`).
    pub fn accepts_embedding_attributions(&self) -> bool {
        !matches!(self, Aggregation::None)
    }

    /// Whether the policy needs the original input embeddings.
    pub fn requires_embeddings(&self) -> bool {
        matches!(self, Aggregation::Dot)
    }

    /// Reduces `attributions` to one scalar per token.
    ///
    /// # Arguments
    /// * `attributions` - `(batch, tokens)` or `(batch, tokens, embedding_dim)`
    /// * `embeddings` - input embeddings matching `attributions`, needed by `dot`
    /// * `mask` - `(batch, tokens)` float mask, 1 for real tokens and 0 for padding
    ///
    /// # Returns
    /// `(batch, tokens)` scores with padding positions set to zero
    pub fn summarize(
        &self,
        attributions: &Tensor,
        embeddings: Option<&Tensor>,
        mask: &Tensor,
    ) -> Result<Tensor> {
        let dims = attributions.dim();
        match (self, dims) {
            (Aggregation::None, 2) => Ok(attributions.to_kind(Kind::Float) * mask),
            (Aggregation::None, _) => Err(SaliencyError::Config(format!(
                "aggregation 'none' needs per-token attributions, got {} dimensions",
                dims
            ))),
            (_, 3) => {
                let reduced = match self {
                    Aggregation::Dot => {
                        let embeddings = embeddings.ok_or_else(|| {
                            SaliencyError::Attribution(
                                "aggregation 'dot' requires the input embeddings".into(),
                            )
                        })?;
                        if embeddings.size() != attributions.size() {
                            return Err(SaliencyError::Attribution(format!(
                                "embeddings {:?} do not match attributions {:?}",
                                embeddings.size(),
                                attributions.size()
                            )));
                        }
                        (attributions * embeddings).sum_dim_intlist([-1], false, Kind::Float)
                    }
                    Aggregation::Mean => {
                        let mean = attributions.mean_dim([-1], false, Kind::Float) * mask;
                        return Ok(normalize_rows(&mean));
                    }
                    Aggregation::L2 => {
                        attributions.abs().sum_dim_intlist([-1], false, Kind::Float)
                    }
                    Aggregation::None => unreachable!(),
                };
                Ok(reduced * mask)
            }
            (_, _) => Err(SaliencyError::Config(format!(
                "aggregation '{}' needs embedding attributions, got {} dimensions",
                self, dims
            ))),
        }
    }
}

/// Scales every row to unit L2 norm; all-zero rows stay zero.
fn normalize_rows(scores: &Tensor) -> Tensor {
    let norms = scores
        .square()
        .sum_dim_intlist([1], true, Kind::Float)
        .sqrt()
        .clamp_min(1e-12);
    scores / norms
}

impl FromStr for Aggregation {
    type Err = SaliencyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Aggregation::None),
            "dot" => Ok(Aggregation::Dot),
            "mean" => Ok(Aggregation::Mean),
            "l2" => Ok(Aggregation::L2),
            other => Err(SaliencyError::Config(format!(
                "unknown aggregation '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Aggregation::None => "none",
            Aggregation::Dot => "dot",
            Aggregation::Mean => "mean",
            Aggregation::L2 => "l2",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_mask(batch: i64, tokens: i64) -> Tensor {
        Tensor::ones([batch, tokens], (Kind::Float, tch::Device::Cpu))
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f64 {
        (a - b).abs().max().double_value(&[])
    }

    #[test]
    fn test_none_passes_through() {
        let attributions = Tensor::from_slice2(&[&[0.5f32, -1.0, 2.0]]);
        let summary = Aggregation::None
            .summarize(&attributions, None, &full_mask(1, 3))
            .unwrap();

        assert!(max_abs_diff(&summary, &attributions) < 1e-6);
    }

    #[test]
    fn test_none_rejects_embedding_attributions() {
        let attributions = Tensor::ones([1, 3, 4], (Kind::Float, tch::Device::Cpu));
        assert!(Aggregation::None
            .summarize(&attributions, None, &full_mask(1, 3))
            .is_err());
    }

    #[test]
    fn test_gradient_policies_reject_token_attributions() {
        let attributions = Tensor::ones([1, 3], (Kind::Float, tch::Device::Cpu));
        for aggregation in [Aggregation::Dot, Aggregation::Mean, Aggregation::L2] {
            assert!(aggregation
                .summarize(&attributions, None, &full_mask(1, 3))
                .is_err());
        }
    }

    #[test]
    fn test_dot_with_embeddings() {
        let attributions = Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0]).view([1, 2, 2]);
        let embeddings = Tensor::from_slice(&[1.0f32, 1.0, 0.5, -1.0]).view([1, 2, 2]);

        let summary = Aggregation::Dot
            .summarize(&attributions, Some(&embeddings), &full_mask(1, 2))
            .unwrap();

        // [1*1 + 2*1, 3*0.5 + 4*-1]
        let expected = Tensor::from_slice2(&[&[3.0f32, -2.5]]);
        assert!(max_abs_diff(&summary, &expected) < 1e-6);
    }

    #[test]
    fn test_dot_requires_embeddings() {
        let attributions = Tensor::ones([1, 2, 2], (Kind::Float, tch::Device::Cpu));
        let result = Aggregation::Dot.summarize(&attributions, None, &full_mask(1, 2));

        assert!(matches!(result, Err(SaliencyError::Attribution(_))));
    }

    #[test]
    fn test_mean_has_unit_norm_per_instance() {
        let attributions = Tensor::randn([3, 5, 4], (Kind::Float, tch::Device::Cpu));
        let summary = Aggregation::Mean
            .summarize(&attributions, None, &full_mask(3, 5))
            .unwrap();

        for i in 0..3 {
            let norm = summary.get(i).norm().double_value(&[]);
            assert!((norm - 1.0).abs() < 1e-5, "row {} has norm {}", i, norm);
        }
    }

    #[test]
    fn test_mean_ignores_padding() {
        let attributions = Tensor::from_slice(&[3.0f32, 3.0, 4.0, 4.0, 9.0, 9.0]).view([1, 3, 2]);
        let mask = Tensor::from_slice2(&[&[1.0f32, 1.0, 0.0]]);

        let summary = Aggregation::Mean
            .summarize(&attributions, None, &mask)
            .unwrap();

        let expected = Tensor::from_slice2(&[&[0.6f32, 0.8, 0.0]]);
        assert!(max_abs_diff(&summary, &expected) < 1e-6);
    }

    #[test]
    fn test_l2_name_computes_l1_norm() {
        let attributions = Tensor::from_slice(&[1.0f32, -2.0, -3.0, 4.0]).view([1, 2, 2]);
        let summary = Aggregation::L2
            .summarize(&attributions, None, &full_mask(1, 2))
            .unwrap();

        let expected = Tensor::from_slice2(&[&[3.0f32, 7.0]]);
        assert!(max_abs_diff(&summary, &expected) < 1e-6);
    }

    #[test]
    fn test_parse_and_display() {
        for name in ["none", "dot", "mean", "l2"] {
            let aggregation: Aggregation = name.parse().unwrap();
            assert_eq!(aggregation.to_string(), name);
        }
        assert!("l1".parse::<Aggregation>().is_err());
    }
}
