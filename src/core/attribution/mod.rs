//! Attribution strategies and the method selector.

mod gradient;
mod occlusion;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tch::Tensor;

pub use gradient::{DeepLift, GuidedBackprop, InputXGradient, Saliency};
pub use occlusion::Occlusion;

use super::model::CnnClassifier;
use crate::{Result, SaliencyError};

/// Computes per-feature relevance scores for one target class.
pub trait Attributor {
    /// # Arguments
    /// * `model` - classifier in the input mode the strategy expects
    /// * `inputs` - `(batch, tokens, dim)` embeddings for gradient methods,
    ///   `(batch, tokens)` token ids for perturbation methods
    /// * `target` - class index whose logit is explained
    ///
    /// # Returns
    /// Scores with the shape of `inputs`
    fn attribute(&self, model: &CnnClassifier, inputs: &Tensor, target: i64) -> Result<Tensor>;
}

/// Attribution method identifiers accepted in configurations and output names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributionMethod {
    #[serde(rename = "sal")]
    Saliency,
    #[serde(rename = "inputx")]
    InputXGradient,
    #[serde(rename = "guided")]
    GuidedBackprop,
    #[serde(rename = "deeplift")]
    DeepLift,
    #[serde(rename = "occlusion")]
    Occlusion,
}

impl AttributionMethod {
    pub const ALL: [AttributionMethod; 5] = [
        AttributionMethod::Saliency,
        AttributionMethod::InputXGradient,
        AttributionMethod::GuidedBackprop,
        AttributionMethod::DeepLift,
        AttributionMethod::Occlusion,
    ];

    /// Whether the method differentiates with respect to embeddings.
    pub fn is_gradient_based(&self) -> bool {
        !matches!(self, AttributionMethod::Occlusion)
    }

    /// Builds the strategy for this method.
    ///
    /// `sliding_window` and `pad_id` only affect occlusion.
    pub fn attributor(&self, sliding_window: i64, pad_id: i64) -> Box<dyn Attributor> {
        match self {
            AttributionMethod::Saliency => Box::new(Saliency),
            AttributionMethod::InputXGradient => Box::new(InputXGradient),
            AttributionMethod::GuidedBackprop => Box::new(GuidedBackprop),
            AttributionMethod::DeepLift => Box::new(DeepLift),
            AttributionMethod::Occlusion => Box::new(Occlusion::new(sliding_window, pad_id)),
        }
    }
}

impl FromStr for AttributionMethod {
    type Err = SaliencyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sal" => Ok(AttributionMethod::Saliency),
            "inputx" => Ok(AttributionMethod::InputXGradient),
            "guided" => Ok(AttributionMethod::GuidedBackprop),
            "deeplift" => Ok(AttributionMethod::DeepLift),
            "occlusion" => Ok(AttributionMethod::Occlusion),
            other => Err(SaliencyError::Config(format!(
                "unknown attribution method '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for AttributionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttributionMethod::Saliency => "sal",
            AttributionMethod::InputXGradient => "inputx",
            AttributionMethod::GuidedBackprop => "guided",
            AttributionMethod::DeepLift => "deeplift",
            AttributionMethod::Occlusion => "occlusion",
        };
        f.write_str(name)
    }
}

/// Fails when `target` is not a class of `model`.
fn check_target(model: &CnnClassifier, target: i64) -> Result<()> {
    if target < 0 || target >= model.num_labels() {
        return Err(SaliencyError::Attribution(format!(
            "target class {} outside 0..{}",
            target,
            model.num_labels()
        )));
    }
    Ok(())
}
