//! CNN sentence-pair classifier and its interpretable embedding adapter.

use tch::nn::{self, Module, VarStore};
use tch::{Device, Tensor};
use tracing::debug;

use super::checkpoint::TrainingArgs;
use crate::{Result, SaliencyError};

/// What `CnnClassifier::forward` expects as input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    /// `(batch, tokens)` int64 token ids, looked up in the embedding table.
    TokenIds,
    /// `(batch, tokens, embedding_dim)` float embeddings, lookup skipped.
    Embeddings,
}

/// Convolutional NLI classifier: embedding, parallel 1-D convolutions with
/// ReLU and max-pooling over time, dropout and a linear output layer.
pub struct CnnClassifier {
    vs: VarStore,
    embedding: nn::Embedding,
    convs: Vec<nn::Conv1D>,
    classifier: nn::Linear,
    args: TrainingArgs,
    input_mode: InputMode,
}

impl CnnClassifier {
    /// Builds a freshly initialized model for `args` on `device`.
    pub fn new(args: &TrainingArgs, pad_id: i64, device: Device) -> Result<Self> {
        args.validate()?;
        if pad_id < 0 || pad_id >= args.vocab_size {
            return Err(SaliencyError::Checkpoint(format!(
                "pad id {} outside a vocabulary of {} entries",
                pad_id, args.vocab_size
            )));
        }
        let vs = VarStore::new(device);
        let root = vs.root();

        let embedding = nn::embedding(
            &root / "embedding",
            args.vocab_size,
            args.embedding_dim,
            nn::EmbeddingConfig {
                padding_idx: pad_id,
                ..Default::default()
            },
        );
        // the padding row embeds to zero
        tch::no_grad(|| {
            let _ = embedding.ws.get(pad_id).zero_();
        });
        let convs = args
            .kernel_heights
            .iter()
            .enumerate()
            .map(|(i, &height)| {
                nn::conv1d(
                    root.sub("conv_layers").sub(i),
                    args.embedding_dim,
                    args.out_channels,
                    height,
                    nn::ConvConfig {
                        padding: args.padding,
                        ..Default::default()
                    },
                )
            })
            .collect();
        let classifier = nn::linear(
            &root / "final",
            args.out_channels * args.kernel_heights.len() as i64,
            args.labels,
            Default::default(),
        );

        Ok(CnnClassifier {
            vs,
            embedding,
            convs,
            classifier,
            args: args.clone(),
            input_mode: InputMode::TokenIds,
        })
    }

    pub fn args(&self) -> &TrainingArgs {
        &self.args
    }

    pub fn num_labels(&self) -> i64 {
        self.args.labels
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    pub fn input_mode(&self) -> InputMode {
        self.input_mode
    }

    pub(crate) fn var_store(&self) -> &VarStore {
        &self.vs
    }

    pub(crate) fn var_store_mut(&mut self) -> &mut VarStore {
        &mut self.vs
    }

    /// Shortest sequence every convolution can slide over.
    pub fn min_input_len(&self) -> usize {
        let widest = self.args.kernel_heights.iter().copied().max().unwrap_or(1);
        (widest - 2 * self.args.padding).max(1) as usize
    }

    /// Embedding lookup: `(batch, tokens)` ids to `(batch, tokens, dim)`.
    pub fn embed(&self, token_ids: &Tensor) -> Tensor {
        self.embedding.forward(token_ids)
    }

    /// Convolution outputs before the ReLU, one `(batch, channels, positions)`
    /// tensor per kernel height.
    pub fn conv_preactivations(&self, embeddings: &Tensor) -> Vec<Tensor> {
        let channels_first = embeddings.transpose(1, 2);
        self.convs
            .iter()
            .map(|conv| conv.forward(&channels_first))
            .collect()
    }

    /// Max-pools the activations over time and maps them to logits.
    pub fn head(&self, activations: &[Tensor]) -> Tensor {
        let pooled: Vec<Tensor> = activations
            .iter()
            .map(|activation| activation.max_dim(2, false).0)
            .collect();
        Tensor::cat(&pooled, 1)
            .dropout(self.args.dropout, false)
            .apply(&self.classifier)
    }

    /// Logits from input embeddings.
    pub fn forward_embeddings(&self, embeddings: &Tensor) -> Tensor {
        let activations: Vec<Tensor> = self
            .conv_preactivations(embeddings)
            .iter()
            .map(|pre| pre.relu())
            .collect();
        self.head(&activations)
    }

    /// Logits `(batch, labels)`; the input kind depends on the current
    /// [`InputMode`].
    pub fn forward(&self, input: &Tensor) -> Tensor {
        match self.input_mode {
            InputMode::TokenIds => self.forward_embeddings(&self.embed(input)),
            InputMode::Embeddings => self.forward_embeddings(input),
        }
    }

    /// Fails unless the model currently takes `mode` inputs.
    pub(crate) fn expect_input_mode(&self, mode: InputMode) -> Result<()> {
        if self.input_mode == mode {
            Ok(())
        } else {
            Err(SaliencyError::Attribution(format!(
                "model takes {:?} inputs but {:?} were required; \
                 gradient methods need the interpretable embedding installed",
                self.input_mode, mode
            )))
        }
    }
}

/// Scoped swap of the embedding lookup for a pass-through, so gradients can
/// be taken with respect to continuous embeddings.
///
/// The model takes embeddings while the adapter is alive and token ids again
/// once it is dropped, including on early returns.
pub struct InterpretableEmbedding<'a> {
    model: &'a mut CnnClassifier,
}

impl<'a> InterpretableEmbedding<'a> {
    pub fn install(model: &'a mut CnnClassifier) -> Self {
        model.input_mode = InputMode::Embeddings;
        debug!("Installed interpretable embedding layer");
        InterpretableEmbedding { model }
    }

    /// Looks token ids up in the original embedding table.
    pub fn indices_to_embeddings(&self, token_ids: &Tensor) -> Tensor {
        self.model.embed(token_ids)
    }

    pub fn model(&self) -> &CnnClassifier {
        &*self.model
    }
}

impl Drop for InterpretableEmbedding<'_> {
    fn drop(&mut self) {
        self.model.input_mode = InputMode::TokenIds;
        debug!("Removed interpretable embedding layer");
    }
}
