//! Sentence-pair tokenization and vocabulary lookup.

use std::path::{Path, PathBuf};

use rust_bert::pipelines::common::{ModelType, TokenizerOption};
use rust_tokenizers::tokenizer::{Tokenizer as _, TruncationStrategy};
use rust_tokenizers::vocab::Vocab;

use super::api::fetch_vocab_file;
use super::config::TokenizerSource;
use crate::{Result, SaliencyError};

/// Wrapper for the BERT WordPiece tokenizer used to encode premise/hypothesis
/// pairs and to map token ids back to strings when serializing.
pub struct NliTokenizer {
    tokenizer: TokenizerOption,
    max_len: usize,
    truncation_strategy: TruncationStrategy,
}

impl NliTokenizer {
    /// Creates a tokenizer from a `vocab.txt` file.
    ///
    /// # Arguments
    /// * `vocab_path`: path to the WordPiece vocabulary file.
    /// * `lower_case`: whether to lowercase input text.
    /// * `max_len`: maximum token length of an encoded pair.
    pub fn from_vocab_file(vocab_path: &Path, lower_case: bool, max_len: usize) -> Result<Self> {
        let vocab = vocab_path
            .to_str()
            .ok_or_else(|| SaliencyError::Tokenizer("Invalid vocab path".into()))?;
        let tokenizer =
            TokenizerOption::from_file(ModelType::Bert, vocab, None, lower_case, None, None)
                .map_err(|e| SaliencyError::Tokenizer(e.to_string()))?;
        Ok(NliTokenizer {
            tokenizer,
            max_len,
            truncation_strategy: TruncationStrategy::LongestFirst,
        })
    }

    /// Creates a tokenizer from a configured source, fetching the vocabulary
    /// from the Hugging Face hub when a pretrained name is given.
    pub fn from_source(source: &TokenizerSource, lower_case: bool, max_len: usize) -> Result<Self> {
        let vocab = resolve_vocab(source)?;
        Self::from_vocab_file(&vocab, lower_case, max_len)
    }

    /// Encodes `(premise, hypothesis)` pairs as `[CLS] p [SEP] h [SEP]`,
    /// unpadded.
    pub fn encode_pairs(&self, pairs: &[(&str, &str)]) -> Vec<Vec<i64>> {
        self.tokenizer
            .encode_pair_list(pairs, self.max_len, &self.truncation_strategy, 0)
            .into_iter()
            .map(|input| input.token_ids)
            .collect()
    }

    /// Id used to pad batches and to occlude tokens.
    pub fn pad_id(&self) -> i64 {
        self.tokenizer.get_pad_id().unwrap_or(0)
    }

    /// Maps a token id back to its vocabulary entry (WordPiece markers kept).
    pub fn id_to_token(&self, id: i64) -> Result<String> {
        match &self.tokenizer {
            TokenizerOption::Bert(tokenizer) => Ok(tokenizer.vocab().id_to_token(&id)),
            _ => Err(SaliencyError::Tokenizer(
                "only WordPiece (BERT) vocabularies are supported".into(),
            )),
        }
    }
}

/// Resolves the vocabulary file for a tokenizer source: either the local
/// `vocab` path or the hub vocabulary of the `pretrained` model.
pub fn resolve_vocab(source: &TokenizerSource) -> Result<PathBuf> {
    if let Some(vocab) = &source.vocab {
        Ok(vocab.clone())
    } else if let Some(pretrained) = &source.pretrained {
        fetch_vocab_file(pretrained)
    } else {
        Err(SaliencyError::Config(
            "Either a pretrained tokenizer or a vocabulary file must be specified".into(),
        ))
    }
}
