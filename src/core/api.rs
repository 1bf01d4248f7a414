use std::path::PathBuf;

use hf_hub::api::sync::Api;

use crate::{Result, SaliencyError};

/// Downloads (or reuses the local hub cache of) the WordPiece vocabulary of a
/// pretrained BERT model, e.g. `bert-base-uncased`.
pub fn fetch_vocab_file(model_name: &str) -> Result<PathBuf> {
    let api = Api::new().map_err(|e| SaliencyError::Tokenizer(e.to_string()))?;

    let repo = api.model(model_name.to_string());

    repo.get("vocab.txt").map_err(|e| {
        SaliencyError::Tokenizer(format!(
            "Failed to fetch vocab.txt for '{}': {}",
            model_name, e
        ))
    })
}
