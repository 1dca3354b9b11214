//! Prompt encoding with the two SDXL text encoders, and registration of the
//! special tokens a fine-tune brings along.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use candle_core::{DType, Device, Tensor, D};
use candle_nn::VarBuilder;
use log::{debug, warn};
use tokenizers::{AddedToken, Tokenizer};

use super::clip::{ClipTextConfig, ClipTextTransformer};
use crate::{Error, Result};

const TOKEN_EMBEDDING: &str = "text_model.embeddings.token_embedding.weight";

/// A text encoder whose vocabulary has been extended, ready to swap in.
pub struct StagedEncoder {
    config: ClipTextConfig,
    tokenizer: Tokenizer,
    model: ClipTextTransformer,
}

pub struct TextEncoder {
    base_config: ClipTextConfig,
    base_tokenizer: Tokenizer,
    /// Pretrained weights, never modified.
    pristine: HashMap<String, Tensor>,
    config: ClipTextConfig,
    tokenizer: Tokenizer,
    model: ClipTextTransformer,
    pad_id: u32,
    device: Device,
    dtype: DType,
}

impl TextEncoder {
    pub fn load(
        weights: &Path,
        tokenizer: &Path,
        config: ClipTextConfig,
        device: &Device,
        dtype: DType,
    ) -> anyhow::Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer)
            .map_err(anyhow::Error::msg)
            .context("failed to load tokenizer")?;
        let pad_token = config.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = tokenizer
            .token_to_id(pad_token)
            .with_context(|| format!("tokenizer has no {pad_token:?} token"))?;

        let pristine = candle_core::safetensors::load(weights, device)
            .with_context(|| format!("failed to read {}", weights.display()))?
            .into_iter()
            .map(|(name, tensor)| Ok((name, tensor.to_dtype(dtype)?)))
            .collect::<candle_core::Result<HashMap<_, _>>>()?;
        let vb = VarBuilder::from_tensors(pristine.clone(), dtype, device);
        let model = ClipTextTransformer::new(vb, &config).context("failed to build text encoder")?;

        Ok(Self {
            base_config: config.clone(),
            base_tokenizer: tokenizer.clone(),
            pristine,
            config,
            tokenizer,
            model,
            pad_id,
            device: device.clone(),
            dtype,
        })
    }

    /// Builds an encoder knowing `tokens`, whose embedding rows are the rows
    /// of `embeddings`. Starts from the pretrained vocabulary, so tokens of a
    /// previously loaded fine-tune are dropped.
    pub fn stage(&self, identifier: &str, tokens: &[String], embeddings: &Tensor) -> Result<StagedEncoder> {
        let (rows, dim) = embeddings.dims2()?;
        if rows != tokens.len() || dim != self.base_config.embed_dim {
            return Err(Error::invalid_bundle(
                identifier,
                format!(
                    "expected {} token embeddings of width {}, got {:?}",
                    tokens.len(),
                    self.base_config.embed_dim,
                    embeddings.dims()
                ),
            ));
        }

        let mut tokenizer = self.base_tokenizer.clone();
        let base_vocab = self.base_config.vocab_size as u32;
        let added: Vec<AddedToken> = tokens
            .iter()
            .map(|token| AddedToken::from(token.clone(), true))
            .collect();
        tokenizer.add_special_tokens(&added);
        for (offset, token) in tokens.iter().enumerate() {
            let expected = base_vocab + offset as u32;
            if tokenizer.token_to_id(token) != Some(expected) {
                return Err(Error::Tokenizer(format!(
                    "{token} was not assigned id {expected}"
                )));
            }
        }

        let mut weights = self.pristine.clone();
        let table = self
            .pristine
            .get(TOKEN_EMBEDDING)
            .ok_or_else(|| Error::Tokenizer(format!("text encoder has no {TOKEN_EMBEDDING}")))?;
        let rows = embeddings.to_device(&self.device)?.to_dtype(self.dtype)?;
        weights.insert(TOKEN_EMBEDDING.to_string(), Tensor::cat(&[table, &rows], 0)?);

        let config = ClipTextConfig {
            vocab_size: self.base_config.vocab_size + tokens.len(),
            ..self.base_config.clone()
        };
        let vb = VarBuilder::from_tensors(weights, self.dtype, &self.device);
        let model = ClipTextTransformer::new(vb, &config)?;
        Ok(StagedEncoder {
            config,
            tokenizer,
            model,
        })
    }

    pub fn commit(&mut self, staged: StagedEncoder) {
        debug!("text encoder vocabulary is now {}", staged.config.vocab_size);
        self.config = staged.config;
        self.tokenizer = staged.tokenizer;
        self.model = staged.model;
    }

    /// Token ids padded or truncated to the context length.
    pub fn tokenize(&self, prompt: &str) -> Result<Vec<u32>> {
        let max_len = self.config.max_position_embeddings;
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| Error::Tokenizer(e.to_string()))?
            .get_ids()
            .to_vec();
        if tokens.len() > max_len {
            warn!(
                "prompt is {} tokens long, truncating to {max_len}",
                tokens.len()
            );
            tokens.truncate(max_len);
        }
        tokens.resize(max_len, self.pad_id);
        Ok(tokens)
    }

    /// `(1, seq, embed_dim)` penultimate hidden states for `prompt`.
    pub fn encode(&self, prompt: &str) -> Result<Tensor> {
        let tokens = self.tokenize(prompt)?;
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.model.forward_penultimate(&tokens)?)
    }
}

/// Encodes with every encoder and concatenates along the feature axis.
pub fn encode_prompt(encoders: &[TextEncoder], prompt: &str) -> Result<Tensor> {
    let states = encoders
        .iter()
        .map(|encoder| encoder.encode(prompt))
        .collect::<Result<Vec<_>>>()?;
    Ok(Tensor::cat(&states, D::Minus1)?)
}
