//! Candle sentence encoder.
//!
//! Runs a BERT-family checkpoint and pools each input to the hidden state of
//! its `[CLS]` token, L2-normalised. The default checkpoint is
//! mxbai-embed-large-v1 (1024 dimensions).
//!
//! # References
//!
//! - Model: <https://huggingface.co/mixedbread-ai/mxbai-embed-large-v1>

mod model;

use eyre::WrapErr as _;

pub use model::{BertConfig, BertModel};

/// HuggingFace repository loaded by [`SentenceEncoder::from_hub`] by default.
pub const DEFAULT_MODEL_REPO: &str = "mixedbread-ai/mxbai-embed-large-v1";

/// Sequence length inputs are truncated and padded to.
pub const DEFAULT_MAX_SEQ_LENGTH: usize = 512;

/// A sentence encoder using Candle.
pub struct SentenceEncoder {
    model: BertModel,
    tokenizer: tokenizers::Tokenizer,
    device: candle_core::Device,
    dimension: usize,
    max_seq_length: usize,
}

impl SentenceEncoder {
    /// Load an encoder from local files.
    ///
    /// # Arguments
    /// * `model_path` - Path to the model.safetensors file
    /// * `tokenizer_path` - Path to the tokenizer.json file
    /// * `config_path` - Path to the config.json file
    pub fn load(
        model_path: impl AsRef<std::path::Path>,
        tokenizer_path: impl AsRef<std::path::Path>,
        config_path: impl AsRef<std::path::Path>,
        max_seq_length: usize,
    ) -> eyre::Result<Self> {
        Self::load_with_device(
            model_path,
            tokenizer_path,
            config_path,
            max_seq_length,
            default_device()?,
        )
    }

    /// Load from a directory holding `model.safetensors`, `tokenizer.json` and
    /// `config.json`.
    pub fn from_dir(dir: &std::path::Path, max_seq_length: usize) -> eyre::Result<Self> {
        Self::load(
            dir.join("model.safetensors"),
            dir.join("tokenizer.json"),
            dir.join("config.json"),
            max_seq_length,
        )
    }

    /// Fetch the model files from the HuggingFace Hub (cached locally).
    pub fn from_hub(repo_id: &str, max_seq_length: usize) -> eyre::Result<Self> {
        let api = hf_hub::api::sync::Api::new().wrap_err("failed to create hub client")?;
        let repo = api.model(repo_id.to_string());
        let fetch = |name: &str| {
            repo.get(name)
                .wrap_err_with(|| format!("failed to fetch {name} from {repo_id}"))
        };
        Self::load(
            fetch("model.safetensors")?,
            fetch("tokenizer.json")?,
            fetch("config.json")?,
            max_seq_length,
        )
    }

    /// Load an encoder with a specific device.
    pub fn load_with_device(
        model_path: impl AsRef<std::path::Path>,
        tokenizer_path: impl AsRef<std::path::Path>,
        config_path: impl AsRef<std::path::Path>,
        max_seq_length: usize,
        device: candle_core::Device,
    ) -> eyre::Result<Self> {
        let model_path = model_path.as_ref();
        let tokenizer_path = tokenizer_path.as_ref();
        let config_path = config_path.as_ref();

        tracing::info!(?model_path, ?device, "loading Candle model");

        let config_str = std::fs::read_to_string(config_path)
            .wrap_err_with(|| format!("failed to read config from {}", config_path.display()))?;
        let config: BertConfig = serde_json::from_str(&config_str)
            .wrap_err_with(|| format!("failed to parse config from {}", config_path.display()))?;
        tracing::debug!(?config, "loaded model config");

        let max_seq_length = max_seq_length.min(config.max_position_embeddings);
        if max_seq_length < 2 {
            eyre::bail!("max sequence length {max_seq_length} leaves no room for [CLS] and [SEP]");
        }

        let vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(
                &[model_path],
                candle_core::DType::F32,
                &device,
            )
            .wrap_err_with(|| format!("failed to load weights from {}", model_path.display()))?
        };
        let model = BertModel::new(&config, vb).wrap_err("failed to build model")?;

        let mut tokenizer = tokenizers::Tokenizer::from_file(tokenizer_path).map_err(|e| {
            eyre::eyre!("failed to load tokenizer from {}: {e}", tokenizer_path.display())
        })?;
        tokenizer
            .with_truncation(Some(tokenizers::TruncationParams {
                max_length: max_seq_length,
                ..Default::default()
            }))
            .map_err(|e| eyre::eyre!("failed to configure truncation: {e}"))?;
        tokenizer.with_padding(None);

        Ok(Self {
            model,
            tokenizer,
            device,
            dimension: config.hidden_size,
            max_seq_length,
        })
    }

    /// Encode a batch of texts in one forward pass.
    ///
    /// Every input is padded to the full sequence length so that a text's
    /// embedding does not depend on the other texts in its batch.
    pub fn encode_batch(&mut self, texts: &[String]) -> eyre::Result<vecmatch_core::Embedding> {
        let batch_size = texts.len();
        if batch_size == 0 {
            return Ok(ndarray::Array2::zeros((0, self.dimension)));
        }
        let seq_len = self.max_seq_length;

        let inputs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let encodings = self
            .tokenizer
            .encode_batch(inputs, true)
            .map_err(|e| eyre::eyre!("tokenization failed: {e}"))?;

        // Zeros act as padding.
        let mut input_ids = vec![0u32; batch_size * seq_len];
        let mut attention_mask = vec![0u32; batch_size * seq_len];
        for (row, encoding) in encodings.iter().enumerate() {
            let offset = row * seq_len;
            for (i, &id) in encoding.get_ids().iter().take(seq_len).enumerate() {
                input_ids[offset + i] = id;
                attention_mask[offset + i] = 1;
            }
        }

        let input_ids =
            candle_core::Tensor::from_vec(input_ids, (batch_size, seq_len), &self.device)
                .wrap_err("failed to create input_ids tensor")?;
        let attention_mask =
            candle_core::Tensor::from_vec(attention_mask, (batch_size, seq_len), &self.device)
                .wrap_err("failed to create attention_mask tensor")?;

        let output = self
            .model
            .forward(&input_ids, &attention_mask)
            .wrap_err("model forward pass failed")?;

        // [CLS] is position 0: [batch, seq, hidden] -> [batch, hidden]
        let pooled = output
            .narrow(1, 0, 1)
            .and_then(|t| t.squeeze(1))
            .and_then(|t| t.to_dtype(candle_core::DType::F32))
            .and_then(|t| t.to_device(&candle_core::Device::Cpu))
            .wrap_err("failed to pool [CLS] states")?
            .to_vec2::<f32>()
            .wrap_err("failed to convert output to vec")?;

        let mut embedding = ndarray::Array2::zeros((batch_size, self.dimension));
        for (mut target, row) in embedding.rows_mut().into_iter().zip(pooled) {
            let norm: f32 = row.iter().map(|x| x * x).sum::<f32>().sqrt();
            let norm = if norm > 0.0 { norm } else { 1.0 };
            for (slot, value) in target.iter_mut().zip(row) {
                *slot = value / norm;
            }
        }
        Ok(embedding)
    }

    #[must_use]
    pub fn device(&self) -> &candle_core::Device {
        &self.device
    }

    #[must_use]
    pub fn max_seq_length(&self) -> usize {
        self.max_seq_length
    }
}

impl vecmatch_core::Embedder for SentenceEncoder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_batch(&mut self, texts: &[String]) -> eyre::Result<vecmatch_core::Embedding> {
        self.encode_batch(texts)
    }
}

/// Get the default device (CUDA or Metal when compiled in, CPU otherwise).
pub fn default_device() -> eyre::Result<candle_core::Device> {
    #[cfg(feature = "cuda")]
    {
        tracing::info!("using CUDA device");
        candle_core::Device::new_cuda(0).wrap_err("failed to create CUDA device")
    }
    #[cfg(all(feature = "metal", not(feature = "cuda")))]
    {
        tracing::info!("using Metal device");
        candle_core::Device::new_metal(0).wrap_err("failed to create Metal device")
    }
    #[cfg(not(any(feature = "metal", feature = "cuda")))]
    {
        tracing::info!("using CPU device");
        Ok(candle_core::Device::Cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vecmatch_core::Embedder as _;

    fn load_test_encoder() -> eyre::Result<SentenceEncoder> {
        SentenceEncoder::from_hub(DEFAULT_MODEL_REPO, 128)
    }

    #[test]
    #[ignore = "requires model files"]
    fn test_embeddings_are_normalized() -> eyre::Result<()> {
        let mut encoder = load_test_encoder()?;
        let texts = vec!["a red bicycle".to_string(), "quarterly earnings report".to_string()];
        let embedding = encoder.embed_batch(&texts)?;

        assert_eq!(embedding.dim(), (2, encoder.dimension()));
        for row in embedding.rows() {
            let norm: f32 = row.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 0.01, "embedding not normalized: norm = {norm}");
        }
        Ok(())
    }

    #[test]
    #[ignore = "requires model files"]
    fn test_batch_matches_single() -> eyre::Result<()> {
        let mut encoder = load_test_encoder()?;
        let texts: Vec<String> = ["John Smith, 12 Oak Lane", "Jon Smith, 12 Oak Ln", "ACME Corp"]
            .iter()
            .map(ToString::to_string)
            .collect();

        let batch = encoder.embed_batch(&texts)?;
        for (i, text) in texts.iter().enumerate() {
            let single = encoder.embed_batch(std::slice::from_ref(text))?;
            for (s, b) in single.row(0).iter().zip(batch.row(i).iter()) {
                assert!((s - b).abs() < 1e-4, "value mismatch: single={s}, batch={b}");
            }
        }
        Ok(())
    }

    #[test]
    #[ignore = "requires model files"]
    fn test_similar_records_are_closer() -> eyre::Result<()> {
        let mut encoder = load_test_encoder()?;
        let texts: Vec<String> = ["John Smith, 12 Oak Lane", "Jon Smith, 12 Oak Ln", "ACME Corp, Berlin"]
            .iter()
            .map(ToString::to_string)
            .collect();
        let e = encoder.embed_batch(&texts)?;
        let dot = |a: usize, b: usize| e.row(a).dot(&e.row(b));
        assert!(dot(0, 1) > dot(0, 2));
        Ok(())
    }

    #[test]
    #[ignore = "requires model files"]
    fn test_empty_batch() -> eyre::Result<()> {
        let mut encoder = load_test_encoder()?;
        assert_eq!(encoder.embed_batch(&[])?.nrows(), 0);
        Ok(())
    }
}
