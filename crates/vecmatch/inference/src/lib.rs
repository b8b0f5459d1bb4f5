//! ONNX Runtime inference for sentence embeddings.
//!
//! Runs a BERT-family encoder exported to ONNX (inputs `input_ids`,
//! `attention_mask` and optionally `token_type_ids`) and pools each input to
//! its `[CLS]` hidden state, L2-normalised, matching `vecmatch-candle`.

use eyre::WrapErr as _;
use ort::execution_providers::ExecutionProvider as _;
use ort::execution_providers::CUDAExecutionProvider;
use ort::session::{Session, builder::GraphOptimizationLevel};

/// Name of the per-token hidden state output in optimum exports.
pub const DEFAULT_OUTPUT_NAME: &str = "last_hidden_state";

/// Execution provider configuration for the encoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionProvider {
    #[default]
    CpuOnly,
    /// CUDA, falling back to CPU when the provider is unavailable.
    Cuda,
}

/// A sentence encoder that uses ONNX Runtime for inference.
pub struct SentenceEncoder {
    session: Session,
    tokenizer: tokenizers::Tokenizer,
    dimension: usize,
    max_seq_length: usize,
    output_name: String,
    wants_token_types: bool,
}

impl SentenceEncoder {
    /// Load an encoder with the default execution provider.
    ///
    /// # Arguments
    /// * `model_path` - Path to the .onnx model file
    /// * `tokenizer_path` - Path to the tokenizer.json file
    /// * `dimension` - Hidden size of the model
    pub fn load(
        model_path: impl AsRef<std::path::Path>,
        tokenizer_path: impl AsRef<std::path::Path>,
        dimension: usize,
        max_seq_length: usize,
    ) -> eyre::Result<Self> {
        Self::load_with_provider(
            model_path,
            tokenizer_path,
            dimension,
            max_seq_length,
            ExecutionProvider::default(),
        )
    }

    pub fn load_with_provider(
        model_path: impl AsRef<std::path::Path>,
        tokenizer_path: impl AsRef<std::path::Path>,
        dimension: usize,
        max_seq_length: usize,
        provider: ExecutionProvider,
    ) -> eyre::Result<Self> {
        let model_path = model_path.as_ref();
        let tokenizer_path = tokenizer_path.as_ref();
        if max_seq_length < 2 {
            eyre::bail!("max sequence length {max_seq_length} leaves no room for [CLS] and [SEP]");
        }

        tracing::info!(?model_path, ?provider, "loading ONNX model");

        let mut builder = Session::builder()
            .wrap_err("failed to create ONNX session builder")?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .wrap_err("failed to set optimization level")?;

        match provider {
            ExecutionProvider::CpuOnly => {
                tracing::info!("using CPU-only execution");
            }
            ExecutionProvider::Cuda => {
                if CUDAExecutionProvider::default().register(&mut builder).is_ok() {
                    tracing::info!("CUDA execution provider registered");
                } else {
                    tracing::warn!("CUDA not available, falling back to CPU");
                }
            }
        }

        let session = builder
            .commit_from_file(model_path)
            .wrap_err_with(|| format!("failed to load ONNX model from {}", model_path.display()))?;
        let wants_token_types = session
            .inputs
            .iter()
            .any(|input| input.name == "token_type_ids");

        tracing::info!(tokenizer_path = %tokenizer_path.display(), "loading tokenizer");
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
            session,
            tokenizer,
            dimension,
            max_seq_length,
            output_name: DEFAULT_OUTPUT_NAME.to_string(),
            wants_token_types,
        })
    }

    /// Read the hidden states from a differently named output.
    #[must_use]
    pub fn with_output_name(mut self, name: impl Into<String>) -> Self {
        self.output_name = name.into();
        self
    }

    /// Encode a batch of texts in one session run, each padded to the full
    /// sequence length.
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

        let mut input_ids = vec![0i64; batch_size * seq_len];
        let mut attention_mask = vec![0i64; batch_size * seq_len];
        for (row, encoding) in encodings.iter().enumerate() {
            let offset = row * seq_len;
            for (i, &id) in encoding.get_ids().iter().take(seq_len).enumerate() {
                input_ids[offset + i] = i64::from(id);
                attention_mask[offset + i] = 1;
            }
        }

        let shape = vec![batch_size, seq_len];
        let input_ids_tensor =
            ort::value::Tensor::from_array((shape.clone(), input_ids.into_boxed_slice()))
                .wrap_err("failed to create input_ids tensor")?;
        let attention_mask_tensor =
            ort::value::Tensor::from_array((shape.clone(), attention_mask.into_boxed_slice()))
                .wrap_err("failed to create attention_mask tensor")?;

        let outputs = if self.wants_token_types {
            let token_type_tensor = ort::value::Tensor::from_array((
                shape,
                vec![0i64; batch_size * seq_len].into_boxed_slice(),
            ))
            .wrap_err("failed to create token_type_ids tensor")?;
            self.session.run(ort::inputs![
                "input_ids" => input_ids_tensor,
                "attention_mask" => attention_mask_tensor,
                "token_type_ids" => token_type_tensor,
            ])
        } else {
            self.session.run(ort::inputs![
                "input_ids" => input_ids_tensor,
                "attention_mask" => attention_mask_tensor,
            ])
        }
        .wrap_err("ONNX inference failed")?;

        let output = outputs
            .get(self.output_name.as_str())
            .ok_or_else(|| eyre::eyre!("model output '{}' not found", self.output_name))?;
        let hidden = output
            .try_extract_array::<f32>()
            .wrap_err("failed to extract output tensor")?;

        // [batch, seq, hidden]; [CLS] is position 0.
        if hidden.ndim() != 3 || hidden.shape()[0] != batch_size || hidden.shape()[2] != self.dimension {
            eyre::bail!(
                "unexpected output shape {:?}, expected [{batch_size}, _, {}]",
                hidden.shape(),
                self.dimension
            );
        }

        let mut embedding = ndarray::Array2::zeros((batch_size, self.dimension));
        for (b, mut target) in embedding.rows_mut().into_iter().enumerate() {
            for (j, slot) in target.iter_mut().enumerate() {
                *slot = hidden[[b, 0, j]];
            }
            let norm: f32 = target.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                target.mapv_inplace(|x| x / norm);
            }
        }
        Ok(embedding)
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

#[cfg(test)]
mod tests {
    // Run manually with: cargo test --package vecmatch-inference -- --ignored
    use vecmatch_core::Embedder as _;

    #[test]
    #[ignore = "requires model files"]
    fn test_encoder_load_and_inference() {
        let mut encoder =
            super::SentenceEncoder::load("models/model.onnx", "models/tokenizer.json", 1024, 512)
                .unwrap();

        let texts = vec!["Hello, world!".to_string(), "Goodbye".to_string()];
        let embedding = encoder.embed_batch(&texts).unwrap();

        assert_eq!(embedding.dim(), (2, 1024));
        let norm: f32 = embedding.row(0).iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.01);
    }
}
