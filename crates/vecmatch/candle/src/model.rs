//! BERT encoder.
//!
//! Post-norm transformer with learned absolute position embeddings. Weight
//! names follow the HuggingFace `BertModel` layout, with or without the
//! `bert.` prefix used by task-head checkpoints.

use candle_core::{Result, Tensor};
use candle_nn::{Embedding, Linear, Module, VarBuilder};

/// Fields of a HuggingFace `config.json` the encoder needs.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct BertConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    pub max_position_embeddings: usize,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

fn default_hidden_act() -> String {
    "gelu".to_string()
}

fn default_type_vocab_size() -> usize {
    2
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

impl Default for BertConfig {
    /// BERT-large geometry, as used by mxbai-embed-large-v1.
    fn default() -> Self {
        Self {
            vocab_size: 30522,
            hidden_size: 1024,
            num_hidden_layers: 24,
            num_attention_heads: 16,
            intermediate_size: 4096,
            hidden_act: default_hidden_act(),
            max_position_embeddings: 512,
            type_vocab_size: default_type_vocab_size(),
            layer_norm_eps: default_layer_norm_eps(),
        }
    }
}

fn layer_norm(size: usize, eps: f64, vb: VarBuilder<'_>) -> Result<candle_nn::LayerNorm> {
    let config = candle_nn::LayerNormConfig {
        eps,
        ..Default::default()
    };
    candle_nn::layer_norm(size, config, vb)
}

#[derive(Debug, Clone, Copy)]
enum Activation {
    Gelu,
    GeluApproximate,
    Relu,
}

impl Activation {
    fn from_name(name: &str) -> Result<Self> {
        match name {
            "gelu" => Ok(Self::Gelu),
            "gelu_new" | "gelu_pytorch_tanh" => Ok(Self::GeluApproximate),
            "relu" => Ok(Self::Relu),
            other => candle_core::bail!("unsupported activation {other}"),
        }
    }

    fn apply(self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Gelu => x.gelu_erf(),
            Self::GeluApproximate => x.gelu(),
            Self::Relu => x.relu(),
        }
    }
}

struct Embeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Embedding,
    layer_norm: candle_nn::LayerNorm,
}

impl Embeddings {
    fn new(config: &BertConfig, vb: VarBuilder<'_>) -> Result<Self> {
        Ok(Self {
            word_embeddings: candle_nn::embedding(
                config.vocab_size,
                config.hidden_size,
                vb.pp("word_embeddings"),
            )?,
            position_embeddings: candle_nn::embedding(
                config.max_position_embeddings,
                config.hidden_size,
                vb.pp("position_embeddings"),
            )?,
            token_type_embeddings: candle_nn::embedding(
                config.type_vocab_size,
                config.hidden_size,
                vb.pp("token_type_embeddings"),
            )?,
            layer_norm: layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("LayerNorm"))?,
        })
    }

    fn forward(&self, input_ids: &Tensor, token_type_ids: &Tensor) -> Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        let positions = Tensor::arange(0u32, seq_len as u32, input_ids.device())?.unsqueeze(0)?;

        let words = self.word_embeddings.forward(input_ids)?;
        let types = self.token_type_embeddings.forward(token_type_ids)?;
        let positions = self.position_embeddings.forward(&positions)?;
        let embeddings = (words + types)?.broadcast_add(&positions)?;
        self.layer_norm.forward(&embeddings)
    }
}

struct SelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    output_norm: candle_nn::LayerNorm,
    num_heads: usize,
    head_dim: usize,
}

impl SelfAttention {
    fn new(config: &BertConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let hidden = config.hidden_size;
        if hidden % config.num_attention_heads != 0 {
            candle_core::bail!(
                "hidden size {hidden} is not divisible by {} heads",
                config.num_attention_heads
            );
        }
        let attention = vb.pp("self");
        let output = vb.pp("output");
        Ok(Self {
            query: candle_nn::linear(hidden, hidden, attention.pp("query"))?,
            key: candle_nn::linear(hidden, hidden, attention.pp("key"))?,
            value: candle_nn::linear(hidden, hidden, attention.pp("value"))?,
            output: candle_nn::linear(hidden, hidden, output.pp("dense"))?,
            output_norm: layer_norm(hidden, config.layer_norm_eps, output.pp("LayerNorm"))?,
            num_heads: config.num_attention_heads,
            head_dim: hidden / config.num_attention_heads,
        })
    }

    fn split_heads(&self, x: &Tensor, batch: usize, seq_len: usize) -> Result<Tensor> {
        x.reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// `mask` is additive, shaped `[batch, 1, 1, seq]`.
    fn forward(&self, hidden_states: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, hidden) = hidden_states.dims3()?;

        let q = self.split_heads(&self.query.forward(hidden_states)?, batch, seq_len)?;
        let k = self.split_heads(&self.key.forward(hidden_states)?, batch, seq_len)?;
        let v = self.split_heads(&self.value.forward(hidden_states)?, batch, seq_len)?;

        let scale = (self.head_dim as f64).sqrt();
        let k_t = k.transpose(2, 3)?.contiguous()?;
        let scores = (q.matmul(&k_t)? / scale)?.broadcast_add(mask)?;
        let weights = candle_nn::ops::softmax(&scores, candle_core::D::Minus1)?;
        let context = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_len, hidden))?;

        let projected = self.output.forward(&context)?;
        self.output_norm.forward(&(projected + hidden_states)?)
    }
}

struct Layer {
    attention: SelfAttention,
    intermediate: Linear,
    output: Linear,
    output_norm: candle_nn::LayerNorm,
    activation: Activation,
}

impl Layer {
    fn new(config: &BertConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let hidden = config.hidden_size;
        Ok(Self {
            attention: SelfAttention::new(config, vb.pp("attention"))?,
            intermediate: candle_nn::linear(
                hidden,
                config.intermediate_size,
                vb.pp("intermediate").pp("dense"),
            )?,
            output: candle_nn::linear(config.intermediate_size, hidden, vb.pp("output").pp("dense"))?,
            output_norm: layer_norm(hidden, config.layer_norm_eps, vb.pp("output").pp("LayerNorm"))?,
            activation: Activation::from_name(&config.hidden_act)?,
        })
    }

    fn forward(&self, hidden_states: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let attended = self.attention.forward(hidden_states, mask)?;
        let expanded = self
            .activation
            .apply(&self.intermediate.forward(&attended)?)?;
        let projected = self.output.forward(&expanded)?;
        self.output_norm.forward(&(projected + attended)?)
    }
}

/// BERT encoder producing per-token hidden states.
pub struct BertModel {
    embeddings: Embeddings,
    layers: Vec<Layer>,
}

impl BertModel {
    pub fn new(config: &BertConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let vb = if vb.contains_tensor("embeddings.word_embeddings.weight") {
            vb
        } else {
            vb.pp("bert")
        };

        let embeddings = Embeddings::new(config, vb.pp("embeddings"))?;
        let layers = (0..config.num_hidden_layers)
            .map(|i| Layer::new(config, vb.pp("encoder").pp("layer").pp(i)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { embeddings, layers })
    }

    /// Hidden states `[batch, seq_len, hidden]` for `input_ids` and a 0/1
    /// `attention_mask`, both `[batch, seq_len]`.
    pub fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let token_type_ids = input_ids.zeros_like()?;
        let mut hidden_states = self.embeddings.forward(input_ids, &token_type_ids)?;

        // 0/1 mask to additive 0/-1e9, broadcast over heads and query positions.
        const MASK_FILL_VALUE: f64 = -1e9;
        let mask = attention_mask
            .to_dtype(hidden_states.dtype())?
            .unsqueeze(1)?
            .unsqueeze(2)?;
        let mask = ((mask.ones_like()? - mask)? * MASK_FILL_VALUE)?;

        for layer in &self.layers {
            hidden_states = layer.forward(&hidden_states, &mask)?;
        }
        Ok(hidden_states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> BertConfig {
        BertConfig {
            vocab_size: 32,
            hidden_size: 8,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            intermediate_size: 16,
            max_position_embeddings: 16,
            ..BertConfig::default()
        }
    }

    #[test]
    fn test_forward_shape() {
        let device = candle_core::Device::Cpu;
        let vb = VarBuilder::zeros(candle_core::DType::F32, &device);
        let model = BertModel::new(&tiny_config(), vb).unwrap();

        let ids = Tensor::new(&[[1u32, 5, 7, 0], [2, 3, 0, 0]], &device).unwrap();
        let mask = Tensor::new(&[[1u32, 1, 1, 0], [1, 1, 0, 0]], &device).unwrap();
        let out = model.forward(&ids, &mask).unwrap();
        assert_eq!(out.dims(), &[2, 4, 8]);
    }

    #[test]
    fn test_rejects_uneven_heads() {
        let config = BertConfig {
            num_attention_heads: 3,
            ..tiny_config()
        };
        let vb = VarBuilder::zeros(candle_core::DType::F32, &candle_core::Device::Cpu);
        assert!(BertModel::new(&config, vb).is_err());
    }

    #[test]
    fn test_config_defaults_from_json() {
        let config: BertConfig = serde_json::from_str(
            r#"{"vocab_size": 30522, "hidden_size": 1024, "num_hidden_layers": 24,
                "num_attention_heads": 16, "intermediate_size": 4096,
                "max_position_embeddings": 512}"#,
        )
        .unwrap();
        assert_eq!(config.type_vocab_size, 2);
        assert_eq!(config.hidden_act, "gelu");
    }
}
