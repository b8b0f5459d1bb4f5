//! Embedding backends and the row-to-text template.

use eyre::WrapErr as _;
use vecmatch_core::Embedder as _;

pub mod template;

pub use template::RowTemplate;

/// Which inference engine embeds text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendKind {
    #[default]
    Candle,
    Onnx,
}

impl std::str::FromStr for BackendKind {
    type Err = eyre::Report;

    fn from_str(s: &str) -> eyre::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "candle" => Ok(Self::Candle),
            "onnx" | "ort" => Ok(Self::Onnx),
            other => eyre::bail!("unknown embedding backend {other:?}, expected candle or onnx"),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Candle => "candle",
            Self::Onnx => "onnx",
        })
    }
}

/// Where model files come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// A HuggingFace Hub repository id.
    Hub(String),
    /// A local directory with the model files.
    Dir(std::path::PathBuf),
}

impl Default for ModelSource {
    fn default() -> Self {
        Self::Hub(vecmatch_candle::DEFAULT_MODEL_REPO.to_string())
    }
}

/// Everything needed to construct a [`Backend`].
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub model: ModelSource,
    pub max_seq_length: usize,
    /// Use CUDA with the ONNX backend.
    pub gpu: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            model: ModelSource::default(),
            max_seq_length: vecmatch_candle::DEFAULT_MAX_SEQ_LENGTH,
            gpu: false,
        }
    }
}

/// The embedding backend selected at startup.
pub enum Backend {
    Candle(vecmatch_candle::SentenceEncoder),
    Onnx(vecmatch_inference::SentenceEncoder),
}

impl Backend {
    pub fn load(config: &BackendConfig) -> eyre::Result<Self> {
        tracing::info!(kind = %config.kind, model = ?config.model, "loading embedding backend");
        match config.kind {
            BackendKind::Candle => {
                let encoder = match &config.model {
                    ModelSource::Hub(repo) => {
                        vecmatch_candle::SentenceEncoder::from_hub(repo, config.max_seq_length)?
                    }
                    ModelSource::Dir(dir) => {
                        vecmatch_candle::SentenceEncoder::from_dir(dir, config.max_seq_length)?
                    }
                };
                Ok(Self::Candle(encoder))
            }
            BackendKind::Onnx => {
                let files = OnnxFiles::resolve(&config.model)?;
                let dimension = files.dimension()?;
                let provider = if config.gpu {
                    vecmatch_inference::ExecutionProvider::Cuda
                } else {
                    vecmatch_inference::ExecutionProvider::CpuOnly
                };
                let encoder = vecmatch_inference::SentenceEncoder::load_with_provider(
                    &files.model,
                    &files.tokenizer,
                    dimension,
                    config.max_seq_length,
                    provider,
                )?;
                Ok(Self::Onnx(encoder))
            }
        }
    }

    #[must_use]
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Candle(_) => BackendKind::Candle,
            Self::Onnx(_) => BackendKind::Onnx,
        }
    }
}

impl vecmatch_core::Embedder for Backend {
    fn dimension(&self) -> usize {
        match self {
            Self::Candle(encoder) => encoder.dimension(),
            Self::Onnx(encoder) => encoder.dimension(),
        }
    }

    fn embed_batch(&mut self, texts: &[String]) -> eyre::Result<vecmatch_core::Embedding> {
        match self {
            Self::Candle(encoder) => encoder.embed_batch(texts),
            Self::Onnx(encoder) => encoder.embed_batch(texts),
        }
    }
}

struct OnnxFiles {
    model: std::path::PathBuf,
    tokenizer: std::path::PathBuf,
    config: Option<std::path::PathBuf>,
}

impl OnnxFiles {
    fn resolve(source: &ModelSource) -> eyre::Result<Self> {
        match source {
            ModelSource::Dir(dir) => {
                let config = dir.join("config.json");
                Ok(Self {
                    model: dir.join("model.onnx"),
                    tokenizer: dir.join("tokenizer.json"),
                    config: config.exists().then_some(config),
                })
            }
            ModelSource::Hub(repo_id) => {
                let api = hf_hub::api::sync::Api::new().wrap_err("failed to create hub client")?;
                let repo = api.model(repo_id.clone());
                let fetch = |name: &str| {
                    repo.get(name)
                        .wrap_err_with(|| format!("failed to fetch {name} from {repo_id}"))
                };
                Ok(Self {
                    model: fetch("onnx/model.onnx")?,
                    tokenizer: fetch("tokenizer.json")?,
                    config: Some(fetch("config.json")?),
                })
            }
        }
    }

    /// Hidden size from `config.json`, or the default dimension without one.
    fn dimension(&self) -> eyre::Result<usize> {
        let Some(path) = &self.config else {
            return Ok(vecmatch_core::DEFAULT_DIMENSION);
        };
        hidden_size(path)
    }
}

fn hidden_size(config_path: &std::path::Path) -> eyre::Result<usize> {
    let text = std::fs::read_to_string(config_path)
        .wrap_err_with(|| format!("failed to read {}", config_path.display()))?;
    let config: serde_json::Value = serde_json::from_str(&text)
        .wrap_err_with(|| format!("failed to parse {}", config_path.display()))?;
    config
        .get("hidden_size")
        .and_then(serde_json::Value::as_u64)
        .map(|size| size as usize)
        .ok_or_else(|| eyre::eyre!("{} has no hidden_size", config_path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("candle".parse::<BackendKind>().unwrap(), BackendKind::Candle);
        assert_eq!("ONNX".parse::<BackendKind>().unwrap(), BackendKind::Onnx);
        assert!("bloom".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::Onnx.to_string(), "onnx");
    }

    #[test]
    fn test_hidden_size_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"hidden_size": 768, "vocab_size": 30522}"#).unwrap();
        assert_eq!(hidden_size(&path).unwrap(), 768);

        std::fs::write(&path, r#"{"vocab_size": 30522}"#).unwrap();
        assert!(hidden_size(&path).is_err());
    }

    #[test]
    fn test_onnx_dir_without_config_uses_default_dimension() {
        let dir = tempfile::tempdir().unwrap();
        let files = OnnxFiles::resolve(&ModelSource::Dir(dir.path().to_path_buf())).unwrap();
        assert_eq!(files.model, dir.path().join("model.onnx"));
        assert_eq!(files.dimension().unwrap(), vecmatch_core::DEFAULT_DIMENSION);
    }
}
