//! Encode a few lines with the Candle encoder and log their pairwise cosine similarities.

use eyre::WrapErr as _;
use vecmatch_core::Embedder as _;

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let mut encoder = match std::env::args().nth(1) {
        Some(dir) => vecmatch_candle::SentenceEncoder::from_dir(
            std::path::Path::new(&dir),
            vecmatch_candle::DEFAULT_MAX_SEQ_LENGTH,
        ),
        None => vecmatch_candle::SentenceEncoder::from_hub(
            vecmatch_candle::DEFAULT_MODEL_REPO,
            vecmatch_candle::DEFAULT_MAX_SEQ_LENGTH,
        ),
    }
    .wrap_err("failed to load Candle encoder")?;

    let texts: Vec<String> = [
        "Jane Doe, 221B Baker Street, London",
        "J. Doe, 221b Baker St, London",
        "Northwind Traders, Seattle",
    ]
    .iter()
    .map(ToString::to_string)
    .collect();

    let embedding = encoder.embed_batch(&texts)?;
    tracing::info!(rows = embedding.nrows(), dim = embedding.ncols(), "embeddings generated");

    for i in 0..texts.len() {
        for j in i + 1..texts.len() {
            let cosine = embedding.row(i).dot(&embedding.row(j));
            tracing::info!(left = %texts[i], right = %texts[j], cosine, "similarity");
        }
    }
    Ok(())
}
