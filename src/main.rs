use wordpq::config::Config;
use wordpq::startup::{build_index, init_logging, open_storage, resolve_config_path};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env
    let _ = dotenvy::dotenv();

    // Load config (priority: WORDPQ_CONFIG env var > ./wordpq.toml > defaults)
    let config = Config::load(resolve_config_path().as_deref())?;
    config.validate()?;

    init_logging(&config);
    tracing::info!(
        corpus = %config.corpus.path.display(),
        variant = %config.indexing.variant,
        "wordpq starting"
    );

    let storage = open_storage(&config.storage)?;
    let start = std::time::Instant::now();
    let summary = match build_index(&config, &storage).await {
        Ok(summary) => summary,
        Err(e) => {
            tracing::error!(error = %e, stage = e.stage(), "index build failed");
            return Err(e.into());
        }
    };

    tracing::info!(
        vectors = summary.vectors,
        occupied_cells = summary.occupied_cells,
        skipped_rows = summary.corpus.skipped.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "index built"
    );
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}
