use std::sync::Arc;

use anyhow::Result;
use filter_service::{
    config::AppConfig,
    expression::ExpressionServices,
    filters::FilterContext,
    metrics_server, observability,
    opmodes::OperationalModeRegistry,
    pipeline::Pipeline,
    settings_cache::SettingCache,
    sinks::NdjsonSink,
    sources::NdjsonSource,
};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr).await?;
    }

    let setting_store = cfg.settings.open_setting_store()?;
    let metadata = cfg.settings.open_metadata_store()?;
    let ctx = FilterContext {
        settings: Arc::new(SettingCache::with_ttl(setting_store, cfg.settings.cache_ttl())),
        metadata,
        expressions: ExpressionServices::with_builtin(),
        modes: Arc::new(OperationalModeRegistry::new()),
    };
    let chain = cfg.build_chain(&ctx)?;
    tracing::info!(filters = chain.len(), workers = cfg.pipeline.workers, "filter chain ready");

    let source = match &cfg.pipeline.input {
        Some(path) => NdjsonSource::file(path),
        None => NdjsonSource::stdin(),
    };
    let pipeline = Pipeline {
        source,
        chain: Arc::new(chain),
        sink: NdjsonSink::stdout(),
        workers: cfg.pipeline.workers,
        channel_capacity: cfg.pipeline.channel_capacity,
    };
    pipeline.run().await?;

    Ok(())
}
