use anyhow::Result;
use headend_service::{app, config::AppConfig, metrics_server, observability, HeadEnd};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let store = app::connect_store(&cfg.store).await?;

    // Meter-specific application layers plug in a DeviceCodec; the bare
    // binary only terminates connections and tracks meter presence.
    let headend = HeadEnd::new(cfg, store, None);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
        }
        let _ = shutdown_tx.send(true);
    });

    headend.run(shutdown_rx).await
}
