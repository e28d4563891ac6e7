use std::net::SocketAddr;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static PROM_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

#[derive(Debug, thiserror::Error)]
pub enum MetricsServerError {
    #[error("invalid metrics bind address {addr}: {source}")]
    BadAddress {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("failed to install Prometheus recorder: {0}")]
    Recorder(#[from] metrics_exporter_prometheus::BuildError),
}

/// Installs the global recorder and serves `/metrics` in the background.
pub fn init(bind_addr: &str) -> Result<(), MetricsServerError> {
    let addr: SocketAddr = bind_addr.parse().map_err(|source| MetricsServerError::BadAddress {
        addr: bind_addr.to_string(),
        source,
    })?;

    let handle = PrometheusBuilder::new().install_recorder()?;
    // Only the first installation wins; the recorder above would have failed otherwise.
    let _ = PROM_HANDLE.set(handle);

    tokio::spawn(async move {
        let app = Router::new().route("/metrics", get(metrics_handler));

        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                tracing::info!(%addr, "metrics endpoint listening");
                if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                    tracing::error!(error = %e, "metrics server error");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to bind metrics listener");
            }
        }
    });
    Ok(())
}

async fn metrics_handler() -> String {
    PROM_HANDLE.get().map(PrometheusHandle::render).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_address_before_installing() {
        let err = init("not-an-address").unwrap_err();
        assert!(matches!(err, MetricsServerError::BadAddress { .. }));
        assert!(PROM_HANDLE.get().is_none());
    }
}
