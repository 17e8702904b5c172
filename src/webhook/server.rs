//! Admission webhook server
//!
//! HTTPS endpoint for the pod mutation. Certificates are read from the
//! cert dir as `tls.crt` and `tls.key`.

use axum::{extract::State, routing::post, Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::AdmissionReview;
use kube::core::DynamicObject;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::mutate::PodMutator;
use crate::error::{Error, Result};

pub const CERT_FILE: &str = "tls.crt";
pub const KEY_FILE: &str = "tls.key";

#[derive(Debug, Clone)]
pub struct WebhookServerConfig {
    pub addr: SocketAddr,
    pub cert_dir: PathBuf,
}

impl Default for WebhookServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 18443)),
            cert_dir: PathBuf::from("/etc/webhook/certs"),
        }
    }
}

/// Certificate and key paths; an empty or incomplete dir is an error
pub fn cert_paths(cert_dir: &Path) -> Result<(PathBuf, PathBuf)> {
    let cert = cert_dir.join(CERT_FILE);
    let key = cert_dir.join(KEY_FILE);
    for path in [&cert, &key] {
        if !path.is_file() {
            return Err(Error::Configuration(format!(
                "webhook certificate {} not found",
                path.display()
            )));
        }
    }
    Ok((cert, key))
}

async fn mutate(
    State(mutator): State<Arc<PodMutator>>,
    Json(review): Json<AdmissionReview<Pod>>,
) -> Json<AdmissionReview<DynamicObject>> {
    Json(mutator.review(review).await)
}

pub fn router(mutator: Arc<PodMutator>) -> Router {
    Router::new()
        .route("/mutate", post(mutate))
        .layer(TraceLayer::new_for_http())
        .with_state(mutator)
}

/// Serve until `token` is cancelled
pub async fn run_webhook_server(
    config: WebhookServerConfig,
    mutator: Arc<PodMutator>,
    token: CancellationToken,
) -> Result<()> {
    let (cert, key) = cert_paths(&config.cert_dir)?;
    let tls = RustlsConfig::from_pem_file(cert, key)
        .await
        .map_err(|e| Error::Configuration(format!("webhook TLS: {}", e)))?;

    let handle = axum_server::Handle::new();
    let shutdown = handle.clone();
    tokio::spawn(async move {
        token.cancelled().await;
        shutdown.graceful_shutdown(Some(Duration::from_secs(5)));
    });

    info!("Admission webhook listening on {}", config.addr);
    axum_server::bind_rustls(config.addr, tls)
        .handle(handle)
        .serve(router(mutator).into_make_service())
        .await?;
    info!("Admission webhook stopped");
    Ok(())
}
