//! Admission webhook server for App resources
//!
//! Serves the mutating and validating hooks over HTTPS when a certificate
//! directory is configured, or plain HTTP otherwise (useful behind a
//! TLS-terminating proxy and in local runs).

pub mod review;

pub use review::{Hook, MUTATE_PATH, VALIDATE_PATH};

use std::convert::Infallible;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::rustls::{self, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::admission::SidecarPolicy;
use crate::metrics::prometheus::{text_response, ADMISSION_REQUESTS};

/// Certificate file expected in the webhook certificate directory
pub const CERT_FILE: &str = "tls.crt";

/// Private key file expected in the webhook certificate directory
pub const KEY_FILE: &str = "tls.key";

/// Largest AdmissionReview body accepted, matching the API server's request cap
const MAX_BODY_BYTES: usize = 3 * 1024 * 1024;

/// Shared state for webhook handlers
#[derive(Clone, Debug, Default)]
pub struct WebhookState {
    /// Sidecar injected by the mutating hook
    pub sidecar: SidecarPolicy,
}

impl WebhookState {
    pub fn new(sidecar: SidecarPolicy) -> Self {
        Self { sidecar }
    }
}

/// Build a TLS acceptor from `tls.crt` and `tls.key` in `cert_dir`
pub fn load_tls(cert_dir: &Path) -> anyhow::Result<TlsAcceptor> {
    let cert_path = cert_dir.join(CERT_FILE);
    let key_path = cert_dir.join(KEY_FILE);

    let mut cert_reader = BufReader::new(
        File::open(&cert_path).with_context(|| format!("opening {}", cert_path.display()))?,
    );
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("reading certificates from {}", cert_path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", cert_path.display());
    }

    let mut key_reader = BufReader::new(
        File::open(&key_path).with_context(|| format!("opening {}", key_path.display()))?,
    );
    let key = rustls_pemfile::private_key(&mut key_reader)
        .with_context(|| format!("reading private key from {}", key_path.display()))?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", key_path.display()))?;

    let config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .context("building webhook TLS configuration")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Start the webhook server
pub async fn serve(
    port: u16,
    state: Arc<WebhookState>,
    tls: Option<TlsAcceptor>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(
        tls = tls.is_some(),
        "Admission webhook listening on {}", addr
    );

    loop {
        let (stream, peer) = listener.accept().await?;
        let state = state.clone();
        let tls = tls.clone();

        tokio::spawn(async move {
            match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => serve_connection(stream, state).await,
                    Err(e) => warn!(peer = %peer, "TLS handshake failed: {}", e),
                },
                None => serve_connection(stream, state).await,
            }
        });
    }
}

async fn serve_connection<S>(stream: S, state: Arc<WebhookState>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| handle_request(req, state.clone()));
    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        error!("Error serving webhook connection: {}", e);
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<WebhookState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if matches!(req.uri().path(), "/healthz" | "/readyz") {
        return Ok(text_response(StatusCode::OK, "ok"));
    }

    let Some(hook) = Hook::from_path(req.uri().path()) else {
        return Ok(text_response(StatusCode::NOT_FOUND, "Not Found"));
    };

    if req.method() != Method::POST {
        return Ok(text_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "Method Not Allowed",
        ));
    }

    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(hook = hook.as_str(), "Failed to read admission review body: {}", e);
            return Ok(text_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "Unreadable or oversized admission review",
            ));
        }
    };

    let response = review::respond(hook, &body, &state.sidecar);
    debug!(
        hook = hook.as_str(),
        uid = %response.uid,
        allowed = response.allowed,
        "Answered admission review"
    );
    ADMISSION_REQUESTS
        .with_label_values(&[hook.as_str(), if response.allowed { "true" } else { "false" }])
        .inc();

    Ok(json_response(&response.into_review()))
}

fn json_response<T: serde::Serialize>(body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(bytes) => {
            let mut response = Response::new(Full::new(Bytes::from(bytes)));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            error!("Failed to serialize admission review: {}", e);
            text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to serialize admission review",
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_certificate_directory_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let Err(err) = load_tls(&dir.path().join("absent")) else {
            panic!("missing certificate directory should fail");
        };
        assert!(format!("{:#}", err).contains(CERT_FILE));
    }

    #[test]
    fn empty_certificate_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join(CERT_FILE)).unwrap();
        let mut key = File::create(dir.path().join(KEY_FILE)).unwrap();
        writeln!(key, "not a key").unwrap();

        let Err(err) = load_tls(dir.path()) else {
            panic!("empty certificate file should fail");
        };
        assert!(err.to_string().contains("no certificates found"));
    }
}
