//! Network and file collaborators.
//!
//! The caches and the revocation checker only see these traits, so tests can
//! substitute in-memory doubles. Callers apply their own timeouts.

use crate::error::{Result, VssError};

use async_trait::async_trait;
use hyper::body::HttpBody;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Method, Request, StatusCode, Uri};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Bulk source of CA certificates for the intermediate cache.
#[async_trait]
pub trait CertificateSource: Send + Sync {
    fn name(&self) -> &str;

    /// DER encodings of every certificate the source currently offers.
    async fn load(&self) -> Result<Vec<Vec<u8>>>;
}

/// Fetches issuer certificates from an AIA caIssuers URL.
#[async_trait]
pub trait IssuerFetcher: Send + Sync {
    async fn fetch_issuers(&self, url: &str) -> Result<Vec<u8>>;
}

/// Sends a DER OCSP request to a responder and returns the raw response.
#[async_trait]
pub trait OcspFetcher: Send + Sync {
    async fn fetch_ocsp(&self, url: &str, request: &[u8]) -> Result<Vec<u8>>;
}

/// Fetches a CRL from a distribution point URL.
#[async_trait]
pub trait CrlFetcher: Send + Sync {
    async fn fetch_crl(&self, url: &str) -> Result<Vec<u8>>;
}

/// PEM or DER bundle files on local disk.
pub struct BundleFileSource {
    name: String,
    paths: Vec<PathBuf>,
}

impl BundleFileSource {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            name: "bundle-files".to_string(),
            paths,
        }
    }
}

#[async_trait]
impl CertificateSource for BundleFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self) -> Result<Vec<Vec<u8>>> {
        let mut ders = Vec::new();

        for path in &self.paths {
            let bytes = tokio::fs::read(path).await?;
            let is_pem = bytes.windows(11).any(|w| w == b"-----BEGIN ");

            if is_pem {
                let certs = rustls_pemfile::certs(&mut &bytes[..]).map_err(|e| {
                    VssError::Fetch(format!("{}: invalid PEM bundle: {}", path.display(), e))
                })?;
                debug!(path = %path.display(), certificates = certs.len(), "Loaded PEM bundle");
                ders.extend(certs);
            } else {
                ders.push(bytes);
            }
        }

        Ok(ders)
    }
}

/// Plain HTTP client for AIA, OCSP and CRL retrieval. These locators are
/// conventionally `http://` since the evidence is signed.
pub struct HttpFetcher {
    client: Client<HttpConnector>,
    max_response_bytes: usize,
}

impl HttpFetcher {
    pub fn new(max_response_bytes: usize) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Some(Duration::from_secs(30)))
            .build_http();

        Self {
            client,
            max_response_bytes,
        }
    }

    async fn send(&self, request: Request<Body>) -> Result<Vec<u8>> {
        let uri = request.uri().clone();
        let response = self.client.request(request).await?;

        if response.status() != StatusCode::OK {
            return Err(VssError::Fetch(format!("{} returned HTTP {}", uri, response.status())));
        }

        let mut body = response.into_body();
        let mut buffer = Vec::new();
        while let Some(chunk) = body.data().await {
            let chunk = chunk?;
            if buffer.len() + chunk.len() > self.max_response_bytes {
                return Err(VssError::Fetch(format!(
                    "{} response exceeds {} bytes",
                    uri, self.max_response_bytes
                )));
            }
            buffer.extend_from_slice(&chunk);
        }

        debug!(url = %uri, bytes = buffer.len(), "HTTP fetch complete");
        Ok(buffer)
    }

    fn parse_uri(url: &str) -> Result<Uri> {
        let uri: Uri = url
            .parse()
            .map_err(|e| VssError::Fetch(format!("invalid URL {}: {}", url, e)))?;

        if uri.scheme_str() != Some("http") {
            return Err(VssError::Fetch(format!("unsupported URL scheme: {}", url)));
        }

        Ok(uri)
    }

    pub async fn get(&self, url: &str) -> Result<Vec<u8>> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(Self::parse_uri(url)?)
            .header("User-Agent", concat!("vss-engine/", env!("CARGO_PKG_VERSION")))
            .body(Body::empty())
            .map_err(|e| VssError::Fetch(e.to_string()))?;

        self.send(request).await
    }
}

#[async_trait]
impl IssuerFetcher for HttpFetcher {
    async fn fetch_issuers(&self, url: &str) -> Result<Vec<u8>> {
        self.get(url).await
    }
}

#[async_trait]
impl CrlFetcher for HttpFetcher {
    async fn fetch_crl(&self, url: &str) -> Result<Vec<u8>> {
        self.get(url).await
    }
}

#[async_trait]
impl OcspFetcher for HttpFetcher {
    async fn fetch_ocsp(&self, url: &str, request: &[u8]) -> Result<Vec<u8>> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(Self::parse_uri(url)?)
            .header("Content-Type", "application/ocsp-request")
            .header("Accept", "application/ocsp-response")
            .body(Body::from(request.to_vec()))
            .map_err(|e| VssError::Fetch(e.to_string()))?;

        self.send(request).await
    }
}
