//! Transit engine REST client.

use crate::TransitError;
use reqwest::{Certificate, Identity, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Lease of the client token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenLease {
    /// Remaining lifetime
    pub lease_duration: Duration,
    /// Whether `renew_self` can extend it
    pub renewable: bool,
}

/// Transit engine operations used by the seal.
#[async_trait::async_trait]
pub trait TransitApi: Send + Sync {
    /// `POST <mount>/encrypt/<key>`; returns the `vN:<key id>:<body>` string.
    async fn encrypt(&self, mount_path: &str, key_name: &str, plaintext: &str) -> Result<String, TransitError>;

    /// `POST <mount>/decrypt/<key>`; returns the base64 plaintext.
    async fn decrypt(&self, mount_path: &str, key_name: &str, ciphertext: &str) -> Result<String, TransitError>;

    /// `POST auth/token/renew-self`.
    async fn renew_self(&self) -> Result<TokenLease, TransitError>;
}

/// TLS settings for the connection to the secret store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOptions {
    /// PEM bundle of trusted CAs
    pub ca_cert: Option<PathBuf>,
    /// Directory of PEM files of trusted CAs
    pub ca_path: Option<PathBuf>,
    /// PEM client certificate
    pub client_cert: Option<PathBuf>,
    /// PEM client key
    pub client_key: Option<PathBuf>,
    /// Name to verify the server certificate against
    pub server_name: Option<String>,
    /// Disables certificate verification
    pub skip_verify: bool,
}

/// Connection settings.
#[derive(Debug, Clone)]
pub struct TransitOptions {
    pub address: String,
    pub token: Option<SecretString>,
    pub namespace: Option<String>,
    pub tls: TlsOptions,
}

/// `reqwest`-backed transit client.
pub struct HttpTransitClient {
    http: reqwest::Client,
    base_url: Url,
    token: Option<SecretString>,
    namespace: Option<String>,
}

impl HttpTransitClient {
    /// Builds a client from `options`.
    ///
    /// With a TLS server name set, the name is pinned to the address so that
    /// requests go to the configured host and are verified against the name.
    ///
    /// # Errors
    ///
    /// Returns `TransitError::Tls` for unreadable or malformed certificates,
    /// `TransitError::InvalidAddress` for an unusable address.
    pub async fn connect(options: TransitOptions) -> Result<Self, TransitError> {
        let mut base_url = Url::parse(&options.address)
            .map_err(|e| TransitError::InvalidAddress(format!("{}: {e}", options.address)))?;
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);

        for cert in load_ca_certs(&options.tls)? {
            builder = builder.add_root_certificate(cert);
        }
        match (&options.tls.client_cert, &options.tls.client_key) {
            (Some(cert), Some(key)) => {
                let mut pem = read_file(cert)?;
                pem.push(b'\n');
                pem.extend(read_file(key)?);
                let identity = Identity::from_pem(&pem)
                    .map_err(|e| TransitError::Tls(format!("invalid client certificate or key: {e}")))?;
                builder = builder.identity(identity);
            }
            (None, None) => {}
            _ => return Err(TransitError::Tls("client certificate and key must be set together".into())),
        }
        if options.tls.skip_verify {
            tracing::warn!("transit TLS certificate verification is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(server_name) = &options.tls.server_name {
            let addr = resolve(&base_url).await?;
            builder = builder.resolve(server_name, addr);
            base_url
                .set_host(Some(server_name))
                .map_err(|e| TransitError::InvalidAddress(format!("server name {server_name:?}: {e}")))?;
        }

        let http = builder.build()?;
        Ok(Self::with_http(http, base_url, options.token, options.namespace))
    }

    /// Creates a client over an existing `reqwest` client.
    ///
    /// A path in `base_url` is kept as a prefix of every request path.
    #[must_use]
    pub fn with_http(
        http: reqwest::Client,
        mut base_url: Url,
        token: Option<SecretString>,
        namespace: Option<String>,
    ) -> Self {
        // Url::join replaces the last segment unless the path ends with '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self { http, base_url, token, namespace }
    }

    /// Returns the URL requests are sent to.
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, TransitError> {
        let url = self
            .base_url
            .join(&format!("v1/{}", path.trim_start_matches('/')))
            .map_err(|e| TransitError::InvalidAddress(e.to_string()))?;
        let mut request = self.http.post(url).json(&body);
        if let Some(token) = &self.token {
            request = request.header("X-Vault-Token", token.expose_secret());
        }
        if let Some(namespace) = &self.namespace {
            request = request.header("X-Vault-Namespace", namespace);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let errors = serde_json::from_str::<ErrorResponse>(&body).map_or(body, |e| e.errors.join("; "));
            return Err(TransitError::Status { status: status.as_u16(), errors });
        }
        response
            .json()
            .await
            .map_err(|e| TransitError::UnexpectedResponse(format!("failed to parse transit response: {e}")))
    }

    async fn transit_call(
        &self,
        operation: &str,
        mount_path: &str,
        key_name: &str,
        body: Value,
        field: &str,
    ) -> Result<String, TransitError> {
        let path = format!("{}/{operation}/{key_name}", mount_path.trim_matches('/'));
        let response = self.post(&path, body).await?;
        response
            .get("data")
            .and_then(|data| data.get(field))
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or_else(|| TransitError::UnexpectedResponse(format!("{operation} response missing {field}")))
    }
}

#[async_trait::async_trait]
impl TransitApi for HttpTransitClient {
    async fn encrypt(&self, mount_path: &str, key_name: &str, plaintext: &str) -> Result<String, TransitError> {
        self.transit_call("encrypt", mount_path, key_name, json!({ "plaintext": plaintext }), "ciphertext")
            .await
    }

    async fn decrypt(&self, mount_path: &str, key_name: &str, ciphertext: &str) -> Result<String, TransitError> {
        self.transit_call("decrypt", mount_path, key_name, json!({ "ciphertext": ciphertext }), "plaintext")
            .await
    }

    async fn renew_self(&self) -> Result<TokenLease, TransitError> {
        let response: RenewResponse = serde_json::from_value(self.post("auth/token/renew-self", json!({})).await?)
            .map_err(|e| TransitError::UnexpectedResponse(format!("failed to parse renewal: {e}")))?;
        Ok(TokenLease {
            lease_duration: Duration::from_secs(response.auth.lease_duration),
            renewable: response.auth.renewable,
        })
    }
}

#[derive(Deserialize)]
struct ErrorResponse {
    errors: Vec<String>,
}

#[derive(Deserialize)]
struct RenewResponse {
    auth: RenewAuth,
}

#[derive(Deserialize)]
struct RenewAuth {
    lease_duration: u64,
    #[serde(default)]
    renewable: bool,
}

fn read_file(path: &Path) -> Result<Vec<u8>, TransitError> {
    std::fs::read(path).map_err(|e| TransitError::Tls(format!("cannot read {}: {e}", path.display())))
}

fn parse_bundle(path: &Path) -> Result<Vec<Certificate>, TransitError> {
    Certificate::from_pem_bundle(&read_file(path)?)
        .map_err(|e| TransitError::Tls(format!("invalid CA certificate in {}: {e}", path.display())))
}

fn load_ca_certs(tls: &TlsOptions) -> Result<Vec<Certificate>, TransitError> {
    let mut certs = Vec::new();
    if let Some(path) = &tls.ca_cert {
        certs.extend(parse_bundle(path)?);
    }
    if let Some(dir) = &tls.ca_path {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| TransitError::Tls(format!("cannot read {}: {e}", dir.display())))?;
        for entry in entries {
            let path = entry.map_err(|e| TransitError::Tls(e.to_string()))?.path();
            if path.is_file() {
                certs.extend(parse_bundle(&path)?);
            }
        }
    }
    Ok(certs)
}

async fn resolve(url: &Url) -> Result<std::net::SocketAddr, TransitError> {
    let host = url
        .host_str()
        .ok_or_else(|| TransitError::InvalidAddress(format!("{url} has no host")))?;
    let port = url.port_or_known_default().unwrap_or(8200);
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| TransitError::InvalidAddress(format!("cannot resolve {host}: {e}")))?
        .next()
        .ok_or_else(|| TransitError::InvalidAddress(format!("{host} resolved to no address")))
}
