//! OCI Vault crypto and management REST clients.

use crate::signer::RequestSigner;
use crate::OciError;
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use zeroize::Zeroize;

/// Path prefix of the KMS REST API.
pub const API_PREFIX: &str = "/20180608";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptRequest {
    pub key_id: String,
    /// Base64 payload
    pub plaintext: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_version_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptResponse {
    /// Opaque ciphertext string
    pub ciphertext: String,
    #[serde(default)]
    pub key_id: Option<String>,
    /// Version that performed the encryption
    #[serde(default)]
    pub key_version_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptRequest {
    pub key_id: String,
    pub ciphertext: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_version_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptResponse {
    /// Base64 payload
    pub plaintext: String,
}

// Both carry a DEK.
impl Drop for EncryptRequest {
    fn drop(&mut self) {
        self.plaintext.zeroize();
    }
}

impl Drop for DecryptResponse {
    fn drop(&mut self) {
        self.plaintext.zeroize();
    }
}

/// Key metadata from the management endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyResponse {
    pub id: String,
    pub current_key_version: String,
}

/// Crypto endpoint: encrypt and decrypt under a master key.
#[async_trait::async_trait]
pub trait OciCryptoApi: Send + Sync {
    async fn encrypt(&self, request: &EncryptRequest) -> Result<EncryptResponse, OciError>;

    async fn decrypt(&self, request: &DecryptRequest) -> Result<DecryptResponse, OciError>;
}

/// Management endpoint: key metadata.
#[async_trait::async_trait]
pub trait OciManagementApi: Send + Sync {
    async fn get_key(&self, key_id: &str) -> Result<KeyResponse, OciError>;
}

/// Signed JSON transport shared by both endpoints.
struct SignedClient {
    http: reqwest::Client,
    endpoint: String,
    signer: Arc<RequestSigner>,
}

impl SignedClient {
    fn new(http: reqwest::Client, endpoint: &str, signer: Arc<RequestSigner>) -> Result<Self, OciError> {
        Url::parse(endpoint)
            .map_err(|e| OciError::InvalidEndpoint(format!("{endpoint:?}: {e}")))?;
        Ok(Self { http, endpoint: endpoint.trim_end_matches('/').to_string(), signer })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<T, OciError> {
        let url = Url::parse(&format!("{}{API_PREFIX}{path}", self.endpoint))
            .map_err(|e| OciError::InvalidEndpoint(format!("{}: {e}", self.endpoint)))?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(OciError::InvalidEndpoint(format!("{url} has no host"))),
        };
        let target = match url.query() {
            Some(query) => format!("{}?{query}", url.path()),
            None => url.path().to_string(),
        };
        let date = chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let signed = self.signer.sign(method.as_str(), &target, &host, &date, body.as_deref());

        let mut request = self
            .http
            .request(method, url)
            .header("date", signed.date)
            .header("authorization", signed.authorization);
        if let Some(body) = body {
            request = request.header("content-type", "application/json").body(body);
        }
        if let Some(digest) = signed.content_sha256 {
            request = request.header("x-content-sha256", digest);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OciError::Status { status: status.as_u16(), body });
        }
        response
            .json()
            .await
            .map_err(|e| OciError::UnexpectedResponse(format!("failed to parse oci response: {e}")))
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, OciError> {
        let body = serde_json::to_vec(body)
            .map_err(|e| OciError::UnexpectedResponse(format!("failed to encode request: {e}")))?;
        self.call(Method::POST, path, Some(body)).await
    }
}

/// HTTP client for the vault's crypto endpoint.
pub struct HttpCryptoClient(SignedClient);

impl HttpCryptoClient {
    /// Creates a client for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if `endpoint` is not a URL.
    pub fn new(http: reqwest::Client, endpoint: &str, signer: Arc<RequestSigner>) -> Result<Self, OciError> {
        SignedClient::new(http, endpoint, signer).map(Self)
    }
}

#[async_trait::async_trait]
impl OciCryptoApi for HttpCryptoClient {
    async fn encrypt(&self, request: &EncryptRequest) -> Result<EncryptResponse, OciError> {
        self.0.post("/encrypt", request).await
    }

    async fn decrypt(&self, request: &DecryptRequest) -> Result<DecryptResponse, OciError> {
        self.0.post("/decrypt", request).await
    }
}

/// HTTP client for the vault's management endpoint.
pub struct HttpManagementClient(SignedClient);

impl HttpManagementClient {
    /// Creates a client for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if `endpoint` is not a URL.
    pub fn new(http: reqwest::Client, endpoint: &str, signer: Arc<RequestSigner>) -> Result<Self, OciError> {
        SignedClient::new(http, endpoint, signer).map(Self)
    }
}

#[async_trait::async_trait]
impl OciManagementApi for HttpManagementClient {
    async fn get_key(&self, key_id: &str) -> Result<KeyResponse, OciError> {
        self.0.call(Method::GET, &format!("/keys/{key_id}"), None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::parse_private_key;
    use wiremock::matchers::{body_json, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PKCS8_KEY: &str = include_str!("../tests/fixtures/test_key.pem");

    fn signer() -> Arc<RequestSigner> {
        Arc::new(RequestSigner::new("t/u/f", parse_private_key(PKCS8_KEY).unwrap()))
    }

    #[tokio::test]
    async fn test_encrypt_is_signed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/20180608/encrypt"))
            .and(header_exists("date"))
            .and(header_exists("x-content-sha256"))
            .and(body_json(serde_json::json!({"keyId": "ocid1.key", "plaintext": "AAEC"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ciphertext": "opaque",
                "keyId": "ocid1.key",
                "keyVersionId": "ocid1.keyversion.1"
            })))
            .mount(&server)
            .await;

        let client = HttpCryptoClient::new(reqwest::Client::new(), &server.uri(), signer()).unwrap();
        let response = client
            .encrypt(&EncryptRequest {
                key_id: "ocid1.key".into(),
                plaintext: "AAEC".into(),
                key_version_id: None,
            })
            .await
            .unwrap();
        assert_eq!(response.ciphertext, "opaque");
        assert_eq!(response.key_version_id.as_deref(), Some("ocid1.keyversion.1"));

        let requests = server.received_requests().await.unwrap();
        let authorization = requests[0].headers.get("authorization").unwrap().to_str().unwrap();
        assert!(authorization.starts_with(r#"Signature version="1",keyId="t/u/f""#));
    }

    #[tokio::test]
    async fn test_get_key_reads_current_version() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/20180608/keys/ocid1.key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "ocid1.key",
                "currentKeyVersion": "ocid1.keyversion.3",
                "displayName": "seal"
            })))
            .mount(&server)
            .await;

        let client = HttpManagementClient::new(reqwest::Client::new(), &server.uri(), signer()).unwrap();
        let key = client.get_key("ocid1.key").await.unwrap();
        assert_eq!(key.current_key_version, "ocid1.keyversion.3");
    }

    #[tokio::test]
    async fn test_error_status_is_kept() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let client = HttpCryptoClient::new(reqwest::Client::new(), &server.uri(), signer()).unwrap();
        let err = client
            .decrypt(&DecryptRequest { key_id: "k".into(), ciphertext: "c".into(), key_version_id: None })
            .await
            .unwrap_err();
        assert!(matches!(err, OciError::Status { status: 503, .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_invalid_endpoint() {
        assert!(HttpCryptoClient::new(reqwest::Client::new(), "not a url", signer()).is_err());
    }
}
