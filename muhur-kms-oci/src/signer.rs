//! OCI HTTP request signing.
//!
//! Requests carry an `Authorization: Signature ...` header computed with
//! `rsa-sha256` over these headers:
//!
//! ```text
//! date (request-target) host                                              GET
//! date (request-target) host content-length content-type x-content-sha256 POST
//! ```

use crate::OciError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Environment variable holding the resource principal session token.
pub const SESSION_TOKEN_ENV: &str = "OCI_RESOURCE_PRINCIPAL_RPST";

/// Environment variable holding the session private key PEM.
pub const SESSION_KEY_ENV: &str = "OCI_RESOURCE_PRINCIPAL_PRIVATE_PEM";

/// Headers attached to a signed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    /// `date` header value
    pub date: String,
    /// `x-content-sha256`, for requests with a body
    pub content_sha256: Option<String>,
    /// `authorization` header value
    pub authorization: String,
}

/// Signs OCI requests with an RSA key.
pub struct RequestSigner {
    key_id: String,
    signing_key: SigningKey<Sha256>,
}

impl RequestSigner {
    /// Creates a signer with an explicit `keyId`.
    #[must_use]
    pub fn new(key_id: impl Into<String>, private_key: RsaPrivateKey) -> Self {
        Self { key_id: key_id.into(), signing_key: SigningKey::new(private_key) }
    }

    /// Creates a signer for a user API key, `keyId = tenancy/user/fingerprint`.
    ///
    /// # Errors
    ///
    /// Returns `OciError::Credentials` if the key file cannot be read or
    /// parsed.
    pub fn from_api_key(profile: &ApiKeyProfile) -> Result<Self, OciError> {
        let pem = std::fs::read_to_string(&profile.key_file).map_err(|e| {
            OciError::Credentials(format!("cannot read key file {}: {e}", profile.key_file.display()))
        })?;
        let key = parse_private_key(&pem)?;
        Ok(Self::new(format!("{}/{}/{}", profile.tenancy, profile.user, profile.fingerprint), key))
    }

    /// Creates a signer for a principal session token,
    /// `keyId = ST$<token>`.
    ///
    /// `token` and `private_key` are either the values themselves or paths of
    /// files holding them.
    ///
    /// # Errors
    ///
    /// Returns `OciError::Credentials` if either value cannot be read or the
    /// key cannot be parsed.
    pub fn from_session_token(token: &str, private_key: &str) -> Result<Self, OciError> {
        let token = value_or_file(token)?;
        let pem = value_or_file(private_key)?;
        let key = parse_private_key(&pem)?;
        Ok(Self::new(format!("ST${}", token.trim()), key))
    }

    /// Returns the `keyId` placed in the signature.
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Signs a request.
    ///
    /// `target` is the path plus query, `host` the host header value.
    #[must_use]
    pub fn sign(&self, method: &str, target: &str, host: &str, date: &str, body: Option<&[u8]>) -> SignedHeaders {
        let method = method.to_ascii_lowercase();
        let content_sha256 = body.map(|b| STANDARD.encode(Sha256::digest(b)));

        let mut lines = vec![
            format!("date: {date}"),
            format!("(request-target): {method} {target}"),
            format!("host: {host}"),
        ];
        let mut headers = String::from("date (request-target) host");
        if let (Some(body), Some(digest)) = (body, &content_sha256) {
            lines.push(format!("content-length: {}", body.len()));
            lines.push("content-type: application/json".to_string());
            lines.push(format!("x-content-sha256: {digest}"));
            headers.push_str(" content-length content-type x-content-sha256");
        }

        let signature = self.signing_key.sign(lines.join("\n").as_bytes());
        let authorization = format!(
            r#"Signature version="1",keyId="{}",algorithm="rsa-sha256",headers="{headers}",signature="{}""#,
            self.key_id,
            STANDARD.encode(signature.to_bytes())
        );
        SignedHeaders { date: date.to_string(), content_sha256, authorization }
    }
}

impl fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Session token key ids are credentials.
        let shown = if self.key_id.starts_with("ST$") { "ST$<redacted>" } else { self.key_id.as_str() };
        f.debug_struct("RequestSigner").field("key_id", &shown).finish_non_exhaustive()
    }
}

/// One profile of an OCI CLI config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyProfile {
    pub tenancy: String,
    pub user: String,
    pub fingerprint: String,
    pub key_file: PathBuf,
    pub region: Option<String>,
}

impl ApiKeyProfile {
    /// Loads `profile` from the config file at `path`.
    ///
    /// # Errors
    ///
    /// Returns `OciError::Credentials` if the file cannot be read, the profile
    /// is absent, or a required field is missing.
    pub fn load(path: &Path, profile: &str) -> Result<Self, OciError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| OciError::Credentials(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&text, profile, path.parent())
    }

    /// Parses `profile` from config file text. Relative and `~` key paths
    /// resolve against `base_dir` and `$HOME` respectively.
    ///
    /// # Errors
    ///
    /// Returns `OciError::Credentials` if the profile is absent or a
    /// required field is missing.
    pub fn parse(text: &str, profile: &str, base_dir: Option<&Path>) -> Result<Self, OciError> {
        let sections = parse_sections(text);
        let mut fields = sections.get("DEFAULT").cloned().unwrap_or_default();
        let section = sections
            .get(profile)
            .ok_or_else(|| OciError::Credentials(format!("profile {profile} not found")))?;
        fields.extend(section.clone());

        let field = |name: &str| {
            fields
                .get(name)
                .cloned()
                .ok_or_else(|| OciError::Credentials(format!("profile {profile} has no {name}")))
        };
        let key_file = expand_path(&field("key_file")?, base_dir);
        Ok(Self {
            tenancy: field("tenancy")?,
            user: field("user")?,
            fingerprint: field("fingerprint")?,
            key_file,
            region: fields.get("region").cloned(),
        })
    }
}

/// Default location of the OCI CLI config file.
#[must_use]
pub fn default_config_file() -> PathBuf {
    expand_path("~/.oci/config", None)
}

fn parse_sections(text: &str) -> HashMap<String, HashMap<String, String>> {
    let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut current = None;
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            current = Some(name.trim().to_string());
            continue;
        }
        if let (Some(section), Some((key, value))) = (&current, line.split_once('=')) {
            sections
                .entry(section.clone())
                .or_default()
                .insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    sections
}

fn expand_path(raw: &str, base_dir: Option<&Path>) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    let path = PathBuf::from(raw);
    match base_dir {
        Some(dir) if path.is_relative() => dir.join(path),
        _ => path,
    }
}

fn value_or_file(value: &str) -> Result<String, OciError> {
    let path = Path::new(value);
    if !value.contains('\n') && path.is_absolute() && path.is_file() {
        return std::fs::read_to_string(path)
            .map_err(|e| OciError::Credentials(format!("cannot read {}: {e}", path.display())));
    }
    Ok(value.to_string())
}

/// Parses a PKCS#8 or PKCS#1 PEM private key.
///
/// # Errors
///
/// Returns `OciError::Credentials` if neither encoding matches.
pub fn parse_private_key(pem: &str) -> Result<RsaPrivateKey, OciError> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| OciError::Credentials(format!("invalid RSA private key: {e}")))
}
