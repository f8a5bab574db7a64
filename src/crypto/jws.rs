use crate::acme::object::Nonce;
use crate::crypto::{KeyStore, SignatureError, base64url, sha256};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;

#[derive(Debug, Serialize)]
pub struct ProtectedHeader {
    #[serde(rename = "alg")]
    algorithm: Algorithm,
    #[serde(skip_serializing_if = "Nonce::is_empty")]
    pub nonce: Nonce,
    #[serde(rename = "url")]
    target_url: Url,
    #[serde(flatten)]
    key: KeyParameters,
}

impl ProtectedHeader {
    pub fn new(algorithm: Algorithm, nonce: Nonce, target_url: Url, key: KeyParameters) -> Self {
        Self {
            algorithm,
            nonce,
            target_url,
            key,
        }
    }
}

#[derive(Debug, Copy, Clone, Serialize, PartialEq, Eq)]
pub enum Algorithm {
    #[serde(rename = "ES256")]
    EcdsaP256Sha256,
    #[serde(rename = "RS256")]
    RsaPkcs1Sha256,
}

/// Identifies the signing key in the protected header: `jwk` before the account exists, `kid`
/// afterwards. Being an enum, a header can never carry both.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub enum KeyParameters {
    #[serde(rename = "jwk")]
    FullKey(JsonWebKeyParameters),
    #[serde(rename = "kid")]
    AccountUrl(Url),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum JsonWebKeyParameters {
    Ecdsa(JsonWebKeyEcdsa),
    Rsa(JsonWebKeyRsa),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JsonWebKeyEcdsa {
    #[serde(rename = "kty")]
    key_type: String,
    #[serde(rename = "crv")]
    curve: String,
    #[serde(rename = "x")]
    x_coordinate: String,
    #[serde(rename = "y")]
    y_coordinate: String,
}

impl JsonWebKeyEcdsa {
    pub fn new(x_coordinate: String, y_coordinate: String) -> Self {
        Self {
            key_type: "EC".to_string(),
            curve: "P-256".to_string(),
            x_coordinate,
            y_coordinate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JsonWebKeyRsa {
    #[serde(rename = "kty")]
    key_type: String,
    #[serde(rename = "n")]
    modulus: String,
    #[serde(rename = "e")]
    exponent: String,
}

impl JsonWebKeyRsa {
    pub fn new(modulus: String, exponent: String) -> Self {
        Self {
            key_type: "RSA".to_string(),
            modulus,
            exponent,
        }
    }
}

impl JsonWebKeyParameters {
    /// The RFC 7638 thumbprint input: required members only, lexicographic order, no whitespace.
    pub fn canonical_json(&self) -> String {
        // serde_json can produce no-whitespace-no-linebreak JSON, but serde_json doesn't guarantee
        // any particular order (by default). The thumbprint relies on exact ordering however,
        // so we do the serialization manually here.
        match self {
            JsonWebKeyParameters::Ecdsa(ecdsa) => {
                let crv = &ecdsa.curve;
                let kty = &ecdsa.key_type;
                let x = &ecdsa.x_coordinate;
                let y = &ecdsa.y_coordinate;
                format!(r#"{{"crv":"{crv}","kty":"{kty}","x":"{x}","y":"{y}"}}"#)
            }
            JsonWebKeyParameters::Rsa(rsa) => {
                let e = &rsa.exponent;
                let kty = &rsa.key_type;
                let n = &rsa.modulus;
                format!(r#"{{"e":"{e}","kty":"{kty}","n":"{n}"}}"#)
            }
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            JsonWebKeyParameters::Ecdsa(_) => Algorithm::EcdsaP256Sha256,
            JsonWebKeyParameters::Rsa(_) => Algorithm::RsaPkcs1Sha256,
        }
    }
}

/// Thumbprint computed in-process. Equal to what any [`KeyStore::thumbprint`] returns.
pub fn jwk_thumbprint(parameters: &JsonWebKeyParameters) -> String {
    base64url(sha256(parameters.canonical_json().as_bytes()))
}

pub const EMPTY_PAYLOAD: Option<&()> = None;

/// The `header.payload` pair that gets signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenParts {
    header: String,
    payload: String,
}

impl TokenParts {
    pub fn signing_input(&self) -> String {
        format!("{}.{}", self.header, self.payload)
    }
}

/// Encodes header and payload. A `None` payload (POST-as-GET) is encoded as the empty string.
pub fn build_token_parts<T: Serialize>(
    header: &ProtectedHeader,
    payload: Option<&T>,
) -> Result<TokenParts, SignatureError> {
    let header = base64url(serde_json::to_string(header)?);
    let payload = match payload {
        None => String::new(),
        Some(payload) => base64url(serde_json::to_string(payload)?),
    };
    Ok(TokenParts { header, payload })
}

/// A private key on disk together with what the ACME server knows about it.
#[derive(Debug, Clone)]
pub struct JsonWebKey {
    store: Arc<dyn KeyStore>,
    path: PathBuf,
    jwk: JsonWebKeyParameters,
    parameters: KeyParameters,
    thumbprint: String,
}

impl JsonWebKey {
    /// Derives the JWK and its thumbprint for the key at `path`. The key must already exist.
    pub async fn load(store: Arc<dyn KeyStore>, path: &Path) -> Result<Self, SignatureError> {
        let jwk = store.jwk(path).await?;
        let thumbprint = store.thumbprint(&jwk).await?;
        Ok(Self {
            store,
            path: path.to_path_buf(),
            parameters: KeyParameters::FullKey(jwk.clone()),
            jwk,
            thumbprint,
        })
    }

    #[must_use]
    pub fn into_existing(self, account_url: Url) -> Self {
        Self {
            parameters: KeyParameters::AccountUrl(account_url),
            ..self
        }
    }

    pub fn get_algorithm(&self) -> Algorithm {
        self.store.backend().algorithm()
    }

    pub fn get_parameters(&self) -> &KeyParameters {
        &self.parameters
    }

    pub fn get_jwk(&self) -> &JsonWebKeyParameters {
        &self.jwk
    }

    pub fn get_account_url(&self) -> Option<&Url> {
        match &self.parameters {
            KeyParameters::AccountUrl(url) => Some(url),
            KeyParameters::FullKey(_) => None,
        }
    }

    pub fn get_acme_thumbprint(&self) -> &str {
        &self.thumbprint
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Signs `signing_input` through the key store, returning the base64url signature.
    pub async fn build_signature(&self, signing_input: &str) -> Result<String, SignatureError> {
        let signature = self.store.sign(&self.path, signing_input.as_bytes()).await?;
        Ok(base64url(signature))
    }

    pub fn build_header(&self, target_url: Url, nonce: Nonce) -> ProtectedHeader {
        ProtectedHeader::new(
            self.get_algorithm(),
            nonce,
            target_url,
            self.parameters.clone(),
        )
    }

    pub async fn sign<T: Serialize + Sync>(
        &self,
        header: &ProtectedHeader,
        payload: Option<&T>,
    ) -> Result<FlatJsonWebSignature, SignatureError> {
        let parts = build_token_parts(header, payload)?;
        let signature = self.build_signature(&parts.signing_input()).await?;
        Ok(FlatJsonWebSignature {
            header: parts.header,
            payload: parts.payload,
            signature,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlatJsonWebSignature {
    #[serde(rename = "protected")]
    header: String,
    payload: String,
    signature: String,
}

impl FlatJsonWebSignature {
    fn parse_base64_json(value: &str) -> anyhow::Result<serde_json::Value> {
        use base64::Engine;
        let raw_json = base64::prelude::BASE64_URL_SAFE_NO_PAD.decode(value)?;
        Ok(serde_json::from_slice(&raw_json)?)
    }

    pub fn header_json(&self) -> anyhow::Result<serde_json::Value> {
        Self::parse_base64_json(&self.header)
    }

    /// `Value::Null` for POST-as-GET requests.
    pub fn payload_json(&self) -> anyhow::Result<serde_json::Value> {
        if self.payload.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Self::parse_base64_json(&self.payload)
    }

    pub fn signing_input(&self) -> String {
        format!("{}.{}", self.header, self.payload)
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }
}
