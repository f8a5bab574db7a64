use crate::crypto::backend::KeyBackend;
use crate::crypto::jws::JsonWebKeyParameters;
use async_trait::async_trait;
use base64::Engine;
use base64::prelude::{BASE64_STANDARD, BASE64_URL_SAFE_NO_PAD};
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::path::Path;

pub mod asymmetric;
pub mod backend;
pub mod external;
pub mod jws;

/// Access to private keys stored on disk.
///
/// The ACME client never reads key material itself. Every operation that needs a private key goes
/// through a `KeyStore`, either by shelling out ([`external::ExternalKeyStore`]) or in-process
/// ([`asymmetric::LocalKeyStore`]).
#[async_trait]
pub trait KeyStore: Send + Sync + Debug {
    fn backend(&self) -> KeyBackend;

    async fn key_exists(&self, path: &Path) -> Result<bool, SignatureError>;

    async fn generate_private_key(&self, path: &Path, size: Option<u32>)
    -> Result<(), SignatureError>;

    async fn public_key_pem(&self, path: &Path) -> Result<String, SignatureError>;

    async fn jwk(&self, path: &Path) -> Result<JsonWebKeyParameters, SignatureError>;

    /// Signs `message` with SHA-256, returning the raw JOSE signature bytes.
    async fn sign(&self, path: &Path, message: &[u8]) -> Result<Vec<u8>, SignatureError>;

    /// RFC 7638 thumbprint, base64url encoded.
    async fn thumbprint(&self, jwk: &JsonWebKeyParameters) -> Result<String, SignatureError>;

    /// DER encoded certificate signing request for `domains`.
    async fn certificate_request(
        &self,
        path: &Path,
        domains: &[String],
    ) -> Result<Vec<u8>, SignatureError>;

    /// Generates the key unless it already exists. Returns whether a new key was created.
    async fn ensure_private_key(
        &self,
        path: &Path,
        size: Option<u32>,
    ) -> Result<bool, SignatureError> {
        if self.key_exists(path).await? {
            return Ok(false);
        }
        self.generate_private_key(path, size).await?;
        Ok(true)
    }
}

pub const SHA256_LENGTH: usize = 32;

/// Computes the SHA2-256 digest over the provided byte slice.
///
/// # Panics
///
/// If the hashing engine encounters a catastrophic problem (such as the earth no longer being round)
pub fn sha256(input: &[u8]) -> [u8; SHA256_LENGTH] {
    aws_lc_rs::digest::digest(&aws_lc_rs::digest::SHA256, input)
        .as_ref()
        .try_into()
        .expect("SHA256 returned a hash with size != 32")
}

pub fn base64url(input: impl AsRef<[u8]>) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(input)
}

/// Re-encodes the standard base64 produced by `openssl base64` into unpadded base64url.
pub fn standard_to_base64url(standard: &str) -> Result<String, SignatureError> {
    let bytes = decode_standard_base64(standard)?;
    Ok(base64url(bytes))
}

pub fn decode_standard_base64(standard: &str) -> Result<Vec<u8>, SignatureError> {
    let compact: String = standard.chars().filter(|c| !c.is_whitespace()).collect();
    BASE64_STANDARD
        .decode(compact)
        .map_err(|_| SignatureError::EncodingFailed("key command output is not valid base64"))
}

#[derive(Debug)]
pub enum SignatureError {
    Serialization(serde_json::Error),
    SignatureGeneration(&'static str),
    EncodingFailed(&'static str),
    /// The external key command ran but reported failure.
    CommandFailed { operation: &'static str, exit_code: i32, output: String },
    /// The external key command could not be started or did not finish in time.
    Executor(std::io::Error),
    Key(anyhow::Error),
}

impl Error for SignatureError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SignatureError::Serialization(ser) => ser.source(),
            SignatureError::Executor(io) => Some(io),
            SignatureError::Key(err) => err.source(),
            SignatureError::EncodingFailed(_)
            | SignatureError::SignatureGeneration(_)
            | SignatureError::CommandFailed { .. } => None,
        }
    }
}

impl Display for SignatureError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self {
            SignatureError::Serialization(e) => write!(f, "JSON encoding failed: {e}"),
            SignatureError::EncodingFailed(msg) | SignatureError::SignatureGeneration(msg) => {
                write!(f, "{msg}")
            }
            SignatureError::CommandFailed {
                operation,
                exit_code,
                output,
            } => {
                write!(f, "{operation} failed with exit code {exit_code}")?;
                if !output.is_empty() {
                    write!(f, ": {output}")?;
                }
                Ok(())
            }
            SignatureError::Executor(e) => write!(f, "could not run key command: {e}"),
            SignatureError::Key(e) => write!(f, "{e:#}"),
        }
    }
}

impl From<serde_json::Error> for SignatureError {
    fn from(e: serde_json::Error) -> Self {
        SignatureError::Serialization(e)
    }
}

impl From<std::io::Error> for SignatureError {
    fn from(e: std::io::Error) -> Self {
        SignatureError::Executor(e)
    }
}

impl From<anyhow::Error> for SignatureError {
    fn from(e: anyhow::Error) -> Self {
        SignatureError::Key(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_sha256_empty_input() {
        assert_eq!(
            base64url(sha256(b"")),
            "47DEQpj8HBSa-_TImW-5JCeuQeRkm5NMpJWZG3hSuFU"
        );
    }

    #[rstest]
    #[case("+/8=", "-_8")]
    #[case("+/8=\n", "-_8")]
    #[case("aGVs\nbG8=", "aGVsbG8")]
    fn test_standard_to_base64url(#[case] standard: &str, #[case] expected: &str) {
        assert_eq!(standard_to_base64url(standard).unwrap(), expected);
    }

    #[test]
    fn test_standard_to_base64url_rejects_garbage() {
        assert!(standard_to_base64url("[sudo] password for backup:").is_err());
    }
}
