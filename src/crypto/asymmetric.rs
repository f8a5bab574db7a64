//! In-process key handling with aws-lc-rs, usable wherever running `openssl` is unnecessary.

use crate::cert::create_and_sign_csr;
use crate::crypto::backend::{DEFAULT_RSA_KEY_SIZE, KeyBackend};
use crate::crypto::jws::{JsonWebKeyEcdsa, JsonWebKeyParameters, JsonWebKeyRsa, jwk_thumbprint};
use crate::crypto::{KeyStore, SignatureError, base64url};
use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use aws_lc_rs::encoding::AsBigEndian;
use aws_lc_rs::signature::ECDSA_P256_SHA256_FIXED_SIGNING;
use aws_lc_rs::{encoding, encoding::AsDer, rand::SystemRandom, rsa, signature};
use pem::Pem;
use std::path::Path;
use tracing::debug;

/// Length of one P-256 coordinate
const P256_POINT_LENGTH: usize = 32;

#[derive(Debug)]
pub enum KeyPair {
    Ecdsa(EcdsaKeyPair),
    Rsa(RsaKeyPair),
}

impl KeyPair {
    pub fn backend(&self) -> KeyBackend {
        match self {
            KeyPair::Ecdsa(_) => KeyBackend::Ecdsa,
            KeyPair::Rsa(_) => KeyBackend::Rsa,
        }
    }

    pub fn from_pem(pem: &str) -> anyhow::Result<Self> {
        // Parsing with rcgen + aws-lc-rs has the nice benefit that it supports various formats:
        // PKCS#1, PKCS#8, and SEC1 (the latter is what `openssl ecparam -genkey` writes).
        let rcgen_keypair =
            rcgen::KeyPair::from_pem(pem).context("reading private key from pem failed")?;
        let pkcs8_der = rcgen_keypair.serialized_der();
        Ok(match rcgen_keypair.algorithm() {
            alg if alg == &rcgen::PKCS_ECDSA_P256_SHA256 => {
                KeyPair::Ecdsa(EcdsaKeyPair::from_pkcs8(pkcs8_der)?)
            }
            alg if alg == &rcgen::PKCS_RSA_SHA256
                || alg == &rcgen::PKCS_RSA_SHA384
                || alg == &rcgen::PKCS_RSA_SHA512 =>
            {
                KeyPair::Rsa(RsaKeyPair::from_pkcs8(pkcs8_der)?)
            }
            _ => bail!("unsupported algorithm in PEM, only RSA and ECDSA P-256 keys are supported"),
        })
    }

    pub fn generate(backend: KeyBackend, size: Option<u32>) -> anyhow::Result<Self> {
        Ok(match backend {
            KeyBackend::Ecdsa => {
                let keypair = signature::EcdsaKeyPair::generate(&ECDSA_P256_SHA256_FIXED_SIGNING)
                    .map_err(|_| anyhow!("Could not generate key"))?;
                KeyPair::Ecdsa(EcdsaKeyPair::new(keypair))
            }
            KeyBackend::Rsa => {
                let size = match size.unwrap_or(DEFAULT_RSA_KEY_SIZE) {
                    ..=2048 => rsa::KeySize::Rsa2048,
                    2049..=3072 => rsa::KeySize::Rsa3072,
                    3073..=4096 => rsa::KeySize::Rsa4096,
                    _ => rsa::KeySize::Rsa8192,
                };
                let keypair = signature::RsaKeyPair::generate(size)
                    .map_err(|_| anyhow!("Could not generate key"))?;
                KeyPair::Rsa(RsaKeyPair::new(keypair))
            }
        })
    }

    pub fn to_rcgen_keypair(&self) -> anyhow::Result<rcgen::KeyPair> {
        let pem = self.to_pem()?;
        Ok(rcgen::KeyPair::from_pem(&pem.to_string())?)
    }
}

#[derive(Debug)]
pub struct EcdsaKeyPair {
    keypair: signature::EcdsaKeyPair,
}

impl EcdsaKeyPair {
    fn new(keypair: signature::EcdsaKeyPair) -> Self {
        Self { keypair }
    }

    fn from_pkcs8(der: &[u8]) -> anyhow::Result<Self> {
        let keypair = signature::EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, der)
            .map_err(|_| anyhow!("ECDSA private key file is corrupted or invalid"))?;
        Ok(Self::new(keypair))
    }
}

#[derive(Debug)]
pub struct RsaKeyPair {
    keypair: signature::RsaKeyPair,
}

impl RsaKeyPair {
    fn new(keypair: signature::RsaKeyPair) -> Self {
        Self { keypair }
    }

    fn from_pkcs8(der: &[u8]) -> anyhow::Result<Self> {
        let keypair = signature::RsaKeyPair::from_pkcs8(der)
            .map_err(|_| anyhow!("RSA private key file is corrupted or invalid"))?;
        Ok(Self::new(keypair))
    }
}

#[allow(clippy::module_name_repetitions)]
pub trait AsymmetricKeyOperation {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignatureError>;
    fn to_pem(&self) -> Result<Pem, SignatureError>;
    fn to_jwk_parameters(&self) -> Result<JsonWebKeyParameters, SignatureError>;
}

impl AsymmetricKeyOperation for KeyPair {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignatureError> {
        match self {
            KeyPair::Ecdsa(keypair) => keypair.sign(message),
            KeyPair::Rsa(keypair) => keypair.sign(message),
        }
    }

    fn to_pem(&self) -> Result<Pem, SignatureError> {
        match self {
            KeyPair::Ecdsa(keypair) => keypair.to_pem(),
            KeyPair::Rsa(keypair) => keypair.to_pem(),
        }
    }

    fn to_jwk_parameters(&self) -> Result<JsonWebKeyParameters, SignatureError> {
        match self {
            KeyPair::Ecdsa(keypair) => keypair.to_jwk_parameters(),
            KeyPair::Rsa(keypair) => keypair.to_jwk_parameters(),
        }
    }
}

impl AsymmetricKeyOperation for EcdsaKeyPair {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignatureError> {
        // Fixed signing returns raw r || s instead of an ASN.1 structure, which is what JOSE wants
        let signature = self
            .keypair
            .sign(&SystemRandom::new(), message)
            .map_err(|_| SignatureError::SignatureGeneration("ECDSA signing failed"))?;
        Ok(signature.as_ref().to_vec())
    }

    fn to_pem(&self) -> Result<Pem, SignatureError> {
        let data = self
            .keypair
            .to_pkcs8v1()
            .map_err(|_| SignatureError::EncodingFailed("Serializing ECDSA keypair failed"))?;
        Ok(Pem::new("PRIVATE KEY", data.as_ref()))
    }

    fn to_jwk_parameters(&self) -> Result<JsonWebKeyParameters, SignatureError> {
        let pub_key = signature::KeyPair::public_key(&self.keypair);
        let uncompressed = AsBigEndian::<encoding::EcPublicKeyUncompressedBin>::as_be_bytes(pub_key)
            .map_err(|_| {
                SignatureError::EncodingFailed("ECDSA public key is not available uncompressed")
            })?;
        let bytes = uncompressed.as_ref();
        if bytes.len() != 1 + 2 * P256_POINT_LENGTH || bytes[0] != 0x04 {
            return Err(SignatureError::EncodingFailed(
                "ECDSA public key has an unexpected encoding",
            ));
        }
        let x = base64url(&bytes[1..=P256_POINT_LENGTH]);
        let y = base64url(&bytes[1 + P256_POINT_LENGTH..]);
        Ok(JsonWebKeyParameters::Ecdsa(JsonWebKeyEcdsa::new(x, y)))
    }
}

impl AsymmetricKeyOperation for RsaKeyPair {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignatureError> {
        let mut signature = vec![0; self.keypair.public_modulus_len()];
        self.keypair
            .sign(
                &signature::RSA_PKCS1_SHA256,
                &SystemRandom::new(),
                message,
                &mut signature,
            )
            .map_err(|_| SignatureError::SignatureGeneration("RSA signing failed"))?;
        Ok(signature)
    }

    fn to_pem(&self) -> Result<Pem, SignatureError> {
        let data = self
            .keypair
            .as_der()
            .map_err(|_| SignatureError::EncodingFailed("Serializing RSA keypair failed"))?;
        Ok(Pem::new("PRIVATE KEY", data.as_ref()))
    }

    fn to_jwk_parameters(&self) -> Result<JsonWebKeyParameters, SignatureError> {
        let public_key = signature::KeyPair::public_key(&self.keypair);
        let modulus = base64url(public_key.modulus().big_endian_without_leading_zero());
        let exponent = base64url(public_key.exponent().big_endian_without_leading_zero());
        Ok(JsonWebKeyParameters::Rsa(JsonWebKeyRsa::new(modulus, exponent)))
    }
}

/// [`KeyStore`] that reads PEM files and signs in-process.
#[derive(Debug, Clone, Copy)]
pub struct LocalKeyStore {
    backend: KeyBackend,
}

impl LocalKeyStore {
    pub fn new(backend: KeyBackend) -> Self {
        Self { backend }
    }

    async fn load(&self, path: &Path) -> Result<KeyPair, SignatureError> {
        let pem = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Reading key {} failed", path.display()))?;
        let keypair = KeyPair::from_pem(&pem)
            .with_context(|| format!("Loading key {} failed", path.display()))?;
        if keypair.backend() != self.backend {
            return Err(SignatureError::Key(anyhow!(
                "{} holds an {} key, but {} was configured",
                path.display(),
                keypair.backend(),
                self.backend
            )));
        }
        Ok(keypair)
    }
}

#[async_trait]
impl KeyStore for LocalKeyStore {
    fn backend(&self) -> KeyBackend {
        self.backend
    }

    async fn key_exists(&self, path: &Path) -> Result<bool, SignatureError> {
        Ok(tokio::fs::try_exists(path).await?)
    }

    async fn generate_private_key(
        &self,
        path: &Path,
        size: Option<u32>,
    ) -> Result<(), SignatureError> {
        debug!("Generating new {} key at {}", self.backend, path.display());
        let keypair = KeyPair::generate(self.backend, size)?;
        let pem = keypair.to_pem()?;
        tokio::fs::write(path, pem.to_string()).await?;
        Ok(())
    }

    async fn public_key_pem(&self, path: &Path) -> Result<String, SignatureError> {
        let keypair = self.load(path).await?;
        Ok(keypair.to_rcgen_keypair()?.public_key_pem())
    }

    async fn jwk(&self, path: &Path) -> Result<JsonWebKeyParameters, SignatureError> {
        self.load(path).await?.to_jwk_parameters()
    }

    async fn sign(&self, path: &Path, message: &[u8]) -> Result<Vec<u8>, SignatureError> {
        self.load(path).await?.sign(message)
    }

    async fn thumbprint(&self, jwk: &JsonWebKeyParameters) -> Result<String, SignatureError> {
        Ok(jwk_thumbprint(jwk))
    }

    async fn certificate_request(
        &self,
        path: &Path,
        domains: &[String],
    ) -> Result<Vec<u8>, SignatureError> {
        let keypair = self.load(path).await?;
        let csr = create_and_sign_csr(&keypair, domains)?;
        Ok(csr.der().to_vec())
    }
}
