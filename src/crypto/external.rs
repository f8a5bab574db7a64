//! [`KeyStore`] that runs `openssl` through a [`CommandExecutor`].
//!
//! This keeps private keys out of the client process entirely: the executor can run every
//! command as a dedicated OS user that is the only one allowed to read the key files.

use crate::cmd_runner::{CommandExecutor, CommandOutput, ExecOptions};
use crate::crypto::backend::{KeyBackend, KeyCommand};
use crate::crypto::jws::JsonWebKeyParameters;
use crate::crypto::{KeyStore, SignatureError, decode_standard_base64, standard_to_base64url};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ExternalKeyStore {
    backend: KeyBackend,
    executor: Arc<dyn CommandExecutor>,
    options: ExecOptions,
}

/// Lines that sudo, su or login shells print in addition to the command output.
pub fn is_interactive_noise(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return true;
    }
    let lower = trimmed.to_ascii_lowercase();
    lower.starts_with("[sudo]")
        || lower.starts_with("password:")
        || lower.starts_with("password for")
        || lower.ends_with("password:")
        || lower.starts_with("last login:")
        || lower.starts_with("we trust you have received")
}

/// Output lines without prompts and banners.
pub fn strip_interactive_noise(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter(|line| !is_interactive_noise(line))
        .map(|line| line.trim().to_string())
        .collect()
}

impl ExternalKeyStore {
    pub fn new(backend: KeyBackend, executor: Arc<dyn CommandExecutor>, options: ExecOptions) -> Self {
        Self {
            backend,
            executor,
            options,
        }
    }

    /// Runs `command` and fails if it exits non-zero. Returns the cleaned output lines.
    async fn run(
        &self,
        operation: &'static str,
        command: &KeyCommand,
    ) -> Result<Vec<String>, SignatureError> {
        let CommandOutput { lines, exit_code } =
            self.executor.execute(command, &self.options).await?;
        let lines = strip_interactive_noise(&lines);
        if exit_code != 0 {
            warn!("{operation} failed with exit code {exit_code}");
            return Err(SignatureError::CommandFailed {
                operation,
                exit_code,
                output: lines.join("\n"),
            });
        }
        Ok(lines)
    }
}

#[async_trait]
impl KeyStore for ExternalKeyStore {
    fn backend(&self) -> KeyBackend {
        self.backend
    }

    async fn key_exists(&self, path: &Path) -> Result<bool, SignatureError> {
        let command = KeyCommand::direct(["test", "-f", &path.display().to_string()]);
        let output = self.executor.execute(&command, &self.options).await?;
        Ok(output.success())
    }

    async fn generate_private_key(
        &self,
        path: &Path,
        size: Option<u32>,
    ) -> Result<(), SignatureError> {
        debug!("Generating new {} key at {}", self.backend, path.display());
        let command = self.backend.prepare_private_key(path, size);
        self.run("private key generation", &command).await?;
        Ok(())
    }

    async fn public_key_pem(&self, path: &Path) -> Result<String, SignatureError> {
        let command = self.backend.prepare_public_key(path);
        let lines = self.run("public key derivation", &command).await?;
        let begin = lines
            .iter()
            .position(|line| line.starts_with("-----BEGIN PUBLIC KEY-----"));
        let end = lines
            .iter()
            .position(|line| line.starts_with("-----END PUBLIC KEY-----"));
        match (begin, end) {
            (Some(begin), Some(end)) if begin < end => {
                let mut pem = lines[begin..=end].join("\n");
                pem.push('\n');
                Ok(pem)
            }
            _ => Err(SignatureError::EncodingFailed(
                "public key command did not print a PEM public key",
            )),
        }
    }

    async fn jwk(&self, path: &Path) -> Result<JsonWebKeyParameters, SignatureError> {
        let public_key = self.public_key_pem(path).await?;
        let command = self.backend.public_key_parameters(&public_key);
        let lines = self.run("public key inspection", &command).await?;
        self.backend.parse_public_key_parameters(&lines)
    }

    async fn sign(&self, path: &Path, message: &[u8]) -> Result<Vec<u8>, SignatureError> {
        let command = self.backend.sign(path, message);
        let lines = self.run("signing", &command).await?;
        self.backend.decode_signature(&lines.concat())
    }

    async fn thumbprint(&self, jwk: &JsonWebKeyParameters) -> Result<String, SignatureError> {
        let command = self.backend.jwk_thumbprint_command(&jwk.canonical_json());
        let lines = self.run("thumbprint", &command).await?;
        standard_to_base64url(&lines.concat())
    }

    async fn certificate_request(
        &self,
        path: &Path,
        domains: &[String],
    ) -> Result<Vec<u8>, SignatureError> {
        let command = self.backend.certificate_request(path, domains);
        let lines = self.run("certificate request", &command).await?;
        let der = decode_standard_base64(&lines.concat())?;
        if der.is_empty() {
            return Err(SignatureError::EncodingFailed(
                "certificate request command produced no output",
            ));
        }
        Ok(der)
    }
}
