//! Command builders for key management through the `openssl` command line tool.
//!
//! Nothing in here runs a process. A [`KeyBackend`] only describes *what* to run as a
//! [`KeyCommand`], so that the command can later be executed as a different OS user or through a
//! privilege elevation tool by a [`CommandExecutor`](crate::cmd_runner::CommandExecutor).
//! The backend also knows how to interpret the textual output of the commands it builds.

use crate::crypto::SignatureError;
use crate::crypto::jws::{Algorithm, JsonWebKeyEcdsa, JsonWebKeyParameters, JsonWebKeyRsa};
use crate::crypto::{base64url, decode_standard_base64};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::path::Path;

const OPENSSL: &str = "openssl";
pub const DEFAULT_RSA_KEY_SIZE: u32 = 4096;
pub const MIN_RSA_KEY_SIZE: u32 = 2048;
/// Length of one P-256 coordinate (and of r and s in a P-256 signature)
const P256_FIELD_LENGTH: usize = 32;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Run the first token as program with the remaining tokens as its arguments
    Direct,
    /// Hand the tokens to `/bin/sh -c`. Needed when two programs are piped together.
    Shell,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCommand {
    pub args: Vec<String>,
    pub mode: ExecutionMode,
    pub stdin: Option<Vec<u8>>,
}

/// Tokens that keep their meaning as shell operators in [`ExecutionMode::Shell`]
const SHELL_OPERATORS: [&str; 4] = ["|", "&&", ">", ";"];

impl KeyCommand {
    pub fn direct<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            mode: ExecutionMode::Direct,
            stdin: None,
        }
    }

    pub fn shell<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            mode: ExecutionMode::Shell,
            stdin: None,
        }
    }

    #[must_use]
    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn program(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }

    /// Renders the command as a single line for `sh -c`, quoting every token that is not a
    /// shell operator.
    pub fn to_shell_line(&self) -> String {
        self.args
            .iter()
            .map(|arg| {
                if self.mode == ExecutionMode::Shell && SHELL_OPERATORS.contains(&arg.as_str()) {
                    arg.clone()
                } else {
                    shell_quote(arg)
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Display for KeyCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_shell_line())
    }
}

pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@+".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyBackend {
    #[default]
    Rsa,
    Ecdsa,
}

impl Display for KeyBackend {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyBackend::Rsa => write!(f, "RSA"),
            KeyBackend::Ecdsa => write!(f, "ECDSA P-256"),
        }
    }
}

impl KeyBackend {
    /// Selects the backend for a configured key type. Anything that is not an ECDSA spelling
    /// falls back to RSA.
    pub fn from_key_type(key_type: &str) -> Self {
        match key_type.trim().to_ascii_lowercase().as_str() {
            "ecdsa" | "ec" | "ecc" | "p256" | "p-256" => KeyBackend::Ecdsa,
            _ => KeyBackend::Rsa,
        }
    }

    pub fn algorithm(self) -> Algorithm {
        match self {
            KeyBackend::Rsa => Algorithm::RsaPkcs1Sha256,
            KeyBackend::Ecdsa => Algorithm::EcdsaP256Sha256,
        }
    }

    pub fn prepare_private_key(self, path: &Path, size: Option<u32>) -> KeyCommand {
        let path = path.display().to_string();
        match self {
            KeyBackend::Rsa => {
                let size = size.unwrap_or(DEFAULT_RSA_KEY_SIZE).max(MIN_RSA_KEY_SIZE);
                KeyCommand::direct([OPENSSL, "genrsa", "-out", &path, &size.to_string()])
            }
            KeyBackend::Ecdsa => KeyCommand::direct([
                OPENSSL,
                "ecparam",
                "-name",
                "prime256v1",
                "-genkey",
                "-noout",
                "-out",
                &path,
            ]),
        }
    }

    pub fn prepare_public_key(self, private_key_path: &Path) -> KeyCommand {
        let path = private_key_path.display().to_string();
        KeyCommand::direct([OPENSSL, self.openssl_key_command(), "-in", &path, "-pubout"])
    }

    /// SHA-256 signature over `data`, printed as standard base64 on a single line.
    pub fn sign(self, private_key_path: &Path, data: &[u8]) -> KeyCommand {
        let path = private_key_path.display().to_string();
        KeyCommand::shell([
            OPENSSL, "dgst", "-sha256", "-sign", &path, "|", OPENSSL, "base64", "-A",
        ])
        .with_stdin(data)
    }

    /// Prints the public key parameters (RSA modulus and exponent, or the EC point) in text form.
    pub fn public_key_parameters(self, public_key_pem: &str) -> KeyCommand {
        KeyCommand::direct([OPENSSL, self.openssl_key_command(), "-pubin", "-noout", "-text"])
            .with_stdin(public_key_pem)
    }

    pub fn jwk_thumbprint_command(self, jwk_json: &str) -> KeyCommand {
        KeyCommand::shell([
            OPENSSL, "dgst", "-sha256", "-binary", "|", OPENSSL, "base64", "-A",
        ])
        .with_stdin(jwk_json)
    }

    /// DER encoded certificate signing request for `domains`, printed as standard base64.
    /// The first domain becomes the subject common name, all domains are added as SANs.
    pub fn certificate_request(self, private_key_path: &Path, domains: &[String]) -> KeyCommand {
        let path = private_key_path.display().to_string();
        let common_name = domains.first().map(String::as_str).unwrap_or_default();
        let subject = format!("/CN={common_name}");
        let alt_names = domains
            .iter()
            .map(|domain| format!("DNS:{domain}"))
            .collect::<Vec<_>>()
            .join(",");
        let san = format!("subjectAltName={alt_names}");
        KeyCommand::shell([
            OPENSSL, "req", "-new", "-sha256", "-key", &path, "-subj", &subject, "-addext", &san,
            "-outform", "DER", "|", OPENSSL, "base64", "-A",
        ])
    }

    fn openssl_key_command(self) -> &'static str {
        match self {
            KeyBackend::Rsa => "rsa",
            KeyBackend::Ecdsa => "ec",
        }
    }

    /// Interprets the output of [`KeyBackend::public_key_parameters`].
    pub fn parse_public_key_parameters(
        self,
        lines: &[String],
    ) -> Result<JsonWebKeyParameters, SignatureError> {
        match self {
            KeyBackend::Rsa => {
                let (modulus, exponent) = parse_rsa_public_key_text(lines)?;
                Ok(JsonWebKeyParameters::Rsa(JsonWebKeyRsa::new(
                    base64url(modulus),
                    base64url(exponent),
                )))
            }
            KeyBackend::Ecdsa => {
                let (x, y) = parse_ec_public_key_text(lines, P256_FIELD_LENGTH)?;
                Ok(JsonWebKeyParameters::Ecdsa(JsonWebKeyEcdsa::new(
                    base64url(x),
                    base64url(y),
                )))
            }
        }
    }

    /// Converts the base64 output of [`KeyBackend::sign`] into the raw JWS signature bytes.
    pub fn decode_signature(self, output: &str) -> Result<Vec<u8>, SignatureError> {
        let signature = decode_standard_base64(output)?;
        if signature.is_empty() {
            return Err(SignatureError::SignatureGeneration(
                "signing command produced no signature",
            ));
        }
        match self {
            KeyBackend::Rsa => Ok(signature),
            // openssl emits ASN.1 DER (r, s) while JOSE wants fixed-width r || s
            KeyBackend::Ecdsa => der_signature_to_fixed(&signature),
        }
    }
}

/// Collects the colon separated hex bytes following a `label` line, e.g. `Modulus:` or `pub:`.
fn collect_hex_block(lines: &[String], label: &str) -> Option<Vec<u8>> {
    let start = lines.iter().position(|line| line.trim() == label)?;
    let mut bytes = Vec::new();
    for line in &lines[start + 1..] {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        let mut parsed_any = false;
        for byte in line.split(':').filter(|part| !part.is_empty()) {
            match u8::from_str_radix(byte, 16) {
                Ok(byte) if byte_is_hex_pair(line) => {
                    bytes.push(byte);
                    parsed_any = true;
                }
                _ => {
                    parsed_any = false;
                    break;
                }
            }
        }
        if !parsed_any {
            break;
        }
    }
    if bytes.is_empty() { None } else { Some(bytes) }
}

fn byte_is_hex_pair(line: &str) -> bool {
    line.split(':')
        .filter(|part| !part.is_empty())
        .all(|part| part.len() == 2 && part.chars().all(|c| c.is_ascii_hexdigit()))
}

fn strip_leading_zeros(bytes: &[u8]) -> Vec<u8> {
    let first_non_zero = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[first_non_zero..].to_vec()
}

/// Parses `openssl rsa -pubin -noout -text` output.
pub fn parse_rsa_public_key_text(lines: &[String]) -> Result<(Vec<u8>, Vec<u8>), SignatureError> {
    let modulus = collect_hex_block(lines, "Modulus:")
        .ok_or(SignatureError::EncodingFailed("RSA modulus missing from key output"))?;
    let exponent_line = lines
        .iter()
        .map(|line| line.trim())
        .find_map(|line| line.strip_prefix("Exponent:"))
        .ok_or(SignatureError::EncodingFailed("RSA exponent missing from key output"))?;
    let exponent: u64 = exponent_line
        .split_whitespace()
        .next()
        .and_then(|decimal| decimal.parse().ok())
        .ok_or(SignatureError::EncodingFailed("RSA exponent is not a number"))?;
    let exponent = strip_leading_zeros(&exponent.to_be_bytes());
    Ok((strip_leading_zeros(&modulus), exponent))
}

/// Parses `openssl ec -pubin -noout -text` output into the affine x and y coordinates.
pub fn parse_ec_public_key_text(
    lines: &[String],
    field_length: usize,
) -> Result<(Vec<u8>, Vec<u8>), SignatureError> {
    let point = collect_hex_block(lines, "pub:")
        .ok_or(SignatureError::EncodingFailed("EC public point missing from key output"))?;
    if point.len() != 1 + 2 * field_length || point[0] != 0x04 {
        return Err(SignatureError::EncodingFailed(
            "EC public point is not an uncompressed point of the expected curve",
        ));
    }
    let x = point[1..=field_length].to_vec();
    let y = point[1 + field_length..].to_vec();
    Ok((x, y))
}

/// Converts an ASN.1 DER `ECDSA-Sig-Value` as printed by `openssl dgst -sign` into the
/// fixed-width `r || s` form used by JWS.
pub fn der_signature_to_fixed(der: &[u8]) -> Result<Vec<u8>, SignatureError> {
    let signature = p256::ecdsa::Signature::from_der(der).map_err(|_| {
        SignatureError::EncodingFailed("ECDSA signature is not a valid DER sequence")
    })?;
    Ok(signature.to_bytes().to_vec())
}
