use crate::cmd_runner::ExecOptions;
use crate::config::toml::TomlConfiguration;
use crate::crypto::backend::KeyBackend;
use crate::util::serde_helper::duration;
use serde::Deserialize;
use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

mod default;
mod toml;

pub use default::DEFAULT_CONFIG_FILE;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Configuration {
    #[serde(default = "default::directory_url")]
    pub directory_url: Url,
    #[serde(default)]
    pub contact: Vec<Url>,
    #[serde(default)]
    pub domains: Vec<String>,
    pub webroot: PathBuf,
    /// Deadline for a complete issuance
    #[serde(default = "default::issue_timeout", deserialize_with = "duration::deserialize")]
    pub timeout: Duration,
    #[serde(default)]
    pub terms_of_service_agreed: bool,
    /// Additional trust anchors (PEM files), e.g. for test CAs
    #[serde(default)]
    pub extra_root_certificates: Vec<PathBuf>,
    #[serde(default = "default::account_key")]
    pub account: KeyConfiguration,
    pub certificate: CertificateConfiguration,
    #[serde(default)]
    pub executor: ExecutorConfiguration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyConfiguration {
    /// `rsa` or `ecdsa`, anything unrecognized means RSA
    #[serde(default)]
    pub key_type: String,
    pub key_file: PathBuf,
    pub key_size: Option<u32>,
}

impl KeyConfiguration {
    pub fn backend(&self) -> KeyBackend {
        KeyBackend::from_key_type(&self.key_type)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CertificateConfiguration {
    #[serde(default)]
    pub key_type: String,
    pub key_file: PathBuf,
    pub key_size: Option<u32>,
    pub cert_file: PathBuf,
}

impl CertificateConfiguration {
    pub fn backend(&self) -> KeyBackend {
        KeyBackend::from_key_type(&self.key_type)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorBackend {
    /// Keys are handled by `openssl`, run through the command executor
    #[default]
    External,
    /// Keys are handled in-process
    Local,
}

#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfiguration {
    #[serde(default)]
    pub backend: ExecutorBackend,
    pub user: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub elevate: bool,
    #[serde(default = "default::command_timeout", deserialize_with = "duration::deserialize")]
    pub timeout: Duration,
}

impl Default for ExecutorConfiguration {
    fn default() -> Self {
        Self {
            backend: ExecutorBackend::default(),
            user: None,
            password: None,
            elevate: false,
            timeout: default::command_timeout(),
        }
    }
}

impl Debug for ExecutorConfiguration {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorConfiguration")
            .field("backend", &self.backend)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("elevate", &self.elevate)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ExecutorConfiguration {
    pub fn exec_options(&self) -> ExecOptions {
        ExecOptions {
            as_user: self.user.clone(),
            password: self.password.clone(),
            elevate: self.elevate,
            timeout: self.timeout,
        }
    }
}

pub trait ConfigBackend {
    fn load<P: AsRef<Path>>(file: P) -> Result<Configuration, anyhow::Error>;
}

pub fn load<P: AsRef<Path>>(file: P) -> Result<Configuration, anyhow::Error> {
    TomlConfiguration::load(file)
}
