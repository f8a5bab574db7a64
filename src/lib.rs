use crate::acme::client::AcmeSession;
use crate::acme::http::{HttpClient, HttpTransport};
use crate::cert::load_reqwest_certificates;
use crate::challenge_solver::{ChallengePublisher, ExecutorWebrootPublisher, WebrootPublisher};
use crate::cmd_runner::{CommandExecutor, ProcessExecutor};
use crate::config::{Configuration, ExecutorBackend};
use crate::crypto::KeyStore;
use crate::crypto::asymmetric::LocalKeyStore;
use crate::crypto::backend::KeyBackend;
use crate::crypto::external::ExternalKeyStore;
use crate::crypto::jws::JsonWebKey;
use crate::issuer::{AcmeIssuer, IssuanceRequest};
use crate::ops::account::{AccountOptions, load_account_key};
use anyhow::{Context, bail};
use std::sync::Arc;

pub mod acme;
pub mod backup;
pub mod cert;
pub mod challenge_solver;
pub mod cli;
pub mod cmd_runner;
pub mod config;
pub mod crypto;
pub mod error;
pub mod issuer;
pub mod lock;
pub mod ops;
pub mod time;
mod util;

pub const CRATE_NAME: &str = env!("CARGO_PKG_NAME");

/// Builds sessions and issuers from a [`Configuration`].
#[derive(Debug, Clone)]
pub struct Certsmith {
    config: Configuration,
    executor: Arc<dyn CommandExecutor>,
}

impl Certsmith {
    pub fn new(config: Configuration) -> Self {
        Self::with_executor(config, Arc::new(ProcessExecutor::new()))
    }

    pub fn with_executor(config: Configuration, executor: Arc<dyn CommandExecutor>) -> Self {
        Self { config, executor }
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn key_store(&self, backend: KeyBackend) -> Arc<dyn KeyStore> {
        match self.config.executor.backend {
            ExecutorBackend::External => Arc::new(ExternalKeyStore::new(
                backend,
                self.executor.clone(),
                self.config.executor.exec_options(),
            )),
            ExecutorBackend::Local => Arc::new(LocalKeyStore::new(backend)),
        }
    }

    pub fn publisher(&self) -> Arc<dyn ChallengePublisher> {
        let webroot = self.config.webroot.clone();
        match self.config.executor.backend {
            ExecutorBackend::External => Arc::new(ExecutorWebrootPublisher::new(
                webroot,
                self.executor.clone(),
                self.config.executor.exec_options(),
            )),
            ExecutorBackend::Local => Arc::new(WebrootPublisher::new(webroot)),
        }
    }

    pub async fn transport(&self) -> anyhow::Result<Arc<dyn HttpTransport>> {
        let client = if self.config.extra_root_certificates.is_empty() {
            HttpClient::try_new()?
        } else {
            let roots =
                load_reqwest_certificates(self.config.extra_root_certificates.iter()).await?;
            HttpClient::try_new_with_custom_roots(roots)?
        };
        Ok(Arc::new(client))
    }

    /// The configured account key, created if it does not exist yet.
    pub async fn account_key(&self) -> anyhow::Result<JsonWebKey> {
        let account = &self.config.account;
        load_account_key(
            self.key_store(account.backend()),
            &account.key_file,
            account.key_size,
        )
        .await
        .with_context(|| format!("Loading account key {}", account.key_file.display()))
    }

    pub async fn session_with(&self, transport: Arc<dyn HttpTransport>) -> anyhow::Result<AcmeSession> {
        let key = self.account_key().await?;
        Ok(AcmeSession::new(
            self.config.directory_url.clone(),
            transport,
            key,
        ))
    }

    pub async fn session(&self) -> anyhow::Result<AcmeSession> {
        self.session_with(self.transport().await?).await
    }

    pub fn issuer(&self, session: AcmeSession) -> AcmeIssuer {
        AcmeIssuer::new(
            session,
            self.key_store(self.config.certificate.backend()),
            self.publisher(),
        )
        .with_timeout(self.config.timeout)
    }

    pub fn account_options(&self) -> AccountOptions {
        AccountOptions {
            contact: self.config.contact.clone(),
            terms_of_service_agreed: self.config.terms_of_service_agreed,
        }
    }

    /// The configured certificate, optionally for a different set of domains.
    pub fn issuance_request(&self, domains: Option<Vec<String>>) -> anyhow::Result<IssuanceRequest> {
        let domains = domains.unwrap_or_else(|| self.config.domains.clone());
        if domains.is_empty() {
            bail!("No domains configured. Set `domains` in the configuration or pass --domains");
        }
        let certificate = &self.config.certificate;
        Ok(IssuanceRequest {
            domains,
            account: self.account_options(),
            key_file: certificate.key_file.clone(),
            cert_file: certificate.cert_file.clone(),
            key_size: certificate.key_size,
        })
    }
}
