use crate::acme::client::AcmeSession;
use crate::acme::error::Error as AcmeError;
use crate::acme::object::{Authorization, AuthorizationStatus, Order, OrderStatus};
use crate::acme::response::ResponseEnvelope;
use crate::challenge_solver::ChallengePublisher;
use crate::crypto::KeyStore;
use crate::error::{IssueContext, IssueResult, Step, StepFailure};
use crate::ops::account::{AccountOptions, create_account};
use crate::ops::authorization::{authorize, wait_on_finish_authz};
use crate::ops::challenge::challenge;
use crate::ops::download::{DownloadedCertificate, download_certificate};
use crate::ops::finalize::{FinalizeParams, finalization};
use crate::ops::order::{create_order, poll_order};
use crate::ops::parse_status;
use crate::time::humanize_duration;
use anyhow::{Context, anyhow};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

pub const DEFAULT_ISSUE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
pub struct IssuanceRequest {
    pub domains: Vec<String>,
    pub account: AccountOptions,
    /// Certificate private key, replaced on every issuance
    pub key_file: PathBuf,
    pub cert_file: PathBuf,
    pub key_size: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub order_url: Url,
    pub certificate: DownloadedCertificate,
    /// Response of the download step
    pub envelope: ResponseEnvelope,
}

/// Runs the whole issuance: account, order, authorizations, finalization, download.
#[derive(Debug)]
pub struct AcmeIssuer {
    session: AcmeSession,
    cert_keys: Arc<dyn KeyStore>,
    publisher: Arc<dyn ChallengePublisher>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl AcmeIssuer {
    pub fn new(
        session: AcmeSession,
        cert_keys: Arc<dyn KeyStore>,
        publisher: Arc<dyn ChallengePublisher>,
    ) -> Self {
        Self {
            session,
            cert_keys,
            publisher,
            timeout: DEFAULT_ISSUE_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn session(&self) -> &AcmeSession {
        &self.session
    }

    /// Cancelling the returned token aborts a running [`issue`](Self::issue).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Issues a certificate and writes it to `request.cert_file`.
    ///
    /// If issuance fails (or is cancelled) after the old certificate and key were moved aside,
    /// they are put back.
    pub async fn issue(&self, request: &IssuanceRequest) -> IssueResult<IssuedCertificate> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                warn!("Issuance cancelled");
                Err(AcmeError::Cancelled.into())
            }
            result = tokio::time::timeout(self.timeout, self.run(request)) => match result {
                Ok(result) => result,
                Err(_) => {
                    error!("Issuance did not finish within {}s", self.timeout.as_secs());
                    Err(AcmeError::TimedOut("certificate issuance took too long").into())
                }
            },
        }
    }

    async fn run(&self, request: &IssuanceRequest) -> IssueResult<IssuedCertificate> {
        if request.domains.is_empty() {
            return anyhow!("No domains to issue a certificate for").client_failure();
        }
        let names = request.domains.join(", ");
        info!(
            "Issuing certificate for {names} at {}",
            self.session.directory_url()
        );

        expect_success(
            Step::Account,
            create_account(&self.session, &request.account).await?,
        )?;

        let order_envelope = expect_success(
            Step::Order,
            create_order(&self.session, &request.domains).await?,
        )?;
        let order_url = order_envelope
            .location
            .clone()
            .ok_or(AcmeError::ProtocolViolation("created order has no URL"))?;
        let order: Order = order_envelope.json().map_err(AcmeError::from)?;
        debug!("Order URL: {order_url}");
        if order.status == OrderStatus::Invalid {
            return Err(StepFailure::new(Step::Order, order_envelope).into());
        }

        for authz_url in &order.authorizations {
            self.authorize(&order_url, authz_url).await?;
        }
        info!("Finished authorizing all identifiers");

        let finalized = finalization(
            &self.session,
            self.cert_keys.as_ref(),
            FinalizeParams {
                order_url: &order_url,
                finalize_url: &order.finalize,
                authorizations: &order.authorizations,
                domains: &request.domains,
                key_file: &request.key_file,
                cert_file: &request.cert_file,
                key_size: request.key_size,
            },
        )
        .await?;
        let Some(backup) = finalized.backup else {
            return Err(StepFailure::new(Step::Finalize, finalized.envelope).into());
        };

        match self
            .download(&order_url, finalized.envelope, request)
            .await
        {
            Ok(issued) => {
                backup.discard().await.context("Removing certificate backup").client_failure()?;
                Ok(issued)
            }
            Err(e) => {
                warn!("Issuance failed after finalization, restoring previous certificate");
                if let Err(restore_err) = backup.restore().await {
                    error!("Restoring previous certificate failed: {restore_err}");
                }
                Err(e)
            }
        }
    }

    async fn authorize(&self, order_url: &Url, authz_url: &Url) -> IssueResult<()> {
        debug!("Checking authorization @ {authz_url}");
        let envelope = expect_success(
            Step::Authorization,
            authorize(&self.session, authz_url).await?,
        )?;
        let authz: Authorization = envelope.json().map_err(AcmeError::from)?;
        let id = &authz.identifier;
        match authz.status {
            AuthorizationStatus::Valid => {
                debug!("Authorization for {id} already valid");
                return Ok(());
            }
            AuthorizationStatus::Pending => {}
            status => {
                warn!("Authorization for {id} is {status:?}");
                return Err(StepFailure::new(Step::Authorization, envelope).into());
            }
        }

        let (chosen, http) = authz
            .http_challenge()
            .ok_or_else(|| anyhow!("Authorization for {id} does not offer an http-01 challenge"))
            .ca_failure()?;
        info!("Found pending authorization for {id}, solving http-01 challenge");
        let response = expect_success(
            Step::Challenge,
            challenge(
                &self.session,
                self.publisher.as_ref(),
                order_url,
                &chosen.url,
                &http.token,
            )
            .await?,
        )?;
        // Either the challenge itself or the order polled after it; both use "invalid" on failure
        if response.status_field() == Some("invalid") {
            return Err(StepFailure::new(Step::Challenge, response).into());
        }

        // The order only leaves pending once every authorization is done, so confirm this one
        let confirmed = wait_on_finish_authz(&self.session, authz_url).await?;
        if parse_status::<AuthorizationStatus>(&confirmed) != Some(AuthorizationStatus::Valid) {
            return Err(StepFailure::new(Step::Authorization, confirmed).into());
        }
        info!("Successfully validated challenge for {id}");
        Ok(())
    }

    async fn download(
        &self,
        order_url: &Url,
        finalized: ResponseEnvelope,
        request: &IssuanceRequest,
    ) -> IssueResult<IssuedCertificate> {
        let order_envelope =
            if parse_status::<OrderStatus>(&finalized) == Some(OrderStatus::Valid) {
                finalized
            } else {
                debug!("Waiting for the CA to issue the certificate");
                poll_order(&self.session, order_url).await?
            };
        let order_envelope = expect_success(Step::CheckOrder, order_envelope)?;
        let order: Order = order_envelope.json().map_err(AcmeError::from)?;
        let certificate_url = match (order.status, order.certificate) {
            (OrderStatus::Valid, Some(url)) => url,
            _ => return Err(StepFailure::new(Step::CheckOrder, order_envelope).into()),
        };
        debug!("Final certificate available @ {certificate_url}");

        let envelope = expect_success(
            Step::Download,
            download_certificate(&self.session, &certificate_url).await?,
        )?;
        let certificate = DownloadedCertificate::from_envelope(&envelope, &request.domains)?;
        write_certificate(&request.cert_file, &certificate.pem)
            .await
            .context(format!(
                "Writing certificate to {}",
                request.cert_file.display()
            ))
            .client_failure()?;
        info!(
            "Successfully issued a certificate, valid for {}",
            humanize_duration(certificate.leaf().validity.time_to_expiration())
        );
        Ok(IssuedCertificate {
            order_url: order_url.clone(),
            certificate,
            envelope,
        })
    }
}

fn expect_success(step: Step, envelope: ResponseEnvelope) -> Result<ResponseEnvelope, StepFailure> {
    if envelope.is_success() {
        Ok(envelope)
    } else {
        Err(StepFailure::new(step, envelope))
    }
}

async fn write_certificate(path: &Path, pem: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, pem).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::http::HttpResponse;
    use crate::acme::object::Token;
    use crate::acme::test_helper::{ScriptedTransport, json_response, problem, test_session};
    use crate::cert::tests::self_signed_pem;
    use crate::crypto::asymmetric::LocalKeyStore;
    use crate::crypto::backend::KeyBackend;
    use crate::error::IssueError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::io;
    use tempfile::TempDir;

    const OLD_CERT: &[u8] = b"old certificate";

    #[derive(Debug, Default)]
    struct MemoryPublisher {
        files: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChallengePublisher for MemoryPublisher {
        fn name(&self) -> &'static str {
            "memory"
        }

        async fn publish(&self, _token: &Token, key_authorization: &str) -> io::Result<()> {
            self.files.lock().push(key_authorization.to_string());
            Ok(())
        }

        async fn remove(&self, _token: &Token) -> io::Result<()> {
            Ok(())
        }
    }

    async fn issuer() -> (AcmeIssuer, Arc<ScriptedTransport>, Arc<MemoryPublisher>, TempDir) {
        let (session, transport, dir) = test_session(KeyBackend::Ecdsa).await;
        let publisher = Arc::new(MemoryPublisher::default());
        let issuer = AcmeIssuer::new(
            session,
            Arc::new(LocalKeyStore::new(KeyBackend::Ecdsa)),
            publisher.clone(),
        );
        std::fs::write(dir.path().join("cert.pem"), OLD_CERT).unwrap();
        (issuer, transport, publisher, dir)
    }

    fn request(dir: &TempDir) -> IssuanceRequest {
        IssuanceRequest {
            domains: vec!["example.org".to_string()],
            account: AccountOptions::default(),
            key_file: dir.path().join("cert.key"),
            cert_file: dir.path().join("cert.pem"),
            key_size: None,
        }
    }

    fn order(status: &str, certificate: bool) -> serde_json::Value {
        let mut order = json!({
            "status": status,
            "identifiers": [{"type": "dns", "value": "example.org"}],
            "authorizations": ["https://acme.test/authz/1"],
            "finalize": "https://acme.test/order/1/finalize"
        });
        if certificate {
            order["certificate"] = json!("https://acme.test/cert/1");
        }
        order
    }

    fn authz(status: &str, challenge_status: &str) -> serde_json::Value {
        json!({
            "status": status,
            "identifier": {"type": "dns", "value": "example.org"},
            "challenges": [{
                "type": "http-01",
                "url": "https://acme.test/chall/1",
                "status": challenge_status,
                "token": "abc123"
            }]
        })
    }

    fn script_until_finalize(transport: &ScriptedTransport) {
        transport.push(
            HttpResponse::new(201, transport.url("/new-acct"))
                .with_header("Location", "/acct/1")
                .with_body(r#"{"status":"valid"}"#),
        );
        transport.push(
            HttpResponse::new(201, transport.url("/new-order"))
                .with_header("Location", "/order/1")
                .with_body(order("pending", false).to_string()),
        );
        transport.push(json_response("/authz/1", &authz("pending", "pending")));
        transport.push(json_response("/chall/1", &json!({"type": "http-01", "url": "https://acme.test/chall/1", "status": "processing", "token": "abc123"})));
        transport.push(json_response("/order/1", &order("ready", false)));
        transport.push(json_response("/authz/1", &authz("valid", "valid")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_issue_with_challenge() {
        let (issuer, transport, publisher, dir) = issuer().await;
        script_until_finalize(&transport);
        transport.push(json_response("/order/1/finalize", &order("processing", false)));
        transport.push(json_response("/order/1", &order("valid", true)));
        let pem = self_signed_pem(&["example.org"]);
        transport.push(HttpResponse::new(200, transport.url("/cert/1")).with_body(pem.clone()));

        let issued = issuer.issue(&request(&dir)).await.unwrap();
        assert_eq!(issued.certificate.pem, pem);
        assert_eq!(issued.order_url, transport.url("/order/1"));
        assert_eq!(std::fs::read_to_string(dir.path().join("cert.pem")).unwrap(), pem);
        assert!(dir.path().join("cert.key").exists());
        assert!(!dir.path().join("cert.pem.bak").exists());
        assert_eq!(
            *publisher.files.lock(),
            vec![format!("abc123.{}", issuer.session().thumbprint())]
        );
        assert_eq!(transport.remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_failure_restores_certificate() {
        let (issuer, transport, _publisher, dir) = issuer().await;
        script_until_finalize(&transport);
        transport.push(json_response("/order/1/finalize", &order("valid", true)));
        transport.push(problem(500, "serverInternal"));

        let err = issuer.issue(&request(&dir)).await.unwrap_err();
        assert!(matches!(err, IssueError::CAFailure(_)));
        assert_eq!(err.envelope().unwrap().error_code(), 500);
        assert_eq!(std::fs::read(dir.path().join("cert.pem")).unwrap(), OLD_CERT);
        assert!(!dir.path().join("cert.key").exists());
    }

    #[tokio::test]
    async fn test_rejected_challenge_fails_before_finalize() {
        let (issuer, transport, _publisher, dir) = issuer().await;
        transport.push(
            HttpResponse::new(201, transport.url("/new-acct"))
                .with_header("Location", "/acct/1")
                .with_body(r#"{"status":"valid"}"#),
        );
        transport.push(
            HttpResponse::new(201, transport.url("/new-order"))
                .with_header("Location", "/order/1")
                .with_body(order("pending", false).to_string()),
        );
        transport.push(json_response("/authz/1", &authz("pending", "pending")));
        transport.push(json_response("/chall/1", &json!({"type": "http-01", "url": "https://acme.test/chall/1", "status": "invalid", "token": "abc123"})));

        let err = issuer.issue(&request(&dir)).await.unwrap_err();
        assert!(matches!(err, IssueError::CAFailure(_)));
        assert_eq!(err.envelope().unwrap().status_field(), Some("invalid"));
        assert!(transport.posts_to("/order/1/finalize").is_empty());
        assert_eq!(std::fs::read(dir.path().join("cert.pem")).unwrap(), OLD_CERT);
    }

    #[tokio::test]
    async fn test_failing_step_envelope_is_propagated() {
        let (issuer, transport, _publisher, dir) = issuer().await;
        transport.push(problem(403, "unauthorized"));
        let err = issuer.issue(&request(&dir)).await.unwrap_err();
        assert!(matches!(err, IssueError::AuthFailure(_)));
        let envelope = err.envelope().unwrap();
        assert_eq!(envelope.error_code(), 403);
        assert_eq!(envelope.problem_type(), Some("unauthorized"));
        assert_eq!(transport.posts_to("/new-order").len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_restores_certificate() {
        let (issuer, transport, _publisher, dir) = issuer().await;
        let issuer = issuer.with_timeout(Duration::from_secs(11));
        script_until_finalize(&transport);
        transport.push(json_response("/order/1/finalize", &order("processing", false)));
        for _ in 0..10 {
            transport.push(json_response("/order/1", &order("processing", false)));
        }

        let err = issuer.issue(&request(&dir)).await.unwrap_err();
        assert!(matches!(err, IssueError::ClientFailure(_)));
        assert_eq!(std::fs::read(dir.path().join("cert.pem")).unwrap(), OLD_CERT);
        assert!(!dir.path().join("cert.key").exists());
        assert!(!dir.path().join("cert.pem.bak").exists());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (issuer, transport, _publisher, dir) = issuer().await;
        issuer.cancellation_token().cancel();
        let err = issuer.issue(&request(&dir)).await.unwrap_err();
        assert!(matches!(err, IssueError::ClientFailure(_)));
        assert!(transport.requests().is_empty());
    }
}
