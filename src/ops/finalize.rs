use crate::acme::client::AcmeSession;
use crate::acme::error::{Error, ProtocolResult};
use crate::acme::object::{AuthorizationStatus, FinalizeRequest, OrderStatus};
use crate::acme::response::ResponseEnvelope;
use crate::acme::retry::PollPolicy;
use crate::backup::CertificateBackup;
use crate::crypto::{KeyStore, base64url};
use crate::ops::authorization::wait_on_finish_authz;
use crate::ops::order::poll_order_until;
use crate::ops::parse_status;
use std::path::Path;
use tracing::{error, info, warn};
use url::Url;

#[derive(Debug, Clone, Copy)]
pub struct FinalizeParams<'a> {
    pub order_url: &'a Url,
    pub finalize_url: &'a Url,
    pub authorizations: &'a [Url],
    pub domains: &'a [String],
    pub key_file: &'a Path,
    pub cert_file: &'a Path,
    pub key_size: Option<u32>,
}

#[derive(Debug)]
pub struct Finalized {
    pub envelope: ResponseEnvelope,
    /// The previous certificate and key, present when the CA accepted the request.
    /// Restore it if anything after finalization fails.
    pub backup: Option<CertificateBackup>,
}

impl Finalized {
    pub fn is_accepted(&self) -> bool {
        self.backup.is_some()
    }
}

/// Replaces the certificate key and submits a CSR for the order.
///
/// The current certificate and key are backed up and removed first. If the CA does not accept
/// the request, or anything on our side fails, they are restored before returning.
pub async fn finalization(
    session: &AcmeSession,
    store: &dyn KeyStore,
    params: FinalizeParams<'_>,
) -> ProtocolResult<Finalized> {
    let backup = CertificateBackup::create(&[params.cert_file, params.key_file]).await?;
    let result = match backup.remove_originals().await {
        Ok(()) => finalize_with_new_key(session, store, params).await,
        Err(e) => Err(Error::IoError(e)),
    };
    match result {
        Ok(envelope) if is_accepted(&envelope) => Ok(Finalized {
            envelope,
            backup: Some(backup),
        }),
        Ok(envelope) => {
            warn!("CA did not accept the certificate request: {}", envelope.outcome);
            rollback(backup).await;
            Ok(Finalized {
                envelope,
                backup: None,
            })
        }
        Err(e) => {
            warn!("Finalizing the order failed: {e}");
            rollback(backup).await;
            Err(e)
        }
    }
}

fn is_accepted(envelope: &ResponseEnvelope) -> bool {
    envelope.is_success()
        && !matches!(
            parse_status::<OrderStatus>(envelope),
            Some(OrderStatus::Pending | OrderStatus::Invalid)
        )
}

async fn rollback(backup: CertificateBackup) {
    if let Err(e) = backup.restore().await {
        error!("Restoring the previous certificate failed, manual intervention needed: {e}");
    }
}

async fn finalize_with_new_key(
    session: &AcmeSession,
    store: &dyn KeyStore,
    params: FinalizeParams<'_>,
) -> ProtocolResult<ResponseEnvelope> {
    store
        .generate_private_key(params.key_file, params.key_size)
        .await?;
    let csr = store
        .certificate_request(params.key_file, params.domains)
        .await?;
    let request = FinalizeRequest {
        csr: base64url(csr),
    };

    let envelope = session.post(params.finalize_url, Some(&request)).await?;

    if envelope.is_success() && parse_status::<OrderStatus>(&envelope) == Some(OrderStatus::Pending)
    {
        info!("Order still has pending authorizations, waiting for them before finalizing again");
        for authz_url in params.authorizations {
            let authz = wait_on_finish_authz(session, authz_url).await?;
            if parse_status::<AuthorizationStatus>(&authz) != Some(AuthorizationStatus::Valid) {
                return Ok(authz);
            }
        }
        return session.post(params.finalize_url, Some(&request)).await;
    }

    if envelope
        .problem()
        .is_some_and(crate::acme::error::Problem::is_order_not_ready)
    {
        info!("Order is not ready yet, waiting before finalizing again");
        let order = poll_order_until(
            session,
            params.order_url,
            PollPolicy::default(),
            |status| {
                matches!(
                    status,
                    OrderStatus::Ready | OrderStatus::Valid | OrderStatus::Invalid
                )
            },
        )
        .await?;
        if parse_status::<OrderStatus>(&order) == Some(OrderStatus::Ready) {
            return session.post(params.finalize_url, Some(&request)).await;
        }
        return Ok(order);
    }

    Ok(envelope)
}
