use crate::acme::client::AcmeSession;
use crate::acme::error::{Error, ProtocolResult};
use crate::acme::object::{ChallengeStatus, EmptyObject, OrderStatus, Token};
use crate::acme::response::ResponseEnvelope;
use crate::acme::retry::PollPolicy;
use crate::challenge_solver::{ChallengePublisher, key_authorization};
use crate::ops::order::poll_order_until;
use crate::ops::parse_status;
use tracing::{debug, info, warn};
use url::Url;

/// Solves one http-01 challenge.
///
/// Publishes `token.thumbprint`, tells the CA to validate, and if the challenge response is not
/// final yet, polls the *order* until it leaves `pending`. The published file is removed again in
/// every case. Returns the challenge response, or the last order response if polling happened.
pub async fn challenge(
    session: &AcmeSession,
    publisher: &dyn ChallengePublisher,
    order_url: &Url,
    challenge_url: &Url,
    token: &Token,
) -> ProtocolResult<ResponseEnvelope> {
    let thumbprint = session.thumbprint();
    let content = key_authorization(token, &thumbprint);
    publisher
        .publish(token, &content)
        .await
        .map_err(Error::Executor)?;
    info!("Published http-01 challenge {token} using {}", publisher.name());

    let result = respond_and_wait(session, order_url, challenge_url).await;

    if let Err(e) = publisher.remove(token).await {
        warn!("Could not remove challenge file for {token}: {e}");
    }
    result
}

async fn respond_and_wait(
    session: &AcmeSession,
    order_url: &Url,
    challenge_url: &Url,
) -> ProtocolResult<ResponseEnvelope> {
    let envelope = session.post(challenge_url, Some(&EmptyObject {})).await?;
    if !envelope.is_success() {
        return Ok(envelope);
    }
    match parse_status::<ChallengeStatus>(&envelope) {
        Some(status) if status.is_terminal() => {
            debug!("Challenge {challenge_url} is already {status:?}");
            Ok(envelope)
        }
        _ => {
            poll_order_until(session, order_url, PollPolicy::default(), |status| {
                status != OrderStatus::Pending
            })
            .await
        }
    }
}
