use crate::acme::client::AcmeSession;
use crate::acme::directory::Endpoint;
use crate::acme::error::{Error, ProtocolResult};
use crate::acme::object::{Identifier, NewOrderRequest, OrderStatus};
use crate::acme::response::ResponseEnvelope;
use crate::acme::retry::{PollPolicy, poll_until};
use crate::ops::parse_status;
use std::str::FromStr;
use tracing::debug;
use url::Url;

/// Requests a new order for `domains` (`newOrder`). The order URL is the envelope's location.
pub async fn create_order(
    session: &AcmeSession,
    domains: &[String],
) -> ProtocolResult<ResponseEnvelope> {
    if session.account_url().is_none() {
        return Err(Error::ProtocolViolation(
            "orders can only be created for a registered account",
        ));
    }
    let identifiers = domains
        .iter()
        .map(|domain| Identifier::from_str(domain).unwrap_or_else(|never| match never {}))
        .collect();
    let request = NewOrderRequest { identifiers };
    let url = session.endpoint(Endpoint::NewOrder).await?;
    let envelope = session.post(&url, Some(&request)).await?;
    if envelope.is_success() && envelope.location.is_none() {
        return Err(Error::ProtocolViolation(
            "ACME server did not provide an order URL for created order",
        ));
    }
    Ok(envelope)
}

/// Fetches the current state of an order.
pub async fn check_order(session: &AcmeSession, order_url: &Url) -> ProtocolResult<ResponseEnvelope> {
    session.post_as_get(order_url).await
}

/// Polls the order until `accept` is satisfied by its status, or the attempts run out.
pub async fn poll_order_until<F>(
    session: &AcmeSession,
    order_url: &Url,
    policy: PollPolicy,
    accept: F,
) -> ProtocolResult<ResponseEnvelope>
where
    F: Fn(OrderStatus) -> bool,
{
    debug!("Waiting for order {order_url}");
    poll_until(
        policy,
        move || check_order(session, order_url),
        |envelope| parse_status::<OrderStatus>(envelope).is_some_and(&accept),
    )
    .await
}

/// Polls the order until the CA is done with it (it is neither `pending` nor `processing`).
pub async fn poll_order(session: &AcmeSession, order_url: &Url) -> ProtocolResult<ResponseEnvelope> {
    poll_order_until(session, order_url, PollPolicy::default(), |status| {
        !status.is_in_progress()
    })
    .await
}
