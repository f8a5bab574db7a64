use crate::acme::client::AcmeSession;
use crate::acme::error::ProtocolResult;
use crate::acme::object::AuthorizationStatus;
use crate::acme::response::ResponseEnvelope;
use crate::acme::retry::{PollPolicy, poll_until};
use crate::ops::parse_status;
use tracing::debug;
use url::Url;

/// Fetches an authorization with its challenges.
pub async fn authorize(session: &AcmeSession, authz_url: &Url) -> ProtocolResult<ResponseEnvelope> {
    session.post_as_get(authz_url).await
}

/// Polls an authorization until it leaves `pending`.
pub async fn wait_on_finish_authz(
    session: &AcmeSession,
    authz_url: &Url,
) -> ProtocolResult<ResponseEnvelope> {
    debug!("Waiting for authorization {authz_url}");
    poll_until(
        PollPolicy::default(),
        move || authorize(session, authz_url),
        |envelope| {
            parse_status::<AuthorizationStatus>(envelope)
                .is_some_and(|status| status != AuthorizationStatus::Pending)
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::object::Authorization;
    use crate::acme::test_helper::{json_response, test_session};
    use crate::crypto::backend::KeyBackend;
    use serde_json::json;

    fn authz(status: &str) -> serde_json::Value {
        json!({
            "status": status,
            "identifier": {"type": "dns", "value": "example.org"},
            "challenges": [{
                "type": "http-01",
                "url": "https://acme.test/chall/1",
                "status": "pending",
                "token": "abc123"
            }]
        })
    }

    #[tokio::test]
    async fn test_authorize_returns_challenges() {
        let (session, transport, _dir) = test_session(KeyBackend::Ecdsa).await;
        session.set_account_url(transport.url("/acct/1"));
        transport.push(json_response("/authz/1", &authz("pending")));
        let envelope = authorize(&session, &transport.url("/authz/1"))
            .await
            .unwrap();
        let authorization: Authorization = envelope.json().unwrap();
        let (challenge, http) = authorization.http_challenge().unwrap();
        assert_eq!(challenge.url, transport.url("/chall/1"));
        assert_eq!(http.token.as_str(), "abc123");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_on_finish_authz() {
        let (session, transport, _dir) = test_session(KeyBackend::Ecdsa).await;
        session.set_account_url(transport.url("/acct/1"));
        transport.push(json_response("/authz/1", &authz("pending")));
        transport.push(json_response("/authz/1", &authz("valid")));
        let start = tokio::time::Instant::now();
        let envelope = wait_on_finish_authz(&session, &transport.url("/authz/1"))
            .await
            .unwrap();
        assert_eq!(envelope.status_field(), Some("valid"));
        assert_eq!(start.elapsed().as_secs(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_on_finish_authz_stops_on_invalid() {
        let (session, transport, _dir) = test_session(KeyBackend::Ecdsa).await;
        session.set_account_url(transport.url("/acct/1"));
        transport.push(json_response("/authz/1", &authz("invalid")));
        transport.push(json_response("/authz/1", &authz("valid")));
        let envelope = wait_on_finish_authz(&session, &transport.url("/authz/1"))
            .await
            .unwrap();
        assert_eq!(envelope.status_field(), Some("invalid"));
        assert_eq!(transport.remaining(), 1);
    }
}
