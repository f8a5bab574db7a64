use crate::acme::client::AcmeSession;
use crate::acme::directory::Endpoint;
use crate::acme::error::{Error, ProtocolResult};
use crate::acme::object::{AccountRequest, AccountStatus};
use crate::acme::response::ResponseEnvelope;
use crate::crypto::KeyStore;
use crate::crypto::jws::JsonWebKey;
use crate::ops::parse_status;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

#[derive(Debug, Clone, Default)]
pub struct AccountOptions {
    pub contact: Vec<Url>,
    pub terms_of_service_agreed: bool,
}

/// Loads the account key at `path`, generating it first if it does not exist yet.
pub async fn load_account_key(
    store: Arc<dyn KeyStore>,
    path: &Path,
    key_size: Option<u32>,
) -> ProtocolResult<JsonWebKey> {
    if store.ensure_private_key(path, key_size).await? {
        info!("Created new {} account key at {}", store.backend(), path.display());
    }
    Ok(JsonWebKey::load(store, path).await?)
}

/// Registers the session's key as a new account (`newAccount`).
pub async fn create_account(
    session: &AcmeSession,
    options: &AccountOptions,
) -> ProtocolResult<ResponseEnvelope> {
    let request = AccountRequest {
        contact: options.contact.clone(),
        terms_of_service_agreed: Some(options.terms_of_service_agreed),
        only_return_existing: None,
    };
    submit(session, &request).await
}

/// Looks up the account belonging to the session's key without creating one.
pub async fn get_existing_account(session: &AcmeSession) -> ProtocolResult<ResponseEnvelope> {
    let request = AccountRequest {
        contact: Vec::new(),
        terms_of_service_agreed: None,
        only_return_existing: Some(true),
    };
    submit(session, &request).await
}

/// Uses the existing account if the CA knows the key, registers a new one otherwise.
pub async fn lookup_or_create(
    session: &AcmeSession,
    options: &AccountOptions,
) -> ProtocolResult<ResponseEnvelope> {
    let existing = get_existing_account(session).await?;
    if existing.is_success() {
        return Ok(existing);
    }
    if existing
        .problem()
        .is_some_and(crate::acme::error::Problem::is_account_missing)
    {
        info!("No account registered for this key yet, creating one");
        return create_account(session, options).await;
    }
    Ok(existing)
}

async fn submit(
    session: &AcmeSession,
    request: &AccountRequest,
) -> ProtocolResult<ResponseEnvelope> {
    let url = session.endpoint(Endpoint::NewAccount).await?;
    let envelope = session.post(&url, Some(request)).await?;
    if envelope.is_success() {
        let account_url = envelope.kid().cloned().ok_or(Error::ProtocolViolation(
            "ACME server did not provide an account URL",
        ))?;
        match parse_status::<AccountStatus>(&envelope) {
            Some(AccountStatus::Valid) | None => {}
            Some(status) => warn!("Account {account_url} is {status}"),
        }
        info!("Using ACME account {account_url}");
        session.set_account_url(account_url);
    }
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::http::HttpResponse;
    use crate::acme::test_helper::{decode_jws, problem, test_session};
    use crate::crypto::asymmetric::LocalKeyStore;
    use crate::crypto::backend::KeyBackend;
    use tempfile::TempDir;

    fn account_created(url: &str) -> HttpResponse {
        HttpResponse::new(201, Url::parse("https://acme.test/new-acct").unwrap())
            .with_header("Location", url)
            .with_body(r#"{"status":"valid","contact":["mailto:admin@example.org"]}"#)
    }

    #[tokio::test]
    async fn test_create_account_stores_kid() {
        let (session, transport, _dir) = test_session(KeyBackend::Ecdsa).await;
        transport.push(account_created("https://acme.test/acct/7"));
        let options = AccountOptions {
            contact: vec![Url::parse("mailto:admin@example.org").unwrap()],
            terms_of_service_agreed: true,
        };
        let envelope = create_account(&session, &options).await.unwrap();
        assert!(envelope.is_success());
        assert_eq!(
            session.account_url().unwrap().as_str(),
            "https://acme.test/acct/7"
        );

        let posts = transport.posts_to("/new-acct");
        let (header, payload) = decode_jws(&posts[0]);
        assert!(header.get("jwk").is_some());
        assert_eq!(payload["termsOfServiceAgreed"], true);
        assert_eq!(payload["contact"][0], "mailto:admin@example.org");
    }

    #[tokio::test]
    async fn test_lookup_or_create_creates_missing_account() {
        let (session, transport, _dir) = test_session(KeyBackend::Rsa).await;
        transport.push(problem(400, "accountDoesNotExist"));
        transport.push(account_created("https://acme.test/acct/8"));
        let envelope = lookup_or_create(&session, &AccountOptions::default())
            .await
            .unwrap();
        assert!(envelope.is_success());

        let posts = transport.posts_to("/new-acct");
        assert_eq!(posts.len(), 2);
        assert_eq!(decode_jws(&posts[0]).1["onlyReturnExisting"], true);
        assert!(decode_jws(&posts[1]).1.get("onlyReturnExisting").is_none());
        assert_eq!(
            session.account_url().unwrap().as_str(),
            "https://acme.test/acct/8"
        );
    }

    #[tokio::test]
    async fn test_lookup_or_create_passes_other_problems_through() {
        let (session, transport, _dir) = test_session(KeyBackend::Ecdsa).await;
        transport.push(problem(403, "unauthorized"));
        let envelope = lookup_or_create(&session, &AccountOptions::default())
            .await
            .unwrap();
        assert_eq!(envelope.error_code(), 403);
        assert_eq!(envelope.problem_type(), Some("unauthorized"));
        assert!(session.account_url().is_none());
        assert_eq!(transport.posts_to("/new-acct").len(), 1);
    }

    #[tokio::test]
    async fn test_success_without_location_is_a_violation() {
        let (session, transport, _dir) = test_session(KeyBackend::Ecdsa).await;
        transport.push(HttpResponse::new(200, Url::parse("https://acme.test/new-acct").unwrap()));
        let result = get_existing_account(&session).await;
        assert!(matches!(result, Err(Error::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_load_account_key_generates_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("account.key");
        let store: Arc<dyn KeyStore> = Arc::new(LocalKeyStore::new(KeyBackend::Ecdsa));
        let first = load_account_key(store.clone(), &path, None).await.unwrap();
        let second = load_account_key(store, &path, None).await.unwrap();
        assert_eq!(first.get_acme_thumbprint(), second.get_acme_thumbprint());
    }
}
