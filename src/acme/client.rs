use crate::acme::directory::{Directory, DirectoryCache, Endpoint};
use crate::acme::error::ProtocolResult;
use crate::acme::http::{HttpRequest, HttpTransport};
use crate::acme::nonce::NonceSource;
use crate::acme::response::{ResponseEnvelope, normalize};
use crate::acme::retry::{RetryContext, resend};
use crate::crypto::jws::{EMPTY_PAYLOAD, JsonWebKey};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, trace};
use url::Url;

/// Everything needed to talk to one ACME server on behalf of one account key.
///
/// Requests are issued strictly one after another: the session holds exactly one nonce, which
/// every response replaces.
#[derive(Debug)]
#[allow(clippy::module_name_repetitions)]
pub struct AcmeSession {
    directory_url: Url,
    transport: Arc<dyn HttpTransport>,
    directories: DirectoryCache,
    nonces: NonceSource,
    key: RwLock<JsonWebKey>,
}

impl AcmeSession {
    pub fn new(directory_url: Url, transport: Arc<dyn HttpTransport>, key: JsonWebKey) -> Self {
        Self {
            directory_url,
            transport,
            directories: DirectoryCache::new(),
            nonces: NonceSource::new(),
            key: RwLock::new(key),
        }
    }

    pub fn directory_url(&self) -> &Url {
        &self.directory_url
    }

    pub async fn directory(&self) -> Arc<Directory> {
        self.directories
            .get(self.transport.as_ref(), &self.directory_url)
            .await
    }

    pub async fn endpoint(&self, endpoint: Endpoint) -> ProtocolResult<Url> {
        let directory = self.directory().await;
        directory.endpoint(endpoint).cloned()
    }

    /// Snapshot of the account key. Carries `kid` once the account URL is known.
    pub fn account_key(&self) -> JsonWebKey {
        self.key.read().clone()
    }

    pub fn account_url(&self) -> Option<Url> {
        self.key.read().get_account_url().cloned()
    }

    /// Switches all further requests from `jwk` to `kid` identification.
    pub fn set_account_url(&self, account_url: Url) {
        let mut key = self.key.write();
        *key = key.clone().into_existing(account_url);
    }

    pub fn thumbprint(&self) -> String {
        self.key.read().get_acme_thumbprint().to_string()
    }

    /// Signs and sends one POST. The nonce comes from `context` if a previous attempt was
    /// rejected, from the session otherwise.
    pub async fn post_signed_once<T: Serialize + Sync>(
        &self,
        target_url: &Url,
        payload: Option<&T>,
        context: RetryContext,
    ) -> ProtocolResult<ResponseEnvelope> {
        let nonce = match context.last_nonce {
            Some(nonce) => {
                // The same nonce was stored with the rejected response, it must not be used twice
                self.nonces.take();
                nonce
            }
            None => {
                let directory = self.directory().await;
                self.nonces.next(self.transport.as_ref(), &directory).await?
            }
        };

        let key = self.account_key();
        let header = key.build_header(target_url.clone(), nonce);
        let signed = key.sign(&header, payload).await?;
        let body = serde_json::to_vec(&signed)?;
        trace!("POST {target_url} (attempt {})", context.attempt);

        let result = self
            .transport
            .request(HttpRequest::post_jose(target_url.clone(), body))
            .await;
        let envelope = normalize(result).await;
        self.nonces.replace(envelope.nonce.clone());
        debug!("POST {target_url}: {}", envelope.outcome);
        Ok(envelope)
    }

    /// Signed POST, resent with the server's fresh nonce on `badNonce`.
    pub async fn post<T: Serialize + Sync>(
        &self,
        target_url: &Url,
        payload: Option<&T>,
    ) -> ProtocolResult<ResponseEnvelope> {
        resend(move |context| self.post_signed_once(target_url, payload, context)).await
    }

    /// POST-as-GET (RFC 8555, Section 6.3)
    pub async fn post_as_get(&self, target_url: &Url) -> ProtocolResult<ResponseEnvelope> {
        self.post(target_url, EMPTY_PAYLOAD).await
    }
}

#[cfg(test)]
mod tests {
    use crate::acme::error::Error;
    use crate::acme::http::HttpResponse;
    use crate::acme::object::EmptyObject;
    use crate::acme::response::REPEAT_REQUEST;
    use crate::acme::test_helper::{decode_jws, problem, test_session};
    use crate::crypto::backend::KeyBackend;
    use reqwest::Method;

    #[tokio::test]
    async fn test_first_post_uses_jwk_and_head_nonce() {
        let (session, transport, _dir) = test_session(KeyBackend::Ecdsa).await;
        let url = transport.url("/new-acct");
        transport.push(HttpResponse::new(201, url.clone()).with_body("{}"));

        let envelope = session.post(&url, Some(&EmptyObject {})).await.unwrap();
        assert!(envelope.is_success());

        let requests = transport.requests();
        assert_eq!(requests[0].method, Method::GET);
        assert_eq!(requests[1].method, Method::HEAD);
        assert_eq!(requests[2].method, Method::POST);
        let (header, payload) = decode_jws(&requests[2]);
        assert_eq!(header["nonce"], "head-nonce-1");
        assert_eq!(header["alg"], "ES256");
        assert!(header.get("jwk").is_some());
        assert!(header.get("kid").is_none());
        assert_eq!(payload, serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_response_nonce_is_used_next() {
        let (session, transport, _dir) = test_session(KeyBackend::Ecdsa).await;
        let url = transport.url("/order/1");
        transport.push(
            HttpResponse::new(200, url.clone())
                .with_header("Replay-Nonce", "from-response")
                .with_body("{}"),
        );
        transport.push(HttpResponse::new(200, url.clone()).with_body("{}"));
        session.set_account_url(transport.url("/acct/1"));

        session.post_as_get(&url).await.unwrap();
        session.post_as_get(&url).await.unwrap();

        let posts: Vec<_> = transport
            .requests()
            .into_iter()
            .filter(|request| request.method == Method::POST)
            .collect();
        let (second, payload) = decode_jws(&posts[1]);
        assert_eq!(second["nonce"], "from-response");
        assert_eq!(second["kid"], transport.url("/acct/1").as_str());
        assert!(second.get("jwk").is_none());
        assert!(payload.is_null());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_nonce_is_resent_with_new_nonce() {
        let (session, transport, _dir) = test_session(KeyBackend::Rsa).await;
        let url = transport.url("/order/1");
        transport.push(problem(400, "badNonce").with_header("Replay-Nonce", "retry-nonce"));
        transport.push(HttpResponse::new(200, url.clone()).with_body(r#"{"status":"ready"}"#));

        let envelope = session.post_as_get(&url).await.unwrap();
        assert_eq!(envelope.status_field(), Some("ready"));
        let posts: Vec<_> = transport
            .requests()
            .into_iter()
            .filter(|request| request.method == Method::POST)
            .collect();
        assert_eq!(posts.len(), 2);
        assert_eq!(decode_jws(&posts[1]).0["nonce"], "retry-nonce");
        assert_eq!(decode_jws(&posts[0]).0["alg"], "RS256");
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_nonce_forever_gives_up_after_ten_resends() {
        let (session, transport, _dir) = test_session(KeyBackend::Ecdsa).await;
        let url = transport.url("/order/1");
        for _ in 0..20 {
            transport.push(problem(400, "badNonce").with_header("Replay-Nonce", "again"));
        }
        let envelope = session.post_as_get(&url).await.unwrap();
        assert_eq!(envelope.error_code(), REPEAT_REQUEST);
        let posts = transport
            .requests()
            .into_iter()
            .filter(|request| request.method == Method::POST)
            .count();
        assert_eq!(posts, 11);
    }

    #[tokio::test]
    async fn test_no_nonce_fails_before_signing() {
        let (session, transport, _dir) = test_session(KeyBackend::Ecdsa).await;
        transport.disable_nonces();
        let url = transport.url("/order/1");
        let result = session.post_as_get(&url).await;
        assert!(matches!(result, Err(Error::NoNonce)));
        assert!(
            transport
                .requests()
                .iter()
                .all(|request| request.method != Method::POST)
        );
    }
}
