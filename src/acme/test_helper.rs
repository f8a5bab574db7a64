//! A canned ACME server for unit tests.

use crate::acme::client::AcmeSession;
use crate::acme::http::{
    CONTENT_TYPE, HttpRequest, HttpResponse, HttpTransport, PROBLEM_JSON, REPLAY_NONCE,
    TransportError,
};
use crate::crypto::asymmetric::LocalKeyStore;
use crate::crypto::asymmetric::tests::{TEST_EC_256, TEST_RSA_PEM};
use crate::crypto::backend::KeyBackend;
use crate::crypto::jws::JsonWebKey;
use async_trait::async_trait;
use base64::Engine;
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use parking_lot::Mutex;
use reqwest::Method;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tempfile::TempDir;
use url::Url;

pub(crate) const BASE_URL: &str = "https://acme.test";

/// Answers directory GETs and nonce HEADs by itself, POSTs from a queue.
#[derive(Debug, Default)]
pub(crate) struct ScriptedTransport {
    posts: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    requests: Mutex<Vec<HttpRequest>>,
    nonce_counter: Mutex<u32>,
    nonces_disabled: Mutex<bool>,
}

impl ScriptedTransport {
    pub(crate) fn url(&self, path: &str) -> Url {
        Url::parse(BASE_URL).unwrap().join(path).unwrap()
    }

    pub(crate) fn push(&self, response: HttpResponse) {
        self.posts.lock().push_back(Ok(response));
    }

    pub(crate) fn push_error(&self, error: TransportError) {
        self.posts.lock().push_back(Err(error));
    }

    pub(crate) fn disable_nonces(&self) {
        *self.nonces_disabled.lock() = true;
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub(crate) fn posts_to(&self, path: &str) -> Vec<HttpRequest> {
        let url = self.url(path);
        self.requests()
            .into_iter()
            .filter(|request| request.method == Method::POST && request.url == url)
            .collect()
    }

    pub(crate) fn remaining(&self) -> usize {
        self.posts.lock().len()
    }

    fn directory(&self) -> String {
        serde_json::json!({
            "newNonce": self.url("/new-nonce"),
            "newAccount": self.url("/new-acct"),
            "newOrder": self.url("/new-order"),
            "revokeCert": self.url("/revoke-cert"),
            "keyChange": self.url("/key-change"),
        })
        .to_string()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().push(request.clone());
        let url = request.url.clone();
        match request.method {
            Method::GET if request.url.path() == "/directory" => {
                Ok(HttpResponse::new(200, url).with_body(self.directory()))
            }
            Method::HEAD => {
                let response = HttpResponse::new(200, url);
                if *self.nonces_disabled.lock() {
                    return Ok(response);
                }
                let mut counter = self.nonce_counter.lock();
                *counter += 1;
                Ok(response.with_header(REPLAY_NONCE, &format!("head-nonce-{counter}")))
            }
            _ => self.posts.lock().pop_front().unwrap_or_else(|| {
                Err(TransportError::Connection {
                    url,
                    reason: "no scripted response left".to_string(),
                })
            }),
        }
    }
}

pub(crate) fn problem(status: u16, typ: &str) -> HttpResponse {
    HttpResponse::new(status, Url::parse(BASE_URL).unwrap())
        .with_header(CONTENT_TYPE, PROBLEM_JSON)
        .with_body(format!(
            r#"{{"type":"urn:ietf:params:acme:error:{typ}","detail":"{typ}","status":{status}}}"#
        ))
}

pub(crate) fn json_response(path: &str, body: &Value) -> HttpResponse {
    HttpResponse::new(200, Url::parse(BASE_URL).unwrap().join(path).unwrap())
        .with_body(body.to_string())
}

/// Protected header and payload of a JWS request body. The payload is `Null` for POST-as-GET.
pub(crate) fn decode_jws(request: &HttpRequest) -> (Value, Value) {
    let body: Value = serde_json::from_slice(request.body.as_deref().unwrap()).unwrap();
    let decode = |value: &Value| -> Value {
        let raw = value.as_str().unwrap();
        if raw.is_empty() {
            return Value::Null;
        }
        serde_json::from_slice(&BASE64_URL_SAFE_NO_PAD.decode(raw).unwrap()).unwrap()
    };
    (decode(&body["protected"]), decode(&body["payload"]))
}

/// A session backed by [`ScriptedTransport`] and a local key written to a temporary directory.
pub(crate) async fn test_session(
    backend: KeyBackend,
) -> (AcmeSession, Arc<ScriptedTransport>, TempDir) {
    let dir = TempDir::new().unwrap();
    let key_path = dir.path().join("account.key");
    let pem = match backend {
        KeyBackend::Ecdsa => TEST_EC_256,
        KeyBackend::Rsa => TEST_RSA_PEM,
    };
    std::fs::write(&key_path, pem).unwrap();
    let key = JsonWebKey::load(Arc::new(LocalKeyStore::new(backend)), &key_path)
        .await
        .unwrap();
    let transport = Arc::new(ScriptedTransport::default());
    let session = AcmeSession::new(transport.url("/directory"), transport.clone(), key);
    (session, transport, dir)
}
