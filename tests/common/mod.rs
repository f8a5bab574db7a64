use async_trait::async_trait;
use certsmith::acme::http::{
    CONTENT_TYPE, HttpRequest, HttpResponse, HttpTransport, PROBLEM_JSON, REPLAY_NONCE,
    TransportError,
};
use parking_lot::Mutex;
use reqwest::Method;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::path::PathBuf;
use url::Url;

pub const BASE_URL: &str = "https://ca.test";
pub const TOKEN: &str = "evaGxfADs6pSRb2LAv9IZf17Dt3juxGJ-PCt92wr-oA";

/// A fake CA. The directory and nonces are served directly, POST replies come from a script.
///
/// Every response carries a fresh `Replay-Nonce`. When a POST to the challenge URL arrives, the
/// file the client published in the webroot is captured so tests can check what a validation
/// server would have seen.
#[derive(Debug)]
pub struct FakeCa {
    webroot: PathBuf,
    script: Mutex<VecDeque<HttpResponse>>,
    requests: Mutex<Vec<HttpRequest>>,
    nonce: Mutex<u32>,
    served_challenge: Mutex<Option<String>>,
}

impl FakeCa {
    pub fn new(webroot: PathBuf) -> Self {
        Self {
            webroot,
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            nonce: Mutex::new(0),
            served_challenge: Mutex::new(None),
        }
    }

    pub fn url(path: &str) -> Url {
        Url::parse(BASE_URL).unwrap().join(path).unwrap()
    }

    pub fn reply(&self, response: HttpResponse) {
        self.script.lock().push_back(response);
    }

    pub fn reply_json(&self, status: u16, path: &str, body: Value) {
        self.reply(HttpResponse::new(status, Self::url(path)).with_body(body.to_string()));
    }

    pub fn reply_problem(&self, status: u16, typ: &str) {
        self.reply(
            HttpResponse::new(status, Self::url("/"))
                .with_header(CONTENT_TYPE, PROBLEM_JSON)
                .with_body(
                    json!({
                        "type": format!("urn:ietf:params:acme:error:{typ}"),
                        "detail": format!("{typ} for testing"),
                        "status": status,
                    })
                    .to_string(),
                ),
        );
    }

    pub fn posts(&self) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|request| request.method == Method::POST)
            .cloned()
            .collect()
    }

    pub fn served_challenge(&self) -> Option<String> {
        self.served_challenge.lock().clone()
    }

    pub fn unanswered(&self) -> usize {
        self.script.lock().len()
    }

    fn next_nonce(&self) -> String {
        let mut nonce = self.nonce.lock();
        *nonce += 1;
        format!("fake-nonce-{nonce}")
    }

    fn directory() -> String {
        json!({
            "newNonce": Self::url("/acme/new-nonce"),
            "newAccount": Self::url("/acme/new-acct"),
            "newOrder": Self::url("/acme/new-order"),
            "revokeCert": Self::url("/acme/revoke-cert"),
            "keyChange": Self::url("/acme/key-change"),
            "meta": {"termsOfService": "https://ca.test/terms"}
        })
        .to_string()
    }
}

#[async_trait]
impl HttpTransport for FakeCa {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().push(request.clone());
        let url = request.url.clone();
        let response = match request.method {
            Method::GET if url.path() == "/directory" => {
                HttpResponse::new(200, url.clone()).with_body(Self::directory())
            }
            Method::HEAD => HttpResponse::new(200, url.clone()),
            Method::POST => {
                if url.path() == "/acme/chall/1" {
                    let file = self.webroot.join(".well-known/acme-challenge").join(TOKEN);
                    *self.served_challenge.lock() = std::fs::read_to_string(file).ok();
                }
                self.script.lock().pop_front().ok_or_else(|| {
                    TransportError::Connection {
                        url: url.clone(),
                        reason: "connection refused".to_string(),
                    }
                })?
            }
            _ => HttpResponse::new(405, url.clone()),
        };
        Ok(response.with_header(REPLAY_NONCE, &self.next_nonce()))
    }
}

pub fn order(status: &str, certificate: bool) -> Value {
    let mut order = json!({
        "status": status,
        "expires": "2030-01-01T00:00:00Z",
        "identifiers": [{"type": "dns", "value": "example.org"}],
        "authorizations": [FakeCa::url("/acme/authz/1")],
        "finalize": FakeCa::url("/acme/order/1/finalize")
    });
    if certificate {
        order["certificate"] = json!(FakeCa::url("/acme/cert/1"));
    }
    order
}

pub fn challenge(status: &str) -> Value {
    json!({
        "type": "http-01",
        "url": FakeCa::url("/acme/chall/1"),
        "status": status,
        "token": TOKEN
    })
}

pub fn authorization(status: &str, challenge_status: &str) -> Value {
    json!({
        "status": status,
        "identifier": {"type": "dns", "value": "example.org"},
        "challenges": [
            {
                "type": "dns-01",
                "url": FakeCa::url("/acme/chall/2"),
                "status": "pending",
                "token": "unused"
            },
            challenge(challenge_status)
        ]
    })
}
