use async_trait::async_trait;
use reqwest::{Certificate, ClientBuilder, Method};
use std::collections::HashMap;
use std::fmt::Debug;
use std::time::{Duration, SystemTime};
use url::Url;

// As per RFC8555 Section 6.1, we should conform both to RFC 7525 and supply the name + version
// of our HTTP library.
pub const USER_AGENT: &str = concat!(
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION"),
    " reqwest ( +",
    env!("CARGO_PKG_REPOSITORY"),
    " )"
);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(120);

pub const REPLAY_NONCE: &str = "replay-nonce";
pub const RETRY_AFTER: &str = "retry-after";
pub const LOCATION: &str = "location";
pub const LINK: &str = "link";
pub const CONTENT_TYPE: &str = "content-type";
pub const JOSE_JSON: &str = "application/jose+json";
pub const PROBLEM_JSON: &str = "application/problem+json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn head(url: Url) -> Self {
        Self {
            method: Method::HEAD,
            url,
            headers: Vec::new(),
            body: None,
        }
    }

    /// Signed ACME request. RFC8555 Section 6.2, "[clients] must have the Content-Type header
    /// field set to "application/jose+json""
    pub fn post_jose(url: Url, body: Vec<u8>) -> Self {
        Self {
            method: Method::POST,
            url,
            headers: vec![(CONTENT_TYPE.to_string(), JOSE_JSON.to_string())],
            body: Some(body),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    /// Final URL of the request, used to resolve relative `Location` and `Link` headers
    pub url: Url,
    /// Header names are lower case. Repeated headers are joined with `", "`.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, url: Url) -> Self {
        Self {
            status,
            url,
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        let name = name.to_ascii_lowercase();
        match self.headers.get_mut(&name) {
            Some(existing) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            None => {
                self.headers.insert(name, value.to_string());
            }
        }
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn extract_nonce(&self) -> Option<&str> {
        self.header(REPLAY_NONCE).map(str::trim)
    }

    pub fn extract_backoff(&self) -> Option<Duration> {
        self.header(RETRY_AFTER)
            .and_then(|value| parse_retry_after(value, SystemTime::now()))
    }

    pub fn extract_location(&self) -> Option<Url> {
        self.header(LOCATION)
            .and_then(|location_str| parse_url(&self.url, location_str))
    }

    pub fn extract_relation_links(&self) -> Vec<RelationLink> {
        let Some(header_str) = self.header(LINK) else {
            return Vec::new();
        };
        nom_rfc8288::complete::link(header_str)
            .ok()
            .into_iter()
            .flatten()
            .flatten()
            .filter_map(|link| {
                let url = parse_url(&self.url, link.url)?;
                let relation = link.params.into_iter().find(|param| param.key == "rel")?;
                Some(RelationLink {
                    relation: relation.val?,
                    url,
                })
            })
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection to {url} failed: {reason}")]
    Connection { url: Url, reason: String },
    #[error("request to {url} timed out")]
    Timeout { url: Url },
    #[error("could not build request to {url}: {reason}")]
    InvalidRequest { url: Url, reason: String },
}

impl TransportError {
    fn from_reqwest(url: &Url, err: &reqwest::Error) -> Self {
        let url = url.clone();
        if err.is_timeout() {
            TransportError::Timeout { url }
        } else if err.is_builder() {
            TransportError::InvalidRequest {
                url,
                reason: err.to_string(),
            }
        } else {
            TransportError::Connection {
                url,
                reason: err.to_string(),
            }
        }
    }
}

/// Moves bytes between us and the ACME server. Does not interpret responses in any way.
#[async_trait]
pub trait HttpTransport: Send + Sync + Debug {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

#[derive(Debug, Clone)]
#[allow(clippy::module_name_repetitions)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn try_new() -> reqwest::Result<Self> {
        Self::try_new_with_builder(ClientBuilder::new())
    }

    pub fn try_new_with_custom_roots(roots: Vec<Certificate>) -> reqwest::Result<Self> {
        let builder = roots
            .into_iter()
            .fold(ClientBuilder::new(), ClientBuilder::add_root_certificate);
        Self::try_new_with_builder(builder)
    }

    fn try_new_with_builder(client_builder: ClientBuilder) -> reqwest::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        // RFC8555 Section 6.1, "clients SHOULD send an Accept-Language header field in
        // accordance with RFC7231"
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            reqwest::header::HeaderValue::from_static("en"),
        );
        let client_builder = client_builder
            // RFC8555 Section 6, "Communications [...] are done over HTTPS [...]", except for test runs where we allow HTTP
            .https_only(!cfg!(test))
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .default_headers(headers)
            // Make TRACE logs available for test or debug builds (still needs to be enabled separately)
            .connection_verbose(cfg!(any(test, debug_assertions)));
        Ok(Self {
            client: client_builder.build()?,
        })
    }
}

#[async_trait]
impl HttpTransport for HttpClient {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let url = request.url.clone();
        let mut builder = self.client.request(request.method, request.url);
        for (name, value) in request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(&url, &e))?;

        let mut converted = HttpResponse::new(response.status().as_u16(), response.url().clone());
        for (name, value) in response.headers() {
            // Non-ASCII header values are of no use to us
            if let Ok(value) = value.to_str() {
                converted = converted.with_header(name.as_str(), value);
            }
        }
        // TODO: Size limit on all responses, for DoS safety?
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::from_reqwest(&url, &e))?;
        Ok(converted.with_body(body.to_vec()))
    }
}

/// As per RFC9110, the Retry-After header either contains a value in seconds, or
/// a Date/Time string. Dates in the past yield a zero duration.
pub fn parse_retry_after(retry_after: &str, now: SystemTime) -> Option<Duration> {
    let retry_after = retry_after.trim();
    if let Ok(seconds) = retry_after.parse::<u64>() {
        Some(Duration::from_secs(seconds))
    } else {
        // Refer to RFC9110 Date/Time format parsing
        let date = httpdate::parse_http_date(retry_after).ok()?;
        Some(date.duration_since(now).unwrap_or(Duration::ZERO))
    }
}

fn parse_url(base_url: &Url, raw_url: &str) -> Option<Url> {
    // As per RFC7231 (Location) and RFC8288 (Link), both the Link and Location header
    // may contain relative URLs as well as absolute URls. We need to ensure we parse both.
    // Fortunately, the Url crate already contains the logic for this.
    base_url.join(raw_url).ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationLink {
    pub relation: String,
    pub url: Url,
}
