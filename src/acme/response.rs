//! Turns whatever the transport produced into a single [`ResponseEnvelope`].
//!
//! Every ACME call ends up here, so the rest of the client only ever inspects the
//! [`Outcome`] instead of status codes, content types and problem documents.

use crate::acme::error::Problem;
use crate::acme::http::{CONTENT_TYPE, HttpResponse, PROBLEM_JSON, RelationLink, TransportError};
use crate::acme::object::Nonce;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt::{Display, Formatter};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Legacy numeric code of a response that should be resent with a fresh nonce
pub const REPEAT_REQUEST: i32 = -1;
/// Legacy numeric code of a response that never reached the server
pub const CONNECTION_ERROR: i32 = -2;

/// Pause after a badNonce rejection, before the request is signed again
pub const BAD_NONCE_DELAY: Duration = Duration::from_secs(1);
/// Upper bound for honoring a server supplied Retry-After value
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientReason {
    BadNonce,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalReason {
    /// The request never produced an HTTP response
    Connection(String),
    /// The server answered with a problem document
    Problem { status: u16, problem: Problem },
    /// The server answered with a non-2xx status but no problem document
    Http(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Transient(TransientReason),
    Fatal(FatalReason),
}

impl Display for Outcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::Transient(TransientReason::BadNonce) => write!(f, "bad nonce, resending"),
            Outcome::Fatal(FatalReason::Connection(reason)) => {
                write!(f, "connection failed: {reason}")
            }
            Outcome::Fatal(FatalReason::Problem { status, problem }) => {
                write!(f, "server reported a problem (HTTP {status}): {problem}")
            }
            Outcome::Fatal(FatalReason::Http(status)) => {
                write!(f, "server responded with HTTP {status}")
            }
        }
    }
}

/// Decoded response body
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Json(Value),
    Raw(String),
    Empty,
}

#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    pub nonce: Option<Nonce>,
    pub location: Option<Url>,
    pub http_status: Option<u16>,
    pub retry_after: Option<Duration>,
    pub output: Output,
    pub raw: String,
    pub links: Vec<RelationLink>,
    pub outcome: Outcome,
}

impl ResponseEnvelope {
    fn connection_failure(reason: String) -> Self {
        Self {
            nonce: None,
            location: None,
            http_status: None,
            retry_after: None,
            output: Output::Empty,
            raw: String::new(),
            links: Vec::new(),
            outcome: Outcome::Fatal(FatalReason::Connection(reason)),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.outcome, Outcome::Transient(_))
    }

    /// 0 on success, [`REPEAT_REQUEST`] for badNonce, [`CONNECTION_ERROR`] without response,
    /// the HTTP (or problem) status otherwise.
    pub fn error_code(&self) -> i32 {
        match &self.outcome {
            Outcome::Success => 0,
            Outcome::Transient(TransientReason::BadNonce) => REPEAT_REQUEST,
            Outcome::Fatal(FatalReason::Connection(_)) => CONNECTION_ERROR,
            Outcome::Fatal(FatalReason::Problem { status, .. } | FatalReason::Http(status)) => {
                i32::from(*status)
            }
        }
    }

    pub fn problem(&self) -> Option<&Problem> {
        match &self.outcome {
            Outcome::Fatal(FatalReason::Problem { problem, .. }) => Some(problem),
            _ => None,
        }
    }

    /// Short problem type, e.g. `orderNotReady`. `badNonce` for transient responses.
    pub fn problem_type(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Transient(TransientReason::BadNonce) => Some(crate::acme::error::BAD_NONCE),
            _ => self.problem().map(Problem::short_type),
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match &self.output {
            Output::Json(value) => T::deserialize(value),
            Output::Raw(raw) => serde_json::from_str(raw),
            Output::Empty => serde_json::from_str(""),
        }
    }

    /// The `status` member of a JSON body, if any
    pub fn status_field(&self) -> Option<&str> {
        match &self.output {
            Output::Json(value) => value.get("status").and_then(Value::as_str),
            _ => None,
        }
    }

    /// The account URL returned by newAccount, used as `kid` afterwards
    pub fn kid(&self) -> Option<&Url> {
        self.location.as_ref()
    }
}

/// Sorts a transport result into an [`Outcome`] and extracts everything the protocol needs.
pub fn classify(result: Result<HttpResponse, TransportError>) -> ResponseEnvelope {
    let response = match result {
        Ok(response) => response,
        Err(err) => return ResponseEnvelope::connection_failure(err.to_string()),
    };

    let nonce = response
        .extract_nonce()
        .filter(|nonce| !nonce.is_empty())
        .and_then(|nonce| match Nonce::try_from(nonce.to_string()) {
            Ok(nonce) => Some(nonce),
            Err(_) => {
                warn!("Ignoring malformed Replay-Nonce header {nonce}");
                None
            }
        });
    let raw = String::from_utf8_lossy(&response.body).into_owned();
    let output = if raw.trim().is_empty() {
        Output::Empty
    } else {
        serde_json::from_str(&raw).map_or_else(|_| Output::Raw(raw.clone()), Output::Json)
    };

    let is_problem_document = response
        .header(CONTENT_TYPE)
        .is_some_and(|content_type| content_type.starts_with(PROBLEM_JSON));
    // Challenge objects carry a "type" member as well, so a 2xx JSON body alone is never a problem
    let problem = match &output {
        Output::Json(value) if is_problem_document || !response.is_success() => {
            problem_from(value)
        }
        _ => None,
    };

    let outcome = match problem {
        Some(problem) if problem.is_bad_nonce() => Outcome::Transient(TransientReason::BadNonce),
        Some(problem) => Outcome::Fatal(FatalReason::Problem {
            status: problem.status.unwrap_or(response.status),
            problem,
        }),
        None if response.is_success() => Outcome::Success,
        None => Outcome::Fatal(FatalReason::Http(response.status)),
    };

    ResponseEnvelope {
        nonce,
        location: response.extract_location(),
        http_status: Some(response.status),
        retry_after: response.extract_backoff(),
        links: response.extract_relation_links(),
        output,
        raw,
        outcome,
    }
}

/// [`classify`], then wait as long as the server asked us to.
pub async fn normalize(result: Result<HttpResponse, TransportError>) -> ResponseEnvelope {
    let envelope = classify(result);
    if envelope.is_transient() {
        debug!("Server rejected our nonce, waiting before resending");
        tokio::time::sleep(BAD_NONCE_DELAY).await;
    }
    if let Some(retry_after) = envelope.retry_after {
        let delay = retry_after.min(MAX_RETRY_BACKOFF);
        if !delay.is_zero() {
            debug!("Server requested Retry-After, waiting {}s", delay.as_secs());
            tokio::time::sleep(delay).await;
        }
    }
    envelope
}

fn problem_from(value: &Value) -> Option<Problem> {
    // Bodies without a type member are not problem documents, whatever their status
    value.get("type")?;
    Problem::deserialize(value).ok()
}
