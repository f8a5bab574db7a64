use crate::acme::directory::Endpoint;
use crate::acme::object::Identifier;
use crate::crypto::SignatureError;
use serde::Deserialize;
use std::fmt::{Display, Formatter};

pub type ProtocolResult<T> = Result<T, Error>;

/// Failures that abort a protocol operation.
///
/// CA-side problems are *not* errors at this layer: they are reported through the
/// [`Outcome`](crate::acme::response::Outcome) of a [`ResponseEnvelope`](crate::acme::response::ResponseEnvelope).
/// Only local boundary failures end up here.
#[derive(Debug)]
pub enum Error {
    /// A key command failed, nothing was sent to the CA
    Signing(SignatureError),
    /// The command executor could not run a non-key command (e.g. publishing a challenge)
    Executor(std::io::Error),
    /// The directory lacks an endpoint we need (or could not be fetched at all)
    MissingEndpoint(Endpoint),
    /// No anti-replay nonce could be obtained
    NoNonce,
    ProtocolViolation(&'static str),
    IoError(std::io::Error),
    Json(serde_json::Error),
    Cancelled,
    TimedOut(&'static str),
}

impl Error {
    /// Errors caused by not being able to talk to the CA at all.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Error::MissingEndpoint(_) | Error::NoNonce)
    }
}

impl From<SignatureError> for Error {
    fn from(err: SignatureError) -> Error {
        Error::Signing(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::IoError(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Error {
        Error::Json(err)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self {
            Error::Signing(e) => write!(f, "signing request failed: {e}"),
            Error::Executor(e) => write!(f, "running command failed: {e}"),
            Error::MissingEndpoint(endpoint) => write!(
                f,
                "could not reach the ACME server: directory does not provide {endpoint}"
            ),
            Error::NoNonce => write!(f, "could not obtain a nonce from the ACME server"),
            Error::ProtocolViolation(e) => write!(f, "ACME protocol specification violated: {e}"),
            Error::IoError(io) => write!(f, "I/O error: {io}"),
            Error::Json(e) => write!(f, "parsing server response failed: {e}"),
            Error::Cancelled => write!(f, "operation was cancelled"),
            Error::TimedOut(msg) => write!(f, "timeout: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        // Skip one level (i.e. directly call source on the embedded error)
        // because we already print the higher-level error during Display, so don't duplicate it in the chain.
        match &self {
            Error::Signing(e) => e.source(),
            Error::Executor(io) | Error::IoError(io) => io.source(),
            Error::Json(e) => e.source(),
            Error::MissingEndpoint(_)
            | Error::NoNonce
            | Error::ProtocolViolation(_)
            | Error::Cancelled
            | Error::TimedOut(_) => None,
        }
    }
}

pub const ACME_URN: &str = "urn:ietf:params:acme:error:";
pub const ACME_BAD_NONCE: &str = "urn:ietf:params:acme:error:badNonce";
pub const ACME_RATE_LIMITED: &str = "urn:ietf:params:acme:error:rateLimited";
pub const ACME_UNAUTHORIZED: &str = "urn:ietf:params:acme:error:unauthorized";
pub const ACME_SERVER_INTERNAL: &str = "urn:ietf:params:acme:error:serverInternal";
pub const ACME_ACCOUNT_DOES_NOT_EXIST: &str = "urn:ietf:params:acme:error:accountDoesNotExist";

pub const BAD_NONCE: &str = "badNonce";
pub const ORDER_NOT_READY: &str = "orderNotReady";

/// RFC 7807 problem document
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[cfg_attr(test, derive(serde::Serialize))]
pub struct Problem {
    #[serde(rename = "type")]
    pub typ: String,
    pub detail: Option<String>,
    pub status: Option<u16>,
    #[serde(default)]
    pub subproblems: Vec<Subproblem>,
}

/// Last `:` separated segment of a problem type URN, e.g. `badNonce`.
pub fn short_type(typ: &str) -> &str {
    typ.rsplit(':').next().unwrap_or(typ)
}

impl Problem {
    pub fn short_type(&self) -> &str {
        short_type(&self.typ)
    }

    pub fn is_bad_nonce(&self) -> bool {
        self.short_type() == BAD_NONCE
    }

    pub fn is_order_not_ready(&self) -> bool {
        self.short_type() == ORDER_NOT_READY
    }

    pub fn is_rate_limit(&self) -> bool {
        self.typ == ACME_RATE_LIMITED || self.subproblems.iter().any(Subproblem::is_rate_limit)
    }

    pub fn is_auth_failure(&self) -> bool {
        self.typ == ACME_UNAUTHORIZED || self.subproblems.iter().any(Subproblem::is_auth_failure)
    }

    pub fn is_server_failure(&self) -> bool {
        self.typ == ACME_SERVER_INTERNAL
            || self.subproblems.iter().any(Subproblem::is_server_failure)
    }

    pub fn is_account_missing(&self) -> bool {
        self.typ == ACME_ACCOUNT_DOES_NOT_EXIST
    }
}

impl Display for Problem {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let typ = &self.typ;
        if let Some(detail) = &self.detail {
            write!(f, "{detail}")?;
        } else {
            write!(f, "{typ}")?;
        }
        for subproblem in &self.subproblems {
            write!(f, "\nadditionally, the server reported:\n{subproblem}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[cfg_attr(test, derive(serde::Serialize))]
pub struct Subproblem {
    #[serde(rename = "type")]
    pub typ: String,
    pub detail: Option<String>,
    pub identifier: Option<Identifier>,
}

impl Subproblem {
    pub fn is_rate_limit(&self) -> bool {
        self.typ == ACME_RATE_LIMITED
    }

    pub fn is_auth_failure(&self) -> bool {
        self.typ == ACME_UNAUTHORIZED
    }

    pub fn is_server_failure(&self) -> bool {
        self.typ == ACME_SERVER_INTERNAL
    }
}

impl Display for Subproblem {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let typ = &self.typ;
        if let Some(detail) = &self.detail {
            write!(f, "{detail}")?;
        } else {
            write!(f, "{typ}")?;
        }
        if let Some(identifier) = &self.identifier {
            write!(f, "(for identifier: {identifier})")?;
        }
        Ok(())
    }
}
