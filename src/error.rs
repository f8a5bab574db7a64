use crate::acme::error::Error as AcmeError;
use crate::acme::response::{FatalReason, Outcome, ResponseEnvelope};
use std::fmt::{Debug, Display, Formatter};

pub type IssueResult<T> = Result<T, IssueError>;

pub enum IssueError {
    ClientFailure(anyhow::Error),
    RateLimited(anyhow::Error),
    CAFailure(anyhow::Error),
    AuthFailure(anyhow::Error),
}

impl IssueError {
    /// The response of the step that failed, if the CA had the last word.
    pub fn envelope(&self) -> Option<&ResponseEnvelope> {
        self.inner()
            .downcast_ref::<StepFailure>()
            .map(|failure| &failure.envelope)
    }

    pub fn inner(&self) -> &anyhow::Error {
        match self {
            IssueError::ClientFailure(err)
            | IssueError::RateLimited(err)
            | IssueError::CAFailure(err)
            | IssueError::AuthFailure(err) => err,
        }
    }
}

impl std::error::Error for IssueError {}

impl Display for IssueError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        Debug::fmt(self.inner(), f)
    }
}

impl Debug for IssueError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self, f)
    }
}

impl From<AcmeError> for IssueError {
    fn from(err: AcmeError) -> Self {
        match err {
            AcmeError::ProtocolViolation(_)
            | AcmeError::MissingEndpoint(_)
            | AcmeError::NoNonce => IssueError::CAFailure(err.into()),
            AcmeError::Signing(_)
            | AcmeError::Executor(_)
            | AcmeError::IoError(_)
            | AcmeError::Json(_)
            | AcmeError::Cancelled
            | AcmeError::TimedOut(_) => IssueError::ClientFailure(err.into()),
        }
    }
}

impl From<anyhow::Error> for IssueError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(failure) = err.downcast_ref::<StepFailure>() {
            return match failure.classify() {
                Classification::RateLimited => IssueError::RateLimited(err),
                Classification::Auth => IssueError::AuthFailure(err),
                Classification::Client => IssueError::ClientFailure(err),
                Classification::CA => IssueError::CAFailure(err),
            };
        }
        match err.downcast_ref::<AcmeError>() {
            Some(
                AcmeError::ProtocolViolation(_) | AcmeError::MissingEndpoint(_) | AcmeError::NoNonce,
            ) => IssueError::CAFailure(err),
            _ => IssueError::ClientFailure(err),
        }
    }
}

impl From<StepFailure> for IssueError {
    fn from(failure: StepFailure) -> Self {
        anyhow::Error::new(failure).into()
    }
}

/// Issuance steps, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Step {
    Account,
    Order,
    Authorization,
    Challenge,
    Finalize,
    #[strum(serialize = "order check")]
    CheckOrder,
    Download,
}

/// A step whose last response was not acceptable. The envelope is kept as the CA sent it.
#[derive(Debug)]
pub struct StepFailure {
    pub step: Step,
    pub envelope: ResponseEnvelope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classification {
    Client,
    CA,
    RateLimited,
    Auth,
}

impl StepFailure {
    pub fn new(step: Step, envelope: ResponseEnvelope) -> Self {
        Self { step, envelope }
    }

    fn classify(&self) -> Classification {
        if let Some(problem) = self.envelope.problem() {
            if problem.is_rate_limit() {
                return Classification::RateLimited;
            }
            if problem.is_auth_failure() {
                return Classification::Auth;
            }
        }
        match &self.envelope.outcome {
            Outcome::Fatal(FatalReason::Connection(_)) => Classification::Client,
            _ => Classification::CA,
        }
    }
}

impl Display for StepFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let step = self.step;
        match (&self.envelope.outcome, self.envelope.status_field()) {
            (Outcome::Success, Some(status)) => {
                write!(f, "{step} step ended with unexpected status {status}")
            }
            (Outcome::Success, None) => write!(f, "{step} step returned an unusable response"),
            (outcome, _) => write!(f, "{step} step failed: {outcome}"),
        }
    }
}

impl std::error::Error for StepFailure {}

pub trait IssueContext<T> {
    fn client_failure(self) -> IssueResult<T>;
    fn ca_failure(self) -> IssueResult<T>;
}

impl<T> IssueContext<T> for anyhow::Error {
    fn client_failure(self) -> IssueResult<T> {
        Err(IssueError::ClientFailure(self))
    }

    fn ca_failure(self) -> IssueResult<T> {
        Err(IssueError::CAFailure(self))
    }
}

impl<T> IssueContext<T> for Result<T, anyhow::Error> {
    fn client_failure(self) -> IssueResult<T> {
        match self {
            Ok(ok) => Ok(ok),
            Err(err) => err.client_failure(),
        }
    }

    fn ca_failure(self) -> IssueResult<T> {
        match self {
            Ok(ok) => Ok(ok),
            Err(err) => err.ca_failure(),
        }
    }
}
