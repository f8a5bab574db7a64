use crate::acme::directory::{Directory, Endpoint};
use crate::acme::error::{Error, ProtocolResult};
use crate::acme::http::{HttpRequest, HttpTransport};
use crate::acme::object::Nonce;
use parking_lot::Mutex;
use tracing::{debug, error};

/// Holds the single nonce a session may use next.
///
/// Every response replaces it, so a nonce is never sent twice.
#[derive(Debug, Default)]
pub struct NonceSource {
    current: Mutex<Option<Nonce>>,
}

impl NonceSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remembers the nonce of the latest response. A response without one clears the slot.
    pub fn replace(&self, nonce: Option<Nonce>) {
        *self.current.lock() = nonce;
    }

    pub fn take(&self) -> Option<Nonce> {
        self.current.lock().take()
    }

    /// Asks the server for a fresh nonce via `HEAD newNonce`.
    pub async fn new_nonce(
        &self,
        transport: &dyn HttpTransport,
        directory: &Directory,
    ) -> ProtocolResult<Nonce> {
        let url = directory.endpoint(Endpoint::NewNonce)?;
        let response = match transport.request(HttpRequest::head(url.clone())).await {
            Ok(response) => response,
            Err(e) => {
                error!("Could not fetch a new nonce: {e}");
                return Err(Error::NoNonce);
            }
        };
        match response.extract_nonce().filter(|nonce| !nonce.is_empty()) {
            Some(nonce) => Nonce::try_from(nonce.to_string()).map_err(|_| {
                error!("Server sent a malformed nonce");
                Error::NoNonce
            }),
            None => {
                error!(
                    "Server did not provide a nonce (HTTP {} from {url})",
                    response.status
                );
                Err(Error::NoNonce)
            }
        }
    }

    /// The stored nonce if there is one, a fresh one otherwise.
    pub async fn next(
        &self,
        transport: &dyn HttpTransport,
        directory: &Directory,
    ) -> ProtocolResult<Nonce> {
        if let Some(nonce) = self.take() {
            return Ok(nonce);
        }
        debug!("No stored nonce, requesting a new one");
        self.new_nonce(transport, directory).await
    }
}
