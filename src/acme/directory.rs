use crate::acme::error::{Error, ProtocolResult};
use crate::acme::http::{HttpRequest, HttpTransport};
use crate::acme::object::Metadata;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use strum::{AsRefStr, Display, EnumIter, IntoEnumIterator};
use tracing::{debug, warn};
use url::Url;

/// Resources announced by an ACME directory (RFC 8555, Section 7.1.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumIter)]
#[strum(serialize_all = "camelCase")]
pub enum Endpoint {
    NewNonce,
    NewAccount,
    NewOrder,
    NewAuthz,
    RevokeCert,
    KeyChange,
    RenewalInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directory {
    endpoints: HashMap<Endpoint, Url>,
    pub meta: Option<Metadata>,
}

impl Directory {
    /// Picks the known endpoints out of a directory document. Unknown members and members that
    /// are not absolute URLs are ignored.
    pub fn from_json(document: &Value) -> Self {
        let endpoints = Endpoint::iter()
            .filter_map(|endpoint| {
                let raw = document.get(endpoint.as_ref())?.as_str()?;
                match Url::parse(raw) {
                    Ok(url) => Some((endpoint, url)),
                    Err(e) => {
                        warn!("Directory lists an invalid URL for {endpoint}: {e}");
                        None
                    }
                }
            })
            .collect();
        let meta = document
            .get("meta")
            .and_then(|meta| serde_json::from_value(meta.clone()).ok());
        Self { endpoints, meta }
    }

    pub fn endpoint(&self, endpoint: Endpoint) -> ProtocolResult<&Url> {
        self.endpoints
            .get(&endpoint)
            .ok_or(Error::MissingEndpoint(endpoint))
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// Directories by base URL. Owned by a session, only successful fetches are remembered.
#[derive(Debug, Default)]
pub struct DirectoryCache {
    entries: Mutex<HashMap<Url, Arc<Directory>>>,
}

impl DirectoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the directory behind `base_url`, fetching it on first use.
    ///
    /// A failed fetch yields an empty directory, which makes every [`Directory::endpoint`]
    /// lookup report [`Error::MissingEndpoint`].
    pub async fn get(&self, transport: &dyn HttpTransport, base_url: &Url) -> Arc<Directory> {
        if let Some(directory) = self.entries.lock().get(base_url) {
            return directory.clone();
        }

        debug!("Fetching ACME directory from {base_url}");
        let directory = match transport.request(HttpRequest::get(base_url.clone())).await {
            Ok(response) if response.is_success() => {
                match serde_json::from_slice::<Value>(&response.body) {
                    Ok(document) => Directory::from_json(&document),
                    Err(e) => {
                        warn!("ACME directory at {base_url} is not valid JSON: {e}");
                        Directory::default()
                    }
                }
            }
            Ok(response) => {
                warn!(
                    "ACME directory at {base_url} responded with HTTP {}",
                    response.status
                );
                Directory::default()
            }
            Err(e) => {
                warn!("Could not fetch ACME directory: {e}");
                Directory::default()
            }
        };

        let directory = Arc::new(directory);
        if !directory.is_empty() {
            self.entries
                .lock()
                .insert(base_url.clone(), directory.clone());
        }
        directory
    }
}
