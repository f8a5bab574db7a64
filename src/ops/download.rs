use crate::acme::client::AcmeSession;
use crate::acme::error::{Error, ProtocolResult};
use crate::acme::response::ResponseEnvelope;
use crate::cert::{ParsedX509Certificate, parse_certificate_chain};
use tracing::{debug, warn};
use url::Url;

const ALTERNATE_RELATION: &str = "alternate";

/// Fetches the issued certificate chain (POST-as-GET on the order's `certificate` URL).
pub async fn download_certificate(
    session: &AcmeSession,
    certificate_url: &Url,
) -> ProtocolResult<ResponseEnvelope> {
    debug!("Downloading certificate from {certificate_url}");
    session.post_as_get(certificate_url).await
}

/// A downloaded PEM chain, leaf first.
#[derive(Debug, Clone)]
pub struct DownloadedCertificate {
    pub pem: String,
    pub chain: Vec<ParsedX509Certificate>,
    /// Other chains the CA offers via `Link: rel="alternate"`
    pub alternate_chains: Vec<Url>,
}

impl DownloadedCertificate {
    /// Checks that a successful download response holds a certificate chain for `domains`.
    pub fn from_envelope(envelope: &ResponseEnvelope, domains: &[String]) -> ProtocolResult<Self> {
        if !envelope.is_success() {
            return Err(Error::ProtocolViolation(
                "certificate download did not succeed",
            ));
        }
        let chain = parse_certificate_chain(&envelope.raw).map_err(|e| {
            warn!("CA returned an unparsable certificate chain: {e:#}");
            Error::ProtocolViolation("CA did not return a PEM certificate chain")
        })?;
        let downloaded = Self {
            pem: envelope.raw.clone(),
            chain,
            alternate_chains: envelope
                .links
                .iter()
                .filter(|link| link.relation == ALTERNATE_RELATION)
                .map(|link| link.url.clone())
                .collect(),
        };
        if !downloaded.leaf().covers(domains) {
            return Err(Error::ProtocolViolation(
                "issued certificate does not cover the requested domains",
            ));
        }
        Ok(downloaded)
    }

    pub fn leaf(&self) -> &ParsedX509Certificate {
        // parse_certificate_chain never returns an empty chain
        &self.chain[0]
    }
}
