use crate::acme::object::Identifier;
use crate::crypto::asymmetric::KeyPair;
use anyhow::{Context, Error, bail};
use rcgen::{CertificateSigningRequest, DnType};
use std::io::{BufRead, Cursor, Seek};
use std::net::IpAddr;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::warn;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::num_bigint::BigUint;
use x509_parser::pem::Pem;
use x509_parser::prelude::FromDer;

/// The maximum number of certificates we will parse in a PEM-array of certificates by default
const DEFAULT_MAX_CERTIFICATE_CHAIN_LENGTH: usize = 100;

/// CSR for `domains`, with the first domain as common name and all of them as SANs.
pub fn create_and_sign_csr(
    cert_key: &KeyPair,
    domains: &[String],
) -> Result<CertificateSigningRequest, Error> {
    let Some(common_name) = domains.first() else {
        bail!("Cannot create a certificate request without domains");
    };
    let rcgen_keypair = cert_key.to_rcgen_keypair()?;
    let mut cert_params =
        rcgen::CertificateParams::new(domains.to_vec()).context("CSR generation failed")?;
    cert_params.distinguished_name = rcgen::DistinguishedName::new();
    cert_params
        .distinguished_name
        .push(DnType::CommonName, common_name.as_str());
    let csr = cert_params
        .serialize_request(&rcgen_keypair)
        .context("Signing CSR failed")?;
    Ok(csr)
}

pub fn load_certificates_from_memory<B: AsRef<[u8]>>(
    pem_bytes: B,
    limit: Option<usize>,
) -> anyhow::Result<Vec<ParsedX509Certificate>> {
    let reader = Cursor::new(pem_bytes);
    load_certificates_from_reader(reader, limit)
}

fn load_certificates_from_reader<R: BufRead + Seek>(
    reader: R,
    limit: Option<usize>,
) -> anyhow::Result<Vec<ParsedX509Certificate>> {
    let mut certificates = Vec::new();
    for pem in
        Pem::iter_from_reader(reader).take(limit.unwrap_or(DEFAULT_MAX_CERTIFICATE_CHAIN_LENGTH))
    {
        let pem = pem.context("Reading PEM block failed")?;
        let parsed_x509 = ParsedX509Certificate::try_from(pem.contents)?;
        certificates.push(parsed_x509);
    }
    Ok(certificates)
}

/// Parses a downloaded chain. The leaf comes first and the chain must not be empty.
pub fn parse_certificate_chain(pem: &str) -> anyhow::Result<Vec<ParsedX509Certificate>> {
    let chain =
        load_certificates_from_memory(pem, None).context("Parsing certificate chain failed")?;
    if chain.is_empty() {
        bail!("Certificate chain contains no certificates");
    }
    Ok(chain)
}

pub async fn load_reqwest_certificates<I: Iterator<Item = T>, T: AsRef<Path>>(
    files: I,
) -> anyhow::Result<Vec<reqwest::Certificate>> {
    let mut certificates = Vec::with_capacity(files.size_hint().0);
    for cert_path in files {
        let cert_path = cert_path.as_ref();
        let cert_path_display = cert_path.display();
        let mut cert_file = tokio::fs::File::open(cert_path).await.context(format!(
            "Opening certificate file {cert_path_display} failed"
        ))?;
        let mut cert_data = Vec::new();
        cert_file
            .read_to_end(&mut cert_data)
            .await
            .context(format!(
                "Reading certificate file {cert_path_display} failed"
            ))?;
        let reqwest_cert = reqwest::Certificate::from_pem(&cert_data).context(format!(
            "Parsing certificate file PEM {cert_path_display} failed"
        ))?;
        certificates.push(reqwest_cert);
    }
    Ok(certificates)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedX509Certificate {
    pub serial: BigUint,
    pub subject: String,
    pub issuer: String,
    pub validity: Validity,
    pub subject_alternative_names: Vec<Identifier>,
}

impl TryFrom<Vec<u8>> for ParsedX509Certificate {
    type Error = Error;

    fn try_from(der_bytes: Vec<u8>) -> anyhow::Result<ParsedX509Certificate> {
        let (_extra_bytes, cert) = x509_parser::certificate::X509Certificate::from_der(&der_bytes)
            .context("Reading X.509 structure: Decoding DER failed")?;
        let serial = cert.serial.clone();
        let subject = cert.subject.to_string();
        let issuer = cert.issuer.to_string();
        let validity = (&cert.validity).into();
        let mut subject_alternative_names = Vec::new();
        for extension in cert.extensions() {
            if let ParsedExtension::SubjectAlternativeName(san) = extension.parsed_extension() {
                for general_name in &san.general_names {
                    match general_name {
                        GeneralName::DNSName(dns_name) => {
                            subject_alternative_names.push(Identifier::Dns {
                                value: (*dns_name).to_string(),
                            });
                        }
                        GeneralName::IPAddress(ip_addr) => {
                            let ip_addr = *ip_addr;
                            let parsed_ip_addr = ip_addr
                                .try_into()
                                .ok()
                                .map(|ipv6_addr: [u8; 16]| IpAddr::from(ipv6_addr))
                                .or_else(|| {
                                    ip_addr
                                        .try_into()
                                        .ok()
                                        .map(|ipv4_addr: [u8; 4]| IpAddr::from(ipv4_addr))
                                });
                            match parsed_ip_addr {
                                Some(value) => {
                                    subject_alternative_names.push(Identifier::Ip { value });
                                }
                                None => {
                                    warn!("Certificate contains invalid IP address {ip_addr:#?}");
                                }
                            }
                        }
                        unsupported => {
                            warn!("Found unsupported general name {unsupported} in certificate");
                        }
                    }
                }
            }
        }
        Ok(Self {
            serial,
            subject,
            issuer,
            validity,
            subject_alternative_names,
        })
    }
}

impl ParsedX509Certificate {
    /// Whether every domain is listed as a DNS subject alternative name.
    pub fn covers(&self, domains: &[String]) -> bool {
        domains.iter().all(|domain| {
            self.subject_alternative_names.iter().any(|san| match san {
                Identifier::Dns { value } => value.eq_ignore_ascii_case(domain),
                Identifier::Ip { value } => value.to_string() == *domain,
                Identifier::Unknown => false,
            })
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Validity {
    pub not_before: time::OffsetDateTime,
    pub not_after: time::OffsetDateTime,
}

impl Validity {
    pub fn time_to_expiration(&self) -> time::Duration {
        let now = time::OffsetDateTime::now_utc();
        self.not_after - now
    }
}

impl From<&x509_parser::certificate::Validity> for Validity {
    fn from(value: &x509_parser::certificate::Validity) -> Self {
        Self {
            not_before: value.not_before.to_datetime(),
            not_after: value.not_after.to_datetime(),
        }
    }
}
