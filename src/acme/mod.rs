//! Low-level ACME client implementation.
//!
//! This module provides the request plumbing of RFC 8555: directory discovery, nonces, signed
//! requests, response classification and bounded resending/polling. It contains no issuance
//! logic, see [`crate::ops`] and [`crate::issuer`] for that.

pub mod client;
pub mod directory;
pub mod error;
pub mod http;
pub mod nonce;
pub mod object;
pub mod response;
pub mod retry;
#[cfg(test)]
pub(crate) mod test_helper;
