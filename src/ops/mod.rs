//! One function per ACME step.
//!
//! Every operation returns the [`ResponseEnvelope`](crate::acme::response::ResponseEnvelope) of
//! its last request, CA-side failures included. `Err` is reserved for failures on our side of
//! the wire: key commands, the command executor, local files.

use crate::acme::response::ResponseEnvelope;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub mod account;
pub mod authorization;
pub mod challenge;
pub mod download;
pub mod finalize;
pub mod order;

/// The `status` member of a response body, decoded as one of the object status enums.
pub fn parse_status<S: DeserializeOwned>(envelope: &ResponseEnvelope) -> Option<S> {
    let status = envelope.status_field()?;
    serde_json::from_value(Value::String(status.to_string())).ok()
}
