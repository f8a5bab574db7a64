use crate::cmd_runner::DEFAULT_COMMAND_TIMEOUT;
use crate::config::KeyConfiguration;
use crate::issuer::DEFAULT_ISSUE_TIMEOUT;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_CONFIG_FILE: &str = "/etc/certsmith/certsmith.toml";
const LETS_ENCRYPT: &str = "https://acme-v02.api.letsencrypt.org/directory";
const ACCOUNT_KEY_FILE: &str = "/etc/certsmith/account.key";

pub(super) fn directory_url() -> Url {
    Url::parse(LETS_ENCRYPT).unwrap(/* constant */)
}

pub(super) fn issue_timeout() -> Duration {
    DEFAULT_ISSUE_TIMEOUT
}

pub(super) fn command_timeout() -> Duration {
    DEFAULT_COMMAND_TIMEOUT
}

pub(super) fn account_key() -> KeyConfiguration {
    KeyConfiguration {
        key_type: String::new(),
        key_file: PathBuf::from(ACCOUNT_KEY_FILE),
        key_size: None,
    }
}
