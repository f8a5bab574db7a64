use crate::config::DEFAULT_CONFIG_FILE;
use crate::time::parse_duration;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(version, about, long_about = "")]
pub struct CommandLineArguments {
    /// Path to the configuration file
    #[arg(short, long, env = "CERTSMITH_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,
    /// Shorthand option to enable debug logging (logging can be fine-tuned via `CERTSMITH_LOG` environment variable)
    #[clap(long, short, action)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Issue a certificate and install it at the configured path
    Issue(IssueCommand),
    /// Look up the ACME account for the configured key, registering it if necessary
    Account,
    /// Print the JWK thumbprint of the account key
    Thumbprint,
}

#[derive(Debug, Args, Default)]
pub struct IssueCommand {
    /// Domain names to include in the certificate, instead of the configured ones
    #[clap(short, long, value_delimiter = ',', num_args = 1..)]
    pub domains: Option<Vec<String>>,
    /// Give up if issuance takes longer than this (e.g. `5m`)
    #[clap(short, long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_with_domains() {
        let cli = CommandLineArguments::try_parse_from([
            "certsmith",
            "--config",
            "/tmp/certsmith.toml",
            "issue",
            "--domains",
            "example.org,www.example.org",
            "--timeout",
            "2m",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/tmp/certsmith.toml"));
        let Command::Issue(issue) = cli.command else {
            panic!("expected issue command");
        };
        assert_eq!(
            issue.domains.unwrap(),
            vec!["example.org".to_string(), "www.example.org".to_string()]
        );
        assert_eq!(issue.timeout, Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_subcommand_is_required() {
        assert!(CommandLineArguments::try_parse_from(["certsmith"]).is_err());
    }

    #[test]
    fn test_thumbprint() {
        let cli = CommandLineArguments::try_parse_from(["certsmith", "-v", "thumbprint"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Command::Thumbprint));
    }
}
