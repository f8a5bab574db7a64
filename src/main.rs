use anyhow::Context;
use certsmith::cli::{Command, CommandLineArguments, IssueCommand};
use certsmith::error::{IssueError, Step, StepFailure};
use certsmith::lock::IssuanceLock;
use certsmith::ops::account::lookup_or_create;
use certsmith::{Certsmith, config};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const ENV_FILTER_NAME: &str = "CERTSMITH_LOG";

async fn issue_certificate(certsmith: &Certsmith, cmd: IssueCommand) -> anyhow::Result<()> {
    let request = certsmith.issuance_request(cmd.domains)?;
    let _lock = IssuanceLock::exclusive_lock(&request.cert_file)
        .await
        .context("Acquiring issuance lock")?;
    let session = certsmith.session().await?;
    let mut issuer = certsmith.issuer(session);
    if let Some(timeout) = cmd.timeout {
        issuer = issuer.with_timeout(timeout);
    }

    let cancel = issuer.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling issuance");
            cancel.cancel();
        }
    });

    match issuer.issue(&request).await {
        Ok(issued) => {
            info!(
                "Certificate for {} written to {}",
                request.domains.join(", "),
                request.cert_file.display()
            );
            for alternate in &issued.certificate.alternate_chains {
                info!("The CA also offers an alternate chain at {alternate}");
            }
            Ok(())
        }
        Err(e) => {
            if let Some(envelope) = e.envelope() {
                error!("Last response from the CA: {}", envelope.raw);
            }
            Err(e.into())
        }
    }
}

async fn show_account(certsmith: &Certsmith) -> anyhow::Result<()> {
    let session = certsmith.session().await?;
    let envelope = lookup_or_create(&session, &certsmith.account_options())
        .await
        .map_err(IssueError::from)?;
    if !envelope.is_success() {
        return Err(IssueError::from(StepFailure::new(Step::Account, envelope)).into());
    }
    let account_url = session
        .account_url()
        .context("CA did not return an account URL")?;
    println!("{account_url}");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CommandLineArguments::parse();
    let filter = EnvFilter::try_from_env(ENV_FILTER_NAME).unwrap_or_else(|_| {
        EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| {
            EnvFilter::new(if cli.verbose {
                "certsmith=debug,info"
            } else {
                "info"
            })
        })
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let config = config::load(&cli.config).context("Loading configuration failed")?;
    let certsmith = Certsmith::new(config);
    match cli.command {
        Command::Issue(issue_cmd) => issue_certificate(&certsmith, issue_cmd).await,
        Command::Account => show_account(&certsmith).await,
        Command::Thumbprint => {
            let key = certsmith.account_key().await?;
            println!("{}", key.get_acme_thumbprint());
            Ok(())
        }
    }
}
