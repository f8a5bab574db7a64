use crate::acme::object::Token;
use crate::cmd_runner::{CommandExecutor, ExecOptions};
use crate::crypto::backend::KeyCommand;
use async_trait::async_trait;
use std::fmt::Debug;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::debug;

const WELL_KNOWN_PATH: &str = ".well-known/acme-challenge";

/// The http-01 key authorization: `token "." thumbprint`
pub fn key_authorization(token: &Token, thumbprint: &str) -> String {
    format!("{token}.{thumbprint}")
}

/// Makes a key authorization reachable under `/.well-known/acme-challenge/<token>`.
#[async_trait]
pub trait ChallengePublisher: Send + Sync + Debug {
    fn name(&self) -> &'static str;
    async fn publish(&self, token: &Token, key_authorization: &str) -> io::Result<()>;
    async fn remove(&self, token: &Token) -> io::Result<()>;
}

fn challenge_path(webroot: &Path, token: &Token) -> PathBuf {
    webroot.join(WELL_KNOWN_PATH).join(token.as_str())
}

/// Writes challenge files below a webroot through the [`CommandExecutor`], so the files are
/// owned by whichever user the executor runs as.
#[derive(Debug, Clone)]
pub struct ExecutorWebrootPublisher {
    webroot: PathBuf,
    executor: Arc<dyn CommandExecutor>,
    options: ExecOptions,
}

impl ExecutorWebrootPublisher {
    pub fn new(webroot: PathBuf, executor: Arc<dyn CommandExecutor>, options: ExecOptions) -> Self {
        Self {
            webroot,
            executor,
            options,
        }
    }

    pub fn challenge_path(&self, token: &Token) -> PathBuf {
        challenge_path(&self.webroot, token)
    }

    async fn run(&self, command: KeyCommand) -> io::Result<()> {
        let output = self.executor.execute(&command, &self.options).await?;
        if output.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!(
                "{command} exited with {}: {}",
                output.exit_code,
                output.text()
            )))
        }
    }
}

#[async_trait]
impl ChallengePublisher for ExecutorWebrootPublisher {
    fn name(&self) -> &'static str {
        "webroot"
    }

    async fn publish(&self, token: &Token, key_authorization: &str) -> io::Result<()> {
        let path = self.challenge_path(token);
        let path_str = path.display().to_string();
        debug!("Publishing http-01 challenge at {path_str}");
        if let Some(parent) = path.parent() {
            self.run(KeyCommand::direct([
                "mkdir",
                "-p",
                &parent.display().to_string(),
            ]))
            .await?;
        }
        self.run(KeyCommand::shell([
            "printf",
            "%s",
            key_authorization,
            ">",
            &path_str,
        ]))
        .await
    }

    async fn remove(&self, token: &Token) -> io::Result<()> {
        let path = self.challenge_path(token);
        self.run(KeyCommand::direct(["rm", "-f", &path.display().to_string()]))
            .await
    }
}

/// Writes challenge files below a webroot with the permissions of this process.
#[derive(Debug, Clone)]
pub struct WebrootPublisher {
    webroot: PathBuf,
}

impl WebrootPublisher {
    pub fn new(webroot: PathBuf) -> Self {
        Self { webroot }
    }

    pub fn challenge_path(&self, token: &Token) -> PathBuf {
        challenge_path(&self.webroot, token)
    }
}

#[async_trait]
impl ChallengePublisher for WebrootPublisher {
    fn name(&self) -> &'static str {
        "webroot"
    }

    async fn publish(&self, token: &Token, key_authorization: &str) -> io::Result<()> {
        let challenge_path = self.challenge_path(token);
        debug!(
            "Publishing http-01 challenge at {}",
            challenge_path.display()
        );
        if let Some(parent) = challenge_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut challenge_file = File::create(&challenge_path).await?;
        challenge_file
            .write_all(key_authorization.as_bytes())
            .await?;
        challenge_file.flush().await
    }

    async fn remove(&self, token: &Token) -> io::Result<()> {
        match tokio::fs::remove_file(self.challenge_path(token)).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd_runner::ProcessExecutor;
    use crate::crypto::backend::ExecutionMode;
    use std::str::FromStr;
    use tempfile::TempDir;

    #[test]
    fn test_key_authorization() {
        let token = Token::from_str("abc123").unwrap();
        assert_eq!(key_authorization(&token, "XYZ"), "abc123.XYZ");
    }

    #[tokio::test]
    async fn test_webroot_publish_and_remove() {
        let webroot = TempDir::new().unwrap();
        let publisher = WebrootPublisher::new(webroot.path().to_path_buf());
        let token = Token::from_str("abc123").unwrap();
        publisher.publish(&token, "abc123.XYZ").await.unwrap();
        let path = webroot.path().join(".well-known/acme-challenge/abc123");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "abc123.XYZ");

        publisher.remove(&token).await.unwrap();
        assert!(!path.exists());
        // Removing twice is fine
        publisher.remove(&token).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_executor_publish_writes_exact_content() {
        let webroot = TempDir::new().unwrap();
        let publisher = ExecutorWebrootPublisher::new(
            webroot.path().to_path_buf(),
            Arc::new(ProcessExecutor::new()),
            ExecOptions::default(),
        );
        let token = Token::from_str("abc123").unwrap();
        publisher.publish(&token, "abc123.XYZ").await.unwrap();
        let path = publisher.challenge_path(&token);
        assert_eq!(std::fs::read(&path).unwrap(), b"abc123.XYZ");

        publisher.remove(&token).await.unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_executor_publish_command_quotes_content() {
        let command = KeyCommand::shell(["printf", "%s", "a'b.c", ">", "/var/www/x"]);
        assert_eq!(command.mode, ExecutionMode::Shell);
        assert_eq!(
            command.to_shell_line(),
            r"printf '%s' 'a'\''b.c' > /var/www/x"
        );
    }
}
