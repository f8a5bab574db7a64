use crate::CRATE_NAME;
use fs4::tokio::AsyncFileExt;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tracing::{error, info};

fn lock_path(cert_file: &Path) -> PathBuf {
    let mut name = cert_file.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

async fn issuance_lock(cert_file: &Path) -> std::io::Result<File> {
    let lock_file = File::create(lock_path(cert_file)).await?;
    if lock_file.try_lock_exclusive()? {
        Ok(lock_file)
    } else {
        info!(
            "Another {CRATE_NAME} process is currently issuing this certificate. Waiting for the other process to finish..."
        );
        tokio::task::spawn_blocking(move || {
            lock_file.lock_exclusive()?;
            Ok(lock_file)
        })
        .await?
    }
}

/// Serializes issuance runs for one certificate file across processes.
///
/// Nonces, the backup files and the certificate itself all assume a single writer.
#[must_use]
#[clippy::has_significant_drop]
pub struct IssuanceLock {
    lock_file: File,
}

impl IssuanceLock {
    pub async fn exclusive_lock(cert_file: &Path) -> std::io::Result<Self> {
        if let Some(parent) = cert_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let lock_file = issuance_lock(cert_file).await?;
        Ok(Self { lock_file })
    }
}

impl Drop for IssuanceLock {
    fn drop(&mut self) {
        if let Err(e) = self.lock_file.unlock() {
            error!("Failed to release issuance lock: {e}");
        }
    }
}
