//! Backup-before-mutate for the installed certificate and its key.

use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

const BACKUP_SUFFIX: &str = "bak";

fn backup_path(original: &Path) -> PathBuf {
    let mut name = original.as_os_str().to_owned();
    name.push(".");
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    /// The file existed and was copied to `backup`
    Saved { original: PathBuf, backup: PathBuf },
    /// The file did not exist, restoring means removing whatever appeared there since
    Absent { original: PathBuf },
}

/// Copies of a set of files, restorable byte for byte.
///
/// Dropping the value without calling [`restore`](Self::restore) or
/// [`discard`](Self::discard) restores the files synchronously, so an issuance that is cancelled
/// or times out half way still leaves the previous certificate in place.
#[derive(Debug)]
#[must_use]
#[clippy::has_significant_drop]
pub struct CertificateBackup {
    entries: Vec<Entry>,
}

impl CertificateBackup {
    /// Copies every existing file to `<file>.bak`. If one copy fails, the backups made so far
    /// are removed again.
    pub async fn create<P: AsRef<Path>>(files: &[P]) -> io::Result<Self> {
        let mut entries = Vec::with_capacity(files.len());
        for file in files {
            match save(file.as_ref()).await {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    error!("Backing up {} failed: {e}", file.as_ref().display());
                    remove_backups(entries).await;
                    return Err(e);
                }
            }
        }
        Ok(Self { entries })
    }

    /// Removes the original files. Their backups stay in place.
    pub async fn remove_originals(&self) -> io::Result<()> {
        for entry in &self.entries {
            if let Entry::Saved { original, .. } = entry {
                tokio::fs::remove_file(original).await?;
            }
        }
        Ok(())
    }

    /// Puts every file back the way it was when the backup was taken.
    pub async fn restore(mut self) -> io::Result<()> {
        let mut result = Ok(());
        for entry in std::mem::take(&mut self.entries) {
            let outcome = match &entry {
                Entry::Saved { original, backup } => tokio::fs::rename(backup, original).await,
                Entry::Absent { original } => match tokio::fs::remove_file(original).await {
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                    other => other,
                },
            };
            // Keep going, restoring the remaining files is still worth it
            if let Err(e) = outcome {
                error!("Restoring {entry:?} failed: {e}");
                result = Err(e);
            }
        }
        if result.is_ok() {
            info!("Restored previous certificate");
        }
        result
    }

    /// Deletes the backup files, keeping the current state.
    pub async fn discard(mut self) -> io::Result<()> {
        remove_backups(std::mem::take(&mut self.entries)).await;
        Ok(())
    }
}

async fn save(original: &Path) -> io::Result<Entry> {
    let original = original.to_path_buf();
    if !tokio::fs::try_exists(&original).await? {
        return Ok(Entry::Absent { original });
    }
    let backup = backup_path(&original);
    tokio::fs::copy(&original, &backup).await?;
    debug!("Backed up {} to {}", original.display(), backup.display());
    Ok(Entry::Saved { original, backup })
}

async fn remove_backups(entries: Vec<Entry>) {
    for entry in entries {
        if let Entry::Saved { backup, .. } = entry {
            if let Err(e) = tokio::fs::remove_file(&backup).await {
                warn!("Could not remove backup {}: {e}", backup.display());
            }
        }
    }
}

impl Drop for CertificateBackup {
    fn drop(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        warn!("Issuance was interrupted, restoring previous certificate");
        for entry in std::mem::take(&mut self.entries) {
            let outcome = match &entry {
                Entry::Saved { original, backup } => std::fs::rename(backup, original),
                Entry::Absent { original } => match std::fs::remove_file(original) {
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                    other => other,
                },
            };
            if let Err(e) = outcome {
                error!("Restoring {entry:?} failed: {e}");
            }
        }
    }
}
