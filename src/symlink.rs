//! Symlink manager - owns the dongle alias namespace under /dev
//!
//! ## Responsibilities
//!
//! - Install the `<imei>.imei` / `<imsi>.imsi` alias pair for a record,
//!   all-or-nothing
//! - Tear aliases down on removal
//! - Purge stale aliases left behind by a previous process at startup
//!
//! Every operation is idempotent against the filesystem. The pair is kept
//! atomic post-call by rollback: if the second alias cannot be created the
//! first is unlinked again.

use crate::error::{Result, SymlinkError};
use crate::models::Dongle;
use crate::store::DongleStore;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Maintains the alias symlinks for symlinked dongle records
pub struct SymlinkManager {
    dev_dir: PathBuf,
}

impl SymlinkManager {
    /// `dev_dir` is `/dev` in production; tests point it at a tempdir
    pub fn new(dev_dir: impl Into<PathBuf>) -> Self {
        Self {
            dev_dir: dev_dir.into(),
        }
    }

    fn imei_alias(&self, d: &Dongle) -> PathBuf {
        self.dev_dir.join(format!("{}.imei", d.imei))
    }

    fn imsi_alias(&self, d: &Dongle) -> PathBuf {
        self.dev_dir.join(format!("{}.imsi", d.imsi))
    }

    /// Install both aliases for `d` and persist `is_symlinked` through the
    /// store. Returns the updated snapshot for the caller to publish.
    ///
    /// The caller guarantees a non-empty IMSI. Existing aliases for the same
    /// identifiers are replaced unconditionally, which is how a new winner
    /// takes over the pair from a higher-tty endpoint.
    pub async fn install(&self, d: &Dongle, store: &DongleStore) -> Result<Dongle> {
        let imei_link = self.imei_alias(d);
        unlink_if_exists(&imei_link)?;
        symlink(&d.path, &imei_link).map_err(|e| SymlinkError::Create {
            path: imei_link.clone(),
            source: e,
        })?;
        info!(alias = %imei_link.display(), target = %d.path, "symlink installed");

        let imsi_link = self.imsi_alias(d);
        let imsi_result = unlink_if_exists(&imsi_link).and_then(|_| {
            symlink(&d.path, &imsi_link).map_err(|e| SymlinkError::Create {
                path: imsi_link.clone(),
                source: e,
            })
        });
        if let Err(e) = imsi_result {
            // Keep the pair all-or-nothing
            let _ = fs::remove_file(&imei_link);
            return Err(e.into());
        }
        info!(alias = %imsi_link.display(), target = %d.path, "symlink installed");

        let mut updated = d.clone();
        updated.is_symlinked = true;
        store.update(&updated).await
    }

    /// Unlink both aliases; missing files are not an error
    pub fn remove(&self, d: &Dongle) {
        for alias in [self.imei_alias(d), self.imsi_alias(d)] {
            match fs::remove_file(&alias) {
                Ok(()) => info!(alias = %alias.display(), target = %d.path, "symlink removed"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => debug!(alias = %alias.display(), error = %e, "unlink failed"),
            }
        }
    }

    /// Unlink every `.imei` / `.imsi` entry in the dev dir.
    ///
    /// Runs once at startup, before the first hotplug event; this is the
    /// only operation that touches aliases created by a previous process.
    /// Subdirectories are not descended into.
    pub fn purge_all(&self) -> Result<()> {
        for entry in fs::read_dir(&self.dev_dir)? {
            let path = entry?.path();
            if path.is_dir() {
                continue;
            }
            if matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("imei") | Some("imsi")
            ) {
                info!(path = %path.display(), "unlinking stale alias");
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

fn unlink_if_exists(path: &Path) -> std::result::Result<(), SymlinkError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SymlinkError::Unlink {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tempfile::TempDir;

    async fn store() -> DongleStore {
        DongleStore::connect("sqlite::memory:").await.unwrap()
    }

    fn dongle(dev: &TempDir) -> Dongle {
        let path = dev.path().join("ttyUSB0");
        Dongle::new("111", "222", path.to_str().unwrap(), 0)
    }

    #[tokio::test]
    async fn install_creates_both_aliases() {
        let dev = TempDir::new().unwrap();
        let store = store().await;
        let d = store.insert(&dongle(&dev)).await.unwrap();

        let manager = SymlinkManager::new(dev.path());
        let updated = manager.install(&d, &store).await.unwrap();

        assert!(updated.is_symlinked);
        let imei_target = fs::read_link(dev.path().join("111.imei")).unwrap();
        let imsi_target = fs::read_link(dev.path().join("222.imsi")).unwrap();
        assert_eq!(imei_target.to_str().unwrap(), d.path);
        assert_eq!(imsi_target.to_str().unwrap(), d.path);

        // the flag was persisted
        assert!(store.get(&d.path).await.unwrap().unwrap().is_symlinked);
    }

    #[tokio::test]
    async fn install_replaces_existing_aliases() {
        let dev = TempDir::new().unwrap();
        let store = store().await;
        let manager = SymlinkManager::new(dev.path());

        let d = store.insert(&dongle(&dev)).await.unwrap();
        manager.install(&d, &store).await.unwrap();

        // a lower-tty endpoint of the same modem takes over the pair
        let winner_path = dev.path().join("ttyUSB1");
        let mut winner = Dongle::new("111", "222", winner_path.to_str().unwrap(), 1);
        winner = store.insert(&winner).await.unwrap();
        manager.install(&winner, &store).await.unwrap();

        let imei_target = fs::read_link(dev.path().join("111.imei")).unwrap();
        assert_eq!(imei_target.to_str().unwrap(), winner.path);
    }

    #[tokio::test]
    async fn failed_second_alias_rolls_back_the_first() {
        let dev = TempDir::new().unwrap();
        let store = store().await;
        let d = store.insert(&dongle(&dev)).await.unwrap();

        // a directory squatting on the .imsi name makes both the unlink and
        // the create fail
        fs::create_dir(dev.path().join("222.imsi")).unwrap();

        let manager = SymlinkManager::new(dev.path());
        let err = manager.install(&d, &store).await.unwrap_err();
        assert!(matches!(err, Error::Symlink(_)));

        assert!(!dev.path().join("111.imei").exists());
        assert!(!store.get(&d.path).await.unwrap().unwrap().is_symlinked);
    }

    #[tokio::test]
    async fn remove_ignores_missing_aliases() {
        let dev = TempDir::new().unwrap();
        let store = store().await;
        let d = store.insert(&dongle(&dev)).await.unwrap();

        let manager = SymlinkManager::new(dev.path());
        manager.remove(&d); // nothing installed yet

        manager.install(&d, &store).await.unwrap();
        manager.remove(&d);
        assert!(!dev.path().join("111.imei").exists());
        assert!(!dev.path().join("222.imsi").exists());
    }

    #[test]
    fn purge_unlinks_only_alias_extensions() {
        let dev = TempDir::new().unwrap();
        fs::write(dev.path().join("stale.imei"), b"").unwrap();
        fs::write(dev.path().join("stale.imsi"), b"").unwrap();
        fs::write(dev.path().join("ttyUSB0"), b"").unwrap();
        fs::create_dir(dev.path().join("disk")).unwrap();
        fs::write(dev.path().join("disk").join("nested.imei"), b"").unwrap();

        let manager = SymlinkManager::new(dev.path());
        manager.purge_all().unwrap();

        assert!(!dev.path().join("stale.imei").exists());
        assert!(!dev.path().join("stale.imsi").exists());
        assert!(dev.path().join("ttyUSB0").exists());
        // no descent into subdirectories
        assert!(dev.path().join("disk").join("nested.imei").exists());
    }
}
