//! Credentials document persistence
//!
//! A single JSON document holds the cloud account state. Same durability
//! scheme as the printer store: temp file, fsync, rename.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::error;

use crate::error::Result;

use super::types::CloudCredentials;

const CREDENTIALS_FILE: &str = "bambu_cloud.json";

pub struct CredentialsRepository {
    dir: PathBuf,
}

impl CredentialsRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self) -> PathBuf {
        self.dir.join(CREDENTIALS_FILE)
    }

    /// Load the stored account, if any. A corrupt document is dropped with
    /// an error log; the operator logs in again rather than the process
    /// refusing to start.
    pub async fn load(&self) -> Result<Option<CloudCredentials>> {
        let path = self.path();
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&raw) {
            Ok(creds) => Ok(Some(creds)),
            Err(e) => {
                error!(path = %path.display(), error = %e, "Dropping corrupt credentials document");
                Ok(None)
            }
        }
    }

    pub async fn save(&self, credentials: &CloudCredentials) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;

        let tmp = self.dir.join(format!(".{}.tmp", CREDENTIALS_FILE));
        let body = serde_json::to_vec_pretty(credentials)?;

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&body).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, self.path()).await?;

        Ok(())
    }

    /// Remove the document. Returns false when none existed.
    pub async fn delete(&self) -> Result<bool> {
        match fs::remove_file(self.path()).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::super::types::CloudRegion;
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_round_trip_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let repo = CredentialsRepository::new(dir.path().join("bambu-cloud"));

        assert!(repo.load().await.unwrap().is_none());

        let creds = CloudCredentials {
            email: "who@example.com".into(),
            token: "tok".into(),
            user_id: "42".into(),
            connected: true,
            region: CloudRegion::Eu,
            updated_at: Utc::now(),
        };
        repo.save(&creds).await.unwrap();

        let loaded = repo.load().await.unwrap().unwrap();
        assert_eq!(loaded.email, "who@example.com");
        assert_eq!(loaded.region, CloudRegion::Eu);

        assert!(repo.delete().await.unwrap());
        assert!(!repo.delete().await.unwrap());
        assert!(repo.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_document_forces_relogin() {
        let dir = tempfile::tempdir().unwrap();
        let repo = CredentialsRepository::new(dir.path());
        fs::create_dir_all(repo.dir()).await.unwrap();
        fs::write(repo.dir().join(CREDENTIALS_FILE), b"{ not json")
            .await
            .unwrap();
        assert!(repo.load().await.unwrap().is_none());
    }
}
