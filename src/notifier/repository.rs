//! Notifications document persistence

use std::path::PathBuf;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

use crate::error::Result;

use super::types::NotifierConfig;

const CONFIG_FILE: &str = "notifications.json";

pub struct NotifierConfigRepository {
    dir: PathBuf,
}

impl NotifierConfigRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    /// Load the document, writing a disabled template on first run so the
    /// operator has a file to edit. A corrupt document falls back to the
    /// disabled default without overwriting the broken file.
    pub async fn load_or_init(&self) -> Result<NotifierConfig> {
        match fs::read(self.path()).await {
            Ok(raw) => match serde_json::from_slice(&raw) {
                Ok(config) => Ok(config),
                Err(e) => {
                    error!(path = %self.path().display(), error = %e, "Corrupt notifications document, notifications disabled");
                    Ok(NotifierConfig::default())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = NotifierConfig::default();
                self.save(&config).await?;
                info!(path = %self.path().display(), "Wrote notifications template");
                Ok(config)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, config: &NotifierConfig) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;

        let tmp = self.dir.join(format!(".{}.tmp", CONFIG_FILE));
        let body = serde_json::to_vec_pretty(config)?;

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&body).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, self.path()).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_run_writes_template() {
        let dir = tempfile::tempdir().unwrap();
        let repo = NotifierConfigRepository::new(dir.path().join("notifications"));

        let config = repo.load_or_init().await.unwrap();
        assert!(!config.telegram.enabled);
        assert!(repo.path().is_file());

        // Second load reads the written template.
        let again = repo.load_or_init().await.unwrap();
        assert!(!again.whatsapp.enabled);
    }

    #[tokio::test]
    async fn test_corrupt_document_disables_notifications() {
        let dir = tempfile::tempdir().unwrap();
        let repo = NotifierConfigRepository::new(dir.path());
        fs::create_dir_all(dir.path()).await.unwrap();
        fs::write(dir.path().join(CONFIG_FILE), b"][").await.unwrap();

        let config = repo.load_or_init().await.unwrap();
        assert!(!config.telegram.enabled);
    }
}
