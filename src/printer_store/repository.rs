//! Printer document persistence
//!
//! One pretty-printed JSON file per printer under the store directory.
//! Writes go through a temp file and rename so a crash mid-write never
//! leaves a half-written document behind.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, warn};

use crate::error::Result;

use super::types::Printer;

pub struct PrinterRepository {
    dir: PathBuf,
}

impl PrinterRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Load every document in the directory. Files that fail to parse are
    /// skipped with an error log so one corrupt document cannot take the
    /// whole inventory down.
    pub async fn load_all(&self) -> Result<Vec<Printer>> {
        fs::create_dir_all(&self.dir).await?;

        let mut printers = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = match fs::read(&path).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable printer document");
                    continue;
                }
            };
            match serde_json::from_slice::<Printer>(&raw) {
                Ok(printer) => printers.push(printer),
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Skipping corrupt printer document");
                }
            }
        }
        Ok(printers)
    }

    /// Write a document durably: temp file, flush to disk, rename over the
    /// final path.
    pub async fn save(&self, printer: &Printer) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;

        let path = self.path_for(&printer.id);
        let tmp = self.dir.join(format!(".{}.json.tmp", printer.id));
        let body = serde_json::to_vec_pretty(printer)?;

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&body).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;

        Ok(())
    }

    /// Delete a document. Returns false when it did not exist.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        match fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::types::{make_printer_id, PrinterKind};
    use super::*;
    use chrono::Utc;

    fn sample(name: &str) -> Printer {
        Printer {
            id: make_printer_id("10.0.0.9", name),
            name: name.to_string(),
            kind: PrinterKind::LocalBambu,
            address: "10.0.0.9".to_string(),
            secret: Some("8675309".to_string()),
            serial: None,
            mqtt_port: None,
            stream_url_template: None,
            api_url: None,
            relay_port: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_save_load_delete_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let repo = PrinterRepository::new(dir.path());

        let printer = sample("A1");
        repo.save(&printer).await.unwrap();

        let loaded = repo.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, printer.id);
        assert_eq!(loaded[0].secret.as_deref(), Some("8675309"));

        assert!(repo.delete(&printer.id).await.unwrap());
        assert!(!repo.delete(&printer.id).await.unwrap());
        assert!(repo.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_document_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let repo = PrinterRepository::new(dir.path());

        repo.save(&sample("good")).await.unwrap();
        fs::write(dir.path().join("broken.json"), b"{ nope")
            .await
            .unwrap();

        let loaded = repo.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "good");
    }

    #[tokio::test]
    async fn test_load_from_missing_dir_creates_it() {
        let dir = tempfile::tempdir().unwrap();
        let repo = PrinterRepository::new(dir.path().join("printers"));
        assert!(repo.load_all().await.unwrap().is_empty());
        assert!(repo.dir().is_dir());
    }
}
