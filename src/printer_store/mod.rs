//! PrinterStore - printer inventory
//!
//! ## Responsibilities
//!
//! - Own the persisted printer inventory, one JSON document per printer
//! - Mint stable printer ids from address and display name
//! - Serve fast in-memory reads; flush every mutation before returning
//!
//! All configuration reads and writes go through here. Sessions and relays
//! never touch the documents directly.

mod repository;
mod types;

pub use repository::PrinterRepository;
pub use types::{make_printer_id, sanitize_name, NewPrinter, Printer, PrinterKind};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{Error, Result};

pub struct PrinterStore {
    repo: PrinterRepository,
    /// In-memory mirror of the documents on disk
    cache: RwLock<HashMap<String, Printer>>,
}

impl PrinterStore {
    /// Open the store, loading every document under `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let repo = PrinterRepository::new(dir);
        let printers = repo.load_all().await?;

        let mut cache = HashMap::with_capacity(printers.len());
        for printer in printers {
            cache.insert(printer.id.clone(), printer);
        }
        info!(count = cache.len(), "Printer inventory loaded");

        Ok(Arc::new(Self {
            repo,
            cache: RwLock::new(cache),
        }))
    }

    /// All printers, ordered by id for stable output.
    pub async fn list(&self) -> Vec<Printer> {
        let cache = self.cache.read().await;
        let mut printers: Vec<Printer> = cache.values().cloned().collect();
        printers.sort_by(|a, b| a.id.cmp(&b.id));
        printers
    }

    pub async fn get(&self, id: &str) -> Option<Printer> {
        self.cache.read().await.get(id).cloned()
    }

    /// Add a printer. Fails atomically on validation or flush errors; the
    /// cache is only updated after the document is on disk. Re-adding an
    /// existing id returns the stored document unchanged.
    pub async fn add(&self, new: NewPrinter) -> Result<Printer> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(Error::Validation("printer name must not be empty".into()));
        }
        if new.address.trim().is_empty() {
            return Err(Error::Validation("printer address must not be empty".into()));
        }
        if sanitize_name(name).is_empty() {
            return Err(Error::Validation(
                "printer name must contain at least one alphanumeric character".into(),
            ));
        }
        if matches!(new.kind, PrinterKind::LocalBambu) && new.secret.as_deref().unwrap_or("").is_empty()
        {
            return Err(Error::Validation(
                "local printers require the LAN access code".into(),
            ));
        }

        let id = make_printer_id(new.address.trim(), name);

        // Single writer: the write lock is held across the flush so readers
        // never observe a mutation that is not yet durable.
        let mut cache = self.cache.write().await;
        if let Some(existing) = cache.get(&id) {
            debug!(printer_id = %id, "Printer already registered");
            return Ok(existing.clone());
        }

        let now = Utc::now();
        let printer = Printer {
            id: id.clone(),
            name: name.to_string(),
            kind: new.kind,
            address: new.address.trim().to_string(),
            secret: new.secret,
            serial: new.serial,
            mqtt_port: new.mqtt_port,
            stream_url_template: new.stream_url_template,
            api_url: new.api_url,
            relay_port: new.relay_port,
            created_at: now,
            updated_at: now,
        };
        self.repo.save(&printer).await?;
        cache.insert(id.clone(), printer.clone());

        info!(printer_id = %id, kind = %printer.kind, address = %printer.address, "Printer added");
        Ok(printer)
    }

    /// Remove a printer and its document. Returns the removed record so the
    /// caller can tear down whatever was attached to it.
    pub async fn remove(&self, id: &str) -> Result<Printer> {
        let mut cache = self.cache.write().await;
        let printer = cache
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("printer {}", id)))?;

        self.repo.delete(id).await?;
        cache.remove(id);

        info!(printer_id = %id, "Printer removed");
        Ok(printer)
    }

    /// Record the serial learned from a printer's first MQTT report.
    /// Locked read-modify-write; a no-op when the serial already matches.
    pub async fn update_serial(&self, id: &str, serial: &str) -> Result<()> {
        let mut cache = self.cache.write().await;
        let current = cache
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("printer {}", id)))?;

        if current.serial.as_deref() == Some(serial) {
            return Ok(());
        }

        let mut updated = current.clone();
        updated.serial = Some(serial.to_string());
        updated.updated_at = Utc::now();
        self.repo.save(&updated).await?;
        cache.insert(id.to_string(), updated);

        info!(printer_id = %id, serial = %serial, "Printer serial recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_printer(name: &str, address: &str) -> NewPrinter {
        NewPrinter {
            name: name.to_string(),
            kind: PrinterKind::LocalBambu,
            address: address.to_string(),
            secret: Some("34125678".to_string()),
            serial: None,
            mqtt_port: None,
            stream_url_template: None,
            api_url: None,
            relay_port: None,
        }
    }

    #[tokio::test]
    async fn test_add_persists_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let store = PrinterStore::open(dir.path()).await.unwrap();
        let added = store.add(new_printer("X1 Carbon", "10.1.2.3")).await.unwrap();
        assert_eq!(added.id, "printer_10_1_2_3_X1_Carbon");

        let reopened = PrinterStore::open(dir.path()).await.unwrap();
        let listed = reopened.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, added.id);
        assert_eq!(listed[0].name, "X1 Carbon");
    }

    #[tokio::test]
    async fn test_add_is_idempotent_on_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = PrinterStore::open(dir.path()).await.unwrap();

        let first = store.add(new_printer("A1", "10.1.2.3")).await.unwrap();
        let mut again = new_printer("A1", "10.1.2.3");
        again.secret = Some("different".to_string());
        let second = store.add(again).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.secret.as_deref(), Some("34125678"));
        assert_eq!(store.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_validation_failures_leave_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let store = PrinterStore::open(dir.path()).await.unwrap();

        let mut missing_name = new_printer("   ", "10.1.2.3");
        missing_name.secret = Some("123".to_string());
        assert!(matches!(
            store.add(missing_name).await,
            Err(Error::Validation(_))
        ));

        let mut missing_code = new_printer("A1", "10.1.2.3");
        missing_code.secret = None;
        assert!(matches!(
            store.add(missing_code).await,
            Err(Error::Validation(_))
        ));

        assert!(store.list().await.is_empty());
        assert!(PrinterStore::open(dir.path()).await.unwrap().list().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_unknown_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = PrinterStore::open(dir.path()).await.unwrap();
        assert!(matches!(
            store.remove("printer_nope").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_serial_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = PrinterStore::open(dir.path()).await.unwrap();
        let added = store.add(new_printer("P1S", "10.1.2.4")).await.unwrap();

        store.update_serial(&added.id, "01P00A332800001").await.unwrap();

        let reopened = PrinterStore::open(dir.path()).await.unwrap();
        assert_eq!(
            reopened.get(&added.id).await.unwrap().serial.as_deref(),
            Some("01P00A332800001")
        );
    }
}
