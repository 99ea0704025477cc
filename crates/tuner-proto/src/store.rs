//! JSON persistence for the catalog and settings.
//!
//! Both records are rewritten wholesale on every mutation.  Writes go to a
//! sibling temp file first and are renamed into place, so a crash mid-write
//! never leaves a truncated file behind.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, CatalogRecord};
use crate::error::{RadioError, Result};
use crate::settings::Settings;

/// Write side of persistence, as seen by the controller.  Each call must
/// either fully succeed or leave the previous file in place.
#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    async fn save_catalog(&self, catalog: &Catalog) -> Result<()>;
    async fn save_settings(&self, settings: &Settings) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct JsonStore {
    packs_file: PathBuf,
    settings_file: PathBuf,
}

impl JsonStore {
    pub fn new(packs_file: PathBuf, settings_file: PathBuf) -> Self {
        Self {
            packs_file,
            settings_file,
        }
    }

    /// Load both records.  Missing or unreadable files fall back to an empty
    /// catalog / default settings; the daemon must come up either way.
    pub fn load(&self) -> (Catalog, Settings) {
        let catalog = match read_json::<CatalogRecord>(&self.packs_file) {
            Some(record) => Catalog::from_record(record),
            None => Catalog::default(),
        };
        let settings = read_json::<Settings>(&self.settings_file)
            .unwrap_or_default()
            .normalized();
        info!(
            "store: loaded {} packs (active {:?}) from {}",
            catalog.packs.len(),
            catalog.active_pack_id,
            self.packs_file.display()
        );
        (catalog, settings)
    }
}

#[async_trait]
impl Persistence for JsonStore {
    async fn save_catalog(&self, catalog: &Catalog) -> Result<()> {
        write_json_atomic(&self.packs_file, &catalog.to_record()).await
    }

    async fn save_settings(&self, settings: &Settings) -> Result<()> {
        write_json_atomic(&self.settings_file, settings).await
    }
}

/// Read and parse a JSON file, logging (not failing) on any problem.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("store: {} not found, using defaults", path.display());
            return None;
        }
        Err(e) => {
            warn!("store: failed to read {}: {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("store: invalid JSON in {}: {}", path.display(), e);
            None
        }
    }
}

pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| RadioError::Persistence(format!("serialise {}: {}", path.display(), e)))?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| persistence_err(parent, e))?;
    }

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json)
        .await
        .map_err(|e| persistence_err(&tmp, e))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(persistence_err(path, e));
    }
    debug!("store: wrote {}", path.display());
    Ok(())
}

fn persistence_err(path: &Path, e: std::io::Error) -> RadioError {
    RadioError::Persistence(format!("{}: {}", path.display(), e))
}
