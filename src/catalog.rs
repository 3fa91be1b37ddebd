pub mod encoding;

pub use encoding::{CanonicalMap, EncodingError, MapRecord, Run};

use crate::models::{DialectId, GameMode};
use crate::pixels::PixelConverter;
use log::{info, warn};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to scan map directory: {0}")]
    Io(#[from] std::io::Error),
}

/// One loaded map: its canonical form plus the re-encoding for every
/// supported dialect, computed once at load.
#[derive(Debug)]
struct MapEntry {
    canonical: CanonicalMap,
    encodings: HashMap<DialectId, MapRecord>,
}

/// The map catalog: scans one subdirectory per game mode at startup, decodes
/// every map file to canonical runs, and serves per-dialect re-encodings.
/// Immutable after load; share via `Arc` and read without locking.
#[derive(Debug, Default)]
pub struct MapCatalog {
    modes: HashMap<GameMode, BTreeMap<String, MapEntry>>,
}

impl MapCatalog {
    pub fn empty() -> Self {
        MapCatalog::default()
    }

    /// Scan `<dir>/<game mode>/*.json`. Individual files that fail to parse,
    /// decode, or re-encode are skipped with a warning; the rest load. A
    /// missing directory yields an empty catalog.
    pub fn load(dir: &Path, converter: &PixelConverter) -> Result<Self, CatalogError> {
        let mut catalog = MapCatalog::default();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("map directory {} does not exist", dir.display());
                return Ok(catalog);
            }
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir_name = entry.file_name();
            let Some(mode) = dir_name.to_str().and_then(GameMode::from_tag) else {
                warn!("skipping unknown game mode directory {:?}", dir_name);
                continue;
            };
            catalog.load_mode(mode, &entry.path(), converter)?;
        }
        for (mode, maps) in &catalog.modes {
            info!("loaded {} maps for {mode}", maps.len());
        }
        Ok(catalog)
    }

    fn load_mode(
        &mut self,
        mode: GameMode,
        dir: &Path,
        converter: &PixelConverter,
    ) -> Result<(), CatalogError> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };
            let record: MapRecord = match std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|text| serde_json::from_str(&text).map_err(|e| e.to_string()))
            {
                Ok(record) => record,
                Err(e) => {
                    warn!("skipping map {}: {e}", path.display());
                    continue;
                }
            };
            match Self::build_entry(&record, converter) {
                Ok(map) => {
                    self.modes.entry(mode).or_default().insert(id, map);
                }
                Err(e) => warn!("skipping map {}: {e}", path.display()),
            }
        }
        Ok(())
    }

    fn build_entry(
        record: &MapRecord,
        converter: &PixelConverter,
    ) -> Result<MapEntry, EncodingError> {
        let canonical = encoding::decode(record, converter)?;
        let mut encodings = HashMap::new();
        for dialect in converter.formats() {
            match encoding::encode(
                &canonical,
                record.width,
                record.height,
                &record.scripts,
                dialect,
                converter,
            ) {
                Ok(encoded) => {
                    encodings.insert(dialect, encoded);
                }
                // Surface a dialect that cannot express this map (empty or
                // partial table) by omitting its encoding, not by failing
                // the whole map.
                Err(e) => warn!("map not servable as {dialect}: {e}"),
            }
        }
        Ok(MapEntry {
            canonical,
            encodings,
        })
    }

    pub fn list(&self, mode: GameMode) -> Vec<String> {
        self.modes
            .get(&mode)
            .map(|maps| maps.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has(&self, mode: GameMode, id: &str) -> bool {
        self.modes
            .get(&mode)
            .is_some_and(|maps| maps.contains_key(id))
    }

    pub fn get(&self, mode: GameMode, id: &str, format: DialectId) -> Option<&MapRecord> {
        self.modes.get(&mode)?.get(id)?.encodings.get(&format)
    }

    /// Canonical form of a map, independent of any dialect.
    pub fn canonical(&self, mode: GameMode, id: &str) -> Option<&CanonicalMap> {
        self.modes.get(&mode)?.get(id).map(|entry| &entry.canonical)
    }
}
