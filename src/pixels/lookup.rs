use crate::models::DialectId;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("failed to read lookup table: {0}")]
    Io(#[from] std::io::Error),
    #[error("lookup table csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("lookup table has no '{0}' column")]
    MissingColumn(String),
    #[error("row {row}: invalid canonical id '{value}'")]
    BadCanonicalId { row: usize, value: String },
}

/// One row of the authoritative lookup table: a canonical numeric id and the
/// string id each dialect uses for it.
#[derive(Debug, Clone)]
pub struct LookupRow {
    pub canonical: u8,
    pub names: HashMap<DialectId, String>,
}

/// The parsed authoritative table. First CSV column is the canonical numeric
/// id; the remaining columns are string ids keyed by the header row (one
/// column per dialect plus `standard`).
#[derive(Debug, Clone, Default)]
pub struct LookupTable {
    rows: Vec<LookupRow>,
}

impl LookupTable {
    pub fn from_path(path: &Path) -> Result<Self, LookupError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_csv(&text)
    }

    pub fn from_csv(text: &str) -> Result<Self, LookupError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(text.as_bytes());

        let headers = reader.headers()?.clone();
        let mut columns: Vec<(usize, DialectId)> = Vec::new();
        for (idx, name) in headers.iter().enumerate().skip(1) {
            if let Some(dialect) = DialectId::from_tag(name) {
                columns.push((idx, dialect));
            }
        }
        if !columns.iter().any(|(_, d)| *d == DialectId::Standard) {
            return Err(LookupError::MissingColumn("standard".to_string()));
        }

        let mut rows = Vec::new();
        for (row_idx, record) in reader.records().enumerate() {
            let record = record?;
            let raw = record.get(0).unwrap_or("");
            let canonical: u8 = raw.parse().map_err(|_| LookupError::BadCanonicalId {
                row: row_idx + 1,
                value: raw.to_string(),
            })?;
            let mut names = HashMap::new();
            for &(col, dialect) in &columns {
                if let Some(value) = record.get(col) {
                    if !value.is_empty() {
                        names.insert(dialect, value.to_string());
                    }
                }
            }
            rows.push(LookupRow { canonical, names });
        }
        Ok(LookupTable { rows })
    }

    pub fn rows(&self) -> &[LookupRow] {
        &self.rows
    }

    /// The canonical id registered under a dialect's string id, if any.
    pub fn canonical_for(&self, dialect: DialectId, name: &str) -> Option<u8> {
        self.rows
            .iter()
            .find(|row| row.names.get(&dialect).map(String::as_str) == Some(name))
            .map(|row| row.canonical)
    }
}
