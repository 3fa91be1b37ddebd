use crate::models::DialectId;
use crate::pixels::lookup::LookupTable;
use log::warn;
use std::collections::{BTreeMap, HashMap};

/// Reserved "unknown/unmapped" canonical id. Every table slot defaults to it
/// and every failed translation yields it.
pub const SENTINEL: u8 = 0xFF;

/// Per-dialect translation tables. Numeric translation is plain array
/// indexing; string translation goes through the parallel maps.
struct ConversionTable {
    /// dialect numeric id → canonical id
    from: [u8; 256],
    /// canonical id → dialect numeric id
    to: [u8; 256],
    /// dialect string id → standard string id
    from_str: HashMap<String, String>,
    /// standard string id → dialect string id
    to_str: HashMap<String, String>,
}

impl ConversionTable {
    fn empty() -> Self {
        ConversionTable {
            from: [SENTINEL; 256],
            to: [SENTINEL; 256],
            from_str: HashMap::new(),
            to_str: HashMap::new(),
        }
    }
}

/// Tri-directional pixel-ID converter: dialect numeric/string ids ↔ the
/// canonical ids assigned by the authoritative lookup table.
///
/// Immutable after `build`; share via `Arc` and read without locking.
pub struct PixelConverter {
    tables: BTreeMap<DialectId, ConversionTable>,
    /// canonical id → standard string id
    standard_names: HashMap<u8, String>,
    /// standard string id → canonical id
    canonical_ids: HashMap<String, u8>,
}

impl PixelConverter {
    /// Build the tables from the parsed lookup table and one extractor result
    /// per dialect. An extractor result must be a JSON object mapping a
    /// dialect string id to its numeric id; anything else (the degenerate
    /// extractor that yields a bare constant included) leaves that dialect's
    /// table empty so every translation through it returns the sentinel.
    pub fn build(
        lookup: &LookupTable,
        extracted: &HashMap<DialectId, serde_json::Value>,
    ) -> Self {
        let mut standard_names = HashMap::new();
        let mut canonical_ids = HashMap::new();
        for row in lookup.rows() {
            if let Some(name) = row.names.get(&DialectId::Standard) {
                standard_names.insert(row.canonical, name.clone());
                canonical_ids.insert(name.clone(), row.canonical);
            }
        }

        let mut tables = BTreeMap::new();
        for (&dialect, value) in extracted {
            if dialect == DialectId::Standard {
                continue;
            }
            let mut table = ConversionTable::empty();
            match value.as_object() {
                Some(mapping) => {
                    for row in lookup.rows() {
                        let Some(dialect_name) = row.names.get(&dialect) else {
                            continue;
                        };
                        let Some(numeric) = mapping.get(dialect_name).and_then(|v| v.as_u64())
                        else {
                            continue;
                        };
                        if numeric > u8::MAX as u64 {
                            continue;
                        }
                        table.from[numeric as usize] = row.canonical;
                        table.to[row.canonical as usize] = numeric as u8;
                        if let Some(standard_name) = row.names.get(&DialectId::Standard) {
                            table
                                .from_str
                                .insert(dialect_name.clone(), standard_name.clone());
                            table
                                .to_str
                                .insert(standard_name.clone(), dialect_name.clone());
                        }
                    }
                }
                None => {
                    warn!(
                        "dialect {} extractor returned {} instead of an id map; \
                         its table stays empty",
                        dialect, value
                    );
                }
            }
            tables.insert(dialect, table);
        }

        PixelConverter {
            tables,
            standard_names,
            canonical_ids,
        }
    }

    /// All loaded dialects, excluding `standard`.
    pub fn formats(&self) -> Vec<DialectId> {
        self.tables.keys().copied().collect()
    }

    fn known(&self, dialect: DialectId) -> bool {
        dialect == DialectId::Standard || self.tables.contains_key(&dialect)
    }

    /// dialect numeric → canonical. `standard` is its own canonical form.
    pub fn to_canonical(&self, n: u8, dialect: DialectId) -> u8 {
        if dialect == DialectId::Standard {
            return n;
        }
        match self.tables.get(&dialect) {
            Some(table) => table.from[n as usize],
            None => SENTINEL,
        }
    }

    /// canonical → dialect numeric.
    pub fn from_canonical(&self, canonical: u8, dialect: DialectId) -> u8 {
        if dialect == DialectId::Standard {
            return canonical;
        }
        match self.tables.get(&dialect) {
            Some(table) => table.to[canonical as usize],
            None => SENTINEL,
        }
    }

    /// Translate one numeric pixel id between dialects. Constant-time array
    /// indexing; no allocation.
    pub fn convert_single(&self, n: u8, from: DialectId, to: DialectId) -> u8 {
        if from == to {
            return n;
        }
        if !self.known(from) || !self.known(to) {
            return SENTINEL;
        }
        let canonical = self.to_canonical(n, from);
        if canonical == SENTINEL {
            return SENTINEL;
        }
        self.from_canonical(canonical, to)
    }

    /// Translate every pixel-id byte of a packed grid, preserving counts and
    /// flag bytes. Allocates exactly one buffer of the input's length.
    ///
    /// The stream is framed as one header byte followed by up to 8 cells; a
    /// set header bit (MSB first) means the cell is a lone pixel-id byte, a
    /// clear bit means the pixel-id byte is followed by one extra byte that
    /// passes through untouched.
    pub fn convert_grid(&self, grid: &[u8], from: DialectId, to: DialectId) -> Vec<u8> {
        let mut out = grid.to_vec();
        if from == to {
            return out;
        }
        let mut i = 0;
        while i < grid.len() {
            let header = grid[i];
            let mut j = i + 1;
            for k in 0..8 {
                if j >= grid.len() {
                    break;
                }
                out[j] = self.convert_single(grid[j], from, to);
                j += 1;
                if header & (0x80 >> k) == 0 {
                    if j >= grid.len() {
                        break;
                    }
                    j += 1;
                }
            }
            i = j;
        }
        out
    }

    /// Translate a string pixel id between dialects; `"null"` on any failure.
    pub fn convert_str(&self, id: &str, from: DialectId, to: DialectId) -> String {
        if from == to {
            return id.to_string();
        }
        let standard = if from == DialectId::Standard {
            Some(id)
        } else {
            self.tables
                .get(&from)
                .and_then(|t| t.from_str.get(id))
                .map(String::as_str)
        };
        let Some(standard) = standard else {
            return "null".to_string();
        };
        if to == DialectId::Standard {
            return standard.to_string();
        }
        match self.tables.get(&to).and_then(|t| t.to_str.get(standard)) {
            Some(name) => name.clone(),
            None => "null".to_string(),
        }
    }

    /// Canonical id registered under a dialect string id.
    pub fn canonical_of_dialect_str(&self, id: &str, dialect: DialectId) -> Option<u8> {
        let standard = if dialect == DialectId::Standard {
            id
        } else {
            self.tables.get(&dialect)?.from_str.get(id)?
        };
        self.canonical_ids.get(standard).copied()
    }

    /// Dialect string id for a canonical id.
    pub fn dialect_str_of_canonical(&self, canonical: u8, dialect: DialectId) -> Option<&str> {
        let standard = self.standard_names.get(&canonical)?;
        if dialect == DialectId::Standard {
            return Some(standard);
        }
        self.tables
            .get(&dialect)?
            .to_str
            .get(standard)
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TABLE: &str = "\
id,rps,bps,psp,standard
0,air,00,0,air
1,stone,10,1,stone
2,grass,21,2,grass
3,water,30,3,water
";

    fn converter() -> PixelConverter {
        let lookup = LookupTable::from_csv(TABLE).unwrap();
        let mut extracted = HashMap::new();
        extracted.insert(
            DialectId::Rps,
            json!({ "air": 0, "stone": 5, "grass": 6, "water": 7 }),
        );
        extracted.insert(
            DialectId::Bps,
            json!({ "00": 0, "10": 11, "21": 12, "30": 13 }),
        );
        extracted.insert(DialectId::Psp, json!({ "0": 0, "1": 21, "2": 22 }));
        PixelConverter::build(&lookup, &extracted)
    }

    #[test]
    fn single_conversions_route_through_canonical() {
        let c = converter();
        // rps "stone" = 5, bps "stone" = 11
        assert_eq!(c.convert_single(5, DialectId::Rps, DialectId::Bps), 11);
        assert_eq!(c.convert_single(5, DialectId::Rps, DialectId::Standard), 1);
        assert_eq!(c.convert_single(1, DialectId::Standard, DialectId::Psp), 21);
        // identity
        assert_eq!(c.convert_single(200, DialectId::Rps, DialectId::Rps), 200);
    }

    #[test]
    fn unmapped_ids_become_sentinel() {
        let c = converter();
        // water (rps 7) exists in bps but not psp
        assert_eq!(
            c.convert_single(7, DialectId::Rps, DialectId::Psp),
            SENTINEL
        );
        assert_eq!(
            c.convert_single(250, DialectId::Rps, DialectId::Bps),
            SENTINEL
        );
    }

    #[test]
    fn round_trip_is_identity_where_defined() {
        let c = converter();
        for n in [0u8, 5, 6, 7] {
            let there = c.convert_single(n, DialectId::Rps, DialectId::Bps);
            if there != SENTINEL {
                assert_eq!(c.convert_single(there, DialectId::Bps, DialectId::Rps), n);
            }
        }
    }

    #[test]
    fn grid_translation_preserves_length_and_flags() {
        let c = converter();
        // header 0b1010_0000: cell0 lone, cell1 has an extra byte, cell2 lone,
        // then the stream ends.
        let grid = vec![0b1010_0000, 5, 6, 0x2A, 7];
        let out = c.convert_grid(&grid, DialectId::Rps, DialectId::Bps);
        assert_eq!(out.len(), grid.len());
        assert_eq!(out[0], grid[0]);
        assert_eq!(out[1], 11); // stone
        assert_eq!(out[2], 12); // grass
        assert_eq!(out[3], 0x2A); // extra byte untouched
        assert_eq!(out[4], 13); // water
    }

    #[test]
    fn grid_translation_handles_multiple_frames() {
        let c = converter();
        let mut grid = vec![0xFFu8];
        grid.extend_from_slice(&[5; 8]);
        grid.push(0xFF);
        grid.extend_from_slice(&[6; 8]);
        let out = c.convert_grid(&grid, DialectId::Rps, DialectId::Bps);
        assert_eq!(out[0], 0xFF);
        assert_eq!(&out[1..9], &[11; 8]);
        assert_eq!(out[9], 0xFF);
        assert_eq!(&out[10..18], &[12; 8]);
    }

    #[test]
    fn string_conversion_and_failure_literal() {
        let c = converter();
        assert_eq!(c.convert_str("stone", DialectId::Rps, DialectId::Bps), "10");
        assert_eq!(
            c.convert_str("stone", DialectId::Rps, DialectId::Standard),
            "stone"
        );
        assert_eq!(c.convert_str("lava", DialectId::Rps, DialectId::Bps), "null");
        assert_eq!(
            c.convert_str("water", DialectId::Rps, DialectId::Psp),
            "null"
        );
    }

    #[test]
    fn degenerate_extractor_leaves_table_empty() {
        let lookup = LookupTable::from_csv(TABLE).unwrap();
        let mut extracted = HashMap::new();
        extracted.insert(DialectId::Rps, json!({ "stone": 5 }));
        extracted.insert(DialectId::Bps, json!(1));
        let c = PixelConverter::build(&lookup, &extracted);
        assert_eq!(c.formats(), vec![DialectId::Rps, DialectId::Bps]);
        assert_eq!(
            c.convert_single(5, DialectId::Rps, DialectId::Bps),
            SENTINEL
        );
        assert_eq!(c.convert_str("stone", DialectId::Rps, DialectId::Bps), "null");
    }
}
