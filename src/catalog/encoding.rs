use crate::models::DialectId;
use crate::pixels::{PixelConverter, SENTINEL};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// A run of identical cells: `(canonical id, count)`.
pub type Run = (u8, u32);

/// One map file as stored on disk and as served per dialect. `data`,
/// `placeableData`, and `teamData` are encoded according to `format`;
/// `rotationData` exists only for the `bps` dialect's paired streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapRecord {
    pub format: DialectId,
    pub width: u32,
    pub height: u32,
    pub data: String,
    #[serde(rename = "placeableData", default)]
    pub placeable_data: [String; 2],
    #[serde(rename = "teamData", default)]
    pub team_data: String,
    #[serde(rename = "rotationData", default, skip_serializing_if = "Option::is_none")]
    pub rotation_data: Option<String>,
    #[serde(default)]
    pub scripts: HashMap<String, String>,
}

/// Dialect-independent form of a parsed map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalMap {
    pub data: Vec<Run>,
    pub placeable: [Vec<Run>; 2],
    pub team: Vec<Run>,
}

#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("malformed run '{0}'")]
    MalformedRun(String),
    #[error("{stream} stream covers {actual} cells, map is {expected}")]
    WrongCellCount {
        stream: &'static str,
        expected: u64,
        actual: u64,
    },
    #[error("bps map needs rotationData")]
    MissingRotation,
    #[error("canonical id {canonical} has no {dialect} string id")]
    UnmappedPixel { canonical: u8, dialect: DialectId },
    #[error("bps string id '{0}' is not a pixel+rotation pair")]
    BadPairId(String),
}

fn to_base36(mut n: u32) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap()
}

fn split_run(piece: &str) -> Result<(&str, &str), EncodingError> {
    piece
        .split_once('-')
        .ok_or_else(|| EncodingError::MalformedRun(piece.to_string()))
}

fn parse_radix(piece: &str, text: &str, radix: u32) -> Result<u32, EncodingError> {
    u32::from_str_radix(text, radix).map_err(|_| EncodingError::MalformedRun(piece.to_string()))
}

fn check_cells(stream: &'static str, runs: &[Run], expected: u64) -> Result<(), EncodingError> {
    let actual: u64 = runs.iter().map(|&(_, count)| count as u64).sum();
    if actual != expected {
        return Err(EncodingError::WrongCellCount {
            stream,
            expected,
            actual,
        });
    }
    Ok(())
}

fn compress<I: IntoIterator<Item = u8>>(cells: I) -> Vec<Run> {
    let mut runs: Vec<Run> = Vec::new();
    for cell in cells {
        match runs.last_mut() {
            Some((id, count)) if *id == cell => *count += 1,
            _ => runs.push((cell, 1)),
        }
    }
    runs
}

/// Parse `id-count` runs with both fields in the given radix, translating ids
/// through a caller-supplied map.
fn parse_runs(
    text: &str,
    radix: u32,
    mut id_of: impl FnMut(&str, u32) -> Result<u8, EncodingError>,
) -> Result<Vec<Run>, EncodingError> {
    let mut runs = Vec::new();
    if text.is_empty() {
        return Ok(runs);
    }
    for piece in text.split(':') {
        let (id_text, count_text) = split_run(piece)?;
        let raw = parse_radix(piece, id_text, radix)?;
        let count = parse_radix(piece, count_text, radix)?;
        if raw > u8::MAX as u32 {
            return Err(EncodingError::MalformedRun(piece.to_string()));
        }
        runs.push((id_of(id_text, raw)?, count));
    }
    Ok(runs)
}

/// Alternating boolean runs: bare counts, first run is `false`.
fn parse_alternating(text: &str, radix: u32) -> Result<Vec<Run>, EncodingError> {
    let mut runs = Vec::new();
    if text.is_empty() {
        return Ok(runs);
    }
    for (idx, piece) in text.split(':').enumerate() {
        let count = parse_radix(piece, piece, radix)?;
        if count > 0 {
            runs.push(((idx % 2) as u8, count));
        }
    }
    Ok(runs)
}

fn encode_alternating(runs: &[Run]) -> String {
    // normalize to an alternating sequence starting at false
    let mut counts: Vec<u32> = Vec::new();
    let mut current: u8 = 0;
    let mut pending: u32 = 0;
    for &(value, count) in runs {
        if value == current {
            pending += count;
        } else {
            counts.push(pending);
            current = value;
            pending = count;
        }
    }
    counts.push(pending);
    counts
        .iter()
        .map(|&c| format!("{c:x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Expand `symbol-count` runs (base-36 counts) into a flat symbol stream.
fn expand_symbol_runs(text: &str, expected: u64) -> Result<Vec<String>, EncodingError> {
    let mut flat = Vec::new();
    if !text.is_empty() {
        for piece in text.split(':') {
            let (symbol, count_text) = split_run(piece)?;
            let count = parse_radix(piece, count_text, 36)?;
            if flat.len() as u64 + count as u64 > expected {
                return Err(EncodingError::WrongCellCount {
                    stream: "data",
                    expected,
                    actual: flat.len() as u64 + count as u64,
                });
            }
            for _ in 0..count {
                flat.push(symbol.to_string());
            }
        }
    }
    if flat.len() as u64 != expected {
        return Err(EncodingError::WrongCellCount {
            stream: "data",
            expected,
            actual: flat.len() as u64,
        });
    }
    Ok(flat)
}

fn encode_symbol_runs(symbols: impl IntoIterator<Item = (String, u32)>) -> String {
    let mut runs: Vec<(String, u32)> = Vec::new();
    for (symbol, count) in symbols {
        match runs.last_mut() {
            Some((s, c)) if *s == symbol => *c += count,
            _ => runs.push((symbol, count)),
        }
    }
    runs.iter()
        .map(|(s, c)| format!("{s}-{}", to_base36(*c)))
        .collect::<Vec<_>>()
        .join(":")
}

/// Decode a map record into canonical runs.
pub fn decode(record: &MapRecord, converter: &PixelConverter) -> Result<CanonicalMap, EncodingError> {
    let cells = record.width as u64 * record.height as u64;
    match record.format {
        DialectId::Rps => {
            let data = parse_runs(&record.data, 16, |_, raw| {
                Ok(converter.to_canonical(raw as u8, DialectId::Rps))
            })?;
            check_cells("data", &data, cells)?;
            let placeable = [
                parse_alternating(&record.placeable_data[0], 16)?,
                parse_alternating(&record.placeable_data[1], 16)?,
            ];
            let team = parse_runs(&record.team_data, 16, |_, raw| Ok(raw as u8))?;
            Ok(CanonicalMap {
                data,
                placeable,
                team,
            })
        }
        DialectId::Bps => {
            let rotation_text = record
                .rotation_data
                .as_deref()
                .ok_or(EncodingError::MissingRotation)?;
            let pixels = expand_symbol_runs(&record.data, cells)?;
            let rotations = expand_symbol_runs(rotation_text, cells)?;
            let data = compress((0..cells as usize).map(|i| {
                let pair = format!("{}{}", pixels[i], rotations[i]);
                converter
                    .canonical_of_dialect_str(&pair, DialectId::Bps)
                    .unwrap_or(SENTINEL)
            }));
            let placeable = [
                parse_runs(&record.placeable_data[0], 36, |_, raw| Ok(raw as u8))?,
                parse_runs(&record.placeable_data[1], 36, |_, raw| Ok(raw as u8))?,
            ];
            let team = parse_runs(&record.team_data, 36, |_, raw| Ok(raw as u8))?;
            Ok(CanonicalMap {
                data,
                placeable,
                team,
            })
        }
        DialectId::Psp => {
            let mut data = Vec::new();
            if !record.data.is_empty() {
                for piece in record.data.split('|') {
                    let (id_text, count_text) = piece
                        .split_once('~')
                        .ok_or_else(|| EncodingError::MalformedRun(piece.to_string()))?;
                    // discard an appended `-prefixed suffix
                    let id_text = id_text.split('`').next().unwrap_or(id_text);
                    let raw = parse_radix(piece, id_text, 36)?;
                    let count = parse_radix(piece, count_text, 36)?;
                    if raw > u8::MAX as u32 {
                        return Err(EncodingError::MalformedRun(piece.to_string()));
                    }
                    data.push((converter.to_canonical(raw as u8, DialectId::Psp), count));
                }
            }
            check_cells("data", &data, cells)?;
            Ok(CanonicalMap {
                data,
                placeable: [Vec::new(), Vec::new()],
                team: Vec::new(),
            })
        }
        DialectId::Standard => Err(EncodingError::MalformedRun(
            "maps are stored in a client dialect, not 'standard'".to_string(),
        )),
    }
}

/// Re-encode a canonical map into one dialect's string rules.
pub fn encode(
    canonical: &CanonicalMap,
    width: u32,
    height: u32,
    scripts: &HashMap<String, String>,
    dialect: DialectId,
    converter: &PixelConverter,
) -> Result<MapRecord, EncodingError> {
    let mut record = MapRecord {
        format: dialect,
        width,
        height,
        data: String::new(),
        placeable_data: [String::new(), String::new()],
        team_data: String::new(),
        rotation_data: None,
        scripts: scripts.clone(),
    };
    match dialect {
        DialectId::Rps => {
            record.data = canonical
                .data
                .iter()
                .map(|&(id, count)| {
                    let numeric = converter.from_canonical(id, DialectId::Rps);
                    format!("{numeric:x}-{count:x}")
                })
                .collect::<Vec<_>>()
                .join(":");
            for side in 0..2 {
                if !canonical.placeable[side].is_empty() {
                    record.placeable_data[side] = encode_alternating(&canonical.placeable[side]);
                }
            }
            record.team_data = canonical
                .team
                .iter()
                .map(|&(team, count)| format!("{team:x}-{count:x}"))
                .collect::<Vec<_>>()
                .join(":");
        }
        DialectId::Bps => {
            let mut pixel_runs = Vec::with_capacity(canonical.data.len());
            let mut rotation_runs = Vec::with_capacity(canonical.data.len());
            for &(id, count) in &canonical.data {
                let pair = converter
                    .dialect_str_of_canonical(id, DialectId::Bps)
                    .ok_or(EncodingError::UnmappedPixel {
                        canonical: id,
                        dialect,
                    })?;
                let mut chars = pair.chars();
                let (Some(pixel), Some(rotation), None) =
                    (chars.next(), chars.next(), chars.next())
                else {
                    return Err(EncodingError::BadPairId(pair.to_string()));
                };
                pixel_runs.push((pixel.to_string(), count));
                rotation_runs.push((rotation.to_string(), count));
            }
            record.data = encode_symbol_runs(pixel_runs);
            record.rotation_data = Some(encode_symbol_runs(rotation_runs));
            for side in 0..2 {
                record.placeable_data[side] = canonical.placeable[side]
                    .iter()
                    .map(|&(idx, count)| format!("{}-{}", to_base36(idx as u32), to_base36(count)))
                    .collect::<Vec<_>>()
                    .join(":");
            }
            record.team_data = canonical
                .team
                .iter()
                .map(|&(team, count)| format!("{}-{}", to_base36(team as u32), to_base36(count)))
                .collect::<Vec<_>>()
                .join(":");
        }
        DialectId::Psp => {
            record.data = canonical
                .data
                .iter()
                .map(|&(id, count)| {
                    let numeric = converter.from_canonical(id, DialectId::Psp);
                    format!("{}~{}", to_base36(numeric as u32), to_base36(count))
                })
                .collect::<Vec<_>>()
                .join("|");
            // psp carries no placeable or team grid
        }
        DialectId::Standard => {
            return Err(EncodingError::MalformedRun(
                "maps are not served in 'standard'".to_string(),
            ))
        }
    }
    Ok(record)
}
