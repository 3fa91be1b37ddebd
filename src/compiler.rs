pub mod emit;
pub mod exec;
pub mod lexer;
pub mod parser;

pub use emit::emit;
pub use exec::{ControllerHost, ExecError, Value};
pub use parser::{compile, Program};

use crate::models::DialectId;
use crate::pixels::PixelConverter;
use log::{info, warn};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("unknown pixel literal '{{{literal}}}'")]
    PixelId { literal: String },
}

impl CompileError {
    pub(crate) fn syntax(line: usize, message: impl Into<String>) -> Self {
        CompileError::Syntax {
            line,
            message: message.into(),
        }
    }
}

/// Controller scripts compiled at startup: one emitted text per source file
/// per dialect. A script that fails to compile, or a dialect that cannot
/// express one of its pixel literals, is simply not served.
#[derive(Debug, Default)]
pub struct ControllerSet {
    compiled: HashMap<String, HashMap<DialectId, String>>,
}

impl ControllerSet {
    pub fn empty() -> Self {
        ControllerSet::default()
    }

    /// Compile every `.psa` file under `dir` (recursively; the serving path
    /// is the `/`-joined path relative to `dir`, without the extension).
    pub fn load(dir: &Path, converter: &PixelConverter) -> Self {
        let mut set = ControllerSet::default();
        set.load_dir(dir, String::new(), converter);
        info!("compiled {} controller scripts", set.compiled.len());
        set
    }

    fn load_dir(&mut self, dir: &Path, prefix: String, converter: &PixelConverter) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                if prefix.is_empty() {
                    warn!("controller directory {} not readable: {e}", dir.display());
                }
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if path.is_dir() {
                let child_prefix = if prefix.is_empty() {
                    name.to_string()
                } else {
                    format!("{prefix}/{name}")
                };
                self.load_dir(&path, child_prefix, converter);
                continue;
            }
            let Some(stem) = name.strip_suffix(".psa") else {
                continue;
            };
            let key = if prefix.is_empty() {
                stem.to_string()
            } else {
                format!("{prefix}/{stem}")
            };
            let source = match std::fs::read_to_string(&path) {
                Ok(source) => source,
                Err(e) => {
                    warn!("cannot read controller {}: {e}", path.display());
                    continue;
                }
            };
            let program = match compile(&source) {
                Ok(program) => program,
                Err(e) => {
                    warn!("controller {key} failed to compile: {e}");
                    continue;
                }
            };
            let mut per_dialect = HashMap::new();
            for dialect in converter.formats() {
                match emit(&program, dialect, converter) {
                    Ok(text) => {
                        per_dialect.insert(dialect, text);
                    }
                    Err(e) => warn!("controller {key} not emitted for {dialect}: {e}"),
                }
            }
            self.compiled.insert(key, per_dialect);
        }
    }

    pub fn get(&self, path: &str, dialect: DialectId) -> Option<&str> {
        self.compiled.get(path)?.get(&dialect).map(String::as_str)
    }

    pub fn has(&self, path: &str) -> bool {
        self.compiled.contains_key(path)
    }
}
