use log::debug;
use serde::Serialize;
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::region::{Module, ModuleError, ModuleFile};

/// Errors that can occur while loading or writing module files
#[derive(Error, Debug)]
pub enum ParseError {
    /// The file is not valid JSON or does not match the module format
    #[error("Failed to parse module: {0}")]
    Json(#[from] serde_json::Error),

    /// The module parsed but violates a structural invariant
    #[error("Invalid module: {0}")]
    Module(#[from] ModuleError),

    /// I/O error when reading/writing files
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

fn io_error(path: &Path, source: std::io::Error) -> ParseError {
    ParseError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Parse a module from its JSON text and validate it
///
/// # Errors
/// Returns `ParseError::Json` for malformed text and `ParseError::Module` if
/// the region tree or array table is structurally invalid.
pub fn parse_module(text: &str) -> Result<Module, ParseError> {
    debug!("Parsing module ({} chars)", text.len());
    let file: ModuleFile = serde_json::from_str(text)?;
    let module = Module::from_file(file)?;
    debug!("Parsed module '{}' with {} regions", module.name, module.len());
    Ok(module)
}

pub fn load_module_file(path: impl AsRef<Path>) -> Result<Module, ParseError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| io_error(path, e))?;
    parse_module(&text)
}

/// Pretty-printed JSON of the module (directives included, metrics excluded)
pub fn dump_module(module: &Module) -> Result<String, ParseError> {
    Ok(serde_json::to_string_pretty(&module.to_file())?)
}

pub fn save_module_file(module: &Module, path: impl AsRef<Path>) -> Result<(), ParseError> {
    let path = path.as_ref();
    fs::write(path, dump_module(module)?).map_err(|e| io_error(path, e))?;
    debug!("Wrote module '{}' to {}", module.name, path.display());
    Ok(())
}

/// Write any serializable report as pretty JSON
pub fn save_json<T: Serialize>(value: &T, path: impl AsRef<Path>) -> Result<(), ParseError> {
    let path = path.as_ref();
    let text = serde_json::to_string_pretty(value)?;
    fs::write(path, text).map_err(|e| io_error(path, e))
}
