//! Symbol Dump
//!
//! Writes the broker's symbol universe to a JSON file as
//! `[{"id": .., "name": ..}, ..]`, sorted by name.

use std::path::Path;

use crate::domain::market_data::SymbolInfo;

/// Default output path for the dump binary.
pub const DEFAULT_DUMP_PATH: &str = "ctrader_symbols_dump.json";

/// Symbol dump error.
#[derive(Debug, thiserror::Error)]
pub enum SymbolDumpError {
    /// Serialization failed.
    #[error("failed to serialize symbols: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Writing the file failed.
    #[error("failed to write symbol dump: {0}")]
    Io(#[from] std::io::Error),
}

/// Sort `symbols` by name and write them to `path` as pretty JSON.
///
/// Returns the number of symbols written.
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub fn write_symbol_dump(
    path: impl AsRef<Path>,
    mut symbols: Vec<SymbolInfo>,
) -> Result<usize, SymbolDumpError> {
    symbols.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));

    let json = serde_json::to_string_pretty(&symbols)?;
    std::fs::write(path.as_ref(), json)?;

    tracing::info!(
        path = %path.as_ref().display(),
        count = symbols.len(),
        "Symbol dump written"
    );
    Ok(symbols.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: i64, name: &str) -> SymbolInfo {
        SymbolInfo {
            id,
            name: name.to_string(),
        }
    }

    #[test]
    fn test_dump_is_sorted_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("symbols.json");

        let written =
            write_symbol_dump(&path, vec![info(3, "USDJPY"), info(1, "EURUSD")]).unwrap();

        assert_eq!(written, 2);
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!([
                {"id": 1, "name": "EURUSD"},
                {"id": 3, "name": "USDJPY"}
            ])
        );
    }

    #[test]
    fn test_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("symbols.json");

        let result = write_symbol_dump(&path, vec![info(1, "EURUSD")]);
        assert!(matches!(result, Err(SymbolDumpError::Io(_))));
    }
}
