//! Write key-table documents

use std::path::Path;

use crate::error::ConfigError;
use crate::model::KeyRow;

/// Render key-table rows as a KDL document.
///
/// Rows are written in ascending code order with codes in 8-digit hex, so a
/// table saved and loaded again produces the same document.
pub fn generate_key_table(rows: &[KeyRow]) -> String {
    let mut sorted: Vec<&KeyRow> = rows.iter().collect();
    sorted.sort_by_key(|row| row.code);

    let mut output = String::new();
    output.push_str("// virtual-input key table\n");
    output.push_str("// code: raw scan code, key: output code, args: modifiers\n\n");

    for row in sorted {
        output.push_str(&format!("key code=0x{:08x} key={}", row.code, row.key));
        for modifier in row.modifiers.iter() {
            output.push_str(&format!(" \"{}\"", modifier.name()));
        }
        output.push('\n');
    }

    output
}

/// Write key-table rows to `path`, creating parent directories as needed
pub fn write_key_table(path: &Path, rows: &[KeyRow]) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    std::fs::write(path, generate_key_table(rows))?;
    tracing::debug!("Wrote {} key rows to {}", rows.len(), path.display());
    Ok(())
}
