//! Loading declared schemas from disk.

use std::path::Path;

use anyhow::{bail, Context, Result};
use restraint_core::rbac::DeclaredSchema;

/// Parse a schema file, picking the format from its extension.
pub fn load_schema(path: &Path) -> Result<DeclaredSchema> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;

    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    let schema = match extension {
        "toml" => DeclaredSchema::from_toml_str(&content)?,
        "json" => DeclaredSchema::from_json_str(&content)?,
        "yaml" | "yml" => serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?,
        other => bail!("Unsupported schema format '{}' for {}", other, path.display()),
    };

    schema.validate()?;
    Ok(schema)
}
