// src/schema.rs

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use schemars::schema_for;

use crate::{config::RuntimeConfig, graph::GraphDefinition};

/// Write the JSON schemas for graph definitions and runtime config into `out_dir`.
pub fn write_schema(out_dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("creating schema directory {}", out_dir.display()))?;

    let schemas = [
        ("graph.schema.json", serde_json::to_string_pretty(&schema_for!(GraphDefinition))?),
        (
            "runtime-config.schema.json",
            serde_json::to_string_pretty(&schema_for!(RuntimeConfig))?,
        ),
    ];

    let mut written = Vec::with_capacity(schemas.len());
    for (file, json) in schemas {
        let path = out_dir.join(file);
        fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
        written.push(path);
    }
    Ok(written)
}
