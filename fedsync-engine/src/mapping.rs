//! Versioned on-disk sync mapping configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use fedsync_types::SyncMapping;

use crate::error::{EngineError, EngineResult};

pub const MAPPING_FILE_VERSION: u32 = 1;

/// Root of the `mappings.json` document. The version gate lets a future
/// layout change fail loudly instead of misreading old files.
#[derive(Debug, Serialize, Deserialize)]
pub struct MappingFile {
    pub version: u32,
    pub mappings: Vec<SyncMapping>,
}

impl MappingFile {
    pub fn new(mappings: Vec<SyncMapping>) -> Self {
        Self {
            version: MAPPING_FILE_VERSION,
            mappings,
        }
    }
}

/// Loads sync mappings from `path`. A missing file is an empty mapping set,
/// not an error, so a fresh workspace can start with discovery alone.
pub fn load_mappings(path: &Path) -> EngineResult<Vec<SyncMapping>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)?;
    let file: MappingFile = serde_json::from_str(&raw)?;
    if file.version != MAPPING_FILE_VERSION {
        return Err(EngineError::MappingConfig(format!(
            "unsupported mapping file version {} (expected {})",
            file.version, MAPPING_FILE_VERSION
        )));
    }
    for m in &file.mappings {
        if m.source == m.target {
            return Err(EngineError::MappingConfig(format!(
                "mapping for table {} has identical source and target {}",
                m.table, m.source
            )));
        }
        fedsync_store::sanitize_identifier(&m.table)
            .map_err(|e| EngineError::MappingConfig(e.to_string()))?;
    }
    Ok(file.mappings)
}
