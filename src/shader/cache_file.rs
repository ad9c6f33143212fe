//! On-disk shader cache format.
//!
//! Native shader modules are not portable between devices or driver
//! versions, so the file stores descriptors and the loader recompiles them.
//! The file is a bincode-encoded [`CacheFile`]; its header is decoded on its
//! own first so a foreign or outdated file is rejected before the entries
//! are touched.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GraphicsError, GraphicsResult};
use crate::ids::ShaderHash;

use super::{ShaderDescriptor, ShaderLanguage, ShaderStage};

const MAGIC: [u8; 4] = *b"RCSC";
const VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct CacheHeader {
    magic: [u8; 4],
    version: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    hash: u64,
    stage: ShaderStage,
    language: ShaderLanguage,
    optimize: bool,
    debug: bool,
    entry_point: String,
    label: Option<String>,
    source: String,
    defines: Vec<(String, String)>,
}

impl CacheEntry {
    fn from_descriptor(descriptor: &ShaderDescriptor) -> Self {
        Self {
            hash: descriptor.hash().raw(),
            stage: descriptor.stage(),
            language: descriptor.language(),
            optimize: descriptor.optimize(),
            debug: descriptor.debug(),
            entry_point: descriptor.entry_point().to_owned(),
            label: descriptor.label.clone(),
            source: descriptor.source().to_owned(),
            defines: descriptor
                .defines()
                .map(|(name, value)| (name.to_owned(), value.to_owned()))
                .collect(),
        }
    }

    fn into_descriptor(self) -> (ShaderHash, ShaderDescriptor) {
        let mut descriptor = ShaderDescriptor::new(self.stage, self.source, self.entry_point)
            .with_language(self.language)
            .with_optimize(self.optimize)
            .with_debug(self.debug);
        for (name, value) in self.defines {
            descriptor = descriptor.with_define(name, value);
        }
        if let Some(label) = self.label {
            descriptor = descriptor.with_label(label);
        }
        (ShaderHash::from_raw(self.hash), descriptor)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    header: CacheHeader,
    entries: Vec<CacheEntry>,
}

pub(crate) fn write(path: &Path, descriptors: &[ShaderDescriptor]) -> GraphicsResult<()> {
    std::fs::write(path, encode(descriptors)?)?;
    Ok(())
}

pub(crate) fn read(path: &Path) -> GraphicsResult<Vec<(ShaderHash, ShaderDescriptor)>> {
    decode(&std::fs::read(path)?)
}

fn encode(descriptors: &[ShaderDescriptor]) -> GraphicsResult<Vec<u8>> {
    let file = CacheFile {
        header: CacheHeader {
            magic: MAGIC,
            version: VERSION,
        },
        entries: descriptors.iter().map(CacheEntry::from_descriptor).collect(),
    };
    bincode::serialize(&file).map_err(|e| GraphicsError::CacheFormat(e.to_string()))
}

fn decode(bytes: &[u8]) -> GraphicsResult<Vec<(ShaderHash, ShaderDescriptor)>> {
    let header: CacheHeader =
        bincode::deserialize(bytes).map_err(|e| GraphicsError::CacheFormat(e.to_string()))?;
    if header.magic != MAGIC {
        return Err(GraphicsError::CacheFormat("bad magic".into()));
    }
    if header.version != VERSION {
        return Err(GraphicsError::CacheFormat(format!(
            "unsupported version {}",
            header.version
        )));
    }

    let file: CacheFile =
        bincode::deserialize(bytes).map_err(|e| GraphicsError::CacheFormat(e.to_string()))?;
    Ok(file
        .entries
        .into_iter()
        .map(CacheEntry::into_descriptor)
        .collect())
}
