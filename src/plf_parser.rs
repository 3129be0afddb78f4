//! The driver: load a container, run the passes in order, emit addresses.

use crate::element_blocks::{
    extract_element_blocks, link_to_raw_blocks, link_to_reference_blocks, link_to_xml_blocks,
};
use crate::err::{PlfError, Result};
use crate::fragments::extract_fragments;
use crate::materialize::materialize;
use crate::model::Address;
use crate::raw_blocks::extract_raw_blocks;
use crate::reference_blocks::resolve_reference_blocks;
use crate::xml_decode::decode_xml_blocks;

use log::warn;
use std::fs;
use std::io::Write;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct ParserSettings {
    max_reference_depth: usize,
}

impl Default for ParserSettings {
    fn default() -> Self {
        ParserSettings {
            max_reference_depth: 32,
        }
    }
}

impl ParserSettings {
    pub fn new() -> Self {
        Default::default()
    }

    /// Bound on nested reference expansion. Inputs are expected to be
    /// acyclic; the bound keeps corrupt containers from recursing forever.
    pub fn max_reference_depth(mut self, depth: usize) -> Self {
        self.max_reference_depth = depth;
        self
    }

    pub fn get_max_reference_depth(&self) -> usize {
        self.max_reference_depth
    }
}

/// The container parser. Owns the byte buffer; every pass reads it through
/// a shared immutable view.
#[derive(Debug)]
pub struct PlfParser {
    data: Vec<u8>,
    settings: ParserSettings,
}

impl PlfParser {
    /// Attempt to load a container from disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|source| PlfError::FailedToOpenFile {
            source,
            path: path.to_path_buf(),
        })?;
        Ok(Self::from_buffer(data))
    }

    pub fn from_buffer(data: Vec<u8>) -> Self {
        PlfParser {
            data,
            settings: ParserSettings::default(),
        }
    }

    pub fn with_configuration(mut self, settings: ParserSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Run the pipeline and collect the flat address list.
    ///
    /// Per-record failures inside the passes are logged and skipped; this
    /// never fails once the buffer is loaded.
    pub fn addresses(&self) -> Vec<Address> {
        let fragments = extract_fragments(&self.data);
        let reference_blocks = resolve_reference_blocks(&self.data, &fragments);
        let scan = extract_raw_blocks(&self.data);
        let xml_blocks = decode_xml_blocks(&self.data, &fragments);

        let mut elements = extract_element_blocks(&self.data, &scan.blocks);
        link_to_raw_blocks(&mut elements, &scan.blocks);
        link_to_reference_blocks(&mut elements, &reference_blocks, &scan.blocks);
        link_to_xml_blocks(&mut elements, &xml_blocks);

        if elements.is_empty() {
            // Reorganized containers evict earlier records upstream; nothing
            // to reconstruct, just say so.
            warn!("no element blocks found; the container may have been reorganized");
        }

        materialize(&elements, &xml_blocks, &self.settings)
    }

    /// Write the export file: one `<name>, <reference_address>` line per row.
    pub fn write_export<W: Write>(&self, writer: &mut W) -> Result<()> {
        for address in self.addresses() {
            writeln!(writer, "{}, {}", address.name, address.reference_address)?;
        }
        Ok(())
    }
}
