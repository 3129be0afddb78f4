#![deny(unused_must_use)]
#![forbid(unsafe_code)]
#![allow(clippy::upper_case_acronyms)]
// Don't allow dbg! prints in release.
#![cfg_attr(not(debug_assertions), deny(clippy::dbg_macro))]

pub use err::{PlfError, Result, ScanError, ScanResult};
pub use fragments::{extract_fragments, DecompressedFragment, FragmentKind, ZLIB_PROBE_WINDOW};
pub use model::{Address, BlockKind};
pub use materialize::{format_reference_address, materialize, ADDRESS_DOMAIN_TAG};
pub use plf_parser::{ParserSettings, PlfParser};
pub use raw_blocks::{extract_raw_blocks, RawBlockScan};
pub use reference_blocks::{resolve_reference_blocks, IDENT_NS};
pub use xml_decode::decode_xml_blocks;

pub use element_blocks::{
    extract_element_blocks, link_to_raw_blocks, link_to_reference_blocks, link_to_xml_blocks,
};

pub mod err;
pub mod model;

mod element_blocks;
mod fragments;
mod materialize;
mod patterns;
mod plf_parser;
mod raw_blocks;
mod reference_blocks;
mod utils;
mod xml_decode;

pub type FileOffset = usize;

// Rust runs the tests concurrently, so unless we synchronize logging access
// it will crash when attempting to run `cargo test` with some logging facilities.
#[cfg(test)]
use std::sync::Once;

#[cfg(test)]
static LOGGER_INIT: Once = Once::new();

#[cfg(test)]
pub fn ensure_env_logger_initialized() {
    use std::io::Write;

    LOGGER_INIT.call_once(|| {
        let mut builder = env_logger::Builder::from_default_env();
        builder
            .format(|buf, record| writeln!(buf, "[{}] - {}", record.level(), record.args()))
            .init();
    });
}
