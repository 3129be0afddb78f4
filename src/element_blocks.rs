//! Pass 4: locate `BIVE:`/`BI:` element headers, classify each element by its
//! name occurrences, and cross-link elements to the raw, reference, and XML
//! symbol namespaces.
//!
//! Linking is done through lookup maps built here and discarded afterwards;
//! the element blocks themselves carry only indices and names.

use crate::model::{
    BlockKind, ElementBlock, ElementKind, RawBlock, ReferenceBlock, XmlBlock,
};
use crate::patterns;
use crate::utils::bytes;

use log::{debug, warn};
use std::collections::HashMap;

/// A size prefix of 95 marks a displaced root header; the real prefix sits
/// one byte earlier.
const DISPLACED_ROOT_PREFIX: u8 = 95;

pub fn extract_element_blocks(data: &[u8], raw_blocks: &[RawBlock]) -> Vec<ElementBlock> {
    let mut elements = Vec::new();
    scan_root_headers(data, raw_blocks, &mut elements);
    scan_member_headers(data, raw_blocks, &mut elements);
    let elements = dedup_by_id(elements);
    debug!("extracted {} element blocks", elements.len());
    elements
}

fn scan_root_headers(data: &[u8], raw_blocks: &[RawBlock], elements: &mut Vec<ElementBlock>) {
    for m in patterns::root_header().find_iter(data) {
        let start = m.start();
        if start == 0 {
            continue;
        }
        let mut size = data[start - 1] as usize;
        if size as u8 == DISPLACED_ROOT_PREFIX && start >= 2 {
            size = data[start - 2] as usize;
        }
        let end = (start + size).min(data.len());
        let block_data = &data[start..end];

        let Some(caps) = patterns::root_block_data().captures(block_data) else {
            debug!("root header at {start} has no parseable block data");
            continue;
        };
        let name = bytes::ascii_string(caps.get(2).expect("name group").as_bytes());
        let guid = bytes::ascii_string(caps.get(3).expect("guid group").as_bytes());

        emit_elements(
            data,
            raw_blocks,
            elements,
            ElementKind::Root,
            guid,
            name,
            start,
        );
    }
}

fn scan_member_headers(data: &[u8], raw_blocks: &[RawBlock], elements: &mut Vec<ElementBlock>) {
    for m in patterns::member_header().find_iter(data) {
        let start = m.start();
        if start == 0 {
            continue;
        }
        // The 16-bit size is read one byte early, overlapping the `B` of the
        // prefix. The window is clamped instead of rejected, so the inner
        // pattern still sees the header.
        let size = bytes::read_u16_le(data, start - 1).unwrap_or(0) as usize;
        let end = (start + size).min(data.len());
        let block_data = &data[start..end];

        let Some(caps) = patterns::member_block_data().captures(block_data) else {
            debug!("member header at {start} has no parseable block data");
            continue;
        };
        let scope = bytes::ascii_string(caps.get(1).expect("scope group").as_bytes());
        if scope == "Values" {
            continue;
        }
        let name = bytes::ascii_string(caps.get(2).expect("name group").as_bytes());
        let guid = bytes::ascii_string(caps.get(3).expect("guid group").as_bytes());

        emit_elements(
            data,
            raw_blocks,
            elements,
            ElementKind::Member,
            format!("{scope}:{guid}"),
            name,
            start,
        );
    }
}

/// Emit one element per classified occurrence of `name`; fall back to the
/// raw-block names, then to a single UNDEFINED element at offset 0.
#[allow(clippy::too_many_arguments)]
fn emit_elements(
    data: &[u8],
    raw_blocks: &[RawBlock],
    elements: &mut Vec<ElementBlock>,
    element_kind: ElementKind,
    id: String,
    name: String,
    header_offset: usize,
) {
    let element = |kind, block_byte_offset| ElementBlock {
        element_kind,
        id: id.clone(),
        name: name.clone(),
        kind,
        block_byte_offset,
        data_byte_offset: header_offset,
        address: 0,
        raw_block: None,
        reference_block: String::new(),
        xml_block: None,
    };

    let classified = classify_occurrences(data, &name);
    if !classified.is_empty() {
        for (offset, kind) in classified {
            elements.push(element(kind, offset));
        }
        return;
    }

    if let Some((offset, kind)) = classify_from_raw_blocks(data, &name, raw_blocks) {
        elements.push(element(kind, offset));
        return;
    }

    warn!(
        "{}",
        crate::err::ScanError::UnclassifiedBlock {
            name: name.clone(),
            offset: header_offset,
        }
    );
    elements.push(element(BlockKind::Undefined, 0));
}

/// Occurrences of `name` whose two preceding ASCII bytes map to a block kind.
fn classify_occurrences(data: &[u8], name: &str) -> Vec<(usize, BlockKind)> {
    let mut out = Vec::new();
    for j in find_occurrences(data, name.as_bytes()) {
        if j < 3 {
            continue;
        }
        if let Some(kind) = BlockKind::from_prefix(&data[j - 3..j - 1]) {
            out.push((j, kind));
        }
    }
    out
}

/// Fallback: a raw block whose name contains the element name, with the byte
/// before the matched substring equal to the substring's self-counting
/// length prefix.
fn classify_from_raw_blocks(
    data: &[u8],
    name: &str,
    raw_blocks: &[RawBlock],
) -> Option<(usize, BlockKind)> {
    for raw in raw_blocks {
        let Some(k) = raw.name.find(name) else {
            continue;
        };
        let pos = raw.name_offset + k;
        if pos == 0 {
            continue;
        }
        if bytes::read_u8(data, pos - 1) == Some((name.len() + 1) as u8) {
            return Some((pos, raw.kind));
        }
    }
    None
}

fn find_occurrences(data: &[u8], needle: &[u8]) -> Vec<usize> {
    let mut out = Vec::new();
    if needle.is_empty() || needle.len() > data.len() {
        return out;
    }
    for i in 0..=data.len() - needle.len() {
        if &data[i..i + needle.len()] == needle {
            out.push(i);
        }
    }
    out
}

/// Sort by header offset and keep the latest element per ID.
fn dedup_by_id(mut elements: Vec<ElementBlock>) -> Vec<ElementBlock> {
    elements.sort_by_key(|e| e.data_byte_offset);
    let mut latest: HashMap<String, ElementBlock> = HashMap::new();
    for element in elements {
        latest.insert(element.id.clone(), element);
    }
    let mut out: Vec<ElementBlock> = latest.into_values().collect();
    out.sort_by_key(|e| e.data_byte_offset);
    out
}

/// For every DB raw block, push its paired reference address onto the first
/// element sharing its name.
pub fn link_to_raw_blocks(elements: &mut [ElementBlock], raw_blocks: &[RawBlock]) {
    for (idx, raw) in raw_blocks.iter().enumerate() {
        if raw.kind != BlockKind::Db {
            continue;
        }
        let Some(element) = elements.iter_mut().find(|e| e.name == raw.name) else {
            continue;
        };
        element.raw_block = Some(idx);
        if let Some(record) = &raw.address_record {
            element.address = i32::from(record.reference_address);
        }
    }
}

/// Link elements to reference blocks by `ID/N` name equality.
///
/// A same-address match links outright; a name-only match overrides the
/// element's address with the instance's. Elements with no match reference
/// themselves.
pub fn link_to_reference_blocks(
    elements: &mut [ElementBlock],
    reference_blocks: &[ReferenceBlock],
    raw_blocks: &[RawBlock],
) {
    for element in elements.iter_mut() {
        let target = element
            .raw_block
            .and_then(|idx| raw_blocks.get(idx))
            .map(|raw| raw.name.as_str())
            .unwrap_or(&element.name);

        let mut name_only: Option<(&ReferenceBlock, i32)> = None;
        let mut linked = false;
        'blocks: for block in reference_blocks {
            for instance in &block.instances {
                if instance.properties.id_name != target {
                    continue;
                }
                if instance.address == element.address {
                    element.reference_block = block.block_name.clone();
                    linked = true;
                    break 'blocks;
                }
                if name_only.is_none() {
                    name_only = Some((block, instance.address));
                }
            }
        }

        if linked {
            continue;
        }
        if let Some((block, address)) = name_only {
            debug!(
                "element `{}`: overriding address {} with instance address {address}",
                element.name, element.address
            );
            element.address = address;
            element.reference_block = block.block_name.clone();
        } else {
            element.reference_block = element.name.clone();
        }
    }
}

/// Link each element to the XML block carrying its ID.
pub fn link_to_xml_blocks(elements: &mut [ElementBlock], xml_blocks: &[XmlBlock]) {
    let by_id: HashMap<&str, usize> = xml_blocks
        .iter()
        .enumerate()
        .filter_map(|(idx, x)| x.element_id.as_deref().map(|id| (id, idx)))
        .collect();

    for element in elements.iter_mut() {
        element.xml_block = by_id.get(element.id.as_str()).copied();
        if element.xml_block.is_none() {
            debug!("element `{}` ({}) has no XML of its own", element.name, element.id);
        }
    }
}
