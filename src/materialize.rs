//! Pass 6: walk the linked element graph into `PlcItem` trees and flatten
//! them to `(dotted_name, reference_address)` pairs.
//!
//! Reference expansion copies items rather than sharing edges, so traversal
//! terminates on its own; a depth bound guards against reference cycles in
//! corrupt inputs.

use crate::model::{Address, BlockKind, ElementBlock, PlcItem, XmlBlock, XmlPayload};
use crate::patterns;
use crate::plf_parser::ParserSettings;

use log::{debug, warn};
use std::collections::{HashMap, HashSet};

/// The fixed domain tag prepended to every formatted reference address.
pub const ADDRESS_DOMAIN_TAG: &str = "8A0E";

/// Upper bound on children generated for a single array range.
const MAX_ARRAY_RANGE: i64 = 65536;

struct Container {
    name: String,
    address: i32,
    /// One item list per element instance of this name.
    blocks: Vec<Vec<PlcItem>>,
}

pub fn materialize(
    elements: &[ElementBlock],
    xml_blocks: &[XmlBlock],
    settings: &ParserSettings,
) -> Vec<Address> {
    let mut containers: Vec<Container> = Vec::new();

    for element in elements {
        let items = match resolve_payload(element, elements, xml_blocks) {
            Some(payload) => {
                let mut items = build_block_items(element, payload);
                for item in &mut items {
                    expand_arrays(item);
                }
                items
            }
            None => {
                warn!(
                    "{}",
                    crate::err::ScanError::UnmatchedElement {
                        id: element.id.clone(),
                    }
                );
                Vec::new()
            }
        };

        match containers.iter_mut().find(|c| c.name == element.name) {
            Some(container) => {
                if container.address == 0 {
                    container.address = element.address;
                }
                container.blocks.push(items);
            }
            None => containers.push(Container {
                name: element.name.clone(),
                address: element.address,
                blocks: vec![items],
            }),
        }
    }

    // Items per block name, used to graft referenced blocks.
    let library: HashMap<String, Vec<PlcItem>> = containers
        .iter()
        .map(|c| {
            let items: Vec<PlcItem> = c.blocks.iter().flatten().cloned().collect();
            (c.name.clone(), items)
        })
        .collect();

    let max_depth = settings.get_max_reference_depth();
    for container in &mut containers {
        for items in &mut container.blocks {
            for item in items.iter_mut() {
                expand_references(item, &library, 0, max_depth);
            }
        }
    }

    flatten(containers)
}

/// An element's own XML, or the XML borrowed through its reference block.
fn resolve_payload<'a>(
    element: &ElementBlock,
    elements: &[ElementBlock],
    xml_blocks: &'a [XmlBlock],
) -> Option<&'a XmlPayload> {
    if let Some(idx) = element.xml_block {
        return xml_blocks.get(idx).map(|b| &b.payload);
    }
    elements
        .iter()
        .find(|e| e.name == element.reference_block && e.xml_block.is_some())
        .and_then(|e| e.xml_block)
        .and_then(|idx| xml_blocks.get(idx))
        .map(|b| &b.payload)
}

fn build_block_items(element: &ElementBlock, payload: &XmlPayload) -> Vec<PlcItem> {
    let mut items = Vec::new();

    if let Some(externals) = payload.externals() {
        let mut position = 0usize;
        for external_type in &externals.types {
            for usage in &external_type.usages {
                items.push(PlcItem {
                    id: position.to_string(),
                    name: usage.name.clone(),
                    address: Some(usage.path.clone()),
                    kind: BlockKind::from_label(&external_type.block_class),
                    data_type: "UNDEFINED".to_string(),
                    reference_name: external_type.type_name.clone(),
                    children: Vec::new(),
                });
                position += 1;
            }
        }
    }

    for item in payload.items() {
        items.push(member_to_plc_item(item, element.kind));
    }
    items
}

fn member_to_plc_item(item: &crate::model::MemberItem, kind: BlockKind) -> PlcItem {
    PlcItem {
        id: item.id.clone(),
        name: item.name.clone(),
        address: item.lid.clone(),
        kind,
        data_type: item.data_type.clone(),
        reference_name: String::new(),
        children: item
            .children
            .iter()
            .map(|c| member_to_plc_item(c, kind))
            .collect(),
    }
}

/// Expand `Array[a..b(, c..d)*] of T` into one child per enumerated index.
fn expand_arrays(item: &mut PlcItem) {
    if let Some(caps) = patterns::array_type().captures(&item.data_type) {
        let ranges = caps.get(1).expect("ranges group").as_str().to_string();
        let base_type = caps.get(2).expect("base type group").as_str().to_string();
        for range in ranges.split(',') {
            let Some((low, high)) = parse_range(range.trim()) else {
                continue;
            };
            if high - low + 1 > MAX_ARRAY_RANGE {
                warn!(
                    "array range {range} on `{}` is too large; skipping expansion",
                    item.name
                );
                continue;
            }
            for i in low..=high {
                item.children.push(PlcItem {
                    id: item.id.clone(),
                    name: format!("{}[{i}]", item.name),
                    address: Some(i.to_string()),
                    kind: item.kind,
                    data_type: base_type.clone(),
                    reference_name: String::new(),
                    children: Vec::new(),
                });
            }
        }
    }
    for child in &mut item.children {
        expand_arrays(child);
    }
}

fn parse_range(range: &str) -> Option<(i64, i64)> {
    let (low, high) = range.split_once("..")?;
    let low = low.trim().parse::<i64>().ok()?;
    let high = high.trim().parse::<i64>().ok()?;
    if low > high {
        return None;
    }
    Some((low, high))
}

/// Graft the referenced block's items under any item carrying a reference
/// name, recursively, bounded by `max_depth`.
fn expand_references(
    item: &mut PlcItem,
    library: &HashMap<String, Vec<PlcItem>>,
    depth: usize,
    max_depth: usize,
) {
    for child in &mut item.children {
        expand_references(child, library, depth, max_depth);
    }
    if item.reference_name.is_empty() {
        return;
    }
    if depth >= max_depth {
        warn!(
            "reference expansion truncated at depth {max_depth} under `{}`",
            item.name
        );
        return;
    }
    let Some(source) = library.get(&item.reference_name) else {
        debug!(
            "no block named `{}` to expand under `{}`",
            item.reference_name, item.name
        );
        return;
    };
    let mut copies = source.clone();
    for copy in &mut copies {
        expand_references(copy, library, depth + 1, max_depth);
    }
    item.children.extend(copies);
}

/// Depth-first traversal of the containers, sorted by address; zero-address
/// containers are dropped, and names are emitted at most once.
fn flatten(mut containers: Vec<Container>) -> Vec<Address> {
    containers.retain(|c| {
        if c.address == 0 {
            debug!("dropping container `{}`: unresolved address", c.name);
            false
        } else {
            true
        }
    });
    containers.sort_by_key(|c| c.address);

    let mut out = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for container in &containers {
        let root_reference = container.address.to_string();
        push_address(&mut out, &mut seen, &container.name, &root_reference);
        for items in &container.blocks {
            for item in items {
                emit_item(item, &container.name, &root_reference, &mut out, &mut seen);
            }
        }
    }
    out
}

fn emit_item(
    item: &PlcItem,
    parent_name: &str,
    parent_reference: &str,
    out: &mut Vec<Address>,
    seen: &mut HashSet<String>,
) {
    let Some(fragment) = &item.address else {
        return;
    };
    let name = format!("{parent_name}.{}", item.name);
    let reference = format!("{parent_reference}.{fragment}");
    push_address(out, seen, &name, &reference);
    for child in &item.children {
        emit_item(child, &name, &reference, out, seen);
    }
}

fn push_address(out: &mut Vec<Address>, seen: &mut HashSet<String>, name: &str, reference: &str) {
    if !seen.insert(name.to_string()) {
        debug!("duplicate address name `{name}` suppressed");
        return;
    }
    out.push(Address {
        name: name.to_string(),
        reference_address: format_reference_address(reference),
    });
}

/// Dot-join the segments as uppercase hex, prefixed with the domain tag.
/// Non-numeric segments pass through unchanged and are logged.
pub fn format_reference_address(raw: &str) -> String {
    let formatted: Vec<String> = raw
        .split('.')
        .map(|segment| match segment.parse::<u64>() {
            Ok(value) => format!("{value:X}"),
            Err(_) => {
                warn!("non-numeric address segment `{segment}` left as-is");
                segment.to_string()
            }
        })
        .collect();
    format!("{ADDRESS_DOMAIN_TAG}{}", formatted.join("."))
}
