//! Pass 5: decode `<Root>` and `<Member>` trees, raw or decompressed, and
//! recover the element header that ties each tree to its element ID.
//!
//! Header recovery is a three-step affair: the 16-bit length anchored at the
//! region end, the encrypted-sentinel indirection chain, and finally the
//! nearest preceding header within a bounded window.

use crate::fragments::{DecompressedFragment, FragmentKind};
use crate::model::{
    ElementKind, ExternalType, Externals, MemberItem, MemberPayload, Offsets, ParamSize,
    RootPayload, Usage, XmlBlock, XmlPayload,
};
use crate::patterns;
use crate::utils::bytes;

use log::{debug, warn};
use roxmltree::{Document, Node};
use std::collections::HashMap;

/// Cap on the block-data window parsed during header recovery. The recorded
/// 16-bit length routinely overlaps a prefix byte and balloons; the window is
/// clamped so a stale length cannot drag in a later element's header.
const HEADER_WINDOW_CAP: usize = 512;

/// Indirection offsets used when the header is behind an encrypted region.
const ROOT_CHAIN_FIRST: usize = 127;
const ROOT_CHAIN_FALLBACK: usize = 214;
const MEMBER_CHAIN_FIRST: usize = 119;

const ENCRYPTED_SENTINEL: u8 = 0xFF;

/// How far back the fallback scan looks for a preceding header record.
const BACKWARD_WINDOW: usize = 512;

/// A backward-recovered header must end close to the region it labels; a
/// match further away than this belongs to some other record.
const BACKWARD_ADJACENCY: usize = 128;

pub fn decode_xml_blocks(data: &[u8], fragments: &[DecompressedFragment]) -> Vec<XmlBlock> {
    let mut blocks = Vec::new();

    let mut root_ranges = Vec::new();
    for m in patterns::xml_root().find_iter(data) {
        root_ranges.push((m.start(), m.end()));
        let text = sanitize(m.as_bytes());
        match decode_text(&text, m.start(), m.len(), false) {
            Some(block) => blocks.push(block),
            None => debug!("raw XML region at {} did not decode", m.start()),
        }
    }
    for m in patterns::xml_member().find_iter(data) {
        // A <Member> hit inside a <Root> region is that root's own item, not
        // a standalone tree.
        if root_ranges
            .iter()
            .any(|&(s, e)| s <= m.start() && m.end() <= e)
        {
            continue;
        }
        let text = sanitize(m.as_bytes());
        match decode_text(&text, m.start(), m.len(), false) {
            Some(block) => blocks.push(block),
            None => debug!("raw XML region at {} did not decode", m.start()),
        }
    }

    for fragment in fragments {
        if !matches!(fragment.kind, FragmentKind::Root | FragmentKind::Member) {
            continue;
        }
        match decode_text(
            &fragment.text,
            fragment.byte_offset,
            fragment.byte_size,
            true,
        ) {
            Some(block) => blocks.push(block),
            None => warn!(
                "decompressed XML at {} did not decode",
                fragment.byte_offset
            ),
        }
    }

    for block in &mut blocks {
        recover_header(data, block);
    }

    let blocks = dedup_by_element_id(blocks);
    debug!("decoded {} XML blocks", blocks.len());
    blocks
}

fn sanitize(region: &[u8]) -> String {
    let filtered: Vec<u8> = region.iter().copied().filter(|&b| b != 0).collect();
    String::from_utf8_lossy(&filtered).into_owned()
}

fn decode_text(
    text: &str,
    byte_offset: usize,
    byte_size: usize,
    is_compressed: bool,
) -> Option<XmlBlock> {
    let doc = match Document::parse(text) {
        Ok(doc) => doc,
        Err(e) => {
            debug!("XML at {byte_offset} is not well-formed: {e}");
            return None;
        }
    };
    let root = doc.root_element();
    let payload = match root.tag_name().name() {
        "Root" => XmlPayload::Root(map_root(root)),
        "Member" => XmlPayload::Member(map_member(root)),
        other => {
            debug!("XML at {byte_offset} has unexpected root <{other}>");
            return None;
        }
    };
    Some(XmlBlock {
        element_id: None,
        element_name: None,
        byte_offset,
        byte_size,
        is_compressed,
        payload,
    })
}

// ---- DOM mapping ----------------------------------------------------------

fn map_root(root: Node) -> RootPayload {
    RootPayload {
        interface_guid: root.attribute("InterfaceGuid").map(str::to_string),
        items: top_level_members(root)
            .into_iter()
            .map(map_member_item)
            .collect(),
        offsets: element_child(root, "Offsets").map(|n| map_offsets(n, true)),
        volatile_size: element_child(root, "ExtensionMemory")
            .and_then(|n| n.attribute("VolatileSize"))
            .map(str::to_string),
        externals: element_child(root, "Externals").map(map_externals),
    }
}

fn map_member(root: Node) -> MemberPayload {
    MemberPayload {
        parent_id: root
            .attribute("ParentId")
            .unwrap_or("InternalSection")
            .to_string(),
        offsets: root
            .descendants()
            .skip(1)
            .filter(|n| n.is_element() && n.tag_name().name() == "Offsets")
            .map(|n| map_offsets(n, false))
            .collect(),
        items: top_level_members(root)
            .into_iter()
            .map(map_member_item)
            .collect(),
    }
}

fn map_member_item(node: Node) -> MemberItem {
    MemberItem {
        id: attr(node, "ID"),
        name: attr(node, "Name"),
        rid: attr(node, "RID"),
        lid: node.attribute("LID").map(str::to_string),
        std_o: attr(node, "StdO"),
        v: attr(node, "v"),
        sub_part_index: attr(node, "SubPartIndex"),
        data_type: attr(node, "Type"),
        children: top_level_members(node)
            .into_iter()
            .map(map_member_item)
            .collect(),
    }
}

fn map_offsets(node: Node, root_shape: bool) -> Offsets {
    let param_size = if root_shape {
        element_child(node, "ParamSize").map(|n| ParamSize {
            std_size: attr(n, "stdSize"),
            vol_size: attr(n, "volSize"),
            vol_flags: attr(n, "volFlags"),
            all_flags: attr(n, "allFlags"),
        })
    } else {
        None
    };
    Offsets {
        std_size: attr(node, "stdSize"),
        opt_size: attr(node, "optSize"),
        flags: attr(node, "Flags"),
        crc: attr(node, "CRC"),
        vol_size: if root_shape { attr(node, "volSize") } else { String::new() },
        param_size,
        entries: node
            .descendants()
            .skip(1)
            .filter(|n| n.is_element() && n.tag_name().name() == "o")
            .map(|n| attr(n, "o"))
            .collect(),
    }
}

fn map_externals(node: Node) -> Externals {
    Externals {
        multi_fb_count: node
            .attribute("MultiFBCount")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        types: node
            .children()
            .filter(|n| n.is_element() && n.tag_name().name() == "ExternalType")
            .map(|n| ExternalType {
                sub_part_index: attr(n, "SubPartIndex"),
                type_name: attr(n, "Name"),
                block_class: attr(n, "BlockClass"),
                usages: n
                    .children()
                    .filter(|u| u.is_element() && u.tag_name().name() == "Usage")
                    .map(|u| Usage {
                        path: attr(u, "Path"),
                        name: attr(u, "Name"),
                        vol_start: attr(u, "volStart"),
                        section: u.attribute("Section").unwrap_or("Static").to_string(),
                    })
                    .collect(),
            })
            .collect(),
    }
}

/// `Member` descendants of `scope` with no `Member` ancestor below `scope`.
fn top_level_members<'a, 'input>(scope: Node<'a, 'input>) -> Vec<Node<'a, 'input>> {
    scope
        .descendants()
        .skip(1)
        .filter(|n| n.is_element() && n.tag_name().name() == "Member")
        .filter(|n| {
            let mut parent = n.parent();
            while let Some(p) = parent {
                if p == scope {
                    return true;
                }
                if p.is_element() && p.tag_name().name() == "Member" {
                    return false;
                }
                parent = p.parent();
            }
            true
        })
        .collect()
}

fn element_child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|c| c.is_element() && c.tag_name().name() == name)
}

fn attr(node: Node, name: &str) -> String {
    node.attribute(name).unwrap_or_default().to_string()
}

// ---- header recovery ------------------------------------------------------

fn recover_header(data: &[u8], block: &mut XmlBlock) {
    let anchor = block.byte_offset + block.byte_size;

    if let Some((kind, id, name)) = primary_header(data, anchor)
        .or_else(|| sentinel_chain_header(data, anchor, block.payload.element_kind()))
        .or_else(|| backward_header(data, block.byte_offset))
    {
        if kind != block.payload.element_kind() {
            debug!(
                "XML at {}: header kind disagrees with payload; keeping header id `{id}`",
                block.byte_offset
            );
        }
        block.element_id = Some(id);
        block.element_name = Some(name);
    } else {
        debug!(
            "XML at {}: no element header recovered",
            block.byte_offset
        );
    }
}

/// The 16-bit length at the region end, then the adjacent block-data string.
fn primary_header(data: &[u8], anchor: usize) -> Option<(ElementKind, String, String)> {
    let len = bytes::read_u16_le(data, anchor)? as usize;
    let end = (anchor + 2 + len.min(HEADER_WINDOW_CAP)).min(data.len());
    parse_header_window(&data[anchor.min(end)..end])
}

/// Follow the chained length prefixes; a 0xFF sentinel marks an encrypted
/// region whose surrogate header sits at a fixed distance.
fn sentinel_chain_header(
    data: &[u8],
    anchor: usize,
    kind: ElementKind,
) -> Option<(ElementKind, String, String)> {
    let sentinel_at = match kind {
        ElementKind::Root => {
            let off1 = bytes::read_u8(data, anchor)? as usize;
            let off2 = bytes::read_u8(data, anchor + off1)? as usize;
            anchor + off1 + off2
        }
        ElementKind::Member => {
            let size = bytes::read_u16_le(data, anchor)? as usize;
            let off = bytes::read_u8(data, anchor)? as usize;
            anchor + size.min(HEADER_WINDOW_CAP) + off
        }
    };
    if bytes::read_u8(data, sentinel_at)? != ENCRYPTED_SENTINEL {
        return None;
    }

    let deltas: &[usize] = match kind {
        ElementKind::Root => &[ROOT_CHAIN_FIRST, ROOT_CHAIN_FALLBACK],
        ElementKind::Member => &[MEMBER_CHAIN_FIRST],
    };
    for &delta in deltas {
        let prefix_at = anchor + delta;
        let Some(size) = bytes::read_u8(data, prefix_at) else {
            continue;
        };
        if size == 0 {
            continue;
        }
        let start = prefix_at + 1;
        let end = (start + size as usize - 1).min(data.len());
        if let Some(found) = parse_header_window(&data[start.min(end)..end]) {
            return Some(found);
        }
    }
    None
}

/// Nearest preceding `BIVE:`/`BI:` header within the backward window.
fn backward_header(data: &[u8], region_start: usize) -> Option<(ElementKind, String, String)> {
    let window_start = region_start.saturating_sub(BACKWARD_WINDOW);
    let window = &data[window_start..region_start];

    let last_root = patterns::root_header().find_iter(window).last();
    let last_member = patterns::member_header().find_iter(window).last();
    let from = match (last_root, last_member) {
        (Some(r), Some(m)) => r.start().max(m.start()),
        (Some(r), None) => r.start(),
        (None, Some(m)) => m.start(),
        (None, None) => return None,
    };
    if window.len() - from > BACKWARD_ADJACENCY {
        return None;
    }
    parse_header_window(&window[from..])
}

/// Parse a window holding a `BIVE:<name>/<guid>` or `BI:<scope>:<name>/<guid>`
/// header into the element ID scheme used by pass 4.
fn parse_header_window(window: &[u8]) -> Option<(ElementKind, String, String)> {
    if let Some(m) = patterns::member_header().find(window) {
        let caps = patterns::member_block_data().captures(&window[m.start()..])?;
        let scope = bytes::ascii_string(caps.get(1)?.as_bytes());
        let name = bytes::ascii_string(caps.get(2)?.as_bytes());
        let guid = bytes::ascii_string(caps.get(3)?.as_bytes());
        return Some((ElementKind::Member, format!("{scope}:{guid}"), name));
    }
    if let Some(m) = patterns::root_header().find(window) {
        let caps = patterns::root_block_data().captures(&window[m.start()..])?;
        let name = bytes::ascii_string(caps.get(2)?.as_bytes());
        let guid = bytes::ascii_string(caps.get(3)?.as_bytes());
        return Some((ElementKind::Root, guid, name));
    }
    None
}

/// Per element ID, the block with the greatest byte offset wins. Blocks with
/// no recovered ID are kept as-is.
fn dedup_by_element_id(blocks: Vec<XmlBlock>) -> Vec<XmlBlock> {
    let mut keyed: HashMap<String, XmlBlock> = HashMap::new();
    let mut anonymous = Vec::new();
    for block in blocks {
        match block.element_id.clone() {
            Some(id) => match keyed.get(&id) {
                Some(existing) if existing.byte_offset >= block.byte_offset => {}
                _ => {
                    keyed.insert(id, block);
                }
            },
            None => anonymous.push(block),
        }
    }
    let mut out: Vec<XmlBlock> = keyed.into_values().chain(anonymous).collect();
    out.sort_by_key(|b| b.byte_offset);
    out
}
