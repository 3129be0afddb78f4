//! Pass 2: harvest `IdentXmlPart` records into [`ReferenceBlock`]s.
//!
//! Instance records come from two places: `<IdentXmlPart>` fragments sitting
//! uncompressed in the byte stream, and decompressed fragments from pass 1.
//! Instances sharing a `TRKG` tracking key belong to the same reference block.

use crate::err::{ScanError, ScanResult};
use crate::fragments::{DecompressedFragment, FragmentKind};
use crate::model::{IdentProperties, InstanceRecord, ReferenceBlock};
use crate::patterns;
use crate::utils::bytes;

use log::{debug, warn};
use roxmltree::{Document, Node};
use std::collections::HashMap;

/// Namespace of the IdentManager records.
pub const IDENT_NS: &str =
    "http://schemas.siemens.com/Simatic/ES/14/IdentManager/IdentXmlPart.xsd";

/// Resolve reference blocks from raw and decompressed IdentXmlPart fragments.
pub fn resolve_reference_blocks(
    data: &[u8],
    fragments: &[DecompressedFragment],
) -> Vec<ReferenceBlock> {
    let mut blocks: Vec<ReferenceBlock> = Vec::new();
    let mut by_trkg: HashMap<String, usize> = HashMap::new();

    for m in patterns::ident_xml().find_iter(data) {
        let text = bytes::ascii_string(m.as_bytes());
        if !text.contains("DBBlock") {
            continue;
        }
        collect_from_text(&text, m.start(), &mut blocks, &mut by_trkg);
    }

    for fragment in fragments {
        if fragment.kind != FragmentKind::IdentXmlPart {
            continue;
        }
        collect_from_text(
            &fragment.text,
            fragment.byte_offset,
            &mut blocks,
            &mut by_trkg,
        );
    }

    for block in &mut blocks {
        dedup_and_sort_instances(block);
    }
    blocks.sort_by_key(|b| b.instances.first().map(|i| i.address).unwrap_or(i32::MAX));

    debug!("resolved {} reference blocks", blocks.len());
    blocks
}

fn collect_from_text(
    text: &str,
    byte_offset: usize,
    blocks: &mut Vec<ReferenceBlock>,
    by_trkg: &mut HashMap<String, usize>,
) {
    let doc = match Document::parse(text) {
        Ok(doc) => doc,
        Err(source) => {
            warn!(
                "{}",
                ScanError::MalformedXmlFragment {
                    offset: byte_offset,
                    source,
                }
            );
            return;
        }
    };

    for node in doc.descendants().filter(|n| is_db_block(n)) {
        match instance_from_node(node, byte_offset) {
            Ok(instance) => append_instance(instance, blocks, by_trkg),
            Err(e) => warn!("skipping instance record: {e}"),
        }
    }
}

fn is_db_block(node: &Node) -> bool {
    if !node.is_element() {
        return false;
    }
    let tag = node.tag_name();
    if !matches!(tag.name(), "AufDBBlock" | "DepDBBlock") {
        return false;
    }
    // Stripped fragments occasionally lose their namespace declaration;
    // accept those as well.
    matches!(tag.namespace(), Some(IDENT_NS) | None)
}

fn instance_from_node(node: Node, byte_offset: usize) -> ScanResult<InstanceRecord> {
    let properties = read_properties(node);

    let parts: Vec<&str> = properties.od_td_t.split(':').collect();
    let [kind_label, _block_id, name] = parts.as_slice() else {
        return Err(ScanError::FormatViolation {
            field: "OD/TD/T",
            expected: "BlockType:BlockID:Name",
            value: properties.od_td_t.clone(),
            offset: byte_offset,
        });
    };

    let address = properties
        .tod_n
        .parse::<i32>()
        .map_err(|_| ScanError::UnparseableAddress {
            token: properties.tod_n.clone(),
            offset: byte_offset,
        })?;

    Ok(InstanceRecord {
        name: name.to_string(),
        kind_label: kind_label.to_string(),
        trkg: properties.tod_trkg.clone(),
        address,
        byte_offset,
        properties,
    })
}

fn read_properties(node: Node) -> IdentProperties {
    let id = child(node, "ID");
    let cs_c = id.and_then(|n| child(n, "CS")).and_then(|n| child(n, "C"));
    let od = child(node, "OD");
    let td = od.and_then(|n| child(n, "TD"));
    let tod = child(node, "TOD");
    let dbbd = child(node, "DBBD");

    IdentProperties {
        id_name: attr(id, "N"),
        id_s: attr(id, "S"),
        id_rid: attr(id, "RID"),
        id_is: attr(id, "IS"),
        cs_nid: attr(cs_c, "NID"),
        cs_uid: attr(cs_c, "UID"),
        cs_ak: attr(cs_c, "AK"),
        od_dtr: attr(od, "DTR"),
        od_s: attr(od, "S"),
        od_td_t: attr(td, "T"),
        tod_n: attr(tod, "N"),
        tod_sm: attr(tod, "SM"),
        tod_bt: attr(tod, "BT"),
        tod_cid: attr(tod, "CID"),
        tod_trkg: attr(tod, "TRKG"),
        dbbd_im: attr(dbbd, "IM"),
        dbbd_nr: attr(dbbd, "NR"),
    }
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|c| c.is_element() && c.tag_name().name() == name)
}

fn attr(node: Option<Node>, name: &str) -> String {
    node.and_then(|n| n.attribute(name))
        .unwrap_or_default()
        .to_string()
}

fn append_instance(
    instance: InstanceRecord,
    blocks: &mut Vec<ReferenceBlock>,
    by_trkg: &mut HashMap<String, usize>,
) {
    if let Some(&idx) = by_trkg.get(&instance.trkg) {
        blocks[idx].instances.push(instance);
    } else {
        by_trkg.insert(instance.trkg.clone(), blocks.len());
        blocks.push(ReferenceBlock {
            trkg: instance.trkg.clone(),
            block_name: instance.name.clone(),
            kind_label: instance.kind_label.clone(),
            instances: vec![instance],
        });
    }
}

/// Keep the last-encountered instance per address, sorted ascending.
fn dedup_and_sort_instances(block: &mut ReferenceBlock) {
    let mut deduped: Vec<InstanceRecord> = Vec::with_capacity(block.instances.len());
    for instance in block.instances.drain(..) {
        if let Some(existing) = deduped.iter_mut().find(|e| e.address == instance.address) {
            *existing = instance;
        } else {
            deduped.push(instance);
        }
    }
    deduped.sort_by_key(|i| i.address);
    block.instances = deduped;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident_fragment(records: &str) -> String {
        format!("<IdentXmlPart xmlns=\"{IDENT_NS}\">{records}</IdentXmlPart>")
    }

    fn auf_block(name: &str, address: i32, trkg: &str) -> String {
        format!(
            "<AufDBBlock>\
               <ID N=\"{name}\" S=\"1\"/>\
               <OD DTR=\"x\"><TD T=\"DB:77:{name}\"/></OD>\
               <TOD N=\"{address}\" TRKG=\"{trkg}\"/>\
             </AufDBBlock>"
        )
    }

    #[test]
    fn test_groups_instances_by_trkg() {
        let xml = ident_fragment(&format!(
            "{}{}{}",
            auf_block("Foo", 9, "t1"),
            auf_block("Foo", 4, "t1"),
            auf_block("Bar", 2, "t2"),
        ));
        let mut buf = Vec::new();
        buf.extend_from_slice(xml.as_bytes());

        let blocks = resolve_reference_blocks(&buf, &[]);
        assert_eq!(blocks.len(), 2);
        // Sorted by first instance address: Bar (2) before Foo (4).
        assert_eq!(blocks[0].trkg, "t2");
        assert_eq!(blocks[1].trkg, "t1");
        assert_eq!(blocks[1].block_name, "Foo");
        let addresses: Vec<i32> = blocks[1].instances.iter().map(|i| i.address).collect();
        assert_eq!(addresses, vec![4, 9]);
        assert!(blocks[1].instances.iter().all(|i| i.trkg == "t1"));
    }

    #[test]
    fn test_latest_instance_wins_per_address() {
        let xml = ident_fragment(&format!(
            "{}{}",
            auf_block("Old", 5, "t1"),
            "<AufDBBlock>\
               <ID N=\"New\"/>\
               <OD><TD T=\"DB:77:New\"/></OD>\
               <TOD N=\"5\" TRKG=\"t1\"/>\
             </AufDBBlock>",
        ));
        let buf = xml.into_bytes();

        let blocks = resolve_reference_blocks(&buf, &[]);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].instances.len(), 1);
        assert_eq!(blocks[0].instances[0].name, "New");
    }

    #[test]
    fn test_malformed_type_descriptor_is_skipped() {
        let xml = ident_fragment(
            "<AufDBBlock>\
               <ID N=\"Broken\"/>\
               <OD><TD T=\"OnlyOnePart\"/></OD>\
               <TOD N=\"5\" TRKG=\"t1\"/>\
             </AufDBBlock>",
        );
        let buf = xml.into_bytes();
        assert!(resolve_reference_blocks(&buf, &[]).is_empty());
    }

    #[test]
    fn test_fragment_without_dbblock_is_ignored() {
        let buf = b"<IdentXmlPart><Other/></IdentXmlPart>".to_vec();
        assert!(resolve_reference_blocks(&buf, &[]).is_empty());
    }

    #[test]
    fn test_properties_are_copied_verbatim() {
        let xml = ident_fragment(
            "<DepDBBlock>\
               <ID N=\"Dep\" RID=\"7\" IS=\"i\"><CS><C NID=\"n\" UID=\"u\" AK=\"a\"/></CS></ID>\
               <OD DTR=\"d\" S=\"s\"><TD T=\"FB:3:Dep\"/></OD>\
               <TOD N=\"12\" SM=\"sm\" BT=\"bt\" CID=\"cid\" TRKG=\"t9\"/>\
               <DBBD IM=\"im\" NR=\"nr\"/>\
             </DepDBBlock>",
        );
        let buf = xml.into_bytes();

        let blocks = resolve_reference_blocks(&buf, &[]);
        let inst = &blocks[0].instances[0];
        assert_eq!(inst.kind_label, "FB");
        assert_eq!(inst.address, 12);
        assert_eq!(inst.properties.id_rid, "7");
        assert_eq!(inst.properties.cs_uid, "u");
        assert_eq!(inst.properties.tod_sm, "sm");
        assert_eq!(inst.properties.dbbd_nr, "nr");
        // Missing attributes default to empty.
        assert_eq!(inst.properties.id_s, "");
    }
}
