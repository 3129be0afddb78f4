use crate::model::blocks::BlockKind;

/// The two element header kinds (`BIVE:` and `BI:` prefixes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Root,
    Member,
}

/// A block element located by its ASCII-prefixed header, cross-linked to the
/// other symbol namespaces.
///
/// Cross-references are carried as indices/names rather than back-pointers so
/// the pass outputs stay acyclic; the lookup maps used to resolve them are
/// built during linking and discarded afterwards.
#[derive(Debug, Clone)]
pub struct ElementBlock {
    pub element_kind: ElementKind,
    /// GUID for roots, `scope:guid` for members.
    pub id: String,
    pub name: String,
    /// Classification from the name-occurrence prefix or raw-block fallback.
    pub kind: BlockKind,
    /// Offset of the classified name occurrence (0 when unclassified).
    pub block_byte_offset: usize,
    /// Offset of the `BIVE:`/`BI:` header this element came from.
    pub data_byte_offset: usize,
    /// Resolved reference address; 0 until a raw or reference link supplies one.
    pub address: i32,
    /// Index into the raw-block list, when linked by name equality.
    pub raw_block: Option<usize>,
    /// `ReferenceBlock::block_name` of the linked reference block, or the
    /// element's own name when no link was found.
    pub reference_block: String,
    /// Index into the XML-block list, when linked by element ID.
    pub xml_block: Option<usize>,
}
