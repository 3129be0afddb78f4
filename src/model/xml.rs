//! The decoded shapes of `<Root>` and `<Member>` trees.
//!
//! Attribute values are kept as strings; numeric interpretation happens at
//! materialization time where a non-numeric segment is a logged event, not a
//! parse failure.

use crate::model::element::ElementKind;

/// One `<Member>` element, nested recursively.
#[derive(Debug, Clone, Default)]
pub struct MemberItem {
    pub id: String,
    pub name: String,
    pub rid: String,
    /// Local offset identifier; absent members are not addressable.
    pub lid: Option<String>,
    pub std_o: String,
    pub v: String,
    pub sub_part_index: String,
    pub data_type: String,
    pub children: Vec<MemberItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamSize {
    pub std_size: String,
    pub vol_size: String,
    pub vol_flags: String,
    pub all_flags: String,
}

/// An `<Offsets>` element. Root offsets carry `volSize` and a `ParamSize`
/// child; member offsets do not.
#[derive(Debug, Clone, Default)]
pub struct Offsets {
    pub std_size: String,
    pub opt_size: String,
    pub flags: String,
    pub crc: String,
    pub vol_size: String,
    pub param_size: Option<ParamSize>,
    /// All descendant `<o o="..."/>` values, in document order.
    pub entries: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub path: String,
    pub name: String,
    pub vol_start: String,
    pub section: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExternalType {
    pub sub_part_index: String,
    /// The `Name` attribute; names the referenced block type.
    pub type_name: String,
    pub block_class: String,
    pub usages: Vec<Usage>,
}

#[derive(Debug, Clone, Default)]
pub struct Externals {
    pub multi_fb_count: u32,
    pub types: Vec<ExternalType>,
}

#[derive(Debug, Clone, Default)]
pub struct RootPayload {
    pub interface_guid: Option<String>,
    pub items: Vec<MemberItem>,
    pub offsets: Option<Offsets>,
    /// `ExtensionMemory@VolatileSize`.
    pub volatile_size: Option<String>,
    pub externals: Option<Externals>,
}

#[derive(Debug, Clone, Default)]
pub struct MemberPayload {
    /// `ParentId` attribute, defaulting to `InternalSection`.
    pub parent_id: String,
    pub offsets: Vec<Offsets>,
    pub items: Vec<MemberItem>,
}

/// Tagged payload variant replacing runtime dispatch over element shapes.
#[derive(Debug, Clone)]
pub enum XmlPayload {
    Root(RootPayload),
    Member(MemberPayload),
}

impl XmlPayload {
    pub fn element_kind(&self) -> ElementKind {
        match self {
            XmlPayload::Root(_) => ElementKind::Root,
            XmlPayload::Member(_) => ElementKind::Member,
        }
    }

    pub fn items(&self) -> &[MemberItem] {
        match self {
            XmlPayload::Root(r) => &r.items,
            XmlPayload::Member(m) => &m.items,
        }
    }

    pub fn externals(&self) -> Option<&Externals> {
        match self {
            XmlPayload::Root(r) => r.externals.as_ref(),
            XmlPayload::Member(_) => None,
        }
    }
}

/// An XML tree found raw or decompressed, with its recovered element header.
#[derive(Debug, Clone)]
pub struct XmlBlock {
    /// Element ID recovered from the adjacent header record, when it parsed.
    pub element_id: Option<String>,
    pub element_name: Option<String>,
    pub byte_offset: usize,
    pub byte_size: usize,
    pub is_compressed: bool,
    pub payload: XmlPayload,
}
