use std::fmt;

/// PLC block categories found in the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    Udt,
    Fb,
    Fc,
    Ob,
    Db,
    Undefined,
}

impl BlockKind {
    /// Classify from a header capture tag (the text before the `!`).
    pub fn from_header_tag(tag: &[u8]) -> BlockKind {
        match tag {
            b"UDT" => BlockKind::Udt,
            b"FB" => BlockKind::Fb,
            b"FC" => BlockKind::Fc,
            b"OB" => BlockKind::Ob,
            b"DB" => BlockKind::Db,
            _ => BlockKind::Undefined,
        }
    }

    /// Classify by substring-testing a block name.
    ///
    /// Precedence is UDT, FB, DB, OB, FC: `UDT` must be tested before `DB`
    /// because every UDT name contains the `DT` pair.
    pub fn from_name(name: &str) -> BlockKind {
        if name.contains("UDT") {
            BlockKind::Udt
        } else if name.contains("FB") {
            BlockKind::Fb
        } else if name.contains("DB") {
            BlockKind::Db
        } else if name.contains("OB") {
            BlockKind::Ob
        } else if name.contains("FC") {
            BlockKind::Fc
        } else {
            BlockKind::Undefined
        }
    }

    /// Classify from the two ASCII bytes preceding a name occurrence.
    pub fn from_prefix(prefix: &[u8]) -> Option<BlockKind> {
        match prefix {
            b"DT" => Some(BlockKind::Udt),
            b"FB" => Some(BlockKind::Fb),
            b"DB" => Some(BlockKind::Db),
            b"OB" => Some(BlockKind::Ob),
            b"FC" => Some(BlockKind::Fc),
            _ => None,
        }
    }

    /// Classify from a textual label (`BlockClass` attributes, `OD/TD/T`
    /// block-type components).
    pub fn from_label(label: &str) -> BlockKind {
        match label {
            "UDT" => BlockKind::Udt,
            "FB" => BlockKind::Fb,
            "FC" => BlockKind::Fc,
            "OB" => BlockKind::Ob,
            "DB" => BlockKind::Db,
            _ => BlockKind::from_name(label),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Udt => "UDT",
            BlockKind::Fb => "FB",
            BlockKind::Fc => "FC",
            BlockKind::Ob => "OB",
            BlockKind::Db => "DB",
            BlockKind::Undefined => "UNDEFINED",
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An inline zlib payload attached to an address record.
///
/// Decompression is opportunistic: `data` is `None` when the payload did not
/// inflate, which downgrades the record to `UNDEFINED` content but keeps it.
#[derive(Debug, Clone)]
pub struct CompressedBlob {
    pub byte_offset: usize,
    pub byte_size: usize,
    pub data: Option<Vec<u8>>,
}

/// A `%DB`-prefixed address token or a PLUSBLOCK composite record.
#[derive(Debug, Clone)]
pub struct AddressRecord {
    /// Human-readable block name. Empty for bare `%DB` tokens.
    pub name: String,
    /// The cleaned address token, e.g. `DB12`.
    pub token: String,
    pub reference_address: u16,
    pub byte_offset: usize,
    pub blob: Option<CompressedBlob>,
}

/// A block found directly in the byte stream by the header or name scans.
#[derive(Debug, Clone)]
pub struct RawBlock {
    pub kind: BlockKind,
    pub name: String,
    pub byte_offset: usize,
    /// Offset of the first name byte; the length prefix sits right before it.
    pub name_offset: usize,
    /// The nearest following address record, attached for DB blocks only.
    pub address_record: Option<AddressRecord>,
}
