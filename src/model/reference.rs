/// The attribute set copied off an `AufDBBlock`/`DepDBBlock` record.
///
/// Field names follow the element/attribute paths in the IdentManager
/// schema; any attribute missing in the XML is the empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentProperties {
    pub id_name: String,
    pub id_s: String,
    pub id_rid: String,
    pub id_is: String,
    pub cs_nid: String,
    pub cs_uid: String,
    pub cs_ak: String,
    pub od_dtr: String,
    pub od_s: String,
    pub od_td_t: String,
    pub tod_n: String,
    pub tod_sm: String,
    pub tod_bt: String,
    pub tod_cid: String,
    pub tod_trkg: String,
    pub dbbd_im: String,
    pub dbbd_nr: String,
}

/// One block instance described by an IdentXmlPart record.
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub properties: IdentProperties,
    /// Third component of `OD/TD/T` (`BlockType:BlockID:Name`).
    pub name: String,
    /// First component of `OD/TD/T`.
    pub kind_label: String,
    pub byte_offset: usize,
    /// `TOD/N` parsed as decimal.
    pub address: i32,
    pub trkg: String,
}

/// Instances sharing a `TRKG` tracking key.
#[derive(Debug, Clone)]
pub struct ReferenceBlock {
    pub trkg: String,
    pub block_name: String,
    pub kind_label: String,
    /// Deduplicated by `address` (latest wins), sorted ascending.
    pub instances: Vec<InstanceRecord>,
}
