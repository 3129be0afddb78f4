use crate::model::blocks::BlockKind;

/// One node of the materialized address tree.
///
/// Reference expansion copies the referenced block's items into `children`
/// (no shared edges), so traversal terminates without cycle detection.
#[derive(Debug, Clone)]
pub struct PlcItem {
    pub id: String,
    pub name: String,
    /// The address fragment contributed by this node (`LID`, array index, or
    /// external usage path). `None` nodes are not emitted.
    pub address: Option<String>,
    pub kind: BlockKind,
    pub data_type: String,
    /// Name of the block whose items are grafted under this node.
    pub reference_name: String,
    pub children: Vec<PlcItem>,
}

/// A final output row: dotted symbolic name plus formatted reference address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub name: String,
    pub reference_address: String,
}
