pub mod blocks;
pub mod element;
pub mod plc;
pub mod reference;
pub mod xml;

pub use blocks::{AddressRecord, BlockKind, CompressedBlob, RawBlock};
pub use element::{ElementBlock, ElementKind};
pub use plc::{Address, PlcItem};
pub use reference::{IdentProperties, InstanceRecord, ReferenceBlock};
pub use xml::{
    ExternalType, Externals, MemberItem, MemberPayload, Offsets, ParamSize, RootPayload, Usage,
    XmlBlock, XmlPayload,
};
