//! The shared regex set, compiled once on first use.
//!
//! Buffer scans use `regex::bytes` with `(?-u)` so classes and `.` operate on
//! raw bytes rather than UTF-8 scalars. The engine is linear-time (no
//! backtracking), which is what bounds scan time on adversarial inputs; the
//! few manual loops that are not regex-driven carry explicit iteration caps.

use regex::bytes::Regex as BytesRegex;
use regex::Regex;
use std::sync::OnceLock;

macro_rules! bytes_pattern {
    ($fn_name:ident, $pattern:expr) => {
        pub(crate) fn $fn_name() -> &'static BytesRegex {
            static CELL: OnceLock<BytesRegex> = OnceLock::new();
            CELL.get_or_init(|| BytesRegex::new($pattern).expect("hardcoded pattern compiles"))
        }
    };
}

macro_rules! str_pattern {
    ($fn_name:ident, $pattern:expr) => {
        pub(crate) fn $fn_name() -> &'static Regex {
            static CELL: OnceLock<Regex> = OnceLock::new();
            CELL.get_or_init(|| Regex::new($pattern).expect("hardcoded pattern compiles"))
        }
    };
}

// Pass 1: zlib default-compression header (0x78 0x5E).
bytes_pattern!(zlib_marker, r"(?-u)x\^");

// Pass 2: raw IdentXmlPart fragments.
bytes_pattern!(ident_xml, r"(?s-u)<IdentXmlPart.*?</IdentXmlPart>");

// Pass 3: block headers, name records, address tokens.
bytes_pattern!(block_header, r"(?-u)(UDT|FB|DB|OB|FC)!|PLUSBLOCK");
bytes_pattern!(block_name, r"(?-u)\x01\x03(DB|OB|FC|FB)");
bytes_pattern!(db_token, r"(?-u)%DB");
bytes_pattern!(plusblock, r"(?-u)PLUSBLOCK");

// Pass 4/5: element headers and their block-data payloads.
bytes_pattern!(root_header, r"(?s-u)BIVE:(.*?)/");
bytes_pattern!(member_header, r"(?s-u)BI:(.*?)/");
bytes_pattern!(
    root_block_data,
    r"(?s-u)([A-Za-z0-9]+):(.*?)/([A-Za-z0-9\-]{36})"
);
bytes_pattern!(
    member_block_data,
    r"(?s-u)BI:([A-Za-z0-9]+):(.*?)/([A-Za-z0-9\-]{36})"
);

// Pass 5: uncompressed XML regions.
bytes_pattern!(xml_root, r"(?s-u)<Root(?:\s[^>]*)?>.*?</Root>");
bytes_pattern!(xml_member, r"(?s-u)<Member(?:\s[^>]*)?>.*?</Member>");

// Pass 3/6: token validation and type parsing.
str_pattern!(db_prefix, r"^DB\d+");
str_pattern!(digit_run, r"\d+");
str_pattern!(
    array_type,
    r"^Array\[(\d+\.\.\d+(?:,\s*\d+\.\.\d+)*)\] of (\w+)$"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_header_captures_kind_tag() {
        let caps = block_header().captures(b"junkDB!more").unwrap();
        assert_eq!(caps.get(1).unwrap().as_bytes(), b"DB");

        let caps = block_header().captures(b"..PLUSBLOCK..").unwrap();
        assert!(caps.get(1).is_none());
    }

    #[test]
    fn test_member_header_does_not_match_root_headers() {
        assert!(member_header().find(b"BIVE:Foo/abc").is_none());
        assert!(member_header().find(b"BI:Values:Foo/abc").is_some());
    }

    #[test]
    fn test_block_data_extracts_scope_name_and_guid() {
        let guid = b"12345678-1234-1234-1234-123456789abc";
        let mut data = b"BIVE:MyBlock/".to_vec();
        data.extend_from_slice(guid);
        let caps = root_block_data().captures(&data).unwrap();
        assert_eq!(caps.get(1).unwrap().as_bytes(), b"BIVE");
        assert_eq!(caps.get(2).unwrap().as_bytes(), b"MyBlock");
        assert_eq!(caps.get(3).unwrap().as_bytes(), &guid[..]);
    }

    #[test]
    fn test_xml_region_matches_with_and_without_attributes() {
        assert!(xml_root().find(b"<Root><Member/></Root>").is_some());
        assert!(xml_root().find(b"<Root a=\"1\"><x/></Root>").is_some());
        assert!(xml_root().find(b"<RootOffsets></RootOffsets>").is_none());
    }

    #[test]
    fn test_array_type_accepts_multi_range() {
        let caps = array_type().captures("Array[0..2, 5..6] of Int").unwrap();
        assert_eq!(&caps[1], "0..2, 5..6");
        assert_eq!(&caps[2], "Int");
        assert!(array_type().captures("Array of Int").is_none());
    }
}
