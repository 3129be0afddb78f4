//! Pass 3: find block headers, block names, and reference-address records
//! directly in the byte stream.
//!
//! Length prefixes here are self-counting (a prefix byte `s` introduces
//! `s - 1` payload bytes); see `utils::bytes::read_len_prefixed_ascii`.

use crate::err::{ScanError, ScanResult};
use crate::model::{AddressRecord, BlockKind, CompressedBlob, RawBlock};
use crate::patterns;
use crate::utils::bytes;
use crate::utils::hexdump;

use byteorder::{LittleEndian, ReadBytesExt};
use flate2::read::ZlibDecoder;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::io::{Cursor, Read};

/// The PLUSBLOCK reference address lives at this fixed offset past the marker.
const PLUSBLOCK_ADDRESS_OFFSET: u64 = 53;

/// Window searched for a PLUSBLOCK follow-on zlib payload.
const PLUSBLOCK_BLOB_WINDOW: usize = 64;

/// Everything pass 3 produces: classified raw blocks (DB blocks paired with
/// their nearest address record) and the deduplicated address-record list.
#[derive(Debug, Default)]
pub struct RawBlockScan {
    pub blocks: Vec<RawBlock>,
    pub addresses: Vec<AddressRecord>,
}

pub fn extract_raw_blocks(data: &[u8]) -> RawBlockScan {
    let mut blocks = Vec::new();
    scan_headers(data, &mut blocks);
    scan_names(data, &mut blocks);

    let mut addresses = Vec::new();
    scan_address_tokens(data, &mut addresses);
    scan_plusblocks(data, &mut addresses);

    let addresses = dedup_addresses(addresses);
    let mut scan = RawBlockScan { blocks, addresses };
    pair_db_addresses(&mut scan);
    debug!(
        "raw scan: {} blocks, {} address records",
        scan.blocks.len(),
        scan.addresses.len()
    );
    scan
}

/// Scan for `UDT!`/`FB!`/`DB!`/`OB!`/`FC!` headers and `PLUSBLOCK` markers.
fn scan_headers(data: &[u8], blocks: &mut Vec<RawBlock>) {
    for caps in patterns::block_header().captures_iter(data) {
        let whole = caps.get(0).expect("group 0 always present");
        match header_block_at(data, whole.start(), whole.len(), caps.get(1)) {
            Ok(Some(block)) => blocks.push(block),
            Ok(None) => {}
            Err(e) => warn!(
                "skipping block header: {e} ({})",
                hexdump::preview(data, whole.start(), 16)
            ),
        }
    }
}

fn header_block_at(
    data: &[u8],
    start: usize,
    match_len: usize,
    kind_tag: Option<regex::bytes::Match<'_>>,
) -> ScanResult<Option<RawBlock>> {
    let offset = bytes::read_u8_r(data, start + match_len, "block header name offset")? as usize;
    let prefix_offset = start + match_len + offset;
    let (name, name_offset) =
        bytes::read_len_prefixed_ascii(data, prefix_offset, "block header name")?;

    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Ok(None);
    }

    // The name substring is more specific than the header tag; prefer it.
    let mut kind = BlockKind::from_name(&name);
    if kind == BlockKind::Undefined {
        if let Some(tag) = kind_tag {
            kind = BlockKind::from_header_tag(tag.as_bytes());
        }
    }
    if kind == BlockKind::Undefined {
        warn!(
            "{}",
            ScanError::UnclassifiedBlock {
                name: name.clone(),
                offset: start,
            }
        );
    }

    Ok(Some(RawBlock {
        kind,
        name,
        byte_offset: start,
        name_offset,
        address_record: None,
    }))
}

/// Scan for `\x01\x03(DB|OB|FC|FB)` name records.
fn scan_names(data: &[u8], blocks: &mut Vec<RawBlock>) {
    for caps in patterns::block_name().captures_iter(data) {
        let whole = caps.get(0).expect("group 0 always present");
        let kind = BlockKind::from_header_tag(caps.get(1).expect("kind group").as_bytes());
        match name_block_at(data, whole.start(), whole.end(), kind) {
            Ok(Some(block)) => blocks.push(block),
            Ok(None) => {}
            Err(e) => warn!(
                "skipping name record: {e} ({})",
                hexdump::preview(data, whole.start(), 16)
            ),
        }
    }
}

fn name_block_at(
    data: &[u8],
    start: usize,
    match_end: usize,
    kind: BlockKind,
) -> ScanResult<Option<RawBlock>> {
    let name_size = bytes::read_u8_r(data, match_end, "name record size")? as usize;

    let (name, name_offset) = if name_size == 33 {
        if bytes::read_u8(data, match_end + 33) == Some(33) {
            // Fixed-width name slot: the terminator repeats the size.
            let payload = bytes::slice_r(data, match_end + 1, 32, "fixed-width name")?;
            (bytes::ascii_string(payload), match_end + 1)
        } else {
            // Indirect form: two further length bytes point at the real name.
            let offset = bytes::read_u8_r(data, match_end + 1, "name indirection offset")? as usize;
            let size =
                bytes::read_u8_r(data, match_end + 1 + offset, "name indirection size")? as usize;
            if size == 0 {
                return Ok(None);
            }
            let name_at = match_end + 2 + offset;
            let payload = bytes::slice_r(data, name_at, size - 1, "indirect name")?;
            (bytes::ascii_string(payload), name_at)
        }
    } else {
        if name_size == 0 {
            return Ok(None);
        }
        let payload = bytes::slice_r(data, match_end + 1, name_size - 1, "name record")?;
        (bytes::ascii_string(payload), match_end + 1)
    };

    if name.is_empty() || !name.chars().all(|c| c.is_ascii_graphic()) {
        return Ok(None);
    }

    Ok(Some(RawBlock {
        kind,
        name,
        byte_offset: start,
        name_offset,
        address_record: None,
    }))
}

/// Scan for `%DB`-prefixed address tokens.
fn scan_address_tokens(data: &[u8], addresses: &mut Vec<AddressRecord>) {
    for m in patterns::db_token().find_iter(data) {
        match address_record_at(data, m.start()) {
            Ok(Some(record)) => addresses.push(record),
            Ok(None) => {}
            Err(e) => warn!(
                "skipping address token: {e} ({})",
                hexdump::preview(data, m.start(), 16)
            ),
        }
    }
}

fn address_record_at(data: &[u8], start: usize) -> ScanResult<Option<AddressRecord>> {
    if start == 0 {
        return Ok(None);
    }
    let address_size = data[start - 1] as usize;
    if address_size == 0 {
        return Ok(None);
    }

    // The raw token length is derived from the pre-cleaning prefix; the
    // cleaned token may be shorter but offsets keep using this length.
    let raw_len = address_size - 1;
    let raw_token = bytes::ascii_string(bytes::slice_r(data, start, raw_len, "address token")?);
    let token = clean_token(&raw_token);

    if !patterns::db_prefix().is_match(&token) {
        return Ok(None);
    }

    let reference_address = parse_reference_address(&token, start)?;
    let blob = inline_blob(data, start + raw_len);

    Ok(Some(AddressRecord {
        name: String::new(),
        token,
        reference_address,
        byte_offset: start,
        blob,
    }))
}

/// Strip everything outside `[A-Za-z0-9.@_-]`.
fn clean_token(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '@' | '_' | '-'))
        .collect()
}

/// First run of digits, parsed as decimal.
fn parse_reference_address(token: &str, offset: usize) -> ScanResult<u16> {
    patterns::digit_run()
        .find(token)
        .and_then(|m| m.as_str().parse::<u16>().ok())
        .ok_or_else(|| ScanError::UnparseableAddress {
            token: token.to_string(),
            offset,
        })
}

/// Opportunistically attach the inline zlib payload following a token.
fn inline_blob(data: &[u8], at: usize) -> Option<CompressedBlob> {
    let size = bytes::read_u16_le(data, at)? as usize;
    if size == 0 || at + size > data.len() {
        return None;
    }
    let span = &data[at..at + size];
    let inflated = span
        .windows(2)
        .position(|w| w == b"x\x5e")
        .and_then(|pos| inflate_opportunistic(&span[pos..]));
    if inflated.is_none() {
        debug!("inline blob at {at} did not inflate; content left undefined");
    }
    Some(CompressedBlob {
        byte_offset: at,
        byte_size: size,
        data: inflated,
    })
}

fn inflate_opportunistic(window: &[u8]) -> Option<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(window);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).ok()?;
    Some(out)
}

/// Scan for PLUSBLOCK composite records.
fn scan_plusblocks(data: &[u8], addresses: &mut Vec<AddressRecord>) {
    for m in patterns::plusblock().find_iter(data) {
        match plusblock_at(data, m.start(), m.end()) {
            Ok(Some(record)) => addresses.push(record),
            Ok(None) => {}
            Err(e) => warn!(
                "skipping PLUSBLOCK: {e} ({})",
                hexdump::preview(data, m.start(), 16)
            ),
        }
    }
}

fn plusblock_at(data: &[u8], start: usize, match_end: usize) -> ScanResult<Option<AddressRecord>> {
    let data_size = bytes::read_u8_r(data, match_end, "PLUSBLOCK data size")? as usize;
    if data_size == 0 {
        return Ok(None);
    }
    let end = (match_end + data_size).min(data.len());
    let block_data = &data[match_end..end];

    let Some(pos) = block_data.windows(3).position(|w| w == b"%DB") else {
        return Ok(None);
    };
    if pos == 0 {
        return Ok(None);
    }
    let address_size = block_data[pos - 1] as usize;
    if address_size == 0 {
        return Ok(None);
    }
    let token_end = (pos + address_size - 1).min(block_data.len());
    let token = clean_token(&bytes::ascii_string(&block_data[pos..token_end]));
    if !patterns::db_prefix().is_match(&token) {
        return Ok(None);
    }

    // The reference address sits at a fixed distance from the marker.
    let mut cursor = Cursor::new(data);
    cursor.set_position(start as u64 + PLUSBLOCK_ADDRESS_OFFSET);
    let reference_address = cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| ScanError::TokenizationMismatch {
            what: "PLUSBLOCK reference address",
            offset: start + PLUSBLOCK_ADDRESS_OFFSET as usize,
            need: 2,
            have: data.len().saturating_sub(start + PLUSBLOCK_ADDRESS_OFFSET as usize),
        })?;

    let name = plusblock_name(data, match_end + data_size).unwrap_or_default();
    let blob = plusblock_blob(data, match_end + data_size);

    Ok(Some(AddressRecord {
        name,
        token,
        reference_address,
        byte_offset: start,
        blob,
    }))
}

/// Follow the two chained length prefixes to the human-readable block name.
///
/// The chained region holds an ASCII `DB` marker followed by a length-prefixed
/// name; anything else means the record carries no name.
fn plusblock_name(data: &[u8], tail: usize) -> Option<String> {
    let off1 = bytes::read_u8(data, tail)? as usize;
    let off2 = bytes::read_u8(data, tail + off1)? as usize;
    let base = tail + off1 + off2;
    let name_size = bytes::read_u8(data, base)? as usize;
    if name_size == 0 {
        return None;
    }
    let window = data.get(base..(base + name_size).min(data.len()))?;

    let db = window.windows(2).position(|w| w == b"DB")?;
    let len = *window.get(db + 2)? as usize;
    if len < 2 {
        return None;
    }
    let name = window.get(db + 3..db + 3 + len - 1)?;
    let name = bytes::ascii_string(name);
    if name.chars().all(|c| c.is_ascii_graphic()) {
        Some(name)
    } else {
        None
    }
}

/// A non-zero presence byte after the record introduces a zlib payload.
fn plusblock_blob(data: &[u8], tail: usize) -> Option<CompressedBlob> {
    let presence = bytes::read_u8(data, tail + 1)?;
    if presence == 0 {
        return None;
    }
    let window_end = (tail + PLUSBLOCK_BLOB_WINDOW).min(data.len());
    let window = &data[tail..window_end];
    let pos = window.windows(2).position(|w| w == b"x\x5e")?;
    let inflated = inflate_opportunistic(&data[tail + pos..]);
    if inflated.is_none() {
        debug!("PLUSBLOCK blob at {} did not inflate", tail + pos);
    }
    Some(CompressedBlob {
        byte_offset: tail + pos,
        byte_size: window_end - (tail + pos),
        data: inflated,
    })
}

/// Group by byte offset; within a colliding group only named records survive.
/// The result is sorted by reference address.
fn dedup_addresses(addresses: Vec<AddressRecord>) -> Vec<AddressRecord> {
    let mut groups: BTreeMap<usize, Vec<AddressRecord>> = BTreeMap::new();
    for record in addresses {
        groups.entry(record.byte_offset).or_default().push(record);
    }

    let mut out: Vec<AddressRecord> = Vec::new();
    for (_, group) in groups {
        if group.len() > 1 {
            out.extend(group.into_iter().filter(|r| !r.name.is_empty()));
        } else {
            out.extend(group);
        }
    }
    out.sort_by_key(|r| r.reference_address);
    out
}

/// Attach to each DB block the address record with the smallest positive
/// byte distance after it.
fn pair_db_addresses(scan: &mut RawBlockScan) {
    for block in scan.blocks.iter_mut().filter(|b| b.kind == BlockKind::Db) {
        let nearest = scan
            .addresses
            .iter()
            .filter(|a| a.byte_offset > block.byte_offset)
            .min_by_key(|a| a.byte_offset - block.byte_offset);
        if let Some(record) = nearest {
            block.address_record = Some(record.clone());
        } else {
            debug!(
                "DB block `{}` at {} has no following address record",
                block.name, block.byte_offset
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `DB!` header: marker, offset byte, filler, self-counting length, name.
    fn push_db_header(buf: &mut Vec<u8>, name: &str) -> usize {
        let start = buf.len();
        buf.extend_from_slice(b"DB!");
        buf.push(2); // offset to the length prefix
        buf.push(0xAA); // skipped byte
        buf.push((name.len() + 1) as u8);
        buf.extend_from_slice(name.as_bytes());
        start
    }

    /// `%DB<n>` token with its self-counting size prefix and a zero blob size.
    fn push_db_token(buf: &mut Vec<u8>, number: u16) -> usize {
        let token = format!("%DB{number}");
        buf.push((token.len() + 1) as u8);
        let start = buf.len();
        buf.extend_from_slice(token.as_bytes());
        buf.extend_from_slice(&[0, 0]);
        start
    }

    #[test]
    fn test_header_scan_decodes_offset_and_length() {
        let mut buf = vec![0u8; 4];
        push_db_header(&mut buf, "FOO1");
        let scan = extract_raw_blocks(&buf);
        assert_eq!(scan.blocks.len(), 1);
        assert_eq!(scan.blocks[0].name, "FOO1");
        assert_eq!(scan.blocks[0].kind, BlockKind::Db);
        assert_eq!(scan.blocks[0].byte_offset, 4);
    }

    #[test]
    fn test_header_scan_rejects_non_alphanumeric_names() {
        let mut buf = Vec::new();
        push_db_header(&mut buf, "BAD NAME");
        assert!(extract_raw_blocks(&buf).blocks.is_empty());
    }

    #[test]
    fn test_name_substring_outranks_header_tag() {
        // A DB! header whose name carries FB: the substring wins.
        let mut buf = Vec::new();
        push_db_header(&mut buf, "MotorFB1");
        let scan = extract_raw_blocks(&buf);
        assert_eq!(scan.blocks[0].kind, BlockKind::Fb);
    }

    #[test]
    fn test_name_record_scan() {
        let mut buf = vec![0u8; 2];
        buf.extend_from_slice(b"\x01\x03DB");
        buf.push(4); // self-counting: three name bytes
        buf.extend_from_slice(b"Foo");
        let scan = extract_raw_blocks(&buf);
        assert_eq!(scan.blocks.len(), 1);
        assert_eq!(scan.blocks[0].name, "Foo");
        assert_eq!(scan.blocks[0].kind, BlockKind::Db);
    }

    #[test]
    fn test_name_record_fixed_width_slot() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"\x01\x03FB");
        buf.push(33);
        let mut slot = [b'A'; 32];
        slot[4] = b'5';
        buf.extend_from_slice(&slot);
        buf.push(33); // terminator repeats the size
        let scan = extract_raw_blocks(&buf);
        assert_eq!(scan.blocks.len(), 1);
        assert_eq!(scan.blocks[0].name.len(), 32);
        assert_eq!(scan.blocks[0].kind, BlockKind::Fb);
    }

    #[test]
    fn test_address_token_parses_and_cleans() {
        let mut buf = vec![0u8; 3];
        push_db_token(&mut buf, 12);
        let scan = extract_raw_blocks(&buf);
        assert_eq!(scan.addresses.len(), 1);
        assert_eq!(scan.addresses[0].token, "DB12");
        assert_eq!(scan.addresses[0].reference_address, 12);
    }

    #[test]
    fn test_address_token_rejects_non_db_tokens() {
        let mut buf = Vec::new();
        let token = "%XY12";
        buf.push((token.len() + 1) as u8);
        buf.extend_from_slice(token.as_bytes());
        buf.extend_from_slice(&[0, 0]);
        // `%XY12` contains no `%DB` marker at all, so also try a token whose
        // cleaned form fails the `^DB\d+` check.
        let token = "%DBx";
        buf.push((token.len() + 1) as u8);
        buf.extend_from_slice(token.as_bytes());
        buf.extend_from_slice(&[0, 0]);
        assert!(extract_raw_blocks(&buf).addresses.is_empty());
    }

    #[test]
    fn test_nearest_following_address_wins() {
        let mut buf = Vec::new();
        push_db_token(&mut buf, 3); // before the block: not eligible
        let header = push_db_header(&mut buf, "FOO2");
        buf.extend_from_slice(&[0u8; 16]);
        push_db_token(&mut buf, 7); // nearest after
        buf.extend_from_slice(&[0u8; 16]);
        push_db_token(&mut buf, 9);

        let scan = extract_raw_blocks(&buf);
        let block = scan
            .blocks
            .iter()
            .find(|b| b.byte_offset == header)
            .unwrap();
        let record = block.address_record.as_ref().unwrap();
        assert_eq!(record.reference_address, 7);

        // No other record sits closer after the block.
        let distance = record.byte_offset - block.byte_offset;
        for other in &scan.addresses {
            if other.byte_offset > block.byte_offset {
                assert!(other.byte_offset - block.byte_offset >= distance);
            }
        }
    }

    #[test]
    fn test_addresses_sorted_by_reference_address() {
        let mut buf = Vec::new();
        push_db_token(&mut buf, 9);
        buf.extend_from_slice(&[0u8; 8]);
        push_db_token(&mut buf, 2);
        let scan = extract_raw_blocks(&buf);
        let numbers: Vec<u16> = scan.addresses.iter().map(|a| a.reference_address).collect();
        assert_eq!(numbers, vec![2, 9]);
    }

    #[test]
    fn test_plusblock_record() {
        let mut buf = vec![0u8; 2];
        let start = buf.len();
        buf.extend_from_slice(b"PLUSBLOCK");
        let match_end = buf.len();

        // Record body: size byte + payload containing a %DB token.
        let token = "%DB4";
        let mut body = vec![0u8; 6];
        body.push((token.len() + 1) as u8);
        body.extend_from_slice(token.as_bytes());
        let data_size = (body.len() + 1) as u8;
        buf.push(data_size);
        buf.extend_from_slice(&body);

        // Chained name region: off1 -> off2 -> [size][..DB <len> name..].
        let tail = match_end + data_size as usize;
        while buf.len() < tail {
            buf.push(0);
        }
        buf.push(2); // off1 (tail itself holds it); also keeps presence byte zero
        buf.push(0); // presence byte for the blob: absent
        buf.push(12); // off2 target = tail + 2 ... chain lands on name region
        // Name region at tail + 2 + 12 = tail + 14.
        while buf.len() < tail + 14 {
            buf.push(0);
        }
        buf.push(10); // name region size
        buf.extend_from_slice(b"DB");
        buf.push(5); // self-counting name length
        buf.extend_from_slice(b"Foo4");

        // The reference address at the fixed offset from the marker.
        let addr_at = start + PLUSBLOCK_ADDRESS_OFFSET as usize;
        while buf.len() < addr_at + 2 {
            buf.push(0);
        }
        buf[addr_at] = 4;
        buf[addr_at + 1] = 0;

        let scan = extract_raw_blocks(&buf);
        let record = scan
            .addresses
            .iter()
            .find(|r| r.byte_offset == start)
            .expect("PLUSBLOCK record");
        assert_eq!(record.token, "DB4");
        assert_eq!(record.reference_address, 4);
        assert_eq!(record.name, "Foo4");
    }

    #[test]
    fn test_colliding_offsets_keep_named_records() {
        let named = AddressRecord {
            name: "Foo".into(),
            token: "DB1".into(),
            reference_address: 1,
            byte_offset: 10,
            blob: None,
        };
        let anonymous = AddressRecord {
            name: String::new(),
            token: "DB1".into(),
            reference_address: 1,
            byte_offset: 10,
            blob: None,
        };
        let out = dedup_addresses(vec![anonymous, named]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "Foo");
    }
}
