//! Pass 1: locate and inflate the zlib-compressed XML fragments.
//!
//! Fragment boundaries are not explicit in the container. Every `x^` pair
//! (0x78 0x5E, the zlib default-compression header) is treated as a candidate
//! stream start, probed with a bounded decompression window, and accepted only
//! when the probe output carries a UTF-8 BOM followed by one of the known
//! fragment tags.

use crate::err::{ScanError, ScanResult};
use crate::patterns;
use crate::utils::bytes;
use crate::utils::hexdump;

use flate2::read::ZlibDecoder;
use log::{debug, warn};
use std::io::Read;

/// Size of the probing decompression window.
pub const ZLIB_PROBE_WINDOW: usize = 250;

/// A decompressed output of exactly this size marks a partial segment.
const PARTIAL_SEGMENT_SIZE: usize = 4096;

const MAX_PARTIAL_SEGMENTS: usize = 1024;

const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    Root,
    Member,
    IdentXmlPart,
}

/// A decompressed XML fragment, with its position in the container.
#[derive(Debug, Clone)]
pub struct DecompressedFragment {
    pub kind: FragmentKind,
    /// The XML text, BOM and NUL bytes stripped, known to be well-formed.
    pub text: String,
    /// Offset of the `x^` marker.
    pub byte_offset: usize,
    /// Compressed size as recorded in the 16-bit prefix before the marker.
    pub byte_size: usize,
}

/// Walk the buffer and inflate every interesting fragment.
///
/// Per-fragment failures are logged and skipped; the pass never aborts.
pub fn extract_fragments(data: &[u8]) -> Vec<DecompressedFragment> {
    let markers: Vec<usize> = patterns::zlib_marker()
        .find_iter(data)
        .map(|m| m.start())
        .collect();
    debug!("found {} zlib marker candidates", markers.len());

    let mut fragments = Vec::new();
    for (idx, &p) in markers.iter().enumerate() {
        match extract_at(data, &markers, idx) {
            Ok(Some(fragment)) => fragments.push(fragment),
            Ok(None) => {}
            Err(e) => warn!("skipping fragment: {e} ({})", hexdump::preview(data, p, 16)),
        }
    }

    debug!("extracted {} fragments", fragments.len());
    fragments
}

fn extract_at(
    data: &[u8],
    markers: &[usize],
    idx: usize,
) -> ScanResult<Option<DecompressedFragment>> {
    let p = markers[idx];

    let probe_end = (p + ZLIB_PROBE_WINDOW).min(data.len());
    let Some(probe) = inflate_partial(&data[p..probe_end]) else {
        return Ok(None);
    };
    let Some(kind) = classify_probe(&probe) else {
        return Ok(None);
    };

    // The 16-bit size prefix sits right before the marker.
    if p < 2 {
        return Ok(None);
    }
    let block_size = bytes::read_u16_le_r(data, p - 2, "fragment size prefix")? as usize;
    if block_size == 0 {
        return Ok(None);
    }

    let mut payload = inflate(sized_window(data, p, block_size), p)?;

    if payload.len() == PARTIAL_SEGMENT_SIZE {
        concatenate_partials(data, markers, idx, block_size, &mut payload)?;
    }

    let text = match validate_xml(sanitize(&payload), p) {
        Ok(text) => text,
        Err(first_err) => {
            // Retry once with the unbounded tail; the recorded size can be
            // stale in reorganized containers.
            let tail = inflate_partial(&data[p..]).unwrap_or_default();
            match validate_xml(sanitize(&tail), p) {
                Ok(text) => {
                    debug!("fragment at {p}: recovered by tail decompression");
                    text
                }
                Err(_) => return Err(first_err),
            }
        }
    };

    if kind == FragmentKind::IdentXmlPart && !text.contains("DBBlock") {
        return Ok(None);
    }

    Ok(Some(DecompressedFragment {
        kind,
        text,
        byte_offset: p,
        byte_size: block_size,
    }))
}

/// Append follow-on 4096-byte segments until one comes up short.
fn concatenate_partials(
    data: &[u8],
    markers: &[usize],
    idx: usize,
    block_size: usize,
    payload: &mut Vec<u8>,
) -> ScanResult<()> {
    let mut segments = 1usize;
    for &q in &markers[idx + 1..] {
        if segments >= MAX_PARTIAL_SEGMENTS {
            return Err(ScanError::ScanBudgetExceeded {
                what: "partial fragment concatenation",
                offset: q,
            });
        }
        let segment = match inflate(sized_window(data, q, block_size), q) {
            Ok(segment) => segment,
            Err(e) => {
                // Deflate streams contain incidental `x^` pairs; a marker
                // that does not inflate is not a segment boundary.
                debug!("partial segment candidate at {q} did not inflate: {e}");
                segments += 1;
                continue;
            }
        };
        let last = segment.len() < PARTIAL_SEGMENT_SIZE;
        payload.extend_from_slice(&segment);
        segments += 1;
        if last {
            break;
        }
    }
    Ok(())
}

fn sized_window(data: &[u8], start: usize, block_size: usize) -> &[u8] {
    match data.get(start..start + block_size) {
        Some(window) => window,
        None => {
            debug!("window of {block_size} bytes at {start} clipped to buffer end");
            &data[start..]
        }
    }
}

/// Inflate a window, keeping partial output if the stream ends early.
fn inflate(window: &[u8], offset: usize) -> ScanResult<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(window);
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match decoder.read(&mut buf) {
            Ok(0) => return Ok(out),
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(source) => {
                if out.is_empty() {
                    return Err(ScanError::MalformedZlibStream { offset, source });
                }
                debug!("zlib stream at {offset} ended early after {} bytes", out.len());
                return Ok(out);
            }
        }
    }
}

/// Best-effort inflate: whatever came out before the first error, or `None`.
fn inflate_partial(window: &[u8]) -> Option<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(window);
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match decoder.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(_) => break,
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// A fragment is interesting when the probe output is `BOM < tagname`.
fn classify_probe(probe: &[u8]) -> Option<FragmentKind> {
    let rest = probe.strip_prefix(&UTF8_BOM)?;
    let rest = rest.strip_prefix(b"<")?;
    let tag_len = rest.iter().take_while(|b| b.is_ascii_alphabetic()).count();
    match &rest[..tag_len] {
        b"Root" => Some(FragmentKind::Root),
        b"Member" => Some(FragmentKind::Member),
        b"IdentXmlPart" => Some(FragmentKind::IdentXmlPart),
        _ => None,
    }
}

/// Strip NUL bytes and the BOM, decode the remainder as UTF-8.
fn sanitize(payload: &[u8]) -> String {
    let filtered: Vec<u8> = payload.iter().copied().filter(|&b| b != 0).collect();
    let trimmed = filtered.strip_prefix(&UTF8_BOM).unwrap_or(&filtered);
    String::from_utf8_lossy(trimmed).into_owned()
}

fn validate_xml(text: String, offset: usize) -> ScanResult<String> {
    match roxmltree::Document::parse(&text) {
        Ok(_) => Ok(text),
        Err(source) => Err(ScanError::MalformedXmlFragment { offset, source }),
    }
}
