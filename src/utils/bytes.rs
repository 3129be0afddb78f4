//! Byte-slice utilities for bounds-oriented parsing.
//!
//! This module is intentionally tiny and *boring*: it provides a consistent way
//! to read little-endian primitives and length-prefixed ASCII runs out of
//! `&[u8]` at fixed offsets, with minimal overhead.
//!
//! There are two layers:
//! - **Option layer** (`read_*`): zero-cost helpers that return `Option<T>`.
//!   Use these for opportunistic probes where a miss is not an error.
//! - **Result layer** (`*_r`): wrappers that map `None` to
//!   `ScanError::TokenizationMismatch`. Use these where a length prefix
//!   pointing outside the buffer is the canonical per-record failure.
//!
//! All numeric reads are little-endian (PLF data is LE). Offsets are `usize`
//! relative to the slice you pass in.
//!
//! Length prefixes in the container count themselves: a prefix byte `s`
//! introduces `s - 1` bytes of payload starting immediately after it.
//! [`read_len_prefixed_ascii`] implements exactly that convention.

use crate::err::ScanError;

/// Read a single byte at `offset`.
pub(crate) fn read_u8(buf: &[u8], offset: usize) -> Option<u8> {
    buf.get(offset).copied()
}

/// Read `N` raw bytes at `offset`.
///
/// Returns `None` if the range is out of bounds.
pub(crate) fn read_array<const N: usize>(buf: &[u8], offset: usize) -> Option<[u8; N]> {
    let end = offset.checked_add(N)?;
    let bytes: [u8; N] = buf.get(offset..end)?.try_into().ok()?;
    Some(bytes)
}

/// Read a `u16` (little-endian) at `offset`.
pub(crate) fn read_u16_le(buf: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_le_bytes(read_array::<2>(buf, offset)?))
}

/// Map the bytes of `buf` verbatim into a `String`, one `char` per byte.
///
/// This is the "ASCII view" of the container: no character-set conversion,
/// high bytes pass through as-is.
pub(crate) fn ascii_string(buf: &[u8]) -> String {
    buf.iter().map(|&b| b as char).collect()
}

#[inline]
fn truncated(what: &'static str, offset: usize, need: usize, len: usize) -> ScanError {
    ScanError::TokenizationMismatch {
        what,
        offset,
        need,
        have: len.saturating_sub(offset),
    }
}

pub(crate) fn slice_r<'a>(
    buf: &'a [u8],
    offset: usize,
    len: usize,
    what: &'static str,
) -> Result<&'a [u8], ScanError> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| truncated(what, offset, len, buf.len()))?;
    buf.get(offset..end)
        .ok_or_else(|| truncated(what, offset, len, buf.len()))
}

/// Read a single byte at `offset`, or return `ScanError::TokenizationMismatch`.
pub(crate) fn read_u8_r(buf: &[u8], offset: usize, what: &'static str) -> Result<u8, ScanError> {
    read_u8(buf, offset).ok_or_else(|| truncated(what, offset, 1, buf.len()))
}

/// Read a `u16` (little-endian) at `offset`, or return `ScanError::TokenizationMismatch`.
pub(crate) fn read_u16_le_r(
    buf: &[u8],
    offset: usize,
    what: &'static str,
) -> Result<u16, ScanError> {
    read_u16_le(buf, offset).ok_or_else(|| truncated(what, offset, 2, buf.len()))
}

/// Read a self-counting length-prefixed ASCII run.
///
/// The prefix byte at `offset` counts itself, so a prefix `s` is followed by
/// `s - 1` payload bytes. Returns the decoded string and the payload offset.
pub(crate) fn read_len_prefixed_ascii(
    buf: &[u8],
    offset: usize,
    what: &'static str,
) -> Result<(String, usize), ScanError> {
    let prefix = read_u8_r(buf, offset, what)? as usize;
    if prefix == 0 {
        return Err(truncated(what, offset, 1, buf.len()));
    }
    let payload = slice_r(buf, offset + 1, prefix - 1, what)?;
    Ok((ascii_string(payload), offset + 1))
}
