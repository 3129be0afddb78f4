//! Synthetic `.plf` container builder for the integration tests.
//!
//! Records follow the container's length-prefix convention: a one-byte
//! prefix counts itself, so a prefix `s` introduces `s - 1` payload bytes.
#![allow(dead_code)] // each test target uses a different subset

use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::Write;
use std::sync::Once;

pub const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

pub const GUID_A: &str = "aaaaaaaa-0000-1111-2222-333333333333";
pub const GUID_B: &str = "bbbbbbbb-0000-1111-2222-333333333333";

static LOGGER_INIT: Once = Once::new();

// Rust runs the tests concurrently, so unless we synchronize logging access
// it will crash when attempting to run `cargo test` with some logging facilities.
pub fn ensure_env_logger_initialized() {
    LOGGER_INIT.call_once(|| {
        let mut builder = env_logger::Builder::from_default_env();
        builder
            .format(|buf, record| writeln!(buf, "[{}] - {}", record.level(), record.args()))
            .init();
    });
}

pub fn root_header(name: &str, guid: &str) -> String {
    format!("BIVE:{name}/{guid}")
}

pub fn member_header(scope: &str, name: &str, guid: &str) -> String {
    format!("BI:{scope}:{name}/{guid}")
}

pub fn deflate(payload: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload).unwrap();
    encoder.finish().unwrap()
}

pub struct PlfBuilder {
    buf: Vec<u8>,
}

impl PlfBuilder {
    pub fn new() -> Self {
        // Leading slack so prefix reads before the first record have room.
        PlfBuilder { buf: vec![0u8; 16] }
    }

    pub fn pad(mut self, n: usize) -> Self {
        self.buf.extend(std::iter::repeat(0u8).take(n));
        self
    }

    /// A `<kind>!` block header: marker, offset byte, filler, prefix, name.
    pub fn block_header(mut self, kind: &str, name: &str) -> Self {
        self.buf.extend_from_slice(kind.as_bytes());
        self.buf.push(b'!');
        self.buf.push(2); // offset to the length prefix
        self.buf.push(0xAA);
        self.buf.push((name.len() + 1) as u8);
        self.buf.extend_from_slice(name.as_bytes());
        self
    }

    pub fn db_header(self, name: &str) -> Self {
        self.block_header("DB", name)
    }

    /// A `\x01\x03<kind>` name record; classifies `name` occurrences.
    pub fn name_record(mut self, kind: &str, name: &str) -> Self {
        self.buf.push(1);
        self.buf.push(3);
        self.buf.extend_from_slice(kind.as_bytes());
        self.buf.push((name.len() + 1) as u8);
        self.buf.extend_from_slice(name.as_bytes());
        self
    }

    /// A `%DB<n>` address token with its size prefix and an empty blob field.
    pub fn db_token(mut self, number: u16) -> Self {
        let token = format!("%DB{number}");
        self.buf.push((token.len() + 1) as u8);
        self.buf.extend_from_slice(token.as_bytes());
        self.buf.extend_from_slice(&[0, 0]);
        self
    }

    /// Arbitrary ASCII content (IdentXmlPart fragments and the like).
    pub fn raw_text(mut self, text: &str) -> Self {
        self.buf.extend_from_slice(text.as_bytes());
        self
    }

    /// A bare length-prefixed element header with no XML region attached.
    pub fn element_header(mut self, header: &str) -> Self {
        self.buf.push(header.len() as u8);
        self.buf.extend_from_slice(header.as_bytes());
        self
    }

    /// An uncompressed XML region followed by its length-prefixed header.
    pub fn raw_xml(mut self, xml: &str, header: &str) -> Self {
        self.buf.extend_from_slice(xml.as_bytes());
        self.buf.push(header.len() as u8);
        self.buf.extend_from_slice(header.as_bytes());
        self
    }

    /// A zlib fragment preceded by its header record and 16-bit size.
    pub fn compressed_xml(mut self, xml: &str, header: &str) -> Self {
        self.buf.push(header.len() as u8);
        self.buf.extend_from_slice(header.as_bytes());

        let mut payload = UTF8_BOM.to_vec();
        payload.extend_from_slice(xml.as_bytes());
        let stream = deflate(&payload);
        self.buf
            .extend_from_slice(&(stream.len() as u16).to_le_bytes());
        self.buf.extend_from_slice(&stream);
        self
    }

    /// A multi-segment fragment: the document is chunked, each chunk deflated
    /// separately, and only the first segment carries the recorded size.
    pub fn compressed_xml_chunked(mut self, xml: &str, header: &str, chunk_size: usize) -> Self {
        self.buf.push(header.len() as u8);
        self.buf.extend_from_slice(header.as_bytes());

        let mut document = UTF8_BOM.to_vec();
        document.extend_from_slice(xml.as_bytes());
        let streams: Vec<Vec<u8>> = document.chunks(chunk_size).map(|c| deflate(c)).collect();
        // The recorded size must cover every segment's stream; it is only
        // read at the first marker.
        let window = streams.iter().map(Vec::len).max().unwrap() + 4;

        self.buf.extend_from_slice(&(window as u16).to_le_bytes());
        for stream in &streams {
            self.buf.extend_from_slice(stream);
        }
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.buf
    }
}

impl Default for PlfBuilder {
    fn default() -> Self {
        Self::new()
    }
}
