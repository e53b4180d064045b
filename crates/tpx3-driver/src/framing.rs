//! Wire framing for the data-plane TCP stream.
//!
//! Two regimes share this module. [`RecordAssembler`] handles the
//! header-framed regime: the stream is a concatenation of records, each
//! one ASCII JSON header line immediately followed by `dataSize` raw
//! bytes. [`EventChunker`] handles the raw regime: bare little-endian
//! fixed-width words with no delimiters at all.
//!
//! Both are pure push-based state machines over byte chunks, so the
//! blocking socket loop stays a thin shell and reassembly is testable at
//! arbitrary split points.

use bytes::{Buf, Bytes, BytesMut};
use tpx3_core::buffer::ElementType;
use tpx3_core::error::{CoreResult, Tpx3Error};
use tpx3_core::limits::MAX_RECORD_BYTES;

/// Upper bound on one JSON header, well above anything SERVAL emits.
const MAX_HEADER_BYTES: usize = 1024;

/// Parsed fields of one record header.
///
/// The header is embedded in a byte stream that also carries binary
/// payload, so fields are extracted by index-scanning for each key name
/// between the brace markers; a general JSON parse would scan past the
/// terminator into payload bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordHeader {
    /// Timestamp of the frame in seconds since measurement start.
    pub time_at_frame: f64,
    /// Sequence number assigned by the server.
    pub frame_number: u64,
    /// Server-side measurement id, if one is active.
    pub measurement_id: Option<u64>,
    /// Declared payload length in bytes.
    pub data_size: usize,
    /// Element bit depth of the payload.
    pub bit_depth: u32,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
}

/// Value substring for `key`, scanned between the next ':' and the
/// following ',' or '}'.
fn scan_field<'a>(header: &'a str, key: &str) -> CoreResult<&'a str> {
    let key_at = header
        .find(key)
        .ok_or_else(|| Tpx3Error::Framing(format!("header key '{key}' not found")))?;
    let after = &header[key_at + key.len()..];
    let colon = after
        .find(':')
        .ok_or_else(|| Tpx3Error::Framing(format!("no value for header key '{key}'")))?;
    let value = &after[colon + 1..];
    let end = value
        .find([',', '}'])
        .ok_or_else(|| Tpx3Error::Framing(format!("unterminated value for '{key}'")))?;
    Ok(value[..end].trim().trim_matches('"'))
}

fn parse_field<T: std::str::FromStr>(header: &str, key: &str) -> CoreResult<T> {
    let raw = scan_field(header, key)?;
    raw.parse()
        .map_err(|_| Tpx3Error::Framing(format!("header field '{key}' malformed: '{raw}'")))
}

impl RecordHeader {
    /// Extract the required fields from one header substring
    /// (brace to brace, inclusive).
    pub fn parse(header: &str) -> CoreResult<Self> {
        let measurement_id = match scan_field(header, "measurementID") {
            Ok("null") | Err(_) => None,
            Ok(raw) => raw.parse().ok(),
        };
        Ok(Self {
            time_at_frame: parse_field(header, "timeAtFrame")?,
            frame_number: parse_field(header, "frameNumber")?,
            measurement_id,
            data_size: parse_field(header, "dataSize")?,
            bit_depth: parse_field(header, "bitDepth")?,
            width: parse_field(header, "width")?,
            height: parse_field(header, "height")?,
        })
    }

    /// Check the header's internal size assertion:
    /// `width * height * (bitDepth / 8) == dataSize`.
    pub fn validate(&self) -> CoreResult<()> {
        let elem = ElementType::from_bit_depth(self.bit_depth)?;
        let expected = (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|px| px.checked_mul(elem.width()))
            .ok_or_else(|| Tpx3Error::Framing("frame geometry overflowed".into()))?;
        if expected != self.data_size {
            return Err(Tpx3Error::Framing(format!(
                "frame {}: {}x{}x{}bit implies {} bytes, header declares {}",
                self.frame_number, self.width, self.height, self.bit_depth, expected, self.data_size
            )));
        }
        if self.data_size > MAX_RECORD_BYTES {
            return Err(Tpx3Error::Framing(format!(
                "frame {}: payload of {} bytes exceeds record ceiling {}",
                self.frame_number, self.data_size, MAX_RECORD_BYTES
            )));
        }
        Ok(())
    }

    /// Element type implied by the declared bit depth.
    pub fn element_type(&self) -> CoreResult<ElementType> {
        ElementType::from_bit_depth(self.bit_depth)
    }
}

/// One reassembled header-framed record.
#[derive(Debug, Clone)]
pub struct Record {
    pub header: RecordHeader,
    pub payload: Bytes,
}

/// Reassembles records out of an arbitrarily chunked byte stream.
///
/// Feed chunks with [`push`](Self::push) and drain completed records
/// with [`next_record`](Self::next_record). A `Framing` error means one
/// record was dropped; the assembler has already resynchronized at the
/// next header start and the caller simply continues draining.
#[derive(Debug, Default)]
pub struct RecordAssembler {
    buf: BytesMut,
    resync: bool,
    discarded: u64,
}

impl RecordAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one received chunk.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Total bytes dropped while recovering from malformed records.
    pub fn discarded_bytes(&self) -> u64 {
        self.discarded
    }

    /// Next complete record, if the buffered bytes contain one.
    ///
    /// `Ok(None)` means more bytes are needed. After a malformed header
    /// the payload length cannot be trusted, so recovery skips to the
    /// next `{`; counting payloads rarely contain that byte, and a
    /// desynced stream re-locks at the following record either way.
    pub fn next_record(&mut self) -> CoreResult<Option<Record>> {
        if self.resync {
            match self.buf.iter().position(|&b| b == b'{') {
                Some(at) => {
                    self.discarded += at as u64;
                    self.buf.advance(at);
                    self.resync = false;
                }
                None => {
                    self.discarded += self.buf.len() as u64;
                    self.buf.clear();
                    return Ok(None);
                }
            }
        }

        let Some(start) = self.buf.iter().position(|&b| b == b'{') else {
            return Ok(None);
        };
        if start > 0 {
            // Carry-over from a truncated payload; the bytes belong to a
            // frame that can no longer be completed.
            self.discarded += start as u64;
            self.buf.advance(start);
        }

        let Some(end) = self.buf.iter().position(|&b| b == b'}') else {
            if self.buf.len() > MAX_HEADER_BYTES {
                self.discarded += self.buf.len() as u64;
                self.buf.clear();
                return Err(Tpx3Error::Framing(format!(
                    "no header terminator within {MAX_HEADER_BYTES} bytes"
                )));
            }
            return Ok(None);
        };

        let header = match std::str::from_utf8(&self.buf[..=end])
            .map_err(|_| Tpx3Error::Framing("header is not valid UTF-8".into()))
            .and_then(RecordHeader::parse)
        {
            Ok(header) => header,
            Err(err) => {
                self.buf.advance(end + 1);
                self.resync = true;
                self.discarded += end as u64 + 1;
                return Err(err);
            }
        };

        if let Err(err) = header.validate() {
            // Declared size is untrustworthy; drop the header line and
            // resynchronize at the next record.
            self.buf.advance(end + 1);
            self.resync = true;
            self.discarded += end as u64 + 1;
            return Err(err);
        }

        // Header is followed by '\n', then exactly data_size payload bytes.
        let payload_start = end + 2;
        let Some(record_end) = payload_start.checked_add(header.data_size) else {
            self.buf.advance(end + 1);
            self.resync = true;
            return Err(Tpx3Error::Framing("record extent overflowed".into()));
        };
        if self.buf.len() < record_end {
            return Ok(None);
        }

        self.buf.advance(payload_start);
        let payload = self.buf.split_to(header.data_size).freeze();
        Ok(Some(Record { header, payload }))
    }
}

/// Splits a raw event stream into complete little-endian words.
///
/// A chunk may end mid-word; the partial tail is carried until the next
/// chunk completes it. Decoding appends to a caller-owned vector so the
/// per-chunk path stays allocation-free after warmup.
#[derive(Debug)]
pub struct EventChunker {
    elem: ElementType,
    carry: BytesMut,
}

impl EventChunker {
    pub fn new(elem: ElementType) -> Self {
        Self {
            elem,
            carry: BytesMut::new(),
        }
    }

    /// Bytes held back waiting for the rest of a word.
    pub fn pending(&self) -> usize {
        self.carry.len()
    }

    /// Decode every complete word in `chunk` (plus any carried tail)
    /// into `out`.
    pub fn push(&mut self, chunk: &[u8], out: &mut Vec<u64>) {
        let width = self.elem.width();
        if self.carry.is_empty() && chunk.len() % width == 0 {
            Self::decode(self.elem, chunk, out);
            return;
        }
        self.carry.extend_from_slice(chunk);
        let complete = self.carry.len() / width * width;
        let words = self.carry.split_to(complete);
        Self::decode(self.elem, &words, out);
    }

    fn decode(elem: ElementType, bytes: &[u8], out: &mut Vec<u64>) {
        match elem {
            ElementType::U8 => out.extend(bytes.iter().map(|&b| b as u64)),
            ElementType::U16 => out.extend(
                bytes
                    .chunks_exact(2)
                    .map(|w| u16::from_le_bytes([w[0], w[1]]) as u64),
            ),
            ElementType::U32 => out.extend(
                bytes
                    .chunks_exact(4)
                    .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]) as u64),
            ),
            ElementType::U64 => out.extend(bytes.chunks_exact(8).map(|w| {
                u64::from_le_bytes([w[0], w[1], w[2], w[3], w[4], w[5], w[6], w[7]])
            })),
        }
    }
}
