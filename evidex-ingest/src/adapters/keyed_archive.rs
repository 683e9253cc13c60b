//! Binary message-body decoder
//!
//! Two encodings are understood:
//! - `bplist00` binary property lists produced by `NSKeyedArchiver`: the
//!   object table is walked from `$top.root`, following `NSString` /
//!   `NS.string` references until a string is reached.
//! - `streamtyped` typedstreams: the payload following the `NSString` class
//!   marker is read as a `+`-prefixed, length-delimited UTF-8 string.
//!
//! Every structural anomaly is a `DecodeError`; nothing here panics on
//! hostile input.

use super::DecodeError;
use std::cell::Cell;

const BPLIST_MAGIC: &[u8] = b"bplist00";
const TYPEDSTREAM_MAGIC: &[u8] = b"streamtyped";
const TRAILER_LEN: usize = 32;
const KEYED_ARCHIVE_VERSION: i64 = 100_000;
const MAX_STRING_HOPS: usize = 4;
const MAX_NESTING: usize = 32;
const MAX_OBJECT_VISITS: usize = 100_000;

/// Decode a message body to text
pub fn decode_body(data: &[u8]) -> Result<String, DecodeError> {
    if data.is_empty() {
        return Err(DecodeError::Truncated("empty body".to_string()));
    }
    if data.starts_with(BPLIST_MAGIC) {
        return decode_keyed_archive(data);
    }
    let header = &data[..data.len().min(16)];
    if header
        .windows(TYPEDSTREAM_MAGIC.len())
        .any(|w| w == TYPEDSTREAM_MAGIC)
    {
        return decode_typedstream(data);
    }
    Err(DecodeError::UnsupportedEncoding(format!(
        "unrecognized header {:02x?}",
        &data[..data.len().min(8)]
    )))
}

/// Parsed property-list value
#[derive(Debug, Clone, PartialEq)]
pub enum PlistValue {
    Null,
    Bool(bool),
    Int(i64),
    Real(f64),
    Date(f64),
    Data(Vec<u8>),
    String(String),
    Uid(u64),
    Array(Vec<PlistValue>),
    Dict(Vec<(String, PlistValue)>),
}

impl PlistValue {
    pub fn get(&self, key: &str) -> Option<&PlistValue> {
        match self {
            PlistValue::Dict(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }
}

/// Parse a binary property list into a value tree
pub fn parse_bplist(data: &[u8]) -> Result<PlistValue, DecodeError> {
    BinaryPlist::new(data)?.top()
}

fn decode_keyed_archive(data: &[u8]) -> Result<String, DecodeError> {
    let top = parse_bplist(data)?;
    if !matches!(top, PlistValue::Dict(_)) {
        return Err(DecodeError::Malformed("top-level object is not a dictionary".to_string()));
    }

    match top.get("$archiver") {
        Some(PlistValue::String(s)) if s == "NSKeyedArchiver" => {}
        Some(other) => {
            return Err(DecodeError::UnsupportedEncoding(format!("archiver {:?}", other)))
        }
        None => return Err(DecodeError::MissingKey("$archiver".to_string())),
    }
    match top.get("$version") {
        Some(PlistValue::Int(KEYED_ARCHIVE_VERSION)) => {}
        Some(other) => {
            return Err(DecodeError::UnsupportedEncoding(format!("archive version {:?}", other)))
        }
        None => return Err(DecodeError::MissingKey("$version".to_string())),
    }

    let objects = match top.get("$objects") {
        Some(PlistValue::Array(objects)) => objects,
        _ => return Err(DecodeError::MissingKey("$objects".to_string())),
    };
    let root = match top.get("$top").and_then(|t| t.get("root")) {
        Some(PlistValue::Uid(uid)) => *uid,
        _ => return Err(DecodeError::MissingKey("$top.root".to_string())),
    };

    let mut current = deref(objects, root)?;
    for _ in 0..=MAX_STRING_HOPS {
        match current {
            PlistValue::String(s) if s == "$null" => {
                return Err(DecodeError::MissingKey("string payload is $null".to_string()))
            }
            PlistValue::String(s) => return Ok(s.clone()),
            PlistValue::Dict(_) => {
                let next = current
                    .get("NS.string")
                    .or_else(|| current.get("NSString"))
                    .ok_or_else(|| DecodeError::MissingKey("NS.string".to_string()))?;
                current = match next {
                    PlistValue::Uid(uid) => deref(objects, *uid)?,
                    other => other,
                };
            }
            other => {
                return Err(DecodeError::Malformed(format!(
                    "expected string object, found {:?}",
                    other
                )))
            }
        }
    }
    Err(DecodeError::Malformed(format!(
        "no string within {} references of root",
        MAX_STRING_HOPS
    )))
}

fn deref(objects: &[PlistValue], uid: u64) -> Result<&PlistValue, DecodeError> {
    usize::try_from(uid)
        .ok()
        .and_then(|i| objects.get(i))
        .ok_or_else(|| DecodeError::Malformed(format!("UID {} outside object table", uid)))
}

fn decode_typedstream(data: &[u8]) -> Result<String, DecodeError> {
    const CLASS_MARKER: &[u8] = b"NSString";
    const SEARCH_WINDOW: usize = 16;

    let marker = data
        .windows(CLASS_MARKER.len())
        .position(|w| w == CLASS_MARKER)
        .ok_or_else(|| DecodeError::MissingKey("NSString".to_string()))?;
    let after = marker + CLASS_MARKER.len();
    let window_end = (after + SEARCH_WINDOW).min(data.len());
    let plus = data[after..window_end]
        .iter()
        .position(|&b| b == b'+')
        .map(|p| after + p)
        .ok_or_else(|| DecodeError::Truncated("string payload marker".to_string()))?;

    let mut cursor = plus + 1;
    let len_byte = *data
        .get(cursor)
        .ok_or_else(|| DecodeError::Truncated("string length".to_string()))?;
    cursor += 1;
    let len = match len_byte {
        0x81 => {
            let bytes = slice(data, cursor, 2)?;
            cursor += 2;
            u16::from_le_bytes([bytes[0], bytes[1]]) as usize
        }
        0x82 => {
            let bytes = slice(data, cursor, 4)?;
            cursor += 4;
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
        }
        b if b < 0x80 => b as usize,
        b => {
            return Err(DecodeError::Malformed(format!("string length tag 0x{:02x}", b)))
        }
    };

    let payload = slice(data, cursor, len)?;
    String::from_utf8(payload.to_vec())
        .map_err(|e| DecodeError::Malformed(format!("string payload is not UTF-8: {}", e)))
}

fn slice(data: &[u8], start: usize, len: usize) -> Result<&[u8], DecodeError> {
    start
        .checked_add(len)
        .and_then(|end| data.get(start..end))
        .ok_or_else(|| {
            DecodeError::Truncated(format!("need {} bytes at offset {}", len, start))
        })
}

fn read_uint(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

struct BinaryPlist<'a> {
    data: &'a [u8],
    offsets: Vec<usize>,
    ref_size: usize,
    top: usize,
    /// Shared references can make a small buffer expand exponentially
    visits: Cell<usize>,
}

impl<'a> BinaryPlist<'a> {
    fn new(data: &'a [u8]) -> Result<Self, DecodeError> {
        if !data.starts_with(BPLIST_MAGIC) {
            return Err(DecodeError::UnsupportedEncoding("not a bplist00 buffer".to_string()));
        }
        if data.len() < BPLIST_MAGIC.len() + TRAILER_LEN {
            return Err(DecodeError::Truncated(format!("{} byte property list", data.len())));
        }

        let trailer = &data[data.len() - TRAILER_LEN..];
        let offset_size = trailer[6] as usize;
        let ref_size = trailer[7] as usize;
        let num_objects = read_uint(&trailer[8..16]);
        let top = read_uint(&trailer[16..24]);
        let table_offset = read_uint(&trailer[24..32]);

        if !(1..=8).contains(&offset_size) || !(1..=8).contains(&ref_size) {
            return Err(DecodeError::Malformed(format!(
                "trailer sizes offset={} ref={}",
                offset_size, ref_size
            )));
        }
        if top >= num_objects {
            return Err(DecodeError::Malformed("top object outside object table".to_string()));
        }

        let body_end = data.len() - TRAILER_LEN;
        let table = usize::try_from(num_objects)
            .ok()
            .and_then(|n| n.checked_mul(offset_size))
            .zip(usize::try_from(table_offset).ok())
            .and_then(|(len, start)| start.checked_add(len).map(|end| (start, end)))
            .filter(|&(_, end)| end <= body_end)
            .ok_or_else(|| DecodeError::Truncated("offset table past end of buffer".to_string()))?;

        let offsets = data[table.0..table.1]
            .chunks(offset_size)
            .map(|chunk| read_uint(chunk) as usize)
            .collect();

        Ok(Self {
            data: &data[..body_end],
            offsets,
            ref_size,
            top: top as usize,
            visits: Cell::new(0),
        })
    }

    fn top(&self) -> Result<PlistValue, DecodeError> {
        self.object(self.top, 0)
    }

    fn object(&self, index: usize, depth: usize) -> Result<PlistValue, DecodeError> {
        if depth > MAX_NESTING {
            return Err(DecodeError::Malformed("object nesting too deep".to_string()));
        }
        self.visits.set(self.visits.get() + 1);
        if self.visits.get() > MAX_OBJECT_VISITS {
            return Err(DecodeError::Malformed("object graph too large".to_string()));
        }
        let offset = *self
            .offsets
            .get(index)
            .ok_or_else(|| DecodeError::Malformed(format!("object ref {} out of range", index)))?;
        let marker = *self
            .data
            .get(offset)
            .ok_or_else(|| DecodeError::Truncated(format!("object {} at offset {}", index, offset)))?;
        let info = (marker & 0x0f) as usize;

        match marker >> 4 {
            0x0 => match info {
                0x0 => Ok(PlistValue::Null),
                0x8 => Ok(PlistValue::Bool(false)),
                0x9 => Ok(PlistValue::Bool(true)),
                _ => Err(DecodeError::Malformed(format!("singleton marker 0x{:02x}", marker))),
            },
            0x1 => {
                let size = 1usize << info.min(4);
                if size > 8 {
                    return Err(DecodeError::UnsupportedEncoding("128-bit integer".to_string()));
                }
                Ok(PlistValue::Int(read_uint(slice(self.data, offset + 1, size)?) as i64))
            }
            0x2 => {
                let bytes = slice(self.data, offset + 1, 1usize << info.min(4))?;
                match bytes.len() {
                    4 => Ok(PlistValue::Real(
                        f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
                    )),
                    8 => Ok(PlistValue::Real(f64::from_bits(read_uint(bytes)))),
                    n => Err(DecodeError::UnsupportedEncoding(format!("{} byte real", n))),
                }
            }
            0x3 if info == 0x3 => {
                let bytes = slice(self.data, offset + 1, 8)?;
                Ok(PlistValue::Date(f64::from_bits(read_uint(bytes))))
            }
            0x4 => {
                let (len, start) = self.length(offset, info)?;
                Ok(PlistValue::Data(slice(self.data, start, len)?.to_vec()))
            }
            0x5 => {
                let (len, start) = self.length(offset, info)?;
                let bytes = slice(self.data, start, len)?;
                String::from_utf8(bytes.to_vec())
                    .map(PlistValue::String)
                    .map_err(|_| DecodeError::Malformed("non-ASCII byte in ASCII string".to_string()))
            }
            0x6 => {
                let (len, start) = self.length(offset, info)?;
                let byte_len = len
                    .checked_mul(2)
                    .ok_or_else(|| DecodeError::Malformed("string length overflow".to_string()))?;
                let units: Vec<u16> = slice(self.data, start, byte_len)?
                    .chunks(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect();
                String::from_utf16(&units)
                    .map(PlistValue::String)
                    .map_err(|_| DecodeError::Malformed("invalid UTF-16 string".to_string()))
            }
            0x8 => Ok(PlistValue::Uid(read_uint(slice(self.data, offset + 1, info + 1)?))),
            0xA => {
                let (len, start) = self.length(offset, info)?;
                let refs = self.refs(start, len)?;
                refs.into_iter()
                    .map(|r| self.object(r, depth + 1))
                    .collect::<Result<Vec<_>, _>>()
                    .map(PlistValue::Array)
            }
            0xD => {
                let (len, start) = self.length(offset, info)?;
                let refs = self.refs(start, len.saturating_mul(2))?;
                let (keys, values) = refs.split_at(len);
                let mut entries = Vec::with_capacity(len);
                for (&k, &v) in keys.iter().zip(values) {
                    let key = match self.object(k, depth + 1)? {
                        PlistValue::String(s) => s,
                        other => {
                            return Err(DecodeError::Malformed(format!(
                                "dictionary key is not a string: {:?}",
                                other
                            )))
                        }
                    };
                    entries.push((key, self.object(v, depth + 1)?));
                }
                Ok(PlistValue::Dict(entries))
            }
            _ => Err(DecodeError::UnsupportedEncoding(format!(
                "object marker 0x{:02x}",
                marker
            ))),
        }
    }

    /// Object length and payload start; 0xF means an int object follows
    fn length(&self, offset: usize, info: usize) -> Result<(usize, usize), DecodeError> {
        if info != 0x0f {
            return Ok((info, offset + 1));
        }
        let int_marker = *self
            .data
            .get(offset + 1)
            .ok_or_else(|| DecodeError::Truncated("length marker".to_string()))?;
        if int_marker >> 4 != 0x1 {
            return Err(DecodeError::Malformed(format!("length marker 0x{:02x}", int_marker)));
        }
        let size = 1usize << (int_marker & 0x0f).min(4);
        if size > 8 {
            return Err(DecodeError::Malformed("length wider than 64 bits".to_string()));
        }
        let len = read_uint(slice(self.data, offset + 2, size)?) as usize;
        Ok((len, offset + 2 + size))
    }

    fn refs(&self, start: usize, count: usize) -> Result<Vec<usize>, DecodeError> {
        let byte_len = count
            .checked_mul(self.ref_size)
            .ok_or_else(|| DecodeError::Malformed("reference count overflow".to_string()))?;
        Ok(slice(self.data, start, byte_len)?
            .chunks(self.ref_size)
            .map(|c| read_uint(c) as usize)
            .collect())
    }
}
