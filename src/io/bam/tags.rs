//! BAM optional fields (tags).
//!
//! Each field is encoded as:
//! - 2 bytes: tag name (e.g., "NM")
//! - 1 byte: value type (`A c C s S i I f Z H B`)
//! - N bytes: value (format depends on type)
//!
//! Field sizes: `A/c/C` = 1, `s/S` = 2, `i/I/f` = 4, `Z/H` = NUL-terminated,
//! `B` = subtype byte + i32 count + count elements.
//!
//! [`index_fields`] validates a whole tag block once and records where every
//! field lives. The index is kept in file order plus a stable sort by tag
//! name, so lookup by name is a binary search and repeated tags keep their
//! file order ([`search`]).

use super::error::BamDecodeError;
use crate::io::codec;
use log::warn;
use std::cmp::Ordering;
use std::fmt;

/// Tag value types in BAM format.
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    /// Character (A): Single printable character
    Char(u8),
    /// Integer (c, C, s, S, i, I), widened
    Int(i64),
    /// Float (f): IEEE 754 single-precision float
    Float(f32),
    /// String (Z)
    String(String),
    /// Hex string (H)
    Hex(String),
    /// Array (B): Typed array of numbers
    Array(ArrayValue),
}

/// Array value types for tag arrays (B type).
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayValue {
    /// Array of signed 8-bit integers
    Int8(Vec<i8>),
    /// Array of unsigned 8-bit integers
    UInt8(Vec<u8>),
    /// Array of signed 16-bit integers
    Int16(Vec<i16>),
    /// Array of unsigned 16-bit integers
    UInt16(Vec<u16>),
    /// Array of signed 32-bit integers
    Int32(Vec<i32>),
    /// Array of unsigned 32-bit integers
    UInt32(Vec<u32>),
    /// Array of 32-bit floats
    Float(Vec<f32>),
}

impl ArrayValue {
    /// Subtype character (`c C s S i I f`).
    pub fn subtype(&self) -> u8 {
        match self {
            ArrayValue::Int8(_) => b'c',
            ArrayValue::UInt8(_) => b'C',
            ArrayValue::Int16(_) => b's',
            ArrayValue::UInt16(_) => b'S',
            ArrayValue::Int32(_) => b'i',
            ArrayValue::UInt32(_) => b'I',
            ArrayValue::Float(_) => b'f',
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            ArrayValue::Int8(v) => v.len(),
            ArrayValue::UInt8(v) => v.len(),
            ArrayValue::Int16(v) => v.len(),
            ArrayValue::UInt16(v) => v.len(),
            ArrayValue::Int32(v) => v.len(),
            ArrayValue::UInt32(v) => v.len(),
            ArrayValue::Float(v) => v.len(),
        }
    }

    /// True when the array has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TagValue {
    /// String payload of a `Z` or `H` value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TagValue::String(s) | TagValue::Hex(s) => Some(s),
            _ => None,
        }
    }

    /// Integer payload.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            TagValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

/// Renders the SAM `TYPE:VALUE` part; integers print as `i`, floats drop
/// trailing zeros.
impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Char(c) => write!(f, "A:{}", *c as char),
            TagValue::Int(i) => write!(f, "i:{}", i),
            TagValue::Float(v) => write!(f, "f:{}", format_float(*v)),
            TagValue::String(s) => write!(f, "Z:{}", s),
            TagValue::Hex(h) => write!(f, "H:{}", h),
            TagValue::Array(arr) => {
                write!(f, "B:{}", arr.subtype() as char)?;
                match arr {
                    ArrayValue::Int8(v) => write_list(f, v),
                    ArrayValue::UInt8(v) => write_list(f, v),
                    ArrayValue::Int16(v) => write_list(f, v),
                    ArrayValue::UInt16(v) => write_list(f, v),
                    ArrayValue::Int32(v) => write_list(f, v),
                    ArrayValue::UInt32(v) => write_list(f, v),
                    ArrayValue::Float(v) => {
                        for x in v {
                            write!(f, ",{}", format_float(*x))?;
                        }
                        Ok(())
                    }
                }
            }
        }
    }
}

fn write_list<T: itoa::Integer>(f: &mut fmt::Formatter<'_>, values: &[T]) -> fmt::Result {
    let mut buf = itoa::Buffer::new();
    for &x in values {
        f.write_str(",")?;
        f.write_str(buf.format(x))?;
    }
    Ok(())
}

/// Fixed six-decimal rendering with trailing zeros and a bare trailing
/// decimal point removed (`1.500000` -> `1.5`, `2.000000` -> `2`).
pub fn format_float(value: f32) -> String {
    let mut text = format!("{:.6}", value);
    if text.contains('.') {
        let trimmed = text.trim_end_matches('0').trim_end_matches('.').len();
        text.truncate(trimmed);
    }
    if text == "-0" {
        text.remove(0);
    }
    text
}

/// Location of one optional field inside a tag block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldEntry {
    /// Two-character tag name
    pub tag: [u8; 2],
    /// Type code (`A`, `i`, `Z`, ...)
    pub type_code: u8,
    /// Offset of the value (after tag and type) within the tag block
    pub offset: usize,
    /// Size of the value in bytes
    pub size: usize,
}

impl FieldEntry {
    /// The value bytes within `block`.
    pub fn value_bytes<'a>(&self, block: &'a [u8]) -> &'a [u8] {
        &block[self.offset..self.offset + self.size]
    }
}

/// Validated index over a tag block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldIndex {
    /// Entries in file order.
    entries: Vec<FieldEntry>,
    /// Positions into `entries`, stably sorted by tag name.
    sorted: Vec<usize>,
}

impl FieldIndex {
    /// Entries in file order.
    pub fn entries(&self) -> &[FieldEntry] {
        &self.entries
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the block holds no fields.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries sorted by tag name (file order among equal tags).
    pub fn sorted(&self) -> impl Iterator<Item = &FieldEntry> {
        self.sorted.iter().map(|&i| &self.entries[i])
    }

    /// Range of sorted positions holding `tag`.
    fn run(&self, tag: &[u8; 2]) -> (usize, usize) {
        let first = self
            .sorted
            .partition_point(|&i| self.entries[i].tag.cmp(tag) == Ordering::Less);
        let len = self.sorted[first..]
            .iter()
            .take_while(|&&i| &self.entries[i].tag == tag)
            .count();
        (first, len)
    }
}

/// Find the `which`-th occurrence of `tag`.
///
/// Negative `which` counts from the end (`-1` is the last occurrence).
/// Out-of-range selectors wrap around the run of matching fields.
pub fn search<'a>(index: &'a FieldIndex, tag: &[u8; 2], which: i32) -> Option<&'a FieldEntry> {
    let (first, run) = index.run(tag);
    if run == 0 {
        return None;
    }
    let run_i = run as i64;
    let want = if which < 0 {
        run_i + i64::from(which)
    } else {
        i64::from(which)
    };
    let pick = want.rem_euclid(run_i) as usize;
    Some(&index.entries[index.sorted[first + pick]])
}

/// Number of fields named `tag`.
pub fn count(index: &FieldIndex, tag: &[u8; 2]) -> usize {
    index.run(tag).1
}

/// Size of the value of type `type_code` starting at `value`.
fn value_size(tag: [u8; 2], type_code: u8, value: &[u8]) -> Result<usize, BamDecodeError> {
    Ok(match type_code {
        b'A' | b'c' | b'C' => 1,
        b's' | b'S' => 2,
        b'i' | b'I' | b'f' => 4,
        b'Z' | b'H' => match value.iter().position(|&b| b == 0) {
            Some(nul) => nul + 1,
            None => {
                return Err(BamDecodeError::MissingNulTerminator {
                    field: format!("tag {}{}", tag[0] as char, tag[1] as char),
                    offset: 0,
                })
            }
        },
        b'B' => {
            let subtype = *value.first().ok_or_else(|| BamDecodeError::UnexpectedEof {
                context: "array tag subtype".to_string(),
                expected: 1,
                actual: 0,
            })?;
            let elem = element_size(subtype)?;
            let count = codec::le_i32(value, 1).ok_or_else(|| BamDecodeError::UnexpectedEof {
                context: "array tag count".to_string(),
                expected: 5,
                actual: value.len(),
            })?;
            if count < 0 {
                return Err(BamDecodeError::InvalidData {
                    message: format!("negative array length {} in tag", count),
                });
            }
            5 + count as usize * elem
        }
        other => {
            return Err(BamDecodeError::InvalidTagType {
                tag,
                type_code: other,
            })
        }
    })
}

fn element_size(subtype: u8) -> Result<usize, BamDecodeError> {
    match subtype {
        b'c' | b'C' => Ok(1),
        b's' | b'S' => Ok(2),
        b'i' | b'I' | b'f' => Ok(4),
        other => Err(BamDecodeError::InvalidArraySubtype { subtype: other }),
    }
}

/// Walk a tag block, validating every field's size against the block.
///
/// Unknown type codes, unterminated strings and fields running past the
/// end of the block are errors.
pub fn index_fields(block: &[u8]) -> Result<FieldIndex, BamDecodeError> {
    let mut entries = Vec::new();
    let mut cursor = 0;

    while cursor < block.len() {
        if cursor + 3 > block.len() {
            return Err(BamDecodeError::SectionOverflow {
                section: "optional field header",
                end: cursor + 3,
                size: block.len(),
            });
        }
        let tag = [block[cursor], block[cursor + 1]];
        let type_code = block[cursor + 2];
        let offset = cursor + 3;

        let size = value_size(tag, type_code, &block[offset..])?;
        let end = offset + size;
        if end > block.len() {
            return Err(BamDecodeError::SectionOverflow {
                section: "optional field",
                end,
                size: block.len(),
            });
        }

        entries.push(FieldEntry {
            tag,
            type_code,
            offset,
            size,
        });
        cursor = end;
    }

    let mut sorted: Vec<usize> = (0..entries.len()).collect();
    sorted.sort_by_key(|&i| entries[i].tag);

    Ok(FieldIndex { entries, sorted })
}

/// Decode one field's value.
pub fn decode_value(entry: &FieldEntry, block: &[u8]) -> Result<TagValue, BamDecodeError> {
    let data = entry.value_bytes(block);
    let short = || BamDecodeError::UnexpectedEof {
        context: format!("tag {}{}", entry.tag[0] as char, entry.tag[1] as char),
        expected: entry.size,
        actual: data.len(),
    };

    Ok(match entry.type_code {
        b'A' => TagValue::Char(data[0]),
        b'c' => TagValue::Int(i64::from(data[0] as i8)),
        b'C' => TagValue::Int(i64::from(data[0])),
        b's' => TagValue::Int(i64::from(codec::le_i16(data, 0).ok_or_else(short)?)),
        b'S' => TagValue::Int(i64::from(codec::le_u16(data, 0).ok_or_else(short)?)),
        b'i' => TagValue::Int(i64::from(codec::le_i32(data, 0).ok_or_else(short)?)),
        b'I' => TagValue::Int(i64::from(codec::le_u32(data, 0).ok_or_else(short)?)),
        b'f' => TagValue::Float(codec::le_f32(data, 0).ok_or_else(short)?),
        b'Z' | b'H' => {
            let text = std::str::from_utf8(&data[..data.len() - 1]).map_err(|source| {
                BamDecodeError::InvalidUtf8 {
                    field: format!("tag {}{}", entry.tag[0] as char, entry.tag[1] as char),
                    source,
                }
            })?;
            if entry.type_code == b'Z' {
                TagValue::String(text.to_string())
            } else {
                TagValue::Hex(text.to_string())
            }
        }
        b'B' => TagValue::Array(decode_array(data)?),
        other => {
            return Err(BamDecodeError::InvalidTagType {
                tag: entry.tag,
                type_code: other,
            })
        }
    })
}

fn decode_array(data: &[u8]) -> Result<ArrayValue, BamDecodeError> {
    let subtype = data[0];
    let elem = element_size(subtype)?;
    let body = &data[5..];
    let n = body.len() / elem;

    Ok(match subtype {
        b'c' => ArrayValue::Int8(body.iter().map(|&b| b as i8).collect()),
        b'C' => ArrayValue::UInt8(body.to_vec()),
        b's' => ArrayValue::Int16((0..n).filter_map(|i| codec::le_i16(body, i * 2)).collect()),
        b'S' => ArrayValue::UInt16((0..n).filter_map(|i| codec::le_u16(body, i * 2)).collect()),
        b'i' => ArrayValue::Int32((0..n).filter_map(|i| codec::le_i32(body, i * 4)).collect()),
        b'I' => ArrayValue::UInt32((0..n).filter_map(|i| codec::le_u32(body, i * 4)).collect()),
        _ => ArrayValue::Float((0..n).filter_map(|i| codec::le_f32(body, i * 4)).collect()),
    })
}

/// Owned optional fields of a decoded record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tags {
    data: Vec<u8>,
    index: FieldIndex,
}

impl Tags {
    /// Create empty tags.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and take ownership of a raw tag block.
    pub fn from_raw(data: Vec<u8>) -> Result<Self, BamDecodeError> {
        let index = index_fields(&data)?;
        Ok(Self { data, index })
    }

    /// Get the raw tag data.
    pub fn as_raw(&self) -> &[u8] {
        &self.data
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Check if tags are empty.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// The field index.
    pub fn index(&self) -> &FieldIndex {
        &self.index
    }

    /// Value of the `which`-th occurrence of `tag` (see [`search`]).
    ///
    /// ```
    /// # use ngs_bam::io::bam::{Tags, TagValue};
    /// let tags = Tags::from_raw(vec![
    ///     b'X', b'S', b'A', b'+',
    ///     b'N', b'M', b'i', 5, 0, 0, 0,
    ///     b'X', b'S', b'A', b'-',
    /// ]).unwrap();
    /// assert_eq!(tags.get(b"XS", 0).unwrap(), Some(TagValue::Char(b'+')));
    /// assert_eq!(tags.get(b"XS", -1).unwrap(), Some(TagValue::Char(b'-')));
    /// assert_eq!(tags.get(b"ZZ", 0).unwrap(), None);
    /// ```
    pub fn get(&self, tag: &[u8; 2], which: i32) -> Result<Option<TagValue>, BamDecodeError> {
        search(&self.index, tag, which)
            .map(|entry| decode_value(entry, &self.data))
            .transpose()
    }

    /// Number of fields named `tag`.
    pub fn count(&self, tag: &[u8; 2]) -> usize {
        count(&self.index, tag)
    }

    /// Visit every field in sorted order.
    ///
    /// Fields whose value cannot be decoded are logged and skipped.
    pub fn for_each<F>(&self, f: F)
    where
        F: FnMut([u8; 2], TagValue),
    {
        for_each_field(&self.index, &self.data, f);
    }

    /// Read group (first `RG` of type `Z`).
    pub fn read_group(&self) -> Option<&str> {
        read_group(&self.index, &self.data)
    }
}

pub(crate) fn for_each_field<F>(index: &FieldIndex, block: &[u8], mut f: F)
where
    F: FnMut([u8; 2], TagValue),
{
    for entry in index.sorted() {
        match decode_value(entry, block) {
            Ok(value) => f(entry.tag, value),
            Err(e) => warn!(
                "skipping optional field {}{}: {}",
                entry.tag[0] as char, entry.tag[1] as char, e
            ),
        }
    }
}

pub(crate) fn read_group<'a>(index: &FieldIndex, block: &'a [u8]) -> Option<&'a str> {
    let (first, run) = index.run(b"RG");
    index.sorted[first..first + run]
        .iter()
        .map(|&i| &index.entries[i])
        .find(|entry| entry.type_code == b'Z')
        .and_then(|entry| {
            let bytes = entry.value_bytes(block);
            std::str::from_utf8(&bytes[..bytes.len() - 1]).ok()
        })
}

/// Append one field as SAM text (`TG:T:VALUE`) without a leading tab.
pub fn write_sam_field(
    entry: &FieldEntry,
    block: &[u8],
    out: &mut String,
) -> Result<(), BamDecodeError> {
    let value = decode_value(entry, block)?;
    out.push(entry.tag[0] as char);
    out.push(entry.tag[1] as char);
    out.push(':');
    out.push_str(&value.to_string());
    Ok(())
}

/// Encode one SAM `TAG:TYPE:VALUE` field into BAM binary form, appending
/// to `out`.
///
/// `i` values are stored as `i` (or `I` above `i32::MAX`), arrays keep
/// their declared subtype.
pub fn encode_sam_field(text: &[u8], out: &mut Vec<u8>) -> Result<(), BamDecodeError> {
    let bad = |message: String| BamDecodeError::sam("optional field", message);
    let shown = || String::from_utf8_lossy(text).into_owned();

    if text.len() < 5 || text[2] != b':' || text[4] != b':' {
        return Err(bad(format!("expected TAG:TYPE:VALUE, got {:?}", shown())));
    }
    let tag = [text[0], text[1]];
    if !tag[0].is_ascii_alphabetic() || !tag[1].is_ascii_alphanumeric() {
        return Err(bad(format!("invalid tag name in {:?}", shown())));
    }
    let type_code = text[3];
    let value = &text[5..];
    let value_str = std::str::from_utf8(value).map_err(|_| bad(format!("non-ASCII value in {:?}", shown())))?;

    out.extend_from_slice(&tag);
    match type_code {
        b'A' => {
            if value.len() != 1 || !value[0].is_ascii_graphic() {
                return Err(bad(format!("invalid character value in {:?}", shown())));
            }
            out.push(b'A');
            out.push(value[0]);
        }
        b'i' => {
            let n: i64 = value_str
                .parse()
                .map_err(|_| bad(format!("invalid integer in {:?}", shown())))?;
            if let Ok(v) = i32::try_from(n) {
                out.push(b'i');
                out.extend_from_slice(&v.to_le_bytes());
            } else if let Ok(v) = u32::try_from(n) {
                out.push(b'I');
                out.extend_from_slice(&v.to_le_bytes());
            } else {
                return Err(bad(format!("integer out of range in {:?}", shown())));
            }
        }
        b'f' => {
            let v: f32 = value_str
                .parse()
                .map_err(|_| bad(format!("invalid float in {:?}", shown())))?;
            out.push(b'f');
            out.extend_from_slice(&v.to_le_bytes());
        }
        b'Z' | b'H' => {
            if value.iter().any(|&b| b == 0 || b == b'\t' || b == b'\n') {
                return Err(bad(format!("invalid string value in {:?}", shown())));
            }
            if type_code == b'H' && (value.len() % 2 != 0 || !value.iter().all(u8::is_ascii_hexdigit)) {
                return Err(bad(format!("invalid hex value in {:?}", shown())));
            }
            out.push(type_code);
            out.extend_from_slice(value);
            out.push(0);
        }
        b'B' => encode_array(value_str, out).map_err(|e| match e {
            BamDecodeError::SamSyntax { message, .. } => bad(format!("{} in {:?}", message, shown())),
            other => other,
        })?,
        other => {
            return Err(BamDecodeError::InvalidTagType {
                tag,
                type_code: other,
            })
        }
    }
    Ok(())
}

fn encode_array(value: &str, out: &mut Vec<u8>) -> Result<(), BamDecodeError> {
    let mut parts = value.split(',');
    let subtype = match parts.next().map(str::as_bytes) {
        Some([sub]) => *sub,
        _ => return Err(BamDecodeError::sam("optional field", "missing array subtype")),
    };
    element_size(subtype)?;

    out.push(b'B');
    out.push(subtype);
    let count_pos = out.len();
    out.extend_from_slice(&0i32.to_le_bytes());

    let mut count: i32 = 0;
    for part in parts {
        let bad = || BamDecodeError::sam("optional field", format!("invalid array element {:?}", part));
        match subtype {
            b'c' => out.extend_from_slice(&part.parse::<i8>().map_err(|_| bad())?.to_le_bytes()),
            b'C' => out.extend_from_slice(&part.parse::<u8>().map_err(|_| bad())?.to_le_bytes()),
            b's' => out.extend_from_slice(&part.parse::<i16>().map_err(|_| bad())?.to_le_bytes()),
            b'S' => out.extend_from_slice(&part.parse::<u16>().map_err(|_| bad())?.to_le_bytes()),
            b'i' => out.extend_from_slice(&part.parse::<i32>().map_err(|_| bad())?.to_le_bytes()),
            b'I' => out.extend_from_slice(&part.parse::<u32>().map_err(|_| bad())?.to_le_bytes()),
            _ => out.extend_from_slice(&part.parse::<f32>().map_err(|_| bad())?.to_le_bytes()),
        }
        count += 1;
    }
    out[count_pos..count_pos + 4].copy_from_slice(&count.to_le_bytes());
    Ok(())
}
