//! BAM record structure and parsing.
//!
//! A BAM record represents a single alignment (read mapped to reference).
//! Each record contains alignment information, sequence data, quality scores,
//! and optional tags.
//!
//! # Binary Format
//!
//! ```text
//! BAM Record (binary, little-endian), after the int32 block_size prefix:
//! - refID (int32): Reference sequence ID (-1 for unmapped)
//! - pos (int32): 0-based leftmost position (-1 for unmapped)
//! - l_read_name (uint8): Length of read name (includes null terminator)
//! - mapq (uint8): Mapping quality (255 = unavailable)
//! - bin (uint16): BAI index bin (for indexing)
//! - n_cigar_op (uint16): Number of CIGAR operations
//! - flag (uint16): Bitwise FLAGS
//! - l_seq (int32): Sequence length
//! - next_refID (int32): Reference ID of mate/next read
//! - next_pos (int32): Position of mate/next read
//! - tlen (int32): Template length
//! - read_name (char[l_read_name]): Null-terminated read name
//! - cigar (uint32[n_cigar_op]): CIGAR operations
//! - seq (uint8[(l_seq+1)/2]): 4-bit encoded sequence
//! - qual (char[l_seq]): Phred quality scores
//! - tags: Optional tags (variable length)
//! ```
//!
//! # Borrowed and owned records
//!
//! [`RawRecord`] wraps the record body as a `Cow<[u8]>`. A record that lies
//! inside one inflated BGZF block borrows the reader's block buffer and
//! lives only until the next read; one that straddles a block boundary is
//! an owned copy. [`RawRecord::into_owned`] and [`RawRecord::to_record`]
//! detach a record from the reader.
//!
//! # Unmapped records
//!
//! A record counts as unmapped when FLAG 0x4 is set, its reference id is
//! outside the header, its position is negative or its read name is empty.
//! Unmapped records report no reference, no position and no CIGAR whatever
//! their raw bytes hold. The mate follows the same rule using FLAG 0x1/0x8
//! and the next-segment fields.

use super::cigar::{self, format_cigar, CigarAlphabet, CigarOp};
use super::error::BamDecodeError;
use super::sequence::{decode_sequence, quality_to_text};
use super::tags::{self, ArrayValue, FieldIndex, TagValue, Tags};
use crate::io::codec;
use log::debug;
use std::borrow::Cow;

/// Size of the fixed record header (everything before the read name).
pub const FIXED_LEN: usize = 32;

/// FLAG bits.
pub mod flags {
    /// Template has multiple segments
    pub const PAIRED: u16 = 0x1;
    /// Each segment properly aligned
    pub const PROPER_PAIR: u16 = 0x2;
    /// Segment unmapped
    pub const UNMAPPED: u16 = 0x4;
    /// Next segment unmapped
    pub const MATE_UNMAPPED: u16 = 0x8;
    /// Sequence reverse complemented
    pub const REVERSE: u16 = 0x10;
    /// Next segment reverse complemented
    pub const MATE_REVERSE: u16 = 0x20;
    /// First segment in the template
    pub const FIRST: u16 = 0x40;
    /// Last segment in the template
    pub const LAST: u16 = 0x80;
    /// Secondary alignment
    pub const SECONDARY: u16 = 0x100;
    /// Not passing quality controls
    pub const QC_FAIL: u16 = 0x200;
    /// PCR or optical duplicate
    pub const DUPLICATE: u16 = 0x400;
    /// Supplementary alignment
    pub const SUPPLEMENTARY: u16 = 0x800;
}

/// Result of one read call.
///
/// Empty records and end of data are ordinary outcomes, distinct from
/// decode errors; callers match on them explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome<T> {
    /// A decoded record
    Record(T),
    /// A record with no name, no sequence and no CIGAR; skip it
    Empty,
    /// No more records
    EndOfData,
}

impl<T> ReadOutcome<T> {
    /// Map the record payload.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> ReadOutcome<U> {
        match self {
            ReadOutcome::Record(r) => ReadOutcome::Record(f(r)),
            ReadOutcome::Empty => ReadOutcome::Empty,
            ReadOutcome::EndOfData => ReadOutcome::EndOfData,
        }
    }

    /// The record, if any.
    pub fn into_record(self) -> Option<T> {
        match self {
            ReadOutcome::Record(r) => Some(r),
            _ => None,
        }
    }

    /// True at end of data.
    pub fn is_end(&self) -> bool {
        matches!(self, ReadOutcome::EndOfData)
    }
}

/// End offsets of the variable-length sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Layout {
    name_end: usize,
    cigar_end: usize,
    seq_end: usize,
    qual_end: usize,
}

fn field_i32(data: &[u8], offset: usize) -> i32 {
    codec::le_i32(data, offset).unwrap_or_default()
}

fn field_u16(data: &[u8], offset: usize) -> u16 {
    codec::le_u16(data, offset).unwrap_or_default()
}

fn check_section(
    section: &'static str,
    end: usize,
    size: usize,
) -> Result<usize, BamDecodeError> {
    if end > size {
        return Err(BamDecodeError::SectionOverflow { section, end, size });
    }
    Ok(end)
}

/// Reference IDs are -1 (unmapped) or non-negative.
fn check_reference_id(value: i32, field: &str) -> Result<(), BamDecodeError> {
    if value < -1 {
        return Err(BamDecodeError::InvalidReferenceId {
            value,
            field: field.to_string(),
        });
    }
    Ok(())
}

/// Validated section layout and tag index of a record whose bytes are held
/// elsewhere.
#[derive(Debug, Clone)]
pub(crate) struct Parsed {
    layout: Layout,
    fields: FieldIndex,
    n_references: usize,
}

/// Record body bytes: borrowed from a block buffer or owned after a copy.
pub type RecordBytes<'a> = Cow<'a, [u8]>;

/// One undecoded BAM record body (without the block size prefix).
///
/// Section boundaries and the optional-field index are validated when the
/// record is parsed; bases, qualities and tag values are decoded on demand.
#[derive(Debug, Clone)]
pub struct RawRecord<'a> {
    data: RecordBytes<'a>,
    layout: Layout,
    fields: FieldIndex,
    n_references: usize,
}

impl<'a> RawRecord<'a> {
    /// Parse a record body.
    ///
    /// `n_references` is the number of reference sequences in the header; ids
    /// at or beyond it make the record (or its mate) unmapped.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The body is shorter than the 32-byte fixed header
    /// - A reference id is below -1 or the sequence length is negative
    /// - Any section ends beyond the body
    /// - The read name is not NUL-terminated
    /// - A mapped record carries an unknown CIGAR operation
    /// - An optional field is malformed
    pub fn parse(data: Cow<'a, [u8]>, n_references: usize) -> Result<Self, BamDecodeError> {
        let size = data.len();
        if size < FIXED_LEN {
            return Err(BamDecodeError::InvalidBlockSize {
                size: size as i32,
            });
        }

        check_reference_id(field_i32(&data, 0), "read")?;
        check_reference_id(field_i32(&data, 20), "mate")?;

        let l_read_name = usize::from(data[8]);
        let n_cigar_op = usize::from(field_u16(&data, 12));
        let l_seq = field_i32(&data, 16);
        if l_seq < 0 {
            return Err(BamDecodeError::NegativeSequenceLength { length: l_seq });
        }
        let l_seq = l_seq as usize;

        let name_end = check_section("read name", FIXED_LEN + l_read_name, size)?;
        if l_read_name > 0 && data[name_end - 1] != 0 {
            return Err(BamDecodeError::MissingNulTerminator {
                field: "read name".to_string(),
                offset: name_end - 1,
            });
        }
        let cigar_end = check_section("cigar", name_end + n_cigar_op * 4, size)?;
        let seq_end = check_section("sequence", cigar_end + l_seq.div_ceil(2), size)?;
        let qual_end = check_section("quality", seq_end + l_seq, size)?;

        let fields = tags::index_fields(&data[qual_end..])?;

        let record = Self {
            data,
            layout: Layout {
                name_end,
                cigar_end,
                seq_end,
                qual_end,
            },
            fields,
            n_references,
        };

        for raw in record.cigar_raw() {
            if raw & 0x0F > 8 {
                return Err(BamDecodeError::InvalidCigarOp { value: raw & 0x0F });
            }
        }

        Ok(record)
    }

    /// Split off everything [`RawRecord::parse`] computed, keeping the bytes
    /// with their owner.
    pub(crate) fn into_parsed(self) -> Parsed {
        Parsed {
            layout: self.layout,
            fields: self.fields,
            n_references: self.n_references,
        }
    }

    /// Reattach `parsed` to the bytes it was computed from.
    pub(crate) fn from_parsed(data: RecordBytes<'a>, parsed: Parsed) -> Self {
        Self {
            data,
            layout: parsed.layout,
            fields: parsed.fields,
            n_references: parsed.n_references,
        }
    }

    /// True when the body borrows the reader's block buffer.
    pub fn is_borrowed(&self) -> bool {
        matches!(self.data, Cow::Borrowed(_))
    }

    /// Detach from the reader's buffer.
    pub fn into_owned(self) -> RawRecord<'static> {
        RawRecord {
            data: Cow::Owned(self.data.into_owned()),
            layout: self.layout,
            fields: self.fields,
            n_references: self.n_references,
        }
    }

    /// The record body bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Number of references the record was validated against.
    pub fn n_references(&self) -> usize {
        self.n_references
    }

    /// A record with no read name, no bases and no CIGAR.
    pub fn is_empty(&self) -> bool {
        self.data[8] == 0 && self.raw_sequence_len() == 0 && self.raw_cigar_len() == 0
    }

    /// Reference id exactly as stored.
    pub fn raw_reference_id(&self) -> i32 {
        field_i32(&self.data, 0)
    }

    /// Position exactly as stored (0-based).
    pub fn raw_position(&self) -> i32 {
        field_i32(&self.data, 4)
    }

    /// Raw FLAG bits.
    pub fn flags(&self) -> u16 {
        field_u16(&self.data, 14)
    }

    /// Raw mapping quality (255 = unavailable).
    pub fn mapq(&self) -> u8 {
        self.data[9]
    }

    /// BAI bin stored with the record.
    pub fn bin(&self) -> u16 {
        field_u16(&self.data, 10)
    }

    /// Next-segment reference id exactly as stored.
    pub fn raw_mate_reference_id(&self) -> i32 {
        field_i32(&self.data, 20)
    }

    /// Next-segment position exactly as stored.
    pub fn raw_mate_position(&self) -> i32 {
        field_i32(&self.data, 24)
    }

    /// Template length (TLEN).
    pub fn template_length(&self) -> i32 {
        field_i32(&self.data, 28)
    }

    fn raw_cigar_len(&self) -> usize {
        usize::from(field_u16(&self.data, 12))
    }

    fn raw_sequence_len(&self) -> usize {
        self.layout.qual_end - self.layout.seq_end
    }

    fn in_range(&self, id: i32) -> bool {
        id >= 0 && (id as usize) < self.n_references
    }

    /// The self-unmapped rule (see module docs).
    pub fn is_self_unmapped(&self) -> bool {
        self.flags() & flags::UNMAPPED != 0
            || !self.in_range(self.raw_reference_id())
            || self.raw_position() < 0
            || self.data[8] <= 1
    }

    /// The mate-unmapped rule (see module docs).
    pub fn is_mate_unmapped(&self) -> bool {
        let flags = self.flags();
        flags & flags::PAIRED == 0
            || flags & flags::MATE_UNMAPPED != 0
            || !self.in_range(self.raw_mate_reference_id())
            || self.raw_mate_position() < 0
    }

    /// Reference id, `None` when unmapped.
    pub fn reference_id(&self) -> Option<usize> {
        if self.is_self_unmapped() {
            None
        } else {
            Some(self.raw_reference_id() as usize)
        }
    }

    /// 0-based position, `None` when unmapped.
    pub fn position(&self) -> Option<i32> {
        if self.is_self_unmapped() {
            None
        } else {
            Some(self.raw_position())
        }
    }

    /// Mate reference id, `None` when the mate is unmapped.
    pub fn mate_reference_id(&self) -> Option<usize> {
        if self.is_mate_unmapped() {
            None
        } else {
            Some(self.raw_mate_reference_id() as usize)
        }
    }

    /// Mate 0-based position, `None` when the mate is unmapped.
    pub fn mate_position(&self) -> Option<i32> {
        if self.is_mate_unmapped() {
            None
        } else {
            Some(self.raw_mate_position())
        }
    }

    /// Read name without the NUL terminator; `None` when absent.
    pub fn read_name(&self) -> Option<&[u8]> {
        if self.data[8] <= 1 {
            return None;
        }
        Some(&self.data[FIXED_LEN..self.layout.name_end - 1])
    }

    /// Packed CIGAR operations; none for unmapped records.
    pub fn cigar_raw(&self) -> impl Iterator<Item = u32> + '_ {
        let ops = if self.is_self_unmapped() {
            &[][..]
        } else {
            &self.data[self.layout.name_end..self.layout.cigar_end]
        };
        ops.chunks_exact(4)
            .map(|op| codec::le_u32(op, 0).unwrap_or_default())
    }

    /// Number of CIGAR operations reported (zero when unmapped).
    pub fn cigar_len(&self) -> usize {
        if self.is_self_unmapped() {
            0
        } else {
            self.raw_cigar_len()
        }
    }

    /// Decoded CIGAR operations.
    ///
    /// Long reads whose CIGAR does not fit the 16-bit count store a
    /// placeholder `<l_seq>S<span>N` and the real operations in a `CG:B:I`
    /// tag; the tag wins when that pattern is found.
    pub fn cigar(&self) -> Result<Vec<CigarOp>, BamDecodeError> {
        let ops: Vec<CigarOp> = self
            .cigar_raw()
            .map(CigarOp::from_raw)
            .collect::<Result<_, _>>()?;

        match ops.as_slice() {
            [CigarOp::SoftClip(len), CigarOp::RefSkip(_)]
                if *len as usize == self.sequence_len() =>
            {
                match self.tag(b"CG", 0)? {
                    Some(TagValue::Array(ArrayValue::UInt32(packed))) => {
                        debug!("taking CIGAR from CG tag ({} operations)", packed.len());
                        packed.into_iter().map(CigarOp::from_raw).collect()
                    }
                    Some(TagValue::Array(ArrayValue::Int32(packed))) => packed
                        .into_iter()
                        .map(|raw| CigarOp::from_raw(raw as u32))
                        .collect(),
                    _ => Ok(ops),
                }
            }
            _ => Ok(ops),
        }
    }

    /// CIGAR as text (empty when there are no operations).
    pub fn cigar_string(
        &self,
        alphabet: CigarAlphabet,
        clipped: bool,
    ) -> Result<String, BamDecodeError> {
        Ok(format_cigar(&self.cigar()?, alphabet, clipped))
    }

    /// Number of reference bases the alignment covers, recomputed from the
    /// CIGAR on every call.
    pub fn reference_length(&self) -> u32 {
        cigar::reference_length_raw(self.cigar_raw())
    }

    /// Exclusive 0-based end on the reference, `None` when unmapped.
    pub fn end_position(&self) -> Option<i64> {
        self.position()
            .map(|pos| i64::from(pos) + i64::from(self.reference_length()))
    }

    /// Number of bases.
    pub fn sequence_len(&self) -> usize {
        self.raw_sequence_len()
    }

    /// 4-bit packed bases.
    pub fn packed_sequence(&self) -> &[u8] {
        &self.data[self.layout.cigar_end..self.layout.seq_end]
    }

    /// Bases as ASCII.
    pub fn sequence(&self) -> Result<Vec<u8>, BamDecodeError> {
        decode_sequence(self.packed_sequence(), self.sequence_len())
    }

    /// Raw Phred qualities (`0xFF` = missing).
    pub fn quality(&self) -> &[u8] {
        &self.data[self.layout.seq_end..self.layout.qual_end]
    }

    /// Optional-field bytes.
    pub fn tag_block(&self) -> &[u8] {
        &self.data[self.layout.qual_end..]
    }

    /// Optional-field index.
    pub fn tag_fields(&self) -> &FieldIndex {
        &self.fields
    }

    /// Value of the `which`-th `tag` (negative counts from the end).
    pub fn tag(&self, tag: &[u8; 2], which: i32) -> Result<Option<TagValue>, BamDecodeError> {
        tags::search(&self.fields, tag, which)
            .map(|entry| tags::decode_value(entry, self.tag_block()))
            .transpose()
    }

    /// Number of `tag` fields.
    pub fn tag_count(&self, tag: &[u8; 2]) -> usize {
        tags::count(&self.fields, tag)
    }

    /// Visit all optional fields in tag order, skipping undecodable ones.
    pub fn for_each_tag<F>(&self, f: F)
    where
        F: FnMut([u8; 2], TagValue),
    {
        tags::for_each_field(&self.fields, self.tag_block(), f);
    }

    /// Read group id (`RG:Z`).
    pub fn read_group(&self) -> Option<&str> {
        tags::read_group(&self.fields, self.tag_block())
    }

    /// Decode into a self-contained [`Record`].
    pub fn to_record(&self) -> Result<Record, BamDecodeError> {
        let name = self
            .read_name()
            .map(|bytes| {
                std::str::from_utf8(bytes)
                    .map(str::to_string)
                    .map_err(|source| BamDecodeError::InvalidUtf8 {
                        field: "read name".to_string(),
                        source,
                    })
            })
            .transpose()?;

        Ok(Record {
            name,
            reference_id: self.reference_id(),
            position: self.position(),
            mapq: if self.mapq() != 255 {
                Some(self.mapq())
            } else {
                None
            },
            flags: self.flags(),
            mate_reference_id: self.mate_reference_id(),
            mate_position: self.mate_position(),
            template_length: self.template_length(),
            sequence: self.sequence()?,
            quality: self.quality().to_vec(),
            cigar: self.cigar()?,
            tags: Tags::from_raw(self.tag_block().to_vec())?,
        })
    }
}

/// BAM alignment record.
///
/// Represents a single read alignment with all associated information.
/// Fields follow the unmapped policy of [`RawRecord`]: an unmapped read
/// has no reference, position or CIGAR.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    /// Read name/query name
    pub name: Option<String>,

    /// Reference sequence ID (index into header.references)
    pub reference_id: Option<usize>,

    /// 0-based leftmost mapping position
    pub position: Option<i32>,

    /// Mapping quality (0-254), `None` if unavailable (255)
    pub mapq: Option<u8>,

    /// Bitwise FLAGS (see [`flags`])
    pub flags: u16,

    /// Mate/next segment reference ID
    pub mate_reference_id: Option<usize>,

    /// Mate/next segment position
    pub mate_position: Option<i32>,

    /// Template length (TLEN)
    pub template_length: i32,

    /// Sequence bases (ASCII: A, C, G, T, N, etc.)
    pub sequence: Vec<u8>,

    /// Raw Phred quality scores (`0xFF` = missing)
    pub quality: Vec<u8>,

    /// CIGAR operations
    pub cigar: Vec<CigarOp>,

    /// Optional tags
    pub tags: Tags,
}

impl Record {
    /// Create a new empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if the read is unmapped.
    pub fn is_unmapped(&self) -> bool {
        self.reference_id.is_none()
    }

    /// Check if the read is paired.
    pub fn is_paired(&self) -> bool {
        self.flags & flags::PAIRED != 0
    }

    /// Check if the read is a reverse complement.
    pub fn is_reverse_complement(&self) -> bool {
        self.flags & flags::REVERSE != 0
    }

    /// Neither secondary nor supplementary.
    pub fn is_primary(&self) -> bool {
        self.flags & (flags::SECONDARY | flags::SUPPLEMENTARY) == 0
    }

    /// Secondary alignment.
    pub fn is_secondary(&self) -> bool {
        self.flags & flags::SECONDARY != 0
    }

    /// Mate is present and mapped.
    pub fn has_mate(&self) -> bool {
        self.mate_reference_id.is_some()
    }

    /// Mate is reverse complemented.
    pub fn is_mate_reverse_complement(&self) -> bool {
        self.flags & flags::MATE_REVERSE != 0
    }

    /// First segment of a paired template (and not also the last).
    pub fn is_first(&self) -> bool {
        self.flags & (flags::PAIRED | flags::FIRST | flags::LAST) == flags::PAIRED | flags::FIRST
    }

    /// Get sequence length.
    pub fn sequence_length(&self) -> usize {
        self.sequence.len()
    }

    /// Reference bases covered by the alignment.
    pub fn reference_length(&self) -> u32 {
        cigar::reference_length(&self.cigar)
    }

    /// Exclusive 0-based end on the reference.
    pub fn end_position(&self) -> Option<i64> {
        self.position
            .map(|pos| i64::from(pos) + i64::from(self.reference_length()))
    }

    /// CIGAR as text.
    pub fn cigar_string(&self, alphabet: CigarAlphabet, clipped: bool) -> String {
        format_cigar(&self.cigar, alphabet, clipped)
    }

    /// Soft-clipped bases at the start of the read.
    pub fn leading_soft_clip(&self) -> usize {
        soft_clip(self.cigar.iter())
    }

    /// Soft-clipped bases at the end of the read.
    pub fn trailing_soft_clip(&self) -> usize {
        soft_clip(self.cigar.iter().rev())
    }

    fn clip_range(&self) -> std::ops::Range<usize> {
        let len = self.sequence.len();
        let start = self.leading_soft_clip().min(len);
        let end = len.saturating_sub(self.trailing_soft_clip()).max(start);
        start..end
    }

    /// Bases with soft clips removed.
    pub fn clipped_sequence(&self) -> &[u8] {
        &self.sequence[self.clip_range()]
    }

    /// Qualities with soft clips removed.
    pub fn clipped_quality(&self) -> &[u8] {
        let range = self.clip_range();
        if self.quality.len() < range.end {
            return &[];
        }
        &self.quality[range]
    }

    /// Qualities as Phred+33 text, `None` when missing.
    pub fn quality_text(&self) -> Option<Vec<u8>> {
        quality_to_text(&self.quality)
    }

    /// Read group id (`RG:Z`).
    pub fn read_group(&self) -> Option<&str> {
        self.tags.read_group()
    }
}

fn soft_clip<'c>(ops: impl Iterator<Item = &'c CigarOp>) -> usize {
    ops.skip_while(|op| matches!(op, CigarOp::HardClip(_)))
        .take_while(|op| matches!(op, CigarOp::SoftClip(_)))
        .map(|op| op.length() as usize)
        .sum()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Fixed fields of a synthetic record body.
    pub(crate) struct Body<'n> {
        pub ref_id: i32,
        pub pos: i32,
        pub name: &'n [u8],
        pub mapq: u8,
        pub flags: u16,
        pub cigar: Vec<u32>,
        pub seq: Vec<u8>,
        pub qual: Vec<u8>,
        pub next_ref_id: i32,
        pub next_pos: i32,
        pub tags: Vec<u8>,
    }

    impl Default for Body<'_> {
        fn default() -> Self {
            Self {
                ref_id: 0,
                pos: 100,
                name: b"test\0",
                mapq: 60,
                flags: 0,
                cigar: vec![4 << 4],
                seq: vec![0x12, 0x48],
                qual: b"IIII".to_vec(),
                next_ref_id: -1,
                next_pos: -1,
                tags: Vec::new(),
            }
        }
    }

    impl Body<'_> {
        pub(crate) fn encode(&self) -> Vec<u8> {
            let mut data = Vec::new();
            data.extend_from_slice(&self.ref_id.to_le_bytes());
            data.extend_from_slice(&self.pos.to_le_bytes());
            data.push(self.name.len() as u8);
            data.push(self.mapq);
            data.extend_from_slice(&0u16.to_le_bytes());
            data.extend_from_slice(&(self.cigar.len() as u16).to_le_bytes());
            data.extend_from_slice(&self.flags.to_le_bytes());
            data.extend_from_slice(&(self.qual.len() as i32).to_le_bytes());
            data.extend_from_slice(&self.next_ref_id.to_le_bytes());
            data.extend_from_slice(&self.next_pos.to_le_bytes());
            data.extend_from_slice(&0i32.to_le_bytes());
            data.extend_from_slice(self.name);
            for op in &self.cigar {
                data.extend_from_slice(&op.to_le_bytes());
            }
            data.extend_from_slice(&self.seq);
            data.extend_from_slice(&self.qual);
            data.extend_from_slice(&self.tags);
            data
        }
    }

    fn parse(data: &[u8]) -> Result<RawRecord<'_>, BamDecodeError> {
        RawRecord::parse(Cow::Borrowed(data), 1)
    }

    #[test]
    fn test_parse_record_with_sequence() {
        let data = Body::default().encode();
        let raw = parse(&data).unwrap();
        assert!(raw.is_borrowed());

        let record = raw.to_record().unwrap();
        assert_eq!(record.name.as_deref(), Some("test"));
        assert_eq!(record.reference_id, Some(0));
        assert_eq!(record.position, Some(100));
        assert_eq!(record.mapq, Some(60));
        assert_eq!(record.sequence, b"ACGT");
        assert_eq!(record.quality, b"IIII");
        assert_eq!(record.cigar, vec![CigarOp::Match(4)]);
        assert_eq!(raw.reference_length(), 4);
        assert_eq!(raw.end_position(), Some(104));
    }

    #[test]
    fn test_flag_unmapped_clears_position_and_cigar() {
        // Raw bytes name a valid contig and position.
        let data = Body {
            flags: flags::UNMAPPED,
            ..Body::default()
        }
        .encode();
        let raw = parse(&data).unwrap();

        assert_eq!(raw.raw_reference_id(), 0);
        assert_eq!(raw.raw_position(), 100);
        assert!(raw.is_self_unmapped());
        assert_eq!(raw.reference_id(), None);
        assert_eq!(raw.position(), None);
        assert_eq!(raw.cigar_len(), 0);
        assert!(raw.cigar().unwrap().is_empty());
        assert_eq!(raw.reference_length(), 0);

        let record = raw.to_record().unwrap();
        assert!(record.is_unmapped());
        assert_eq!(record.position, None);
        assert_eq!(record.sequence, b"ACGT");
    }

    #[test]
    fn test_out_of_range_reference_is_unmapped() {
        let data = Body {
            ref_id: 5,
            ..Body::default()
        }
        .encode();
        assert!(parse(&data).unwrap().is_self_unmapped());

        let data = Body {
            pos: -1,
            ..Body::default()
        }
        .encode();
        assert!(parse(&data).unwrap().is_self_unmapped());

        let data = Body {
            name: b"\0",
            ..Body::default()
        }
        .encode();
        let raw = parse(&data).unwrap();
        assert!(raw.is_self_unmapped());
        assert_eq!(raw.read_name(), None);
    }

    #[test]
    fn test_mate_policy() {
        let paired = Body {
            flags: flags::PAIRED,
            next_ref_id: 0,
            next_pos: 500,
            ..Body::default()
        };
        let data = paired.encode();
        let raw = parse(&data).unwrap();
        assert_eq!(raw.mate_reference_id(), Some(0));
        assert_eq!(raw.mate_position(), Some(500));

        let data = Body {
            flags: flags::PAIRED | flags::MATE_UNMAPPED,
            ..paired
        }
        .encode();
        let raw = parse(&data).unwrap();
        assert!(raw.is_mate_unmapped());
        assert_eq!(raw.mate_position(), None);

        let data = Body {
            flags: 0,
            next_ref_id: 0,
            next_pos: 500,
            ..Body::default()
        }
        .encode();
        assert!(parse(&data).unwrap().is_mate_unmapped());
    }

    #[test]
    fn test_empty_record() {
        let data = Body {
            name: b"",
            cigar: vec![],
            seq: vec![],
            qual: vec![],
            ..Body::default()
        }
        .encode();
        assert_eq!(data.len(), FIXED_LEN);
        let raw = parse(&data).unwrap();
        assert!(raw.is_empty());
        assert!(!parse(&Body::default().encode()).unwrap().is_empty());
    }

    #[test]
    fn test_section_overflow() {
        let mut data = Body::default().encode();
        data.truncate(data.len() - 2);
        assert!(matches!(
            parse(&data),
            Err(BamDecodeError::SectionOverflow {
                section: "quality",
                ..
            })
        ));

        let mut data = Body::default().encode();
        data[12] = 0xFF;
        data[13] = 0xFF;
        assert!(matches!(
            parse(&data),
            Err(BamDecodeError::SectionOverflow {
                section: "cigar",
                ..
            })
        ));
    }

    #[test]
    fn test_short_body() {
        assert!(matches!(
            parse(&[0u8; 20]),
            Err(BamDecodeError::InvalidBlockSize { size: 20 })
        ));
    }

    #[test]
    fn test_invalid_reference_ids() {
        let data = Body {
            ref_id: -2,
            ..Body::default()
        }
        .encode();
        assert!(matches!(
            parse(&data),
            Err(BamDecodeError::InvalidReferenceId { value: -2, .. })
        ));

        let data = Body {
            next_ref_id: -7,
            ..Body::default()
        }
        .encode();
        assert!(matches!(
            parse(&data),
            Err(BamDecodeError::InvalidReferenceId { value: -7, .. })
        ));
    }

    #[test]
    fn test_negative_sequence_length() {
        let mut data = Body::default().encode();
        data[16..20].copy_from_slice(&(-1i32).to_le_bytes());
        assert!(matches!(
            parse(&data),
            Err(BamDecodeError::NegativeSequenceLength { length: -1 })
        ));
    }

    #[test]
    fn test_missing_null_terminator_in_name() {
        let data = Body {
            name: b"test",
            ..Body::default()
        }
        .encode();
        assert!(matches!(
            parse(&data),
            Err(BamDecodeError::MissingNulTerminator { .. })
        ));
    }

    #[test]
    fn test_invalid_cigar_op() {
        let data = Body {
            cigar: vec![(4 << 4) | 9],
            ..Body::default()
        }
        .encode();
        assert!(matches!(
            parse(&data),
            Err(BamDecodeError::InvalidCigarOp { value: 9 })
        ));
    }

    #[test]
    fn test_tags_and_into_owned() {
        let mut tag_block = Vec::new();
        tags::encode_sam_field(b"XS:A:+", &mut tag_block).unwrap();
        tags::encode_sam_field(b"RG:Z:grp1", &mut tag_block).unwrap();
        tags::encode_sam_field(b"XS:A:-", &mut tag_block).unwrap();
        let data = Body {
            tags: tag_block,
            ..Body::default()
        }
        .encode();

        let raw = parse(&data).unwrap().into_owned();
        assert!(!raw.is_borrowed());
        assert_eq!(raw.tag(b"XS", 0).unwrap(), Some(TagValue::Char(b'+')));
        assert_eq!(raw.tag(b"XS", -1).unwrap(), Some(TagValue::Char(b'-')));
        assert_eq!(raw.tag_count(b"XS"), 2);
        assert_eq!(raw.read_group(), Some("grp1"));
        assert_eq!(raw.tag(b"ZZ", 0).unwrap(), None);
    }

    #[test]
    fn test_oversized_cigar_from_cg_tag() {
        let real: Vec<u32> = vec![2 << 4, (1 << 4) | 1, 1 << 4];
        let mut tag_block = b"CGBI".to_vec();
        tag_block.extend_from_slice(&(real.len() as i32).to_le_bytes());
        for op in &real {
            tag_block.extend_from_slice(&op.to_le_bytes());
        }
        let data = Body {
            cigar: vec![(4 << 4) | 4, (3 << 4) | 3],
            tags: tag_block,
            ..Body::default()
        }
        .encode();

        let raw = parse(&data).unwrap();
        assert_eq!(
            raw.cigar().unwrap(),
            vec![CigarOp::Match(2), CigarOp::Insertion(1), CigarOp::Match(1)]
        );
        // Placeholder span equals the real span.
        assert_eq!(raw.reference_length(), 3);
    }

    #[test]
    fn test_record_clipping_accessors() {
        let record = Record {
            sequence: b"AACGTTT".to_vec(),
            quality: vec![1, 2, 3, 4, 5, 6, 7],
            cigar: vec![
                CigarOp::HardClip(3),
                CigarOp::SoftClip(2),
                CigarOp::Match(3),
                CigarOp::SoftClip(2),
            ],
            reference_id: Some(0),
            position: Some(10),
            ..Record::default()
        };
        assert_eq!(record.leading_soft_clip(), 2);
        assert_eq!(record.trailing_soft_clip(), 2);
        assert_eq!(record.clipped_sequence(), b"CGT");
        assert_eq!(record.clipped_quality(), &[3, 4, 5]);
        assert_eq!(record.cigar_string(CigarAlphabet::Short, true), "3M");
        assert_eq!(record.end_position(), Some(13));
    }

    #[test]
    fn test_record_flags() {
        let mut record = Record::new();

        record.flags = flags::SECONDARY;
        assert!(!record.is_primary());
        assert!(record.is_secondary());

        record.flags = flags::SUPPLEMENTARY;
        assert!(!record.is_primary());

        record.flags = flags::PAIRED | flags::FIRST | flags::MATE_REVERSE;
        assert!(record.is_primary());
        assert!(record.is_paired());
        assert!(record.is_first());
        assert!(record.is_mate_reverse_complement());
        assert!(!record.has_mate());

        record.flags = flags::FIRST;
        assert!(!record.is_first());
        record.flags = flags::PAIRED | flags::FIRST | flags::LAST;
        assert!(!record.is_first());
    }
}
