//! SAM text input and output.
//!
//! Plain (uncompressed) SAM is read line by line and every alignment line is
//! re-encoded into the binary BAM record layout, so [`RawRecord`] consumers
//! see the same bytes whichever format the file was in. [`format_sam`] goes
//! the other way for any record.
//!
//! # Example
//!
//! ```
//! use ngs_bam::io::bam::{format_sam, parse_sam_line, Header, RawRecord};
//! use std::borrow::Cow;
//!
//! # fn main() -> ngs_bam::Result<()> {
//! let header = Header::from_sam_text("@SQ\tSN:chr1\tLN:1000\n".to_string())?;
//! let line = "r1\t0\tchr1\t100\t60\t4M\t*\t0\t0\tACGT\tIIII\tRG:Z:grp1";
//!
//! let body = parse_sam_line(line.as_bytes(), &header)?;
//! let record = RawRecord::parse(Cow::Owned(body), header.reference_count())?;
//! assert_eq!(record.position(), Some(99));
//! assert_eq!(format_sam(&record, &header)?, line);
//! # Ok(())
//! # }
//! ```

use super::cigar::{self, parse_cigar_text, CigarAlphabet, MAX_OP_COUNT};
use super::error::BamDecodeError;
use super::header::Header;
use super::index::reg2bin;
use super::record::{RawRecord, ReadOutcome};
use super::sequence::{encode_sequence, quality_from_text, quality_to_text};
use super::tags::{encode_sam_field, write_sam_field};
use crate::error::NgsBamError;
use log::{debug, warn};
use std::io::BufRead;
use std::str::FromStr;

/// Number of mandatory SAM columns.
pub const MANDATORY_COLUMNS: usize = 11;

/// Longest read name the binary layout can hold (without the NUL).
const MAX_NAME_LEN: usize = 254;

fn column<'l>(
    fields: &mut impl Iterator<Item = &'l [u8]>,
    name: &'static str,
) -> Result<&'l [u8], BamDecodeError> {
    fields
        .next()
        .ok_or_else(|| BamDecodeError::sam(name, format!("line has fewer than {} columns", MANDATORY_COLUMNS)))
}

fn number<T: FromStr>(text: &[u8], name: &'static str) -> Result<T, BamDecodeError> {
    std::str::from_utf8(text)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            BamDecodeError::sam(name, format!("invalid number {:?}", String::from_utf8_lossy(text)))
        })
}

fn reference(text: &[u8], header: &Header, name: &'static str) -> Result<i32, BamDecodeError> {
    if text == b"*" {
        return Ok(-1);
    }
    let name_str = std::str::from_utf8(text)
        .map_err(|_| BamDecodeError::sam(name, "reference name is not UTF-8"))?;
    header
        .reference_id(name_str)
        .map(|id| id as i32)
        .ok_or_else(|| BamDecodeError::UnresolvedReference {
            name: name_str.to_string(),
        })
}

/// Encode one SAM alignment line as a BAM record body.
///
/// RNAME and RNEXT must name references in `header` exactly; `=` in RNEXT
/// repeats RNAME. The `bin` field is computed from POS and the CIGAR.
///
/// # Errors
///
/// Returns error if:
/// - The line has fewer than 11 columns or a column does not parse
/// - A reference name is not in the header ([`BamDecodeError::UnresolvedReference`])
/// - QUAL does not match SEQ in length
/// - An optional field is malformed
pub fn parse_sam_line(line: &[u8], header: &Header) -> Result<Vec<u8>, BamDecodeError> {
    let mut body = Vec::with_capacity(line.len());
    parse_sam_line_into(line, header, &mut body)?;
    Ok(body)
}

/// [`parse_sam_line`] into a reused buffer (cleared first).
pub fn parse_sam_line_into(
    line: &[u8],
    header: &Header,
    body: &mut Vec<u8>,
) -> Result<(), BamDecodeError> {
    let mut fields = line.split(|&b| b == b'\t');

    let qname = column(&mut fields, "QNAME")?;
    let flag: u16 = number(column(&mut fields, "FLAG")?, "FLAG")?;
    let ref_id = reference(column(&mut fields, "RNAME")?, header, "RNAME")?;
    let pos = number::<i32>(column(&mut fields, "POS")?, "POS")? - 1;
    let mapq: u8 = number(column(&mut fields, "MAPQ")?, "MAPQ")?;

    let cigar_text = column(&mut fields, "CIGAR")?;
    let cigar_str = std::str::from_utf8(cigar_text)
        .map_err(|_| BamDecodeError::sam("CIGAR", "not ASCII"))?;
    let ops = parse_cigar_text(cigar_str)?;
    if ops.len() > MAX_OP_COUNT {
        return Err(BamDecodeError::CigarCountOverflow { count: ops.len() });
    }

    let rnext = column(&mut fields, "RNEXT")?;
    let next_ref_id = if rnext == b"=" {
        ref_id
    } else {
        reference(rnext, header, "RNEXT")?
    };
    let next_pos = number::<i32>(column(&mut fields, "PNEXT")?, "PNEXT")? - 1;
    let tlen: i32 = number(column(&mut fields, "TLEN")?, "TLEN")?;

    let seq_text = column(&mut fields, "SEQ")?;
    let bases: &[u8] = if seq_text == b"*" { &[] } else { seq_text };
    let packed = encode_sequence(bases)?;
    let quality = quality_from_text(column(&mut fields, "QUAL")?, bases.len())?;

    if qname.is_empty() || qname.len() > MAX_NAME_LEN {
        return Err(BamDecodeError::sam(
            "QNAME",
            format!("read name must be 1 to {} characters", MAX_NAME_LEN),
        ));
    }

    let span = i64::from(cigar::reference_length(&ops)).max(1);
    let bin = reg2bin(i64::from(pos), i64::from(pos) + span);

    body.clear();
    body.extend_from_slice(&ref_id.to_le_bytes());
    body.extend_from_slice(&pos.to_le_bytes());
    body.push((qname.len() + 1) as u8);
    body.push(mapq);
    body.extend_from_slice(&bin.to_le_bytes());
    body.extend_from_slice(&(ops.len() as u16).to_le_bytes());
    body.extend_from_slice(&flag.to_le_bytes());
    body.extend_from_slice(&(bases.len() as i32).to_le_bytes());
    body.extend_from_slice(&next_ref_id.to_le_bytes());
    body.extend_from_slice(&next_pos.to_le_bytes());
    body.extend_from_slice(&tlen.to_le_bytes());
    body.extend_from_slice(qname);
    body.push(0);
    for op in &ops {
        body.extend_from_slice(&op.to_raw().to_le_bytes());
    }
    body.extend_from_slice(&packed);
    body.extend_from_slice(&quality);

    for field in fields {
        encode_sam_field(field, body)?;
    }
    Ok(())
}

/// Render a record as one SAM line (no trailing newline).
///
/// Unmapped records print `*` and `0` for RNAME and POS; RNEXT is `=` when
/// the mate is on the record's own reference. Optional fields keep their
/// order in the record.
pub fn format_sam(record: &RawRecord<'_>, header: &Header) -> Result<String, BamDecodeError> {
    let mut out = String::with_capacity(record.as_bytes().len() * 2);
    let mut num = itoa::Buffer::new();

    match record.read_name() {
        Some(name) => out.push_str(&String::from_utf8_lossy(name)),
        None => out.push('*'),
    }
    out.push('\t');
    out.push_str(num.format(record.flags()));
    out.push('\t');

    let ref_id = record.reference_id();
    out.push_str(ref_id.and_then(|id| header.reference_name(id)).unwrap_or("*"));
    out.push('\t');
    out.push_str(num.format(record.position().map_or(0, |p| i64::from(p) + 1)));
    out.push('\t');
    out.push_str(num.format(record.mapq()));
    out.push('\t');

    let cigar = record.cigar_string(CigarAlphabet::Long, false)?;
    out.push_str(if cigar.is_empty() { "*" } else { &cigar });
    out.push('\t');

    match record.mate_reference_id() {
        Some(id) if Some(id) == ref_id => out.push('='),
        Some(id) => out.push_str(header.reference_name(id).unwrap_or("*")),
        None => out.push('*'),
    }
    out.push('\t');
    out.push_str(num.format(record.mate_position().map_or(0, |p| i64::from(p) + 1)));
    out.push('\t');
    out.push_str(num.format(record.template_length()));
    out.push('\t');

    if record.sequence_len() == 0 {
        out.push_str("*\t*");
    } else {
        out.push_str(&String::from_utf8_lossy(&record.sequence()?));
        out.push('\t');
        match quality_to_text(record.quality()) {
            Some(text) => out.push_str(&String::from_utf8_lossy(&text)),
            None => out.push('*'),
        }
    }

    let block = record.tag_block();
    for entry in record.tag_fields().entries() {
        out.push('\t');
        write_sam_field(entry, block, &mut out)?;
    }
    Ok(out)
}

impl RawRecord<'_> {
    /// This record as a SAM line.
    pub fn to_sam(&self, header: &Header) -> Result<String, BamDecodeError> {
        format_sam(self, header)
    }
}

/// Line reader for plain SAM files.
///
/// The `@` header block is collected when the reader is created; each later
/// call to [`SamTextReader::advance`] encodes the next alignment line into
/// an internal buffer exposed by [`SamTextReader::body`].
pub struct SamTextReader<R> {
    reader: R,
    header_text: String,
    line: Vec<u8>,
    /// `line` holds an alignment line read while scanning the header.
    pending: bool,
    body: Vec<u8>,
    line_number: u64,
    consumed: u64,
}

impl<R: BufRead> SamTextReader<R> {
    /// Read the header block (all leading `@` lines).
    pub fn new(reader: R) -> crate::Result<Self> {
        let mut sam = Self {
            reader,
            header_text: String::new(),
            line: Vec::new(),
            pending: false,
            body: Vec::new(),
            line_number: 0,
            consumed: 0,
        };

        while sam.next_line()? {
            if sam.line.first() != Some(&b'@') {
                sam.pending = true;
                break;
            }
            let text = std::str::from_utf8(&sam.line).map_err(|_| {
                NgsBamError::Format(format!("SAM header line {} is not UTF-8", sam.line_number))
            })?;
            sam.header_text.push_str(text);
            sam.header_text.push('\n');
        }
        debug!(
            "SAM header: {} lines, {} bytes",
            sam.line_number - u64::from(sam.pending),
            sam.header_text.len()
        );
        Ok(sam)
    }

    /// The `@` lines found at the start of the input.
    pub fn header_text(&self) -> &str {
        &self.header_text
    }

    /// Bytes of input consumed so far.
    pub fn bytes_consumed(&self) -> u64 {
        self.consumed
    }

    /// Body of the line last accepted by [`SamTextReader::advance`].
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Encode the next alignment line.
    ///
    /// Blank lines and stray header lines are [`ReadOutcome::Empty`].
    pub fn advance(&mut self, header: &Header) -> crate::Result<ReadOutcome<()>> {
        if !std::mem::take(&mut self.pending) && !self.next_line()? {
            return Ok(ReadOutcome::EndOfData);
        }
        if self.line.is_empty() {
            return Ok(ReadOutcome::Empty);
        }
        if self.line[0] == b'@' {
            warn!("ignoring header line {} after alignments", self.line_number);
            return Ok(ReadOutcome::Empty);
        }
        parse_sam_line_into(&self.line, header, &mut self.body)?;
        Ok(ReadOutcome::Record(()))
    }

    /// Load the next line without its terminator. `false` at end of input.
    fn next_line(&mut self) -> crate::Result<bool> {
        self.line.clear();
        let n = self.reader.read_until(b'\n', &mut self.line)?;
        if n == 0 {
            return Ok(false);
        }
        self.consumed += n as u64;
        self.line_number += 1;
        if self.line.last() == Some(&b'\n') {
            self.line.pop();
        }
        if self.line.last() == Some(&b'\r') {
            self.line.pop();
        }
        Ok(true)
    }
}
