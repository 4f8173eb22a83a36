//! CIGAR operations: binary decoding, reference span and text rendering.
//!
//! In BAM each operation is one little-endian `u32`: the low 4 bits are the
//! operation code (0-8, `MIDNSHP=X`) and the high 28 bits are its length.
//!
//! Rendering supports two alphabets. [`CigarAlphabet::Short`] folds `=`
//! and `X` into `M`; [`CigarAlphabet::Long`] keeps them distinct. Either can
//! drop the clipping operations at both ends.

use super::error::BamDecodeError;
use crate::io::codec;

/// Largest length a single operation can carry (28 bits).
pub const MAX_OP_LENGTH: u32 = (1 << 28) - 1;

/// Largest number of operations a BAM record can declare.
pub const MAX_OP_COUNT: usize = u16::MAX as usize;

/// CIGAR operation types.
///
/// Each operation describes a type of alignment event and its length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CigarOp {
    /// Match or mismatch (M)
    Match(u32),
    /// Insertion to reference (I)
    Insertion(u32),
    /// Deletion from reference (D)
    Deletion(u32),
    /// Skipped region from reference (N)
    RefSkip(u32),
    /// Soft clipping (S)
    SoftClip(u32),
    /// Hard clipping (H)
    HardClip(u32),
    /// Padding (P)
    Padding(u32),
    /// Sequence match (=)
    SeqMatch(u32),
    /// Sequence mismatch (X)
    SeqMismatch(u32),
}

impl CigarOp {
    /// Build an operation from its 4-bit code.
    pub fn from_code(code: u32, length: u32) -> Result<Self, BamDecodeError> {
        Ok(match code {
            0 => CigarOp::Match(length),
            1 => CigarOp::Insertion(length),
            2 => CigarOp::Deletion(length),
            3 => CigarOp::RefSkip(length),
            4 => CigarOp::SoftClip(length),
            5 => CigarOp::HardClip(length),
            6 => CigarOp::Padding(length),
            7 => CigarOp::SeqMatch(length),
            8 => CigarOp::SeqMismatch(length),
            _ => return Err(BamDecodeError::InvalidCigarOp { value: code }),
        })
    }

    /// Decode a packed `len << 4 | op` value.
    pub fn from_raw(raw: u32) -> Result<Self, BamDecodeError> {
        Self::from_code(raw & 0x0F, raw >> 4)
    }

    /// Pack into the BAM `len << 4 | op` form.
    pub fn to_raw(self) -> u32 {
        (self.length() << 4) | self.code()
    }

    /// The 4-bit operation code.
    pub fn code(&self) -> u32 {
        match self {
            CigarOp::Match(_) => 0,
            CigarOp::Insertion(_) => 1,
            CigarOp::Deletion(_) => 2,
            CigarOp::RefSkip(_) => 3,
            CigarOp::SoftClip(_) => 4,
            CigarOp::HardClip(_) => 5,
            CigarOp::Padding(_) => 6,
            CigarOp::SeqMatch(_) => 7,
            CigarOp::SeqMismatch(_) => 8,
        }
    }

    /// Get the operation count/length.
    pub fn length(&self) -> u32 {
        match *self {
            CigarOp::Match(len)
            | CigarOp::Insertion(len)
            | CigarOp::Deletion(len)
            | CigarOp::RefSkip(len)
            | CigarOp::SoftClip(len)
            | CigarOp::HardClip(len)
            | CigarOp::Padding(len)
            | CigarOp::SeqMatch(len)
            | CigarOp::SeqMismatch(len) => len,
        }
    }

    /// Check if this operation has zero length.
    pub fn is_empty(&self) -> bool {
        self.length() == 0
    }

    /// True for M, D, N, = and X.
    pub fn consumes_reference(&self) -> bool {
        code_consumes_reference(self.code())
    }

    /// True for soft and hard clips.
    pub fn is_clip(&self) -> bool {
        matches!(self, CigarOp::SoftClip(_) | CigarOp::HardClip(_))
    }

    /// Get the operation type as a character (long alphabet).
    pub fn as_char(&self) -> char {
        CigarAlphabet::Long.symbol(self.code()) as char
    }
}

impl std::fmt::Display for CigarOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.length(), self.as_char())
    }
}

fn code_consumes_reference(code: u32) -> bool {
    matches!(code, 0 | 2 | 3 | 7 | 8)
}

/// Operation-code to character table used when rendering text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CigarAlphabet {
    /// `MIDNSHPMM`: `=` and `X` render as `M`
    #[default]
    Short,
    /// `MIDNSHP=X`
    Long,
}

impl CigarAlphabet {
    fn table(self) -> &'static [u8; 16] {
        match self {
            CigarAlphabet::Short => b"MIDNSHPMM???????",
            CigarAlphabet::Long => b"MIDNSHP=X???????",
        }
    }

    /// Character for a 4-bit operation code.
    pub fn symbol(self, code: u32) -> u8 {
        self.table()[(code & 0x0F) as usize]
    }
}

/// Parse BAM CIGAR operations from binary format.
///
/// # Example
///
/// ```
/// use ngs_bam::io::bam::{parse_cigar, CigarOp};
///
/// // 100M = 100 << 4 | 0 = 1600 = 0x00000640 (little-endian)
/// let data = vec![0x40, 0x06, 0x00, 0x00];
/// let cigar = parse_cigar(&data, 1).unwrap();
/// assert_eq!(cigar, vec![CigarOp::Match(100)]);
/// ```
pub fn parse_cigar(data: &[u8], n_ops: usize) -> Result<Vec<CigarOp>, BamDecodeError> {
    let required = n_ops * 4;
    if data.len() < required {
        return Err(BamDecodeError::UnexpectedEof {
            context: "CIGAR".to_string(),
            expected: required,
            actual: data.len(),
        });
    }

    (0..n_ops)
        .map(|i| CigarOp::from_raw(codec::le_u32(data, i * 4).unwrap_or(0)))
        .collect()
}

/// Reference span of an alignment: the summed lengths of M, D, N, = and X.
///
/// I, S, H and P contribute nothing. Never cached; callers recompute it
/// whenever they need an end coordinate.
pub fn reference_length(ops: &[CigarOp]) -> u32 {
    ops.iter()
        .filter(|op| op.consumes_reference())
        .map(CigarOp::length)
        .sum()
}

/// [`reference_length`] over packed operations straight from a record.
///
/// Unknown operation codes contribute nothing.
pub fn reference_length_raw<I>(raw: I) -> u32
where
    I: IntoIterator<Item = u32>,
{
    raw.into_iter()
        .filter(|op| code_consumes_reference(op & 0x0F))
        .map(|op| op >> 4)
        .sum()
}

/// Render operations as CIGAR text.
///
/// Adjacent operations that render to the same character are merged, so
/// `5=5X` prints as `10M` in the short alphabet. With `clipped` set, soft
/// and hard clips at either end are left out. An empty list renders as an
/// empty string; SAM output substitutes `*` itself.
///
/// ```
/// use ngs_bam::io::bam::{format_cigar, CigarAlphabet, CigarOp};
///
/// let ops = [CigarOp::SoftClip(5), CigarOp::Match(10), CigarOp::SoftClip(5)];
/// assert_eq!(format_cigar(&ops, CigarAlphabet::Short, false), "5S10M5S");
/// assert_eq!(format_cigar(&ops, CigarAlphabet::Short, true), "10M");
/// ```
pub fn format_cigar(ops: &[CigarOp], alphabet: CigarAlphabet, clipped: bool) -> String {
    let mut ops = ops;
    if clipped {
        while let Some((first, rest)) = ops.split_first() {
            if !first.is_clip() {
                break;
            }
            ops = rest;
        }
        while let Some((last, rest)) = ops.split_last() {
            if !last.is_clip() {
                break;
            }
            ops = rest;
        }
    }

    // Walk from the last operation back to the first, folding runs.
    let mut runs: Vec<(u64, u8)> = Vec::with_capacity(ops.len());
    for op in ops.iter().rev() {
        let symbol = alphabet.symbol(op.code());
        match runs.last_mut() {
            Some((len, sym)) if *sym == symbol => *len += u64::from(op.length()),
            _ => runs.push((u64::from(op.length()), symbol)),
        }
    }

    let mut out = String::with_capacity(runs.len() * 4);
    let mut digits = itoa::Buffer::new();
    for (len, symbol) in runs.iter().rev() {
        out.push_str(digits.format(*len));
        out.push(*symbol as char);
    }
    out
}

/// Parse CIGAR text (`*` for none) into operations.
///
/// Each operation is a decimal length followed by one of `MIDNSHP=X`.
pub fn parse_cigar_text(text: &str) -> Result<Vec<CigarOp>, BamDecodeError> {
    if text == "*" {
        return Ok(Vec::new());
    }

    let mut ops = Vec::new();
    let mut length: u64 = 0;
    let mut have_digits = false;

    for ch in text.bytes() {
        if ch.is_ascii_digit() {
            length = length * 10 + u64::from(ch - b'0');
            if length > u64::from(MAX_OP_LENGTH) {
                return Err(BamDecodeError::sam(
                    "CIGAR",
                    format!("operation length too large in {:?}", text),
                ));
            }
            have_digits = true;
            continue;
        }

        let code = match ch {
            b'M' => 0,
            b'I' => 1,
            b'D' => 2,
            b'N' => 3,
            b'S' => 4,
            b'H' => 5,
            b'P' => 6,
            b'=' => 7,
            b'X' => 8,
            other => {
                return Err(BamDecodeError::sam(
                    "CIGAR",
                    format!("unknown operation {:?} in {:?}", other as char, text),
                ))
            }
        };
        if !have_digits {
            return Err(BamDecodeError::sam(
                "CIGAR",
                format!("operation without length in {:?}", text),
            ));
        }
        ops.push(CigarOp::from_code(code, length as u32)?);
        length = 0;
        have_digits = false;
    }

    if have_digits || ops.is_empty() {
        return Err(BamDecodeError::sam(
            "CIGAR",
            format!("incomplete CIGAR {:?}", text),
        ));
    }
    if ops.len() > MAX_OP_COUNT {
        return Err(BamDecodeError::CigarCountOverflow { count: ops.len() });
    }
    Ok(ops)
}
