//! 4-bit BAM sequence and Phred quality codecs.
//!
//! BAM stores sequences in 4-bit encoding (2 bases per byte, high nibble
//! first) over the alphabet `=ACMGRSVTWYHKDBN`. Qualities are raw Phred
//! values, one byte per base, with `0xFF` meaning "not available".

use super::error::BamDecodeError;
use log::debug;

/// BAM 4-bit to ASCII base lookup table.
///
/// - 0 = '=' (match to reference)
/// - 1, 2, 4, 8 = A, C, G, T
/// - the rest are IUPAC ambiguity codes, 15 = N
const SEQ_LOOKUP: [u8; 16] = *b"=ACMGRSVTWYHKDBN";

/// Phred value marking a missing quality.
pub const MISSING_QUALITY: u8 = 0xFF;

/// Highest Phred value printable as Phred+33 (`~`).
const MAX_PRINTABLE_QUALITY: u8 = b'~' - 33;

/// Decode a 4-bit encoded BAM sequence to ASCII.
///
/// # Example
///
/// ```
/// use ngs_bam::io::bam::decode_sequence;
///
/// // Byte 0x12 encodes bases at indices 1 ('A') and 2 ('C')
/// let sequence = decode_sequence(&[0x12], 2).unwrap();
/// assert_eq!(sequence, b"AC");
/// ```
pub fn decode_sequence(data: &[u8], length: usize) -> Result<Vec<u8>, BamDecodeError> {
    let required_bytes = length.div_ceil(2);
    if data.len() < required_bytes {
        return Err(BamDecodeError::UnexpectedEof {
            context: "sequence".to_string(),
            expected: required_bytes,
            actual: data.len(),
        });
    }

    let mut sequence = Vec::with_capacity(length);
    for &byte in &data[..length / 2] {
        sequence.push(SEQ_LOOKUP[(byte >> 4) as usize]);
        sequence.push(SEQ_LOOKUP[(byte & 0x0F) as usize]);
    }
    if length % 2 == 1 {
        sequence.push(SEQ_LOOKUP[(data[length / 2] >> 4) as usize]);
    }

    Ok(sequence)
}

/// Map an ASCII base (either case) to its 4-bit code.
fn base_to_nibble(base: u8) -> Option<u8> {
    let upper = base.to_ascii_uppercase();
    SEQ_LOOKUP
        .iter()
        .position(|&b| b == upper)
        .map(|idx| idx as u8)
}

/// Pack ASCII bases into the 4-bit representation.
///
/// Odd-length sequences leave the final low nibble zero. Bases outside
/// `=ACMGRSVTWYHKDBN` (in either case) are rejected.
pub fn encode_sequence(bases: &[u8]) -> Result<Vec<u8>, BamDecodeError> {
    let mut encoded = Vec::with_capacity(bases.len().div_ceil(2));

    for pair in bases.chunks(2) {
        let high = base_to_nibble(pair[0]).ok_or_else(|| invalid_base(pair[0]))?;
        let low = match pair.get(1) {
            Some(&b) => base_to_nibble(b).ok_or_else(|| invalid_base(b))?,
            None => 0,
        };
        encoded.push((high << 4) | low);
    }

    Ok(encoded)
}

fn invalid_base(base: u8) -> BamDecodeError {
    BamDecodeError::sam("SEQ", format!("invalid base {:?}", base as char))
}

/// True when every value is the missing-quality sentinel.
///
/// An empty slice counts as missing.
pub fn quality_is_missing(raw: &[u8]) -> bool {
    raw.iter().all(|&q| q == MISSING_QUALITY)
}

/// Render raw Phred values as Phred+33 text.
///
/// Returns `None` when the qualities are missing. Individual values above
/// 93 have no Phred+33 character and are clamped to `~`, so they read back
/// from SAM text as 93.
pub fn quality_to_text(raw: &[u8]) -> Option<Vec<u8>> {
    if quality_is_missing(raw) {
        return None;
    }
    let clamped = raw.iter().filter(|&&q| q > MAX_PRINTABLE_QUALITY).count();
    if clamped > 0 {
        debug!(
            "{} quality values above {} clamped to '~'",
            clamped, MAX_PRINTABLE_QUALITY
        );
    }
    Some(
        raw.iter()
            .map(|&q| q.min(MAX_PRINTABLE_QUALITY) + 33)
            .collect(),
    )
}

/// Parse SAM QUAL text into raw Phred values for a sequence of `length`.
///
/// `*` yields `length` missing markers. Otherwise the text must be exactly
/// `length` characters in `!`..=`~`.
pub fn quality_from_text(text: &[u8], length: usize) -> Result<Vec<u8>, BamDecodeError> {
    if text == b"*" {
        return Ok(vec![MISSING_QUALITY; length]);
    }
    if text.len() != length {
        return Err(BamDecodeError::sam(
            "QUAL",
            format!("{} qualities for {} bases", text.len(), length),
        ));
    }
    text.iter()
        .map(|&ch| {
            if (b'!'..=b'~').contains(&ch) {
                Ok(ch - 33)
            } else {
                Err(BamDecodeError::sam(
                    "QUAL",
                    format!("invalid quality character {:?}", ch as char),
                ))
            }
        })
        .collect()
}
