//! BAM header parsing.
//!
//! The BAM header consists of:
//! 1. Magic bytes ("BAM\1")
//! 2. SAM header text (length-prefixed, possibly NUL-padded)
//! 3. Reference sequence dictionary
//!
//! # Format
//!
//! ```text
//! BAM Header:
//! - 4 bytes: Magic ("BAM\1")
//! - 4 bytes: SAM header text length (l_text, int32)
//! - l_text bytes: SAM header text
//! - 4 bytes: Number of reference sequences (n_ref, int32)
//! - For each reference:
//!   - 4 bytes: Reference name length (l_name, int32, includes null terminator)
//!   - l_name bytes: Reference name (null-terminated)
//!   - 4 bytes: Reference length (int32)
//! ```
//!
//! The text part is tokenized for `@HD`, `@SQ` and `@RG` lines only. For a
//! BAM file the binary dictionary fixes the reference ids and is
//! cross-linked to the `@SQ` lines by name; a SAM file numbers its
//! references in name order.

use crate::error::{NgsBamError, Result};
use log::warn;
use std::io::{self, Read};

/// BAM magic bytes.
pub const BAM_MAGIC: &[u8; 4] = b"BAM\x01";

/// Reference sequence (chromosome/contig) declared by the header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceSequence {
    /// Reference sequence name (e.g., "chr1", "chrM")
    pub name: String,
    /// Reference sequence length in bases
    pub length: u32,
    /// Reference id used by records
    pub ordinal: usize,
    /// Genome assembly (`AS`)
    pub assembly: Option<String>,
    /// Sequence checksum (`M5`, also accepted as `MD5`)
    pub checksum: Option<String>,
    /// Sequence URI (`UR`)
    pub uri: Option<String>,
    /// Species (`SP`)
    pub species: Option<String>,
}

impl ReferenceSequence {
    /// Create a new reference.
    pub fn new(name: impl Into<String>, length: u32, ordinal: usize) -> Self {
        Self {
            name: name.into(),
            length,
            ordinal,
            ..Self::default()
        }
    }
}

/// Read group declared by an `@RG` line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadGroup {
    /// Read group identifier (`ID`)
    pub id: String,
    /// Sample (`SM`)
    pub sample: Option<String>,
    /// Library (`LB`)
    pub library: Option<String>,
    /// Description (`DS`)
    pub description: Option<String>,
    /// Platform unit (`PU`)
    pub platform_unit: Option<String>,
    /// Predicted median insert size (`PI`)
    pub insert_size: Option<String>,
    /// Sequencing center (`CN`)
    pub center: Option<String>,
    /// Run date (`DT`)
    pub run_date: Option<String>,
    /// Platform (`PL`)
    pub platform: Option<String>,
}

/// Structured content of SAM header text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderText {
    /// Format version (`@HD VN`)
    pub version: Option<String>,
    /// Sort order (`@HD SO`)
    pub sort_order: Option<String>,
    /// `@SQ` entries, sorted by name and de-duplicated
    pub references: Vec<ReferenceSequence>,
    /// `@RG` entries, sorted by id and de-duplicated
    pub read_groups: Vec<ReadGroup>,
}

/// Strip surrounding whitespace and one layer of matching quotes.
fn clean_value(value: &str) -> &str {
    let value = value.trim();
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return value[1..value.len() - 1].trim();
        }
    }
    value
}

/// Split one header line into its record type and `TAG:value` pairs.
fn tokenize_line(line_no: usize, line: &str) -> Result<(&str, Vec<(&str, &str)>)> {
    let mut fields = line.split('\t').map(str::trim).filter(|f| !f.is_empty());
    let kind = fields.next().unwrap_or_default();
    if kind.len() != 3 || !kind.starts_with('@') {
        return Err(NgsBamError::Format(format!(
            "header line {}: invalid record type {:?}",
            line_no, kind
        )));
    }

    let mut pairs = Vec::new();
    for field in fields {
        match field.split_once(':') {
            Some((tag, value)) if tag.trim().len() == 2 => {
                pairs.push((tag.trim(), clean_value(value)));
            }
            _ => warn!(
                "header line {}: skipping malformed field {:?} in {} record",
                line_no, field, kind
            ),
        }
    }
    Ok((kind, pairs))
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Parse SAM header text.
///
/// Only `@HD`, `@SQ` and `@RG` lines are interpreted; `@PG`, `@CO` and
/// other record types are kept in the text but otherwise ignored. Entries
/// without a name, or repeating an earlier name, are dropped with a
/// warning.
///
/// # Errors
///
/// A line that is not a header record, or an interpreted record with an
/// invalid type or value (such as a non-numeric `LN`), is a
/// [`NgsBamError::Format`] error. Fields that are not `TAG:value` are
/// skipped with a warning.
///
/// ```
/// use ngs_bam::io::bam::parse_header_text;
///
/// let text = "@HD\tVN:1.6\tSO:coordinate\n@SQ\tSN:chr2\tLN:2000\n@SQ\tSN:chr1\tLN:1000\n";
/// let header = parse_header_text(text).unwrap();
/// assert_eq!(header.version.as_deref(), Some("1.6"));
/// assert_eq!(header.references[0].name, "chr1");
/// ```
pub fn parse_header_text(text: &str) -> Result<HeaderText> {
    let mut parsed = HeaderText::default();

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.trim_end_matches(['\r', '\0']);
        if line.trim().is_empty() {
            continue;
        }
        if !line.starts_with('@') {
            return Err(NgsBamError::Format(format!(
                "header line {} does not start with '@'",
                line_no
            )));
        }
        if !(line.starts_with("@HD") || line.starts_with("@SQ") || line.starts_with("@RG")) {
            continue;
        }

        let (kind, pairs) = tokenize_line(line_no, line)?;
        match kind {
            "@HD" => {
                for (tag, value) in pairs {
                    match tag {
                        "VN" => parsed.version = non_empty(value),
                        "SO" => parsed.sort_order = non_empty(value),
                        _ => {}
                    }
                }
            }
            "@SQ" => {
                let mut reference = ReferenceSequence::default();
                for (tag, value) in pairs {
                    match tag {
                        "SN" => reference.name = value.to_string(),
                        "LN" => {
                            reference.length = value.parse().map_err(|_| {
                                NgsBamError::Format(format!(
                                    "header line {}: invalid LN {:?}",
                                    line_no, value
                                ))
                            })?;
                        }
                        "AS" => reference.assembly = non_empty(value),
                        "M5" | "MD5" => reference.checksum = non_empty(value),
                        "UR" => reference.uri = non_empty(value),
                        "SP" => reference.species = non_empty(value),
                        _ => {}
                    }
                }
                parsed.references.push(reference);
            }
            _ => {
                let mut group = ReadGroup::default();
                for (tag, value) in pairs {
                    let slot = match tag {
                        "ID" => {
                            group.id = value.to_string();
                            continue;
                        }
                        "SM" => &mut group.sample,
                        "LB" => &mut group.library,
                        "DS" => &mut group.description,
                        "PU" => &mut group.platform_unit,
                        "PI" => &mut group.insert_size,
                        "CN" => &mut group.center,
                        "DT" => &mut group.run_date,
                        "PL" => &mut group.platform,
                        _ => continue,
                    };
                    *slot = non_empty(value);
                }
                parsed.read_groups.push(group);
            }
        }
    }

    parsed.references = sort_and_dedup(parsed.references, "@SQ", |r| &r.name);
    parsed.read_groups = sort_and_dedup(parsed.read_groups, "@RG", |g| &g.id);
    for (ordinal, reference) in parsed.references.iter_mut().enumerate() {
        reference.ordinal = ordinal;
        if reference.length == 0 {
            warn!("reference {:?} has zero length", reference.name);
        }
    }

    Ok(parsed)
}

/// Sort by name, dropping nameless and duplicate entries with a warning.
fn sort_and_dedup<T, F>(mut entries: Vec<T>, kind: &str, name: F) -> Vec<T>
where
    F: Fn(&T) -> &String,
{
    let before = entries.len();
    entries.retain(|e| !name(e).is_empty());
    if entries.len() != before {
        warn!("dropped {} {} entries without a name", before - entries.len(), kind);
    }

    entries.sort_by(|a, b| name(a).cmp(name(b)));
    entries.dedup_by(|later, earlier| {
        let dup = name(later) == name(earlier);
        if dup {
            warn!("dropped duplicate {} entry {:?}", kind, name(later));
        }
        dup
    });
    entries
}

/// BAM or SAM file header.
///
/// `references` is indexed by reference id. Name lookups go through an
/// index sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    /// SAM header text (includes @HD, @SQ, @RG, @PG lines)
    pub text: String,
    /// Format version (`@HD VN`)
    pub version: Option<String>,
    /// Sort order (`@HD SO`)
    pub sort_order: Option<String>,
    /// Reference sequences, by reference id
    pub references: Vec<ReferenceSequence>,
    /// Read groups, sorted by id
    pub read_groups: Vec<ReadGroup>,
    by_name: Vec<usize>,
}

impl Header {
    /// Header of a SAM file: references come from `@SQ` lines in name order.
    pub fn from_sam_text(text: String) -> Result<Self> {
        let mut parsed = parse_header_text(&text)?;
        let references = std::mem::take(&mut parsed.references);
        Ok(Self::assemble(text, references, parsed))
    }

    /// Header of a BAM file: the binary dictionary fixes ids and lengths,
    /// `@SQ` lines with the same name contribute the remaining fields.
    pub fn cross_link(text: String, binary: Vec<ReferenceSequence>) -> Result<Self> {
        let parsed = parse_header_text(&text)?;

        let mut references = binary;
        for (ordinal, reference) in references.iter_mut().enumerate() {
            reference.ordinal = ordinal;
            let found = parsed
                .references
                .binary_search_by(|r| r.name.as_str().cmp(&reference.name));
            match found {
                Ok(i) => {
                    let sq = &parsed.references[i];
                    if sq.length != reference.length {
                        warn!(
                            "reference {:?}: @SQ LN {} differs from binary length {}",
                            reference.name, sq.length, reference.length
                        );
                    }
                    reference.assembly = sq.assembly.clone();
                    reference.checksum = sq.checksum.clone();
                    reference.uri = sq.uri.clone();
                    reference.species = sq.species.clone();
                }
                Err(_) if !parsed.references.is_empty() => {
                    warn!("reference {:?} has no @SQ line", reference.name);
                }
                Err(_) => {}
            }
            if reference.length == 0 {
                warn!("reference {:?} has zero length", reference.name);
            }
        }

        Ok(Self::assemble(text, references, parsed))
    }

    fn assemble(text: String, references: Vec<ReferenceSequence>, parsed: HeaderText) -> Self {
        let mut by_name: Vec<usize> = (0..references.len()).collect();
        by_name.sort_by(|&a, &b| references[a].name.cmp(&references[b].name));
        Self {
            text,
            version: parsed.version,
            sort_order: parsed.sort_order,
            references,
            read_groups: parsed.read_groups,
            by_name,
        }
    }

    /// Get reference by ID.
    ///
    /// Returns `None` if the reference ID is out of bounds.
    pub fn reference(&self, id: usize) -> Option<&ReferenceSequence> {
        self.references.get(id)
    }

    /// Get reference name by ID.
    pub fn reference_name(&self, id: usize) -> Option<&str> {
        self.reference(id).map(|r| r.name.as_str())
    }

    /// Get number of reference sequences.
    pub fn reference_count(&self) -> usize {
        self.references.len()
    }

    /// Reference id for an exact (case-sensitive) name.
    pub fn reference_id(&self, name: &str) -> Option<usize> {
        self.by_name
            .binary_search_by(|&i| self.references[i].name.as_str().cmp(name))
            .ok()
            .map(|pos| self.by_name[pos])
    }

    /// Look a reference up by name: exact match first, then a
    /// case-insensitive match.
    pub fn find_reference(&self, name: &str) -> Option<&ReferenceSequence> {
        if let Some(id) = self.reference_id(name) {
            return self.reference(id);
        }
        self.references
            .iter()
            .find(|r| r.name.eq_ignore_ascii_case(name))
    }

    /// Read group by id.
    pub fn read_group(&self, id: &str) -> Option<&ReadGroup> {
        self.read_groups
            .binary_search_by(|g| g.id.as_str().cmp(id))
            .ok()
            .map(|i| &self.read_groups[i])
    }
}

fn read_array<R: Read, const N: usize>(reader: &mut R, what: &str) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf).map_err(|e| truncated(e, what))?;
    Ok(buf)
}

fn read_i32<R: Read>(reader: &mut R, what: &str) -> Result<i32> {
    Ok(i32::from_le_bytes(read_array(reader, what)?))
}

fn read_vec<R: Read>(reader: &mut R, len: usize, what: &str) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let got = reader
        .take(len as u64)
        .read_to_end(&mut buf)
        .map_err(|e| truncated(e, what))?;
    if got != len {
        return Err(NgsBamError::Truncated(format!(
            "{}: expected {} bytes, got {}",
            what, len, got
        )));
    }
    Ok(buf)
}

fn truncated(e: io::Error, what: &str) -> NgsBamError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        NgsBamError::Truncated(what.to_string())
    } else {
        NgsBamError::from(e)
    }
}

fn check_count(value: i32, what: &str) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| NgsBamError::Format(format!("negative {}: {}", what, value)))
}

/// Read the binary header: magic, header text and reference dictionary.
///
/// Returned references carry only name, length and ordinal; see
/// [`Header::cross_link`].
///
/// # Errors
///
/// Returns error if:
/// - Magic bytes don't match "BAM\1" ([`NgsBamError::Format`])
/// - A length or count is negative ([`NgsBamError::Format`])
/// - Input ends early ([`NgsBamError::Truncated`])
/// - Header text or a name is not valid UTF-8
pub fn read_binary_header<R: Read>(reader: &mut R) -> Result<(String, Vec<ReferenceSequence>)> {
    let magic: [u8; 4] = read_array(reader, "BAM magic")?;
    if &magic != BAM_MAGIC {
        return Err(NgsBamError::Format(format!(
            "Invalid BAM magic: expected {:?}, got {:?}",
            BAM_MAGIC, magic
        )));
    }

    let l_text = check_count(read_i32(reader, "header text length")?, "header text length")?;
    let mut text_bytes = read_vec(reader, l_text, "header text")?;
    if let Some(end) = text_bytes.iter().position(|&b| b == 0) {
        text_bytes.truncate(end);
    }
    let text = String::from_utf8(text_bytes)
        .map_err(|e| NgsBamError::Format(format!("Invalid UTF-8 in SAM header: {}", e)))?;

    let n_ref = check_count(read_i32(reader, "reference count")?, "reference count")?;
    let mut references = Vec::with_capacity(n_ref.min(1 << 16));
    for ordinal in 0..n_ref {
        let l_name = read_i32(reader, "reference name length")?;
        if l_name <= 0 {
            return Err(NgsBamError::Format(format!(
                "Invalid reference name length for reference {}: {}",
                ordinal, l_name
            )));
        }
        let mut name = read_vec(reader, l_name as usize, "reference name")?;
        if name.last() != Some(&0) {
            return Err(NgsBamError::Format(format!(
                "Reference {} name not null-terminated",
                ordinal
            )));
        }
        name.pop();
        let name = String::from_utf8(name).map_err(|e| {
            NgsBamError::Format(format!("Invalid UTF-8 in reference name: {}", e))
        })?;

        let length = read_i32(reader, "reference length")?;
        if length < 0 {
            return Err(NgsBamError::Format(format!(
                "Invalid reference length for {:?}: {}",
                name, length
            )));
        }
        references.push(ReferenceSequence::new(name, length as u32, ordinal));
    }

    Ok((text, references))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn binary_header(text: &str, refs: &[(&str, i32)]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(BAM_MAGIC);
        data.extend_from_slice(&(text.len() as i32).to_le_bytes());
        data.extend_from_slice(text.as_bytes());
        data.extend_from_slice(&(refs.len() as i32).to_le_bytes());
        for (name, len) in refs {
            data.extend_from_slice(&(name.len() as i32 + 1).to_le_bytes());
            data.extend_from_slice(name.as_bytes());
            data.push(0);
            data.extend_from_slice(&len.to_le_bytes());
        }
        data
    }

    #[test]
    fn test_read_full_header() {
        let data = binary_header("@HD\tVN:1.6\n", &[("chr1", 1000), ("chr2", 2000)]);
        let (text, references) = read_binary_header(&mut Cursor::new(data)).unwrap();

        assert_eq!(text, "@HD\tVN:1.6\n");
        assert_eq!(references.len(), 2);
        assert_eq!(references[1].name, "chr2");
        assert_eq!(references[1].length, 2000);
        assert_eq!(references[1].ordinal, 1);
    }

    #[test]
    fn test_read_magic_invalid() {
        let mut data = binary_header("", &[]);
        data[3] = b'X';
        assert!(matches!(
            read_binary_header(&mut Cursor::new(data)),
            Err(NgsBamError::Format(_))
        ));
    }

    #[test]
    fn test_negative_counts() {
        let data = binary_header("", &[("chr1", -5)]);
        assert!(matches!(
            read_binary_header(&mut Cursor::new(data)),
            Err(NgsBamError::Format(_))
        ));

        let mut data = BAM_MAGIC.to_vec();
        data.extend_from_slice(&(-1i32).to_le_bytes());
        assert!(matches!(
            read_binary_header(&mut Cursor::new(data)),
            Err(NgsBamError::Format(_))
        ));
    }

    #[test]
    fn test_truncated_header() {
        let data = binary_header("@HD\tVN:1.6\n", &[("chr1", 1000)]);
        for cut in [2, 6, 12, data.len() - 2] {
            assert!(matches!(
                read_binary_header(&mut Cursor::new(&data[..cut])),
                Err(NgsBamError::Truncated(_))
            ));
        }
    }

    #[test]
    fn test_nul_padded_text() {
        let data = binary_header("@HD\tVN:1.6\n\0\0\0", &[]);
        let (text, _) = read_binary_header(&mut Cursor::new(data)).unwrap();
        assert_eq!(text, "@HD\tVN:1.6\n");
    }

    #[test]
    fn test_parse_text_records() {
        let text = "@HD\tVN:1.5\n\
                    @SQ\tSN:chr1\tLN:1000\tAS:GRCh38\tMD5:\"abc123\"\tSP: human \n\
                    @RG\tID:grp1\tSM:sample1\tPL:ILLUMINA\tPU:'unit 1'\n\
                    @PG\tID:aligner\tfree text allowed here\n\
                    @CO\tanything goes\n";
        let parsed = parse_header_text(text).unwrap();

        assert_eq!(parsed.version.as_deref(), Some("1.5"));
        let chr1 = &parsed.references[0];
        assert_eq!(chr1.length, 1000);
        assert_eq!(chr1.assembly.as_deref(), Some("GRCh38"));
        assert_eq!(chr1.checksum.as_deref(), Some("abc123"));
        assert_eq!(chr1.species.as_deref(), Some("human"));

        let group = &parsed.read_groups[0];
        assert_eq!(group.id, "grp1");
        assert_eq!(group.sample.as_deref(), Some("sample1"));
        assert_eq!(group.platform_unit.as_deref(), Some("unit 1"));
    }

    #[test]
    fn test_sort_and_dedup() {
        let text = "@SQ\tSN:chr2\tLN:20\n@SQ\tSN:chr1\tLN:10\n@SQ\tSN:chr2\tLN:99\n@SQ\tLN:5\n\
                    @RG\tID:b\n@RG\tID:a\n@RG\tSM:orphan\n";
        let parsed = parse_header_text(text).unwrap();

        let names: Vec<_> = parsed.references.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["chr1", "chr2"]);
        assert_eq!(parsed.references[1].length, 20);
        assert_eq!(parsed.references[1].ordinal, 1);

        let ids: Vec<_> = parsed.read_groups.iter().map(|g| g.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn test_stray_fields_are_skipped() {
        let parsed =
            parse_header_text("@SQ\tSN:chr1\tjunk\tLN:1000\n@RG\tID:a\tSM\n@HD\tVN:1.6\tX:y\n")
                .unwrap();
        assert_eq!(parsed.references.len(), 1);
        assert_eq!(parsed.references[0].name, "chr1");
        assert_eq!(parsed.references[0].length, 1000);
        assert_eq!(parsed.read_groups[0].id, "a");
        assert_eq!(parsed.version.as_deref(), Some("1.6"));

        // A field without a colon never becomes a name.
        assert!(parse_header_text("@SQ\tSNchr1\n").unwrap().references.is_empty());
    }

    #[test]
    fn test_malformed_lines() {
        assert!(parse_header_text("@SQ\tSN:chr1\tLN:x\n").is_err());
        assert!(parse_header_text("not a header\n").is_err());
        assert!(parse_header_text("@HD\tVN:1.6\n\n").is_ok());
    }

    #[test]
    fn test_cross_link_keeps_binary_order() {
        let text = "@SQ\tSN:chr1\tLN:1000\tM5:aaa\n@SQ\tSN:chrM\tLN:16569\tAS:hg19\n".to_string();
        let binary = vec![
            ReferenceSequence::new("chrM", 16569, 0),
            ReferenceSequence::new("chr1", 1000, 1),
        ];
        let header = Header::cross_link(text, binary).unwrap();

        assert_eq!(header.reference_name(0), Some("chrM"));
        assert_eq!(header.references[0].assembly.as_deref(), Some("hg19"));
        assert_eq!(header.references[1].checksum.as_deref(), Some("aaa"));
        assert_eq!(header.reference_id("chr1"), Some(1));
        assert_eq!(header.reference_id("CHR1"), None);
        assert_eq!(header.find_reference("CHR1").map(|r| r.ordinal), Some(1));
        assert!(header.find_reference("chr9").is_none());
    }

    #[test]
    fn test_sam_header_lookup() {
        let text = "@SQ\tSN:chr2\tLN:2000\n@SQ\tSN:chr1\tLN:1000\n@RG\tID:grp1\tLB:lib\n";
        let header = Header::from_sam_text(text.to_string()).unwrap();

        assert_eq!(header.reference_count(), 2);
        assert_eq!(header.reference_name(0), Some("chr1"));
        assert_eq!(header.reference_id("chr2"), Some(1));
        assert_eq!(header.reference_name(2), None);
        assert_eq!(
            header.read_group("grp1").and_then(|g| g.library.as_deref()),
            Some("lib")
        );
        assert!(header.read_group("grp2").is_none());
    }
}
