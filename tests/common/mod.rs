//! Shared fixtures: small BGZF-compressed BAM files and matching BAI images
//! built in memory from SAM lines.

#![allow(dead_code)]

use std::io::Write;
use std::path::PathBuf;

use ngs_bam::io::bam::{parse_sam_line, reg2bin, Header, MAX_BIN};
use ngs_bam::io::bgzf::{BgzfWriter, VirtualOffset};
use tempfile::TempDir;

pub const HEADER: &str = "@HD\tVN:1.5\n@SQ\tSN:chr1\tLN:1000\n";

/// One placed unmapped read followed by one mapped read at 0-based 99.
pub const READS: [&str; 2] = [
    "u1\t4\tchr1\t100\t0\t*\t*\t0\t0\tACGT\tIIII\tRG:Z:grp1",
    "m1\t0\tchr1\t100\t60\t10M\t*\t0\t0\tACGTACGTAC\tIIIIIIIIII\tXS:i:12\tRG:Z:grp1",
];

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A BAM image plus the virtual offsets an indexer would record.
pub struct BamImage {
    pub bytes: Vec<u8>,
    /// Start of each record
    pub starts: Vec<VirtualOffset>,
    /// End of the last record
    pub end: VirtualOffset,
    /// `(ref_id, pos, reference span, unmapped)` per record
    pub placements: Vec<(i32, i32, i32, bool)>,
}

/// Encode `lines` against `header_text` into a BGZF-compressed BAM.
pub fn build_bam(header_text: &str, lines: &[&str]) -> BamImage {
    let header = Header::from_sam_text(header_text.to_string()).unwrap();

    let mut writer = BgzfWriter::new(Vec::new());
    writer.write_all(b"BAM\x01").unwrap();
    writer
        .write_all(&(header_text.len() as i32).to_le_bytes())
        .unwrap();
    writer.write_all(header_text.as_bytes()).unwrap();
    writer
        .write_all(&(header.references.len() as i32).to_le_bytes())
        .unwrap();
    for reference in &header.references {
        let name = reference.name.as_bytes();
        writer
            .write_all(&((name.len() + 1) as i32).to_le_bytes())
            .unwrap();
        writer.write_all(name).unwrap();
        writer.write_all(&[0]).unwrap();
        writer
            .write_all(&(reference.length as i32).to_le_bytes())
            .unwrap();
    }
    writer.flush_block().unwrap();

    let mut starts = Vec::new();
    let mut placements = Vec::new();
    for line in lines {
        let body = parse_sam_line(line.as_bytes(), &header).unwrap();
        let ref_id = i32::from_le_bytes(body[0..4].try_into().unwrap());
        let pos = i32::from_le_bytes(body[4..8].try_into().unwrap());
        let flag = u16::from_le_bytes(body[14..16].try_into().unwrap());
        let span = cigar_span(line);

        starts.push(writer.virtual_position());
        placements.push((ref_id, pos, span, flag & 0x4 != 0));
        writer
            .write_all(&(body.len() as i32).to_le_bytes())
            .unwrap();
        writer.write_all(&body).unwrap();
    }
    writer.flush_block().unwrap();
    let end = writer.virtual_position();

    BamImage {
        bytes: writer.finish().unwrap(),
        starts,
        end,
        placements,
    }
}

/// Reference span of the CIGAR column (`M`, `D`, `N`, `=`, `X`).
fn cigar_span(line: &str) -> i32 {
    let cigar = line.split('\t').nth(5).unwrap_or("*");
    let mut span = 0;
    let mut number = 0;
    for c in cigar.chars() {
        if let Some(d) = c.to_digit(10) {
            number = number * 10 + d as i32;
        } else {
            if matches!(c, 'M' | 'D' | 'N' | '=' | 'X') {
                span += number;
            }
            number = 0;
        }
    }
    span
}

/// BAI image with one chunk per record in its level-5 bin, a linear index,
/// and the per-reference summary pseudo-bin.
pub fn build_bai(image: &BamImage, n_references: usize) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"BAI\x01");
    out.extend_from_slice(&(n_references as i32).to_le_bytes());

    for ref_id in 0..n_references as i32 {
        let mut bins: Vec<(u32, Vec<(u64, u64)>)> = Vec::new();
        let mut intervals: Vec<u64> = Vec::new();
        let mut first: Option<u64> = None;
        let mut last = 0u64;
        let (mut mapped, mut unmapped) = (0u64, 0u64);

        for (i, &(rid, pos, span, is_unmapped)) in image.placements.iter().enumerate() {
            if rid != ref_id {
                continue;
            }
            let start = image.starts[i].as_raw();
            let end = image
                .starts
                .get(i + 1)
                .copied()
                .unwrap_or(image.end)
                .as_raw();
            let bin = u32::from(reg2bin(i64::from(pos), i64::from(pos + span.max(1))));
            match bins.iter_mut().find(|(id, _)| *id == bin) {
                Some((_, chunks)) => chunks.push((start, end)),
                None => bins.push((bin, vec![(start, end)])),
            }

            let window = (pos >> 14) as usize;
            if intervals.len() <= window {
                intervals.resize(window + 1, 0);
            }
            if intervals[window] == 0 {
                intervals[window] = start;
            }

            first.get_or_insert(start);
            last = end;
            if is_unmapped {
                unmapped += 1;
            } else {
                mapped += 1;
            }
        }

        let n_bin = bins.len() + usize::from(first.is_some());
        out.extend_from_slice(&(n_bin as i32).to_le_bytes());
        for (bin, chunks) in &bins {
            out.extend_from_slice(&bin.to_le_bytes());
            out.extend_from_slice(&(chunks.len() as i32).to_le_bytes());
            for (start, end) in chunks {
                out.extend_from_slice(&start.to_le_bytes());
                out.extend_from_slice(&end.to_le_bytes());
            }
        }
        if let Some(first) = first {
            out.extend_from_slice(&MAX_BIN.to_le_bytes());
            out.extend_from_slice(&2i32.to_le_bytes());
            for value in [first, last, mapped, unmapped] {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }

        out.extend_from_slice(&(intervals.len() as i32).to_le_bytes());
        for offset in intervals {
            out.extend_from_slice(&offset.to_le_bytes());
        }
    }
    let unplaced = image
        .placements
        .iter()
        .filter(|&&(rid, ..)| rid < 0)
        .count() as u64;
    out.extend_from_slice(&unplaced.to_le_bytes());
    out
}

/// Write `reads.bam` (and optionally `reads.bam.bai`) into a fresh
/// temporary directory.
pub fn write_files(bam: &[u8], bai: Option<&[u8]>) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reads.bam");
    std::fs::write(&path, bam).unwrap();
    if let Some(bai) = bai {
        std::fs::write(dir.path().join("reads.bam.bai"), bai).unwrap();
    }
    (dir, path)
}
