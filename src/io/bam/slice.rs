//! Filtered record streams over a [`BamReader`].
//!
//! [`AlignmentSlice`] answers region queries through the BAI index: it
//! visits the merged index chunks in order and keeps the records that
//! overlap the window. Chunks only localise records to BGZF blocks, so
//! records before the window start are read and skipped. The scan stops at
//! the first record on another reference or starting at or past the window
//! end.
//!
//! [`AlignmentIter`] walks the whole file and keeps mapped records of the
//! requested categories.
//!
//! ```no_run
//! use ngs_bam::io::bam::{BamReader, ReadOutcome, RecordSource};
//!
//! # fn main() -> ngs_bam::Result<()> {
//! let mut bam = BamReader::from_path("alignments.bam")?;
//! let mut slice = bam.slice(0, 1_000_000, 10_000, true, true)?;
//! while let ReadOutcome::Record(record) = slice.next_record()? {
//!     println!("{:?} {}", record.position(), record.reference_length());
//! }
//! # Ok(())
//! # }
//! ```

use super::index::Chunk;
use super::reader::{BamReader, RecordSource};
use super::record::{flags, RawRecord, ReadOutcome, Record};
use crate::error::{NgsBamError, Result};
use crate::io::bgzf::VirtualOffset;
use log::debug;
use std::io::{Read, Seek};

/// What the region scan does with one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Yield,
    Skip,
    Stop,
}

fn classify(record: &RawRecord<'_>, ref_id: usize, start: i64, end: i64) -> Step {
    if record.is_self_unmapped() {
        return Step::Skip;
    }
    if record.raw_reference_id() as usize != ref_id {
        return Step::Stop;
    }
    let pos = i64::from(record.raw_position());
    if pos >= end {
        return Step::Stop;
    }
    // A record covering no reference bases is treated as covering its
    // start position.
    let span = i64::from(record.reference_length()).max(1);
    if pos + span > start {
        Step::Yield
    } else {
        Step::Skip
    }
}

/// Mapped, and in a requested category (secondary covers FLAG 0x100 and
/// 0x800).
fn is_wanted(record: &RawRecord<'_>, primary: bool, secondary: bool) -> bool {
    if record.is_self_unmapped() {
        return false;
    }
    if record.flags() & (flags::SECONDARY | flags::SUPPLEMENTARY) == 0 {
        primary
    } else {
        secondary
    }
}

/// Indexed region query; see [`BamReader::slice`].
pub struct AlignmentSlice<'r, R> {
    reader: &'r mut BamReader<R>,
    ref_id: usize,
    start: i64,
    end: i64,
    chunks: std::vec::IntoIter<Chunk>,
    /// End of the chunk being scanned.
    chunk_end: Option<VirtualOffset>,
    done: bool,
}

impl<R> std::fmt::Debug for AlignmentSlice<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignmentSlice")
            .field("ref_id", &self.ref_id)
            .field("start", &self.start)
            .field("end", &self.end)
            .field("chunk_end", &self.chunk_end)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl<'r, R: Read + Seek> AlignmentSlice<'r, R> {
    pub(crate) fn new(
        reader: &'r mut BamReader<R>,
        ref_id: usize,
        offset: u64,
        size: u64,
        primary: bool,
        secondary: bool,
    ) -> Result<Self> {
        let length = reader
            .reference(ref_id)
            .map(|r| u64::from(r.length))
            .ok_or_else(|| NgsBamError::UnknownReference(format!("reference id {}", ref_id)))?;

        let mut slice = Self {
            reader,
            ref_id,
            start: 0,
            end: 0,
            chunks: Vec::new().into_iter(),
            chunk_end: None,
            done: true,
        };

        if !primary && !secondary {
            return Ok(slice);
        }
        if !(primary && secondary) {
            return Err(NgsBamError::Unsupported(
                "indexed slices of only primary or only secondary alignments".to_string(),
            ));
        }
        let index = slice
            .reader
            .index()
            .and_then(|index| index.reference(ref_id))
            .ok_or_else(|| {
                NgsBamError::Unsupported(format!("no index for reference id {}", ref_id))
            })?;

        if offset > length {
            return Ok(slice);
        }
        let end = offset.saturating_add(size).min(length);
        // BAI coordinates are 29-bit, so both ends fit in u32.
        let chunks = index.merged_chunks(offset as u32, end as u32);
        debug!(
            "slice of reference {} [{}, {}): {} chunks",
            ref_id,
            offset,
            end,
            chunks.len()
        );

        slice.start = offset as i64;
        slice.end = end as i64;
        slice.done = offset >= end || chunks.is_empty();
        slice.chunks = chunks.into_iter();
        Ok(slice)
    }

    /// Next overlapping record, valid until the following call.
    pub fn next_record(&mut self) -> Result<ReadOutcome<RawRecord<'_>>> {
        let (ref_id, start, end) = (self.ref_id, self.start, self.end);
        loop {
            if self.done {
                return Ok(ReadOutcome::EndOfData);
            }

            let chunk_end = match self.chunk_end {
                Some(chunk_end) => chunk_end,
                None => match self.chunks.next() {
                    Some(chunk) => {
                        if self.reader.position()? != chunk.start {
                            self.reader.seek(chunk.start)?;
                        }
                        self.chunk_end = Some(chunk.end);
                        chunk.end
                    }
                    None => {
                        self.done = true;
                        continue;
                    }
                },
            };
            if self.reader.position()? >= chunk_end {
                self.chunk_end = None;
                continue;
            }

            match self.reader.advance()? {
                ReadOutcome::Record(()) => {}
                ReadOutcome::Empty => continue,
                ReadOutcome::EndOfData => {
                    self.done = true;
                    continue;
                }
            }
            let parsed = {
                let record = self.reader.parse_held()?;
                if record.is_empty() {
                    continue;
                }
                match classify(&record, ref_id, start, end) {
                    Step::Yield => record.into_parsed(),
                    // Records ending before the window do not end the chunk:
                    // later records in the same block may still overlap.
                    Step::Skip => continue,
                    Step::Stop => {
                        self.done = true;
                        continue;
                    }
                }
            };
            return Ok(ReadOutcome::Record(self.reader.finish_held(parsed)));
        }
    }
}

impl<R: Read + Seek> RecordSource for AlignmentSlice<'_, R> {
    fn next_record(&mut self) -> Result<ReadOutcome<RawRecord<'_>>> {
        AlignmentSlice::next_record(self)
    }
}

impl<R: Read + Seek> Iterator for AlignmentSlice<'_, R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Ok(ReadOutcome::Record(raw)) => Some(raw.to_record().map_err(NgsBamError::from)),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Sequential alignment stream; see [`BamReader::alignments`].
pub struct AlignmentIter<'r, R> {
    reader: &'r mut BamReader<R>,
    primary: bool,
    secondary: bool,
}

impl<'r, R: Read + Seek> AlignmentIter<'r, R> {
    pub(crate) fn new(reader: &'r mut BamReader<R>, primary: bool, secondary: bool) -> Self {
        Self {
            reader,
            primary,
            secondary,
        }
    }

    /// Next wanted alignment, valid until the following call.
    pub fn next_record(&mut self) -> Result<ReadOutcome<RawRecord<'_>>> {
        let (primary, secondary) = (self.primary, self.secondary);
        loop {
            match self.reader.advance()? {
                ReadOutcome::Record(()) => {}
                ReadOutcome::Empty => continue,
                ReadOutcome::EndOfData => return Ok(ReadOutcome::EndOfData),
            }
            let parsed = {
                let record = self.reader.parse_held()?;
                if record.is_empty() || !is_wanted(&record, primary, secondary) {
                    continue;
                }
                record.into_parsed()
            };
            return Ok(ReadOutcome::Record(self.reader.finish_held(parsed)));
        }
    }
}

impl<R: Read + Seek> RecordSource for AlignmentIter<'_, R> {
    fn next_record(&mut self) -> Result<ReadOutcome<RawRecord<'_>>> {
        AlignmentIter::next_record(self)
    }
}

impl<R: Read + Seek> Iterator for AlignmentIter<'_, R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Ok(ReadOutcome::Record(raw)) => Some(raw.to_record().map_err(NgsBamError::from)),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::bam::index::{reg2bin, BaiIndex, Bin, IndexSummary, ReferenceIndex};
    use crate::io::bam::record::tests::Body;
    use crate::io::bgzf::BgzfWriter;
    use std::io::{Cursor, Write};

    const HEADER: &str = "@HD\tVN:1.6\tSO:coordinate\n@SQ\tSN:chr1\tLN:100000\n@SQ\tSN:chr2\tLN:50000\n";

    struct Fixture {
        data: Vec<u8>,
        index: BaiIndex,
    }

    /// Coordinate-sorted BAM (one block per record) plus an index whose
    /// bins follow each record's `reg2bin`.
    fn fixture(records: &[(i32, i32, u16, u32)]) -> Fixture {
        let mut writer = BgzfWriter::new(Vec::new());
        writer.write_all(b"BAM\x01").unwrap();
        writer.write_all(&(HEADER.len() as i32).to_le_bytes()).unwrap();
        writer.write_all(HEADER.as_bytes()).unwrap();
        writer.write_all(&2i32.to_le_bytes()).unwrap();
        for (name, len) in [("chr1", 100_000i32), ("chr2", 50_000)] {
            writer.write_all(&(name.len() as i32 + 1).to_le_bytes()).unwrap();
            writer.write_all(name.as_bytes()).unwrap();
            writer.write_all(&[0]).unwrap();
            writer.write_all(&len.to_le_bytes()).unwrap();
        }
        writer.flush_block().unwrap();

        let mut bins: Vec<Vec<Bin>> = vec![Vec::new(), Vec::new()];
        let mut intervals: Vec<Vec<u64>> = vec![Vec::new(), Vec::new()];
        for &(ref_id, pos, flag, span) in records {
            let body = Body {
                ref_id,
                pos,
                flags: flag,
                cigar: vec![span << 4],
                ..Body::default()
            }
            .encode();
            let start = writer.virtual_position();
            writer.write_all(&(body.len() as i32).to_le_bytes()).unwrap();
            writer.write_all(&body).unwrap();
            writer.flush_block().unwrap();
            let end = writer.virtual_position();

            if ref_id < 0 || flag & flags::UNMAPPED != 0 {
                continue;
            }
            let r = ref_id as usize;
            let bin_id = u32::from(reg2bin(i64::from(pos), i64::from(pos) + i64::from(span)));
            match bins[r].iter_mut().find(|b| b.bin_id == bin_id) {
                Some(bin) => bin.chunks.push(Chunk::new(start, end)),
                None => bins[r].push(Bin {
                    bin_id,
                    chunks: vec![Chunk::new(start, end)],
                }),
            }
            let window = (pos as usize) >> 14;
            while intervals[r].len() <= window {
                intervals[r].push(start.as_raw());
            }
        }
        let data = writer.finish().unwrap();

        let references = bins
            .into_iter()
            .zip(intervals)
            .map(|(bins, intervals)| ReferenceIndex::new(bins, &intervals, None))
            .collect();
        Fixture {
            data,
            index: BaiIndex::new(references, None),
        }
    }

    fn open(fixture: &Fixture) -> BamReader<Cursor<Vec<u8>>> {
        let mut bam = BamReader::new(Cursor::new(fixture.data.clone())).unwrap();
        bam.set_index(fixture.index.clone()).unwrap();
        bam
    }

    fn positions<R: Read + Seek>(slice: AlignmentSlice<'_, R>) -> Vec<i32> {
        slice.map(|r| r.unwrap().position.unwrap()).collect()
    }

    fn sample() -> Fixture {
        fixture(&[
            (0, 100, 0, 60),
            (0, 120, flags::UNMAPPED, 10),
            (0, 140, 0, 10),
            (0, 20_000, flags::SECONDARY, 100),
            (0, 40_000, 0, 100),
            (1, 10, 0, 10),
            (-1, -1, flags::UNMAPPED, 10),
        ])
    }

    #[test]
    fn test_slice_overlap_rules() {
        let sample = sample();
        let mut bam = open(&sample);

        // Records at 100 and 140 cover [100, 160) and [140, 150).
        assert_eq!(positions(bam.slice(0, 149, 1, true, true).unwrap()), vec![100, 140]);
        assert_eq!(positions(bam.slice(0, 150, 1, true, true).unwrap()), vec![100]);
        assert!(positions(bam.slice(0, 160, 10, true, true).unwrap()).is_empty());
        assert_eq!(positions(bam.slice(0, 0, 100, true, true).unwrap()), Vec::<i32>::new());
        assert_eq!(positions(bam.slice(0, 0, 100_000, true, true).unwrap()), vec![100, 140, 20_000, 40_000]);
        assert_eq!(positions(bam.slice(0, 30_000, 20_000, true, true).unwrap()), vec![40_000]);
        assert_eq!(positions(bam.slice(1, 0, 50_000, true, true).unwrap()), vec![10]);
    }

    #[test]
    fn test_slice_keeps_scanning_past_records_before_the_window() {
        // All three records share one bin, so they land in a single chunk.
        let nested = fixture(&[(0, 100, 0, 10), (0, 105, 0, 60), (0, 120, 0, 5)]);
        let mut bam = open(&nested);

        assert_eq!(positions(bam.slice(0, 150, 5, true, true).unwrap()), vec![105]);
        assert_eq!(positions(bam.slice(0, 112, 1, true, true).unwrap()), vec![105]);
    }

    #[test]
    fn test_slice_zero_span_record_covers_its_start() {
        let zero = fixture(&[(0, 300, 0, 0), (0, 400, 0, 10)]);
        let mut bam = open(&zero);

        assert_eq!(positions(bam.slice(0, 300, 1, true, true).unwrap()), vec![300]);
        assert_eq!(positions(bam.slice(0, 290, 11, true, true).unwrap()), vec![300]);
        assert!(positions(bam.slice(0, 301, 10, true, true).unwrap()).is_empty());
        assert!(positions(bam.slice(0, 299, 1, true, true).unwrap()).is_empty());
    }

    /// Records of ~9 KiB written back to back, so several straddle the
    /// 64 KiB block boundaries, indexed as one chunk.
    fn straddling_fixture(n: i32) -> (Fixture, Vec<VirtualOffset>) {
        let mut writer = BgzfWriter::new(Vec::new());
        writer.write_all(b"BAM\x01").unwrap();
        writer.write_all(&(HEADER.len() as i32).to_le_bytes()).unwrap();
        writer.write_all(HEADER.as_bytes()).unwrap();
        writer.write_all(&2i32.to_le_bytes()).unwrap();
        for (name, len) in [("chr1", 100_000i32), ("chr2", 50_000)] {
            writer.write_all(&(name.len() as i32 + 1).to_le_bytes()).unwrap();
            writer.write_all(name.as_bytes()).unwrap();
            writer.write_all(&[0]).unwrap();
            writer.write_all(&len.to_le_bytes()).unwrap();
        }
        writer.flush_block().unwrap();

        let mut tag = b"XZZ".to_vec();
        tag.extend(std::iter::repeat(b'A').take(9000));
        tag.push(0);

        let mut starts = Vec::new();
        for i in 0..n {
            let body = Body {
                pos: 1000 + i * 10,
                cigar: vec![10 << 4],
                tags: tag.clone(),
                ..Body::default()
            }
            .encode();
            starts.push(writer.virtual_position());
            writer.write_all(&(body.len() as i32).to_le_bytes()).unwrap();
            writer.write_all(&body).unwrap();
        }
        writer.flush_block().unwrap();
        let end = writer.virtual_position();
        let data = writer.finish().unwrap();

        let bin = Bin {
            bin_id: u32::from(reg2bin(1000, 1000 + i64::from(n) * 10)),
            chunks: vec![Chunk::new(starts[0], end)],
        };
        let references = vec![
            ReferenceIndex::new(vec![bin], &[starts[0].as_raw()], None),
            ReferenceIndex::default(),
        ];
        let fixture = Fixture {
            data,
            index: BaiIndex::new(references, None),
        };
        (fixture, starts)
    }

    #[test]
    fn test_slice_reads_straddling_records_once() {
        let (straddling, starts) = straddling_fixture(20);
        let blocks: std::collections::BTreeSet<u64> =
            starts.iter().map(|s| s.compressed_offset()).collect();
        let mut bam = open(&straddling);
        let before = bam.blocks_inflated().unwrap();

        let mut slice = bam.slice(0, 0, 100_000, true, true).unwrap();
        let mut seen = Vec::new();
        let mut owned = 0;
        while let ReadOutcome::Record(record) = slice.next_record().unwrap() {
            if !record.is_borrowed() {
                owned += 1;
            }
            assert_eq!(record.tag_count(b"XZ"), 1);
            seen.push(record.position().unwrap());
        }
        let expected: Vec<i32> = (0..20).map(|i| 1000 + i * 10).collect();
        assert_eq!(seen, expected);
        assert!(owned > 0);

        // One inflation per block the records touch: the initial seek plus
        // each following block, never a block twice.
        let inflated = bam.blocks_inflated().unwrap() - before;
        assert!(
            inflated <= blocks.len() as u64 + 1,
            "{} inflations for {} blocks",
            inflated,
            blocks.len()
        );
    }

    #[test]
    fn test_alignment_iter_reads_straddling_records_once() {
        let (straddling, starts) = straddling_fixture(20);
        let blocks: std::collections::BTreeSet<u64> =
            starts.iter().map(|s| s.compressed_offset()).collect();
        let mut bam = BamReader::new(Cursor::new(straddling.data.clone())).unwrap();
        let before = bam.blocks_inflated().unwrap();

        let mut last = None;
        let mut iter = bam.alignments(true, true);
        let mut count = 0;
        while let ReadOutcome::Record(record) = iter.next_record().unwrap() {
            assert!(last < record.position());
            last = record.position();
            count += 1;
        }
        assert_eq!(count, 20);
        // The final block read is the EOF marker.
        assert!(bam.blocks_inflated().unwrap() - before <= blocks.len() as u64 + 2);
    }

    #[test]
    fn test_slice_clamps_and_empty_requests() {
        let sample = sample();
        let mut bam = open(&sample);

        assert_eq!(positions(bam.slice(0, 39_000, u64::MAX, true, true).unwrap()), vec![40_000]);
        assert!(positions(bam.slice(0, 100_001, 10, true, true).unwrap()).is_empty());
        assert!(positions(bam.slice(0, 0, 100_000, false, false).unwrap()).is_empty());
    }

    #[test]
    fn test_slice_unsupported_requests() {
        let sample = sample();
        let mut bam = open(&sample);
        assert!(bam.slice(0, 0, 10, true, false).unwrap_err().is_unsupported());
        assert!(bam.slice(0, 0, 10, false, true).unwrap_err().is_unsupported());
        assert!(matches!(
            bam.slice(5, 0, 10, true, true),
            Err(NgsBamError::UnknownReference(_))
        ));

        let mut unindexed = BamReader::new(Cursor::new(sample.data.clone())).unwrap();
        assert!(unindexed.slice(0, 0, 10, true, true).unwrap_err().is_unsupported());
    }

    #[test]
    fn test_slice_after_sequential_reads() {
        let sample = sample();
        let mut bam = open(&sample);
        while !bam.read_raw().unwrap().is_end() {}
        assert_eq!(positions(bam.slice(0, 100, 10, true, true).unwrap()), vec![100]);
    }

    #[test]
    fn test_slice_borrowed_records() {
        let sample = sample();
        let mut bam = open(&sample);
        let mut slice = bam.slice(0, 0, 200, true, true).unwrap();
        match slice.next_record().unwrap() {
            ReadOutcome::Record(record) => {
                assert!(record.is_borrowed());
                assert_eq!(record.position(), Some(100));
            }
            other => panic!("expected a record, got {:?}", other.is_end()),
        }
    }

    #[test]
    fn test_alignment_iter_filters() {
        let sample = sample();
        let mut bam = open(&sample);

        let all: Vec<i32> = bam
            .alignments(true, true)
            .map(|r| r.unwrap().position.unwrap())
            .collect();
        assert_eq!(all, vec![100, 140, 20_000, 40_000, 10]);

        bam.rewind().unwrap();
        let secondary: Vec<i32> = bam
            .alignments(false, true)
            .map(|r| r.unwrap().position.unwrap())
            .collect();
        assert_eq!(secondary, vec![20_000]);

        bam.rewind().unwrap();
        assert_eq!(bam.alignments(false, false).count(), 0);
    }

    #[test]
    fn test_alignment_count_from_summary() {
        let sample = sample();
        let mut bam = open(&sample);
        let summary = IndexSummary {
            n_mapped: 4,
            n_unmapped: 1,
            ..IndexSummary::default()
        };
        let reference = ReferenceIndex::new(Vec::new(), &[], Some(summary));
        bam.set_index(BaiIndex::new(vec![reference, ReferenceIndex::default()], Some(1)))
            .unwrap();
        assert_eq!(bam.alignment_count(0), Some(4));
        assert_eq!(bam.unmapped_count(0), Some(1));
        assert_eq!(bam.alignment_count(1), None);
        assert_eq!(bam.unplaced_count(), Some(1));
    }
}
