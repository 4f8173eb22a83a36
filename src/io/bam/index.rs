//! BAI (BAM Index) loading and region slicing.
//!
//! A `.bai` file holds, for every reference sequence, a hierarchical bin
//! index (37,450 bins over 6 levels) and a linear index of 16 Kbp
//! intervals. Together they narrow a genomic interval down to the BGZF
//! virtual offsets worth scanning.
//!
//! # Format
//!
//! ```text
//! magic[4]     "BAI\1"
//! n_ref[4]     Number of reference sequences (int32)
//! For each reference:
//!   n_bin[4]   Number of bins (int32)
//!   For each bin:
//!     bin[4]   Bin number (uint32)
//!     n_chunk[4] Number of chunks (int32)
//!     For each chunk:
//!       chunk_beg[8]  Virtual offset (uint64)
//!       chunk_end[8]  Virtual offset (uint64)
//!   n_intv[4]  Number of intervals (int32)
//!   For each interval:
//!     ioffset[8] Virtual offset (uint64)
//! n_no_coor[8] Unplaced unmapped reads (optional, uint64)
//! ```
//!
//! Bin [`MAX_BIN`] with exactly two chunks is not a bin: it carries the
//! reference's mapped offset range and mapped/unmapped read counts.
//!
//! Loading is all-or-nothing. A truncated file, a negative count or a
//! reference count that disagrees with the BAM header rejects the whole
//! index.
//!
//! ```no_run
//! use ngs_bam::io::bam::BaiIndex;
//!
//! # fn main() -> ngs_bam::Result<()> {
//! let index = BaiIndex::from_path("alignments.bam.bai", Some(25))?;
//! let offsets = index.index_slice(0, 1_000_000, 1_001_000).unwrap_or_default();
//! println!("{} candidate offsets", offsets.len());
//! # Ok(())
//! # }
//! ```

use crate::error::{NgsBamError, Result};
use crate::io::bgzf::VirtualOffset;
use crate::io::codec::Cursor;
use log::debug;
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

/// BAI magic bytes.
pub const BAI_MAGIC: &[u8; 4] = b"BAI\x01";

/// Pseudo-bin carrying the per-reference summary.
pub const MAX_BIN: u32 = 37450;

/// log2 of the linear index interval width (16 Kbp).
pub const LINEAR_SHIFT: u32 = 14;

/// First bin id of levels 1 to 5.
const LEVEL_FIRST: [u32; 5] = [1, 9, 73, 585, 4681];

/// Position shift of levels 1 to 5.
const LEVEL_SHIFT: [u32; 5] = [26, 23, 20, 17, 14];

/// A contiguous range of data in the BAM file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Virtual file offset where chunk starts
    pub start: VirtualOffset,
    /// Virtual file offset where chunk ends
    pub end: VirtualOffset,
}

impl Chunk {
    /// Create a new chunk.
    pub fn new(start: VirtualOffset, end: VirtualOffset) -> Self {
        Chunk { start, end }
    }
}

/// A bin in the hierarchical binning index.
///
/// - Level 0: bin 0 (entire sequence, 512 Mbp)
/// - Level 1: bins 1-8 (64 Mbp each)
/// - Level 2: bins 9-72 (8 Mbp each)
/// - Level 3: bins 73-584 (1 Mbp each)
/// - Level 4: bins 585-4680 (128 Kbp each)
/// - Level 5: bins 4681-37449 (16 Kbp each)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bin {
    /// Bin number (0-37449)
    pub bin_id: u32,
    /// Chunks of data in this bin
    pub chunks: Vec<Chunk>,
}

/// Reference-level summary stored in the [`MAX_BIN`] pseudo-bin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexSummary {
    /// First virtual offset of this reference's records
    pub off_beg: VirtualOffset,
    /// End virtual offset of this reference's records
    pub off_end: VirtualOffset,
    /// Mapped reads on this reference
    pub n_mapped: u64,
    /// Placed unmapped reads on this reference
    pub n_unmapped: u64,
}

/// Index data for one reference sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceIndex {
    /// Bins sorted by id
    bins: Vec<Bin>,
    /// Linear index; an entry equal to its predecessor is stored as 0 and
    /// trailing zeros are trimmed
    intervals: Vec<u64>,
    summary: Option<IndexSummary>,
}

impl ReferenceIndex {
    /// Build from bins and raw linear-index entries.
    pub fn new(mut bins: Vec<Bin>, intervals: &[u64], summary: Option<IndexSummary>) -> Self {
        bins.sort_by_key(|b| b.bin_id);
        Self {
            bins,
            intervals: compact_intervals(intervals),
            summary,
        }
    }

    /// Bins sorted by id.
    pub fn bins(&self) -> &[Bin] {
        &self.bins
    }

    /// Bin by id.
    pub fn bin(&self, bin_id: u32) -> Option<&Bin> {
        self.bins
            .binary_search_by_key(&bin_id, |b| b.bin_id)
            .ok()
            .map(|i| &self.bins[i])
    }

    /// Compacted linear index.
    pub fn intervals(&self) -> &[u64] {
        &self.intervals
    }

    /// The summary pseudo-bin, when present.
    pub fn summary(&self) -> Option<&IndexSummary> {
        self.summary.as_ref()
    }

    /// Linear-index offset of interval `i`, undoing the compaction.
    /// `None` when nothing at or before `i` is recorded.
    pub fn interval(&self, i: usize) -> Option<VirtualOffset> {
        let last = i.min(self.intervals.len().checked_sub(1)?);
        self.intervals[..=last]
            .iter()
            .rev()
            .find(|&&v| v != 0)
            .map(|&v| VirtualOffset::from_raw(v))
    }

    /// Upper bound for chunk starts of a query ending at `end`.
    ///
    /// Taken from the interval after the one holding `end`, or the
    /// reference's end offset past the linear index. `None` means
    /// unbounded.
    pub fn max_offset(&self, end: u32) -> Option<VirtualOffset> {
        let i = (end >> LINEAR_SHIFT) as usize + 1;
        let bound = if i < self.intervals.len() {
            self.interval(i)
        } else {
            self.summary.map(|s| s.off_end)
        };
        bound.filter(|v| v.as_raw() != 0)
    }

    /// Chunks from every bin overlapping `[beg, end)` whose start lies
    /// below [`ReferenceIndex::max_offset`], sorted by start.
    pub fn index_chunks(&self, beg: u32, end: u32) -> Vec<Chunk> {
        let maxpos = self.max_offset(end);
        let mut chunks: Vec<Chunk> = region_to_bins(beg, end)
            .into_iter()
            .filter_map(|id| self.bin(id))
            .flat_map(|bin| bin.chunks.iter().copied())
            .filter(|chunk| maxpos.is_none_or(|max| chunk.start < max))
            .collect();
        chunks.sort_by_key(|c| c.start);
        chunks
    }

    /// Sorted start offsets of the chunks to visit for `[beg, end)`.
    ///
    /// Empty when no alignments can overlap the interval.
    pub fn index_slice(&self, beg: u32, end: u32) -> Vec<VirtualOffset> {
        self.index_chunks(beg, end)
            .into_iter()
            .map(|c| c.start)
            .collect()
    }

    /// [`ReferenceIndex::index_chunks`] with overlapping chunks merged.
    pub fn merged_chunks(&self, beg: u32, end: u32) -> Vec<Chunk> {
        merge_chunks(self.index_chunks(beg, end))
    }
}

fn compact_intervals(raw: &[u64]) -> Vec<u64> {
    let mut last = 0;
    let mut out: Vec<u64> = raw
        .iter()
        .map(|&v| {
            let stored = if v == last { 0 } else { v };
            last = v;
            stored
        })
        .collect();
    while out.last() == Some(&0) {
        out.pop();
    }
    out
}

/// BAI (BAM Index) structure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BaiIndex {
    references: Vec<ReferenceIndex>,
    n_no_coor: Option<u64>,
}

impl BaiIndex {
    /// Create from per-reference indexes.
    pub fn new(references: Vec<ReferenceIndex>, n_no_coor: Option<u64>) -> Self {
        Self {
            references,
            n_no_coor,
        }
    }

    /// Load a BAI index from a file.
    ///
    /// `expected_refs` is the BAM header's reference count; a different
    /// count in the index rejects it.
    pub fn from_path<P: AsRef<Path>>(path: P, expected_refs: Option<usize>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        debug!("loading BAI index {} ({} bytes)", path.display(), mmap.len());
        Self::from_bytes(&mmap, expected_refs)
    }

    /// Parse a complete BAI image.
    pub fn from_bytes(data: &[u8], expected_refs: Option<usize>) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let magic = cursor.bytes(4).ok_or_else(|| truncated(&cursor))?;
        if magic != BAI_MAGIC {
            return Err(NgsBamError::Format(format!(
                "Invalid BAI magic bytes: expected 'BAI\\x01', got {:?}",
                magic
            )));
        }

        let n_ref = read_count(&mut cursor, "reference count")?;
        if let Some(expected) = expected_refs {
            if n_ref != expected {
                return Err(NgsBamError::Format(format!(
                    "index has {} references, header declares {}",
                    n_ref, expected
                )));
            }
        }

        let mut references = Vec::with_capacity(n_ref.min(1 << 16));
        for _ in 0..n_ref {
            references.push(read_reference_index(&mut cursor)?);
        }

        let n_no_coor = cursor.u64();
        Ok(Self {
            references,
            n_no_coor,
        })
    }

    /// Per-reference index.
    pub fn reference(&self, ref_id: usize) -> Option<&ReferenceIndex> {
        self.references.get(ref_id)
    }

    /// Number of references covered.
    pub fn reference_count(&self) -> usize {
        self.references.len()
    }

    /// Unplaced unmapped reads, if recorded.
    pub fn n_no_coor(&self) -> Option<u64> {
        self.n_no_coor
    }

    /// [`ReferenceIndex::index_slice`] for reference `ref_id`.
    pub fn index_slice(&self, ref_id: usize, beg: u32, end: u32) -> Option<Vec<VirtualOffset>> {
        self.reference(ref_id).map(|r| r.index_slice(beg, end))
    }
}

fn truncated(cursor: &Cursor<'_>) -> NgsBamError {
    NgsBamError::Truncated(format!("BAI index ends at byte {}", cursor.position()))
}

fn read_count(cursor: &mut Cursor<'_>, what: &str) -> Result<usize> {
    let value = cursor.i32().ok_or_else(|| truncated(cursor))?;
    usize::try_from(value)
        .map_err(|_| NgsBamError::Format(format!("Invalid {} in BAI index: {}", what, value)))
}

fn read_offset(cursor: &mut Cursor<'_>) -> Result<VirtualOffset> {
    cursor
        .u64()
        .map(VirtualOffset::from_raw)
        .ok_or_else(|| truncated(cursor))
}

fn read_reference_index(cursor: &mut Cursor<'_>) -> Result<ReferenceIndex> {
    let n_bin = read_count(cursor, "bin count")?;
    let mut bins = Vec::with_capacity(n_bin.min(MAX_BIN as usize));
    let mut summary = None;

    for _ in 0..n_bin {
        let bin_id = cursor.u32().ok_or_else(|| truncated(cursor))?;
        let n_chunk = read_count(cursor, "chunk count")?;

        if bin_id == MAX_BIN && n_chunk == 2 {
            summary = Some(IndexSummary {
                off_beg: read_offset(cursor)?,
                off_end: read_offset(cursor)?,
                n_mapped: cursor.u64().ok_or_else(|| truncated(cursor))?,
                n_unmapped: cursor.u64().ok_or_else(|| truncated(cursor))?,
            });
            continue;
        }

        let mut chunks = Vec::with_capacity(n_chunk.min(1 << 16));
        for _ in 0..n_chunk {
            let start = read_offset(cursor)?;
            let end = read_offset(cursor)?;
            chunks.push(Chunk::new(start, end));
        }
        if bin_id < MAX_BIN {
            bins.push(Bin { bin_id, chunks });
        }
    }

    let n_intv = read_count(cursor, "interval count")?;
    let raw = cursor
        .bytes(n_intv.checked_mul(8).ok_or_else(|| truncated(cursor))?)
        .ok_or_else(|| truncated(cursor))?;
    let intervals: Vec<u64> = raw
        .chunks_exact(8)
        .map(|b| crate::io::codec::le_u64(b, 0).unwrap_or_default())
        .collect();

    Ok(ReferenceIndex::new(bins, &intervals, summary))
}

/// Bin ids overlapping `[beg, end)`: bin 0 plus every bin on levels 1-5
/// between those holding `beg` and `end - 1`.
pub fn region_to_bins(beg: u32, end: u32) -> Vec<u32> {
    let last = end.max(beg.saturating_add(1)) - 1;
    let mut bins = vec![0];
    for (first, shift) in LEVEL_FIRST.iter().zip(LEVEL_SHIFT) {
        bins.extend((first + (beg >> shift))..=(first + (last >> shift)));
    }
    bins
}

/// Smallest bin wholly containing `[beg, end)` (0-based, end exclusive).
pub fn reg2bin(beg: i64, end: i64) -> u16 {
    let end = end.max(beg.saturating_add(1)) - 1;
    for (first, shift) in LEVEL_FIRST.iter().zip(LEVEL_SHIFT).rev() {
        if beg >> shift == end >> shift {
            return (i64::from(*first) + (beg >> shift)) as u16;
        }
    }
    0
}

/// Merge overlapping or adjacent chunks (input sorted by start).
fn merge_chunks(chunks: Vec<Chunk>) -> Vec<Chunk> {
    let mut merged: Vec<Chunk> = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        match merged.last_mut() {
            Some(current) if chunk.start <= current.end => {
                current.end = current.end.max(chunk.end);
            }
            _ => merged.push(chunk),
        }
    }
    merged
}
