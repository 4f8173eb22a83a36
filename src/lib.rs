//! ngs-bam: streaming BAM/SAM reader with BGZF seeking and indexed slicing
//!
//! # Overview
//!
//! ngs-bam reads coordinate-sorted alignment files the way a genome browser
//! or an alignment-serving layer needs them: sequentially with a fixed-size
//! block buffer, or by region through the `.bai` sidecar index. Plain SAM
//! text is accepted in place of BAM and re-encoded into the same binary
//! record layout.
//!
//! ## Key Features
//!
//! - **BGZF**: seekable block decompressor with CRC32/ISIZE verification
//! - **Zero-copy records**: records inside one block borrow the block buffer
//! - **Indexed slicing**: BAI bins plus the linear index narrow a region to
//!   the chunks worth scanning
//! - **SAM in and out**: text fallback parser and SAM line formatter
//!
//! ## Quick Start
//!
//! ```no_run
//! use ngs_bam::{BamReader, ReadOutcome};
//!
//! # fn main() -> ngs_bam::Result<()> {
//! let mut bam = BamReader::from_path("alignments.bam")?;
//! let chr1 = bam.find_reference("chr1").map_or(0, |r| r.ordinal);
//!
//! let mut slice = bam.slice(chr1, 10_000, 500, true, true)?;
//! while let ReadOutcome::Record(record) = slice.next_record()? {
//!     println!("{:?}", record.position());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`io::bgzf`]: BGZF reader/writer and virtual offsets
//! - [`io::bam`]: header, records, tags, CIGAR, index, reader, slices, SAM text
//! - [`io::codec`]: little-endian field decoding
//! - [`error`]: crate error type

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod error;
pub mod io;

// Re-export commonly used types
pub use error::{NgsBamError, Result};
pub use io::bam::{
    AlignmentSlice, BaiIndex, BamReader, Header, RawRecord, ReadOutcome, ReaderOptions, Record,
    RecordSource,
};
pub use io::bgzf::{BgzfReader, VirtualOffset};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
