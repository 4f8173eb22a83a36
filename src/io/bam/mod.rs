//! BAM (Binary Alignment Map) and SAM reading.
//!
//! # Architecture
//!
//! - [`BamReader`] opens a BGZF stream (or falls back to SAM text), reads
//!   the header and streams records
//! - [`RawRecord`] is one undecoded record, borrowed from the reader's block
//!   buffer or owned when it straddled a block boundary
//! - [`Record`] is the fully decoded, self-contained form
//! - [`BaiIndex`] maps a region to BGZF chunks; [`AlignmentSlice`] scans
//!   them
//! - [`sam`] converts between SAM lines and binary records
//!
//! Decoding is lazy: parsing a record validates its section boundaries and
//! indexes its optional fields, while bases, qualities and tag values are
//! decoded when asked for.
//!
//! # Example
//!
//! ```no_run
//! use ngs_bam::io::bam::BamReader;
//!
//! # fn main() -> ngs_bam::Result<()> {
//! let mut bam = BamReader::from_path("alignments.bam")?;
//!
//! for record in bam.records() {
//!     let record = record?;
//!     if let Some(pos) = record.position {
//!         println!("{:?} at {}", record.name, pos);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod cigar;
pub mod error;
pub mod header;
pub mod index;
pub mod reader;
pub mod record;
pub mod sam;
pub mod sequence;
pub mod slice;
pub mod tags;

// Re-export main types for convenience
pub use cigar::{
    format_cigar, parse_cigar, parse_cigar_text, reference_length, CigarAlphabet, CigarOp,
};
pub use error::BamDecodeError;
pub use header::{
    parse_header_text, read_binary_header, Header, HeaderText, ReadGroup, ReferenceSequence,
    BAM_MAGIC,
};
pub use index::{
    reg2bin, region_to_bins, BaiIndex, Bin, Chunk, IndexSummary, ReferenceIndex, LINEAR_SHIFT,
    MAX_BIN,
};
pub use reader::{BamReader, IndexSource, ReaderOptions, RecordSource, Records};
pub use record::{flags, RawRecord, ReadOutcome, Record, RecordBytes};
pub use sam::{format_sam, parse_sam_line, SamTextReader};
pub use sequence::{decode_sequence, encode_sequence};
pub use slice::{AlignmentIter, AlignmentSlice};
pub use tags::{ArrayValue, TagValue, Tags};
