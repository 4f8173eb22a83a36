//! I/O module: block compression, byte decoding and the BAM/SAM stack.
//!
//! Everything here is single-threaded and blocking; one open reader must
//! not be shared between threads without external locking.

pub mod bam;
pub mod bgzf;
pub mod codec;

pub use bam::BamReader;
pub use bgzf::{BgzfReader, BgzfWriter, VirtualOffset};
