//! BAM (or plain SAM) reader.
//!
//! [`BamReader`] opens a file, reads its header and then hands out records
//! one at a time. BGZF input is decoded as BAM; anything else is scanned as
//! SAM text and re-encoded, so both sources produce the same [`RawRecord`]
//! bytes.
//!
//! Records come back as [`ReadOutcome`]: a record, an empty (skippable)
//! record, or the end of the data. A borrowed record is valid until the next
//! read call.
//!
//! # Usage
//!
//! ```no_run
//! use ngs_bam::io::bam::{BamReader, ReadOutcome};
//!
//! # fn main() -> ngs_bam::Result<()> {
//! let mut bam = BamReader::from_path("alignments.bam")?;
//! println!("Header: {} references", bam.header().reference_count());
//!
//! loop {
//!     match bam.read_raw()? {
//!         ReadOutcome::Record(record) => println!("{:?}", record.position()),
//!         ReadOutcome::Empty => continue,
//!         ReadOutcome::EndOfData => break,
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use super::error::BamDecodeError;
use super::header::{read_binary_header, Header, ReadGroup, ReferenceSequence};
use super::index::BaiIndex;
use super::record::{Parsed, RawRecord, ReadOutcome, Record, RecordBytes, FIXED_LEN};
use super::sam::SamTextReader;
use super::slice::{AlignmentIter, AlignmentSlice};
use crate::error::{NgsBamError, Result};
use crate::io::bgzf::{BgzfReader, VirtualOffset, IO_BLOCK_SIZE};
use crate::io::codec;
use log::{debug, info, warn};
use std::borrow::Cow;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

const GZIP_MAGIC: [u8; 2] = [31, 139];

/// Where to look for a BAI index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum IndexSource {
    /// `<file>.bai` next to a file opened by path
    #[default]
    Sibling,
    /// An explicit index file
    Path(PathBuf),
    /// Never load an index
    None,
}

/// Options for opening a [`BamReader`].
///
/// ```
/// use ngs_bam::io::bam::{IndexSource, ReaderOptions};
///
/// let options = ReaderOptions::new()
///     .header_override("@SQ\tSN:chr1\tLN:1000\n")
///     .index(IndexSource::None)
///     .buffer_capacity(64 * 1024);
/// assert_eq!(options.index, IndexSource::None);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderOptions {
    /// Header text used instead of the one in the file
    pub header_override: Option<String>,
    /// Index to load
    pub index: IndexSource,
    /// Size of the I/O read window
    pub buffer_capacity: usize,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            header_override: None,
            index: IndexSource::Sibling,
            buffer_capacity: IO_BLOCK_SIZE,
        }
    }
}

impl ReaderOptions {
    /// Default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the file's header text.
    pub fn header_override(mut self, text: impl Into<String>) -> Self {
        self.header_override = Some(text.into());
        self
    }

    /// Choose the index source.
    pub fn index(mut self, index: IndexSource) -> Self {
        self.index = index;
        self
    }

    /// Set the I/O window size.
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }
}

/// Pull-style record provider.
///
/// Implemented by [`BamReader`] (every record in file order) and by the
/// filtered views [`AlignmentSlice`] and [`AlignmentIter`].
pub trait RecordSource {
    /// Next record, valid until the following call.
    fn next_record(&mut self) -> Result<ReadOutcome<RawRecord<'_>>>;
}

enum Source<R> {
    Bam(BgzfReader<R>),
    Sam(SamTextReader<BufReader<R>>),
}

/// Where the body of the record last advanced over lives.
enum Held {
    Nothing,
    /// The last `n` bytes consumed from the active BGZF block.
    Block(usize),
    /// Copied out of consecutive blocks.
    Copied(Vec<u8>),
    /// The SAM reader's encoded line.
    Sam,
}

/// Alignment file reader.
///
/// The header is read once during construction; records are then streamed
/// with a fixed-size block buffer.
pub struct BamReader<R> {
    source: Source<R>,
    held: Held,
    header: Header,
    index: Option<BaiIndex>,
    /// Virtual offset of the first record (BAM only).
    first_record: VirtualOffset,
    file_size: u64,
}

impl<R: Read + Seek> BamReader<R> {
    /// Open with default options.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The input cannot be read
    /// - BGZF input is damaged or its BAM header is invalid
    /// - Plain input has no SAM header
    pub fn new(inner: R) -> Result<Self> {
        Self::with_options(inner, &ReaderOptions::default())
    }

    /// Open with explicit options.
    ///
    /// [`IndexSource::Sibling`] needs a path and is ignored here; see
    /// [`BamReader::from_path_with_options`].
    pub fn with_options(mut inner: R, options: &ReaderOptions) -> Result<Self> {
        let file_size = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        let mut magic = [0u8; 2];
        let peeked = read_prefix(&mut inner, &mut magic)?;
        inner.seek(SeekFrom::Start(0))?;

        let mut reader = if peeked == magic.len() && magic == GZIP_MAGIC {
            Self::open_bam(inner, options, file_size)?
        } else {
            debug!("input is not BGZF, reading as SAM text");
            Self::open_sam(inner, options, file_size)?
        };

        if let IndexSource::Path(path) = &options.index {
            reader.try_load_index(path);
        }
        Ok(reader)
    }

    fn open_bam(inner: R, options: &ReaderOptions, file_size: u64) -> Result<Self> {
        let mut bgzf = BgzfReader::with_capacity(options.buffer_capacity, inner)?;
        let (embedded, references) = read_binary_header(&mut bgzf)?;
        let text = options.header_override.clone().unwrap_or(embedded);
        let header = Header::cross_link(text, references)?;
        let first_record = bgzf.virtual_position();
        debug!(
            "BAM header: {} references, first record at {}",
            header.reference_count(),
            first_record
        );

        Ok(Self {
            source: Source::Bam(bgzf),
            held: Held::Nothing,
            header,
            index: None,
            first_record,
            file_size,
        })
    }

    fn open_sam(inner: R, options: &ReaderOptions, file_size: u64) -> Result<Self> {
        let sam = SamTextReader::new(BufReader::with_capacity(options.buffer_capacity, inner))?;
        let text = match &options.header_override {
            Some(text) => text.clone(),
            None => sam.header_text().to_string(),
        };
        if text.trim().is_empty() {
            return Err(NgsBamError::Format(
                "input is neither BGZF nor SAM with a header".to_string(),
            ));
        }
        let header = Header::from_sam_text(text)?;

        Ok(Self {
            source: Source::Sam(sam),
            held: Held::Nothing,
            header,
            index: None,
            first_record: VirtualOffset::default(),
            file_size,
        })
    }

    /// Read the next record.
    ///
    /// # Errors
    ///
    /// A record that fails to decode aborts this call with
    /// [`NgsBamError::Decode`]; end of input inside a record is
    /// [`NgsBamError::Truncated`].
    pub fn read_raw(&mut self) -> Result<ReadOutcome<RawRecord<'_>>> {
        match self.advance()? {
            ReadOutcome::Record(()) => {}
            ReadOutcome::Empty => return Ok(ReadOutcome::Empty),
            ReadOutcome::EndOfData => return Ok(ReadOutcome::EndOfData),
        }
        let n_references = self.header.reference_count();
        let record = RawRecord::parse(self.take_held(), n_references)?;
        if record.is_empty() {
            return Ok(ReadOutcome::Empty);
        }
        Ok(ReadOutcome::Record(record))
    }

    /// Read and fully decode the next record.
    pub fn read_record(&mut self) -> Result<ReadOutcome<Record>> {
        Ok(match self.read_raw()? {
            ReadOutcome::Record(raw) => ReadOutcome::Record(raw.to_record()?),
            ReadOutcome::Empty => ReadOutcome::Empty,
            ReadOutcome::EndOfData => ReadOutcome::EndOfData,
        })
    }

    /// Iterate over decoded records, skipping empty ones.
    pub fn records(&mut self) -> Records<'_, R> {
        Records { reader: self }
    }

    /// Alignments in file order, keeping only mapped records of the wanted
    /// categories (secondary covers FLAG 0x100 and 0x800).
    pub fn alignments(&mut self, primary: bool, secondary: bool) -> AlignmentIter<'_, R> {
        AlignmentIter::new(self, primary, secondary)
    }

    /// Alignments on reference `ref_id` overlapping `[offset, offset + size)`
    /// (0-based), found through the index.
    ///
    /// # Errors
    ///
    /// - [`NgsBamError::UnknownReference`] for an id outside the header
    /// - [`NgsBamError::Unsupported`] without an index, or when only one of
    ///   `primary`/`secondary` is requested
    ///
    /// Asking for neither category, or an `offset` past the reference end,
    /// gives an empty slice.
    pub fn slice(
        &mut self,
        ref_id: usize,
        offset: u64,
        size: u64,
        primary: bool,
        secondary: bool,
    ) -> Result<AlignmentSlice<'_, R>> {
        AlignmentSlice::new(self, ref_id, offset, size, primary, secondary)
    }

    /// Current position, usable later with [`BamReader::seek`].
    ///
    /// SAM input has no virtual offsets ([`NgsBamError::Unsupported`]).
    pub fn position(&self) -> Result<VirtualOffset> {
        match &self.source {
            Source::Bam(bgzf) => Ok(bgzf.virtual_position()),
            Source::Sam(_) => Err(NgsBamError::Unsupported(
                "virtual offsets on SAM text".to_string(),
            )),
        }
    }

    /// Move to a record start previously obtained from
    /// [`BamReader::position`] or an index.
    ///
    /// Offsets before the first record are [`NgsBamError::InvalidRange`].
    pub fn seek(&mut self, offset: VirtualOffset) -> Result<()> {
        if offset < self.first_record {
            return Err(NgsBamError::InvalidRange(format!(
                "offset {} is before the first record at {}",
                offset, self.first_record
            )));
        }
        self.held = Held::Nothing;
        match &mut self.source {
            Source::Bam(bgzf) => bgzf.seek(offset),
            Source::Sam(_) => Err(NgsBamError::Unsupported("seeking in SAM text".to_string())),
        }
    }

    /// Go back to the first record.
    pub fn rewind(&mut self) -> Result<()> {
        self.seek(self.first_record)
    }

    /// Fraction of the file consumed, in `[0, 1]`.
    pub fn proportional_position(&self) -> f32 {
        if self.file_size == 0 {
            return 0.0;
        }
        let consumed = match &self.source {
            Source::Bam(bgzf) => bgzf.block_offset(),
            Source::Sam(sam) => sam.bytes_consumed(),
        };
        (consumed as f64 / self.file_size as f64).min(1.0) as f32
    }

    /// BGZF blocks inflated so far; `None` for SAM input.
    pub fn blocks_inflated(&self) -> Option<u64> {
        match &self.source {
            Source::Bam(bgzf) => Some(bgzf.blocks_inflated()),
            Source::Sam(_) => None,
        }
    }

    /// Move past the next record, keeping its body for
    /// [`BamReader::parse_held`] and [`BamReader::finish_held`].
    pub(crate) fn advance(&mut self) -> Result<ReadOutcome<()>> {
        self.held = Held::Nothing;
        let held = match &mut self.source {
            Source::Bam(bgzf) => match read_bam_body(bgzf)? {
                Some(Cow::Borrowed(body)) => Held::Block(body.len()),
                Some(Cow::Owned(body)) => Held::Copied(body),
                None => return Ok(ReadOutcome::EndOfData),
            },
            Source::Sam(sam) => match sam.advance(&self.header)? {
                ReadOutcome::Record(()) => Held::Sam,
                ReadOutcome::Empty => return Ok(ReadOutcome::Empty),
                ReadOutcome::EndOfData => return Ok(ReadOutcome::EndOfData),
            },
        };
        self.held = held;
        Ok(ReadOutcome::Record(()))
    }

    /// Parse the held record without giving up ownership of its body.
    pub(crate) fn parse_held(&self) -> Result<RawRecord<'_>> {
        let record = RawRecord::parse(
            Cow::Borrowed(self.held_bytes()),
            self.header.reference_count(),
        )?;
        Ok(record)
    }

    /// Hand out the held record, reusing the work of an earlier
    /// [`BamReader::parse_held`].
    pub(crate) fn finish_held(&mut self, parsed: Parsed) -> RawRecord<'_> {
        RawRecord::from_parsed(self.take_held(), parsed)
    }

    fn held_bytes(&self) -> &[u8] {
        match (&self.held, &self.source) {
            (Held::Block(len), Source::Bam(bgzf)) => bgzf.last_read(*len),
            (Held::Copied(body), _) => body,
            (Held::Sam, Source::Sam(sam)) => sam.body(),
            _ => &[],
        }
    }

    /// Held body: a copied body moves out, the others are borrowed.
    fn take_held(&mut self) -> RecordBytes<'_> {
        if let Held::Copied(body) = &mut self.held {
            return Cow::Owned(std::mem::take(body));
        }
        Cow::Borrowed(self.held_bytes())
    }
}

impl<R> BamReader<R> {
    /// File header.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// True for BGZF (BAM) input, false for SAM text.
    pub fn is_bam(&self) -> bool {
        matches!(self.source, Source::Bam(_))
    }

    /// Reference by id.
    pub fn reference(&self, id: usize) -> Option<&ReferenceSequence> {
        self.header.reference(id)
    }

    /// Reference by name: exact match, then case-insensitive.
    pub fn find_reference(&self, name: &str) -> Option<&ReferenceSequence> {
        self.header.find_reference(name)
    }

    /// Read group by id.
    pub fn read_group(&self, id: &str) -> Option<&ReadGroup> {
        self.header.read_group(id)
    }

    /// Loaded index, if any.
    pub fn index(&self) -> Option<&BaiIndex> {
        self.index.as_ref()
    }

    /// Attach an index.
    ///
    /// Rejected when the reference count differs from the header or the
    /// input is SAM text.
    pub fn set_index(&mut self, index: BaiIndex) -> Result<()> {
        if !self.is_bam() {
            return Err(NgsBamError::Unsupported("indexing SAM text".to_string()));
        }
        if index.reference_count() != self.header.reference_count() {
            return Err(NgsBamError::Format(format!(
                "index has {} references, header declares {}",
                index.reference_count(),
                self.header.reference_count()
            )));
        }
        self.index = Some(index);
        Ok(())
    }

    /// Load and attach a BAI file.
    pub fn load_index<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let index = BaiIndex::from_path(path, Some(self.header.reference_count()))?;
        self.set_index(index)
    }

    /// Load an index, logging (not returning) failures.
    fn try_load_index(&mut self, path: &Path) {
        match self.load_index(path) {
            Ok(()) => info!("loaded index {}", path.display()),
            Err(e) => warn!("ignoring index {}: {}", path.display(), e),
        }
    }

    /// Mapped reads on a reference, from the index summary.
    pub fn alignment_count(&self, ref_id: usize) -> Option<u64> {
        self.index
            .as_ref()?
            .reference(ref_id)?
            .summary()
            .map(|s| s.n_mapped)
    }

    /// Placed unmapped reads on a reference, from the index summary.
    pub fn unmapped_count(&self, ref_id: usize) -> Option<u64> {
        self.index
            .as_ref()?
            .reference(ref_id)?
            .summary()
            .map(|s| s.n_unmapped)
    }

    /// Unmapped reads with no coordinate, from the index.
    pub fn unplaced_count(&self) -> Option<u64> {
        self.index.as_ref()?.n_no_coor()
    }
}

impl BamReader<File> {
    /// Open a file with default options, loading `<path>.bai` when present.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use ngs_bam::io::bam::BamReader;
    ///
    /// # fn main() -> ngs_bam::Result<()> {
    /// let bam = BamReader::from_path("alignments.bam")?;
    /// println!("Opened BAM with {} references", bam.header().reference_count());
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_path_with_options(path, &ReaderOptions::default())
    }

    /// Open a file with explicit options.
    pub fn from_path_with_options<P: AsRef<Path>>(path: P, options: &ReaderOptions) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = Self::with_options(File::open(path)?, options)?;

        if options.index == IndexSource::Sibling && reader.is_bam() {
            let sibling = sibling_index_path(path);
            if sibling.exists() {
                reader.try_load_index(&sibling);
            } else {
                debug!("no index at {}", sibling.display());
            }
        }
        Ok(reader)
    }
}

impl<R: Read + Seek> RecordSource for BamReader<R> {
    fn next_record(&mut self) -> Result<ReadOutcome<RawRecord<'_>>> {
        self.read_raw()
    }
}

/// `<path>.bai`
fn sibling_index_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".bai");
    PathBuf::from(name)
}

/// Read up to `buf.len()` bytes, stopping early only at end of input.
fn read_prefix<R: Read>(inner: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match inner.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Read one length-prefixed record body. `None` at a clean end of data.
fn read_bam_body<R: Read>(bgzf: &mut BgzfReader<R>) -> Result<Option<Cow<'_, [u8]>>> {
    let block_size = match bgzf.read_exactly(4)? {
        Some(bytes) => codec::le_i32(&bytes, 0).unwrap_or_default(),
        None => return Ok(None),
    };
    if block_size < FIXED_LEN as i32 {
        return Err(BamDecodeError::InvalidBlockSize { size: block_size }.into());
    }
    match bgzf.read_exactly(block_size as usize)? {
        Some(body) => Ok(Some(body)),
        None => Err(NgsBamError::Truncated(format!(
            "record of {} bytes has no data",
            block_size
        ))),
    }
}

/// Iterator over decoded records.
///
/// Created by [`BamReader::records()`]. Empty records are skipped with a
/// warning.
pub struct Records<'a, R> {
    reader: &'a mut BamReader<R>,
}

impl<R: Read + Seek> Iterator for Records<'_, R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.reader.read_record() {
                Ok(ReadOutcome::Record(record)) => return Some(Ok(record)),
                Ok(ReadOutcome::Empty) => warn!("skipping empty record"),
                Ok(ReadOutcome::EndOfData) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
