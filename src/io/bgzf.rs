//! BGZF (Blocked GNU Zip Format) block reader and writer.
//!
//! A BGZF file is a concatenation of independent gzip members, each carrying
//! a `BC` extra subfield with the member's total size minus one. Every member
//! inflates to at most 64 KiB, which makes any record reachable through a
//! [`VirtualOffset`]: the compressed offset of its block shifted left 16 bits,
//! OR'd with the offset inside the inflated block.
//!
//! # Block Layout
//!
//! ```text
//! ID1=31 ID2=139 CM=8 FLG=4 MTIME[4] XFL OS   (12 bytes incl. XLEN)
//! XLEN[2]
//! extra subfields (XLEN bytes), one of which is SI1='B' SI2='C' SLEN=2 BSIZE[2]
//! CDATA (raw deflate)
//! CRC32[4] ISIZE[4]
//! ```
//!
//! # Reading
//!
//! [`BgzfReader`] keeps exactly one inflated block. Reads that fit inside it
//! are served as borrowed slices; reads that cross a block boundary are
//! assembled into an owned buffer. Seeking inside the active block only
//! moves the cursor.
//!
//! # Writing
//!
//! [`BgzfWriter`] cuts its input into 60 KB blocks, compresses each with
//! deflate and frames it as above. [`BgzfWriter::finish`] appends the
//! standard 28-byte EOF marker.

use crate::error::{NgsBamError, Result};
use crate::io::codec;
use flate2::write::DeflateEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};
use log::debug;
use std::borrow::Cow;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};

/// Maximum inflated size of one BGZF block (64 KiB).
pub const BGZF_BLOCK_MAX: usize = 64 * 1024;

/// Default I/O window over the compressed file (1 MiB).
///
/// Seeks that leave the window refill it from the nearest multiple of this
/// size at or before the target.
pub const IO_BLOCK_SIZE: usize = 1024 * 1024;

/// Uncompressed bytes per block produced by [`BgzfWriter`].
const BGZF_WRITE_BLOCK_SIZE: usize = 60 * 1024;

/// Fixed gzip header bytes preceding the extra field (including XLEN).
const GZIP_HEADER_LEN: usize = 12;

/// The standard empty block that terminates a BGZF file.
pub const BGZF_EOF: [u8; 28] = [
    31, 139, 8, 4, 0, 0, 0, 0, 0, 255, // Header (10 bytes)
    6, 0, 66, 67, 2, 0, 27, 0, // Extra field with BSIZE=27 (8 bytes)
    3, 0, // Empty deflate block (2 bytes)
    0, 0, 0, 0, // CRC32 (4 bytes)
    0, 0, 0, 0, // ISIZE=0 (4 bytes)
];

/// Virtual file offset into a BGZF stream.
///
/// - **Compressed offset** (high 48 bits): start of the block in the file
/// - **Uncompressed offset** (low 16 bits): position inside the inflated block
///
/// Ordering follows the raw 64-bit value, which matches file order.
///
/// ```
/// # use ngs_bam::io::bgzf::VirtualOffset;
/// let offset = VirtualOffset::new(1024, 512);
/// assert_eq!(offset.compressed_offset(), 1024);
/// assert_eq!(offset.uncompressed_offset(), 512);
/// assert_eq!(offset.as_raw(), (1024 << 16) | 512);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtualOffset(u64);

impl VirtualOffset {
    /// Create a new virtual offset from compressed and uncompressed components.
    pub fn new(compressed: u64, uncompressed: u16) -> Self {
        VirtualOffset((compressed << 16) | u64::from(uncompressed))
    }

    /// Create from raw 64-bit value.
    pub fn from_raw(value: u64) -> Self {
        VirtualOffset(value)
    }

    /// Get raw 64-bit value.
    pub fn as_raw(self) -> u64 {
        self.0
    }

    /// Get compressed file offset (high 48 bits).
    pub fn compressed_offset(self) -> u64 {
        self.0 >> 16
    }

    /// Get uncompressed offset within block (low 16 bits).
    pub fn uncompressed_offset(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
}

impl From<u64> for VirtualOffset {
    fn from(value: u64) -> Self {
        Self::from_raw(value)
    }
}

impl fmt::Display for VirtualOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.compressed_offset(), self.uncompressed_offset())
    }
}

/// Seekable BGZF decompressor.
///
/// Holds one inflated block (at most [`BGZF_BLOCK_MAX`] bytes) and a
/// buffered window over the compressed input.
pub struct BgzfReader<R> {
    inner: BufReader<R>,
    /// Compressed offset of the next byte `inner` will yield.
    inner_pos: u64,
    io_block: usize,
    /// Inflated contents of the active block.
    block: Vec<u8>,
    block_pos: usize,
    /// Compressed offset of the active block.
    block_offset: u64,
    /// Compressed offset of the block after the active one.
    next_block_offset: u64,
    /// Scratch for the compressed member body.
    compressed: Vec<u8>,
    inflater: Decompress,
    blocks_inflated: u64,
}

impl<R: Read> BgzfReader<R> {
    /// Open a BGZF stream positioned at its first block.
    ///
    /// The first block is inflated immediately so that a non-BGZF input is
    /// reported here as [`NgsBamError::NotBgzf`]; callers use that to fall
    /// back to plain text.
    pub fn new(inner: R) -> Result<Self> {
        Self::with_capacity(IO_BLOCK_SIZE, inner)
    }

    /// Open with a custom I/O window size.
    pub fn with_capacity(capacity: usize, inner: R) -> Result<Self> {
        let io_block = capacity.max(GZIP_HEADER_LEN);
        let mut reader = Self {
            inner: BufReader::with_capacity(io_block, inner),
            inner_pos: 0,
            io_block,
            block: Vec::with_capacity(BGZF_BLOCK_MAX),
            block_pos: 0,
            block_offset: 0,
            next_block_offset: 0,
            compressed: Vec::with_capacity(BGZF_BLOCK_MAX),
            inflater: Decompress::new(false),
            blocks_inflated: 0,
        };

        if !reader.read_block()? {
            return Err(NgsBamError::NotBgzf("empty input".to_string()));
        }
        Ok(reader)
    }

    /// Current position, usable later with [`BgzfReader::seek`].
    ///
    /// An exhausted block reports the start of the following block.
    pub fn virtual_position(&self) -> VirtualOffset {
        if self.block_pos < self.block.len() {
            VirtualOffset::new(self.block_offset, self.block_pos as u16)
        } else {
            VirtualOffset::new(self.next_block_offset, 0)
        }
    }

    /// Compressed offset of the active block.
    pub fn block_offset(&self) -> u64 {
        self.block_offset
    }

    /// Blocks inflated since the reader was created, including re-reads
    /// after a seek.
    pub fn blocks_inflated(&self) -> u64 {
        self.blocks_inflated
    }

    /// The last `n` bytes consumed from the active block; empty when fewer
    /// than `n` were read from it.
    pub(crate) fn last_read(&self, n: usize) -> &[u8] {
        self.block_pos
            .checked_sub(n)
            .and_then(|start| self.block.get(start..self.block_pos))
            .unwrap_or(&[])
    }

    /// Read exactly `n` bytes.
    ///
    /// Returns `Ok(None)` on a clean end of data (no bytes available at
    /// all), a borrowed slice when the bytes lie inside the active block and
    /// an owned copy when they straddle a block boundary. End of data after
    /// a partial read is [`NgsBamError::Truncated`].
    pub fn read_exactly(&mut self, n: usize) -> Result<Option<Cow<'_, [u8]>>> {
        if !self.ensure_data()? {
            if n == 0 {
                return Ok(Some(Cow::Borrowed(&[])));
            }
            return Ok(None);
        }

        let available = self.block.len() - self.block_pos;
        if n <= available {
            let start = self.block_pos;
            self.block_pos += n;
            return Ok(Some(Cow::Borrowed(&self.block[start..start + n])));
        }

        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            if !self.ensure_data()? {
                return Err(NgsBamError::Truncated(format!(
                    "needed {} bytes, stream ended after {}",
                    n,
                    out.len()
                )));
            }
            let take = (n - out.len()).min(self.block.len() - self.block_pos);
            out.extend_from_slice(&self.block[self.block_pos..self.block_pos + take]);
            self.block_pos += take;
        }
        Ok(Some(Cow::Owned(out)))
    }

    /// Consume the reader, returning the underlying input.
    ///
    /// The input is left at an unspecified position.
    pub fn into_inner(self) -> R {
        self.inner.into_inner()
    }

    /// Make sure the active block has unread bytes, inflating as many
    /// blocks as needed (empty blocks are skipped). `false` at end of data.
    fn ensure_data(&mut self) -> Result<bool> {
        while self.block_pos >= self.block.len() {
            if !self.read_block()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Fill `buf` from the compressed input, stopping early only at EOF.
    fn read_input(&mut self, len: usize, context: &str) -> Result<usize> {
        self.compressed.resize(len, 0);
        let mut filled = 0;
        while filled < len {
            match self.inner.read(&mut self.compressed[filled..len]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(NgsBamError::Io(e)),
            }
        }
        self.inner_pos += filled as u64;
        if filled != 0 && filled < len {
            return Err(NgsBamError::Truncated(format!(
                "{} at offset {}: expected {} bytes, got {}",
                context, self.next_block_offset, len, filled
            )));
        }
        Ok(filled)
    }

    /// Inflate the block at `next_block_offset`. Returns `false` when the
    /// input holds zero bytes there (clean EOF).
    fn read_block(&mut self) -> Result<bool> {
        if self.read_input(GZIP_HEADER_LEN, "BGZF header")? == 0 {
            self.block.clear();
            self.block_pos = 0;
            self.block_offset = self.next_block_offset;
            return Ok(false);
        }

        let header = &self.compressed[..GZIP_HEADER_LEN];
        if header[0] != 31 || header[1] != 139 || header[2] != 8 {
            return Err(NgsBamError::NotBgzf(format!(
                "invalid gzip magic at offset {}: [{}, {}, {}]",
                self.next_block_offset, header[0], header[1], header[2]
            )));
        }
        if header[3] & 0x04 == 0 {
            return Err(NgsBamError::NotBgzf(format!(
                "gzip member at offset {} has no extra field",
                self.next_block_offset
            )));
        }
        let xlen = usize::from(codec::le_u16(header, 10).unwrap_or(0));

        if self.read_input(xlen, "BGZF extra field")? < xlen {
            return Err(NgsBamError::Truncated(format!(
                "BGZF extra field at offset {}",
                self.next_block_offset
            )));
        }
        let bsize = find_block_size(&self.compressed[..xlen]).ok_or_else(|| {
            NgsBamError::NotBgzf(format!(
                "gzip member at offset {} lacks the BC subfield",
                self.next_block_offset
            ))
        })?;

        let consumed = GZIP_HEADER_LEN + xlen;
        if bsize < consumed + 8 {
            return Err(NgsBamError::Format(format!(
                "BGZF block size {} at offset {} is smaller than its header ({} bytes)",
                bsize,
                self.next_block_offset,
                consumed + 8
            )));
        }
        let body_len = bsize - consumed;
        if self.read_input(body_len, "BGZF block body")? < body_len {
            return Err(NgsBamError::Truncated(format!(
                "BGZF block at offset {}",
                self.next_block_offset
            )));
        }

        let cdata_len = body_len - 8;
        let crc = codec::le_u32(&self.compressed, cdata_len).unwrap_or(0);
        let isize = codec::le_u32(&self.compressed, cdata_len + 4).unwrap_or(0) as usize;
        if isize > BGZF_BLOCK_MAX {
            return Err(NgsBamError::Format(format!(
                "BGZF block at offset {} inflates to {} bytes (max {})",
                self.next_block_offset, isize, BGZF_BLOCK_MAX
            )));
        }

        self.block.clear();
        self.block.reserve(isize + 1);
        self.inflater.reset(false);
        let status = self
            .inflater
            .decompress_vec(
                &self.compressed[..cdata_len],
                &mut self.block,
                FlushDecompress::Finish,
            )
            .map_err(|e| {
                NgsBamError::Compression(format!(
                    "inflate failed for block at offset {}: {}",
                    self.next_block_offset, e
                ))
            })?;

        if status != Status::StreamEnd || self.inflater.total_in() as usize != cdata_len {
            return Err(NgsBamError::Format(format!(
                "BGZF block at offset {}: declared size {} does not match the deflate stream",
                self.next_block_offset, bsize
            )));
        }
        if self.block.len() != isize {
            return Err(NgsBamError::Format(format!(
                "BGZF block at offset {}: ISIZE {} but inflated {} bytes",
                self.next_block_offset,
                isize,
                self.block.len()
            )));
        }
        if crc32fast::hash(&self.block) != crc {
            return Err(NgsBamError::Format(format!(
                "BGZF block at offset {}: CRC32 mismatch",
                self.next_block_offset
            )));
        }

        self.block_offset = self.next_block_offset;
        self.next_block_offset += bsize as u64;
        self.block_pos = 0;
        self.blocks_inflated += 1;
        Ok(true)
    }
}

impl<R: Read + Seek> BgzfReader<R> {
    /// Move to `offset`.
    ///
    /// Seeking inside the active block only moves the cursor. Otherwise the
    /// target block is read and inflated; an in-block offset beyond the
    /// block's contents is [`NgsBamError::InvalidRange`].
    pub fn seek(&mut self, offset: VirtualOffset) -> Result<()> {
        let coffset = offset.compressed_offset();
        let uoffset = usize::from(offset.uncompressed_offset());

        if coffset == self.block_offset && !self.block.is_empty() && uoffset <= self.block.len() {
            self.block_pos = uoffset;
            return Ok(());
        }

        self.seek_compressed(coffset)?;
        self.block.clear();
        self.block_pos = 0;
        self.block_offset = coffset;
        self.next_block_offset = coffset;

        if uoffset > 0 {
            if !self.read_block()? {
                return Err(NgsBamError::InvalidRange(format!(
                    "virtual offset {} is past the end of the file",
                    offset
                )));
            }
            if uoffset > self.block.len() {
                return Err(NgsBamError::InvalidRange(format!(
                    "virtual offset {} is past the end of its block ({} bytes)",
                    offset,
                    self.block.len()
                )));
            }
            self.block_pos = uoffset;
        }
        Ok(())
    }

    /// Position the compressed input at `target`, reusing the buffered
    /// window when the target lies ahead inside it.
    fn seek_compressed(&mut self, target: u64) -> Result<()> {
        if target >= self.inner_pos {
            let delta = target - self.inner_pos;
            if delta <= self.inner.buffer().len() as u64 {
                self.inner.consume(delta as usize);
                self.inner_pos = target;
                return Ok(());
            }
        }

        let aligned = target - target % self.io_block as u64;
        debug!("BGZF refill at {} for target {}", aligned, target);
        self.inner.seek(SeekFrom::Start(aligned))?;
        let mut skip = (target - aligned) as usize;
        while skip > 0 {
            let available = self.inner.fill_buf()?.len();
            if available == 0 {
                return Err(NgsBamError::InvalidRange(format!(
                    "compressed offset {} is past the end of the file",
                    target
                )));
            }
            let n = available.min(skip);
            self.inner.consume(n);
            skip -= n;
        }
        self.inner_pos = target;
        Ok(())
    }
}

impl<R: Read> Read for BgzfReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || !self.ensure_data()? {
            return Ok(0);
        }
        let n = buf.len().min(self.block.len() - self.block_pos);
        buf[..n].copy_from_slice(&self.block[self.block_pos..self.block_pos + n]);
        self.block_pos += n;
        Ok(n)
    }
}

/// Locate the `BC` subfield and return the total member size (BSIZE + 1).
fn find_block_size(extra: &[u8]) -> Option<usize> {
    let mut pos = 0;
    while pos + 4 <= extra.len() {
        let si1 = extra[pos];
        let si2 = extra[pos + 1];
        let slen = usize::from(codec::le_u16(extra, pos + 2)?);

        if si1 == b'B' && si2 == b'C' && slen == 2 {
            return codec::le_u16(extra, pos + 4).map(|bs| usize::from(bs) + 1);
        }
        pos += 4 + slen;
    }
    None
}

/// Sequential BGZF writer.
///
/// Tracks its own [`VirtualOffset`] so index builders can record where each
/// record starts.
pub struct BgzfWriter<W: Write> {
    writer: W,
    current_block: Vec<u8>,
    /// Compressed bytes emitted so far.
    compressed_offset: u64,
}

impl<W: Write> BgzfWriter<W> {
    /// Create a new BGZF writer.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            current_block: Vec::with_capacity(BGZF_WRITE_BLOCK_SIZE),
            compressed_offset: 0,
        }
    }

    /// Position the next written byte will occupy.
    pub fn virtual_position(&self) -> VirtualOffset {
        VirtualOffset::new(self.compressed_offset, self.current_block.len() as u16)
    }

    /// Compress and emit the pending data as one block, even if short.
    ///
    /// Does nothing when no data is pending.
    pub fn flush_block(&mut self) -> io::Result<()> {
        if self.current_block.is_empty() {
            return Ok(());
        }
        let block = compress_block(&self.current_block)?;
        self.writer.write_all(&block)?;
        self.compressed_offset += block.len() as u64;
        self.current_block.clear();
        Ok(())
    }

    /// Flush remaining data, append the EOF marker and return the sink.
    pub fn finish(mut self) -> io::Result<W> {
        self.flush_block()?;
        self.writer.write_all(&BGZF_EOF)?;
        self.writer.flush()?;
        Ok(self.writer)
    }
}

impl<W: Write> Write for BgzfWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut remaining = buf;

        while !remaining.is_empty() {
            let space_in_block = BGZF_WRITE_BLOCK_SIZE - self.current_block.len();
            let to_copy = remaining.len().min(space_in_block);

            self.current_block.extend_from_slice(&remaining[..to_copy]);
            remaining = &remaining[to_copy..];

            if self.current_block.len() >= BGZF_WRITE_BLOCK_SIZE {
                self.flush_block()?;
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_block()?;
        self.writer.flush()
    }
}

/// Compress a single block to BGZF format.
///
/// Header: ID1=31 ID2=139 CM=8 FLG=4 MTIME=0 XFL=0 OS=255 XLEN=6, then the
/// `BC` subfield whose BSIZE is patched once the total size is known.
pub fn compress_block(data: &[u8]) -> io::Result<Vec<u8>> {
    if data.len() > BGZF_BLOCK_MAX {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("BGZF block payload too large: {} bytes", data.len()),
        ));
    }

    let mut deflate = DeflateEncoder::new(Vec::new(), Compression::default());
    deflate.write_all(data)?;
    let deflated = deflate.finish()?;

    let mut block = Vec::with_capacity(deflated.len() + 26);
    block.extend_from_slice(&[31, 139, 8, 4, 0, 0, 0, 0, 0, 255]);
    block.extend_from_slice(&6u16.to_le_bytes()); // XLEN=6
    block.push(b'B');
    block.push(b'C');
    block.extend_from_slice(&2u16.to_le_bytes()); // SLEN=2
    let bsize_pos = block.len();
    block.extend_from_slice(&0u16.to_le_bytes()); // BSIZE placeholder

    block.extend_from_slice(&deflated);
    block.extend_from_slice(&crc32fast::hash(data).to_le_bytes());
    block.extend_from_slice(&(data.len() as u32).to_le_bytes());

    let total_size = block.len();
    if total_size > BGZF_BLOCK_MAX {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("compressed BGZF block too large: {} bytes", total_size),
        ));
    }
    let bsize = (total_size - 1) as u16;
    block[bsize_pos..bsize_pos + 2].copy_from_slice(&bsize.to_le_bytes());

    Ok(block)
}
