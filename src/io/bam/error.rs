//! Record-level decode errors.
//!
//! One alignment record failing to decode aborts that read call; these
//! variants say exactly which part of the record was at fault. They convert
//! into [`crate::NgsBamError::Decode`] and into `io::Error`.

use std::{error, fmt, io};

/// Errors that can occur while decoding one BAM record or SAM line.
///
/// # Example
///
/// ```
/// use ngs_bam::io::bam::error::BamDecodeError;
///
/// fn describe(err: &BamDecodeError) -> String {
///     match err {
///         BamDecodeError::SectionOverflow { section, .. } => format!("bad {section}"),
///         BamDecodeError::InvalidTagType { tag, .. } => {
///             format!("bad tag {}{}", tag[0] as char, tag[1] as char)
///         }
///         other => other.to_string(),
///     }
/// }
/// ```
#[derive(Debug)]
pub enum BamDecodeError {
    /// I/O error occurred during reading
    Io(io::Error),

    /// Declared record size too small to hold the 32-byte fixed fields
    InvalidBlockSize {
        /// The declared block size
        size: i32,
    },

    /// A variable-length section runs past the declared record size
    SectionOverflow {
        /// Which section overflowed ("read name", "cigar", ...)
        section: &'static str,
        /// Offset where the section would end
        end: usize,
        /// Declared record size
        size: usize,
    },

    /// Invalid reference sequence ID (must be -1 or >= 0)
    InvalidReferenceId {
        /// The invalid reference ID value
        value: i32,
        /// Which field had the invalid ID ("read" or "mate")
        field: String,
    },

    /// Missing NUL terminator in string field
    MissingNulTerminator {
        /// Which field was missing the terminator
        field: String,
        /// Offset in the data where error occurred
        offset: usize,
    },

    /// Invalid UTF-8 in string field
    InvalidUtf8 {
        /// Which field had invalid UTF-8
        field: String,
        /// The underlying UTF-8 error
        source: std::str::Utf8Error,
    },

    /// Invalid tag type code
    InvalidTagType {
        /// The tag name
        tag: [u8; 2],
        /// The invalid type code
        type_code: u8,
    },

    /// Invalid array subtype
    InvalidArraySubtype {
        /// The invalid subtype code
        subtype: u8,
    },

    /// CIGAR operation count does not fit the 16-bit field
    CigarCountOverflow {
        /// The count value
        count: usize,
    },

    /// Invalid CIGAR operation code
    InvalidCigarOp {
        /// The invalid operation value
        value: u32,
    },

    /// Negative sequence length (invalid)
    NegativeSequenceLength {
        /// The negative length value
        length: i32,
    },

    /// Insufficient data for parsing
    UnexpectedEof {
        /// What was being parsed
        context: String,
        /// Expected number of bytes
        expected: usize,
        /// Actual number of bytes available
        actual: usize,
    },

    /// Invalid BAM magic bytes
    InvalidMagic {
        /// The actual bytes found
        actual: [u8; 4],
    },

    /// A SAM text column could not be parsed
    SamSyntax {
        /// The column or optional field being parsed
        column: &'static str,
        /// What was wrong with it
        message: String,
    },

    /// A SAM line names a reference absent from the header
    UnresolvedReference {
        /// The unresolved name
        name: String,
    },

    /// Generic invalid data error with context
    InvalidData {
        /// Description of what was invalid
        message: String,
    },
}

impl BamDecodeError {
    pub(crate) fn sam(column: &'static str, message: impl Into<String>) -> Self {
        Self::SamSyntax {
            column,
            message: message.into(),
        }
    }
}

impl error::Error for BamDecodeError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::InvalidUtf8 { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl fmt::Display for BamDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),

            Self::InvalidBlockSize { size } => {
                write!(f, "Invalid record block size: {} (at least 32 bytes required)", size)
            }

            Self::SectionOverflow { section, end, size } => {
                write!(
                    f,
                    "Record {} ends at byte {} beyond the record size {}",
                    section, end, size
                )
            }

            Self::InvalidReferenceId { value, field } => {
                write!(
                    f,
                    "Invalid {} reference ID: {} (must be -1 or >= 0)",
                    field, value
                )
            }

            Self::MissingNulTerminator { field, offset } => {
                write!(f, "Missing NUL terminator in {} at offset {}", field, offset)
            }

            Self::InvalidUtf8 { field, source } => {
                write!(f, "Invalid UTF-8 in {}: {}", field, source)
            }

            Self::InvalidTagType { tag, type_code } => {
                write!(
                    f,
                    "Invalid tag type for {}{}: {:?}",
                    tag[0] as char, tag[1] as char, *type_code as char
                )
            }

            Self::InvalidArraySubtype { subtype } => {
                write!(f, "Invalid array subtype: {:?}", *subtype as char)
            }

            Self::CigarCountOverflow { count } => {
                write!(f, "CIGAR operation count too large: {}", count)
            }

            Self::InvalidCigarOp { value } => {
                write!(f, "Invalid CIGAR operation: {}", value)
            }

            Self::NegativeSequenceLength { length } => {
                write!(f, "Invalid negative sequence length: {}", length)
            }

            Self::UnexpectedEof {
                context,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Unexpected end of data while parsing {}: expected {} bytes, got {}",
                    context, expected, actual
                )
            }

            Self::InvalidMagic { actual } => {
                write!(
                    f,
                    "Invalid BAM magic bytes: expected [BAM\\x01], got {:?}",
                    actual
                )
            }

            Self::SamSyntax { column, message } => {
                write!(f, "Invalid SAM {}: {}", column, message)
            }

            Self::UnresolvedReference { name } => {
                write!(f, "Reference {:?} is not declared in the header", name)
            }

            Self::InvalidData { message } => {
                write!(f, "Invalid data: {}", message)
            }
        }
    }
}

impl From<io::Error> for BamDecodeError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<BamDecodeError> for io::Error {
    fn from(e: BamDecodeError) -> Self {
        match e {
            BamDecodeError::Io(io_err) => io_err,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
