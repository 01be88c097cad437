//! Error type for the index engine.
//!
//! Mirrors the teacher crate's hand-rolled style (`impl fmt::Display`, `impl
//! std::error::Error`, `From<io::Error>`) rather than a derive-macro error
//! crate: every variant carries whatever (file, field, value, segment,
//! record) context was available at the point of failure.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure-site context attached to an [`Error`]. Fields are populated with
/// whatever was known at the point of failure; absent fields are omitted
/// from the rendered message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    pub file: Option<String>,
    pub field: Option<String>,
    pub value: Option<Vec<u8>>,
    pub segment: Option<u32>,
    pub record: Option<u64>,
}

impl Context {
    pub fn new() -> Self {
        Context::default()
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_segment(mut self, segment: u32) -> Self {
        self.segment = Some(segment);
        self
    }

    pub fn with_record(mut self, record: u64) -> Self {
        self.record = Some(record);
        self
    }

    fn is_empty(&self) -> bool {
        self.file.is_none()
            && self.field.is_none()
            && self.value.is_none()
            && self.segment.is_none()
            && self.record.is_none()
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        write!(f, " [")?;
        let mut first = true;
        macro_rules! part {
            ($label:expr, $val:expr) => {
                if let Some(v) = $val {
                    if !first {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}={}", $label, v)?;
                    first = false;
                }
            };
        }
        part!("file", &self.file);
        part!("field", &self.field);
        if let Some(v) = &self.value {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "value={:?}", v)?;
            first = false;
        }
        part!("segment", &self.segment);
        part!("record", &self.record);
        let _ = first;
        write!(f, "]")
    }
}

#[derive(Debug)]
pub enum Error {
    /// Calling edit/delete while a database is in deferred-update mode.
    NotImplementedForMode { operation: &'static str, ctx: Context },
    /// `put` in deferred-update mode supplied a record number that is not
    /// the next sequential append.
    CannotReuseRecordNumber { requested: u64, expected: u64, ctx: Context },
    /// On-disk segment size differs from the one requested at open time.
    /// Carries the stored value so the caller can retry with it.
    SegmentSize { stored: u32, ctx: Context },
    /// A bitmap/list payload has an invalid length for the current segment
    /// size.
    CorruptSegment { expected_one_of: &'static str, got: usize, ctx: Context },
    /// An index row references a page-id absent from the segment table.
    MissingSegmentPage { page_id: u64, ctx: Context },
    /// Set-algebra or cursor bind across two different database handles.
    CrossDatabase { ctx: Context },
    /// get/delete/edit of a non-existent record number, or a field that is
    /// not indexed.
    NotFound { ctx: Context },
    /// Underlying KV-store failure; the backend's message is attached
    /// verbatim.
    Backend { message: String, ctx: Context },
    /// Wrapped `std::io::Error`, for backends built on top of real files.
    Io(std::io::Error),
}

impl Error {
    pub fn context(&self) -> Option<&Context> {
        match self {
            Error::NotImplementedForMode { ctx, .. }
            | Error::CannotReuseRecordNumber { ctx, .. }
            | Error::SegmentSize { ctx, .. }
            | Error::CorruptSegment { ctx, .. }
            | Error::MissingSegmentPage { ctx, .. }
            | Error::CrossDatabase { ctx }
            | Error::NotFound { ctx }
            | Error::Backend { ctx, .. } => Some(ctx),
            Error::Io(_) => None,
        }
    }

    pub fn not_found(ctx: Context) -> Self {
        Error::NotFound { ctx }
    }

    pub fn cross_database() -> Self {
        Error::CrossDatabase { ctx: Context::new() }
    }

    pub fn backend(message: impl Into<String>, ctx: Context) -> Self {
        Error::Backend { message: message.into(), ctx }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotImplementedForMode { operation, ctx } => {
                write!(f, "{} is not implemented in deferred-update mode{}", operation, ctx)
            }
            Error::CannotReuseRecordNumber { requested, expected, ctx } => write!(
                f,
                "cannot reuse record number {} in deferred-update mode, expected {}{}",
                requested, expected, ctx
            ),
            Error::SegmentSize { stored, ctx } => {
                write!(f, "database segment size is {}, does not match requested size{}", stored, ctx)
            }
            Error::CorruptSegment { expected_one_of, got, ctx } => write!(
                f,
                "corrupt segment payload: expected length {}, got {}{}",
                expected_one_of, got, ctx
            ),
            Error::MissingSegmentPage { page_id, ctx } => {
                write!(f, "index row references missing segment page {}{}", page_id, ctx)
            }
            Error::CrossDatabase { ctx } => write!(f, "operation spans two different database handles{}", ctx),
            Error::NotFound { ctx } => write!(f, "not found{}", ctx),
            Error::Backend { message, ctx } => write!(f, "backend error: {}{}", message, ctx),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}
