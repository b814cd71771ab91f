//! Unified result/error type for the core. Supersedes the source's split
//! between a legacy and a current error type (see DESIGN.md).

use std::fmt;

use crate::file::FileId;
use crate::device::SectorId;

/// Stable error identifiers surfaced by the library (spec §6 taxonomy, superset).
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("invalid_prefix")]
    InvalidPrefix,
    #[error("oversized_static_header")]
    OversizedStaticHeader,
    #[error("no_archive_header")]
    NoArchiveHeader,
    #[error("identical_header_version")]
    IdenticalHeaderVersion,
    #[error("tag_mismatch")]
    TagMismatch,
    #[error("invalid_proto")]
    InvalidProto,
    #[error("incompatible_proto")]
    IncompatibleProto,
    #[error("sector_reference_out_of_range")]
    SectorReferenceOutOfRange,
    #[error("corrupt_index_entry")]
    CorruptIndexEntry,
    #[error("index_entry_spanning_blocks")]
    IndexEntrySpanningBlocks,
    #[error("free_sector_index_invalid_size")]
    FreeSectorIndexInvalidSize,
    #[error("unknown_format_version")]
    UnknownFormatVersion,
    #[error("no_such_file")]
    NoSuchFile,
    #[error("wrong_user_prk")]
    WrongUserPrk,
    #[error("vfilesystem_entry_serialization_failed")]
    VfilesystemEntrySerializationFailed,
    #[error("vfilesystem_invalid_size")]
    VfilesystemInvalidSize,
    #[error("resource_exhausted")]
    ResourceExhausted,
    #[error("still_in_use")]
    StillInUse,
    #[error("not_loaded")]
    NotLoaded,
    #[error("result_out_of_range")]
    ResultOutOfRange,
    #[error("io")]
    Io,
}

/// Structured context attached to an error: which file, which sector, where.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorDetail {
    pub file_id: Option<FileId>,
    pub sector_id: Option<SectorId>,
    pub position: Option<u64>,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    detail: Option<ErrorDetail>,
    source: Option<std::io::Error>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error { kind, detail: None, source: None }
    }

    pub fn with_detail(kind: ErrorKind, detail: ErrorDetail) -> Self {
        Error { kind, detail: Some(detail), source: None }
    }

    pub fn io(kind: ErrorKind, source: std::io::Error) -> Self {
        Error { kind, detail: None, source: Some(source) }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn detail(&self) -> Option<&ErrorDetail> {
        self.detail.as_ref()
    }

    pub fn at_sector(mut self, sector: SectorId) -> Self {
        self.detail.get_or_insert_with(ErrorDetail::default).sector_id = Some(sector);
        self
    }

    pub fn at_file(mut self, file: FileId) -> Self {
        self.detail.get_or_insert_with(ErrorDetail::default).file_id = Some(file);
        self
    }

    pub fn at_position(mut self, pos: u64) -> Self {
        self.detail.get_or_insert_with(ErrorDetail::default).position = Some(pos);
        self
    }

    /// Produces a human-readable diagnostic on demand (spec §7 "diagnostic render").
    pub fn render(&self) -> String {
        format!("{}", self)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(detail) = &self.detail {
            if let Some(file_id) = detail.file_id {
                write!(f, " file={}", file_id)?;
            }
            if let Some(sector_id) = detail.sector_id {
                write!(f, " sector={}", sector_id)?;
            }
            if let Some(position) = detail.position {
                write!(f, " position={}", position)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::io(ErrorKind::Io, e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
