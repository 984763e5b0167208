//! Untrusted-upload inspection: safe ZIP extraction and the DICOM preamble check.

pub mod archive;
pub mod content;

pub use archive::{is_container, ArchiveError, ArchiveLimits, ArchiveValidator};
pub use content::{check_preamble, Preamble};
