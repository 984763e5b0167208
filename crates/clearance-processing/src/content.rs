//! Minimal content-type precondition for extracted members.
//!
//! DICOM Part 10 files start with a 128-byte preamble followed by the magic `DICM`.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::archive::ArchiveError;

pub const PREAMBLE_LEN: u64 = 128;
pub const DICOM_MAGIC: &[u8; 4] = b"DICM";

/// Outcome of the preamble check for a file long enough to carry one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preamble {
    Dicom,
    /// Long enough, but the magic is absent. Accepted under the tolerant policy.
    Unrecognized,
}

/// Read the four bytes after the preamble.
///
/// Files shorter than the preamble plus magic are rejected outright.
pub fn check_preamble(path: &Path) -> Result<Preamble, ArchiveError> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len < PREAMBLE_LEN + DICOM_MAGIC.len() as u64 {
        return Err(ArchiveError::TooShort {
            path: path.display().to_string(),
            len,
        });
    }

    let mut magic = [0u8; 4];
    file.seek(SeekFrom::Start(PREAMBLE_LEN))?;
    file.read_exact(&mut magic)?;

    if &magic == DICOM_MAGIC {
        Ok(Preamble::Dicom)
    } else {
        Ok(Preamble::Unrecognized)
    }
}
