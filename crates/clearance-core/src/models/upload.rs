use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};

/// Progress of the copy-then-delete move from the temporary prefix to the
/// scanned prefix.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "relocation_stage", rename_all = "lowercase")
)]
#[serde(rename_all = "lowercase")]
pub enum RelocationStage {
    /// Object still lives under the temporary prefix only.
    Pending,
    /// Object has been copied to the scanned key; the temporary copy may remain.
    Copied,
    /// `object_key` points at the scanned key and the temporary copy is gone.
    Completed,
}

impl Display for RelocationStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            RelocationStage::Pending => write!(f, "pending"),
            RelocationStage::Copied => write!(f, "copied"),
            RelocationStage::Completed => write!(f, "completed"),
        }
    }
}

/// One successfully assembled upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upload {
    pub upload_id: i64,
    pub file_id: String,
    pub owner_user_id: String,
    pub original_file_name: String,
    pub object_key: String,
    pub uploaded_at: DateTime<Utc>,
    pub virus_detected_at: Option<DateTime<Utc>>,
    pub scan_report_raw: Option<String>,
    pub scanned_at: Option<DateTime<Utc>>,
    pub relocation_stage: RelocationStage,
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for Upload {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Upload {
            upload_id: row.try_get("upload_id")?,
            file_id: row.try_get("file_id")?,
            owner_user_id: row.try_get("owner_user_id")?,
            original_file_name: row.try_get("original_file_name")?,
            object_key: row.try_get("object_key")?,
            uploaded_at: row.try_get("uploaded_at")?,
            virus_detected_at: row.try_get("virus_detected_at")?,
            scan_report_raw: row.try_get("scan_report_raw")?,
            scanned_at: row.try_get("scanned_at")?,
            relocation_stage: row.try_get("relocation_stage")?,
        })
    }
}

impl Upload {
    /// Whether the scan verdict has already been persisted.
    pub fn is_scanned(&self) -> bool {
        self.scanned_at.is_some()
    }

    pub fn is_infected(&self) -> bool {
        self.virus_detected_at.is_some()
    }
}

/// Data handed over by the upload transport once a file is fully assembled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUpload {
    pub file_id: String,
    pub owner_user_id: String,
    pub original_file_name: String,
    pub object_key: String,
}

/// Returns true if `file_id` is safe to use as a local file name and key segment.
pub fn is_valid_file_id(file_id: &str) -> bool {
    !file_id.is_empty()
        && file_id.len() <= 128
        && file_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(name: &str) -> Upload {
        Upload {
            upload_id: 1,
            file_id: "f1".into(),
            owner_user_id: "u1".into(),
            original_file_name: name.into(),
            object_key: "uploads/temp/u1/f1".into(),
            uploaded_at: Utc::now(),
            virus_detected_at: None,
            scan_report_raw: None,
            scanned_at: None,
            relocation_stage: RelocationStage::Pending,
        }
    }

    #[test]
    fn file_id_validation() {
        assert!(is_valid_file_id("3f2a9c_b-01"));
        assert!(!is_valid_file_id(""));
        assert!(!is_valid_file_id("../etc"));
        assert!(!is_valid_file_id("a/b"));
        assert!(!is_valid_file_id(&"x".repeat(129)));
    }

    #[test]
    fn scanned_and_infected_flags() {
        let mut u = upload("a.dcm");
        assert!(!u.is_scanned());
        assert!(!u.is_infected());
        u.scanned_at = Some(Utc::now());
        u.virus_detected_at = Some(Utc::now());
        assert!(u.is_scanned());
        assert!(u.is_infected());
    }
}
