//! Gauge row model and the value types that hang off it
//!
//! A gauge is a physical measurement instrument. Unpaired gauges ("spares")
//! are addressed by manufacturer serial number; once paired into a GO/NO-GO
//! set both members share a system-assigned set code and are addressed by
//! set code plus a single-character member suffix (`SP0007A`, `SP0007B`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use crate::error::{GaugeError, GaugeResult};

/// Calibration workflow state of a gauge.
///
/// `AVAILABLE_FOR_USE` is both the entry state and the state a gauge/set
/// returns to after release; a gauge can sit there indefinitely until an
/// external scheduler flags it `CALIBRATION_DUE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GaugeStatus {
    AvailableForUse,
    CalibrationDue,
    OutForCalibration,
    PendingCertificate,
    PendingRelease,
    Retired,
}

impl GaugeStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            GaugeStatus::AvailableForUse => "AVAILABLE_FOR_USE",
            GaugeStatus::CalibrationDue => "CALIBRATION_DUE",
            GaugeStatus::OutForCalibration => "OUT_FOR_CALIBRATION",
            GaugeStatus::PendingCertificate => "PENDING_CERTIFICATE",
            GaugeStatus::PendingRelease => "PENDING_RELEASE",
            GaugeStatus::Retired => "RETIRED",
        }
    }

    pub fn from_db_str(raw: &str) -> Option<Self> {
        match raw {
            "AVAILABLE_FOR_USE" => Some(GaugeStatus::AvailableForUse),
            "CALIBRATION_DUE" => Some(GaugeStatus::CalibrationDue),
            "OUT_FOR_CALIBRATION" => Some(GaugeStatus::OutForCalibration),
            "PENDING_CERTIFICATE" => Some(GaugeStatus::PendingCertificate),
            "PENDING_RELEASE" => Some(GaugeStatus::PendingRelease),
            "RETIRED" => Some(GaugeStatus::Retired),
            _ => None,
        }
    }

    /// Valid source states for the "send to calibration" transition.
    ///
    /// The due-date scheduler is external, so the engine accepts an early
    /// send from `AvailableForUse` as well as the nominal `CalibrationDue`.
    pub fn can_send_to_calibration(&self) -> bool {
        matches!(
            self,
            GaugeStatus::AvailableForUse | GaugeStatus::CalibrationDue
        )
    }
}

impl std::fmt::Display for GaugeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

/// Compatibility class of a gauge. Immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GaugeCategory {
    ThreadPlug,
    PlainPlug,
}

impl GaugeCategory {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            GaugeCategory::ThreadPlug => "THREAD_PLUG",
            GaugeCategory::PlainPlug => "PLAIN_PLUG",
        }
    }

    pub fn from_db_str(raw: &str) -> Option<Self> {
        match raw {
            "THREAD_PLUG" => Some(GaugeCategory::ThreadPlug),
            "PLAIN_PLUG" => Some(GaugeCategory::PlainPlug),
            _ => None,
        }
    }

    /// Thread gauges carry a manufacturer serial that stays meaningful after
    /// pairing, so identifier resolution tries serial number before set code.
    pub fn requires_dual_identifiers(&self) -> bool {
        matches!(self, GaugeCategory::ThreadPlug)
    }
}

/// Category attributes used to validate pairing compatibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GaugeSpec {
    pub category: GaugeCategory,
    /// e.g. "1/4-20" for thread gauges
    pub thread_size: Option<String>,
    /// e.g. "2A"
    pub thread_class: Option<String>,
}

impl GaugeSpec {
    pub fn thread(size: &str, class: &str) -> Self {
        Self {
            category: GaugeCategory::ThreadPlug,
            thread_size: Some(size.to_string()),
            thread_class: Some(class.to_string()),
        }
    }

    /// Returns the violated rule when two gauges cannot form a set,
    /// or `None` when they are compatible.
    pub fn compatibility_error(&self, other: &GaugeSpec) -> Option<String> {
        if self.category != other.category {
            return Some(format!(
                "category mismatch ({} vs {})",
                self.category.as_db_str(),
                other.category.as_db_str()
            ));
        }
        if self.thread_size != other.thread_size {
            return Some(format!(
                "thread size mismatch ({} vs {})",
                self.thread_size.as_deref().unwrap_or("-"),
                other.thread_size.as_deref().unwrap_or("-")
            ));
        }
        if self.thread_class != other.thread_class {
            return Some(format!(
                "thread class mismatch ({} vs {})",
                self.thread_class.as_deref().unwrap_or("-"),
                other.thread_class.as_deref().unwrap_or("-")
            ));
        }
        None
    }
}

/// Role of a gauge inside a GO/NO-GO set, encoded as the member suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberRole {
    Go,
    NoGo,
}

impl MemberRole {
    pub fn suffix(&self) -> char {
        match self {
            MemberRole::Go => 'A',
            MemberRole::NoGo => 'B',
        }
    }

    pub fn from_suffix(suffix: char) -> Option<Self> {
        match suffix.to_ascii_uppercase() {
            'A' => Some(MemberRole::Go),
            'B' => Some(MemberRole::NoGo),
            _ => None,
        }
    }
}

/// Caller-supplied identifier, resolved explicitly instead of string-sniffed
/// at every call site. Spares resolve by serial; paired gauges by set member
/// code (set code + suffix).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Identifier {
    Serial(String),
    SetMember(String),
}

impl Identifier {
    pub fn raw(&self) -> &str {
        match self {
            Identifier::Serial(s) | Identifier::SetMember(s) => s,
        }
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw())
    }
}

/// Attributes both members of a set adopt at pairing time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedAttributes {
    pub storage_location: Option<String>,
}

/// Data for registering a new spare gauge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewGauge {
    pub serial_number: String,
    pub spec: GaugeSpec,
    pub storage_location: Option<String>,
}

/// One gauge row.
///
/// Pairing invariant: `set_code`, `member_suffix`, and `companion_key` are
/// all set or all null. A half-paired row is data corruption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gauge {
    pub internal_key: Uuid,
    pub serial_number: String,
    pub spec: GaugeSpec,
    pub set_code: Option<String>,
    pub member_suffix: Option<char>,
    pub companion_key: Option<Uuid>,
    pub status: GaugeStatus,
    pub storage_location: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Gauge {
    pub fn is_spare(&self) -> bool {
        self.set_code.is_none() && self.companion_key.is_none()
    }

    pub fn member_role(&self) -> Option<MemberRole> {
        self.member_suffix.and_then(MemberRole::from_suffix)
    }

    /// The identifier shown to operators: set member code once paired,
    /// serial number while a spare.
    pub fn full_identifier(&self) -> String {
        match (&self.set_code, self.member_suffix) {
            (Some(code), Some(suffix)) => format!("{code}{suffix}"),
            _ => self.serial_number.clone(),
        }
    }

    /// Map a database row onto the model. Columns follow
    /// `gauge_store::GAUGE_COLUMNS`.
    pub fn from_row(row: &PgRow) -> GaugeResult<Gauge> {
        let category_raw: String = row.try_get("category")?;
        let category = GaugeCategory::from_db_str(&category_raw).ok_or_else(|| {
            GaugeError::Validation {
                message: format!("unrecognized gauge category '{category_raw}' in store"),
            }
        })?;

        let status_raw: String = row.try_get("status")?;
        let status =
            GaugeStatus::from_db_str(&status_raw).ok_or_else(|| GaugeError::Validation {
                message: format!("unrecognized gauge status '{status_raw}' in store"),
            })?;

        let suffix_raw: Option<String> = row.try_get("member_suffix")?;

        Ok(Gauge {
            internal_key: row.try_get("internal_key")?,
            serial_number: row.try_get("serial_number")?,
            spec: GaugeSpec {
                category,
                thread_size: row.try_get("thread_size")?,
                thread_class: row.try_get("thread_class")?,
            },
            set_code: row.try_get("set_code")?,
            member_suffix: suffix_raw.and_then(|s| s.trim().chars().next()),
            companion_key: row.try_get("companion_key")?,
            status,
            storage_location: row.try_get("storage_location")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}
