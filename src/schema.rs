use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

/// Cause categories the source's "Type of Disturbance" prose collapses into.
pub const CAUSE_CATEGORIES: &[&str] = &[
    "Weather",
    "Equipment Failure",
    "Fire",
    "Vandalism",
    "Fuel Supply Deficiency",
    "Load Shedding",
    "Operational Error",
    "System Disturbance",
    "Public Appeal",
    "Other",
];

/// NERC reliability regions seen across the two decades of filings,
/// including councils that were later merged or renamed.
pub const NERC_REGIONS: &[&str] = &[
    "ECAR", "ERCOT", "FRCC", "MAAC", "MAIN", "MAPP", "MRO", "NPCC", "RFC", "SERC", "SPP", "TRE",
    "WECC", "WSCC",
];

/// The declared type of a target field. Interpretation requests and
/// validation both consume this, so the two can never disagree about
/// what shape a field takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeDescriptor {
    /// Naive local date + time, no zone (the filings carry none)
    Timestamp,
    Date,
    Time,
    /// Non-negative integer magnitude (customers, megawatts)
    Count,
    /// One value from an enumerated set
    Category(CategorySet),
    /// Free text, kept as-is after trimming
    Text,
}

/// Named category sets, so a descriptor stays `Copy` and a cache
/// fingerprint can name the set without embedding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CategorySet {
    Cause,
    NercRegion,
}

impl CategorySet {
    pub fn values(&self) -> &'static [&'static str] {
        match self {
            CategorySet::Cause => CAUSE_CATEGORIES,
            CategorySet::NercRegion => NERC_REGIONS,
        }
    }
}

impl TypeDescriptor {
    /// Stable name used in cache fingerprints and interpretation requests.
    pub fn fingerprint_label(&self) -> String {
        match self {
            TypeDescriptor::Timestamp => "timestamp".to_string(),
            TypeDescriptor::Date => "date".to_string(),
            TypeDescriptor::Time => "time".to_string(),
            TypeDescriptor::Count => "count".to_string(),
            TypeDescriptor::Category(set) => format!("category:{}", set.values().join("|")),
            TypeDescriptor::Text => "text".to_string(),
        }
    }
}

/// A resolved field value. Every slot of a normalized record is either
/// a conforming typed value or the explicit Unknown marker. Raw source
/// text never appears here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Timestamp(NaiveDateTime),
    Date(NaiveDate),
    Time(NaiveTime),
    Count(u64),
    Category(String),
    Text(String),
    Unknown,
}

impl FieldValue {
    pub fn is_unknown(&self) -> bool {
        matches!(self, FieldValue::Unknown)
    }

    /// CSV cell representation. Unknown renders as an empty cell.
    pub fn render(&self) -> String {
        match self {
            FieldValue::Timestamp(ts) => ts.format("%Y-%m-%dT%H:%M:%S").to_string(),
            FieldValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            FieldValue::Time(t) => t.format("%H:%M:%S").to_string(),
            FieldValue::Count(n) => n.to_string(),
            FieldValue::Category(c) => c.clone(),
            FieldValue::Text(t) => t.clone(),
            FieldValue::Unknown => String::new(),
        }
    }
}

/// Identifier for each target field of the normalized schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldId {
    StartDatetime,
    RestoredDatetime,
    Cause,
    Region,
    AreaAffected,
    UtilityName,
    DemandLossMw,
    CustomersAffected,
}

impl FieldId {
    pub fn name(&self) -> &'static str {
        match self {
            FieldId::StartDatetime => "start_datetime",
            FieldId::RestoredDatetime => "restored_datetime",
            FieldId::Cause => "cause",
            FieldId::Region => "region",
            FieldId::AreaAffected => "area_affected",
            FieldId::UtilityName => "utility_name",
            FieldId::DemandLossMw => "demand_loss_mw",
            FieldId::CustomersAffected => "customers_affected",
        }
    }
}

/// Declarative description of one target field. Components consume this
/// table; adding a field or tightening a constraint happens here only.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub id: FieldId,
    pub descriptor: TypeDescriptor,
    pub required: bool,
    /// Source-column labels this field draws from, in preference order.
    /// Column names drifted across the two decades of filings.
    pub source_labels: &'static [&'static str],
}

/// The target schema: every field of a normalized disturbance record.
pub const SCHEMA: &[FieldSpec] = &[
    FieldSpec {
        id: FieldId::StartDatetime,
        descriptor: TypeDescriptor::Timestamp,
        required: true,
        source_labels: &["Date", "Date of Incident", "Date Event Began"],
    },
    FieldSpec {
        id: FieldId::RestoredDatetime,
        descriptor: TypeDescriptor::Timestamp,
        required: false,
        source_labels: &["Restoration Time", "Time of Restoration", "Date of Restoration"],
    },
    FieldSpec {
        id: FieldId::Cause,
        descriptor: TypeDescriptor::Category(CategorySet::Cause),
        required: true,
        source_labels: &["Type of Disturbance", "Event Type", "Cause"],
    },
    FieldSpec {
        id: FieldId::Region,
        descriptor: TypeDescriptor::Category(CategorySet::NercRegion),
        required: false,
        source_labels: &["NERC Region", "Utility/Power Pool (NERC Council)"],
    },
    FieldSpec {
        id: FieldId::AreaAffected,
        descriptor: TypeDescriptor::Text,
        required: false,
        source_labels: &["Area", "Area Affected", "Geographic Areas"],
    },
    FieldSpec {
        id: FieldId::UtilityName,
        descriptor: TypeDescriptor::Text,
        required: false,
        source_labels: &["Utility/Power Pool (NERC Council)", "Utility", "Entity"],
    },
    FieldSpec {
        id: FieldId::DemandLossMw,
        descriptor: TypeDescriptor::Count,
        required: false,
        source_labels: &["Loss (megawatts)", "Demand Loss (MW)", "Demand Loss"],
    },
    FieldSpec {
        id: FieldId::CustomersAffected,
        descriptor: TypeDescriptor::Count,
        required: true,
        source_labels: &[
            "Number of Customers Affected",
            "Number of Customers Affected 1",
            "Customers Affected",
        ],
    },
];

pub fn field_spec(id: FieldId) -> &'static FieldSpec {
    SCHEMA
        .iter()
        .find(|spec| spec.id == id)
        .expect("every FieldId has a spec entry")
}

/// Timestamps outside this window are implausible for the dataset
/// (filings start in 2000; allow modest slack on both ends).
const PLAUSIBLE_YEARS: std::ops::RangeInclusive<i32> = 1995..=2035;

/// Field-level validation: does `value` conform to `descriptor`?
/// The explicit Unknown marker always conforms; requiredness is a
/// record-level concern handled by the row normalizer.
pub fn validate(descriptor: &TypeDescriptor, value: &FieldValue) -> Result<(), String> {
    match (descriptor, value) {
        (_, FieldValue::Unknown) => Ok(()),
        (TypeDescriptor::Timestamp, FieldValue::Timestamp(ts)) => {
            use chrono::Datelike;
            if PLAUSIBLE_YEARS.contains(&ts.year()) {
                Ok(())
            } else {
                Err(format!("timestamp year {} is implausible", ts.year()))
            }
        }
        (TypeDescriptor::Date, FieldValue::Date(_)) => Ok(()),
        (TypeDescriptor::Time, FieldValue::Time(_)) => Ok(()),
        (TypeDescriptor::Count, FieldValue::Count(_)) => Ok(()),
        (TypeDescriptor::Category(set), FieldValue::Category(v)) => {
            if set.values().iter().any(|allowed| allowed == v) {
                Ok(())
            } else {
                Err(format!("'{}' is not in the allowed set", v))
            }
        }
        (TypeDescriptor::Text, FieldValue::Text(_)) => Ok(()),
        (expected, got) => Err(format!(
            "type mismatch: expected {:?}, got {:?}",
            expected, got
        )),
    }
}
