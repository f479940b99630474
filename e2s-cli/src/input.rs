//! Source roster, payroll roster and denylist loading.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use e2s_core::{
    AccountStatus, Denylist, DriverSource, EmploymentStatus, RowAction, SourceCoordinates,
    SourceRecord, TagId,
};

/// Columns every roster must carry. `Action` is optional (delta rosters).
pub const REQUIRED_COLUMNS: [&str; 9] = [
    "Customer ID",
    "Customer Name",
    "Account Status",
    "Latitude",
    "Longitude",
    "Report Company Address",
    "Location",
    "Company",
    "Customer Type",
];

#[derive(Debug, Deserialize)]
struct RosterRow {
    #[serde(rename = "Customer ID")]
    customer_id: String,
    #[serde(rename = "Customer Name")]
    customer_name: String,
    #[serde(rename = "Account Status")]
    account_status: String,
    #[serde(rename = "Latitude")]
    latitude: String,
    #[serde(rename = "Longitude")]
    longitude: String,
    #[serde(rename = "Report Company Address")]
    address: String,
    #[serde(rename = "Location")]
    location: String,
    #[serde(rename = "Company")]
    company: String,
    #[serde(rename = "Customer Type")]
    customer_type: String,
    #[serde(rename = "Action", default)]
    action: String,
}

impl From<RosterRow> for SourceRecord {
    fn from(row: RosterRow) -> Self {
        let mut record = SourceRecord::new(row.customer_id, row.customer_name);
        record.address = row.address;
        record.coordinates = SourceCoordinates::parse(&row.latitude, &row.longitude);
        record.status = AccountStatus::parse(&row.account_status);
        record.location = row.location;
        record.company = row.company;
        record.record_type = Some(row.customer_type).filter(|t| !t.is_empty());
        record.action = RowAction::parse(&row.action);
        record
    }
}

/// Reads an Encompass customer export. Headers and fields are trimmed; a
/// missing required column fails the whole file.
pub fn read_roster_at(path: &Path) -> Result<Vec<SourceRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("failed to open roster {}", path.display()))?;

    let headers = reader
        .headers()
        .with_context(|| format!("failed to read header of {}", path.display()))?
        .clone();
    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|col| !headers.iter().any(|h| h == *col))
        .collect();
    if !missing.is_empty() {
        bail!(
            "{} is missing required column(s): {}",
            path.display(),
            missing.join(", ")
        );
    }

    let mut records = Vec::new();
    for (index, row) in reader.deserialize::<RosterRow>().enumerate() {
        let row = row.with_context(|| {
            format!("failed to parse row {} of {}", index + 2, path.display())
        })?;
        records.push(SourceRecord::from(row));
    }
    tracing::info!("read {} roster rows from {}", records.len(), path.display());
    Ok(records)
}

/// Number of rows per trimmed source id, for ids seen more than once.
pub fn duplicate_ids(records: &[SourceRecord]) -> BTreeMap<String, usize> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for record in records {
        let id = record.id.0.trim();
        if !id.is_empty() {
            *counts.entry(id.to_owned()).or_default() += 1;
        }
    }
    counts.retain(|_, n| *n > 1);
    counts
}

// ---------------------------------------------------------------------------
// Payroll
// ---------------------------------------------------------------------------

const CODE_COLUMNS: [&str; 3] = ["employee_code", "employeecode", "employee_id"];
const FIRST_NAME_COLUMNS: [&str; 2] = ["first_name", "legal_first_name"];
const LAST_NAME_COLUMNS: [&str; 2] = ["last_name", "legal_last_name"];
const STATUS_COLUMNS: [&str; 3] = ["employment_status", "status", "employee_status"];
const PHONE_COLUMNS: [&str; 5] = [
    "mobile_phone",
    "cell_phone",
    "work_phone",
    "primary_phone",
    "phone",
];
const USERNAME_COLUMNS: [&str; 2] = ["samsara_username", "username"];
const TIME_ZONE_COLUMNS: [&str; 2] = ["time_zone", "timezone"];
const TAG_COLUMNS: [&str; 2] = ["tag_ids", "tags"];

/// `Employee Code` → `employee_code`.
fn header_key(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

struct PayrollColumns {
    headers: Vec<String>,
}

impl PayrollColumns {
    /// Position of the first candidate column present in the header.
    fn find(&self, candidates: &[&str]) -> Option<usize> {
        candidates
            .iter()
            .find_map(|c| self.headers.iter().position(|h| h == c))
    }

    /// First non-blank value among the candidate columns.
    fn value(&self, record: &csv::StringRecord, candidates: &[&str]) -> String {
        candidates
            .iter()
            .filter_map(|c| self.headers.iter().position(|h| h == c))
            .filter_map(|i| record.get(i))
            .map(str::trim)
            .find(|v| !v.is_empty())
            .unwrap_or_default()
            .to_owned()
    }
}

/// Reads a Paycom payroll export. Header spelling is loose (`Employee Code`,
/// `employee_code` and `EmployeeCode` all match); an employee code column
/// and at least one name column are required.
pub fn read_payroll_at(path: &Path) -> Result<Vec<DriverSource>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("failed to open payroll {}", path.display()))?;
    let columns = PayrollColumns {
        headers: reader
            .headers()
            .with_context(|| format!("failed to read header of {}", path.display()))?
            .iter()
            .map(header_key)
            .collect(),
    };
    if columns.find(&CODE_COLUMNS).is_none() {
        bail!("{} has no employee code column", path.display());
    }
    if columns.find(&FIRST_NAME_COLUMNS).is_none() && columns.find(&LAST_NAME_COLUMNS).is_none() {
        bail!("{} has no first or last name column", path.display());
    }

    let mut drivers = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record.with_context(|| {
            format!("failed to parse row {} of {}", index + 2, path.display())
        })?;
        let mut driver = DriverSource::new(
            columns.value(&record, &CODE_COLUMNS),
            &columns.value(&record, &FIRST_NAME_COLUMNS),
            &columns.value(&record, &LAST_NAME_COLUMNS),
        );
        driver.username = Some(columns.value(&record, &USERNAME_COLUMNS)).filter(|u| !u.is_empty());
        driver.phone = columns.value(&record, &PHONE_COLUMNS);
        driver.time_zone = Some(columns.value(&record, &TIME_ZONE_COLUMNS)).filter(|t| !t.is_empty());
        driver.tag_ids = columns
            .value(&record, &TAG_COLUMNS)
            .split([',', ';', '|'])
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(TagId::from)
            .collect();
        driver.status = Some(EmploymentStatus::classify(
            &columns.value(&record, &STATUS_COLUMNS),
        ));
        drivers.push(driver);
    }
    tracing::info!("read {} payroll rows from {}", drivers.len(), path.display());
    Ok(drivers)
}

// ---------------------------------------------------------------------------
// Denylist
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct WarehouseRow {
    #[serde(default)]
    samsara_id: Option<serde_yaml::Value>,
    #[serde(default)]
    name: Option<serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WarehouseFile {
    List(Vec<WarehouseRow>),
    Wrapped {
        #[serde(default)]
        warehouses: Vec<WarehouseRow>,
    },
}

fn scalar(value: Option<&serde_yaml::Value>) -> String {
    match value {
        Some(serde_yaml::Value::String(s)) => s.clone(),
        Some(serde_yaml::Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

/// Reads the warehouse denylist: YAML (`.yaml`/`.yml`) as a list of
/// `{samsara_id, name}` or a mapping with a `warehouses` list; anything else
/// as CSV with `samsara_id,name` headers.
pub fn read_denylist_at(path: &Path) -> Result<Denylist> {
    let is_yaml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));

    let rows: Vec<(String, String)> = if is_yaml {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if text.trim().is_empty() {
            Vec::new()
        } else {
            let file: WarehouseFile = serde_yaml::from_str(&text)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            let rows = match file {
                WarehouseFile::List(rows) => rows,
                WarehouseFile::Wrapped { warehouses } => warehouses,
            };
            rows.iter()
                .map(|r| (scalar(r.samsara_id.as_ref()), scalar(r.name.as_ref())))
                .collect()
        }
    } else {
        #[derive(Deserialize)]
        struct CsvRow {
            #[serde(default)]
            samsara_id: String,
            #[serde(default)]
            name: String,
        }
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mut rows = Vec::new();
        for row in reader.deserialize::<CsvRow>() {
            let row = row.with_context(|| format!("failed to parse {}", path.display()))?;
            rows.push((row.samsara_id, row.name));
        }
        rows
    };

    let mut denylist = Denylist::new();
    for (id, name) in rows {
        denylist.add_id(&id);
        denylist.add_name(&name);
    }
    tracing::info!("loaded {} denylist entries from {}", denylist.len(), path.display());
    Ok(denylist)
}
