use std::io::Read;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;

use super::{TransactionRecord, TxKind, TxStatus};
use crate::error::InputError;

const DATE_FORMAT: &str = "%d/%m/%Y %H:%M";

/// One row of the transactions export, before validation.
#[derive(Debug, Deserialize)]
pub struct RawTransaction {
    pub transaction_id: String,
    pub mall_name: String,
    pub branch_name: String,
    pub transaction_date: String,
    pub tax_amount: f64,
    pub transaction_amount: f64,
    pub transaction_type: String,
    pub transaction_status: String,
}

impl TryFrom<RawTransaction> for TransactionRecord {
    type Error = InputError;

    fn try_from(raw: RawTransaction) -> Result<Self, Self::Error> {
        let id = raw.transaction_id.trim().to_string();
        let timestamp = parse_timestamp(&raw.transaction_date).ok_or_else(|| {
            InputError::InvalidTimestamp {
                id: id.clone(),
                raw: raw.transaction_date.clone(),
            }
        })?;
        let kind = match raw.transaction_type.trim().to_ascii_lowercase().as_str() {
            "sale" => TxKind::Sale,
            "refund" => TxKind::Refund,
            _ => {
                return Err(InputError::UnknownVariant {
                    id,
                    field: "transaction_type",
                    value: raw.transaction_type,
                });
            }
        };
        let status = match raw.transaction_status.trim().to_ascii_lowercase().as_str() {
            "completed" => TxStatus::Completed,
            "failed" => TxStatus::Failed,
            _ => {
                return Err(InputError::UnknownVariant {
                    id,
                    field: "transaction_status",
                    value: raw.transaction_status,
                });
            }
        };
        let record = TransactionRecord {
            id,
            branch: raw.branch_name.trim().to_string(),
            mall: raw.mall_name.trim().to_string(),
            timestamp,
            amount: raw.transaction_amount,
            tax_amount: raw.tax_amount,
            kind,
            status,
        };
        record.validate()?;
        Ok(record)
    }
}

/// `dd/mm/YYYY HH:MM` (taken as UTC) or RFC 3339.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, DATE_FORMAT) {
        return Some(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[derive(Debug, Default)]
pub struct IngestReport {
    pub records: Vec<TransactionRecord>,
    pub rejected: usize,
}

pub fn load_csv(path: &Path) -> Result<IngestReport, csv::Error> {
    let reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let report = read_rows(reader);
    tracing::info!(
        path = %path.display(),
        loaded = report.records.len(),
        rejected = report.rejected,
        "Loaded transactions CSV"
    );
    Ok(report)
}

pub fn read_csv<R: Read>(input: R) -> IngestReport {
    let reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(input);
    read_rows(reader)
}

fn read_rows<R: Read>(mut reader: csv::Reader<R>) -> IngestReport {
    let mut report = IngestReport::default();
    for (line, row) in reader.deserialize::<RawTransaction>().enumerate() {
        let raw = match row {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(line = line + 2, "Skipping malformed row: {e}");
                report.rejected += 1;
                continue;
            }
        };
        match TransactionRecord::try_from(raw) {
            Ok(record) => report.records.push(record),
            Err(e) => {
                tracing::warn!(line = line + 2, "Skipping invalid transaction: {e}");
                report.rejected += 1;
            }
        }
    }
    report
}
