mod csv;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use csv::{CsvError, ParsedBatch, Record, parse_csv};

// ---------------------------------------------------------------------------
// Required schema
// ---------------------------------------------------------------------------

pub const FIELD_TRANSACTION_ID: &str = "transactionId";
pub const FIELD_AMOUNT: &str = "amount";
pub const FIELD_FROM_ACCOUNT: &str = "fromAccount";
pub const FIELD_TO_ACCOUNT: &str = "toAccount";
pub const FIELD_PAYMENT_METHOD: &str = "paymentMethod";
pub const FIELD_TIMESTAMP: &str = "timestamp";

/// Columns every payment-instruction batch must carry, in report order.
pub const REQUIRED_FIELDS: [&str; 6] = [
    FIELD_TRANSACTION_ID,
    FIELD_AMOUNT,
    FIELD_FROM_ACCOUNT,
    FIELD_TO_ACCOUNT,
    FIELD_PAYMENT_METHOD,
    FIELD_TIMESTAMP,
];

/// Settlement rails accepted in the `paymentMethod` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentMethod {
    Rtgs,
    Neft,
    Imps,
    Upi,
}

impl PaymentMethod {
    pub const ALL: [PaymentMethod; 4] = [Self::Rtgs, Self::Neft, Self::Imps, Self::Upi];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rtgs => "RTGS",
            Self::Neft => "NEFT",
            Self::Imps => "IMPS",
            Self::Upi => "UPI",
        }
    }

    /// Matches after trimming, ignoring ASCII case.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        Self::ALL
            .into_iter()
            .find(|method| method.as_str().eq_ignore_ascii_case(raw))
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Admitted batch
// ---------------------------------------------------------------------------

/// An admitted, immutable batch file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub batch_id: String,
    pub content_hash: String,
    pub record_count: usize,
    pub storage_path: String,
    pub admitted_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Error taxonomy shared by the ingest and evidence surfaces
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Structural content defect, fixable by the uploader.
    Validation,
    /// Content already admitted; carries the prior digest.
    Duplicate,
    /// Ledger or storage unreachable; retryable by the caller.
    Infrastructure,
    NotFound,
    InvalidPath,
    /// Cheap transport pre-check failed (oversize or non-tabular upload).
    UploadRejected,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "ValidationError",
            Self::Duplicate => "DuplicateError",
            Self::Infrastructure => "InfrastructureError",
            Self::NotFound => "NotFoundError",
            Self::InvalidPath => "InvalidPathError",
            Self::UploadRejected => "UploadRejected",
        }
    }

    pub fn retryable(self) -> bool {
        matches!(self, Self::Infrastructure)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Outcome of the structural gate. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid: bool,
    /// 1-based data row, header excluded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ValidationReport {
    pub fn valid() -> Self {
        Self {
            valid: true,
            row: None,
            field: None,
            reason: None,
        }
    }

    pub fn invalid(row: Option<usize>, field: Option<&str>, reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            row,
            field: field.map(str::to_string),
            reason: Some(reason.into()),
        }
    }

    /// Report for payloads that never made it to record form.
    pub fn malformed(err: &CsvError) -> Self {
        Self::invalid(err.row(), None, format!("malformed CSV: {err}"))
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.valid {
            return f.write_str("valid");
        }
        f.write_str(self.reason.as_deref().unwrap_or("invalid"))
    }
}

/// Runs the structural checks in order, stopping at the first failure:
/// empty file, missing header columns (all listed), then per record in file
/// order blank required values, non-positive `amount`, unknown
/// `paymentMethod`.
pub fn validate_records(headers: &[String], records: &[Record]) -> ValidationReport {
    if records.is_empty() {
        return ValidationReport::invalid(None, None, "file is empty");
    }

    let missing: Vec<&str> = REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|required| !headers.iter().any(|header| header == required))
        .collect();
    if !missing.is_empty() {
        return ValidationReport::invalid(
            None,
            None,
            format!("missing required fields: {}", missing.join(", ")),
        );
    }

    for (index, record) in records.iter().enumerate() {
        let row = index + 1;
        if let Some(report) = validate_record(row, record) {
            return report;
        }
    }
    ValidationReport::valid()
}

pub fn validate_batch(parsed: &ParsedBatch) -> ValidationReport {
    validate_records(&parsed.headers, &parsed.records)
}

fn validate_record(row: usize, record: &Record) -> Option<ValidationReport> {
    for field in REQUIRED_FIELDS {
        let blank = record
            .get(field)
            .is_none_or(|value| value.trim().is_empty());
        if blank {
            return Some(ValidationReport::invalid(
                Some(row),
                Some(field),
                format!("row {row}: required field '{field}' is missing or blank"),
            ));
        }
    }

    let amount = record[FIELD_AMOUNT].trim();
    match amount.parse::<f64>() {
        Ok(value) if value.is_finite() && value > 0.0 => {}
        Ok(_) => {
            return Some(ValidationReport::invalid(
                Some(row),
                Some(FIELD_AMOUNT),
                format!("row {row}: amount must be strictly positive, got '{amount}'"),
            ));
        }
        Err(_) => {
            return Some(ValidationReport::invalid(
                Some(row),
                Some(FIELD_AMOUNT),
                format!("row {row}: amount '{amount}' is not a number"),
            ));
        }
    }

    let method = record[FIELD_PAYMENT_METHOD].trim();
    if PaymentMethod::parse(method).is_none() {
        let allowed: Vec<&str> = PaymentMethod::ALL.iter().map(|m| m.as_str()).collect();
        return Some(ValidationReport::invalid(
            Some(row),
            Some(FIELD_PAYMENT_METHOD),
            format!(
                "row {row}: paymentMethod '{method}' is not one of {}",
                allowed.join(", ")
            ),
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "transactionId,amount,fromAccount,toAccount,paymentMethod,timestamp";

    fn report_for(body: &str) -> ValidationReport {
        let parsed = parse_csv(body.as_bytes()).unwrap();
        validate_batch(&parsed)
    }

    #[test]
    fn accepts_well_formed_batch() {
        let body = format!(
            "{HEADER}\nTX-1,100.50,111,222,NEFT,2024-01-01T10:00:00Z\nTX-2,7,333,444,upi,2024-01-01T11:00:00Z\n"
        );
        assert_eq!(report_for(&body), ValidationReport::valid());
    }

    #[test]
    fn rejects_empty_file_and_header_only_file() {
        assert_eq!(report_for("").reason.as_deref(), Some("file is empty"));
        assert_eq!(
            report_for(&format!("{HEADER}\n")).reason.as_deref(),
            Some("file is empty")
        );
    }

    #[test]
    fn lists_every_missing_header() {
        let report = report_for("transactionId,amount,fromAccount\nTX-1,1,111\n");
        assert!(!report.valid);
        assert_eq!(report.row, None);
        assert_eq!(
            report.reason.as_deref(),
            Some("missing required fields: toAccount, paymentMethod, timestamp")
        );
    }

    #[test]
    fn cites_row_and_field_for_blank_value() {
        let body = format!(
            "{HEADER}\nTX-1,10,111,222,RTGS,2024-01-01\nTX-2,10,111,222,,2024-01-01\n"
        );
        let report = report_for(&body);
        assert!(!report.valid);
        assert_eq!(report.row, Some(2));
        assert_eq!(report.field.as_deref(), Some(FIELD_PAYMENT_METHOD));
    }

    #[test]
    fn short_row_counts_as_missing_value() {
        let body = format!("{HEADER}\nTX-1,10,111,222,RTGS\n");
        let report = report_for(&body);
        assert_eq!(report.row, Some(1));
        assert_eq!(report.field.as_deref(), Some(FIELD_TIMESTAMP));
    }

    #[test]
    fn rejects_non_numeric_and_non_positive_amounts() {
        let body = format!("{HEADER}\nTX-1,abc,111,222,RTGS,t\n");
        assert_eq!(report_for(&body).field.as_deref(), Some(FIELD_AMOUNT));

        let body = format!("{HEADER}\nTX-1,5,111,222,RTGS,t\nTX-2,0,111,222,RTGS,t\n");
        let report = report_for(&body);
        assert_eq!(report.row, Some(2));
        assert_eq!(report.field.as_deref(), Some(FIELD_AMOUNT));

        let body = format!("{HEADER}\nTX-1,-3,111,222,RTGS,t\n");
        assert_eq!(report_for(&body).field.as_deref(), Some(FIELD_AMOUNT));
    }

    #[test]
    fn rejects_unknown_payment_method() {
        let body = format!("{HEADER}\nTX-1,5,111,222,SWIFT,t\n");
        let report = report_for(&body);
        assert_eq!(report.field.as_deref(), Some(FIELD_PAYMENT_METHOD));
        assert!(report.reason.unwrap().contains("RTGS, NEFT, IMPS, UPI"));
    }

    #[test]
    fn reports_first_violation_in_file_order() {
        let body = format!(
            "{HEADER}\nTX-1,5,111,222,SWIFT,t\nTX-2,,111,222,RTGS,t\n"
        );
        let first = report_for(&body);
        assert_eq!(first.row, Some(1));
        assert_eq!(first.field.as_deref(), Some(FIELD_PAYMENT_METHOD));
        assert_eq!(report_for(&body), first);
    }

    #[test]
    fn blank_check_precedes_amount_check_within_a_row() {
        let body = format!("{HEADER}\n,-1,111,222,RTGS,t\n");
        let report = report_for(&body);
        assert_eq!(report.field.as_deref(), Some(FIELD_TRANSACTION_ID));
    }

    #[test]
    fn payment_method_parse_is_trimmed_and_case_insensitive() {
        assert_eq!(PaymentMethod::parse(" imps "), Some(PaymentMethod::Imps));
        assert_eq!(PaymentMethod::parse("Neft"), Some(PaymentMethod::Neft));
        assert_eq!(PaymentMethod::parse("ACH"), None);
    }

    #[test]
    fn malformed_report_carries_csv_reason() {
        let err = parse_csv(b"a,b\n1,2,3\n").unwrap_err();
        let report = ValidationReport::malformed(&err);
        assert!(!report.valid);
        assert_eq!(report.row, Some(1));
        assert!(report.reason.unwrap().starts_with("malformed CSV"));
    }

    #[test]
    fn report_serializes_without_empty_detail() {
        let json = serde_json::to_string(&ValidationReport::valid()).unwrap();
        assert_eq!(json, r#"{"valid":true}"#);
    }
}
