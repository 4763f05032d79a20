use chrono::Utc;

/// RFC3339 timestamp in UTC, used for log correlation and snapshot file
/// fields.
pub fn iso_timestamp_utc() -> String {
    Utc::now().to_rfc3339()
}
